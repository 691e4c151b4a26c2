/*!
# Alpha to beta conversion

Fits the complex Zernike expansion ("beta") of the pupil function `exp(i·W)` where `W` is given
by real Zernike coefficients ("alpha").

The pupil is divided into `K` radial and `L` angular bins. The projection of every complex
Zernike polynomial onto each bin is integrated analytically in the matrix `A` `[K·L x c]`
while the pupil function is evaluated at the bin centers in the vector `P` `[K·L]`, then
```text
beta = Aᵀ·P
```
*/

use std::f64::consts::{PI, TAU};

use nalgebra::{DMatrix, DVector};
use num::complex::Complex64;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::zernike::{
    num_coefficients, single2double_noll, ComplexZernikeCoefficients, ZernikeCoefficients,
    MAX_DEGREES,
};

/// Pupil sampling strategy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumIter, EnumString, Display,
)]
#[strum(ascii_case_insensitive)]
pub enum SamplingMethod {
    #[default]
    Linear,
    SquareRoot,
    Cosine,
}
impl SamplingMethod {
    /// `n` samples in `[min,max]`, offset by `offset` bin
    pub fn sample(&self, n: usize, min: f64, max: f64, offset: f64) -> Vec<f64> {
        let n_f = n as f64;
        (0..n)
            .map(|v| {
                let v = v as f64 + offset;
                let u = match self {
                    SamplingMethod::Linear => v / n_f,
                    SamplingMethod::SquareRoot => (v / n_f).sqrt(),
                    SamplingMethod::Cosine => (PI * (n_f - v) / (2. * n_f)).cos(),
                };
                min + (max - min) * u
            })
            .collect()
    }
}

/// Coefficients of the radial polynomial `R_n^|m|` in increasing powers of `ρ`
pub fn radial_polynomial(n: i32, m: i32) -> Vec<f64> {
    let (n, m) = (n as usize, m.unsigned_abs() as usize);
    let mut coefficients = vec![0f64; n + 1];
    for s in 0..=(n - m) / 2 {
        let sign = if s % 2 == 0 { 1. } else { -1. };
        coefficients[n - 2 * s] = sign * binomial(n - s, s) * binomial(n - 2 * s, (n - m) / 2 - s);
    }
    coefficients
}
/// Coefficients of the antiderivative of `ρ·R_n^|m|`
fn radial_antiderivative(radial: &[f64]) -> Vec<f64> {
    let mut coefficients = vec![0f64; radial.len() + 2];
    for (i, c) in radial.iter().enumerate() {
        coefficients[i + 2] = c / (i + 2) as f64;
    }
    coefficients
}
fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1f64, |b, i| b * (n - i) as f64 / (i + 1) as f64)
}
/// Evaluates a polynomial given by its coefficients in increasing powers
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0f64, |p, c| p * x + c)
}

/// Alpha to beta converter
///
/// The projection matrix depends only on the pupil sampling and on the beta degree,
/// it is built once and shared by every conversion.
#[derive(Debug, Clone)]
pub struct AlphaToBeta {
    beta_degrees: usize,
    /// complex basis projection `[K·L x numBeta]`
    a: DMatrix<Complex64>,
    /// real basis at the bin centers `[K·L x numAlpha]`
    zz: DMatrix<f64>,
}
impl AlphaToBeta {
    /// Creates a converter for beta coefficients up to the radial degree `beta_degrees`
    ///
    /// # Parameters
    /// - `l_sampling`, `l`: angular sampling and number of angular bins
    /// - `k_sampling`, `k`: radial sampling and number of radial bins
    pub fn new(
        beta_degrees: usize,
        l_sampling: SamplingMethod,
        l: usize,
        k_sampling: SamplingMethod,
        k: usize,
    ) -> Self {
        let num_alpha = num_coefficients(MAX_DEGREES);
        let num_beta = num_coefficients(beta_degrees);

        let phi_i = l_sampling.sample(l, 0., TAU, 0.5);
        let phi_a = l_sampling.sample(l, 0., TAU, 0.);
        let phi_b = l_sampling.sample(l, 0., TAU, 1.);
        let rho_j = k_sampling.sample(k, 0., 1., 0.5);
        let rho_a = k_sampling.sample(k, 0., 1., 0.);
        let rho_b = k_sampling.sample(k, 0., 1., 1.);

        // angular line integrals of cos(mφ) and sin(mφ), [m-1][l]
        let trig: Vec<Vec<(f64, f64)>> = (1..=beta_degrees)
            .map(|m| {
                let m = m as f64;
                phi_a
                    .iter()
                    .zip(phi_b.iter())
                    .map(|(a, b)| {
                        (
                            ((m * b).sin() - (m * a).sin()) / m,
                            (-(m * b).cos() + (m * a).cos()) / m,
                        )
                    })
                    .collect()
            })
            .collect();

        let mut a = DMatrix::<Complex64>::zeros(k * l, num_beta);
        for c in 0..num_beta {
            let (n, m) = single2double_noll(c + 1);
            let rhoi = radial_antiderivative(&radial_polynomial(n, m));
            let i_r: Vec<f64> = rho_a
                .iter()
                .zip(rho_b.iter())
                .map(|(ra, rb)| polyval(&rhoi, *rb) - polyval(&rhoi, *ra))
                .collect();
            let sqrt_n1 = (n as f64 + 1.).sqrt();
            if m == 0 {
                let ck = sqrt_n1 * 2. / l as f64;
                for (ki, ir) in i_r.iter().enumerate() {
                    for li in 0..l {
                        a[(l * ki + li, c)] = Complex64::new(ck * ir, 0.);
                    }
                }
            } else {
                let ck = sqrt_n1 / PI;
                let sgn = -(m.signum() as f64);
                let trig_m = &trig[m.unsigned_abs() as usize - 1];
                for (ki, ir) in i_r.iter().enumerate() {
                    for (li, (i_cos, i_sin)) in trig_m.iter().enumerate() {
                        a[(l * ki + li, c)] = Complex64::new(*i_cos, sgn * i_sin) * (ck * ir);
                    }
                }
            }
        }

        let mut zz = DMatrix::<f64>::zeros(k * l, num_alpha);
        for c in 0..num_alpha {
            let (n, m) = single2double_noll(c + 1);
            let radial = radial_polynomial(n, m);
            let norm = if m == 0 {
                (n as f64 + 1.).sqrt()
            } else {
                (2. * (n as f64 + 1.)).sqrt()
            };
            for (ki, rho) in rho_j.iter().enumerate() {
                let rad = norm * polyval(&radial, *rho);
                for (li, phi) in phi_i.iter().enumerate() {
                    let ang = if m >= 0 {
                        (m as f64 * phi).cos()
                    } else {
                        (-m as f64 * phi).sin()
                    };
                    zz[(li + l * ki, c)] = rad * ang;
                }
            }
        }

        Self {
            beta_degrees,
            a,
            zz,
        }
    }
    pub fn beta_degrees(&self) -> usize {
        self.beta_degrees
    }
    /// Number of pupil bins
    pub fn num_bins(&self) -> usize {
        self.a.nrows()
    }
    /// Converts one set of alpha coefficients
    ///
    /// Returns empty coefficients if the pupil has no bins.
    pub fn convert(&self, alpha: &ZernikeCoefficients) -> ComplexZernikeCoefficients {
        if self.num_bins() == 0 {
            return ComplexZernikeCoefficients::default();
        }
        let phase_cf = DVector::from_iterator(
            self.zz.ncols(),
            (1..=self.zz.ncols()).map(|j| alpha.get(j).copied().unwrap_or_default()),
        );
        let p = (&self.zz * phase_cf).map(|phase| Complex64::from_polar(1., phase));
        let beta = self.a.tr_mul(&p);
        std::iter::once(Complex64::default())
            .chain(beta.iter().copied())
            .collect::<Vec<_>>()
            .into()
    }
    /// Converts a batch of alpha coefficients in parallel
    pub fn convert_batch(&self, alphas: &[&ZernikeCoefficients]) -> Vec<ComplexZernikeCoefficients> {
        alphas.par_iter().map(|alpha| self.convert(alpha)).collect()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    fn converter(degrees: usize) -> AlphaToBeta {
        AlphaToBeta::new(degrees, SamplingMethod::Linear, 32, SamplingMethod::Cosine, 40)
    }

    #[test]
    fn sampling() {
        let x = SamplingMethod::Linear.sample(4, 0., 1., 0.5);
        assert_eq!(x, vec![0.125, 0.375, 0.625, 0.875]);
        let x = SamplingMethod::Cosine.sample(4, 0., 1., 1.);
        assert!((x[3] - 1.).abs() < 1e-12);
        let x = SamplingMethod::SquareRoot.sample(4, 0., 1., 0.);
        assert_eq!(x[0], 0.);
        assert!((x[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn radial_polynomials() {
        assert_eq!(radial_polynomial(2, 0), vec![-1., 0., 2.]);
        assert_eq!(radial_polynomial(4, 0), vec![1., 0., -6., 0., 6.]);
        assert_eq!(radial_polynomial(3, -1), vec![0., -2., 0., 3.]);
        assert_eq!(radial_polynomial(3, 3), vec![0., 0., 0., 1.]);
        // R_n^m(1) = 1
        for j in 1..100 {
            let (n, m) = single2double_noll(j);
            assert!((polyval(&radial_polynomial(n, m), 1.) - 1.).abs() < 1e-9);
        }
    }

    #[test]
    fn unaberrated_pupil() {
        let beta = converter(8).convert(&ZernikeCoefficients::default());
        assert_eq!(beta.len(), num_coefficients(8) + 1);
        assert!((beta[1] - Complex64::new(1., 0.)).norm() < 1e-12);
        assert!(beta.iter().skip(2).all(|b| b.norm() < 1e-12));
    }

    #[test]
    fn small_defocus() {
        let eps = 1e-4;
        let mut alpha = ZernikeCoefficients::default();
        alpha[4] = eps;
        let beta = converter(8).convert(&alpha);
        assert!((beta[4] - Complex64::new(0., eps)).norm() < 1e-3 * eps);
        for (j, b) in beta.iter().enumerate().skip(2) {
            if j != 4 {
                assert!(b.norm() < 1e-3 * beta[4].norm(), "beta[{j}]={b}");
            }
        }
    }

    #[test]
    fn small_tilt() {
        let eps = 1e-4;
        let mut alpha = ZernikeCoefficients::default();
        alpha[2] = eps;
        let beta = converter(6).convert(&alpha);
        let expected = eps / 2f64.sqrt();
        assert!((beta[2].im - expected).abs() < 1e-2 * expected);
        assert!((beta[3].im - expected).abs() < 1e-2 * expected);
    }

    #[test]
    fn empty_pupil() {
        let converter = AlphaToBeta::new(4, SamplingMethod::Linear, 0, SamplingMethod::Cosine, 6);
        assert!(converter.convert(&ZernikeCoefficients::default()).is_empty());
    }

    #[test]
    fn batch() {
        let mut alpha = ZernikeCoefficients::default();
        alpha[6] = 0.5;
        let zero = ZernikeCoefficients::default();
        let converter = converter(4);
        let betas = converter.convert_batch(&[&alpha, &zero]);
        assert_eq!(betas.len(), 2);
        assert_eq!(betas[0], converter.convert(&alpha));
        assert!((betas[1][1].re - 1.).abs() < 1e-12);
    }
}
