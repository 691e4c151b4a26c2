/*!
# Vnm functions

The radial diffraction integrals of the ENZ theory
```text
V_nm(r,f) = e^(if) Σ_k (2k+1)·i^k·j_k(f)·I_nmk(r)
I_nmk(r) = Σ_l (-1)^l·w_kl·J_(|m|+2l+1)(2πr)/(2πr)
```
with `f` half the defocus parameter of the PSF.
The inner sums `I_nmk` do not depend on the PSF, they are either tabulated once in [`VnmInner`]
or computed on the fly.
*/

use num::complex::Complex64;

use super::{
    wkl::{l_max, l_min},
    CylindricalBessel, EnzTables, Wkl,
};
use crate::{
    threading::{threaded_map, ThreadedExecuteParams},
    zernike::PositiveCoefficients,
};

/// Index of `(n,|m|)` in [`PositiveCoefficients`]
pub fn coefficient_index(n: i32, m: i32) -> usize {
    let (n, m) = (n as usize, m.unsigned_abs() as usize);
    (0..n).map(|n| n / 2 + 1).sum::<usize>() + (m - n % 2) / 2
}

/// The inner sum `I_nmk` at the first `samples` radius samples
pub fn inner_term(
    wkl: &Wkl,
    cylindrical: &CylindricalBessel,
    n: i32,
    m: i32,
    k: usize,
    samples: usize,
) -> Vec<f64> {
    let m = m.abs();
    let samples = samples.min(cylindrical.num_samples());
    let mut inner = vec![0f64; samples];
    let l0 = l_min(n, m, k);
    let num_l = l_max(n, m, k) + 1 - l0;
    for (li, w) in wkl.row(n, m, k).iter().take(num_l).enumerate() {
        let order = m as usize + 2 * (l0 + li) + 1;
        if *w == 0. || order >= cylindrical.num_orders() {
            continue;
        }
        inner
            .iter_mut()
            .zip(&cylindrical.row(order)[..samples])
            .for_each(|(i, c)| *i += w * c);
    }
    inner
}

/// Table of the inner sums `I_nmk`, `[coefficient][k][sample]`
///
/// A table built by a GPU device keeps only its dimensions, the values stay on the device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VnmInner {
    num_coefficients: usize,
    max_order: usize,
    num_samples: usize,
    values: Vec<f64>,
}
impl VnmInner {
    /// Tabulates the inner sums of every positive coefficient
    pub fn new(wkl: &Wkl, cylindrical: &CylindricalBessel, params: &ThreadedExecuteParams) -> Self {
        let coefficients = PositiveCoefficients::new(wkl.max_degree());
        let (max_order, num_samples) = (wkl.max_order(), cylindrical.num_samples());
        let rows: Vec<Vec<f64>> =
            threaded_map(params, [coefficients.len(), max_order], |[c, k]| {
                let coefficient = &coefficients[c];
                inner_term(
                    wkl,
                    cylindrical,
                    coefficient.n(),
                    coefficient.m(),
                    k,
                    num_samples,
                )
            });
        Self {
            num_coefficients: coefficients.len(),
            max_order,
            num_samples,
            values: rows.concat(),
        }
    }
    /// A table which values live on a device
    pub fn on_device(num_coefficients: usize, max_order: usize, num_samples: usize) -> Self {
        Self {
            num_coefficients,
            max_order,
            num_samples,
            values: Vec::new(),
        }
    }
    pub fn is_on_device(&self) -> bool {
        self.values.is_empty() && self.num_coefficients * self.max_order * self.num_samples > 0
    }
    pub fn num_coefficients(&self) -> usize {
        self.num_coefficients
    }
    pub fn max_order(&self) -> usize {
        self.max_order
    }
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }
    /// `I_nmk` of the positive coefficient `c`
    pub fn row(&self, c: usize, k: usize) -> &[f64] {
        let start = (c * self.max_order + k) * self.num_samples;
        self.values
            .get(start..start + self.num_samples)
            .unwrap_or_default()
    }
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }
}

/// `V_nm` of the PSF `psf` at the first `samples` radius samples, summing `terms` orders
pub fn vnm(
    tables: &EnzTables,
    psf: usize,
    n: i32,
    m: i32,
    terms: usize,
    samples: usize,
) -> Vec<Complex64> {
    let terms = terms.min(tables.wkl.max_order());
    let samples = samples.clamp(1, tables.sampling.max_samples);
    let c = coefficient_index(n, m);
    let mut values = vec![Complex64::default(); samples];
    for k in 0..terms {
        let weight = tables.spherical.weight(k, psf);
        let on_the_fly;
        // rows missing from the table are summed on the fly
        let inner = match tables.inner.and_then(|inner| inner.row(c, k).get(..samples)) {
            Some(row) => row,
            None => {
                on_the_fly = inner_term(tables.wkl, tables.cylindrical, n, m, k, samples);
                on_the_fly.as_slice()
            }
        };
        values
            .iter_mut()
            .zip(inner)
            .for_each(|(v, i)| *v += weight * i);
    }
    values
}

/// Linear interpolation of `V_nm` sampled every `radius_step` at the radius `r`
///
/// The function is 0 beyond `half_extent`.
pub fn interpolate(vnm: &[Complex64], radius_step: f64, r: f64, half_extent: f64) -> Complex64 {
    match vnm.len() {
        0 => Complex64::default(),
        1 => vnm[0],
        n if r <= half_extent => {
            let x = r / radius_step;
            let i = (x.floor() as usize).min(n - 2);
            let t = (x - i as f64).clamp(0., 1.);
            vnm[i] * (1. - t) + vnm[i + 1] * t
        }
        _ => Complex64::default(),
    }
}

#[cfg(test)]
pub mod tests {
    use std::f64::consts::TAU;

    use super::*;
    use crate::enz::{bessel::cylindrical_bessel, EnzSampling, SphericalBessel};

    struct Fixture {
        sampling: EnzSampling,
        wkl: Wkl,
        cylindrical: CylindricalBessel,
        spherical: SphericalBessel,
        inner: VnmInner,
    }
    impl Fixture {
        fn new(defocus_params: Vec<f64>) -> Self {
            let params = ThreadedExecuteParams::new("vnm").num_threads(2);
            let mut sampling = EnzSampling {
                max_samples: 41,
                max_extent: 41. * 0.1,
                max_order: 30,
                max_degree: 4,
                ..Default::default()
            };
            sampling.radius = crate::enz::linspace(0., sampling.max_extent, 41);
            sampling.defocus_params = defocus_params;
            let wkl = Wkl::new(4, 30, &params);
            let cylindrical = CylindricalBessel::new(&sampling.radius, 2 * 30 + 30 + 2, 20, &params);
            let spherical = SphericalBessel::new(&sampling.defocus_params, 30, 10, &params);
            let inner = VnmInner::new(&wkl, &cylindrical, &params);
            Self {
                sampling,
                wkl,
                cylindrical,
                spherical,
                inner,
            }
        }
        fn tables(&self, cached: bool) -> EnzTables {
            EnzTables {
                sampling: &self.sampling,
                wkl: &self.wkl,
                cylindrical: &self.cylindrical,
                spherical: &self.spherical,
                inner: cached.then_some(&self.inner),
            }
        }
    }

    #[test]
    fn coefficient_indices() {
        let coefficients = PositiveCoefficients::new(12);
        for (c, coefficient) in coefficients.iter().enumerate() {
            assert_eq!(coefficient_index(coefficient.n(), coefficient.m()), c);
            assert_eq!(coefficient_index(coefficient.n(), -coefficient.m()), c);
        }
    }

    #[test]
    fn in_focus_airy() {
        let fixture = Fixture::new(vec![0.]);
        let v00 = vnm(&fixture.tables(true), 0, 0, 0, 30, 41);
        assert!((v00[0] - Complex64::new(0.5, 0.)).norm() < 1e-12);
        for (r, v) in fixture.sampling.radius.iter().zip(&v00).skip(1) {
            let x = TAU * r;
            assert!((v.re - cylindrical_bessel(1, x) / x).abs() < 1e-9);
            assert!(v.im.abs() < 1e-12);
        }
    }

    #[test]
    fn defocused_center() {
        // V_00(0,2f) = e^(if)·sin(f)/(2f)
        let f = 1.5;
        let fixture = Fixture::new(vec![f]);
        let v00 = vnm(&fixture.tables(true), 0, 0, 0, 30, 41);
        let expected = Complex64::from_polar(1., f) * (f.sin() / (2. * f));
        assert!((v00[0] - expected).norm() < 1e-9);
        let v11 = vnm(&fixture.tables(true), 0, 1, 1, 30, 41);
        assert!(v11[0].norm() < 1e-12);
    }

    #[test]
    fn cached_and_on_the_fly_agree() {
        let fixture = Fixture::new(vec![0.7, 2.3]);
        for (n, m) in [(2, 0), (3, -1), (4, 4), (4, -2)] {
            let cached = vnm(&fixture.tables(true), 1, n, m, 25, 30);
            let direct = vnm(&fixture.tables(false), 1, n, m, 25, 30);
            assert_eq!(cached.len(), 30);
            for (c, d) in cached.iter().zip(&direct) {
                assert!((c - d).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn short_table_falls_back_to_the_direct_sum() {
        let fixture = Fixture::new(vec![0.7]);
        let params = ThreadedExecuteParams::new("vnm").num_threads(1);
        let small = VnmInner::new(&Wkl::new(2, 30, &params), &fixture.cylindrical, &params);
        let empty = VnmInner::default();
        let direct = vnm(&fixture.tables(false), 0, 4, 2, 25, 30);
        for inner in [&small, &empty] {
            let tables = EnzTables {
                inner: Some(inner),
                ..fixture.tables(false)
            };
            let values = vnm(&tables, 0, 4, 2, 25, 30);
            assert_eq!(values.len(), 30);
            for (v, d) in values.iter().zip(&direct) {
                assert!((v - d).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn interpolation() {
        let values: Vec<Complex64> = (0..5).map(|i| Complex64::new(i as f64, -(i as f64))).collect();
        let v = interpolate(&values, 0.5, 0.75, 2.);
        assert!((v - Complex64::new(1.5, -1.5)).norm() < 1e-12);
        assert_eq!(interpolate(&values, 0.5, 2.1, 2.), Complex64::default());
        assert_eq!(interpolate(&values[..1], 0.5, 10., 2.), values[0]);
        // clamped to the last interval
        let v = interpolate(&values, 0.5, 2., 3.);
        assert!((v - Complex64::new(4., -4.)).norm() < 1e-12);
    }
}
