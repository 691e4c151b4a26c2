/*!
# PSF synthesis

The pupil function of a PSF is accumulated over the significant beta coefficients
```text
U(r,φ) = Σ 2·√(n+1)·i^|m|·β_nm·V_n|m|(r)·e^(imφ)
```
on a square grid centered on the optical axis, the PSF is the intensity `|U|²`
cropped and normalized to a unit sum.
*/

use std::f64::consts::FRAC_PI_2;

use nalgebra::DMatrix;
use num::complex::Complex64;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    config::PsfStackParameters,
    defocus::PsfEntryParams,
    enz::linspace,
    zernike::{ComplexZernikeCoefficients, PositiveCoefficient, PositiveCoefficients},
};

/// One retinal degree `[μm]`
pub const MICRONS_PER_DEGREE: f64 = 288.;

#[derive(thiserror::Error, Debug)]
pub enum PsfError {
    #[error("The PSF sums to zero, it cannot be normalized")]
    ZeroSum,
    #[error("PSF dimension mismatch: {0} samples for a {1}x{1} kernel")]
    Dimension(usize, usize),
}
type Result<T> = std::result::Result<T, PsfError>;

/// Kernel resampling filter
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumIter, EnumString, Display,
)]
#[strum(ascii_case_insensitive)]
pub enum InterpolationType {
    Nearest,
    Bilinear,
    #[default]
    Area,
}

/// Polar coordinates of a square grid of `samples x samples` points spanning `±half_extent`
///
/// The grid is row-major with `y` along the rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolarGrid {
    pub samples: usize,
    pub r: Vec<f64>,
    pub phi: Vec<f64>,
}
impl PolarGrid {
    pub fn new(samples: usize, half_extent: f64) -> Self {
        let x = linspace(-half_extent, half_extent, samples);
        let (r, phi) = x
            .iter()
            .flat_map(|y| x.iter().map(move |x| (x.hypot(*y), y.atan2(*x))))
            .unzip();
        Self { samples, r, phi }
    }
    pub fn len(&self) -> usize {
        self.r.len()
    }
    pub fn is_empty(&self) -> bool {
        self.r.is_empty()
    }
}

/// `i^m`
pub fn i_pow(m: i32) -> Complex64 {
    Complex64::from_polar(1., FRAC_PI_2 * m.rem_euclid(4) as f64)
}

/// The positive coefficients which `β_(n,m)` or `β_(n,-m)` magnitude is at least `threshold`
pub fn significant_coefficients(
    beta: &ComplexZernikeCoefficients,
    max_degree: usize,
    threshold: f64,
) -> Vec<(usize, PositiveCoefficient)> {
    PositiveCoefficients::new(max_degree)
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, coefficient)| {
            let magnitude = coefficient
                .noll
                .iter()
                .map(|j| beta.at(*j).norm())
                .fold(0f64, f64::max);
            magnitude > 0. && magnitude >= threshold
        })
        .collect()
}

/// The pupil weights `2·√(n+1)·i^|m|·β` of `(n,m)` and `(n,-m)`, the second is 0 if `m=0`
pub fn pupil_weights(beta: &ComplexZernikeCoefficients, coefficient: &PositiveCoefficient) -> [Complex64; 2] {
    let n = coefficient.n();
    let scale = 2. * ((n + 1) as f64).sqrt() * i_pow(coefficient.m().abs());
    let [jp, jm] = coefficient.noll;
    if coefficient.m() == 0 {
        [scale * beta.at(jp), Complex64::default()]
    } else {
        [scale * beta.at(jp), scale * beta.at(jm)]
    }
}

/// Adds the contribution of one coefficient pair to the pupil function
///
/// `vnm_at(r)` gives `V_n|m|` at the radius `r`.
pub fn accumulate<F>(
    pupil: &mut [Complex64],
    grid: &PolarGrid,
    coefficient: &PositiveCoefficient,
    weights: [Complex64; 2],
    vnm_at: F,
) where
    F: Fn(f64) -> Complex64,
{
    let m = coefficient.m() as f64;
    pupil
        .iter_mut()
        .zip(grid.r.iter().zip(&grid.phi))
        .for_each(|(u, (r, phi))| {
            let v = vnm_at(*r);
            let (positive, negative) = (
                Complex64::from_polar(1., m * phi),
                Complex64::from_polar(1., -m * phi),
            );
            *u += v * (weights[0] * positive + weights[1] * negative);
        });
}

/// `|U|²`
pub fn intensity(pupil: &[Complex64]) -> Vec<f64> {
    pupil.iter().map(|u| u.norm_sqr()).collect()
}

/// Largest radius, in pixels, which outer ring maximum is at least `threshold` times the PSF maximum
///
/// The full half size is returned when no ring reaches the threshold.
pub fn crop_coeff(psf: &[f64], size: usize, threshold: f64) -> usize {
    let max = psf.iter().copied().fold(0f64, f64::max);
    let c = size / 2;
    (1..=c)
        .rev()
        .find(|&radius| {
            let ring_max = (c - radius..=c + radius)
                .flat_map(|i| (c - radius..=c + radius).map(move |j| (i, j)))
                .filter(|(i, j)| i.abs_diff(c) == radius || j.abs_diff(c) == radius)
                .map(|(i, j)| psf[i * size + j])
                .fold(0f64, f64::max);
            ring_max >= threshold * max
        })
        .unwrap_or(c)
}

/// Smallest radius, in pixels, which centered block holds at least `threshold` of the PSF energy
pub fn crop_sum(psf: &[f64], size: usize, threshold: f64) -> usize {
    let total: f64 = psf.iter().sum();
    let c = size / 2;
    (0..=c)
        .find(|&radius| {
            let sum: f64 = (c - radius..=c + radius)
                .flat_map(|i| psf[i * size + c - radius..=i * size + c + radius].iter())
                .sum();
            sum >= threshold * total
        })
        .unwrap_or(c)
}

/// The centered `(2·radius+1)²` block of a PSF
pub fn crop(psf: &[f64], size: usize, radius: usize) -> Vec<f64> {
    let c = size / 2;
    (c - radius..=c + radius)
        .flat_map(|i| psf[i * size + c - radius..=i * size + c + radius].iter().copied())
        .collect()
}

/// Scales a PSF to a unit sum
pub fn normalize(psf: &mut [f64]) -> Result<()> {
    let sum: f64 = psf.iter().sum();
    if sum == 0. || !sum.is_finite() {
        return Err(PsfError::ZeroSum);
    }
    psf.iter_mut().for_each(|v| *v /= sum);
    Ok(())
}

/// Crops and normalizes a PSF of `size x size` samples
///
/// Returns the new PSF and its size.
pub fn optimize(
    settings: &PsfStackParameters,
    mut psf: Vec<f64>,
    mut size: usize,
) -> Result<(Vec<f64>, usize)> {
    if psf.len() != size * size {
        return Err(PsfError::Dimension(psf.len(), size));
    }
    if settings.crop_threshold_coeff > 0. {
        let radius = crop_coeff(&psf, size, settings.crop_threshold_coeff);
        psf = crop(&psf, size, radius);
        size = 2 * radius + 1;
    }
    if settings.crop_threshold_sum < 1. {
        let radius = crop_sum(&psf, size, settings.crop_threshold_sum);
        psf = crop(&psf, size, radius);
        size = 2 * radius + 1;
    }
    normalize(&mut psf)?;
    Ok((psf, size))
}

/// 1D resampling weights `[output x input]`
fn resampling_weights(input: usize, output: usize, interpolation: InterpolationType) -> DMatrix<f64> {
    let scale = input as f64 / output as f64;
    let last = input.saturating_sub(1) as f64;
    let mut w = DMatrix::<f64>::zeros(output, input);
    for o in 0..output {
        match interpolation {
            InterpolationType::Nearest => {
                let i = ((o as f64 + 0.5) * scale - 0.5).round().clamp(0., last);
                w[(o, i as usize)] = 1.;
            }
            InterpolationType::Bilinear => {
                let x = ((o as f64 + 0.5) * scale - 0.5).clamp(0., last);
                let i = x.floor() as usize;
                let t = x - i as f64;
                w[(o, i)] += 1. - t;
                if t > 0. {
                    w[(o, i + 1)] += t;
                }
            }
            InterpolationType::Area => {
                let (a, b) = (o as f64 * scale, (o + 1) as f64 * scale);
                for i in (a.floor() as usize)..(b.ceil() as usize).min(input) {
                    let overlap = (b.min((i + 1) as f64) - a.max(i as f64)).max(0.);
                    w[(o, i)] += overlap / scale;
                }
            }
        }
    }
    w
}

/// Resamples a PSF of `size x size` samples to `(2·radius+1)²` samples and normalizes it
pub fn resize_psf(
    psf: &[f64],
    size: usize,
    radius: usize,
    interpolation: InterpolationType,
) -> Result<Vec<f64>> {
    if psf.len() != size * size {
        return Err(PsfError::Dimension(psf.len(), size));
    }
    let output = 2 * radius + 1;
    if output == size {
        let mut psf = psf.to_vec();
        normalize(&mut psf)?;
        return Ok(psf);
    }
    let w = resampling_weights(size, output, interpolation);
    let p = DMatrix::from_row_slice(size, size, psf);
    let resized = &w * p * w.transpose();
    let mut resized: Vec<f64> = resized.transpose().iter().copied().collect();
    normalize(&mut resized)?;
    Ok(resized)
}

/// A PSF kernel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PsfEntry {
    /// Number of samples along each axis, always odd
    pub kernel_size: usize,
    /// `[μm]`
    pub blur_radius_mum: f64,
    /// `[μm]`
    pub blur_size_mum: f64,
    /// `[deg]`
    pub blur_radius_deg: f64,
    /// `[deg]`
    pub blur_size_deg: f64,
    /// Row-major `kernel_size x kernel_size` intensity, normalized to a unit sum
    pub kernel: Vec<f64>,
}
impl PsfEntry {
    /// A kernel sampled every `sample_size` `[μm]`
    pub fn new(kernel: Vec<f64>, kernel_size: usize, sample_size: f64) -> Self {
        let blur_radius_mum = (kernel_size / 2) as f64 * sample_size;
        let blur_size_mum = kernel_size as f64 * sample_size;
        Self {
            kernel_size,
            blur_radius_mum,
            blur_size_mum,
            blur_radius_deg: blur_radius_angle(blur_radius_mum),
            blur_size_deg: blur_radius_angle(blur_size_mum),
            kernel,
        }
    }
    /// Value at row `i` and column `j`
    pub fn at(&self, i: usize, j: usize) -> f64 {
        self.kernel[i * self.kernel_size + j]
    }
}

/// Retinal distance `[μm]` to visual angle `[deg]`
pub fn blur_radius_angle(mum: f64) -> f64 {
    mum / MICRONS_PER_DEGREE
}

/// Synthesizes the PSF of an entry with the host
///
/// `vnm(coefficient)` returns `V_nm` of a positive coefficient at the radius samples.
pub fn synthesize<F>(
    settings: &PsfStackParameters,
    entry: &PsfEntryParams,
    radius_step: f64,
    vnm: F,
) -> Result<PsfEntry>
where
    F: Fn(&PositiveCoefficient) -> Vec<Complex64>,
{
    let samples = entry.sampling.samples;
    let half_extent = entry.sampling.half_extent;
    let grid = PolarGrid::new(samples, half_extent);
    let beta = &entry.coefficients.beta;
    let mut pupil = vec![Complex64::default(); grid.len()];
    if !settings.omit_psf_calculation {
        for (_, coefficient) in
            significant_coefficients(beta, settings.beta_degrees, settings.beta_threshold)
        {
            let values = if settings.omit_vnm_calculation {
                Vec::new()
            } else {
                vnm(&coefficient)
            };
            let weights = pupil_weights(beta, &coefficient);
            accumulate(&mut pupil, &grid, &coefficient, weights, |r| {
                crate::enz::vnm::interpolate(&values, radius_step, r, half_extent)
            });
        }
    }
    let psf = intensity(&pupil);
    if settings.omit_psf_calculation {
        return Ok(PsfEntry::new(psf, samples, entry.sampling.sample_size));
    }
    let (kernel, size) = optimize(settings, psf, samples)?;
    Ok(PsfEntry::new(kernel, size, entry.sampling.sample_size))
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use rand::Rng;

    fn gaussian(size: usize, sigma: f64) -> Vec<f64> {
        let c = (size / 2) as f64;
        (0..size)
            .flat_map(|i| {
                (0..size).map(move |j| {
                    let r2 = (i as f64 - c).powi(2) + (j as f64 - c).powi(2);
                    (-r2 / (2. * sigma * sigma)).exp()
                })
            })
            .collect()
    }

    #[test]
    fn polar_grid() {
        let grid = PolarGrid::new(5, 2.);
        assert_eq!(grid.len(), 25);
        assert_eq!(grid.r[12], 0.);
        // first row is y=-2
        assert!((grid.r[0] - 8f64.sqrt()).abs() < 1e-12);
        assert!((grid.phi[14] - 0.).abs() < 1e-12);
        assert!((grid.phi[22] - FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn powers_of_i() {
        assert!((i_pow(0) - Complex64::new(1., 0.)).norm() < 1e-15);
        assert!((i_pow(1) - Complex64::new(0., 1.)).norm() < 1e-15);
        assert!((i_pow(3) - Complex64::new(0., -1.)).norm() < 1e-15);
        assert!((i_pow(-1) - Complex64::new(0., -1.)).norm() < 1e-15);
    }

    #[test]
    fn normalization() {
        let mut rng = rand::thread_rng();
        let mut psf: Vec<f64> = (0..121).map(|_| rng.gen::<f64>()).collect();
        normalize(&mut psf).unwrap();
        assert!((psf.iter().sum::<f64>() - 1.).abs() < 1e-6);
        let mut zeros = vec![0f64; 9];
        assert!(matches!(normalize(&mut zeros), Err(PsfError::ZeroSum)));
    }

    #[test]
    fn cropping() {
        let psf = gaussian(41, 3.);
        let radius = crop_sum(&psf, 41, 0.9);
        assert!(radius > 3 && radius < 10);
        let radius = crop_coeff(&psf, 41, 1e-2);
        // exp(-r²/18) >= 1e-2 up to r ≈ 9.1
        assert_eq!(radius, 9);
        let cropped = crop(&psf, 41, radius);
        assert_eq!(cropped.len(), 19 * 19);
        assert_eq!(cropped[9 * 19 + 9], 1.);
    }

    #[test]
    fn peaked_psf_is_not_cropped() {
        let mut psf = vec![0.01; 25];
        psf[12] = 1.;
        assert_eq!(crop_coeff(&psf, 5, 0.5), 2);
        let settings = PsfStackParameters::default().crop_thresholds(1., 0.5);
        let (psf, size) = optimize(&settings, psf, 5).unwrap();
        assert_eq!(size, 5);
        assert_eq!(psf.len(), 25);
        assert!((psf.iter().sum::<f64>() - 1.).abs() < 1e-12);
    }

    #[test]
    fn optimized_kernels_are_odd() {
        let settings = PsfStackParameters::default().crop_thresholds(0.95, 1e-3);
        let (psf, size) = optimize(&settings, gaussian(61, 4.), 61).unwrap();
        assert_eq!(size % 2, 1);
        assert!(size < 61);
        assert_eq!(psf.len(), size * size);
        assert!((psf.iter().sum::<f64>() - 1.).abs() < 1e-6);
        assert!(matches!(
            optimize(&settings, vec![0.; 10], 3),
            Err(PsfError::Dimension(10, 3))
        ));
    }

    #[test]
    fn resizing() {
        let psf = gaussian(31, 3.);
        for interpolation in [
            InterpolationType::Nearest,
            InterpolationType::Bilinear,
            InterpolationType::Area,
        ] {
            let resized = resize_psf(&psf, 31, 7, interpolation).unwrap();
            assert_eq!(resized.len(), 15 * 15);
            assert!((resized.iter().sum::<f64>() - 1.).abs() < 1e-9);
            let max = resized.iter().copied().fold(0f64, f64::max);
            assert_eq!(resized[7 * 15 + 7], max, "{interpolation}");
        }
        let same = resize_psf(&psf, 31, 15, InterpolationType::Area).unwrap();
        assert!((same[15 * 31 + 15] * psf.iter().sum::<f64>() - 1.).abs() < 1e-12);
    }

    #[test]
    fn blur_size() {
        let entry = PsfEntry::new(vec![1.], 1, 2.);
        assert_eq!(entry.blur_radius_mum, 0.);
        let entry = PsfEntry::new(vec![0.; 121], 11, 2.88);
        assert!((entry.blur_radius_mum - 14.4).abs() < 1e-12);
        assert!((entry.blur_radius_deg - 0.05).abs() < 1e-12);
        assert!((entry.blur_size_deg - 0.11).abs() < 1e-12);
    }

    #[test]
    fn significant() {
        let mut beta = ComplexZernikeCoefficients::with_degree(4);
        beta[1] = Complex64::new(1., 0.);
        beta[6] = Complex64::new(0., 0.2);
        beta[13] = Complex64::new(1e-4, 0.);
        let significant = significant_coefficients(&beta, 4, 1e-3);
        let degrees: Vec<(i32, i32)> = significant
            .iter()
            .map(|(_, c)| (c.n(), c.m()))
            .collect();
        assert_eq!(degrees, vec![(0, 0), (2, 2)]);
        assert_eq!(significant_coefficients(&beta, 4, 0.).len(), 3);
    }
}
