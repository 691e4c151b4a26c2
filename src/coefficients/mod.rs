//! Aberration coefficients: OPD to phase conversion and spectacle prescriptions

use std::f64::consts::{PI, TAU};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::zernike::{single2double_noll, ComplexZernikeCoefficients, ZernikeCoefficients};

pub mod alpha_to_beta;
pub use alpha_to_beta::{AlphaToBeta, SamplingMethod};
use alpha_to_beta::radial_polynomial;

/// Which alpha coefficients are converted to beta coefficients
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumIter, EnumString, Display,
)]
#[strum(ascii_case_insensitive)]
pub enum AlphaToBetaCoefficient {
    /// Optical path difference `[μm]`
    AlphaOpd,
    /// Phase `[rad]`
    #[default]
    AlphaPhaseCumulative,
    /// Phase wrapped into `]-2π,2π[` `[rad]`
    AlphaPhaseResidual,
}

/// Spectacle lens prescription
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectacleLens {
    /// Sphere `[D]`
    pub sphere: f64,
    /// Cylinder `[D]`
    pub cylinder: f64,
    /// Cylinder axis `[rad]`
    pub axis: f64,
}
impl Default for SpectacleLens {
    fn default() -> Self {
        Self {
            sphere: 0.,
            cylinder: 0.,
            axis: PI / 2.,
        }
    }
}

/// Zernike coefficients `[μm]` of a spectacle lens over an aperture of diameter `aperture_diameter` `[mm]`
pub fn spectacle_to_zernike(lens: &SpectacleLens, aperture_diameter: f64) -> ZernikeCoefficients {
    let SpectacleLens {
        sphere: s,
        cylinder: c,
        axis: a,
    } = *lens;
    let r2 = (aperture_diameter / 2.).powi(2);
    let mut alpha = ZernikeCoefficients::default();
    alpha.set_coefficient(2, 0, -(r2 * (s + c / 2.)) / (4. * 3f64.sqrt()));
    alpha.set_coefficient(2, -2, (r2 * c * (2. * a).sin()) / (4. * 6f64.sqrt()));
    alpha.set_coefficient(2, 2, (r2 * c * (2. * a).cos()) / (4. * 6f64.sqrt()));
    alpha
}

/// Zernike coefficients of the same wavefront over a pupil `ratio` times the measurement pupil
///
/// Terms of the same azimuthal frequency are expanded into powers of `ρ`, rescaled by `ratio^p`
/// and projected back onto the Zernike polynomials, starting from the highest degree.
pub fn rescale_aperture(alpha: &ZernikeCoefficients, ratio: f64) -> ZernikeCoefficients {
    let mut rescaled = ZernikeCoefficients::from(vec![0f64; alpha.len()]);
    let mut by_frequency: Vec<(i32, Vec<(i32, usize)>)> = Vec::new();
    for j in 1..alpha.len() {
        let (n, m) = single2double_noll(j);
        match by_frequency.iter_mut().find(|(fm, _)| *fm == m) {
            Some((_, terms)) => terms.push((n, j)),
            None => by_frequency.push((m, vec![(n, j)])),
        }
    }
    for (m, mut terms) in by_frequency {
        terms.sort_unstable();
        let norm = |n: i32| {
            if m == 0 {
                (n as f64 + 1.).sqrt()
            } else {
                (2. * (n as f64 + 1.)).sqrt()
            }
        };
        let Some(&(max_n, _)) = terms.last() else {
            continue;
        };
        let mut power = vec![0f64; max_n as usize + 1];
        for &(n, j) in &terms {
            for (p, r) in radial_polynomial(n, m).iter().enumerate() {
                power[p] += alpha[j] * norm(n) * r;
            }
        }
        power
            .iter_mut()
            .enumerate()
            .for_each(|(p, c)| *c *= ratio.powi(p as i32));
        for &(n, j) in terms.iter().rev() {
            let radial = radial_polynomial(n, m);
            let c = power[n as usize] / (norm(n) * radial[n as usize]);
            radial
                .iter()
                .enumerate()
                .for_each(|(p, r)| power[p] -= c * norm(n) * r);
            rescaled[j] = c;
        }
    }
    rescaled
}

/// Converts an OPD coefficient into a phase, `lambda` in the units of `opd`
///
/// The residual phase keeps only the fractional part of `opd/lambda`, rounded towards zero.
pub fn opd_to_phase(opd: f64, lambda: f64, cumulative: bool) -> f64 {
    let waves = opd / lambda;
    let waves = match (cumulative, opd < 0.) {
        (true, _) => waves,
        (false, true) => waves - waves.ceil(),
        (false, false) => waves - waves.floor(),
    };
    waves * TAU
}

/// Alpha and beta coefficients of one entry of the aberration grid
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AberrationCoefficients {
    /// OPD `[μm]`
    pub alpha: ZernikeCoefficients,
    pub alpha_phase_cumulative: ZernikeCoefficients,
    pub alpha_phase_residual: ZernikeCoefficients,
    pub beta: ComplexZernikeCoefficients,
}
impl AberrationCoefficients {
    pub fn new(alpha: ZernikeCoefficients) -> Self {
        Self {
            alpha,
            ..Default::default()
        }
    }
    /// Removes the mean OPD and derives the phase coefficients at the wavelength `lambda` `[nm]`
    pub fn update_phases(&mut self, lambda: f64) {
        let piston: f64 = self.alpha.iter().skip(2).sum();
        if let Some(a) = self.alpha.get_mut(1) {
            *a = -piston;
        }
        let lambda_mum = lambda * 1e-3;
        let phase = |cumulative: bool| -> ZernikeCoefficients {
            let mut phase = self.alpha.clone();
            phase
                .iter_mut()
                .skip(1)
                .for_each(|a| *a = opd_to_phase(*a, lambda_mum, cumulative));
            phase
        };
        self.alpha_phase_cumulative = phase(true);
        self.alpha_phase_residual = phase(false);
    }
    /// The alpha coefficients selected for the beta conversion
    pub fn select(&self, variant: AlphaToBetaCoefficient) -> &ZernikeCoefficients {
        match variant {
            AlphaToBetaCoefficient::AlphaOpd => &self.alpha,
            AlphaToBetaCoefficient::AlphaPhaseCumulative => &self.alpha_phase_cumulative,
            AlphaToBetaCoefficient::AlphaPhaseResidual => &self.alpha_phase_residual,
        }
    }
}
