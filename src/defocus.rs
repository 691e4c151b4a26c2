/*!
# Best focus

Optimum focus of a high numerical aperture beam in the presence of the radially symmetric
and astigmatic aberrations, after

Janssen, A., van Haver, S., Braat, J., & Dirksen, P. (2007). Strehl ratio and optimum focus of
high-numerical-aperture beams. Journal Of The European Optical Society - Rapid Publications, 2.
*/

use std::f64::consts::{PI, TAU};

use crate::{
    coefficients::AberrationCoefficients,
    config::PsfStackParameters,
    ranges::PsfParameterValues,
    zernike::{single2double_noll, ZernikeCoefficients},
};

/// Fractional binomial coefficient `(a/b choose k)` up to the sign convention of the series
fn binom(a: i32, b: i32, k: i32) -> f64 {
    (1..=k).fold(1f64, |p, m| p * (a - b * m + b) as f64 / (b * m) as f64)
}
fn choose(n: i32, k: i32) -> f64 {
    if k < 0 || k > n {
        return 0.;
    }
    let k = k.min(n - k);
    (0..k).fold(1f64, |b, i| b * (n - i) as f64 / (i + 1) as f64)
}
fn sign(k: i32) -> f64 {
    if k % 2 == 0 {
        1.
    } else {
        -1.
    }
}

/// `D_2n^0`
fn d_2n_0(s0: f64, n: i32, a: i32, b: i32) -> f64 {
    let sum: f64 = (n..60)
        .map(|k| {
            s0.powi(2 * k) * sign(k) * binom(a, b, k) * choose(k, n) / choose(n + k + 1, k)
        })
        .sum();
    ((2 * n + 1) as f64 / (n + 1) as f64) * sum
}
/// `γ_2n^0`
fn gamma_2n_0(d0: f64, n: i32) -> f64 {
    0.5 * (d0.powi(n - 1) / (2 * n - 1) as f64 - d0.powi(n + 1) / (2 * n + 3) as f64)
}
/// `G_2n^2`
fn g_2n_2(s0: f64, n: i32, a: i32, b: i32) -> f64 {
    let sum: f64 = (n..100)
        .map(|k| {
            s0.powi(2 * k) * sign(k) * binom(a, b, k) * choose(k - 1, n - 1)
                / choose(n + k + 1, k + 1)
        })
        .sum();
    -((2 * n + 1) as f64 / n as f64) * sum
}
/// `E_2n^2`
fn e_2n_2(s0: f64, n: i32, c0: f64, gamma_00: f64) -> f64 {
    let g = gamma_00 * (1. - c0);
    -(1. / (2. * (1. - c0)))
        * ((1. - g) * g_2n_2(s0, n, -1, 4) - (2. - g) * g_2n_2(s0, n, 1, 4) + g_2n_2(s0, n, 3, 4))
}
/// `C_2n^0`
fn c_2n_0(s0: f64, n: i32, c0: f64, gamma_00: f64) -> f64 {
    let g = gamma_00 * (1. - c0);
    (1. / (2. * (1. - c0)))
        * ((1. - g) * d_2n_0(s0, n, -1, 4) - g * d_2n_0(s0, n, 1, 4) - d_2n_0(s0, n, 3, 4))
}

/// Defocus parameter of the best focus
///
/// # Parameters
/// - `s0`: numerical aperture
/// - `coefficients`: phase coefficients `[rad]`
///
/// Only the `(2n,0)` and `(2n,2)` coefficients contribute.
pub fn best_focus(s0: f64, coefficients: &ZernikeCoefficients) -> f64 {
    let c0 = (1. - s0 * s0).sqrt();
    let d0 = ((1. - c0) / s0).powi(2);
    let gamma_00 = (1. + 2. * c0) / (3. * (1. + c0));

    let (mut sc, mut se, mut sg) = (0f64, 0f64, 0f64);
    for (j, alpha) in coefficients.indexed().skip(1) {
        let (zn, zm) = single2double_noll(j);
        if zn % 2 != 0 {
            continue;
        }
        let n = zn / 2;
        let weight = 2. * (2 * n + 1) as f64;
        match zm {
            0 => {
                let c = c_2n_0(s0, n, c0, gamma_00);
                // sqrt(n+1) normalized polynomials vs sqrt(2(n+1))
                let scale = 2f64.sqrt();
                sc += scale * alpha * c / weight;
                sg += c * gamma_2n_0(d0, n) / weight;
            }
            2 => {
                se += alpha * e_2n_2(s0, n, c0, gamma_00) / weight;
            }
            _ => (),
        }
    }
    if sg == 0. || !sg.is_finite() {
        return 0.;
    }
    -(sc - 0.5 * se) / sg
}

/// Axial image shift `[μm]` induced by the aberrations
pub fn focal_shift_from_aberration(
    s0: f64,
    focal_shift_to_defocus: f64,
    coefficients: &ZernikeCoefficients,
) -> f64 {
    best_focus(s0, coefficients) / focal_shift_to_defocus
}

/// Axial image shift `[μm]` of an object at `object_distance` `[m]` for an eye focused at infinity
///
/// `pupil_retina_distance` is in meters.
pub fn focal_shift_from_object_depth(pupil_retina_distance: f64, object_distance: f64) -> f64 {
    let image_distance = (pupil_retina_distance.recip() - object_distance.recip()).recip();
    (pupil_retina_distance - image_distance) * 1e6
}

/// Physical units of a PSF
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsfUnits {
    /// `[m]`
    pub object_distance: f64,
    /// `[m]`
    pub focus_distance: f64,
    pub angle_horizontal: f64,
    pub angle_vertical: f64,
    /// `[m]`
    pub pupil_retina_distance: f64,
    /// `[mm]`
    pub aperture_diameter: f64,
    pub refractive_index: f64,
    /// `[μm]`
    pub lambda: f64,
    /// Numerical aperture
    pub s0: f64,
    pub u0: f64,
    /// Lateral diffraction unit `[μm]`
    pub diffraction_unit: f64,
    /// Axial diffraction unit `[μm]`
    pub axial_diffraction_unit: f64,
    /// Axial shift `[μm]` to defocus parameter conversion factor
    pub focal_shift_to_defocus: f64,
}
impl PsfUnits {
    /// # Parameters
    /// - `values`: the PSF grid values
    /// - `pupil_retina_distance`: the distance between the pupil and the retina of the focused eye `[mm]`
    /// - `refractive_index`: the refractive index of the vitreous
    pub fn new(values: &PsfParameterValues, pupil_retina_distance: f64, refractive_index: f64) -> Self {
        let pupil_retina_distance = pupil_retina_distance * 1e-3;
        let lambda = values.lambda * 1e-3;
        let s0 = (values.aperture_diameter * 1e3) / (2. * pupil_retina_distance * 1e6);
        let u0 = 1. - (1. - s0 * s0).sqrt();
        let diffraction_unit = lambda / s0;
        let axial_diffraction_unit = lambda / u0;
        Self {
            object_distance: values.object_distance,
            focus_distance: values.focus_distance,
            angle_horizontal: values.angle_horizontal,
            angle_vertical: values.angle_vertical,
            pupil_retina_distance,
            aperture_diameter: values.aperture_diameter,
            refractive_index,
            lambda,
            s0,
            u0,
            diffraction_unit,
            axial_diffraction_unit,
            focal_shift_to_defocus: -(TAU * refractive_index) / axial_diffraction_unit,
        }
    }
}

/// Focus of a PSF
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsfFocus {
    /// Image shift due to the aberrations `[μm]`
    pub image_shift_aberration: f64,
    /// Image shift due to the object depth `[μm]`
    pub image_shift_object_depth: f64,
    /// Total image shift `[μm]`
    pub image_shift: f64,
    pub defocus_param: f64,
    /// Defocus in multiples of `π/2`
    pub defocus_units: f64,
}

/// Spatial sampling of a PSF
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsfSampling {
    pub sampling_units: f64,
    /// Sample size `[μm]`
    pub sample_size: f64,
    /// Number of samples along each axis, always odd
    pub samples: usize,
    /// `[μm]`
    pub half_extent_mum: f64,
    /// Half extent in diffraction units
    pub half_extent: f64,
}

/// Sampling of the Vnm functions of a PSF
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnzEntrySampling {
    /// Sample size in diffraction units
    pub sampling: f64,
    pub samples: usize,
    pub extent: f64,
    /// Number of terms of the Bessel series
    pub terms: usize,
}

/// Derived parameters of a single PSF
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PsfEntryParams {
    pub units: PsfUnits,
    pub focus: PsfFocus,
    pub sampling: PsfSampling,
    pub enz_sampling: EnzEntrySampling,
    pub coefficients: AberrationCoefficients,
}
impl PsfEntryParams {
    /// Derives the parameters of a PSF
    ///
    /// # Parameters
    /// - `settings`: the stack settings
    /// - `values`: the PSF grid values
    /// - `pupil_retina_distance`: the focused eye pupil-retina distance `[mm]`
    /// - `refractive_index`: the refractive index of the eye
    /// - `coefficients`: the aberration coefficients of the PSF
    pub fn new(
        settings: &PsfStackParameters,
        values: &PsfParameterValues,
        pupil_retina_distance: f64,
        refractive_index: f64,
        coefficients: AberrationCoefficients,
    ) -> Self {
        let units = PsfUnits::new(values, pupil_retina_distance, refractive_index);

        let image_shift_aberration = focal_shift_from_aberration(
            units.s0,
            units.focal_shift_to_defocus,
            &coefficients.alpha_phase_cumulative,
        );
        let image_shift_object_depth =
            focal_shift_from_object_depth(units.pupil_retina_distance, units.object_distance);
        let image_shift = image_shift_aberration + image_shift_object_depth;
        let defocus_param = if settings.manual_defocus {
            settings.desired_defocus
        } else {
            (image_shift * units.focal_shift_to_defocus).abs()
        };
        let focus = PsfFocus {
            image_shift_aberration,
            image_shift_object_depth,
            image_shift,
            defocus_param,
            defocus_units: defocus_param.abs() / (PI / 2.),
        };

        let focal_shift_to_sampling_units = -(TAU * units.s0) / units.lambda * 5e-3;
        let sampling_units = (image_shift * focal_shift_to_sampling_units)
            .abs()
            .clamp(settings.min_sampling_units, settings.max_sampling_units);
        let sample_size = settings.approximation_sample_size
            * units.diffraction_unit
            * settings.psf_sample_size_multiplier
            * sampling_units.ceil();
        let samples = ((settings.psf_sample_count_multiplier * sampling_units).ceil() as usize)
            .clamp(settings.psf_samples_min, settings.psf_samples_max.max(settings.psf_samples_min));
        let samples = (samples / 2) * 2 + 1;
        let half_extent_mum = (samples / 2) as f64 * sample_size;
        let half_extent = half_extent_mum / units.diffraction_unit;
        let sampling = PsfSampling {
            sampling_units,
            sample_size,
            samples,
            half_extent_mum,
            half_extent,
        };

        let enz_samples = (half_extent / settings.approximation_sample_size).ceil() as usize + 1;
        if enz_samples > settings.max_approximation_samples {
            log::error!(
                "Number of approximation samples ({}) exceeds the maximum allowed ({})",
                enz_samples,
                settings.max_approximation_samples
            );
        }
        let terms = ((settings.approximation_terms_multiplier * sampling_units) as usize).clamp(
            settings.approximation_terms_min,
            settings
                .approximation_terms_max
                .max(settings.approximation_terms_min),
        );
        let enz_sampling = EnzEntrySampling {
            sampling: settings.approximation_sample_size,
            samples: enz_samples,
            extent: enz_samples as f64 * settings.approximation_sample_size,
            terms,
        };

        Self {
            units,
            focus,
            sampling,
            enz_sampling,
            coefficients,
        }
    }
    /// Number of Vnm samples actually available in the global radius sampling
    pub fn enz_samples(&self, max_samples: usize) -> usize {
        self.enz_sampling.samples.min(max_samples)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn binomials() {
        assert_eq!(choose(5, 2), 10.);
        assert_eq!(choose(3, 0), 1.);
        assert_eq!(choose(2, 3), 0.);
        assert_eq!(binom(3, 4, 0), 1.);
        assert!((binom(3, 4, 1) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn no_aberration_no_shift() {
        let alpha = ZernikeCoefficients::default();
        assert_eq!(best_focus(0.15, &alpha), 0.);
    }

    #[test]
    fn defocus_is_compensated() {
        let mut alpha = ZernikeCoefficients::default();
        alpha[4] = 1.;
        let f1 = best_focus(0.15, &alpha);
        alpha[4] = 2.;
        let f2 = best_focus(0.15, &alpha);
        assert!(f1.abs() > 0.);
        assert!((f2 - 2. * f1).abs() < 1e-9 * f2.abs());
        // odd or non-symmetric terms have no effect
        alpha[7] = 3.;
        alpha[5] = 3.;
        assert!((best_focus(0.15, &alpha) - f2).abs() < 1e-12);
    }

    #[test]
    fn no_symmetric_terms() {
        let alpha = ZernikeCoefficients::from(vec![0., 0., 1., 1.]);
        assert_eq!(best_focus(0.15, &alpha), 0.);
    }

    fn values(object_distance: f64) -> PsfParameterValues {
        PsfParameterValues {
            object_distance,
            angle_horizontal: 0.,
            angle_vertical: 0.,
            lambda: 550.,
            aperture_diameter: 5.,
            focus_distance: 8.,
            focus_dioptre: 0.125,
        }
    }

    #[test]
    fn units() {
        let units = PsfUnits::new(&values(1.), 17., 1.337);
        assert!((units.s0 - 5. / 34.).abs() < 1e-12);
        assert!((units.lambda - 0.55).abs() < 1e-12);
        assert!((units.diffraction_unit - 0.55 * 34. / 5.).abs() < 1e-9);
        assert!(units.focal_shift_to_defocus < 0.);
    }

    #[test]
    fn entry_sampling() {
        let settings = PsfStackParameters::default().psf_samples(10, 200);
        let entry = PsfEntryParams::new(
            &settings,
            &values(0.5),
            17.,
            1.337,
            AberrationCoefficients::default(),
        );
        assert_eq!(entry.sampling.samples % 2, 1);
        assert!(entry.sampling.samples <= 201);
        assert!(entry.sampling.sampling_units >= settings.min_sampling_units);
        assert!(entry.sampling.sampling_units <= settings.max_sampling_units);
        assert!(entry.enz_sampling.terms >= settings.approximation_terms_min);
        assert!(entry.enz_sampling.terms <= settings.approximation_terms_max);
        assert!(entry.focus.defocus_param > 0.);
        assert!(
            (entry.focus.defocus_param
                - (entry.focus.image_shift * entry.units.focal_shift_to_defocus).abs())
            .abs()
                < 1e-9
        );
        let half_extent = (entry.sampling.samples / 2) as f64 * entry.sampling.sample_size
            / entry.units.diffraction_unit;
        assert!((entry.sampling.half_extent - half_extent).abs() < 1e-9);
        assert!(entry.enz_sampling.extent >= entry.sampling.half_extent);
    }

    #[test]
    fn in_focus_entry() {
        let settings = PsfStackParameters::default();
        let entry = PsfEntryParams::new(
            &settings,
            &values(f64::INFINITY),
            17.,
            1.337,
            AberrationCoefficients::default(),
        );
        assert_eq!(entry.focus.defocus_param, 0.);
        assert_eq!(entry.sampling.sampling_units, settings.min_sampling_units);
        assert_eq!(entry.sampling.samples, 301);
    }

    #[test]
    fn manual_defocus() {
        let settings = PsfStackParameters::default().manual_defocus(2.5);
        let entry = PsfEntryParams::new(
            &settings,
            &values(0.5),
            17.,
            1.337,
            AberrationCoefficients::default(),
        );
        assert_eq!(entry.focus.defocus_param, 2.5);
        assert!((entry.focus.defocus_units - 2.5 / (PI / 2.)).abs() < 1e-12);
    }

    #[test]
    fn object_depth() {
        assert_eq!(focal_shift_from_object_depth(0.017, f64::INFINITY), 0.);
        let shift = focal_shift_from_object_depth(0.017, 1.);
        assert!(shift < 0.);
        assert!((shift - (0.017 - 1. / (1. / 0.017 - 1.)) * 1e6).abs() < 1e-9);
    }
}
