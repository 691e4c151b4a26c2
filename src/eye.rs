/*!
# Eye models

An [`EyeModel`] translates the measured aberration of an eye into
 - the anatomical parameters of the relaxed eye,
 - the parameters of the eye focused at a given distance,
 - the Zernike coefficients of the focused eye at a given field angle, wavelength and aperture.

Eye parameters are named values, see the `EYE_*` constants for the names every model provides.
*/

use std::collections::BTreeMap;

use crate::{
    coefficients::{rescale_aperture, spectacle_to_zernike, SpectacleLens},
    config::{AberrationParameters, EyeEstimationMethod},
    zernike::ZernikeCoefficients,
};

/// Axial length `[mm]`
pub const EYE_LENGTH: &str = "EyeT";
/// `[mm]`
pub const CORNEA_THICKNESS: &str = "CorneaT";
/// Anterior chamber depth `[mm]`
pub const AQUEOUS_THICKNESS: &str = "AqueousT";
/// `[mm]`
pub const LENS_THICKNESS: &str = "LensT";
/// Lens power `[D]`
pub const LENS_POWER: &str = "LensD";
/// `[mm]`
pub const VITREOUS_THICKNESS: &str = "VitreousT";
/// Spherical equivalent of the measured aberration `[D]`
pub const REFRACTIVE_ERROR: &str = "RefractiveError";
/// `[D]`
pub const ACCOMMODATION: &str = "Accommodation";
/// `[D]`
pub const DELTA_LENS_POWER: &str = "DeltaLensD";
/// `[mm]`
pub const DELTA_AQUEOUS_THICKNESS: &str = "DeltaAqueousT";

/// Named eye parameters
pub type EyeParameters = BTreeMap<String, f64>;

#[derive(thiserror::Error, Debug)]
pub enum EyeError {
    #[error("The {model} eye model did not provide the parameter {name:?}")]
    MissingParameter { model: String, name: String },
}
type Result<T> = std::result::Result<T, EyeError>;

/// Reads a named parameter
pub fn parameter(params: &EyeParameters, name: &str, model: &str) -> Result<f64> {
    params
        .get(name)
        .copied()
        .ok_or_else(|| EyeError::MissingParameter {
            model: model.into(),
            name: name.into(),
        })
}

/// Distance between the pupil and the retina `[mm]`
pub fn pupil_retina_distance(params: &EyeParameters, model: &str) -> Result<f64> {
    Ok(parameter(params, EYE_LENGTH, model)?
        - parameter(params, CORNEA_THICKNESS, model)?
        - parameter(params, AQUEOUS_THICKNESS, model)?)
}

/// Eye parameters and aberration estimation
pub trait EyeModel: Send + Sync {
    fn name(&self) -> &str;
    /// Parameters of the relaxed eye
    fn estimate_eye_parameters(&self, aberration: &AberrationParameters) -> Result<EyeParameters>;
    /// Parameters of the eye focused at `focus_distance` `[m]`
    fn refocus(&self, relaxed: &EyeParameters, focus_distance: f64) -> Result<EyeParameters>;
    /// Zernike coefficients `[μm]` of the focused eye
    ///
    /// # Parameters
    /// - `angles`: the horizontal and vertical field angles `[deg]`
    /// - `lambda`: the wavelength `[nm]`
    /// - `aperture_diameter`: the pupil diameter `[mm]`
    fn estimate_aberration_coefficients(
        &self,
        focused: &EyeParameters,
        aberration: &AberrationParameters,
        angles: (f64, f64),
        lambda: f64,
        aperture_diameter: f64,
    ) -> Result<ZernikeCoefficients>;
}

/// The eye model of an estimation method
pub fn eye_model(method: EyeEstimationMethod) -> Box<dyn EyeModel> {
    match method {
        EyeEstimationMethod::Schematic => Box::new(SchematicEye::default()),
        EyeEstimationMethod::Measurement => Box::new(MeasurementEye::default()),
    }
}

/// Chromatic difference of refraction `[D]` at the wavelength `lambda` `[nm]`
///
/// Thibos et al., "The chromatic eye", Applied Optics 31(19), 1992
pub fn chromatic_refraction(lambda: f64) -> f64 {
    1.68524 - 0.63346 / (lambda * 1e-3 - 0.21410)
}

/// Spherical refractive error `[D]` of the defocus of a set of coefficients `[μm]`
pub fn refractive_error(coefficients: &ZernikeCoefficients, aperture_diameter: f64) -> f64 {
    let r2 = (aperture_diameter / 2.).powi(2);
    if r2 == 0. {
        return 0.;
    }
    -4. * 3f64.sqrt() * coefficients.coefficient(2, 0) / r2
}

/// Analytic reduced schematic eye
///
/// Myopia lengthens the eye, accommodation increases the lens power and thickness
/// and shallows the anterior chamber.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchematicEye {
    pub eye_length: f64,
    pub cornea_thickness: f64,
    pub aqueous_thickness: f64,
    pub lens_thickness: f64,
    pub lens_power: f64,
    /// Axial length change per dioptre of myopia `[mm/D]`
    pub axial_length_per_dioptre: f64,
    /// `[D/D]`
    pub lens_power_per_dioptre: f64,
    /// `[mm/D]`
    pub aqueous_per_dioptre: f64,
    /// Amplitude of accommodation `[D]`
    pub max_accommodation: f64,
    /// Oblique astigmatism `[D/deg²]`
    pub oblique_astigmatism: f64,
}
impl Default for SchematicEye {
    fn default() -> Self {
        Self {
            eye_length: 24.,
            cornea_thickness: 0.55,
            aqueous_thickness: 3.05,
            lens_thickness: 4.,
            lens_power: 21.78,
            axial_length_per_dioptre: 0.37,
            lens_power_per_dioptre: 1.,
            aqueous_per_dioptre: -0.04,
            max_accommodation: 10.,
            oblique_astigmatism: 5e-4,
        }
    }
}
impl EyeModel for SchematicEye {
    fn name(&self) -> &str {
        "schematic"
    }
    fn estimate_eye_parameters(&self, aberration: &AberrationParameters) -> Result<EyeParameters> {
        let error = refractive_error(&aberration.zernike_coefficients(), aberration.aperture_diameter);
        let eye_length = self.eye_length - self.axial_length_per_dioptre * error;
        Ok(EyeParameters::from([
            (EYE_LENGTH.into(), eye_length),
            (CORNEA_THICKNESS.into(), self.cornea_thickness),
            (AQUEOUS_THICKNESS.into(), self.aqueous_thickness),
            (LENS_THICKNESS.into(), self.lens_thickness),
            (LENS_POWER.into(), self.lens_power),
            (
                VITREOUS_THICKNESS.into(),
                eye_length - self.cornea_thickness - self.aqueous_thickness - self.lens_thickness,
            ),
            (REFRACTIVE_ERROR.into(), error),
        ]))
    }
    fn refocus(&self, relaxed: &EyeParameters, focus_distance: f64) -> Result<EyeParameters> {
        let name = self.name();
        let accommodation = if focus_distance.is_finite() && focus_distance > 0. {
            (1. / focus_distance).min(self.max_accommodation)
        } else {
            0.
        };
        let delta_lens_power = accommodation * self.lens_power_per_dioptre;
        let delta_aqueous = accommodation * self.aqueous_per_dioptre;
        let mut focused = relaxed.clone();
        focused.insert(
            LENS_POWER.into(),
            parameter(relaxed, LENS_POWER, name)? + delta_lens_power,
        );
        focused.insert(
            AQUEOUS_THICKNESS.into(),
            parameter(relaxed, AQUEOUS_THICKNESS, name)? + delta_aqueous,
        );
        focused.insert(
            LENS_THICKNESS.into(),
            parameter(relaxed, LENS_THICKNESS, name)? - delta_aqueous,
        );
        focused.insert(ACCOMMODATION.into(), accommodation);
        focused.insert(DELTA_LENS_POWER.into(), delta_lens_power);
        focused.insert(DELTA_AQUEOUS_THICKNESS.into(), delta_aqueous);
        Ok(focused)
    }
    fn estimate_aberration_coefficients(
        &self,
        focused: &EyeParameters,
        aberration: &AberrationParameters,
        angles: (f64, f64),
        lambda: f64,
        aperture_diameter: f64,
    ) -> Result<ZernikeCoefficients> {
        let accommodation = parameter(focused, ACCOMMODATION, self.name())?;
        if aperture_diameter > aberration.aperture_diameter {
            log::warn!(
                "Extrapolating the aberration measured over {}mm to {}mm",
                aberration.aperture_diameter,
                aperture_diameter
            );
        }
        let ratio = if aberration.aperture_diameter > 0. {
            aperture_diameter / aberration.aperture_diameter
        } else {
            1.
        };
        let mut coefficients = rescale_aperture(&aberration.zernike_coefficients(), ratio);

        let field = angles.0.hypot(angles.1);
        let lens = SpectacleLens {
            sphere: chromatic_refraction(lambda) - chromatic_refraction(aberration.lambda)
                - accommodation,
            cylinder: -self.oblique_astigmatism * field * field,
            axis: angles.1.atan2(angles.0),
        };
        coefficients
            .iter_mut()
            .zip(spectacle_to_zernike(&lens, aperture_diameter).iter())
            .for_each(|(c, s)| *c += s);
        Ok(coefficients)
    }
}

/// Measured aberrations used as is, with a fixed anatomy
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeasurementEye {
    pub anatomy: SchematicEye,
}
impl EyeModel for MeasurementEye {
    fn name(&self) -> &str {
        "measurement"
    }
    fn estimate_eye_parameters(&self, _aberration: &AberrationParameters) -> Result<EyeParameters> {
        let eye = &self.anatomy;
        Ok(EyeParameters::from([
            (EYE_LENGTH.into(), eye.eye_length),
            (CORNEA_THICKNESS.into(), eye.cornea_thickness),
            (AQUEOUS_THICKNESS.into(), eye.aqueous_thickness),
            (LENS_THICKNESS.into(), eye.lens_thickness),
            (LENS_POWER.into(), eye.lens_power),
            (
                VITREOUS_THICKNESS.into(),
                eye.eye_length - eye.cornea_thickness - eye.aqueous_thickness - eye.lens_thickness,
            ),
        ]))
    }
    fn refocus(&self, relaxed: &EyeParameters, _focus_distance: f64) -> Result<EyeParameters> {
        let mut focused = relaxed.clone();
        for name in [ACCOMMODATION, DELTA_LENS_POWER, DELTA_AQUEOUS_THICKNESS] {
            focused.insert(name.into(), 0.);
        }
        Ok(focused)
    }
    fn estimate_aberration_coefficients(
        &self,
        _focused: &EyeParameters,
        aberration: &AberrationParameters,
        _angles: (f64, f64),
        _lambda: f64,
        _aperture_diameter: f64,
    ) -> Result<ZernikeCoefficients> {
        Ok(aberration.zernike_coefficients())
    }
}

/// Mean absolute value, mean absolute error and mean absolute percentage error
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErrorMetrics {
    pub mean_abs: f64,
    pub mae: f64,
    pub mape: f64,
    pub count: usize,
}
impl ErrorMetrics {
    /// Denominator floor of the percentage error
    pub const EPSILON: f64 = 1e-3;

    pub fn accumulate(&mut self, predicted: f64, expected: f64) {
        let error = (predicted - expected).abs();
        self.mean_abs += expected.abs();
        self.mae += error;
        self.mape += error / expected.abs().max(Self::EPSILON);
        self.count += 1;
    }
    /// Accumulates every coefficient but piston
    pub fn accumulate_coefficients(
        &mut self,
        predicted: &ZernikeCoefficients,
        expected: &ZernikeCoefficients,
    ) {
        predicted
            .indexed()
            .skip(1)
            .zip(expected.indexed().skip(1))
            .for_each(|((_, p), (_, e))| self.accumulate(p, e));
    }
    /// The averaged metrics
    pub fn average(&self) -> Self {
        if self.count == 0 {
            return *self;
        }
        let n = self.count as f64;
        Self {
            mean_abs: self.mean_abs / n,
            mae: self.mae / n,
            mape: self.mape / n,
            count: self.count,
        }
    }
}
impl std::fmt::Display for ErrorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean |x|: {:.3e}, MAE: {:.3e}, MAPE: {:.2}% ({} samples)",
            self.mean_abs,
            self.mae,
            100. * self.mape,
            self.count
        )
    }
}
