/*!
# PSF stack configuration

[`PsfStackParameters`] holds every setting of a PSF stack computation and [`AberrationParameters`]
describes the aberration of the eye. Both are serializable and can be saved to and loaded from
pickle files:
```no_run
use psf_stack::config::PsfStackParameters;

let params = PsfStackParameters::default()
    .lambdas(vec![550.])
    .beta_degrees(12);
params.dump("psf_stack.pkl").unwrap();
let params = PsfStackParameters::load("psf_stack.pkl").unwrap();
```
*/

use std::{fs::File, path::Path};

use serde::{Deserialize, Serialize};
use serde_pickle as pickle;
use strum_macros::{Display, EnumIter, EnumString, VariantNames};

use crate::{
    backend::ExecutionBackend,
    coefficients::{spectacle_to_zernike, AlphaToBetaCoefficient, SpectacleLens},
    coefficients::alpha_to_beta::SamplingMethod,
    psf::InterpolationType,
    ranges::{EvaluatedParameters, ParameterRange},
    threading::Distribution,
    zernike::ZernikeCoefficients,
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to open the configuration file")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize the configuration")]
    Pickle(#[from] serde_pickle::Error),
}
type Result<T> = std::result::Result<T, ConfigError>;

/// Eye model used to estimate the eye parameters
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    VariantNames,
)]
#[strum(ascii_case_insensitive)]
pub enum EyeEstimationMethod {
    /// Analytic schematic eye
    #[default]
    Schematic,
    /// Measured aberrations used as is
    Measurement,
}

/// How the aberration is described
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumIter, EnumString, Display,
)]
#[strum(ascii_case_insensitive)]
pub enum AberrationType {
    Spectacle,
    #[default]
    Preset,
}

/// Measured aberration of the eye
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AberrationParameters {
    pub refractive_index: f64,
    /// Aperture diameter of the measurement `[mm]`
    pub aperture_diameter: f64,
    /// Wavelength of the measurement `[nm]`
    pub lambda: f64,
    pub aberration_type: AberrationType,
    pub spectacle_lens: SpectacleLens,
    /// Zernike coefficients `[μm]`
    pub coefficients: ZernikeCoefficients,
    /// Name of the aberration preset
    pub name: String,
}
impl Default for AberrationParameters {
    fn default() -> Self {
        Self {
            refractive_index: 1.337,
            aperture_diameter: 5.,
            lambda: 587.56,
            aberration_type: AberrationType::default(),
            spectacle_lens: SpectacleLens::default(),
            coefficients: ZernikeCoefficients::default(),
            name: String::new(),
        }
    }
}
impl AberrationParameters {
    /// Aberration given by a spectacle lens prescription
    pub fn spectacle(lens: SpectacleLens) -> Self {
        Self {
            aberration_type: AberrationType::Spectacle,
            spectacle_lens: lens,
            ..Default::default()
        }
    }
    /// Aberration given by Zernike coefficients
    pub fn preset(coefficients: ZernikeCoefficients) -> Self {
        Self {
            aberration_type: AberrationType::Preset,
            coefficients,
            ..Default::default()
        }
    }
    pub fn aperture_diameter(self, aperture_diameter: f64) -> Self {
        Self {
            aperture_diameter,
            ..self
        }
    }
    pub fn lambda(self, lambda: f64) -> Self {
        Self { lambda, ..self }
    }
    /// The Zernike coefficients of the aberration
    pub fn zernike_coefficients(&self) -> ZernikeCoefficients {
        match self.aberration_type {
            AberrationType::Spectacle => {
                spectacle_to_zernike(&self.spectacle_lens, self.aperture_diameter)
            }
            AberrationType::Preset => self.coefficients.clone(),
        }
    }
}

/// PSF stack computation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfStackParameters {
    pub backend: ExecutionBackend,
    /// Object distances `[D]`
    pub object_distances: ParameterRange,
    /// Horizontal incidence angles `[deg]`
    pub angles_horizontal: ParameterRange,
    /// Vertical incidence angles `[deg]`
    pub angles_vertical: ParameterRange,
    /// Aperture diameters `[mm]`
    pub aperture_diameters: ParameterRange,
    /// Focus distances `[D]`
    pub focus_distances: ParameterRange,
    /// Wavelengths `[nm]`
    pub lambdas: Vec<f64>,

    pub manual_defocus: bool,
    pub manual_coefficients: bool,
    pub desired_coefficients: ZernikeCoefficients,
    pub desired_defocus: f64,
    /// `[mm]`
    pub desired_pupil_retina_distance: f64,

    pub eye_estimation_method: EyeEstimationMethod,

    pub alpha_to_beta_coefficient: AlphaToBetaCoefficient,
    pub alpha_to_beta_l_sampling: SamplingMethod,
    pub alpha_to_beta_k_sampling: SamplingMethod,
    pub alpha_to_beta_l: usize,
    pub alpha_to_beta_k: usize,
    pub beta_degrees: usize,
    pub beta_threshold: f64,

    pub approximation_sample_size: f64,
    pub approximation_terms_multiplier: f64,
    pub approximation_terms_min: usize,
    pub approximation_terms_max: usize,
    pub max_approximation_samples: usize,
    pub bessel_batch_size: usize,
    pub precompute_vnm_l_sum: bool,

    pub min_sampling_units: f64,
    pub max_sampling_units: f64,
    pub psf_sample_size_multiplier: f64,
    pub psf_sample_count_multiplier: f64,
    pub psf_samples_min: usize,
    pub psf_samples_max: usize,

    pub interpolation_type: InterpolationType,
    /// 1 disables the cropping
    pub crop_threshold_sum: f64,
    /// 0 disables the cropping
    pub crop_threshold_coeff: f64,

    pub omit_vnm_calculation: bool,
    pub omit_psf_calculation: bool,
    pub log_progress: bool,
    pub log_stats: bool,
    pub log_debug: bool,

    /// 0 uses every available core
    pub num_threads: usize,
    pub distribution: Distribution,
}
impl Default for PsfStackParameters {
    fn default() -> Self {
        Self {
            backend: ExecutionBackend::Gpu,
            object_distances: ParameterRange::new(0.125, 10.125, 41),
            angles_horizontal: ParameterRange::constant(0.),
            angles_vertical: ParameterRange::constant(0.),
            aperture_diameters: ParameterRange::constant(5.),
            focus_distances: ParameterRange::constant(0.125),
            lambdas: vec![612., 549., 464.],
            manual_defocus: false,
            manual_coefficients: false,
            desired_coefficients: ZernikeCoefficients::default(),
            desired_defocus: 0.,
            desired_pupil_retina_distance: 0.,
            eye_estimation_method: EyeEstimationMethod::default(),
            alpha_to_beta_coefficient: AlphaToBetaCoefficient::AlphaPhaseCumulative,
            alpha_to_beta_l_sampling: SamplingMethod::Linear,
            alpha_to_beta_k_sampling: SamplingMethod::Cosine,
            alpha_to_beta_l: 350,
            alpha_to_beta_k: 6,
            beta_degrees: 30,
            beta_threshold: 0.,
            approximation_sample_size: 0.2,
            approximation_terms_multiplier: 80.,
            approximation_terms_min: 100,
            approximation_terms_max: 1100,
            max_approximation_samples: 3800,
            bessel_batch_size: 50,
            precompute_vnm_l_sum: true,
            min_sampling_units: 2.,
            max_sampling_units: 50.,
            psf_sample_size_multiplier: 0.5,
            psf_sample_count_multiplier: 25.,
            psf_samples_min: 300,
            psf_samples_max: 300,
            interpolation_type: InterpolationType::Area,
            crop_threshold_sum: 1.,
            crop_threshold_coeff: 0.,
            omit_vnm_calculation: false,
            omit_psf_calculation: false,
            log_progress: false,
            log_stats: false,
            log_debug: false,
            num_threads: 0,
            distribution: Distribution::default(),
        }
    }
}
impl PsfStackParameters {
    /// Loads the parameters from a pickle file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::info!("Loading {:?}...", path.as_ref());
        let mut file = File::open(path)?;
        Ok(pickle::from_reader(&mut file, Default::default())?)
    }
    /// Saves the parameters to a pickle file
    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        pickle::to_writer(&mut file, self, Default::default())?;
        Ok(())
    }
    pub fn backend(self, backend: ExecutionBackend) -> Self {
        Self { backend, ..self }
    }
    pub fn object_distances(self, object_distances: ParameterRange) -> Self {
        Self {
            object_distances,
            ..self
        }
    }
    pub fn angles(self, horizontal: ParameterRange, vertical: ParameterRange) -> Self {
        Self {
            angles_horizontal: horizontal,
            angles_vertical: vertical,
            ..self
        }
    }
    pub fn aperture_diameters(self, aperture_diameters: ParameterRange) -> Self {
        Self {
            aperture_diameters,
            ..self
        }
    }
    pub fn focus_distances(self, focus_distances: ParameterRange) -> Self {
        Self {
            focus_distances,
            ..self
        }
    }
    pub fn lambdas(self, lambdas: Vec<f64>) -> Self {
        Self { lambdas, ..self }
    }
    /// Uses the given defocus parameter for every PSF
    pub fn manual_defocus(self, defocus: f64) -> Self {
        Self {
            manual_defocus: true,
            desired_defocus: defocus,
            ..self
        }
    }
    /// Uses the given coefficients and pupil-retina distance `[mm]` instead of the eye model
    pub fn manual_coefficients(
        self,
        coefficients: ZernikeCoefficients,
        pupil_retina_distance: f64,
    ) -> Self {
        Self {
            manual_coefficients: true,
            desired_coefficients: coefficients,
            desired_pupil_retina_distance: pupil_retina_distance,
            ..self
        }
    }
    pub fn eye_estimation_method(self, eye_estimation_method: EyeEstimationMethod) -> Self {
        Self {
            eye_estimation_method,
            ..self
        }
    }
    pub fn alpha_to_beta_coefficient(self, alpha_to_beta_coefficient: AlphaToBetaCoefficient) -> Self {
        Self {
            alpha_to_beta_coefficient,
            ..self
        }
    }
    /// Pupil sampling of the alpha to beta conversion: `l` angular and `k` radial samples
    pub fn alpha_to_beta_sampling(
        self,
        l_sampling: SamplingMethod,
        l: usize,
        k_sampling: SamplingMethod,
        k: usize,
    ) -> Self {
        Self {
            alpha_to_beta_l_sampling: l_sampling,
            alpha_to_beta_l: l,
            alpha_to_beta_k_sampling: k_sampling,
            alpha_to_beta_k: k,
            ..self
        }
    }
    pub fn beta_degrees(self, beta_degrees: usize) -> Self {
        Self {
            beta_degrees,
            ..self
        }
    }
    pub fn beta_threshold(self, beta_threshold: f64) -> Self {
        Self {
            beta_threshold,
            ..self
        }
    }
    /// Approximation sample size and the maximum number of samples
    pub fn approximation_samples(self, sample_size: f64, max_samples: usize) -> Self {
        Self {
            approximation_sample_size: sample_size,
            max_approximation_samples: max_samples,
            ..self
        }
    }
    /// Multiplier and bounds of the number of approximation terms
    pub fn approximation_terms(self, multiplier: f64, min: usize, max: usize) -> Self {
        Self {
            approximation_terms_multiplier: multiplier,
            approximation_terms_min: min,
            approximation_terms_max: max,
            ..self
        }
    }
    pub fn bessel_batch_size(self, bessel_batch_size: usize) -> Self {
        Self {
            bessel_batch_size,
            ..self
        }
    }
    pub fn precompute_vnm_l_sum(self, precompute_vnm_l_sum: bool) -> Self {
        Self {
            precompute_vnm_l_sum,
            ..self
        }
    }
    pub fn sampling_units(self, min: f64, max: f64) -> Self {
        Self {
            min_sampling_units: min,
            max_sampling_units: max,
            ..self
        }
    }
    /// Bounds of the number of PSF samples
    pub fn psf_samples(self, min: usize, max: usize) -> Self {
        Self {
            psf_samples_min: min,
            psf_samples_max: max,
            ..self
        }
    }
    pub fn interpolation_type(self, interpolation_type: InterpolationType) -> Self {
        Self {
            interpolation_type,
            ..self
        }
    }
    pub fn crop_thresholds(self, sum: f64, coeff: f64) -> Self {
        Self {
            crop_threshold_sum: sum,
            crop_threshold_coeff: coeff,
            ..self
        }
    }
    pub fn log_progress(self, log_progress: bool) -> Self {
        Self {
            log_progress,
            ..self
        }
    }
    pub fn log_stats(self, log_stats: bool) -> Self {
        Self { log_stats, ..self }
    }
    pub fn log_debug(self, log_debug: bool) -> Self {
        Self { log_debug, ..self }
    }
    pub fn num_threads(self, num_threads: usize) -> Self {
        Self {
            num_threads,
            ..self
        }
    }
    pub fn distribution(self, distribution: Distribution) -> Self {
        Self {
            distribution,
            ..self
        }
    }
    /// Samples every axis of the PSF grid
    pub fn evaluate(&self) -> EvaluatedParameters {
        EvaluatedParameters {
            object_distances: self.object_distances.expand_dioptres(),
            object_dioptres: self.object_distances.expand(),
            angles_horizontal: self.angles_horizontal.expand(),
            angles_vertical: self.angles_vertical.expand(),
            lambdas: self.lambdas.clone(),
            aperture_diameters: self.aperture_diameters.expand(),
            focus_distances: self.focus_distances.expand_dioptres(),
            focus_dioptres: self.focus_distances.expand(),
        }
    }
}
