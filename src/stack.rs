/*!
# PSF stack

[`PsfStack`] computes the PSFs of a model eye over the 6-dimensional parameter grid
`[object distance, horizontal angle, vertical angle, wavelength, aperture, focus distance]`.

A computation goes through the following phases, in order:
 1. the parameter ranges are evaluated,
 2. the GPU is synchronized,
 3. the eye parameters: relaxed eye, focused eyes and aberration coefficients with their beta conversion,
 4. the PSF parameters: per PSF units, ENZ sampling and the ENZ tables,
 5. the PSFs, on the host or on the GPU.

The [`ComputationMask`] selects the phases to run, the others reuse the results of previous passes.
The ENZ tables are kept across passes and only rebuilt when the configuration they were built for changes.

```no_run
use psf_stack::{config::{AberrationParameters, PsfStackParameters}, stack::{ComputationMask, PsfStack}};

let mut stack = PsfStack::new(PsfStackParameters::default().lambdas(vec![550.]));
stack.compute(&AberrationParameters::default(), ComputationMask::EVERYTHING).unwrap();
for psf in stack.psfs.iter() {
    println!("{}x{}", psf.kernel_size, psf.kernel_size);
}
```
*/

use std::{fmt, ops::BitOr, time::Instant};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    backend::{cpu, gpu, ExecutionBackend, GpuDevice, GpuError, ReferenceDevice},
    coefficients::{AberrationCoefficients, AlphaToBeta, SamplingMethod},
    config::{AberrationParameters, PsfStackParameters},
    defocus::PsfEntryParams,
    enz::{
        Cache, CacheKey, CylindricalBessel, EnzSampling, EnzTables, SphericalBessel, SphericalKey,
        VnmInner, VnmInnerKey, Wkl,
    },
    eye::{eye_model, pupil_retina_distance, EyeError, EyeModel, EyeParameters},
    psf::{PsfEntry, PsfError},
    ranges::{coefficient_index, focused_index, EvaluatedParameters, NdArray},
    threading::{threaded_map, ThreadedExecuteParams},
};

#[derive(thiserror::Error, Debug)]
pub enum StackError {
    #[error("eye model failed")]
    Eye(#[from] EyeError),
    #[error("PSF computation failed")]
    Psf(#[from] PsfError),
    #[error("GPU computation failed")]
    Gpu(#[from] GpuError),
    #[error("{name} has shape {found:?}, expected {expected:?}")]
    Dimension {
        name: &'static str,
        found: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("the alpha to beta conversion returned no coefficients")]
    EmptyBeta,
}
type Result<T> = std::result::Result<T, StackError>;

/// Phases of a stack computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ComputationMask(u32);
impl ComputationMask {
    pub const NONE: Self = Self(0);
    pub const RELAXED_EYE_PARAMETERS: Self = Self(1 << 8);
    pub const FOCUSED_EYE_PARAMETERS: Self = Self(1 << 9);
    pub const ABERRATION_COEFFICIENTS: Self = Self(1 << 10);
    pub const PSF_UNITS: Self = Self(1 << 16);
    pub const PSF_ENZ_COEFFICIENTS: Self = Self(1 << 17);
    pub const PSF_BESSEL_TERMS: Self = Self(1 << 18);
    pub const PSFS: Self = Self(1 << 24);

    pub const EYE_PARAMETERS: Self = Self(
        Self::RELAXED_EYE_PARAMETERS.0 | Self::FOCUSED_EYE_PARAMETERS.0 | Self::ABERRATION_COEFFICIENTS.0,
    );
    pub const PSF_PARAMETERS: Self =
        Self(Self::PSF_UNITS.0 | Self::PSF_ENZ_COEFFICIENTS.0 | Self::PSF_BESSEL_TERMS.0);
    pub const EVERYTHING: Self = Self(Self::EYE_PARAMETERS.0 | Self::PSF_PARAMETERS.0 | Self::PSFS.0);

    pub fn bits(&self) -> u32 {
        self.0
    }
    /// Checks if any of the phases of `other` is selected
    pub fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
    /// Checks if all the phases of `other` are selected
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}
impl BitOr for ComputationMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl fmt::Display for ComputationMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::RELAXED_EYE_PARAMETERS, "relaxed"),
            (Self::FOCUSED_EYE_PARAMETERS, "focused"),
            (Self::ABERRATION_COEFFICIENTS, "coefficients"),
            (Self::PSF_UNITS, "units"),
            (Self::PSF_ENZ_COEFFICIENTS, "enz"),
            (Self::PSF_BESSEL_TERMS, "bessel"),
            (Self::PSFS, "psfs"),
        ];
        let selected = names
            .iter()
            .filter(|(mask, _)| self.contains(*mask))
            .map(|(_, name)| name)
            .join("|");
        write!(f, "[{selected}]")
    }
}

/// Tag of the last computation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastComputed {
    pub mask: ComputationMask,
    pub backend: ExecutionBackend,
    /// Monotonically increasing pass counter
    pub pass: usize,
}

/// Configuration of the alpha to beta converter
#[derive(Debug, Clone, Copy, PartialEq)]
struct ConverterKey {
    beta_degrees: usize,
    l_sampling: SamplingMethod,
    l: usize,
    k_sampling: SamplingMethod,
    k: usize,
}
impl From<&PsfStackParameters> for ConverterKey {
    fn from(settings: &PsfStackParameters) -> Self {
        Self {
            beta_degrees: settings.beta_degrees,
            l_sampling: settings.alpha_to_beta_l_sampling,
            l: settings.alpha_to_beta_l,
            k_sampling: settings.alpha_to_beta_k_sampling,
            k: settings.alpha_to_beta_k,
        }
    }
}

/// The PSFs of a model eye over the parameter grid, with the data they are derived from
pub struct PsfStack {
    pub settings: PsfStackParameters,
    /// The aberration of the last pass
    pub aberration: AberrationParameters,
    pub evaluated: EvaluatedParameters,
    /// Relaxed eye
    pub relaxed: EyeParameters,
    /// Focused eyes, `[aperture, focus]`
    pub focused: NdArray<EyeParameters, 2>,
    /// `[horizontal angle, vertical angle, wavelength, aperture, focus]`
    pub coefficients: NdArray<AberrationCoefficients, 5>,
    pub entries: NdArray<PsfEntryParams, 6>,
    pub psfs: NdArray<PsfEntry, 6>,
    pub enz: EnzSampling,
    pub wkl: Cache<CacheKey, Wkl>,
    pub cylindrical: Cache<CacheKey, CylindricalBessel>,
    pub spherical: Cache<SphericalKey, SphericalBessel>,
    pub vnm_inner: Cache<VnmInnerKey, VnmInner>,
    converter: Option<(ConverterKey, AlphaToBeta)>,
    device: Box<dyn GpuDevice>,
    uploads: gpu::GpuUploads,
    last_computed: Option<LastComputed>,
    passes: usize,
}
impl fmt::Debug for PsfStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PsfStack")
            .field("shape", &self.evaluated.psf_shape())
            .field("last_computed", &self.last_computed)
            .field("device", &self.device)
            .finish()
    }
}
impl PsfStack {
    /// Creates a stack computing on the GPU with a [`ReferenceDevice`]
    pub fn new(settings: PsfStackParameters) -> Self {
        Self::with_device(settings, Box::new(ReferenceDevice::new()))
    }
    /// Creates a stack computing on the GPU with `device`
    pub fn with_device(settings: PsfStackParameters, device: Box<dyn GpuDevice>) -> Self {
        Self {
            settings,
            aberration: AberrationParameters::default(),
            evaluated: EvaluatedParameters::default(),
            relaxed: EyeParameters::new(),
            focused: NdArray::default(),
            coefficients: NdArray::default(),
            entries: NdArray::default(),
            psfs: NdArray::default(),
            enz: EnzSampling::default(),
            wkl: Cache::default(),
            cylindrical: Cache::default(),
            spherical: Cache::default(),
            vnm_inner: Cache::default(),
            converter: None,
            device,
            uploads: gpu::GpuUploads::default(),
            last_computed: None,
            passes: 0,
        }
    }
    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }
    /// Tag of the last completed pass
    pub fn last_computed(&self) -> Option<&LastComputed> {
        self.last_computed.as_ref()
    }
    /// Number of PSFs
    pub fn len(&self) -> usize {
        self.psfs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.psfs.is_empty()
    }
    /// Deletes the ENZ tables from the GPU
    pub fn free_gpu_resources(&mut self) {
        gpu::free_cache_resources(self.device.as_mut(), &mut self.uploads);
        if self
            .vnm_inner
            .key()
            .is_some_and(|inner| inner.key.backend == Some(ExecutionBackend::Gpu))
        {
            self.vnm_inner.invalidate();
        }
    }

    /// Key of the Vnm inner terms summed from the current Wkl and cylindrical Bessel tables
    fn vnm_inner_key(&self) -> VnmInnerKey {
        VnmInnerKey {
            key: self.enz.vnm_inner_key(self.settings.backend),
            wkl_builds: self.wkl.builds(),
            cylindrical_builds: self.cylindrical.builds(),
        }
    }

    fn threads(&self, label: &str, item_name: &str) -> ThreadedExecuteParams {
        ThreadedExecuteParams::new(label)
            .item_name(item_name)
            .num_threads(self.settings.num_threads)
            .distribution(self.settings.distribution)
            .progress(self.settings.log_progress)
    }
    fn stats(&self, label: &str, now: Instant) {
        if self.settings.log_stats {
            log::info!("{label} computed in {}ms", now.elapsed().as_millis());
        }
    }

    /// Computes the phases selected by `mask` for the aberration `aberration`
    pub fn compute(&mut self, aberration: &AberrationParameters, mask: ComputationMask) -> Result<()> {
        let now = Instant::now();
        self.passes += 1;
        log::debug!(
            "PSF stack pass #{} {mask} on {}",
            self.passes,
            self.settings.backend
        );
        self.aberration = aberration.clone();

        self.evaluated = self.settings.evaluate();
        self.sync_gpu();

        let model = eye_model(self.settings.eye_estimation_method);
        if mask.contains(ComputationMask::RELAXED_EYE_PARAMETERS) {
            self.compute_relaxed(model.as_ref())?;
        }
        if mask.contains(ComputationMask::FOCUSED_EYE_PARAMETERS) {
            self.compute_focused(model.as_ref())?;
        }
        if mask.contains(ComputationMask::ABERRATION_COEFFICIENTS) {
            self.compute_coefficients(model.as_ref())?;
        }
        if mask.contains(ComputationMask::PSF_UNITS) {
            self.compute_entries(model.as_ref())?;
        }
        if mask.intersects(ComputationMask::PSF_PARAMETERS) {
            self.enz = EnzSampling::new(&self.settings, self.entries.as_slice());
        }
        if mask.contains(ComputationMask::PSF_ENZ_COEFFICIENTS) {
            self.compute_wkl()?;
        }
        if mask.contains(ComputationMask::PSF_BESSEL_TERMS) {
            self.compute_bessel()?;
        }
        if mask.intersects(ComputationMask::PSF_ENZ_COEFFICIENTS | ComputationMask::PSF_BESSEL_TERMS) {
            self.compute_vnm_inner()?;
        }
        if mask.contains(ComputationMask::PSFS) {
            self.compute_psfs()?;
        }

        self.last_computed = Some(LastComputed {
            mask,
            backend: self.settings.backend,
            pass: self.passes,
        });
        self.stats("PSF stack", now);
        Ok(())
    }

    /// Waits for the GPU and releases its tables when computing on the host
    fn sync_gpu(&mut self) {
        self.device.wait_for_gpu();
        if self.settings.backend == ExecutionBackend::Cpu && self.uploads != gpu::GpuUploads::default() {
            log::debug!("Releasing the GPU tables");
            self.free_gpu_resources();
        }
    }

    fn compute_relaxed(&mut self, model: &dyn EyeModel) -> Result<()> {
        let now = Instant::now();
        self.relaxed = if self.settings.manual_coefficients {
            EyeParameters::new()
        } else {
            model.estimate_eye_parameters(&self.aberration)?
        };
        self.stats("Relaxed eye parameters", now);
        Ok(())
    }

    fn compute_focused(&mut self, model: &dyn EyeModel) -> Result<()> {
        let now = Instant::now();
        let shape = self.evaluated.focused_shape();
        if self.settings.manual_coefficients {
            self.focused = NdArray::new(shape);
            return Ok(());
        }
        let focus_distances = &self.evaluated.focus_distances;
        let relaxed = &self.relaxed;
        let focused: Vec<std::result::Result<EyeParameters, EyeError>> = threaded_map(
            &self.threads("Focused eye parameters", "eye"),
            shape,
            |[_, f]| model.refocus(relaxed, focus_distances[f]),
        );
        let focused = focused.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;
        self.focused = NdArray::from_vec(shape, focused).ok_or(StackError::Dimension {
            name: "focused eye parameters",
            found: vec![],
            expected: shape.to_vec(),
        })?;
        self.stats("Focused eye parameters", now);
        Ok(())
    }

    fn compute_coefficients(&mut self, model: &dyn EyeModel) -> Result<()> {
        let now = Instant::now();
        let shape = self.evaluated.coefficient_shape();
        let expected = self.evaluated.focused_shape();
        if !self.settings.manual_coefficients && *self.focused.shape() != expected {
            log::error!(
                "Focused eye parameters have shape {:?}, expected {:?}",
                self.focused.shape(),
                expected
            );
            return Err(StackError::Dimension {
                name: "focused eye parameters",
                found: self.focused.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        let settings = &self.settings;
        let evaluated = &self.evaluated;
        let aberration = &self.aberration;
        let focused = &self.focused;
        let coefficients: Vec<std::result::Result<AberrationCoefficients, EyeError>> = threaded_map(
            &self.threads("Aberration coefficients", "coefficient set"),
            shape,
            |[h, v, l, a, f]| {
                let lambda = evaluated.lambdas[l];
                let alpha = if settings.manual_coefficients {
                    settings.desired_coefficients.clone()
                } else {
                    model.estimate_aberration_coefficients(
                        &focused[[a, f]],
                        aberration,
                        (evaluated.angles_horizontal[h], evaluated.angles_vertical[v]),
                        lambda,
                        evaluated.aperture_diameters[a],
                    )?
                };
                let mut coefficients = AberrationCoefficients::new(alpha);
                coefficients.update_phases(lambda);
                Ok(coefficients)
            },
        );
        let mut coefficients = coefficients
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.stats("Aberration coefficients", now);

        let now = Instant::now();
        let key = ConverterKey::from(&self.settings);
        if !matches!(&self.converter, Some((k, _)) if *k == key) {
            log::debug!("Building the alpha to beta converter for degree {}", key.beta_degrees);
            self.converter = Some((
                key,
                AlphaToBeta::new(key.beta_degrees, key.l_sampling, key.l, key.k_sampling, key.k),
            ));
        }
        if let Some((_, converter)) = &self.converter {
            let variant = self.settings.alpha_to_beta_coefficient;
            let alphas: Vec<_> = coefficients.iter().map(|c| c.select(variant)).collect();
            let betas = converter.convert_batch(&alphas);
            if betas.iter().any(|beta| beta.is_empty()) {
                log::error!("The alpha to beta conversion has no pupil bins");
                return Err(StackError::EmptyBeta);
            }
            coefficients
                .iter_mut()
                .zip(betas)
                .for_each(|(c, beta)| c.beta = beta);
        }
        self.coefficients = NdArray::from_vec(shape, coefficients).ok_or(StackError::Dimension {
            name: "aberration coefficients",
            found: vec![],
            expected: shape.to_vec(),
        })?;
        self.stats("Beta coefficients", now);
        Ok(())
    }

    fn compute_entries(&mut self, model: &dyn EyeModel) -> Result<()> {
        let now = Instant::now();
        let expected = self.evaluated.coefficient_shape();
        if *self.coefficients.shape() != expected {
            log::error!(
                "Aberration coefficients have shape {:?}, expected {:?}",
                self.coefficients.shape(),
                expected
            );
            return Err(StackError::Dimension {
                name: "aberration coefficients",
                found: self.coefficients.shape().to_vec(),
                expected: expected.to_vec(),
            });
        }

        let shape = self.evaluated.psf_shape();
        let settings = &self.settings;
        let evaluated = &self.evaluated;
        let coefficients = &self.coefficients;
        let focused = &self.focused;
        let refractive_index = self.aberration.refractive_index;
        let entries: Vec<std::result::Result<PsfEntryParams, EyeError>> = threaded_map(
            &self.threads("PSF parameters", "PSF"),
            shape,
            |index| {
                let prd = if settings.manual_coefficients {
                    settings.desired_pupil_retina_distance
                } else {
                    pupil_retina_distance(&focused[focused_index(&index)], model.name())?
                };
                Ok(PsfEntryParams::new(
                    settings,
                    &evaluated.at(&index),
                    prd,
                    refractive_index,
                    coefficients[coefficient_index(&index)].clone(),
                ))
            },
        );
        let entries = entries.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;
        self.entries = NdArray::from_vec(shape, entries).ok_or(StackError::Dimension {
            name: "PSF parameters",
            found: vec![],
            expected: shape.to_vec(),
        })?;
        self.stats("PSF parameters", now);
        Ok(())
    }

    fn compute_wkl(&mut self) -> Result<()> {
        let now = Instant::now();
        let params = self.threads("Wkl", "coefficient");
        let enz = &self.enz;
        if self.wkl.update(enz.wkl_key(), || {
            Ok::<_, StackError>(Wkl::new(enz.max_degree, enz.max_order, &params))
        })? {
            self.stats("Wkl", now);
        }
        Ok(())
    }

    fn compute_bessel(&mut self) -> Result<()> {
        self.compute_cylindrical()?;
        self.compute_spherical()
    }

    fn compute_cylindrical(&mut self) -> Result<()> {
        let now = Instant::now();
        let batch_size = self.settings.bessel_batch_size;
        let enz = &self.enz;
        let params = self.threads("Cylindrical Bessel", "sample");
        if self
            .cylindrical
            .update(enz.cylindrical_key(), || {
                Ok::<_, StackError>(CylindricalBessel::new(
                    &enz.radius,
                    enz.max_term_order,
                    batch_size,
                    &params,
                ))
            })?
        {
            self.stats("Cylindrical Bessel", now);
        }
        Ok(())
    }

    fn compute_spherical(&mut self) -> Result<()> {
        let now = Instant::now();
        let batch_size = self.settings.bessel_batch_size;
        let enz = &self.enz;
        let params = self.threads("Spherical Bessel", "PSF");
        if self
            .spherical
            .update(enz.spherical_key(), || {
                Ok::<_, StackError>(SphericalBessel::new(
                    &enz.defocus_params,
                    enz.max_order,
                    batch_size,
                    &params,
                ))
            })?
        {
            self.stats("Spherical Bessel", now);
        }
        Ok(())
    }

    /// Rebuilds the tables read by `stage` which do not match the ENZ sampling
    fn refresh_tables(&mut self, stage: &str, spherical: bool) -> Result<()> {
        if !self.wkl.is_current(&self.enz.wkl_key()) {
            log::debug!("{stage}: rebuilding the outdated Wkl table");
            self.compute_wkl()?;
        }
        if !self.cylindrical.is_current(&self.enz.cylindrical_key()) {
            log::debug!("{stage}: rebuilding the outdated cylindrical Bessel table");
            self.compute_cylindrical()?;
        }
        if spherical && !self.spherical.is_current(&self.enz.spherical_key()) {
            log::debug!("{stage}: rebuilding the outdated spherical Bessel table");
            self.compute_spherical()?;
        }
        Ok(())
    }

    fn compute_vnm_inner(&mut self) -> Result<()> {
        if !self.settings.precompute_vnm_l_sum {
            return Ok(());
        }
        self.refresh_tables("Vnm inner terms", false)?;
        let now = Instant::now();
        let key = self.vnm_inner_key();
        let rebuilt = match self.settings.backend {
            ExecutionBackend::Cpu => {
                let params = self.threads("Vnm inner terms", "coefficient");
                let (wkl, cylindrical) = (self.wkl.value(), self.cylindrical.value());
                self.vnm_inner.update(key, || {
                    Ok::<_, StackError>(VnmInner::new(wkl, cylindrical, &params))
                })?
            }
            ExecutionBackend::Gpu => {
                if !self.device.has_buffer(gpu::VNM_INNER_BUFFER) {
                    self.vnm_inner.invalidate();
                }
                gpu::upload_tables(
                    self.device.as_mut(),
                    &mut self.uploads,
                    (self.wkl.value(), self.wkl.builds()),
                    (self.cylindrical.value(), self.cylindrical.builds()),
                    (self.spherical.value(), self.spherical.builds()),
                )?;
                let uniforms = gpu::EnzUniforms::new(
                    &self.enz,
                    self.cylindrical.value(),
                    self.entries.len(),
                );
                let device = self.device.as_mut();
                let enz = &self.enz;
                self.vnm_inner.update(key, || {
                    gpu::compute_vnm_inner(device, &uniforms, enz).map_err(StackError::from)
                })?
            }
        };
        if rebuilt {
            self.stats("Vnm inner terms", now);
        }
        Ok(())
    }

    fn compute_psfs(&mut self) -> Result<()> {
        let now = Instant::now();
        let shape = self.evaluated.psf_shape();
        let num_psfs = self.evaluated.num_psfs();
        if *self.entries.shape() == shape {
            self.refresh_tables("PSFs", true)?;
        }
        if *self.entries.shape() != shape || self.spherical.value().num_psfs() != num_psfs {
            log::error!(
                "PSF parameters have shape {:?} for {} spherical Bessel terms, expected {:?}",
                self.entries.shape(),
                self.spherical.value().num_psfs(),
                shape
            );
            return Err(StackError::Dimension {
                name: "PSF parameters",
                found: self.entries.shape().to_vec(),
                expected: shape.to_vec(),
            });
        }

        let backend = self.settings.backend;
        let cached =
            self.settings.precompute_vnm_l_sum && self.vnm_inner.is_current(&self.vnm_inner_key());
        let psfs = match backend {
            ExecutionBackend::Cpu => {
                let inner = self.vnm_inner.value();
                let tables = EnzTables {
                    sampling: &self.enz,
                    wkl: self.wkl.value(),
                    cylindrical: self.cylindrical.value(),
                    spherical: self.spherical.value(),
                    inner: (cached && !inner.is_on_device()).then_some(inner),
                };
                cpu::compute_psfs(
                    &self.settings,
                    self.entries.as_slice(),
                    &tables,
                    &self.threads("PSFs", "PSF"),
                )?
            }
            ExecutionBackend::Gpu => {
                gpu::upload_tables(
                    self.device.as_mut(),
                    &mut self.uploads,
                    (self.wkl.value(), self.wkl.builds()),
                    (self.cylindrical.value(), self.cylindrical.builds()),
                    (self.spherical.value(), self.spherical.builds()),
                )?;
                let uniforms =
                    gpu::EnzUniforms::new(&self.enz, self.cylindrical.value(), num_psfs);
                let cached = cached && self.device.has_buffer(gpu::VNM_INNER_BUFFER);
                gpu::compute_psfs(
                    self.device.as_mut(),
                    &self.settings,
                    self.entries.as_slice(),
                    &uniforms,
                    &self.enz,
                    cached,
                )?
            }
        };
        self.psfs = NdArray::from_vec(shape, psfs).ok_or(StackError::Dimension {
            name: "PSFs",
            found: vec![],
            expected: shape.to_vec(),
        })?;
        self.stats("PSFs", now);
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::{ranges::ParameterRange, zernike::ZernikeCoefficients};

    fn settings(backend: ExecutionBackend) -> PsfStackParameters {
        PsfStackParameters::default()
            .backend(backend)
            .object_distances(ParameterRange::constant(0.))
            .focus_distances(ParameterRange::constant(0.))
            .aperture_diameters(ParameterRange::constant(4.))
            .lambdas(vec![550., 500.])
            .beta_degrees(4)
            .alpha_to_beta_sampling(SamplingMethod::Linear, 64, SamplingMethod::Cosine, 8)
            .approximation_samples(0.2, 60)
            .approximation_terms(10., 20, 30)
            .bessel_batch_size(10)
            .sampling_units(2., 4.)
            .psf_samples(21, 21)
            .num_threads(2)
    }

    fn aberration() -> AberrationParameters {
        let mut alpha = ZernikeCoefficients::default();
        alpha[8] = 0.15;
        alpha[11] = 0.05;
        AberrationParameters::preset(alpha).lambda(550.)
    }

    #[test]
    fn masks() {
        let mask = ComputationMask::RELAXED_EYE_PARAMETERS | ComputationMask::PSFS;
        assert!(mask.contains(ComputationMask::PSFS));
        assert!(!mask.contains(ComputationMask::EYE_PARAMETERS));
        assert!(mask.intersects(ComputationMask::EYE_PARAMETERS));
        assert!(ComputationMask::EVERYTHING.contains(ComputationMask::PSF_PARAMETERS));
        assert_eq!(mask.to_string(), "[relaxed|psfs]");
        assert_eq!(ComputationMask::NONE.bits(), 0);
    }

    #[test]
    fn cpu_stack() {
        let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
        stack
            .compute(&aberration(), ComputationMask::EVERYTHING)
            .unwrap();
        assert_eq!(*stack.psfs.shape(), [1, 1, 1, 2, 1, 1]);
        assert_eq!(stack.len(), 2);
        assert_eq!(*stack.coefficients.shape(), [1, 1, 2, 1, 1]);
        for psf in stack.psfs.iter() {
            assert_eq!(psf.kernel_size % 2, 1);
            assert!((psf.kernel.iter().sum::<f64>() - 1.).abs() < 1e-6);
        }
        let entry = &stack.entries[[0, 0, 0, 0, 0, 0]];
        assert!((entry.units.pupil_retina_distance - 0.0204).abs() < 1e-12);
        // chromatic defocus at 500nm
        assert!(stack.coefficients[[0, 0, 1, 0, 0]].alpha[4] > stack.coefficients[[0, 0, 0, 0, 0]].alpha[4]);
        let last = stack.last_computed().unwrap();
        assert_eq!(last.backend, ExecutionBackend::Cpu);
        assert_eq!(last.mask, ComputationMask::EVERYTHING);
        assert_eq!(last.pass, 1);
        assert!(!stack.vnm_inner.value().is_on_device());
    }

    #[test]
    fn unchanged_recompute_keeps_caches() {
        let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
        let aberration = aberration();
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        let first: Vec<f64> = stack.psfs.as_slice()[1].kernel.clone();
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert_eq!(stack.wkl.builds(), 1);
        assert_eq!(stack.cylindrical.builds(), 1);
        assert_eq!(stack.spherical.builds(), 1);
        assert_eq!(stack.vnm_inner.builds(), 1);
        assert_eq!(stack.last_computed().unwrap().pass, 2);
        assert_eq!(stack.psfs.as_slice()[1].kernel, first);
    }

    #[test]
    fn beta_degrees_change_rebuilds_wkl_and_inner_terms() {
        let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
        let aberration = aberration();
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        stack.settings.beta_degrees = 6;
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert_eq!(stack.wkl.builds(), 2);
        assert_eq!(stack.vnm_inner.builds(), 2);
        assert_eq!(stack.cylindrical.builds(), 1);
        assert_eq!(stack.spherical.builds(), 1);
        assert_eq!(stack.wkl.value().max_degree(), 6);
    }

    fn assert_same_psfs(stack: &PsfStack, reference: &PsfStack) {
        assert_eq!(stack.len(), reference.len());
        for (p, r) in stack.psfs.iter().zip(reference.psfs.iter()) {
            assert_eq!(p.kernel_size, r.kernel_size);
            let max_diff = p
                .kernel
                .iter()
                .zip(&r.kernel)
                .map(|(p, r)| (p - r).abs())
                .fold(0f64, f64::max);
            assert!(max_diff < 1e-12, "max diff: {max_diff}");
        }
    }

    #[test]
    fn single_phase_masks_after_degree_change() {
        let aberration = aberration();
        let mut reference = PsfStack::new(settings(ExecutionBackend::Cpu).beta_degrees(6));
        reference
            .compute(&aberration, ComputationMask::EVERYTHING)
            .unwrap();
        for mask in [
            ComputationMask::PSF_ENZ_COEFFICIENTS,
            ComputationMask::PSF_BESSEL_TERMS,
            ComputationMask::PSF_ENZ_COEFFICIENTS | ComputationMask::PSF_BESSEL_TERMS,
            ComputationMask::PSFS,
        ] {
            let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
            stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
            stack.settings.beta_degrees = 6;
            stack
                .compute(
                    &aberration,
                    ComputationMask::EYE_PARAMETERS | ComputationMask::PSF_UNITS | mask,
                )
                .unwrap();
            assert_eq!(stack.wkl.builds(), 2, "{mask}");
            assert_eq!(stack.wkl.value().max_degree(), 6, "{mask}");
            assert_eq!(stack.cylindrical.builds(), 1, "{mask}");
            stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
            assert_eq!(stack.wkl.builds(), 2, "{mask}");
            assert_eq!(stack.vnm_inner.builds(), 2, "{mask}");
            assert_same_psfs(&stack, &reference);
        }
    }

    #[test]
    fn bessel_pass_refreshes_inner_terms() {
        let aberration = aberration();
        let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        stack.settings.beta_degrees = 6;
        stack
            .compute(
                &aberration,
                ComputationMask::PSF_UNITS | ComputationMask::PSF_BESSEL_TERMS,
            )
            .unwrap();
        assert_eq!(stack.wkl.builds(), 2);
        assert_eq!(stack.vnm_inner.builds(), 2);
        assert_eq!(stack.vnm_inner.value().num_coefficients(), 16);
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert_eq!(stack.vnm_inner.builds(), 2);
        assert_eq!(stack.len(), 2);

        let mut fresh = PsfStack::new(settings(ExecutionBackend::Cpu));
        fresh
            .compute(
                &aberration,
                ComputationMask::EYE_PARAMETERS
                    | ComputationMask::PSF_UNITS
                    | ComputationMask::PSF_BESSEL_TERMS,
            )
            .unwrap();
        assert_eq!(fresh.wkl.builds(), 1);
        assert_eq!(fresh.vnm_inner.builds(), 1);
        fresh.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert_eq!(fresh.wkl.builds(), 1);
        assert_eq!(fresh.vnm_inner.builds(), 1);
        for psf in fresh.psfs.iter() {
            assert!((psf.kernel.iter().sum::<f64>() - 1.).abs() < 1e-6);
        }
    }

    #[test]
    fn extent_change_with_enz_pass() {
        let aberration = aberration();
        let wider = settings(ExecutionBackend::Cpu).approximation_samples(0.2, 80);
        let mut reference = PsfStack::new(wider.clone());
        reference
            .compute(&aberration, ComputationMask::EVERYTHING)
            .unwrap();

        let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        stack.settings = wider;
        stack
            .compute(
                &aberration,
                ComputationMask::PSF_UNITS | ComputationMask::PSF_ENZ_COEFFICIENTS,
            )
            .unwrap();
        assert_eq!(stack.wkl.builds(), 1);
        assert_eq!(stack.cylindrical.builds(), 2);
        assert_eq!(stack.vnm_inner.builds(), 2);
        assert_eq!(stack.vnm_inner.value().num_samples(), 80);
        stack.compute(&aberration, ComputationMask::PSFS).unwrap();
        assert_eq!(stack.cylindrical.builds(), 2);
        assert_eq!(stack.vnm_inner.builds(), 2);
        assert_same_psfs(&stack, &reference);
    }

    #[test]
    fn gpu_bessel_pass_refreshes_inner_terms() {
        let aberration = aberration();
        let mut stack = PsfStack::new(settings(ExecutionBackend::Gpu));
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        stack.settings.beta_degrees = 6;
        stack
            .compute(
                &aberration,
                ComputationMask::EYE_PARAMETERS
                    | ComputationMask::PSF_UNITS
                    | ComputationMask::PSF_BESSEL_TERMS,
            )
            .unwrap();
        assert_eq!(stack.wkl.builds(), 2);
        assert_eq!(stack.vnm_inner.builds(), 2);
        stack.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert_eq!(stack.vnm_inner.builds(), 2);
        assert!(stack.vnm_inner.value().is_on_device());
        for psf in stack.psfs.iter() {
            assert!((psf.kernel.iter().sum::<f64>() - 1.).abs() < 1e-6);
        }
    }

    #[test]
    fn cpu_and_gpu_stacks_agree() {
        let aberration = aberration();
        let mut on_host = PsfStack::new(settings(ExecutionBackend::Cpu));
        on_host.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        let mut on_gpu = PsfStack::with_device(
            settings(ExecutionBackend::Gpu),
            Box::new(ReferenceDevice::new()),
        );
        on_gpu.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert!(on_gpu.vnm_inner.value().is_on_device());
        assert!(on_gpu.device().has_buffer(gpu::WKL_BUFFER));
        assert!(on_gpu.device().has_buffer(gpu::VNM_INNER_BUFFER));
        assert!(!on_gpu.device().has_buffer(gpu::PSF_RESULT_BUFFER));
        for (c, g) in on_host.psfs.iter().zip(on_gpu.psfs.iter()) {
            assert_eq!(c.kernel_size, g.kernel_size);
            let max_diff = c
                .kernel
                .iter()
                .zip(&g.kernel)
                .map(|(c, g)| (c - g).abs())
                .fold(0f64, f64::max);
            assert!(max_diff < 1e-3, "max diff: {max_diff}");
        }

        // switching to the host releases the GPU tables
        on_gpu.settings.backend = ExecutionBackend::Cpu;
        on_gpu.compute(&aberration, ComputationMask::EVERYTHING).unwrap();
        assert!(!on_gpu.device().has_buffer(gpu::WKL_BUFFER));
        assert!(!on_gpu.device().has_buffer(gpu::VNM_INNER_BUFFER));
        assert!(!on_gpu.vnm_inner.value().is_on_device());
        assert_eq!(on_gpu.last_computed().unwrap().backend, ExecutionBackend::Cpu);
    }

    #[test]
    fn manual_coefficients() {
        let mut alpha = ZernikeCoefficients::default();
        alpha[6] = 0.1;
        let settings = settings(ExecutionBackend::Cpu).manual_coefficients(alpha, 17.);
        let mut stack = PsfStack::new(settings);
        stack
            .compute(&AberrationParameters::default(), ComputationMask::EVERYTHING)
            .unwrap();
        assert!(stack.relaxed.is_empty());
        let coefficients = &stack.coefficients[[0, 0, 1, 0, 0]];
        assert_eq!(coefficients.alpha[6], 0.1);
        assert!((coefficients.alpha[1] + 0.1).abs() < 1e-12);
        let entry = &stack.entries[[0, 0, 0, 1, 0, 0]];
        assert!((entry.units.pupil_retina_distance - 0.017).abs() < 1e-12);
    }

    #[test]
    fn partial_passes() {
        let aberration = aberration();
        let mut stack = PsfStack::new(settings(ExecutionBackend::Cpu));
        assert!(matches!(
            stack.compute(&aberration, ComputationMask::PSF_UNITS),
            Err(StackError::Dimension { .. })
        ));
        stack
            .compute(&aberration, ComputationMask::EYE_PARAMETERS)
            .unwrap();
        assert!(stack.is_empty());
        assert_eq!(stack.focused.len(), 1);
        stack
            .compute(
                &aberration,
                ComputationMask::PSF_PARAMETERS | ComputationMask::PSFS,
            )
            .unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.wkl.builds(), 1);
    }
}
