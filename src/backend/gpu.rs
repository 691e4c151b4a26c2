/*!
# GPU PSF computation

The ENZ tables are flattened into named buffers and the PSFs are computed by four compute kernels:
 - `compute_vnm_inner`: the inner sums of one positive coefficient into [`VNM_INNER_BUFFER`],
 - `compute_vnm_with_cache`: the Vnm function of one coefficient and one PSF from the inner sums,
 - `compute_vnm_no_cache`: the same, computing the inner sums on the fly,
 - `compute_psf`: the pupil accumulation of one PSF from the Vnm texture into [`PSF_RESULT_BUFFER`].

The device is injected as a [`GpuDevice`], [`ReferenceDevice`] executes the kernels on the host
in single precision.
*/

use std::collections::HashMap;

use num::complex::{Complex32, Complex64};

use crate::{
    config::PsfStackParameters,
    defocus::PsfEntryParams,
    enz::{
        wkl::{l_max, l_min},
        CylindricalBessel, EnzSampling, SphericalBessel, VnmInner, Wkl,
    },
    psf::{self, significant_coefficients, PsfEntry, PsfError},
    zernike::PositiveCoefficients,
};

pub const WKL_BUFFER: &str = "PsfStack_WklBuffer";
pub const SPHERICAL_BESSEL_BUFFER: &str = "PsfStack_SphericalBesselBuffer";
pub const CYLINDRICAL_BESSEL_BUFFER: &str = "PsfStack_CylindricalBesselBuffer";
pub const VNM_INNER_BUFFER: &str = "PsfStack_VnmInnerBuffer";
pub const PSF_PROPERTIES_BUFFER: &str = "PsfStack_PsfProperties";
pub const PSF_BETA_BUFFER: &str = "PsfStack_PsfBeta";
pub const PSF_RESULT_BUFFER: &str = "PsfStack_PsfResult";
pub const VNM_TEXTURE: &str = "PsfStack_VnmTexture";

/// Work group size of the kernels along each dimension
pub const GROUP_SIZE: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum GpuError {
    #[error("No GPU resource named {0:?}")]
    MissingResource(String),
    #[error("GPU resource {0:?} does not hold the expected data")]
    ResourceType(String),
    #[error("{kernel} dispatch out of range: index {index} of {resource:?} with {len} elements")]
    OutOfRange {
        kernel: String,
        resource: String,
        index: usize,
        len: usize,
    },
    #[error("{kernel} dispatch of {groups:?} groups does not cover {items} items")]
    Coverage {
        kernel: String,
        groups: [usize; 3],
        items: usize,
    },
    #[error("Failed to post-process a GPU PSF")]
    Psf(#[from] PsfError),
}
type Result<T> = std::result::Result<T, GpuError>;

/// Per PSF properties read by `compute_psf`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsfProperties {
    /// Number of entries in [`PSF_BETA_BUFFER`]
    pub num_coefficients: u32,
    pub total_coefficients: u32,
    pub samples: u32,
    /// Number of valid Vnm samples
    pub vnm_samples: u32,
    pub texel_size: f32,
    pub half_extent: f32,
    /// Radius to Vnm texture coordinate
    pub uv_offset: f32,
    pub uv_scale: f32,
}

/// A coefficient pair of a PSF
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsfBeta {
    /// Row of the coefficient in [`VNM_TEXTURE`]
    pub coefficient: u32,
    pub n: i32,
    pub m: [i32; 2],
    /// `2·√(n+1)·i^|m|·β`
    pub beta: [Complex32; 2],
}

/// Content of a device buffer
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    F32(Vec<f32>),
    Complex(Vec<Complex32>),
    Properties(PsfProperties),
    Beta(Vec<PsfBeta>),
}
impl BufferData {
    pub fn len(&self) -> usize {
        match self {
            BufferData::F32(data) => data.len(),
            BufferData::Complex(data) => data.len(),
            BufferData::Properties(_) => 1,
            BufferData::Beta(data) => data.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Size in bytes
    pub fn size_of(&self) -> usize {
        match self {
            BufferData::F32(data) => data.len() * std::mem::size_of::<f32>(),
            BufferData::Complex(data) => data.len() * std::mem::size_of::<Complex32>(),
            BufferData::Properties(_) => std::mem::size_of::<PsfProperties>(),
            BufferData::Beta(data) => data.len() * std::mem::size_of::<PsfBeta>(),
        }
    }
}
impl From<&[f64]> for BufferData {
    fn from(values: &[f64]) -> Self {
        BufferData::F32(values.iter().map(|v| *v as f32).collect())
    }
}
impl From<&[Complex64]> for BufferData {
    fn from(values: &[Complex64]) -> Self {
        BufferData::Complex(
            values
                .iter()
                .map(|v| Complex32::new(v.re as f32, v.im as f32))
                .collect(),
        )
    }
}

/// Dimensions of the ENZ tables, shared by every kernel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnzUniforms {
    pub max_degree: usize,
    pub max_order: usize,
    pub max_samples: usize,
    pub terms_per_order: usize,
    pub num_psfs: usize,
    pub num_cylindrical_orders: usize,
}
impl EnzUniforms {
    pub fn new(sampling: &EnzSampling, cylindrical: &CylindricalBessel, num_psfs: usize) -> Self {
        Self {
            max_degree: sampling.max_degree,
            max_order: sampling.max_order,
            max_samples: sampling.max_samples,
            terms_per_order: sampling.max_terms_per_order,
            num_psfs,
            num_cylindrical_orders: cylindrical.num_orders(),
        }
    }
}

/// Compute kernels
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    ComputeVnmInner {
        coefficient: usize,
        n: i32,
        m: i32,
    },
    ComputeVnmWithCache {
        psf: usize,
        coefficient: usize,
        terms: usize,
        samples: usize,
    },
    ComputeVnmNoCache {
        psf: usize,
        coefficient: usize,
        n: i32,
        m: i32,
        terms: usize,
        samples: usize,
    },
    ComputePsf,
}
impl Kernel {
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::ComputeVnmInner { .. } => "compute_vnm_inner",
            Kernel::ComputeVnmWithCache { .. } => "compute_vnm_with_cache",
            Kernel::ComputeVnmNoCache { .. } => "compute_vnm_no_cache",
            Kernel::ComputePsf => "compute_psf",
        }
    }
}

/// Work groups covering `items`
pub fn groups(items: [usize; 2]) -> [usize; 3] {
    [
        items[0].div_ceil(GROUP_SIZE).max(1),
        items[1].div_ceil(GROUP_SIZE).max(1),
        1,
    ]
}

/// A compute device holding named buffers and textures
pub trait GpuDevice: Send + std::fmt::Debug {
    /// Creates or replaces a buffer
    fn upload_buffer(&mut self, name: &str, data: BufferData) -> Result<()>;
    /// Returns `true` if the buffer existed
    fn delete_buffer(&mut self, name: &str) -> bool;
    fn has_buffer(&self, name: &str) -> bool;
    /// Creates or replaces a complex 2D texture of `width x height` texels
    fn create_texture(&mut self, name: &str, width: usize, height: usize) -> Result<()>;
    fn delete_texture(&mut self, name: &str) -> bool;
    fn dispatch(&mut self, kernel: &Kernel, uniforms: &EnzUniforms, groups: [usize; 3]) -> Result<()>;
    /// Makes the writes of the previous dispatches visible to the next ones
    fn memory_barrier(&mut self);
    /// Blocks until every dispatch has completed
    fn wait_for_gpu(&mut self);
    fn read_buffer(&self, name: &str) -> Result<Vec<f32>>;
}

/// Build counters of the tables uploaded to the device
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpuUploads {
    pub wkl: Option<usize>,
    pub cylindrical: Option<usize>,
    pub spherical: Option<usize>,
}

/// Uploads a table unless the device already holds the build `builds` of it
///
/// Returns `true` if the table has been uploaded.
pub fn upload_table<F>(
    device: &mut dyn GpuDevice,
    name: &str,
    builds: usize,
    uploaded: &mut Option<usize>,
    data: F,
) -> Result<bool>
where
    F: FnOnce() -> BufferData,
{
    if device.has_buffer(name) && *uploaded == Some(builds) {
        return Ok(false);
    }
    let data = data();
    log::debug!("Uploading {name} ({} bytes)", data.size_of());
    device.upload_buffer(name, data)?;
    *uploaded = Some(builds);
    Ok(true)
}

/// Uploads the ENZ tables that changed since their last upload
pub fn upload_tables(
    device: &mut dyn GpuDevice,
    uploads: &mut GpuUploads,
    wkl: (&Wkl, usize),
    cylindrical: (&CylindricalBessel, usize),
    spherical: (&SphericalBessel, usize),
) -> Result<()> {
    upload_table(device, WKL_BUFFER, wkl.1, &mut uploads.wkl, || {
        wkl.0.as_slice().into()
    })?;
    upload_table(
        device,
        CYLINDRICAL_BESSEL_BUFFER,
        cylindrical.1,
        &mut uploads.cylindrical,
        || cylindrical.0.as_slice().into(),
    )?;
    upload_table(
        device,
        SPHERICAL_BESSEL_BUFFER,
        spherical.1,
        &mut uploads.spherical,
        || spherical.0.weights().as_slice().into(),
    )?;
    Ok(())
}

/// Computes the inner sums of every positive coefficient into [`VNM_INNER_BUFFER`]
pub fn compute_vnm_inner(
    device: &mut dyn GpuDevice,
    uniforms: &EnzUniforms,
    sampling: &EnzSampling,
) -> Result<VnmInner> {
    let coefficients = PositiveCoefficients::new(sampling.max_degree);
    let len = coefficients.len() * sampling.max_order * sampling.max_samples;
    device.upload_buffer(VNM_INNER_BUFFER, BufferData::F32(vec![0f32; len]))?;
    for (c, coefficient) in coefficients.iter().enumerate() {
        device.dispatch(
            &Kernel::ComputeVnmInner {
                coefficient: c,
                n: coefficient.n(),
                m: coefficient.m(),
            },
            uniforms,
            groups([sampling.max_samples, sampling.max_order]),
        )?;
    }
    device.memory_barrier();
    device.wait_for_gpu();
    Ok(VnmInner::on_device(
        coefficients.len(),
        sampling.max_order,
        sampling.max_samples,
    ))
}

/// Computes the PSFs of all the entries, one after the other
pub fn compute_psfs(
    device: &mut dyn GpuDevice,
    settings: &PsfStackParameters,
    entries: &[PsfEntryParams],
    uniforms: &EnzUniforms,
    sampling: &EnzSampling,
    cached: bool,
) -> Result<Vec<PsfEntry>> {
    let max_psf_size = entries
        .iter()
        .map(|entry| entry.sampling.samples)
        .max()
        .unwrap_or_default();
    device.upload_buffer(
        PSF_RESULT_BUFFER,
        BufferData::F32(vec![0f32; max_psf_size * max_psf_size]),
    )?;
    device.create_texture(VNM_TEXTURE, sampling.max_samples, sampling.max_coefficients)?;

    let radius_step = sampling.radius_step();
    let psfs = entries
        .iter()
        .enumerate()
        .map(|(p, entry)| {
            let samples = entry.sampling.samples;
            let vnm_samples = entry.enz_samples(sampling.max_samples).max(1);
            let beta = &entry.coefficients.beta;
            let significant = if settings.omit_psf_calculation {
                Vec::new()
            } else {
                significant_coefficients(beta, settings.beta_degrees, settings.beta_threshold)
            };

            let half_extent = entry.sampling.half_extent;
            device.upload_buffer(
                PSF_PROPERTIES_BUFFER,
                BufferData::Properties(PsfProperties {
                    num_coefficients: significant.len() as u32,
                    total_coefficients: sampling.max_coefficients as u32,
                    samples: samples as u32,
                    vnm_samples: vnm_samples as u32,
                    texel_size: if samples > 1 {
                        (2. * half_extent / (samples - 1) as f64) as f32
                    } else {
                        0.
                    },
                    half_extent: half_extent as f32,
                    uv_offset: 0.5 / sampling.max_samples as f32,
                    uv_scale: if radius_step > 0. {
                        (1. / (radius_step * sampling.max_samples as f64)) as f32
                    } else {
                        0.
                    },
                }),
            )?;
            device.upload_buffer(
                PSF_BETA_BUFFER,
                BufferData::Beta(
                    significant
                        .iter()
                        .map(|(c, coefficient)| {
                            let [bp, bm] = psf::pupil_weights(beta, coefficient);
                            PsfBeta {
                                coefficient: *c as u32,
                                n: coefficient.n(),
                                m: [coefficient.m(), -coefficient.m()],
                                beta: [
                                    Complex32::new(bp.re as f32, bp.im as f32),
                                    Complex32::new(bm.re as f32, bm.im as f32),
                                ],
                            }
                        })
                        .collect(),
                ),
            )?;

            if !settings.omit_vnm_calculation {
                for (c, coefficient) in &significant {
                    let kernel = if cached {
                        Kernel::ComputeVnmWithCache {
                            psf: p,
                            coefficient: *c,
                            terms: entry.enz_sampling.terms,
                            samples: vnm_samples,
                        }
                    } else {
                        Kernel::ComputeVnmNoCache {
                            psf: p,
                            coefficient: *c,
                            n: coefficient.n(),
                            m: coefficient.m(),
                            terms: entry.enz_sampling.terms,
                            samples: vnm_samples,
                        }
                    };
                    device.dispatch(&kernel, uniforms, groups([vnm_samples, 1]))?;
                }
                device.memory_barrier();
            }
            device.dispatch(&Kernel::ComputePsf, uniforms, groups([samples, samples]))?;
            device.memory_barrier();
            device.wait_for_gpu();

            let mut psf = device.read_buffer(PSF_RESULT_BUFFER)?;
            psf.truncate(samples * samples);
            let psf: Vec<f64> = psf.into_iter().map(f64::from).collect();
            if settings.omit_psf_calculation {
                return Ok(PsfEntry::new(psf, samples, entry.sampling.sample_size));
            }
            let (kernel, size) = psf::optimize(settings, psf, samples)?;
            if settings.log_debug {
                log::debug!("PSF #{p}: {size}x{size} ({} coefficients)", significant.len());
            }
            Ok(PsfEntry::new(kernel, size, entry.sampling.sample_size))
        })
        .collect::<Result<Vec<_>>>();

    finish(device);
    psfs
}

/// Deletes the per pass resources
pub fn finish(device: &mut dyn GpuDevice) {
    for name in [PSF_PROPERTIES_BUFFER, PSF_BETA_BUFFER, PSF_RESULT_BUFFER] {
        device.delete_buffer(name);
    }
    device.delete_texture(VNM_TEXTURE);
}

/// Deletes the ENZ tables from the device
pub fn free_cache_resources(device: &mut dyn GpuDevice, uploads: &mut GpuUploads) {
    for name in [
        WKL_BUFFER,
        SPHERICAL_BESSEL_BUFFER,
        CYLINDRICAL_BESSEL_BUFFER,
        VNM_INNER_BUFFER,
    ] {
        if device.delete_buffer(name) {
            log::debug!("Released {name}");
        }
    }
    *uploads = GpuUploads::default();
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Texture {
    width: usize,
    height: usize,
    texels: Vec<Complex32>,
}

/// A [`GpuDevice`] executing the kernels on the host in single precision
#[derive(Debug, Clone, Default)]
pub struct ReferenceDevice {
    buffers: HashMap<String, BufferData>,
    textures: HashMap<String, Texture>,
    dispatches: usize,
    barriers: usize,
}
impl ReferenceDevice {
    pub fn new() -> Self {
        Default::default()
    }
    /// Number of kernel dispatches so far
    pub fn dispatches(&self) -> usize {
        self.dispatches
    }
    pub fn barriers(&self) -> usize {
        self.barriers
    }
    /// Names of the allocated buffers
    pub fn buffer_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.buffers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn buffer(&self, name: &str) -> Result<&BufferData> {
        self.buffers
            .get(name)
            .ok_or_else(|| GpuError::MissingResource(name.into()))
    }
    fn f32_buffer(&self, name: &str) -> Result<&[f32]> {
        match self.buffer(name)? {
            BufferData::F32(data) => Ok(data),
            _ => Err(GpuError::ResourceType(name.into())),
        }
    }
    fn complex_buffer(&self, name: &str) -> Result<&[Complex32]> {
        match self.buffer(name)? {
            BufferData::Complex(data) => Ok(data),
            _ => Err(GpuError::ResourceType(name.into())),
        }
    }
    fn texture(&self, name: &str) -> Result<&Texture> {
        self.textures
            .get(name)
            .ok_or_else(|| GpuError::MissingResource(name.into()))
    }
    fn check_range(kernel: &Kernel, resource: &str, index: usize, len: usize) -> Result<()> {
        if index > len {
            Err(GpuError::OutOfRange {
                kernel: kernel.name().into(),
                resource: resource.into(),
                index,
                len,
            })
        } else {
            Ok(())
        }
    }

    /// `I_nmk` at the first `samples` radius samples
    fn inner_sum(&self, u: &EnzUniforms, n: i32, m: i32, k: usize, samples: usize) -> Result<Vec<f32>> {
        let wkl = self.f32_buffer(WKL_BUFFER)?;
        let cylindrical = self.f32_buffer(CYLINDRICAL_BESSEL_BUFFER)?;
        let m = m.abs();
        let (nu, mu) = (n as usize, m as usize);
        let offset = ((nu * (u.max_degree + 1) + mu) * u.max_order + k) * u.terms_per_order;
        let l0 = l_min(n, m, k);
        let num_l = (l_max(n, m, k) + 1 - l0).min(u.terms_per_order);
        let mut inner = vec![0f32; samples];
        for li in 0..num_l {
            let w = *wkl.get(offset + li).ok_or_else(|| GpuError::OutOfRange {
                kernel: "vnm inner sum".into(),
                resource: WKL_BUFFER.into(),
                index: offset + li,
                len: wkl.len(),
            })?;
            let order = mu + 2 * (l0 + li) + 1;
            if w == 0. || order >= u.num_cylindrical_orders {
                continue;
            }
            let row = &cylindrical[order * u.max_samples..order * u.max_samples + samples];
            inner.iter_mut().zip(row).for_each(|(i, c)| *i += w * c);
        }
        Ok(inner)
    }

    fn vnm_inner(&mut self, kernel: &Kernel, u: &EnzUniforms, c: usize, n: i32, m: i32) -> Result<()> {
        let mut rows = Vec::with_capacity(u.max_order * u.max_samples);
        for k in 0..u.max_order {
            rows.extend(self.inner_sum(u, n, m, k, u.max_samples)?);
        }
        let start = c * u.max_order * u.max_samples;
        let len = self.f32_buffer(VNM_INNER_BUFFER)?.len();
        Self::check_range(kernel, VNM_INNER_BUFFER, start + rows.len(), len)?;
        if let Some(BufferData::F32(inner)) = self.buffers.get_mut(VNM_INNER_BUFFER) {
            inner[start..start + rows.len()].copy_from_slice(&rows);
        }
        Ok(())
    }

    fn vnm(
        &mut self,
        kernel: &Kernel,
        u: &EnzUniforms,
        psf: usize,
        c: usize,
        terms: usize,
        samples: usize,
        on_the_fly: Option<(i32, i32)>,
    ) -> Result<()> {
        let spherical = self.complex_buffer(SPHERICAL_BESSEL_BUFFER)?;
        let samples = samples.min(u.max_samples);
        let terms = terms.min(u.max_order);
        Self::check_range(kernel, SPHERICAL_BESSEL_BUFFER, terms * u.num_psfs, spherical.len())?;
        let mut vnm = vec![Complex32::default(); samples];
        for k in 0..terms {
            let weight = spherical[k * u.num_psfs + psf];
            let inner = match on_the_fly {
                Some((n, m)) => self.inner_sum(u, n, m, k, samples)?,
                None => {
                    let inner = self.f32_buffer(VNM_INNER_BUFFER)?;
                    let start = (c * u.max_order + k) * u.max_samples;
                    Self::check_range(kernel, VNM_INNER_BUFFER, start + samples, inner.len())?;
                    inner[start..start + samples].to_vec()
                }
            };
            vnm.iter_mut()
                .zip(inner)
                .for_each(|(v, i)| *v += weight * i);
        }
        let texture = self
            .textures
            .get_mut(VNM_TEXTURE)
            .ok_or_else(|| GpuError::MissingResource(VNM_TEXTURE.into()))?;
        Self::check_range(kernel, VNM_TEXTURE, c + 1, texture.height)?;
        let start = c * texture.width;
        texture.texels[start..start + samples].copy_from_slice(&vnm);
        Ok(())
    }

    fn psf(&mut self, kernel: &Kernel) -> Result<()> {
        let properties = match self.buffer(PSF_PROPERTIES_BUFFER)? {
            BufferData::Properties(properties) => *properties,
            _ => return Err(GpuError::ResourceType(PSF_PROPERTIES_BUFFER.into())),
        };
        let betas = match self.buffer(PSF_BETA_BUFFER)? {
            BufferData::Beta(betas) => betas,
            _ => return Err(GpuError::ResourceType(PSF_BETA_BUFFER.into())),
        };
        let texture = self.texture(VNM_TEXTURE)?;
        let samples = properties.samples as usize;
        let vnm_samples = (properties.vnm_samples as usize).min(texture.width);
        let h = properties.half_extent;

        let sample_vnm = |row: usize, r: f32| -> Complex32 {
            let texels = &texture.texels[row * texture.width..row * texture.width + vnm_samples];
            if vnm_samples == 1 {
                return texels[0];
            }
            if r > h {
                return Complex32::default();
            }
            let u = properties.uv_offset + r * properties.uv_scale;
            let x = (u * texture.width as f32 - 0.5).max(0.);
            let i = (x.floor() as usize).min(vnm_samples - 2);
            let t = (x - i as f32).clamp(0., 1.);
            texels[i] * (1. - t) + texels[i + 1] * t
        };

        let mut result = Vec::with_capacity(samples * samples);
        for i in 0..samples {
            let y = -h + i as f32 * properties.texel_size;
            for j in 0..samples {
                let x = -h + j as f32 * properties.texel_size;
                let (r, phi) = (x.hypot(y), y.atan2(x));
                let mut pupil = Complex32::default();
                for beta in betas.iter().take(properties.num_coefficients as usize) {
                    if beta.coefficient as usize >= texture.height {
                        return Err(GpuError::OutOfRange {
                            kernel: kernel.name().into(),
                            resource: VNM_TEXTURE.into(),
                            index: beta.coefficient as usize,
                            len: texture.height,
                        });
                    }
                    let v = sample_vnm(beta.coefficient as usize, r);
                    let angular = beta.beta[0] * Complex32::from_polar(1., beta.m[0] as f32 * phi)
                        + beta.beta[1] * Complex32::from_polar(1., beta.m[1] as f32 * phi);
                    pupil += v * angular;
                }
                result.push(pupil.norm_sqr());
            }
        }

        let len = self.f32_buffer(PSF_RESULT_BUFFER)?.len();
        Self::check_range(kernel, PSF_RESULT_BUFFER, result.len(), len)?;
        if let Some(BufferData::F32(buffer)) = self.buffers.get_mut(PSF_RESULT_BUFFER) {
            buffer[..result.len()].copy_from_slice(&result);
        }
        Ok(())
    }
}
impl GpuDevice for ReferenceDevice {
    fn upload_buffer(&mut self, name: &str, data: BufferData) -> Result<()> {
        self.buffers.insert(name.to_string(), data);
        Ok(())
    }
    fn delete_buffer(&mut self, name: &str) -> bool {
        self.buffers.remove(name).is_some()
    }
    fn has_buffer(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }
    fn create_texture(&mut self, name: &str, width: usize, height: usize) -> Result<()> {
        self.textures.insert(
            name.to_string(),
            Texture {
                width,
                height,
                texels: vec![Complex32::default(); width * height],
            },
        );
        Ok(())
    }
    fn delete_texture(&mut self, name: &str) -> bool {
        self.textures.remove(name).is_some()
    }
    fn dispatch(&mut self, kernel: &Kernel, uniforms: &EnzUniforms, groups: [usize; 3]) -> Result<()> {
        let covered = groups.iter().product::<usize>() * GROUP_SIZE * GROUP_SIZE;
        let items = match kernel {
            Kernel::ComputeVnmInner { .. } => uniforms.max_samples * uniforms.max_order,
            Kernel::ComputeVnmWithCache { samples, .. } | Kernel::ComputeVnmNoCache { samples, .. } => {
                *samples
            }
            Kernel::ComputePsf => match self.buffer(PSF_PROPERTIES_BUFFER)? {
                BufferData::Properties(properties) => (properties.samples * properties.samples) as usize,
                _ => return Err(GpuError::ResourceType(PSF_PROPERTIES_BUFFER.into())),
            },
        };
        if covered < items {
            return Err(GpuError::Coverage {
                kernel: kernel.name().into(),
                groups,
                items,
            });
        }
        self.dispatches += 1;
        match *kernel {
            Kernel::ComputeVnmInner { coefficient, n, m } => {
                self.vnm_inner(kernel, uniforms, coefficient, n, m)
            }
            Kernel::ComputeVnmWithCache {
                psf,
                coefficient,
                terms,
                samples,
            } => self.vnm(kernel, uniforms, psf, coefficient, terms, samples, None),
            Kernel::ComputeVnmNoCache {
                psf,
                coefficient,
                n,
                m,
                terms,
                samples,
            } => self.vnm(kernel, uniforms, psf, coefficient, terms, samples, Some((n, m))),
            Kernel::ComputePsf => self.psf(kernel),
        }
    }
    fn memory_barrier(&mut self) {
        self.barriers += 1;
    }
    fn wait_for_gpu(&mut self) {}
    fn read_buffer(&self, name: &str) -> Result<Vec<f32>> {
        self.f32_buffer(name).map(|data| data.to_vec())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::{
        backend::{cpu, tests::Fixture},
        enz::{vnm::coefficient_index, EnzTables},
    };

    /// Row of the coefficient `(n,m)` in [`VNM_TEXTURE`]
    fn texture_row(n: i32, m: i32) -> usize {
        coefficient_index(n, m)
    }

    fn gpu_psfs(fixture: &Fixture, cached: bool) -> (ReferenceDevice, Vec<PsfEntry>) {
        let mut device = ReferenceDevice::new();
        let mut uploads = GpuUploads::default();
        upload_tables(
            &mut device,
            &mut uploads,
            (&fixture.wkl, 1),
            (&fixture.cylindrical, 1),
            (&fixture.spherical, 1),
        )
        .unwrap();
        let uniforms = EnzUniforms::new(
            &fixture.sampling,
            &fixture.cylindrical,
            fixture.entries.len(),
        );
        if cached {
            let inner = compute_vnm_inner(&mut device, &uniforms, &fixture.sampling).unwrap();
            assert!(inner.is_on_device());
        }
        let psfs = compute_psfs(
            &mut device,
            &fixture.settings,
            &fixture.entries,
            &uniforms,
            &fixture.sampling,
            cached,
        )
        .unwrap();
        (device, psfs)
    }

    #[test]
    fn cpu_and_gpu_agree() {
        let fixture = Fixture::new();
        let inner = fixture.inner();
        let tables = EnzTables {
            inner: Some(&inner),
            ..fixture.tables()
        };
        let params = crate::threading::ThreadedExecuteParams::new("cpu").num_threads(2);
        let cpu = cpu::compute_psfs(&fixture.settings, &fixture.entries, &tables, &params).unwrap();
        for cached in [true, false] {
            let (_, gpu) = gpu_psfs(&fixture, cached);
            assert_eq!(cpu.len(), gpu.len());
            for (c, g) in cpu.iter().zip(&gpu) {
                assert_eq!(c.kernel_size, g.kernel_size);
                let max_diff = c
                    .kernel
                    .iter()
                    .zip(&g.kernel)
                    .map(|(c, g)| (c - g).abs())
                    .fold(0f64, f64::max);
                assert!(max_diff < 1e-3, "max diff: {max_diff}");
            }
        }
    }

    #[test]
    fn per_pass_resources_are_released() {
        let fixture = Fixture::new();
        let (mut device, psfs) = gpu_psfs(&fixture, true);
        assert!(psfs
            .iter()
            .all(|psf| (psf.kernel.iter().sum::<f64>() - 1.).abs() < 1e-6));
        assert_eq!(
            device.buffer_names(),
            vec![
                CYLINDRICAL_BESSEL_BUFFER,
                SPHERICAL_BESSEL_BUFFER,
                VNM_INNER_BUFFER,
                WKL_BUFFER
            ]
        );
        assert!(!device.has_buffer(PSF_RESULT_BUFFER));
        let mut uploads = GpuUploads {
            wkl: Some(1),
            ..Default::default()
        };
        free_cache_resources(&mut device, &mut uploads);
        assert!(device.buffer_names().is_empty());
        assert_eq!(uploads, GpuUploads::default());
    }

    #[test]
    fn uploads_only_new_builds() {
        let fixture = Fixture::new();
        let mut device = ReferenceDevice::new();
        let mut uploaded = None;
        let data = || fixture.wkl.as_slice().into();
        assert!(upload_table(&mut device, WKL_BUFFER, 1, &mut uploaded, data).unwrap());
        assert!(!upload_table(&mut device, WKL_BUFFER, 1, &mut uploaded, data).unwrap());
        assert!(upload_table(&mut device, WKL_BUFFER, 2, &mut uploaded, data).unwrap());
        device.delete_buffer(WKL_BUFFER);
        assert!(upload_table(&mut device, WKL_BUFFER, 2, &mut uploaded, data).unwrap());
    }

    #[test]
    fn dispatch_errors() {
        let mut device = ReferenceDevice::new();
        let uniforms = EnzUniforms {
            max_samples: 100,
            max_order: 10,
            ..Default::default()
        };
        let kernel = Kernel::ComputeVnmInner {
            coefficient: 0,
            n: 0,
            m: 0,
        };
        assert!(matches!(
            device.dispatch(&kernel, &uniforms, [1, 1, 1]),
            Err(GpuError::Coverage { .. })
        ));
        assert!(matches!(
            device.dispatch(&kernel, &uniforms, groups([100, 10])),
            Err(GpuError::MissingResource(_))
        ));
        assert_eq!(texture_row(2, -2), 3);
    }
}
