//! PSF stack
//!
//! Computes the PSFs of a model eye over a grid of object distances, wavelengths and apertures
//! and writes them to a `npz` archive.

use std::{path::PathBuf, time::Instant};

use anyhow::Context;
use npyz::{npz::NpzWriter, WriterBuilder};
use psf_stack::{
    backend::ExecutionBackend,
    config::{AberrationParameters, EyeEstimationMethod, PsfStackParameters},
    preset,
    ranges::ParameterRange,
    stack::{ComputationMask, PsfStack},
};
use structopt::StructOpt;
use strum::VariantNames;

#[derive(Debug, StructOpt)]
#[structopt(name = "psf-stack", about = "Extended Nijboer-Zernike PSF stacks of a model eye")]
struct Opt {
    /// Computation backend
    #[structopt(short, long, possible_values = ExecutionBackend::VARIANTS, case_insensitive = true)]
    backend: Option<ExecutionBackend>,
    /// Wavelengths [nm]
    #[structopt(short, long)]
    lambdas: Vec<f64>,
    /// Aperture diameter [mm]
    #[structopt(short, long)]
    aperture: Option<f64>,
    /// Object distances: min, max [D] and number of samples
    #[structopt(long, number_of_values = 3)]
    object_dioptres: Vec<f64>,
    /// Maximum radial degree of the beta coefficients
    #[structopt(long)]
    beta_degrees: Option<usize>,
    /// Minimum number of samples across a PSF
    #[structopt(long)]
    min_samples: Option<usize>,
    /// Maximum number of samples across a PSF
    #[structopt(long)]
    max_samples: Option<usize>,
    /// Eye model
    #[structopt(long, possible_values = EyeEstimationMethod::VARIANTS, case_insensitive = true)]
    eye: Option<EyeEstimationMethod>,
    /// Aberration preset file (`.abp`)
    #[structopt(short, long)]
    preset: Option<PathBuf>,
    /// Loads the stack parameters from a pickle file
    #[structopt(long)]
    load: Option<PathBuf>,
    /// Saves the stack parameters to a pickle file
    #[structopt(long)]
    save: Option<PathBuf>,
    /// Number of threads, all available if 0
    #[structopt(short = "j", long, default_value = "0")]
    threads: usize,
    /// Output archive
    #[structopt(short, long, default_value = "psf_stack.npz")]
    output: PathBuf,
    /// Shows progress bars
    #[structopt(long)]
    progress: bool,
    /// Logs the phase timings
    #[structopt(long)]
    stats: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut settings = match &opt.load {
        Some(path) => PsfStackParameters::load(path)
            .with_context(|| format!("failed to load the parameters from {path:?}"))?,
        None => PsfStackParameters::default(),
    };
    if let Some(backend) = opt.backend {
        settings = settings.backend(backend);
    }
    if !opt.lambdas.is_empty() {
        settings = settings.lambdas(opt.lambdas.clone());
    }
    if let Some(aperture) = opt.aperture {
        settings = settings.aperture_diameters(ParameterRange::constant(aperture));
    }
    if let [min, max, steps] = opt.object_dioptres[..] {
        settings = settings.object_distances(ParameterRange::new(min, max, steps as usize));
    }
    if let Some(beta_degrees) = opt.beta_degrees {
        settings = settings.beta_degrees(beta_degrees);
    }
    if opt.min_samples.is_some() || opt.max_samples.is_some() {
        let min = opt.min_samples.unwrap_or(settings.psf_samples_min);
        let max = opt.max_samples.unwrap_or(settings.psf_samples_max).max(min);
        settings = settings.psf_samples(min, max);
    }
    if let Some(eye) = opt.eye {
        settings = settings.eye_estimation_method(eye);
    }
    settings = settings
        .num_threads(opt.threads)
        .log_progress(opt.progress)
        .log_stats(opt.stats);
    if let Some(path) = &opt.save {
        settings.dump(path)?;
        log::info!("Parameters saved to {path:?}");
    }

    let aberration = match &opt.preset {
        Some(path) => {
            let folder = path.parent().map(PathBuf::from).unwrap_or_default();
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("invalid preset file name")?;
            preset::load(folder, name)?
        }
        None => AberrationParameters::default(),
    };

    let now = Instant::now();
    let mut stack = PsfStack::new(settings);
    stack.compute(&aberration, ComputationMask::EVERYTHING)?;
    println!(
        "{} PSFs {:?} computed in {}ms",
        stack.len(),
        stack.psfs.shape(),
        now.elapsed().as_millis()
    );

    let mut npz = NpzWriter::create(&opt.output)?;
    for (i, psf) in stack.psfs.iter().enumerate() {
        let mut writer = npz
            .array(&format!("psf_{i}"), Default::default())?
            .default_dtype()
            .shape(&[psf.kernel_size as u64, psf.kernel_size as u64])
            .begin_nd()?;
        writer.extend(psf.kernel.iter().copied())?;
        writer.finish()?;
    }
    let blur: Vec<f64> = stack.psfs.iter().map(|psf| psf.blur_radius_deg).collect();
    let shape: Vec<u64> = stack.psfs.shape().iter().map(|&n| n as u64).collect();
    let mut writer = npz
        .array("blur_radius_deg", Default::default())?
        .default_dtype()
        .shape(&shape)
        .begin_nd()?;
    writer.extend(blur)?;
    writer.finish()?;
    println!("PSFs written to {:?}", opt.output);

    Ok(())
}
