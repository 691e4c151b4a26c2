//! PSF computation backends
//!
//! Both backends evaluate the same Vnm series and pupil accumulation, the GPU backend
//! through a [`GpuDevice`](gpu::GpuDevice).

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString, VariantNames};

pub mod cpu;
pub mod gpu;
pub use gpu::{GpuDevice, GpuError, ReferenceDevice};

/// Where the PSFs are computed
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    VariantNames,
)]
#[strum(ascii_case_insensitive)]
pub enum ExecutionBackend {
    Cpu,
    #[default]
    Gpu,
}
