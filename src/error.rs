use crate::{
    backend::GpuError, config::ConfigError, eye::EyeError, preset::PresetError, psf::PsfError,
    stack::StackError,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error in the `config` module")]
    Config(#[from] ConfigError),
    #[error("Error in the `preset` module")]
    Preset(#[from] PresetError),
    #[error("Error in the `eye` module")]
    Eye(#[from] EyeError),
    #[error("Error in the `psf` module")]
    Psf(#[from] PsfError),
    #[error("Error in the `backend::gpu` module")]
    Gpu(#[from] GpuError),
    #[error("Error in the `stack` module")]
    Stack(#[from] StackError),
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn conversions() {
        let error: Error = PsfError::ZeroSum.into();
        assert!(matches!(error, Error::Psf(PsfError::ZeroSum)));
        let error: Error = StackError::EmptyBeta.into();
        assert_eq!(error.to_string(), "Error in the `stack` module");
    }
}
