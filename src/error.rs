use std::path::PathBuf;
use thiserror::Error;

/// errors raised by the reconstruction core. None of these are retried internally; they are
/// all fatal to the pass or training round that produced them.
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("checkpoint holds {found} stages but the configuration has {expected}")]
    StageCountMismatch { expected: usize, found: usize },
    #[error("pretrained weights not found at {0}")]
    MissingPretrained(PathBuf),
    #[error("non-finite value encountered in {0}")]
    NonFinite(String),
    #[error("invalid sampling mask: {0}")]
    InvalidMask(String),
    #[error("invalid normalization (mean = {mean}, std = {std})")]
    InvalidNormalization { mean: f32, std: f32 },
    #[error("stage {stage}: expected {expected} parameters, found {found}")]
    ParameterCountMismatch {
        stage: usize,
        expected: usize,
        found: usize,
    },
    #[error("denoiser architecture mismatch: expected {expected}, found {found}")]
    ArchitectureMismatch { expected: String, found: String },
    #[error("stage {0}: data consistency variant disagrees with checkpoint")]
    ConsistencyMismatch(usize),
    #[error("stage {0} is frozen and cannot be updated")]
    FrozenStage(usize),
    #[error("invalid growth transition: {0}")]
    InvalidTransition(String),
    #[error("{0} is not supported")]
    Unsupported(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("toml write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl ReconError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], found: &[usize]) -> Self {
        ReconError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}
