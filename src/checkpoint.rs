use crate::cascade::{CascadeConfiguration, CascadeStage};
use crate::consistency::DataConsistency;
use crate::denoiser::{Denoiser, ParameterBlob};
use crate::error::ReconError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// persisted values of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub parameters: ParameterBlob,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda: Option<f32>,
}

/// Persisted cascade: stage index -> stage values. Loading requires a configuration with the
/// same number of stages; nothing is ever truncated or padded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeCheckpoint {
    pub architecture: String,
    pub stages: BTreeMap<usize, StageCheckpoint>,
}

/// single-stage denoiser weights used to initialize every newly appended stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainedWeights {
    pub architecture: String,
    pub parameters: ParameterBlob,
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut f = File::create(path)?;
    f.write_all(bytes)?;
    f.sync_all()
}

/// writes to a sibling temporary file, syncs it, then renames it over `path` so a reader never
/// observes a partially written checkpoint. The temporary file is removed if any step fails.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReconError> {
    let tmp = path.with_extension("tmp");
    if let Err(e) = write_synced(&tmp, bytes).and_then(|_| fs::rename(&tmp, path)) {
        if tmp.is_file() {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                warn!("could not remove {}: {cleanup}", tmp.display());
            }
        }
        return Err(e.into());
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReconError> {
    let json = serde_json::to_string_pretty(value)?;
    write_atomic(path, json.as_bytes())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ReconError> {
    let s = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&s)?)
}

impl CascadeCheckpoint {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ReconError> {
        let path = path.as_ref();
        write_json(path, self)?;
        info!("wrote {} stage checkpoint to {}", self.stage_count(), path.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReconError> {
        let path = path.as_ref();
        let ckpt: Self = read_json(path)?;
        debug!("read {} stage checkpoint from {}", ckpt.stage_count(), path.display());
        Ok(ckpt)
    }
}

impl PretrainedWeights {
    pub fn new(denoiser: &dyn Denoiser, parameters: ParameterBlob) -> Self {
        Self {
            architecture: denoiser.architecture().to_string(),
            parameters,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ReconError> {
        write_json(path.as_ref(), self)
    }

    /// a missing weights file is fatal
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReconError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ReconError::MissingPretrained(path.to_path_buf()));
        }
        let weights: Self = read_json(path)?;
        info!("loaded pretrained {} weights ({} parameters) from {}", weights.architecture, weights.parameters.len(), path.display());
        Ok(weights)
    }

    /// builds a fresh trainable stage initialized from these weights
    pub fn stage(&self, denoiser: Arc<dyn Denoiser>, consistency: DataConsistency) -> Result<CascadeStage, ReconError> {
        if denoiser.architecture() != self.architecture {
            return Err(ReconError::ArchitectureMismatch {
                expected: denoiser.architecture().to_string(),
                found: self.architecture.clone(),
            });
        }
        CascadeStage::new(denoiser, self.parameters.clone(), consistency)
    }
}

impl CascadeConfiguration {
    pub fn to_checkpoint(&self) -> CascadeCheckpoint {
        let architecture = self.stages().first().map(|s| s.denoiser().architecture().to_string()).unwrap_or_default();
        let stages = self
            .stages()
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (i, StageCheckpoint {
                    parameters: s.parameters().clone(),
                    lambda: s.lambda(),
                })
            })
            .collect();
        CascadeCheckpoint { architecture, stages }
    }

    /// returns this configuration with every stage's values replaced from the checkpoint.
    /// Trainable flags are kept. The stage counts must agree exactly.
    pub fn load_checkpoint(&self, ckpt: &CascadeCheckpoint) -> Result<Self, ReconError> {
        if ckpt.stage_count() != self.stage_count() {
            return Err(ReconError::StageCountMismatch {
                expected: self.stage_count(),
                found: ckpt.stage_count(),
            });
        }
        let mut config = self.clone();
        for (index, stage) in self.stages().iter().enumerate() {
            if stage.denoiser().architecture() != ckpt.architecture {
                return Err(ReconError::ArchitectureMismatch {
                    expected: stage.denoiser().architecture().to_string(),
                    found: ckpt.architecture.clone(),
                });
            }
            let values = ckpt.stages.get(&index).ok_or(ReconError::StageCountMismatch {
                expected: self.stage_count(),
                found: ckpt.stage_count(),
            })?;
            config = config.with_stage_values(index, values.parameters.clone(), values.lambda)?;
        }
        Ok(config)
    }
}
