use crate::consistency::DataConsistency;
use crate::error::ReconError;
use crate::mask::RandomMaskFunc;
use crate::motion::MotionDirection;
use crate::noise::KspaceNoise;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// progressive growth settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrowthParams {
    /// number of stages in the final cascade
    pub num_stages: usize,
    /// use the learnable (lambda) data consistency instead of the strict one
    pub learnable_consistency: bool,
    pub lambda_init: f32,
    pub accumulate_grad_batches: usize,
    /// gradient accumulation for the joint fine-tuning round
    pub final_accumulate_grad_batches: usize,
    pub epochs: usize,
    pub final_epochs: usize,
}

impl Default for GrowthParams {
    fn default() -> Self {
        Self {
            num_stages: 5,
            learnable_consistency: false,
            lambda_init: 0.01,
            accumulate_grad_batches: 3,
            final_accumulate_grad_batches: 32,
            epochs: 1,
            final_epochs: 1,
        }
    }
}

impl GrowthParams {
    pub fn consistency(&self) -> DataConsistency {
        if self.learnable_consistency {
            DataConsistency::Learnable { lambda: self.lambda_init }
        } else {
            DataConsistency::Fixed
        }
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if self.num_stages == 0 {
            return Err(ReconError::InvalidParams("num_stages must be at least 1".to_string()));
        }
        if self.accumulate_grad_batches == 0 || self.final_accumulate_grad_batches == 0 {
            return Err(ReconError::InvalidParams("gradient accumulation must be at least 1".to_string()));
        }
        if !self.lambda_init.is_finite() {
            return Err(ReconError::NonFinite("lambda_init".to_string()));
        }
        Ok(())
    }
}

/// motion artifact augmentation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotionParams {
    /// likelihood that a training sample is corrupted
    pub probability: f64,
    pub slices_per_artifact: usize,
    pub directions: Vec<MotionDirection>,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            probability: 0.99,
            slices_per_artifact: 4,
            directions: vec![MotionDirection::Top, MotionDirection::Bottom],
        }
    }
}

/// k-space noise augmentation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoiseParams {
    pub kind: KspaceNoise,
    /// standard deviation of the gaussian noise on each quadrature
    pub normal_std: f32,
    /// magnitude of a salt spike
    pub salt_level: f32,
    /// likelihood that a k-space sample is replaced by a spike
    pub salt_probability: f64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            kind: KspaceNoise::None,
            normal_std: 100.,
            salt_level: 5e4,
            salt_probability: 0.001,
        }
    }
}

impl NoiseParams {
    pub fn validate(&self) -> Result<(), ReconError> {
        if !self.normal_std.is_finite() || self.normal_std < 0. {
            return Err(ReconError::InvalidParams(format!("normal_std {} must be finite and non-negative", self.normal_std)));
        }
        if !self.salt_level.is_finite() || self.salt_level < 0. {
            return Err(ReconError::InvalidParams(format!("salt_level {} must be finite and non-negative", self.salt_level)));
        }
        if !(0. ..=1.).contains(&self.salt_probability) {
            return Err(ReconError::InvalidParams(format!("salt_probability {} is outside [0, 1]", self.salt_probability)));
        }
        Ok(())
    }
}

/// parameters for a progressive cascade training run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CascadeParams {
    pub learning_rate: f32,
    pub seed: u64,
    pub pretrained_weights: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub growth: GrowthParams,
    pub motion: MotionParams,
    pub noise: NoiseParams,
    pub mask: RandomMaskFunc,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            seed: 42,
            pretrained_weights: PathBuf::from("denoiser-pretrained.json"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            growth: GrowthParams::default(),
            motion: MotionParams::default(),
            noise: NoiseParams::default(),
            mask: RandomMaskFunc::default(),
        }
    }
}

impl CascadeParams {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ReconError> {
        let s = fs::read_to_string(path.as_ref())?;
        let params: Self = toml::from_str(&s)?;
        params.growth.validate()?;
        params.noise.validate()?;
        params.mask.validate()?;
        Ok(params)
    }

    pub fn to_toml_string(&self) -> Result<String, ReconError> {
        let mut s = toml::to_string(self)?;
        s.push('\n');
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use crate::consistency::DataConsistency;
    use crate::motion::MotionDirection;
    use crate::noise::KspaceNoise;
    use crate::params::{CascadeParams, GrowthParams};
    use std::fs;

    #[test]
    fn test_defaults_survive_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        let params = CascadeParams::default();
        fs::write(&path, params.to_toml_string().unwrap()).unwrap();
        let read = CascadeParams::from_toml_file(&path).unwrap();
        assert_eq!(read, params);
        assert_eq!(read.motion.directions, vec![MotionDirection::Top, MotionDirection::Bottom]);
    }

    #[test]
    fn test_noise_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        let mut params = CascadeParams::default();
        params.noise.kind = KspaceNoise::NormalAndSalt;
        let toml_string = params.to_toml_string().unwrap();
        assert!(toml_string.contains("[noise]"));
        assert!(toml_string.contains("kind = \"normal_and_salt\""));
        fs::write(&path, &toml_string).unwrap();
        assert_eq!(CascadeParams::from_toml_file(&path).unwrap().noise.kind, KspaceNoise::NormalAndSalt);

        params.noise.salt_probability = 2.;
        fs::write(&path, params.to_toml_string().unwrap()).unwrap();
        assert!(CascadeParams::from_toml_file(&path).is_err());
    }

    #[test]
    fn test_invalid_growth_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        let mut params = CascadeParams::default();
        params.growth.num_stages = 0;
        fs::write(&path, params.to_toml_string().unwrap()).unwrap();
        assert!(CascadeParams::from_toml_file(&path).is_err());
    }

    #[test]
    fn test_consistency_variant() {
        let mut g = GrowthParams::default();
        assert_eq!(g.consistency(), DataConsistency::Fixed);
        g.learnable_consistency = true;
        assert_eq!(g.consistency(), DataConsistency::Learnable { lambda: 0.01 });
    }
}
