// Additive k-space noise augmentation
// Gaussian noise is added to both quadratures of every sample. Salt noise replaces a random subset
// of samples with spikes of a fixed magnitude and random phase.

use crate::error::ReconError;
use crate::params::NoiseParams;
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use tracing::debug;

/// kind of noise added to the acquired k-space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KspaceNoise {
    #[default]
    None,
    Normal,
    Salt,
    NormalAndSalt,
}

impl KspaceNoise {
    fn has_normal(self) -> bool {
        matches!(self, KspaceNoise::Normal | KspaceNoise::NormalAndSalt)
    }

    fn has_salt(self) -> bool {
        matches!(self, KspaceNoise::Salt | KspaceNoise::NormalAndSalt)
    }
}

#[derive(Debug, Clone)]
pub struct NoiseAugmenter {
    params: NoiseParams,
}

impl NoiseAugmenter {
    pub fn new(params: NoiseParams) -> Result<Self, ReconError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &NoiseParams {
        &self.params
    }

    /// returns a noisy copy of `kspace`. Gaussian noise is applied before salt spikes so a spike
    /// keeps its exact magnitude.
    pub fn apply<R: Rng + ?Sized>(&self, kspace: ArrayView2<Complex32>, rng: &mut R) -> Result<Array2<Complex32>, ReconError> {
        let mut noisy = kspace.to_owned();
        let kind = self.params.kind;

        if kind.has_normal() {
            let normal = Normal::new(0f32, self.params.normal_std)
                .map_err(|e| ReconError::InvalidParams(format!("normal noise std {}: {e}", self.params.normal_std)))?;
            noisy.mapv_inplace(|v| v + Complex32::new(normal.sample(rng), normal.sample(rng)));
        }

        if kind.has_salt() {
            let mut hits = 0usize;
            for v in noisy.iter_mut() {
                if rng.random_bool(self.params.salt_probability) {
                    *v = Complex32::from_polar(self.params.salt_level, rng.random_range(-PI..PI));
                    hits += 1;
                }
            }
            debug!("salted {hits} of {} k-space samples", noisy.len());
        }

        Ok(noisy)
    }
}
