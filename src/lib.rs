pub mod error;
pub mod fftshift;
pub mod signal_model;
pub mod mask;
pub mod consistency;
pub mod denoiser;
pub mod cascade;
pub mod checkpoint;
pub mod training;
pub mod growth;
pub mod motion;
pub mod noise;
pub mod params;

pub use cascade::{CascadeConfiguration, CascadeReconstructor, CascadeStage, ReconSample};
pub use checkpoint::{CascadeCheckpoint, PretrainedWeights};
pub use consistency::{DataConsistency, Normalization};
pub use denoiser::{Denoiser, ParameterBlob, ResidualConvDenoiser};
pub use error::ReconError;
pub use growth::{GrowthPhase, GrowthScheduler};
pub use mask::{RandomMaskFunc, SamplingMask};
pub use motion::{MotionArtifactSynthesizer, MotionDirection};
pub use noise::{KspaceNoise, NoiseAugmenter};
pub use params::{CascadeParams, NoiseParams};
pub use signal_model::FourierTransformPair;
pub use training::{ReferenceTrainer, TrainingLoop, TrainingRound};
