// Reference training collaborators. Production training (optimizer, schedules, batching on an
// accelerator) lives outside this crate behind [TrainingLoop]; the pieces here are small enough
// to exercise the growth protocol and the frozen / trainable partition end to end.

use crate::cascade::{CascadeConfiguration, CascadeReconstructor, ReconSample};
use crate::denoiser::ParameterBlob;
use crate::error::ReconError;
use crate::signal_model::FourierTransformPair;
use ndarray::ArrayView2;
use num_complex::Complex32;
use rayon::prelude::*;
use tracing::{debug, info};

/// what the growth scheduler asks the external training loop to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingRound {
    pub stage_count: usize,
    /// true for the final round, where every stage is fine-tuned together
    pub joint: bool,
    pub accumulate_grad_batches: usize,
    pub epochs: usize,
}

/// External training loop. Receives the configuration to train and returns the trained one.
/// Frozen stages must be returned untouched.
pub trait TrainingLoop {
    fn fit(&mut self, configuration: &CascadeConfiguration, round: &TrainingRound) -> Result<CascadeConfiguration, ReconError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageGradient {
    pub parameters: Vec<f32>,
    pub lambda: Option<f32>,
}

/// per-stage gradients, laid out like the configuration they were computed for
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub stages: Vec<StageGradient>,
}

impl Gradients {
    pub fn zeros_like(config: &CascadeConfiguration) -> Self {
        let stages = config
            .stages()
            .iter()
            .map(|s| StageGradient {
                parameters: vec![0.; s.parameters().len()],
                lambda: s.lambda().map(|_| 0.),
            })
            .collect();
        Self { stages }
    }

    pub fn is_finite(&self) -> bool {
        self.stages.iter().all(|s| s.parameters.iter().all(|g| g.is_finite()) && s.lambda.map_or(true, f32::is_finite))
    }

    /// true if every entry of the stage's gradient is exactly zero
    pub fn is_zero(&self, stage: usize) -> bool {
        self.stages.get(stage).map_or(true, |s| s.parameters.iter().all(|&g| g == 0.) && s.lambda.map_or(true, |l| l == 0.))
    }

    fn accumulate(&mut self, other: &Gradients) {
        for (a, b) in self.stages.iter_mut().zip(&other.stages) {
            a.parameters.iter_mut().zip(&b.parameters).for_each(|(x, y)| *x += y);
            if let (Some(x), Some(y)) = (a.lambda.as_mut(), b.lambda) {
                *x += y;
            }
        }
    }

    fn scale(&mut self, factor: f32) {
        for s in &mut self.stages {
            s.parameters.iter_mut().for_each(|g| *g *= factor);
            if let Some(l) = s.lambda.as_mut() {
                *l *= factor;
            }
        }
    }
}

/// mean absolute difference between the magnitude of a normalized reconstruction and the
/// normalized target magnitude
pub fn l1_magnitude_loss(prediction: ArrayView2<Complex32>, target: ArrayView2<f32>) -> Result<f32, ReconError> {
    if prediction.dim() != target.dim() {
        return Err(ReconError::shape("loss target", prediction.shape(), target.shape()));
    }
    let n = prediction.len().max(1) as f32;
    let loss = prediction.iter().zip(target.iter()).map(|(p, t)| (p.norm() - t).abs()).sum::<f32>() / n;
    if !loss.is_finite() {
        return Err(ReconError::NonFinite("training loss".to_string()));
    }
    Ok(loss)
}

/// loss of the cascade's prediction for one training sample
pub fn sample_loss(config: &CascadeConfiguration, sample: &ReconSample) -> Result<f32, ReconError> {
    let ft = FourierTransformPair::new(sample.dims().0, sample.dims().1)?;
    sample_loss_with(&ft, config, sample)
}

fn sample_loss_with(ft: &FourierTransformPair, config: &CascadeConfiguration, sample: &ReconSample) -> Result<f32, ReconError> {
    let target = sample
        .target
        .as_ref()
        .ok_or_else(|| ReconError::InvalidParams(format!("sample {}:{} has no target", sample.file_name, sample.slice_index)))?;
    let prediction = CascadeReconstructor::new(config).predict_with(ft, sample)?;
    l1_magnitude_loss(prediction.view(), target.view())
}

/// Central finite difference gradients of the sample loss with respect to every trainable
/// stage's parameters and lambda. Frozen stages are never perturbed; their gradients are zero.
/// One transform pair is planned per call and shared by every perturbed evaluation.
pub fn finite_difference_gradients(config: &CascadeConfiguration, sample: &ReconSample, epsilon: f32) -> Result<Gradients, ReconError> {
    let ft = FourierTransformPair::new(sample.dims().0, sample.dims().1)?;
    let mut grads = Gradients::zeros_like(config);
    for index in config.trainable_indices() {
        let stage = &config.stages()[index];
        let params = stage.parameters().0.clone();
        let lambda = stage.lambda();

        for p in 0..params.len() {
            let mut plus = params.clone();
            plus[p] += epsilon;
            let mut minus = params.clone();
            minus[p] -= epsilon;
            let lp = sample_loss_with(&ft, &config.with_stage_update(index, ParameterBlob(plus), lambda)?, sample)?;
            let lm = sample_loss_with(&ft, &config.with_stage_update(index, ParameterBlob(minus), lambda)?, sample)?;
            grads.stages[index].parameters[p] = (lp - lm) / (2. * epsilon);
        }

        if let Some(l) = lambda {
            let lp = sample_loss_with(&ft, &config.with_stage_update(index, params.clone().into(), Some(l + epsilon))?, sample)?;
            let lm = sample_loss_with(&ft, &config.with_stage_update(index, params.clone().into(), Some(l - epsilon))?, sample)?;
            grads.stages[index].lambda = Some((lp - lm) / (2. * epsilon));
        }
    }
    if !grads.is_finite() {
        return Err(ReconError::NonFinite("gradients".to_string()));
    }
    Ok(grads)
}

/// plain stochastic gradient descent over the trainable stages
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn step(&self, config: &CascadeConfiguration, grads: &Gradients) -> Result<CascadeConfiguration, ReconError> {
        if grads.stages.len() != config.stage_count() {
            return Err(ReconError::StageCountMismatch {
                expected: config.stage_count(),
                found: grads.stages.len(),
            });
        }
        if !grads.is_finite() {
            return Err(ReconError::NonFinite("gradients".to_string()));
        }
        let mut updated = config.clone();
        for index in config.trainable_indices() {
            let stage = &config.stages()[index];
            let g = &grads.stages[index];
            if g.parameters.len() != stage.parameters().len() {
                return Err(ReconError::ParameterCountMismatch {
                    stage: index,
                    expected: stage.parameters().len(),
                    found: g.parameters.len(),
                });
            }
            let params = stage.parameters().0.iter().zip(&g.parameters).map(|(p, g)| p - self.learning_rate * g).collect::<Vec<_>>();
            let lambda = stage.lambda().map(|l| l - self.learning_rate * g.lambda.unwrap_or(0.));
            updated = updated.with_stage_update(index, ParameterBlob(params), lambda)?;
        }
        Ok(updated)
    }
}

/// Minimal [TrainingLoop]: finite difference gradients averaged over `accumulate_grad_batches`
/// samples per optimizer step.
#[derive(Debug, Clone)]
pub struct ReferenceTrainer {
    pub samples: Vec<ReconSample>,
    pub optimizer: Sgd,
    pub epsilon: f32,
}

impl ReferenceTrainer {
    pub fn new(samples: Vec<ReconSample>, learning_rate: f32) -> Self {
        Self {
            samples,
            optimizer: Sgd { learning_rate },
            epsilon: 1e-2,
        }
    }

    pub fn mean_loss(&self, config: &CascadeConfiguration) -> Result<f32, ReconError> {
        let losses = self.samples.par_iter().map(|s| sample_loss(config, s)).collect::<Result<Vec<_>, _>>()?;
        Ok(losses.iter().sum::<f32>() / losses.len().max(1) as f32)
    }
}

impl TrainingLoop for ReferenceTrainer {
    fn fit(&mut self, configuration: &CascadeConfiguration, round: &TrainingRound) -> Result<CascadeConfiguration, ReconError> {
        if self.samples.is_empty() {
            return Err(ReconError::InvalidParams("no training samples".to_string()));
        }
        let mut config = configuration.clone();
        let batch = round.accumulate_grad_batches.max(1);
        for epoch in 0..round.epochs {
            for chunk in self.samples.chunks(batch) {
                let per_sample = chunk
                    .par_iter()
                    .map(|s| finite_difference_gradients(&config, s, self.epsilon))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut grads = Gradients::zeros_like(&config);
                per_sample.iter().for_each(|g| grads.accumulate(g));
                grads.scale(1. / chunk.len() as f32);
                config = self.optimizer.step(&config, &grads)?;
            }
            let loss = self.mean_loss(&config)?;
            debug!("stages {} epoch {}: loss {:.5}", round.stage_count, epoch + 1, loss);
        }
        info!("finished training round for {} stages (joint = {})", round.stage_count, round.joint);
        Ok(config)
    }
}
