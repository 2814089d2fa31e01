use crate::error::ReconError;
use ndarray::{Array1, Array2, ArrayView2};
use num_complex::Complex32;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
enum MaskKind {
    /// one weight per k-space column (phase encode line), broadcast across rows
    Lines(Array1<f32>),
    Full(Array2<f32>),
}

/// Binary k-space sampling mask. 1 marks an acquired frequency, 0 one that was skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingMask {
    kind: MaskKind,
}

fn check_binary<'a>(values: impl Iterator<Item = &'a f32>) -> Result<(), ReconError> {
    for &v in values {
        if v != 0. && v != 1. {
            return Err(ReconError::InvalidMask(format!("mask values must be 0 or 1, found {v}")));
        }
    }
    Ok(())
}

impl SamplingMask {
    /// line mask from per-column weights
    pub fn from_lines(weights: Array1<f32>) -> Result<Self, ReconError> {
        check_binary(weights.iter())?;
        Ok(Self { kind: MaskKind::Lines(weights) })
    }

    pub fn from_acquired(acquired: &[bool]) -> Self {
        let weights = acquired.iter().map(|&a| if a { 1. } else { 0. }).collect::<Array1<f32>>();
        Self { kind: MaskKind::Lines(weights) }
    }

    /// mask covering every k-space sample individually
    pub fn from_full(weights: Array2<f32>) -> Result<Self, ReconError> {
        check_binary(weights.iter())?;
        Ok(Self { kind: MaskKind::Full(weights) })
    }

    /// a mask with every frequency acquired
    pub fn fully_sampled(cols: usize) -> Self {
        Self { kind: MaskKind::Lines(Array1::ones(cols)) }
    }

    /// expands the mask to a (rows x cols) weight array. A line mask must match the column count,
    /// a full mask must match the shape exactly.
    pub fn expand(&self, rows: usize, cols: usize) -> Result<Array2<f32>, ReconError> {
        match &self.kind {
            MaskKind::Lines(w) => {
                if w.len() != cols {
                    return Err(ReconError::shape("sampling mask columns", &[cols], &[w.len()]));
                }
                Ok(Array2::from_shape_fn((rows, cols), |(_, c)| w[c]))
            }
            MaskKind::Full(w) => {
                if w.dim() != (rows, cols) {
                    return Err(ReconError::shape("sampling mask", &[rows, cols], w.shape()));
                }
                Ok(w.clone())
            }
        }
    }

    /// fraction of k-space samples acquired for a slice of the given shape
    pub fn acquired_fraction(&self, rows: usize, cols: usize) -> Result<f32, ReconError> {
        let w = self.expand(rows, cols)?;
        Ok(w.sum() / w.len().max(1) as f32)
    }

    /// zeroes every k-space sample that was not acquired
    pub fn under_sample(&self, kspace: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        let (rows, cols) = kspace.dim();
        let w = self.expand(rows, cols)?;
        let mut out = kspace.to_owned();
        out.zip_mut_with(&w, |k, &m| {
            if m == 0. {
                *k = Complex32::ZERO;
            }
        });
        Ok(out)
    }
}

/// Random cartesian line masks: a fully sampled band of low frequencies in the center of
/// k-space plus randomly chosen outer lines so that, on average, `1 / acceleration` of the
/// lines are acquired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomMaskFunc {
    pub center_fractions: Vec<f32>,
    pub accelerations: Vec<u32>,
}

impl Default for RandomMaskFunc {
    fn default() -> Self {
        Self {
            center_fractions: vec![0.08],
            accelerations: vec![4],
        }
    }
}

impl RandomMaskFunc {
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.center_fractions.is_empty() || self.center_fractions.len() != self.accelerations.len() {
            return Err(ReconError::InvalidParams(
                "center_fractions and accelerations must be non-empty and of equal length".to_string(),
            ));
        }
        if self.accelerations.iter().any(|&a| a == 0) {
            return Err(ReconError::InvalidParams("accelerations must be positive".to_string()));
        }
        if self.center_fractions.iter().any(|f| !(0. ..=1.).contains(f)) {
            return Err(ReconError::InvalidParams("center fractions must lie in [0, 1]".to_string()));
        }
        Ok(())
    }

    /// draws a line mask for a k-space slice with `cols` phase encode lines
    pub fn sample<R: Rng + ?Sized>(&self, cols: usize, rng: &mut R) -> Result<SamplingMask, ReconError> {
        self.validate()?;
        let choice = rng.random_range(0..self.accelerations.len());
        let center_fraction = self.center_fractions[choice];
        let acceleration = self.accelerations[choice] as f32;

        let num_low = ((cols as f32 * center_fraction).round() as usize).min(cols);
        let prob = if cols > num_low {
            ((cols as f32 / acceleration - num_low as f32) / (cols - num_low) as f32).clamp(0., 1.)
        } else {
            0.
        };

        let mut acquired = (0..cols).map(|_| rng.random::<f32>() < prob).collect::<Vec<_>>();
        let pad = (cols - num_low + 1) / 2;
        acquired[pad..pad + num_low].iter_mut().for_each(|a| *a = true);

        Ok(SamplingMask::from_acquired(&acquired))
    }
}
