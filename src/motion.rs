// Synthetic inter-shot motion artifacts
// Phase encode lines of several neighbouring slices are fused into one sample, as if the patient
// had moved between the shots that acquired different bands of lines of the same image.

use crate::error::ReconError;
use crate::params::MotionParams;
use ndarray::{Array2, Array3, Axis};
use num_complex::Complex32;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// sweep direction of the fused bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionDirection {
    /// bands laid out from the first phase encode line onwards
    Top,
    /// bands laid out from the last phase encode line backwards
    Bottom,
    Left,
    Right,
}

impl MotionDirection {
    fn check_supported(self) -> Result<(), ReconError> {
        match self {
            MotionDirection::Top | MotionDirection::Bottom => Ok(()),
            MotionDirection::Left | MotionDirection::Right => {
                Err(ReconError::Unsupported(format!("readout-wise motion artifacts ({self:?})")))
            }
        }
    }
}

/// draws `n` non-negative fractions that sum to one: the gaps between the sorted points
/// {0, 1, u_1 .. u_(n-1)} with u_i uniform in [0, 1)
pub fn sum_to_one<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Result<Vec<f64>, ReconError> {
    if n == 0 {
        return Err(ReconError::InvalidParams("at least one slice is required".to_string()));
    }
    let mut points = Vec::with_capacity(n + 1);
    points.push(0.);
    points.push(1.);
    points.extend((0..n - 1).map(|_| rng.random::<f64>()));
    points.sort_by(f64::total_cmp);
    Ok(points.windows(2).map(|w| w[1] - w[0]).collect())
}

/// Converts fractions into integer line counts by truncation. The last count is recomputed as
/// the exact residual so the counts always sum to `total_lines`. If the residual would be negative
/// (only possible when the fractions sum to more than one), the last count is clamped to zero and
/// the deficit is taken one line at a time from the largest earlier counts.
pub fn split_lines(total_lines: usize, fractions: &[f64]) -> Result<Vec<usize>, ReconError> {
    if fractions.is_empty() {
        return Err(ReconError::InvalidParams("no slice fractions given".to_string()));
    }
    if fractions.iter().any(|f| !f.is_finite() || *f < 0.) {
        return Err(ReconError::InvalidParams(format!("slice fractions must be finite and non-negative: {fractions:?}")));
    }

    let total = total_lines as i64;
    let mut counts = fractions.iter().map(|f| (total_lines as f64 * f).trunc() as i64).collect::<Vec<_>>();
    let last = counts.len() - 1;
    let residual = total - counts[..last].iter().sum::<i64>();
    counts[last] = residual;

    if residual < 0 {
        warn!("line split residual is {residual}, redistributing the deficit over earlier slices");
        counts[last] = 0;
        let mut deficit = -residual;
        while deficit > 0 {
            let (idx, _) = counts
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))
                .ok_or_else(|| ReconError::InvalidParams("no slice fractions given".to_string()))?;
            counts[idx] -= 1;
            deficit -= 1;
        }
    }

    Ok(counts.into_iter().map(|c| c as usize).collect())
}

/// per-slice phase encode line counts and the direction the bands are laid out in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionArtifactPlan {
    pub line_counts: Vec<usize>,
    pub direction: MotionDirection,
}

impl MotionArtifactPlan {
    /// draws a random plan for `slices` source slices over `total_lines` phase encode lines
    pub fn random<R: Rng + ?Sized>(total_lines: usize, slices: usize, direction: MotionDirection, rng: &mut R) -> Result<Self, ReconError> {
        direction.check_supported()?;
        let fractions = sum_to_one(slices, rng)?;
        let line_counts = split_lines(total_lines, &fractions)?;
        debug!("motion artifact plan {:?} for {} lines", line_counts, total_lines);
        Ok(Self { line_counts, direction })
    }

    pub fn total_lines(&self) -> usize {
        self.line_counts.iter().sum()
    }

    /// source slice index for every phase encode line. Slice i owns the i-th contiguous band.
    pub fn line_assignment(&self) -> Result<Vec<usize>, ReconError> {
        self.direction.check_supported()?;
        let mut assignment = self
            .line_counts
            .iter()
            .enumerate()
            .flat_map(|(slice, &count)| std::iter::repeat(slice).take(count))
            .collect::<Vec<_>>();
        if self.direction == MotionDirection::Bottom {
            assignment.reverse();
        }
        Ok(assignment)
    }
}

/// Fuses source slices line by line according to `plan`. Each phase encode line (column) of the
/// output is taken whole from the slice assigned to it.
pub fn fuse_slices(slices: &[Array2<Complex32>], plan: &MotionArtifactPlan) -> Result<Array2<Complex32>, ReconError> {
    let first = slices.first().ok_or_else(|| ReconError::InvalidParams("no source slices".to_string()))?;
    if slices.len() != plan.line_counts.len() {
        return Err(ReconError::InvalidParams(format!(
            "plan covers {} slices but {} were given",
            plan.line_counts.len(),
            slices.len()
        )));
    }
    for s in slices {
        if s.dim() != first.dim() {
            return Err(ReconError::shape("motion artifact source slice", first.shape(), s.shape()));
        }
    }
    let lines = first.ncols();
    if plan.total_lines() != lines {
        return Err(ReconError::shape("motion artifact phase encode lines", &[lines], &[plan.total_lines()]));
    }

    let assignment = plan.line_assignment()?;
    let mut fused = Array2::<Complex32>::zeros(first.dim());
    for (c, mut line) in fused.axis_iter_mut(Axis(1)).enumerate() {
        line.assign(&slices[assignment[c]].column(c));
    }
    Ok(fused)
}

/// one corrupted sample together with the plan that produced it
#[derive(Debug, Clone)]
pub struct MotionArtifact {
    pub kspace: Array2<Complex32>,
    pub plan: MotionArtifactPlan,
}

impl MotionArtifact {
    /// real and imaginary composites stacked as a (2, rows, cols) array
    pub fn planes(&self) -> Array3<f32> {
        let (rows, cols) = self.kspace.dim();
        Array3::from_shape_fn((2, rows, cols), |(p, r, c)| {
            let v = self.kspace[[r, c]];
            if p == 0 { v.re } else { v.im }
        })
    }
}

/// Builds motion-corrupted k-space from `slices_per_artifact` source slices. The random source is
/// always supplied by the caller.
#[derive(Debug, Clone)]
pub struct MotionArtifactSynthesizer {
    params: MotionParams,
}

impl MotionArtifactSynthesizer {
    pub fn new(params: MotionParams) -> Result<Self, ReconError> {
        if !(0. ..=1.).contains(&params.probability) {
            return Err(ReconError::InvalidParams(format!("probability {} is outside [0, 1]", params.probability)));
        }
        if params.slices_per_artifact == 0 {
            return Err(ReconError::InvalidParams("slices_per_artifact must be at least 1".to_string()));
        }
        if params.directions.is_empty() {
            return Err(ReconError::InvalidParams("at least one motion direction is required".to_string()));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    /// always corrupts: draws a plan for the given direction and fuses the slices
    pub fn synthesize<R: Rng + ?Sized>(&self, slices: &[Array2<Complex32>], direction: MotionDirection, rng: &mut R) -> Result<MotionArtifact, ReconError> {
        if slices.len() != self.params.slices_per_artifact {
            return Err(ReconError::InvalidParams(format!(
                "expected {} source slices, found {}",
                self.params.slices_per_artifact,
                slices.len()
            )));
        }
        let lines = slices[0].ncols();
        let plan = MotionArtifactPlan::random(lines, slices.len(), direction, rng)?;
        let kspace = fuse_slices(slices, &plan)?;
        Ok(MotionArtifact { kspace, plan })
    }

    /// picks a direction from the configured set, then corrupts with the configured probability.
    /// Returns `None` when the sample is left untouched.
    pub fn maybe_corrupt<R: Rng + ?Sized>(&self, slices: &[Array2<Complex32>], rng: &mut R) -> Result<Option<MotionArtifact>, ReconError> {
        let direction = *self
            .params
            .directions
            .choose(rng)
            .ok_or_else(|| ReconError::InvalidParams("at least one motion direction is required".to_string()))?;
        direction.check_supported()?;
        if !rng.random_bool(self.params.probability) {
            return Ok(None);
        }
        self.synthesize(slices, direction, rng).map(Some)
    }
}
