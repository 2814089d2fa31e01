use crate::error::ReconError;
use crate::mask::SamplingMask;
use crate::signal_model::FourierTransformPair;
use ndarray::{Array2, ArrayView2, Zip};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

/// per-sample image normalization statistics. Cascade stages operate on `(x - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: f32,
    pub std: f32,
}

impl Normalization {
    pub fn new(mean: f32, std: f32) -> Result<Self, ReconError> {
        let n = Self { mean, std };
        n.validate()?;
        Ok(n)
    }

    pub fn identity() -> Self {
        Self { mean: 0., std: 1. }
    }

    /// statistics of the magnitude of an image
    pub fn of_magnitude(image: ArrayView2<Complex32>) -> Result<Self, ReconError> {
        let n = image.len().max(1) as f32;
        let mean = image.iter().map(|v| v.norm()).sum::<f32>() / n;
        let var = image.iter().map(|v| (v.norm() - mean).powi(2)).sum::<f32>() / n;
        Self::new(mean, var.sqrt().max(f32::EPSILON))
    }

    pub fn validate(&self) -> Result<(), ReconError> {
        if !self.mean.is_finite() || !self.std.is_finite() || self.std <= 0. {
            return Err(ReconError::InvalidNormalization { mean: self.mean, std: self.std });
        }
        Ok(())
    }

    pub fn normalize(&self, x: ArrayView2<Complex32>) -> Array2<Complex32> {
        x.mapv(|v| (v - self.mean) / self.std)
    }

    pub fn denormalize(&self, x: ArrayView2<Complex32>) -> Array2<Complex32> {
        x.mapv(|v| v * self.std + self.mean)
    }
}

/// Data consistency correction applied after a stage's denoiser. The fixed variant replaces the
/// estimated k-space at every acquired location with the measurement. The learnable variant
/// blends estimate and measurement at acquired locations with a trainable scalar `lambda`;
/// lambda = 0 is strict consistency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DataConsistency {
    Fixed,
    Learnable { lambda: f32 },
}

impl DataConsistency {
    pub fn lambda(&self) -> Option<f32> {
        match self {
            DataConsistency::Fixed => None,
            DataConsistency::Learnable { lambda } => Some(*lambda),
        }
    }

    /// returns the same variant with a new lambda. Fixed operators have no lambda to set.
    pub fn with_lambda(&self, lambda: Option<f32>) -> Result<Self, ReconError> {
        match (self, lambda) {
            (DataConsistency::Fixed, None) => Ok(DataConsistency::Fixed),
            (DataConsistency::Learnable { .. }, Some(lambda)) => {
                if !lambda.is_finite() {
                    return Err(ReconError::NonFinite("data consistency lambda".to_string()));
                }
                Ok(DataConsistency::Learnable { lambda })
            }
            _ => Err(ReconError::InvalidParams("lambda does not match the data consistency variant".to_string())),
        }
    }

    /// corrects a normalized image estimate against the measured k-space and returns the
    /// corrected, normalized image
    pub fn apply(
        &self,
        ft: &FourierTransformPair,
        kspace: ArrayView2<Complex32>,
        mask: &SamplingMask,
        estimate: ArrayView2<Complex32>,
        norm: Normalization,
    ) -> Result<Array2<Complex32>, ReconError> {
        norm.validate()?;
        let (rows, cols) = kspace.dim();
        if estimate.dim() != (rows, cols) {
            return Err(ReconError::shape("denoised estimate", kspace.shape(), estimate.shape()));
        }
        let m = mask.expand(rows, cols)?;

        let raw = norm.denormalize(estimate);
        let mut k_est = ft.to_kspace(raw.view())?;

        match *self {
            DataConsistency::Fixed => {
                Zip::from(&mut k_est).and(&kspace).and(&m).for_each(|k_hat, &k, &w| {
                    *k_hat = k * w + *k_hat * (1. - w);
                });
            }
            DataConsistency::Learnable { lambda } => {
                if !lambda.is_finite() {
                    return Err(ReconError::NonFinite("data consistency lambda".to_string()));
                }
                Zip::from(&mut k_est).and(&kspace).and(&m).for_each(|k_hat, &k, &w| {
                    let blended = k + (*k_hat - k) * lambda;
                    *k_hat = blended * w + *k_hat * (1. - w);
                });
            }
        }

        let corrected = ft.to_image(k_est.view())?;
        Ok(norm.normalize(corrected.view()))
    }
}

#[cfg(test)]
mod tests {
    use crate::consistency::{DataConsistency, Normalization};
    use crate::mask::SamplingMask;
    use crate::signal_model::FourierTransformPair;
    use ndarray::Array2;
    use num_complex::Complex32;

    const ROWS: usize = 12;
    const COLS: usize = 10;

    fn measured() -> Array2<Complex32> {
        Array2::from_shape_fn((ROWS, COLS), |(i, j)| Complex32::new((i * j) as f32 * 0.05 + 1., i as f32 - j as f32 * 0.5))
    }

    fn estimate() -> Array2<Complex32> {
        Array2::from_shape_fn((ROWS, COLS), |(i, j)| Complex32::new(((i + 2 * j) as f32).sin(), 0.2 * (i as f32).cos()))
    }

    fn mask() -> SamplingMask {
        SamplingMask::from_acquired(&[true, false, false, true, true, true, false, true, false, false])
    }

    #[test]
    fn test_fixed_variant_matches_measurements() {
        let ft = FourierTransformPair::new(ROWS, COLS).unwrap();
        let norm = Normalization::new(0.3, 2.0).unwrap();
        let k = measured();
        let x = estimate();
        let out = DataConsistency::Fixed.apply(&ft, k.view(), &mask(), x.view(), norm).unwrap();

        let k_out = ft.to_kspace(norm.denormalize(out.view()).view()).unwrap();
        let k_hat = ft.to_kspace(norm.denormalize(x.view()).view()).unwrap();
        let w = mask().expand(ROWS, COLS).unwrap();
        for ((idx, &m), (ko, kh)) in w.indexed_iter().zip(k_out.iter().zip(k_hat.iter())) {
            if m == 1. {
                assert!((ko - k[idx]).norm() < 1e-3, "acquired frequency {:?} not consistent", idx);
            } else {
                assert!((ko - kh).norm() < 1e-3, "unacquired frequency {:?} altered", idx);
            }
        }
    }

    #[test]
    fn test_learnable_converges_to_fixed() {
        let ft = FourierTransformPair::new(ROWS, COLS).unwrap();
        let norm = Normalization::new(-0.1, 0.7).unwrap();
        let k = measured();
        let x = estimate();
        let fixed = DataConsistency::Fixed.apply(&ft, k.view(), &mask(), x.view(), norm).unwrap();

        let mut previous = f32::INFINITY;
        for lambda in [0.5, 0.1, 1e-2, 1e-4, 0.] {
            let out = DataConsistency::Learnable { lambda }.apply(&ft, k.view(), &mask(), x.view(), norm).unwrap();
            let diff = out.iter().zip(fixed.iter()).map(|(a, b)| (a - b).norm()).fold(0., f32::max);
            assert!(diff <= previous + 1e-5, "difference grew as lambda shrank");
            previous = diff;
        }
        assert!(previous < 1e-4);
    }

    #[test]
    fn test_learnable_with_unit_lambda_keeps_estimate() {
        let ft = FourierTransformPair::new(ROWS, COLS).unwrap();
        let norm = Normalization::identity();
        let x = estimate();
        let out = DataConsistency::Learnable { lambda: 1. }.apply(&ft, measured().view(), &mask(), x.view(), norm).unwrap();
        let diff = out.iter().zip(x.iter()).map(|(a, b)| (a - b).norm()).fold(0., f32::max);
        assert!(diff < 1e-4);
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let ft = FourierTransformPair::new(ROWS, COLS).unwrap();
        let norm = Normalization::identity();
        let x = Array2::from_elem((ROWS, COLS - 1), Complex32::ZERO);
        assert!(DataConsistency::Fixed.apply(&ft, measured().view(), &mask(), x.view(), norm).is_err());
        let short_mask = SamplingMask::from_acquired(&[true; 4]);
        assert!(DataConsistency::Fixed.apply(&ft, measured().view(), &short_mask, estimate().view(), norm).is_err());
    }

    #[test]
    fn test_invalid_normalization() {
        assert!(Normalization::new(0., 0.).is_err());
        assert!(Normalization::new(f32::NAN, 1.).is_err());
        assert!(DataConsistency::Learnable { lambda: 0.1 }.with_lambda(Some(f32::INFINITY)).is_err());
        assert!(DataConsistency::Fixed.with_lambda(Some(0.1)).is_err());
    }
}
