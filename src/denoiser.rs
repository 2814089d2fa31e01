use crate::error::ReconError;
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Flat parameter vector of one denoiser instance. Parameters live outside the denoiser so that
/// stages sharing an architecture can be frozen, copied and checkpointed as plain values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParameterBlob(pub Vec<f32>);

impl ParameterBlob {
    pub fn zeros(n: usize) -> Self {
        Self(vec![0.; n])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

impl From<Vec<f32>> for ParameterBlob {
    fn from(v: Vec<f32>) -> Self {
        ParameterBlob(v)
    }
}

/// Image-to-image capability consumed by a cascade stage: maps a normalized image to a
/// normalized image of the same shape, given its parameters.
pub trait Denoiser: Debug + Send + Sync {
    /// architecture tag stored with checkpoints and pretrained weights
    fn architecture(&self) -> &str;

    fn parameter_count(&self) -> usize;

    fn denoise(&self, params: &ParameterBlob, image: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError>;
}

/// Residual 3x3 convolution, `x - conv(x, w)`, with real weights applied to the real and
/// imaginary parts alike. Borders are zero padded. All-zero weights are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResidualConvDenoiser;

impl ResidualConvDenoiser {
    pub const KERNEL: usize = 3;
}

impl Denoiser for ResidualConvDenoiser {
    fn architecture(&self) -> &str {
        "residual-conv3x3"
    }

    fn parameter_count(&self) -> usize {
        Self::KERNEL * Self::KERNEL
    }

    fn denoise(&self, params: &ParameterBlob, image: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        if params.len() != self.parameter_count() {
            return Err(ReconError::ParameterCountMismatch {
                stage: 0,
                expected: self.parameter_count(),
                found: params.len(),
            });
        }
        let w = params.as_slice();
        let (rows, cols) = image.dim();
        let half = (Self::KERNEL / 2) as isize;

        Ok(Array2::from_shape_fn((rows, cols), |(r, c)| {
            let mut acc = Complex32::ZERO;
            for kr in 0..Self::KERNEL {
                for kc in 0..Self::KERNEL {
                    let sr = r as isize + kr as isize - half;
                    let sc = c as isize + kc as isize - half;
                    if sr < 0 || sc < 0 || sr >= rows as isize || sc >= cols as isize {
                        continue;
                    }
                    acc += image[[sr as usize, sc as usize]] * w[kr * Self::KERNEL + kc];
                }
            }
            image[[r, c]] - acc
        }))
    }
}
