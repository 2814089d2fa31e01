// Forward and inverse MRI signal model
// the purpose of this module is to move single-channel 2-D slices between image space and
// k-space with a centered, unitary fft so that the transform pair is exactly linear and
// energy preserving

use crate::error::ReconError;
use crate::fftshift::{fftshift2, ifftshift2};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDirection {
    /// image space to k-space
    Forward,
    /// k-space to image space
    Inverse,
}

/// Centered orthonormal 2-D transform pair planned for one slice shape. Forward and inverse
/// plans are built once and shared between threads.
#[derive(Clone)]
pub struct FourierTransformPair {
    dims: [usize; 2],
    row_forward: Arc<dyn Fft<f32>>,
    row_inverse: Arc<dyn Fft<f32>>,
    col_forward: Arc<dyn Fft<f32>>,
    col_inverse: Arc<dyn Fft<f32>>,
}

impl fmt::Debug for FourierTransformPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FourierTransformPair").field("dims", &self.dims).finish()
    }
}

impl FourierTransformPair {
    pub fn new(rows: usize, cols: usize) -> Result<Self, ReconError> {
        if rows == 0 || cols == 0 {
            return Err(ReconError::InvalidParams(format!("cannot plan a {rows} x {cols} transform")));
        }
        let mut planner = FftPlanner::<f32>::new();
        Ok(Self {
            dims: [rows, cols],
            row_forward: planner.plan_fft_forward(cols),
            row_inverse: planner.plan_fft_inverse(cols),
            col_forward: planner.plan_fft_forward(rows),
            col_inverse: planner.plan_fft_inverse(rows),
        })
    }

    /// plans a transform pair matching the shape of `array`
    pub fn for_shape<T>(array: &ArrayView2<T>) -> Result<Self, ReconError> {
        let (rows, cols) = array.dim();
        Self::new(rows, cols)
    }

    pub fn dims(&self) -> [usize; 2] {
        self.dims
    }

    pub fn to_kspace(&self, image: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        self.apply(ModelDirection::Forward, image)
    }

    pub fn to_image(&self, kspace: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        self.apply(ModelDirection::Inverse, kspace)
    }

    /// unitary centered fft in the requested direction: ifftshift, fft along both axes, fftshift,
    /// then scaling by 1/sqrt(rows * cols)
    pub fn apply(&self, direction: ModelDirection, x: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        let [rows, cols] = self.dims;
        if x.dim() != (rows, cols) {
            return Err(ReconError::shape("fourier transform", &self.dims, x.shape()));
        }

        let (row_plan, col_plan) = match direction {
            ModelDirection::Forward => (&self.row_forward, &self.col_forward),
            ModelDirection::Inverse => (&self.row_inverse, &self.col_inverse),
        };

        let mut data: Vec<Complex32> = x.iter().copied().collect();
        ifftshift2(self.dims, &mut data);

        data.par_chunks_exact_mut(cols).for_each(|row| row_plan.process(row));

        let mut columns = transpose(&data, rows, cols);
        columns.par_chunks_exact_mut(rows).for_each(|col| col_plan.process(col));
        let mut data = transpose(&columns, cols, rows);

        fftshift2(self.dims, &mut data);

        let scale = 1. / ((rows * cols) as f32).sqrt();
        data.par_iter_mut().for_each(|v| *v *= scale);

        Array2::from_shape_vec((rows, cols), data)
            .map_err(|_| ReconError::shape("fourier transform output", &self.dims, &[rows * cols]))
    }

    /// runs the signal model over a batch of slices of the planned shape in parallel
    pub fn apply_batch(&self, direction: ModelDirection, slices: &[Array2<Complex32>]) -> Result<Vec<Array2<Complex32>>, ReconError> {
        slices.par_iter().map(|s| self.apply(direction, s.view())).collect()
    }
}

/// returns the transpose of a row-major (rows x cols) buffer as a row-major (cols x rows) buffer
fn transpose(data: &[Complex32], rows: usize, cols: usize) -> Vec<Complex32> {
    (0..data.len())
        .into_par_iter()
        .map(|idx| {
            let c = idx / rows;
            let r = idx % rows;
            data[r * cols + c]
        })
        .collect()
}

/// lifts a real-valued image to a complex image with zero imaginary part
pub fn complex_image(image: ArrayView2<f32>) -> Array2<Complex32> {
    image.mapv(|v| Complex32::new(v, 0.))
}
