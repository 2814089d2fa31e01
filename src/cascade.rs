use crate::consistency::{DataConsistency, Normalization};
use crate::denoiser::{Denoiser, ParameterBlob};
use crate::error::ReconError;
use crate::mask::SamplingMask;
use crate::signal_model::FourierTransformPair;
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use rayon::prelude::*;
use std::sync::Arc;

/// One slice handed to the cascade by the dataset: measured (under-sampled) k-space, its
/// sampling mask, normalization statistics and bookkeeping used by external metrics.
#[derive(Debug, Clone)]
pub struct ReconSample {
    pub kspace: Array2<Complex32>,
    pub mask: SamplingMask,
    /// normalized ground truth magnitude, only present for training data
    pub target: Option<Array2<f32>>,
    pub normalization: Normalization,
    pub file_name: String,
    pub slice_index: usize,
    pub max_value: f32,
}

impl ReconSample {
    pub fn new(kspace: Array2<Complex32>, mask: SamplingMask, normalization: Normalization) -> Self {
        Self {
            kspace,
            mask,
            target: None,
            normalization,
            file_name: String::new(),
            slice_index: 0,
            max_value: 0.,
        }
    }

    /// simulates an acquisition of a fully sampled image: forward transform, under-sample, and
    /// normalize by the statistics of the zero-filled reconstruction
    pub fn from_image(image: ArrayView2<Complex32>, mask: SamplingMask) -> Result<Self, ReconError> {
        let ft = FourierTransformPair::for_shape(&image)?;
        let kspace = ft.to_kspace(image)?;
        Self::from_acquisition(kspace.view(), mask, image)
    }

    /// Under-samples fully sampled k-space with `mask`. The target is taken from `reference`,
    /// which need not be the image the k-space came from (motion-corrupted inputs).
    pub fn from_acquisition(full_kspace: ArrayView2<Complex32>, mask: SamplingMask, reference: ArrayView2<Complex32>) -> Result<Self, ReconError> {
        if full_kspace.dim() != reference.dim() {
            return Err(ReconError::shape("reference image", full_kspace.shape(), reference.shape()));
        }
        let ft = FourierTransformPair::for_shape(&full_kspace)?;
        let kspace = mask.under_sample(full_kspace)?;
        let zero_filled = ft.to_image(kspace.view())?;
        let normalization = Normalization::of_magnitude(zero_filled.view())?;
        let target = reference.mapv(|v| (v.norm() - normalization.mean) / normalization.std);
        let max_value = reference.iter().map(|v| v.norm()).fold(0., f32::max);
        Ok(Self {
            target: Some(target),
            max_value,
            ..Self::new(kspace, mask, normalization)
        })
    }

    pub fn with_source(mut self, file_name: impl Into<String>, slice_index: usize) -> Self {
        self.file_name = file_name.into();
        self.slice_index = slice_index;
        self
    }

    pub fn dims(&self) -> (usize, usize) {
        self.kspace.dim()
    }

    /// normalized inverse transform of the masked k-space, the usual initial cascade estimate
    pub fn zero_filled(&self, ft: &FourierTransformPair) -> Result<Array2<Complex32>, ReconError> {
        let k = self.mask.under_sample(self.kspace.view())?;
        let image = ft.to_image(k.view())?;
        Ok(self.normalization.normalize(image.view()))
    }
}

/// A denoiser followed by a data consistency correction. Parameters are reference counted so
/// configurations produced by successive growth steps share frozen stages without copying.
#[derive(Debug, Clone)]
pub struct CascadeStage {
    denoiser: Arc<dyn Denoiser>,
    parameters: Arc<ParameterBlob>,
    consistency: DataConsistency,
    trainable: bool,
}

impl CascadeStage {
    pub fn new(denoiser: Arc<dyn Denoiser>, parameters: ParameterBlob, consistency: DataConsistency) -> Result<Self, ReconError> {
        if parameters.len() != denoiser.parameter_count() {
            return Err(ReconError::ParameterCountMismatch {
                stage: 0,
                expected: denoiser.parameter_count(),
                found: parameters.len(),
            });
        }
        if !parameters.is_finite() {
            return Err(ReconError::NonFinite("stage parameters".to_string()));
        }
        consistency.with_lambda(consistency.lambda())?;
        Ok(Self {
            denoiser,
            parameters: Arc::new(parameters),
            consistency,
            trainable: true,
        })
    }

    pub fn denoiser(&self) -> &Arc<dyn Denoiser> {
        &self.denoiser
    }

    pub fn parameters(&self) -> &ParameterBlob {
        &self.parameters
    }

    pub fn consistency(&self) -> DataConsistency {
        self.consistency
    }

    pub fn lambda(&self) -> Option<f32> {
        self.consistency.lambda()
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// true when both stages hold the very same parameter allocation
    pub fn shares_parameters(&self, other: &CascadeStage) -> bool {
        Arc::ptr_eq(&self.parameters, &other.parameters)
    }

    fn with_trainable(&self, trainable: bool) -> Self {
        Self { trainable, ..self.clone() }
    }

    pub fn forward(
        &self,
        ft: &FourierTransformPair,
        kspace: ArrayView2<Complex32>,
        mask: &SamplingMask,
        x: ArrayView2<Complex32>,
        norm: Normalization,
    ) -> Result<Array2<Complex32>, ReconError> {
        let denoised = self.denoiser.denoise(&self.parameters, x)?;
        if denoised.dim() != x.dim() {
            return Err(ReconError::shape("denoiser output", x.shape(), denoised.shape()));
        }
        self.consistency.apply(ft, kspace, mask, denoised.view(), norm)
    }
}

/// Ordered, append-only list of cascade stages. Every growth operation returns a new value;
/// a frozen stage can only become trainable again through [CascadeConfiguration::unfrozen_all].
#[derive(Debug, Clone, Default)]
pub struct CascadeConfiguration {
    stages: Vec<CascadeStage>,
}

impl CascadeConfiguration {
    pub fn single(stage: CascadeStage) -> Self {
        Self { stages: vec![stage.with_trainable(true)] }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> &[CascadeStage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&CascadeStage> {
        self.stages.get(index)
    }

    pub fn trainable_indices(&self) -> Vec<usize> {
        self.stages.iter().enumerate().filter(|(_, s)| s.trainable).map(|(i, _)| i).collect()
    }

    /// every stage marked frozen
    pub fn frozen(&self) -> Self {
        Self { stages: self.stages.iter().map(|s| s.with_trainable(false)).collect() }
    }

    /// every stage marked trainable, for the joint fine-tuning round
    pub fn unfrozen_all(&self) -> Self {
        Self { stages: self.stages.iter().map(|s| s.with_trainable(true)).collect() }
    }

    /// appends a trainable stage, sharing all existing stages by reference
    pub fn grown(&self, stage: CascadeStage) -> Self {
        let mut stages = self.stages.clone();
        stages.push(stage.with_trainable(true));
        Self { stages }
    }

    /// returns a configuration with new parameters (and lambda, for learnable consistency) for
    /// one trainable stage. Updating a frozen stage is an error.
    pub fn with_stage_update(&self, index: usize, parameters: ParameterBlob, lambda: Option<f32>) -> Result<Self, ReconError> {
        if !self.stage_at(index)?.trainable {
            return Err(ReconError::FrozenStage(index));
        }
        self.with_stage_values(index, parameters, lambda)
    }

    fn stage_at(&self, index: usize) -> Result<&CascadeStage, ReconError> {
        self.stages.get(index).ok_or_else(|| {
            ReconError::InvalidParams(format!("stage {index} does not exist in a {} stage cascade", self.stages.len()))
        })
    }

    /// replaces a stage's values regardless of its trainable flag; used when loading checkpoints
    pub(crate) fn with_stage_values(&self, index: usize, parameters: ParameterBlob, lambda: Option<f32>) -> Result<Self, ReconError> {
        let stage = self.stage_at(index)?;
        if parameters.len() != stage.denoiser.parameter_count() {
            return Err(ReconError::ParameterCountMismatch {
                stage: index,
                expected: stage.denoiser.parameter_count(),
                found: parameters.len(),
            });
        }
        if !parameters.is_finite() {
            return Err(ReconError::NonFinite(format!("stage {index} parameters")));
        }
        let consistency = stage.consistency.with_lambda(lambda).map_err(|e| match e {
            ReconError::InvalidParams(_) => ReconError::ConsistencyMismatch(index),
            other => other,
        })?;
        let mut stages = self.stages.clone();
        stages[index] = CascadeStage {
            parameters: Arc::new(parameters),
            consistency,
            ..stage.clone()
        };
        Ok(Self { stages })
    }
}

/// Runs a borrowed configuration over samples. Holds no state of its own.
#[derive(Debug, Clone, Copy)]
pub struct CascadeReconstructor<'a> {
    configuration: &'a CascadeConfiguration,
}

impl<'a> CascadeReconstructor<'a> {
    pub fn new(configuration: &'a CascadeConfiguration) -> Self {
        Self { configuration }
    }

    pub fn configuration(&self) -> &CascadeConfiguration {
        self.configuration
    }

    /// threads the normalized estimate `x0` through every stage in order
    pub fn forward(&self, sample: &ReconSample, x0: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        let ft = FourierTransformPair::new(sample.dims().0, sample.dims().1)?;
        self.forward_with(&ft, sample, x0)
    }

    /// like [Self::forward] with a transform pair planned by the caller, for repeated passes
    /// over samples of one shape
    pub fn forward_with(&self, ft: &FourierTransformPair, sample: &ReconSample, x0: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
        if ft.dims() != [sample.dims().0, sample.dims().1] {
            return Err(ReconError::shape("transform pair", sample.kspace.shape(), &ft.dims()));
        }
        if x0.dim() != sample.dims() {
            return Err(ReconError::shape("initial estimate", sample.kspace.shape(), x0.shape()));
        }
        let mut x = x0.to_owned();
        for stage in &self.configuration.stages {
            x = stage.forward(ft, sample.kspace.view(), &sample.mask, x.view(), sample.normalization)?;
        }
        Ok(x)
    }

    /// reconstruction starting from the zero-filled image. Evaluation entry point; the crate
    /// does no gradient tracking, so this is the same computation as [Self::forward].
    pub fn predict(&self, sample: &ReconSample) -> Result<Array2<Complex32>, ReconError> {
        let ft = FourierTransformPair::new(sample.dims().0, sample.dims().1)?;
        self.predict_with(&ft, sample)
    }

    pub fn predict_with(&self, ft: &FourierTransformPair, sample: &ReconSample) -> Result<Array2<Complex32>, ReconError> {
        let x0 = sample.zero_filled(ft)?;
        self.forward_with(ft, sample, x0.view())
    }

    /// independent predictions for a set of samples, computed in parallel
    pub fn predict_batch(&self, samples: &[ReconSample]) -> Vec<Result<Array2<Complex32>, ReconError>> {
        samples.par_iter().map(|s| self.predict(s)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::cascade::{CascadeConfiguration, CascadeReconstructor, CascadeStage, ReconSample};
    use crate::consistency::DataConsistency;
    use crate::denoiser::{Denoiser, ParameterBlob, ResidualConvDenoiser};
    use crate::error::ReconError;
    use crate::mask::SamplingMask;
    use crate::signal_model::FourierTransformPair;
    use ndarray::{Array2, ArrayView2};
    use num_complex::Complex32;
    use std::sync::Arc;

    pub(crate) fn phantom(rows: usize, cols: usize) -> Array2<Complex32> {
        Array2::from_shape_fn((rows, cols), |(i, j)| {
            let y = i as f32 - rows as f32 / 2.;
            let x = j as f32 - cols as f32 / 2.;
            let inside = (x * x) / (cols as f32 * 0.35).powi(2) + (y * y) / (rows as f32 * 0.4).powi(2) < 1.;
            let spot = (x - 1.).abs() < 2. && (y + 1.).abs() < 2.;
            Complex32::new(if spot { 2.0 } else if inside { 1.0 } else { 0.05 }, 0.)
        })
    }

    pub(crate) fn sample(rows: usize, cols: usize) -> ReconSample {
        let acquired = (0..cols).map(|c| c % 3 == 0 || (c as isize - cols as isize / 2).abs() < 2).collect::<Vec<_>>();
        ReconSample::from_image(phantom(rows, cols).view(), SamplingMask::from_acquired(&acquired)).unwrap()
    }

    pub(crate) fn conv_stage(weights: Vec<f32>, consistency: DataConsistency) -> CascadeStage {
        CascadeStage::new(Arc::new(ResidualConvDenoiser), ParameterBlob(weights), consistency).unwrap()
    }

    /// denoiser that returns an image of the wrong shape
    #[derive(Debug)]
    struct Cropper;

    impl Denoiser for Cropper {
        fn architecture(&self) -> &str {
            "cropper"
        }

        fn parameter_count(&self) -> usize {
            0
        }

        fn denoise(&self, _params: &ParameterBlob, image: ArrayView2<Complex32>) -> Result<Array2<Complex32>, ReconError> {
            let (r, c) = image.dim();
            Ok(Array2::zeros((r - 1, c)))
        }
    }

    #[test]
    fn test_stage_output_is_data_consistent() {
        let s = sample(16, 12);
        let stage = conv_stage(vec![0.05; 9], DataConsistency::Fixed);
        let ft = FourierTransformPair::new(16, 12).unwrap();
        let x0 = s.zero_filled(&ft).unwrap();
        let out = stage.forward(&ft, s.kspace.view(), &s.mask, x0.view(), s.normalization).unwrap();
        let k_out = ft.to_kspace(s.normalization.denormalize(out.view()).view()).unwrap();
        let w = s.mask.expand(16, 12).unwrap();
        for (idx, &m) in w.indexed_iter() {
            if m == 1. {
                assert!((k_out[idx] - s.kspace[idx]).norm() < 1e-3);
            }
        }
    }

    #[test]
    fn test_forward_threads_stages_in_order() {
        let s = sample(12, 12);
        let a = conv_stage(vec![0.02; 9], DataConsistency::Fixed);
        let b = conv_stage(vec![-0.03, 0., 0.01, 0., 0.1, 0., 0.01, 0., -0.03], DataConsistency::Learnable { lambda: 0.2 });
        let config = CascadeConfiguration::single(a.clone()).grown(b.clone());

        let ft = FourierTransformPair::new(12, 12).unwrap();
        let x0 = s.zero_filled(&ft).unwrap();
        let x1 = a.forward(&ft, s.kspace.view(), &s.mask, x0.view(), s.normalization).unwrap();
        let x2 = b.forward(&ft, s.kspace.view(), &s.mask, x1.view(), s.normalization).unwrap();

        let out = CascadeReconstructor::new(&config).forward(&s, x0.view()).unwrap();
        assert!(out.iter().zip(x2.iter()).all(|(p, q)| (p - q).norm() < 1e-5));

        let predicted = CascadeReconstructor::new(&config).predict(&s).unwrap();
        assert!(out.iter().zip(predicted.iter()).all(|(p, q)| (p - q).norm() < 1e-5));
    }

    #[test]
    fn test_sample_from_acquisition() {
        let image = phantom(8, 8);
        let ft = FourierTransformPair::new(8, 8).unwrap();
        let kspace = ft.to_kspace(image.view()).unwrap();
        let mask = SamplingMask::from_acquired(&[true, false, true, true, true, false, true, false]);
        let s = ReconSample::from_acquisition(kspace.view(), mask.clone(), image.view()).unwrap().with_source("vol", 3);
        assert_eq!(s.slice_index, 3);
        assert!((s.max_value - 2.).abs() < 1e-6);
        assert!(s.kspace.column(1).iter().all(|v| *v == Complex32::ZERO));
        assert!(ReconSample::from_acquisition(kspace.view(), mask, Array2::zeros((8, 7)).view()).is_err());
    }

    #[test]
    fn test_predict_with_shared_transform() {
        let s = sample(12, 10);
        let config = CascadeConfiguration::single(conv_stage(vec![0.03; 9], DataConsistency::Learnable { lambda: 0.1 }));
        let reco = CascadeReconstructor::new(&config);
        let ft = FourierTransformPair::new(12, 10).unwrap();
        let a = reco.predict_with(&ft, &s).unwrap();
        let b = reco.predict_with(&ft, &s).unwrap();
        let c = reco.predict(&s).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().zip(c.iter()).all(|(p, q)| (p - q).norm() < 1e-6));

        let other = FourierTransformPair::new(10, 12).unwrap();
        assert!(matches!(reco.predict_with(&other, &s), Err(ReconError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_predict_batch() {
        let samples = vec![sample(8, 8), sample(10, 6)];
        let config = CascadeConfiguration::single(conv_stage(vec![0.01; 9], DataConsistency::Fixed));
        let results = CascadeReconstructor::new(&config).predict_batch(&samples);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().dim(), (8, 8));
        assert_eq!(results[1].as_ref().unwrap().dim(), (10, 6));
    }

    #[test]
    fn test_shape_errors() {
        let s = sample(8, 8);
        let config = CascadeConfiguration::single(conv_stage(vec![0.; 9], DataConsistency::Fixed));
        let bad = Array2::zeros((8, 7));
        assert!(CascadeReconstructor::new(&config).forward(&s, bad.view()).is_err());

        let cropping = CascadeStage::new(Arc::new(Cropper), ParameterBlob::default(), DataConsistency::Fixed).unwrap();
        let config = CascadeConfiguration::single(cropping);
        assert!(matches!(
            CascadeReconstructor::new(&config).predict(&s),
            Err(ReconError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_growth_operations_share_frozen_stages() {
        let first = CascadeConfiguration::single(conv_stage(vec![0.; 9], DataConsistency::Fixed));
        let frozen = first.frozen();
        let grown = frozen.grown(conv_stage(vec![0.1; 9], DataConsistency::Fixed));

        assert_eq!(grown.stage_count(), 2);
        assert_eq!(grown.trainable_indices(), vec![1]);
        assert!(grown.stages()[0].shares_parameters(&first.stages()[0]));
        // the ungrown configuration is untouched
        assert_eq!(first.trainable_indices(), vec![0]);

        assert!(matches!(grown.with_stage_update(0, ParameterBlob::zeros(9), None), Err(ReconError::FrozenStage(0))));
        let updated = grown.with_stage_update(1, ParameterBlob(vec![0.2; 9]), None).unwrap();
        assert_eq!(updated.stages()[1].parameters().0, vec![0.2; 9]);
        assert!(updated.stages()[0].shares_parameters(&first.stages()[0]));

        assert_eq!(grown.unfrozen_all().trainable_indices(), vec![0, 1]);
    }

    #[test]
    fn test_stage_update_validates_values() {
        let config = CascadeConfiguration::single(conv_stage(vec![0.; 9], DataConsistency::Learnable { lambda: 0.01 }));
        assert!(config.with_stage_update(0, ParameterBlob::zeros(3), Some(0.1)).is_err());
        assert!(matches!(config.with_stage_update(0, ParameterBlob::zeros(9), None), Err(ReconError::ConsistencyMismatch(0))));
        assert!(config.with_stage_update(0, ParameterBlob(vec![f32::NAN; 9]), Some(0.1)).is_err());
        let updated = config.with_stage_update(0, ParameterBlob::zeros(9), Some(0.3)).unwrap();
        assert_eq!(updated.stages()[0].lambda(), Some(0.3));
    }
}
