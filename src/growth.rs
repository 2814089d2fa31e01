use crate::cascade::{CascadeConfiguration, CascadeStage};
use crate::checkpoint::{CascadeCheckpoint, PretrainedWeights};
use crate::denoiser::Denoiser;
use crate::error::ReconError;
use crate::params::GrowthParams;
use crate::training::{TrainingLoop, TrainingRound};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// where the progressive growth protocol currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPhase {
    /// one trainable stage initialized from the pretrained weights
    Init,
    /// waiting for the external training loop to return the trained configuration
    Training { joint: bool },
    /// every stage frozen after a progressive round
    Freeze,
    /// a fresh trainable stage was appended
    Grow,
    /// every stage trainable again for the joint round
    FinalUnfreeze,
    /// final configuration persisted
    Done,
}

/// Drives train -> freeze -> grow -> train ... -> unfreeze all -> joint train. The scheduler is
/// the only place that changes how many stages exist and which of them are trainable.
#[derive(Debug)]
pub struct GrowthScheduler {
    params: GrowthParams,
    denoiser: Arc<dyn Denoiser>,
    pretrained: PretrainedWeights,
    checkpoint_dir: PathBuf,
    configuration: CascadeConfiguration,
    phase: GrowthPhase,
}

const FINAL_CHECKPOINT: &str = "final.json";

fn stage_checkpoint_name(stage_count: usize) -> String {
    format!("stage-{:02}.json", stage_count)
}

/// Returns the progressive checkpoint with the most stages in `dir` together with its stage
/// count, or `None` if no round has completed yet.
pub fn latest_checkpoint(dir: impl AsRef<Path>) -> Result<Option<(usize, PathBuf)>, ReconError> {
    let pattern = dir.as_ref().join("stage-*.json");
    let entries = glob::glob(&pattern.to_string_lossy())
        .map_err(|e| ReconError::InvalidParams(format!("bad checkpoint pattern {}: {e}", pattern.display())))?;
    let mut latest: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let path = entry.map_err(std::io::Error::from)?;
        let count = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("stage-"))
            .and_then(|s| s.parse::<usize>().ok());
        if let Some(count) = count {
            if latest.as_ref().map_or(true, |(n, _)| count > *n) {
                latest = Some((count, path));
            }
        }
    }
    Ok(latest)
}

impl GrowthScheduler {
    pub fn new(params: GrowthParams, denoiser: Arc<dyn Denoiser>, pretrained: PretrainedWeights, checkpoint_dir: impl AsRef<Path>) -> Result<Self, ReconError> {
        params.validate()?;
        let first = pretrained.stage(denoiser.clone(), params.consistency())?;
        info!("initialized cascade from pretrained {} weights, growing to {} stages", pretrained.architecture, params.num_stages);
        Ok(Self {
            params,
            denoiser,
            pretrained,
            checkpoint_dir: checkpoint_dir.as_ref().to_path_buf(),
            configuration: CascadeConfiguration::single(first),
            phase: GrowthPhase::Init,
        })
    }

    /// like [GrowthScheduler::new], reading the pretrained weights from disk. A missing file is fatal.
    pub fn from_pretrained_file(
        params: GrowthParams,
        denoiser: Arc<dyn Denoiser>,
        pretrained: impl AsRef<Path>,
        checkpoint_dir: impl AsRef<Path>,
    ) -> Result<Self, ReconError> {
        let weights = PretrainedWeights::load(pretrained)?;
        Self::new(params, denoiser, weights, checkpoint_dir)
    }

    /// Rebuilds the scheduler right after the progressive round that trained `stage_count`
    /// stages. A fresh configuration of `stage_count` stages is built and the checkpoint loaded
    /// into it, so a checkpoint holding any other number of stages is rejected.
    pub fn resume(
        params: GrowthParams,
        denoiser: Arc<dyn Denoiser>,
        pretrained: PretrainedWeights,
        checkpoint_dir: impl AsRef<Path>,
        checkpoint: &CascadeCheckpoint,
        stage_count: usize,
    ) -> Result<Self, ReconError> {
        if stage_count == 0 || stage_count > params.num_stages {
            return Err(ReconError::InvalidParams(format!(
                "cannot resume at {stage_count} stages of a {} stage cascade",
                params.num_stages
            )));
        }
        let mut scheduler = Self::new(params, denoiser, pretrained, checkpoint_dir)?;
        let mut fresh = scheduler.configuration.clone();
        for _ in 1..stage_count {
            fresh = fresh.frozen().grown(scheduler.new_stage()?);
        }
        let restored = fresh.load_checkpoint(checkpoint)?;
        scheduler.configuration = restored.frozen();
        scheduler.phase = GrowthPhase::Freeze;
        info!("resumed growth after {} trained stages", stage_count);
        Ok(scheduler)
    }

    /// Restores a run whose joint round already completed. The final checkpoint must hold exactly
    /// `num_stages` stages; the scheduler is returned in `Done` and never trains again.
    pub fn finished(
        params: GrowthParams,
        denoiser: Arc<dyn Denoiser>,
        pretrained: PretrainedWeights,
        checkpoint_dir: impl AsRef<Path>,
        checkpoint: &CascadeCheckpoint,
    ) -> Result<Self, ReconError> {
        let mut scheduler = Self::new(params, denoiser, pretrained, checkpoint_dir)?;
        let mut fresh = scheduler.configuration.clone();
        for _ in 1..scheduler.params.num_stages {
            fresh = fresh.frozen().grown(scheduler.new_stage()?);
        }
        scheduler.configuration = fresh.load_checkpoint(checkpoint)?.unfrozen_all();
        scheduler.phase = GrowthPhase::Done;
        info!("growth already finished with {} stages", scheduler.configuration.stage_count());
        Ok(scheduler)
    }

    /// Resumes from `final.json` if the run finished, otherwise from the newest `stage-NN.json` in
    /// `checkpoint_dir`, or starts over if there is neither.
    pub fn resume_latest(
        params: GrowthParams,
        denoiser: Arc<dyn Denoiser>,
        pretrained: PretrainedWeights,
        checkpoint_dir: impl AsRef<Path>,
    ) -> Result<Self, ReconError> {
        let final_path = checkpoint_dir.as_ref().join(FINAL_CHECKPOINT);
        if final_path.is_file() {
            let ckpt = CascadeCheckpoint::load(&final_path)?;
            return Self::finished(params, denoiser, pretrained, checkpoint_dir, &ckpt);
        }
        match latest_checkpoint(checkpoint_dir.as_ref())? {
            Some((stage_count, path)) => {
                let ckpt = CascadeCheckpoint::load(&path)?;
                Self::resume(params, denoiser, pretrained, checkpoint_dir, &ckpt, stage_count)
            }
            None => Self::new(params, denoiser, pretrained, checkpoint_dir),
        }
    }

    pub fn phase(&self) -> GrowthPhase {
        self.phase
    }

    pub fn configuration(&self) -> &CascadeConfiguration {
        &self.configuration
    }

    pub fn params(&self) -> &GrowthParams {
        &self.params
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// the round the training loop should run, if one is pending
    pub fn round(&self) -> Option<TrainingRound> {
        match self.phase {
            GrowthPhase::Training { joint } => Some(TrainingRound {
                stage_count: self.configuration.stage_count(),
                joint,
                accumulate_grad_batches: if joint {
                    self.params.final_accumulate_grad_batches
                } else {
                    self.params.accumulate_grad_batches
                },
                epochs: if joint { self.params.final_epochs } else { self.params.epochs },
            }),
            _ => None,
        }
    }

    fn new_stage(&self) -> Result<CascadeStage, ReconError> {
        self.pretrained.stage(self.denoiser.clone(), self.params.consistency())
    }

    /// Moves to the next phase. Leaving a training phase goes through
    /// [GrowthScheduler::complete_training] instead, and nothing follows `Done`.
    pub fn advance(&mut self) -> Result<GrowthPhase, ReconError> {
        let next = match self.phase {
            GrowthPhase::Init | GrowthPhase::Grow => GrowthPhase::Training { joint: false },
            GrowthPhase::Freeze => {
                if self.configuration.stage_count() < self.params.num_stages {
                    self.configuration = self.configuration.frozen().grown(self.new_stage()?);
                    GrowthPhase::Grow
                } else {
                    self.configuration = self.configuration.unfrozen_all();
                    GrowthPhase::FinalUnfreeze
                }
            }
            GrowthPhase::FinalUnfreeze => GrowthPhase::Training { joint: true },
            GrowthPhase::Training { .. } => {
                return Err(ReconError::InvalidTransition("a training round is still pending".to_string()));
            }
            GrowthPhase::Done => {
                return Err(ReconError::InvalidTransition("growth is already done".to_string()));
            }
        };
        info!("{:?} -> {:?} ({} stages, trainable {:?})", self.phase, next, self.configuration.stage_count(), self.configuration.trainable_indices());
        self.phase = next;
        Ok(next)
    }

    /// Accepts the configuration returned by the training loop. It must hold the same stages,
    /// with frozen stages untouched. The result is checkpointed and, after a progressive round,
    /// frozen before anything else happens.
    pub fn complete_training(&mut self, trained: CascadeConfiguration) -> Result<GrowthPhase, ReconError> {
        let GrowthPhase::Training { joint } = self.phase else {
            return Err(ReconError::InvalidTransition(format!("no training round pending in {:?}", self.phase)));
        };
        self.check_trained(&trained)?;

        fs::create_dir_all(&self.checkpoint_dir)?;
        let next = if joint {
            trained.to_checkpoint().save(self.checkpoint_dir.join(FINAL_CHECKPOINT))?;
            self.configuration = trained;
            GrowthPhase::Done
        } else {
            let name = stage_checkpoint_name(trained.stage_count());
            trained.to_checkpoint().save(self.checkpoint_dir.join(name))?;
            self.configuration = trained.frozen();
            GrowthPhase::Freeze
        };
        info!("{:?} -> {:?} ({} stages)", self.phase, next, self.configuration.stage_count());
        self.phase = next;
        Ok(next)
    }

    fn check_trained(&self, trained: &CascadeConfiguration) -> Result<(), ReconError> {
        if trained.stage_count() != self.configuration.stage_count() {
            return Err(ReconError::StageCountMismatch {
                expected: self.configuration.stage_count(),
                found: trained.stage_count(),
            });
        }
        for (index, (before, after)) in self.configuration.stages().iter().zip(trained.stages()).enumerate() {
            if before.is_trainable() != after.is_trainable() {
                return Err(ReconError::InvalidTransition(format!("training loop changed the trainable flag of stage {index}")));
            }
            if !after.parameters().is_finite() || !after.lambda().map_or(true, f32::is_finite) {
                return Err(ReconError::NonFinite(format!("trained stage {index}")));
            }
            let untouched = before.shares_parameters(after)
                || (before.parameters() == after.parameters()
                    && before.lambda().map(f32::to_bits) == after.lambda().map(f32::to_bits));
            if !before.is_trainable() && !untouched {
                return Err(ReconError::FrozenStage(index));
            }
        }
        debug!("trained configuration accepted");
        Ok(())
    }

    /// runs every remaining phase, handing training rounds to `trainer`
    pub fn run<T: TrainingLoop>(&mut self, trainer: &mut T) -> Result<&CascadeConfiguration, ReconError> {
        loop {
            match self.phase {
                GrowthPhase::Done => break,
                GrowthPhase::Training { .. } => {
                    let round = self
                        .round()
                        .ok_or_else(|| ReconError::InvalidTransition("no training round pending".to_string()))?;
                    let trained = trainer.fit(&self.configuration, &round)?;
                    self.complete_training(trained)?;
                }
                _ => {
                    self.advance()?;
                }
            }
        }
        Ok(&self.configuration)
    }
}

#[cfg(test)]
mod tests {
    use crate::cascade::tests::sample;
    use crate::cascade::CascadeConfiguration;
    use crate::checkpoint::{CascadeCheckpoint, PretrainedWeights};
    use crate::denoiser::{ParameterBlob, ResidualConvDenoiser};
    use crate::error::ReconError;
    use crate::growth::{latest_checkpoint, GrowthPhase, GrowthScheduler};
    use crate::params::GrowthParams;
    use crate::training::{finite_difference_gradients, ReferenceTrainer, TrainingLoop, TrainingRound};
    use std::sync::Arc;

    fn params(num_stages: usize, learnable: bool) -> GrowthParams {
        GrowthParams {
            num_stages,
            learnable_consistency: learnable,
            accumulate_grad_batches: 1,
            final_accumulate_grad_batches: 2,
            ..GrowthParams::default()
        }
    }

    fn pretrained() -> PretrainedWeights {
        PretrainedWeights::new(&ResidualConvDenoiser, ParameterBlob(vec![0.01; 9]))
    }

    fn scheduler(num_stages: usize, learnable: bool, dir: &std::path::Path) -> GrowthScheduler {
        GrowthScheduler::new(params(num_stages, learnable), Arc::new(ResidualConvDenoiser), pretrained(), dir).unwrap()
    }

    /// records every round and nudges the trainable stages
    #[derive(Default)]
    struct RecordingLoop {
        rounds: Vec<(TrainingRound, Vec<usize>)>,
    }

    impl TrainingLoop for RecordingLoop {
        fn fit(&mut self, configuration: &CascadeConfiguration, round: &TrainingRound) -> Result<CascadeConfiguration, ReconError> {
            self.rounds.push((*round, configuration.trainable_indices()));
            let mut config = configuration.clone();
            for i in configuration.trainable_indices() {
                let stage = &configuration.stages()[i];
                let params = stage.parameters().0.iter().map(|p| p + 0.001).collect::<Vec<_>>();
                config = config.with_stage_update(i, ParameterBlob(params), stage.lambda().map(|l| l + 0.001))?;
            }
            Ok(config)
        }
    }

    #[test]
    fn test_init_has_one_trainable_stage() {
        let dir = tempfile::tempdir().unwrap();
        let s = scheduler(3, false, dir.path());
        assert_eq!(s.phase(), GrowthPhase::Init);
        assert_eq!(s.configuration().stage_count(), 1);
        assert_eq!(s.configuration().trainable_indices(), vec![0]);
        assert!(s.round().is_none());
    }

    #[test]
    fn test_grow_appends_one_stage_and_freezes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(3, true, dir.path());
        s.advance().unwrap();
        let trained = s.configuration().clone();
        assert_eq!(s.complete_training(trained).unwrap(), GrowthPhase::Freeze);
        assert!(s.configuration().trainable_indices().is_empty());

        let before = s.configuration().clone();
        assert_eq!(s.advance().unwrap(), GrowthPhase::Grow);
        let grown = s.configuration().clone();
        assert_eq!(grown.stage_count(), before.stage_count() + 1);
        assert_eq!(grown.trainable_indices(), vec![1]);
        assert!(grown.stages()[0].shares_parameters(&before.stages()[0]));

        // a training step on the grown cascade leaves the frozen stage without gradient
        let grads = finite_difference_gradients(&grown, &sample(10, 10), 1e-2).unwrap();
        assert!(grads.is_zero(0));
        assert!(!grads.is_zero(1));
    }

    #[test]
    fn test_full_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(3, true, dir.path());
        let mut trainer = RecordingLoop::default();
        let final_config = s.run(&mut trainer).unwrap().clone();

        assert_eq!(s.phase(), GrowthPhase::Done);
        assert_eq!(final_config.stage_count(), 3);
        let seen = trainer.rounds.iter().map(|(r, t)| (r.stage_count, r.joint, r.accumulate_grad_batches, t.clone())).collect::<Vec<_>>();
        assert_eq!(
            seen,
            vec![
                (1, false, 1, vec![0]),
                (2, false, 1, vec![1]),
                (3, false, 1, vec![2]),
                (3, true, 2, vec![0, 1, 2]),
            ]
        );
        // stage 0 was trained twice: its own round and the joint round
        assert!((final_config.stages()[0].parameters().0[0] - 0.012).abs() < 1e-6);
        assert!((final_config.stages()[2].parameters().0[0] - 0.012).abs() < 1e-6);

        for name in ["stage-01.json", "stage-02.json", "stage-03.json", "final.json"] {
            assert!(dir.path().join(name).is_file(), "{name} missing");
        }
        assert!(matches!(s.advance(), Err(ReconError::InvalidTransition(_))));
    }

    #[test]
    fn test_reference_trainer_runs_the_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(2, false, dir.path());
        let mut trainer = ReferenceTrainer::new(vec![sample(8, 8), sample(8, 8)], 1e-3);
        let config = s.run(&mut trainer).unwrap();
        assert_eq!(config.stage_count(), 2);
        assert_eq!(config.trainable_indices(), vec![0, 1]);
    }

    #[test]
    fn test_invalid_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(2, false, dir.path());
        let c = s.configuration().clone();
        assert!(matches!(s.complete_training(c), Err(ReconError::InvalidTransition(_))));
        s.advance().unwrap();
        assert!(matches!(s.advance(), Err(ReconError::InvalidTransition(_))));
    }

    #[test]
    fn test_training_loop_must_not_touch_frozen_stages() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(3, false, dir.path());
        s.advance().unwrap();
        s.complete_training(s.configuration().clone()).unwrap();
        s.advance().unwrap();
        s.advance().unwrap();

        // tamper with the frozen stage through a configuration rebuilt from a checkpoint
        let mut ckpt = s.configuration().to_checkpoint();
        ckpt.stages.get_mut(&0).unwrap().parameters = ParameterBlob(vec![1.; 9]);
        let tampered = s.configuration().load_checkpoint(&ckpt).unwrap();
        assert!(matches!(s.complete_training(tampered), Err(ReconError::FrozenStage(0))));

        let shrunk = CascadeConfiguration::single(pretrained().stage(Arc::new(ResidualConvDenoiser), s.params().consistency()).unwrap());
        assert!(matches!(s.complete_training(shrunk), Err(ReconError::StageCountMismatch { expected: 2, found: 1 })));
    }

    #[test]
    fn test_resume_restores_stage_count_and_lambda() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(3, true, dir.path());
        let mut trainer = RecordingLoop::default();
        s.advance().unwrap();
        let trained = trainer.fit(s.configuration(), &s.round().unwrap()).unwrap();
        s.complete_training(trained).unwrap();
        s.advance().unwrap();
        s.advance().unwrap();
        let trained = trainer.fit(s.configuration(), &s.round().unwrap()).unwrap();
        s.complete_training(trained).unwrap();
        let saved = s.configuration().clone();

        let (count, path) = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(count, 2);
        let resumed = GrowthScheduler::resume_latest(params(3, true), Arc::new(ResidualConvDenoiser), pretrained(), dir.path()).unwrap();
        assert_eq!(resumed.phase(), GrowthPhase::Freeze);
        assert_eq!(resumed.configuration().stage_count(), 2);
        for (a, b) in saved.stages().iter().zip(resumed.configuration().stages()) {
            assert_eq!(a.parameters(), b.parameters());
            assert_eq!(a.lambda(), b.lambda());
        }

        let ckpt = CascadeCheckpoint::load(path).unwrap();
        let mismatch = GrowthScheduler::resume(params(3, true), Arc::new(ResidualConvDenoiser), pretrained(), dir.path(), &ckpt, 3);
        assert!(matches!(mismatch, Err(ReconError::StageCountMismatch { expected: 3, found: 2 })));
    }

    #[test]
    fn test_resuming_a_finished_run_keeps_final_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scheduler(2, true, dir.path());
        let done = s.run(&mut RecordingLoop::default()).unwrap().clone();
        let final_path = dir.path().join("final.json");
        let saved = std::fs::read(&final_path).unwrap();

        let mut resumed = GrowthScheduler::resume_latest(params(2, true), Arc::new(ResidualConvDenoiser), pretrained(), dir.path()).unwrap();
        assert_eq!(resumed.phase(), GrowthPhase::Done);
        assert_eq!(resumed.configuration().trainable_indices(), vec![0, 1]);
        for (a, b) in done.stages().iter().zip(resumed.configuration().stages()) {
            assert_eq!(a.parameters(), b.parameters());
            assert_eq!(a.lambda(), b.lambda());
        }

        let mut retrainer = RecordingLoop::default();
        resumed.run(&mut retrainer).unwrap();
        assert!(retrainer.rounds.is_empty());
        assert_eq!(std::fs::read(&final_path).unwrap(), saved);
        assert!(matches!(resumed.advance(), Err(ReconError::InvalidTransition(_))));

        // a final checkpoint from a shorter run does not fit the configured cascade
        let longer = GrowthScheduler::resume_latest(params(3, true), Arc::new(ResidualConvDenoiser), pretrained(), dir.path());
        assert!(matches!(longer, Err(ReconError::StageCountMismatch { expected: 3, found: 2 })));
    }

    #[test]
    fn test_resume_without_checkpoint_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_checkpoint(dir.path()).unwrap().is_none());
        let s = GrowthScheduler::resume_latest(params(2, false), Arc::new(ResidualConvDenoiser), pretrained(), dir.path()).unwrap();
        assert_eq!(s.phase(), GrowthPhase::Init);
    }

    #[test]
    fn test_missing_pretrained_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = GrowthScheduler::from_pretrained_file(params(2, false), Arc::new(ResidualConvDenoiser), dir.path().join("missing.json"), dir.path());
        assert!(matches!(result, Err(ReconError::MissingPretrained(_))));
    }
}
