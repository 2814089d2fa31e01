use anyhow::Context;
use cascade_reco::signal_model::complex_image;
use cascade_reco::{
    CascadeParams, CascadeReconstructor, Denoiser, FourierTransformPair, GrowthScheduler, MotionArtifactSynthesizer,
    NoiseAugmenter, ParameterBlob, PretrainedWeights, ReconSample, ReferenceTrainer, ResidualConvDenoiser,
};
use clap::Parser;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// grows a cascade on synthetic phantoms with the reference trainer
#[derive(Debug, Parser)]
struct Args {
    /// growth parameters file (see cascade-params)
    params: PathBuf,
    /// number of synthetic training slices
    #[arg(long, default_value_t = 8)]
    slices: usize,
    /// rows and columns of each slice
    #[arg(long, default_value_t = 32)]
    size: usize,
    /// write identity pretrained weights if the weights file does not exist
    #[arg(long)]
    init_pretrained: bool,
    /// continue from the newest stage checkpoint in the checkpoint directory
    #[arg(long)]
    resume: bool,
}

/// ellipse phantom with a randomly placed bright spot
fn phantom<R: Rng>(size: usize, rng: &mut R) -> Array2<f32> {
    let c = size as f32 / 2.;
    let (ax, ay) = (rng.random_range(0.25f32..0.4) * size as f32, rng.random_range(0.3f32..0.45) * size as f32);
    let (sx, sy) = (rng.random_range(-0.15f32..0.15) * size as f32, rng.random_range(-0.15f32..0.15) * size as f32);
    Array2::from_shape_fn((size, size), |(i, j)| {
        let y = i as f32 - c;
        let x = j as f32 - c;
        let inside = (x / ax).powi(2) + (y / ay).powi(2) < 1.;
        let spot = (x - sx).powi(2) + (y - sy).powi(2) < 4.;
        if spot {
            2.0
        } else if inside {
            1.0
        } else {
            0.05
        }
    })
}

fn training_samples(params: &CascadeParams, args: &Args, rng: &mut StdRng) -> anyhow::Result<Vec<ReconSample>> {
    let ft = FourierTransformPair::new(args.size, args.size)?;
    let motion = MotionArtifactSynthesizer::new(params.motion.clone())?;
    let noise = NoiseAugmenter::new(params.noise.clone())?;
    let mut samples = Vec::with_capacity(args.slices);
    let mut corrupted = 0;
    let mut acquired_fraction = 0.;
    for slice_index in 0..args.slices {
        let neighbours = (0..params.motion.slices_per_artifact).map(|_| complex_image(phantom(args.size, rng).view())).collect::<Vec<_>>();
        let kspace = neighbours.iter().map(|image| ft.to_kspace(image.view())).collect::<Result<Vec<_>, _>>()?;
        let mask = params.mask.sample(args.size, rng)?;
        acquired_fraction += mask.acquired_fraction(args.size, args.size)?;
        let acquired = match motion.maybe_corrupt(&kspace, rng)? {
            Some(artifact) => {
                corrupted += 1;
                artifact.kspace
            }
            None => kspace[0].clone(),
        };
        let acquired = noise.apply(acquired.view(), rng)?;
        let sample = ReconSample::from_acquisition(acquired.view(), mask, neighbours[0].view())?.with_source("phantom", slice_index);
        samples.push(sample);
    }
    info!(
        "built {} synthetic slices, {} with motion artifacts, {:?} noise, {:.1}% of k-space acquired on average",
        samples.len(),
        corrupted,
        params.noise.kind,
        100. * acquired_fraction / args.slices.max(1) as f32
    );
    Ok(samples)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let param_file = args.params.with_extension("toml");
    let params = CascadeParams::from_toml_file(&param_file).with_context(|| format!("failed to read {}", param_file.display()))?;

    let denoiser = Arc::new(ResidualConvDenoiser);
    if args.init_pretrained && !params.pretrained_weights.exists() {
        PretrainedWeights::new(denoiser.as_ref(), ParameterBlob::zeros(denoiser.parameter_count())).save(&params.pretrained_weights)?;
        info!("wrote identity pretrained weights to {}", params.pretrained_weights.display());
    }
    let pretrained = PretrainedWeights::load(&params.pretrained_weights)?;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let samples = training_samples(&params, &args, &mut rng)?;

    let mut scheduler = if args.resume {
        GrowthScheduler::resume_latest(params.growth.clone(), denoiser, pretrained, &params.checkpoint_dir)?
    } else {
        GrowthScheduler::new(params.growth.clone(), denoiser, pretrained, &params.checkpoint_dir)?
    };

    let mut trainer = ReferenceTrainer::new(samples, params.learning_rate);
    let start_loss = trainer.mean_loss(scheduler.configuration())?;
    let config = scheduler.run(&mut trainer)?;
    let end_loss = trainer.mean_loss(config)?;

    let failed = CascadeReconstructor::new(config).predict_batch(&trainer.samples).into_iter().filter(|r| r.is_err()).count();
    anyhow::ensure!(failed == 0, "{failed} predictions failed with the final cascade");

    info!("{} stage cascade done: loss {:.5} -> {:.5}", config.stage_count(), start_loss, end_loss);
    println!("checkpoints written to {}", params.checkpoint_dir.display());
    Ok(())
}
