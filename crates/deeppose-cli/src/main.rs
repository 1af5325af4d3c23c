//! # deeppose
//!
//! Command-line driver for the DeepPose exploration steps:
//!
//! - `inspect`: build VGG19, list its layers, slice it into a feature extractor
//! - `transform`: normalize a random image tensor and adjust its brightness
//! - `sample`: load a LineMOD sample, optionally batch it and score a model on it

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use deeppose_data::{DataLoader, LineModDataset, PoseDataset};
use deeppose_vision::{
    random_image, Brightness, CompositeLoss, Compose, DeepPoseConfig, DeepPoseModel, Normalize,
    Transform, Vgg19,
};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "deeppose", version, about = "Explore the DeepPose VGG19 pipeline")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "DEEPPOSE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the VGG19 layer table and the truncated extractor's output shape
    Inspect {
        /// safetensors weights, overrides `backbone.weights`
        #[arg(long)]
        weights: Option<PathBuf>,

        /// Feature layers to keep, overrides `backbone.feature_layers`
        #[arg(long)]
        layers: Option<usize>,
    },

    /// Normalize a random tensor, adjust its brightness and print channel statistics
    Transform {
        #[arg(long)]
        brightness: Option<f64>,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Load one dataset sample and print its tensors
    Sample {
        #[arg(default_value_t = 0)]
        index: usize,

        #[arg(long)]
        seed: Option<u64>,

        /// Also pull the first batch of epoch 0
        #[arg(long)]
        batch: bool,

        /// Also run the pose network on the sample and report the loss
        #[arg(long)]
        loss: bool,
    },
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AppConfig::from_env().context("failed to load config from environment")?,
    };
    debug!(?config, "loaded configuration");

    let device = select_device(config.cuda_device)?;

    match cli.command {
        Commands::Inspect { weights, layers } => inspect(&config, weights, layers, &device),
        Commands::Transform { brightness, seed } => transform(&config, brightness, seed, &device),
        Commands::Sample {
            index,
            seed,
            batch,
            loss,
        } => sample(&config, index, seed, batch, loss, &device),
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,deeppose=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn select_device(ordinal: Option<usize>) -> Result<Device> {
    let device = match ordinal {
        Some(n) => Device::cuda_if_available(n).context("failed to open CUDA device")?,
        None => Device::Cpu,
    };
    if ordinal.is_some() && device.is_cpu() {
        warn!("CUDA requested but unavailable, running on CPU");
    }
    Ok(device)
}

fn inspect(
    config: &AppConfig,
    weights: Option<PathBuf>,
    layers: Option<usize>,
    device: &Device,
) -> Result<()> {
    let weights = weights.or_else(|| config.backbone.weights.clone());
    let keep = layers.unwrap_or(config.backbone.feature_layers);

    let vgg = match &weights {
        Some(path) => Vgg19::load_pretrained(path, config.vgg(), device)?,
        None => {
            info!("no weights given, initialising VGG19 randomly");
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            Vgg19::new(config.vgg(), vb).context("failed to build VGG19")?
        }
    };

    println!("VGG19 ({} layers)", vgg.layers().len());
    for layer in vgg.layers() {
        println!("  {}", layer);
    }

    let extractor = vgg
        .truncate(keep)
        .with_context(|| format!("failed to keep {} feature layers", keep))?;
    let size = config.backbone.probe_size;
    let probe = random_image((1, 3, size, size), config.transform.seed, device)?;
    let features = extractor.forward(&probe)?;

    println!();
    println!("Feature extractor ({} layers)", extractor.len());
    for layer in extractor.layers() {
        println!("  {}", layer);
    }
    println!(
        "probe {:?} -> features {:?} (stride {}, {} channels)",
        probe.dims(),
        features.dims(),
        extractor.stride(),
        extractor.output_channels()
    );
    Ok(())
}

fn transform(
    config: &AppConfig,
    brightness: Option<f64>,
    seed: Option<u64>,
    device: &Device,
) -> Result<()> {
    let settings = &config.transform;
    let seed = seed.unwrap_or(settings.seed);
    let factor = brightness.unwrap_or(settings.brightness);
    let size = settings.image_size;

    let normalize = Normalize::new(settings.mean.clone(), settings.std.clone())
        .context("invalid normalization statistics")?;
    let brighten = Brightness::new(factor).context("invalid brightness factor")?;

    let image = random_image((3, size, size), seed, device)?;
    let normalized = normalize.apply(&image)?;

    let pipeline = Compose::new().with(normalize).with(brighten);
    debug!(transforms = pipeline.len(), "composed pipeline");
    let adjusted = pipeline.apply(&image)?;

    println!("random image {:?}, seed {}", image.dims(), seed);
    print_stats("input", &image)?;
    print_stats("normalized", &normalized)?;
    print_stats(&format!("brightness x{}", factor), &adjusted)?;
    Ok(())
}

fn print_stats(label: &str, x: &Tensor) -> Result<()> {
    let flat = x.flatten_from(1)?;
    let mean: Vec<f32> = flat.mean(1)?.to_vec1()?;
    let min: Vec<f32> = flat.min(1)?.to_vec1()?;
    let max: Vec<f32> = flat.max(1)?.to_vec1()?;

    println!("{}:", label);
    for c in 0..mean.len() {
        println!(
            "  channel {}: mean {:+.4}  min {:+.4}  max {:+.4}",
            c, mean[c], min[c], max[c]
        );
    }
    Ok(())
}

fn sample(
    config: &AppConfig,
    index: usize,
    seed: Option<u64>,
    batch: bool,
    loss: bool,
    device: &Device,
) -> Result<()> {
    let settings = &config.dataset;
    let dataset = LineModDataset::open(
        &settings.root,
        &settings.annotations,
        &settings.models,
        config.dataset_config(),
        device,
    )
    .with_context(|| format!("failed to open dataset at {}", settings.root.display()))?;

    // The network consumes normalized images
    let dataset = if loss {
        let normalize = Normalize::new(config.transform.mean.clone(), config.transform.std.clone())
            .context("invalid normalization statistics")?;
        dataset.with_transform(normalize)
    } else {
        dataset
    };

    let seed = seed.unwrap_or(settings.loader.seed);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let item = dataset
        .get(index, &mut rng)
        .with_context(|| format!("failed to load sample {}", index))?;

    println!("sample {} (image {})", index, item.image_id);
    println!("  image   {:?}", item.image.dims());
    println!("  targets {:?}", item.targets.dims());
    for (i, p) in item.projected.iter().enumerate() {
        println!("  vertex {}: ({:.1}, {:.1})", i, p.x, p.y);
    }

    if batch {
        let loader = DataLoader::new(&dataset, settings.loader.clone())?;
        if let Some(first) = loader.epoch(0).next() {
            let first = first.context("failed to collate batch")?;
            println!(
                "batch 1/{}: images {:?}, targets {:?}, ids {:?}",
                loader.n_batches(),
                first.images.dims(),
                first.targets.dims(),
                first.image_ids
            );
        }
    }

    if loss {
        score(config, &item.image, &item.targets, device)?;
    }
    Ok(())
}

/// Run the pose network on one normalized sample and print loss and belief peaks
fn score(config: &AppConfig, image: &Tensor, targets: &Tensor, device: &Device) -> Result<()> {
    let model_config = DeepPoseConfig {
        feature_layers: config.backbone.feature_layers,
        ..DeepPoseConfig::default()
    };
    let stages = model_config.stages.n_stages;

    let varmap = VarMap::new();
    let model = match &config.backbone.weights {
        Some(path) => DeepPoseModel::with_pretrained_backbone(path, model_config, device)?.0,
        None => {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            DeepPoseModel::new(model_config, vb).context("failed to build model")?
        }
    };

    let output = model.forward(&image.unsqueeze(0)?)?;

    let components = CompositeLoss::new(stages).forward_output(&output, &targets.unsqueeze(0)?)?;
    println!(
        "loss: belief {:.6}  affinity {:.6}  total {:.6}",
        components.belief.to_scalar::<f32>()?,
        components.affinity.to_scalar::<f32>()?,
        components.total_value()?
    );

    for peaks in output.peak_locations(model.stride())? {
        for peak in peaks {
            let (x, y) = peak.pixel();
            println!(
                "  belief {}: ({}, {}) score {:.4}",
                peak.channel, x, y, peak.score
            );
        }
    }
    Ok(())
}
