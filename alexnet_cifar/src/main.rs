//! Trains AlexNet on the CIFAR-10 binary distribution and reports validation
//! accuracy after every epoch and test accuracy at the end.
//!
//! ```bash
//! alexnet-cifar --data-dir data/cifar-10-batches-bin --epochs 20
//! alexnet-cifar --config run.toml --verbose
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use alexnet_cifar::{
    split_indices, AlexNet, BatchSource, Cifar10, DataLoader, Dataset, Model, Precision, Sgd, TrainConfig, Trainer,
};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "alexnet-cifar", version, about = "Train AlexNet on CIFAR-10")]
struct Cli {
    /// TOML run configuration; command-line flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory with data_batch_1..5.bin and test_batch.bin
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Seed for initialisation, the split and shuffling
    #[arg(long)]
    seed: Option<u64>,

    /// Log every batch
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn resolve(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::load_from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => TrainConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.data.dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            config.train.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.data.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.train.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            config.model.seed = seed;
            config.data.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.resolve()?;
    info!(?config, "starting run");

    let data = &config.data;
    let train_set = Cifar10::load_train(&data.dir, data.image_size).context("loading training batches")?;
    let test_set = Cifar10::load_test(&data.dir, data.image_size).context("loading test batch")?;

    let (train_indices, valid_indices) = split_indices(train_set.len(), data.valid_ratio, data.seed)?;
    let mut train_loader = DataLoader::new(&train_set, train_indices, data.batch_size, data.seed)?
        .shuffled()
        .with_augmentation(data.augment);
    let mut valid_loader = DataLoader::new(&train_set, valid_indices, data.batch_size, data.seed)?;
    let mut test_loader = DataLoader::sequential(&test_set, data.batch_size)?;
    info!(
        train = train_loader.num_samples(),
        validation = valid_loader.num_samples(),
        test = test_loader.num_samples(),
        "split ready"
    );

    let model = AlexNet::new(&config.alexnet())?;
    let mut shape = vec![1];
    shape.extend(train_set.image_shape());
    model.output_shape(&shape).context("input resolution does not fit the network")?;
    info!(parameters = model.num_parameters(), "network built");

    let train = &config.train;
    let optimizer = Sgd::new(
        train.learning_rate as Precision,
        train.momentum as Precision,
        train.weight_decay as Precision,
    )?;
    let mut trainer = Trainer::new(model, optimizer, train.epochs)?;
    trainer.fit(&mut train_loader, &mut valid_loader)?;

    let report = trainer.test(&mut test_loader)?;
    println!("{report}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
