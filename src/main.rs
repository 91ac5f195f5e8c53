//! Chest X-Ray Transfer Learning CLI
//!
//! Trains the EfficientNet-B0 classifier on TFRecord files in two phases and
//! writes TensorBoard logs plus the trained model.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::info;

use chestxray_transfer::backend::{backend_name, default_device, TrainingBackend};
use chestxray_transfer::config::{ConfigOverrides, XrayConfig};
use chestxray_transfer::dataset::loader::{collect_record_files, read_records};
use chestxray_transfer::dataset::BatchPlan;
use chestxray_transfer::training::run_training;
use chestxray_transfer::utils::logging::{init_logging, LogConfig, LogLevel};

/// Two-phase EfficientNet-B0 transfer learning for chest X-ray classification
#[derive(Parser, Debug)]
#[command(name = "chestxray_transfer")]
#[command(version)]
#[command(about = "Chest X-ray classification by transfer learning with Burn", long_about = None)]
struct Cli {
    /// Glob matching the training TFRecord files (quote it)
    #[arg(long)]
    train: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for TensorBoard runs
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Directory for the model, history and reports
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pretrained EfficientNet-B0 backbone record
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Epochs of head training with the backbone frozen
    #[arg(long)]
    head_epochs: Option<usize>,

    /// Epochs of fine-tuning
    #[arg(long)]
    fine_tune_epochs: Option<usize>,

    /// Batch size
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Count the records and print the split without training
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); overrides --verbose
    #[arg(long)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = init_logging(&LogConfig::from_verbosity(cli.verbose).with_level(cli.log_level));

    print_banner();

    let mut config = XrayConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.apply(ConfigOverrides {
        log_root: cli.log_dir,
        output_dir: cli.output,
        weights: cli.weights,
        head_epochs: cli.head_epochs,
        fine_tune_epochs: cli.fine_tune_epochs,
        batch_size: cli.batch_size,
    });
    config.validate().context("Invalid configuration")?;

    let files = collect_record_files(&cli.train)
        .with_context(|| format!("Failed to find training records for {}", cli.train))?;
    info!("Found {} record file(s)", files.len());

    if cli.dry_run {
        let records = read_records(&files, config.data.verify_checksums).context("Failed to read records")?;
        let plan = BatchPlan::new(records.len(), &config.data.split())?;
        print_plan(&config, &plan);
        return Ok(());
    }

    let device = default_device();
    info!("Backend: {} on {:?}", backend_name(), device);
    print_configuration(&config);

    let outcome = run_training::<TrainingBackend>(&config, &files, device).context("Training failed")?;
    println!("  TensorBoard logs: {:?}", outcome.run_dir);
    println!();
    println!("{}", "Next steps:".cyan().bold());
    println!(
        "  • Inspect curves: tensorboard --logdir {:?}",
        config.output.log_root
    );

    Ok(())
}

fn print_plan(config: &XrayConfig, plan: &BatchPlan) {
    println!("{}", "Dataset Split:".cyan().bold());
    println!("  Examples:            {}", plan.total);
    println!("  Batch size:          {}", plan.batch_size);
    println!(
        "  Training batches:    {} ({} examples)",
        plan.train_batches,
        plan.train_examples()
    );
    println!(
        "  Validation batches:  {} ({} examples)",
        plan.validation_batches(),
        plan.validation_examples()
    );
    if let Some(declared) = config.data.declared_total {
        println!("  Declared total:      {}", declared);
    }
}

fn print_configuration(config: &XrayConfig) {
    let training = &config.training;
    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Classes:             {}", config.model.num_classes);
    println!("  Batch size:          {}", config.data.batch_size);
    println!(
        "  Head epochs:         {} ({})",
        training.head_epochs,
        training.head_schedule.description()
    );
    println!(
        "  Fine-tune epochs:    {} (constant {:e})",
        training.fine_tune_epochs, training.fine_tune_learning_rate
    );
    println!(
        "  Input:               {}px decode, {}px crop",
        config.data.decode_size, config.augmentation.crop_size
    );
    match &config.model.pretrained_weights {
        Some(path) => println!("  Backbone weights:    {:?}", path),
        None => println!("  Backbone weights:    {}", "random init".yellow()),
    }
    println!();
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════════╗
 ║   Chest X-Ray Classification                                 ║
 ║   EfficientNet-B0 Transfer Learning with Burn + Rust         ║
 ╚══════════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}
