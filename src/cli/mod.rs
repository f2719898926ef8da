pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ttt-mae")]
#[command(about = "Test-time training for masked-autoencoder vision models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Adapt on each test image by masked reconstruction, then classify it
    Run(commands::RunArgs),
    /// Rebuild the accuracy report from flushed result segments
    Aggregate {
        /// Directory holding results_*.npy segments
        #[arg(long)]
        output_dir: String,
        /// Assert the segments cover exactly this many images
        #[arg(long)]
        expected_images: Option<usize>,
    },
    /// Generate a small synthetic dataset for smoke runs
    MakeData {
        /// Dataset root to create
        #[arg(long)]
        output_dir: String,
        /// Number of classes
        #[arg(long, default_value = "4")]
        classes: usize,
        /// Images per class
        #[arg(long, default_value = "8")]
        images_per_class: usize,
        /// Square image edge in pixels
        #[arg(long, default_value = "32")]
        input_size: usize,
        /// Channels per image
        #[arg(long, default_value = "3")]
        channels: usize,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run(args),
        Commands::Aggregate {
            output_dir,
            expected_images,
        } => commands::aggregate(output_dir, expected_images),
        Commands::MakeData {
            output_dir,
            classes,
            images_per_class,
            input_size,
            channels,
            seed,
        } => commands::make_data(
            output_dir,
            classes,
            images_per_class,
            input_size,
            channels,
            seed,
        ),
    }
}
