//! Convert a Hugging Face BLIP-2 model directory into a GGUF file.

use anyhow::Result;
use blip2_convert::convert::{convert, ConvertOptions};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Convert BLIP-2 safetensors weights and configs into a two-tower GGUF file
#[derive(Parser, Debug)]
#[command(name = "blip2-convert", version)]
struct Args {
    /// Model directory holding config.json, vocab.json,
    /// preprocessor_config.json and the safetensors weights
    #[arg(short = 'm', long)]
    model_dir: PathBuf,

    /// Store tensors as f32 instead of f16
    #[arg(long)]
    use_f32: bool,

    /// Directory for the output file (defaults to the model directory)
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,
}

/// Application entry point for converting checkpoints.
struct ConvertApp {
    options: ConvertOptions,
}

impl ConvertApp {
    fn new(args: Args) -> Self {
        Self {
            options: ConvertOptions {
                model_dir: args.model_dir,
                output_dir: args.output_dir,
                use_f32: args.use_f32,
            },
        }
    }

    fn run(&self) -> Result<PathBuf> {
        convert(&self.options)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("blip2_convert=info".parse()?))
        .init();

    let app = ConvertApp::new(Args::parse());
    let path = app.run()?;
    println!("Done. Output file: {}", path.display());
    Ok(())
}
