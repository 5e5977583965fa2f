//! Print what the BLIP-2 runtime would read from a converted file.

use anyhow::Result;
use blip2_convert::verify::inspect;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Check a converted BLIP-2 GGUF file and summarize its contents
#[derive(Parser, Debug)]
#[command(name = "blip2-inspect", version)]
struct Args {
    /// GGUF file produced by blip2-convert
    file: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gguf_file=info".parse()?))
        .init();

    let args = Args::parse();
    let report = inspect(&args.file)?;
    println!("{report}");
    Ok(())
}
