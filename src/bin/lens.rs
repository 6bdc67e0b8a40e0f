//! `lens` — apply a lens pipeline described by a config file to a JSON array
//! read from stdin, writing the transformed array to stdout.
//!
//! Mirrors the shape of the original CLI: one config path argument, the
//! whole input array read from stdin before anything is written, and one
//! JSON array written to stdout only once every value has been pulled
//! through successfully. A failure at any point — bad config, unresolved
//! module, lens error mid-stream — aborts before anything is printed and
//! exits non-zero.

use std::io::{self, Read};

use clap::Parser;
use lens_engine::prelude::*;

#[derive(Parser)]
#[command(name = "lens", version, about = "Apply a lens pipeline to JSON read from stdin")]
struct Cli {
    /// Path to the lens pipeline configuration (JSON).
    config: std::path::PathBuf,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        log::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = LensConfig::from_file(&cli.config)?;

    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(LensError::Io)?;
    let values: Vec<serde_json::Value> =
        serde_json::from_str(&input).map_err(|e| LensError::Config(format!("invalid input JSON: {e}")))?;

    let source: Box<dyn Source<serde_json::Value>> = Box::new(VecSource::new(values));
    let mut pipe = config::load(&config, source)?;

    let mut results = Vec::new();
    while pipe.next()? {
        results.push(pipe.value()?);
    }

    let output = serde_json::to_string(&results)
        .map_err(|e| LensError::Runtime(format!("failed to encode output: {e}")))?;
    println!("{output}");

    Ok(())
}
