use anyhow::{Context, Result};
use std::{fs, io, path::Path};
use tracing_subscriber::EnvFilter;

pub mod calibrate;
pub mod decode;
pub mod plan;

pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Reads `path`, or standard input when it is `-`.
fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return io::read_to_string(io::stdin()).context("failed to read standard input");
    }
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
