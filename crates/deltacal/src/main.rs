use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;
mod config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.verbose);
    match cli.command {
        Command::Calibrate(args) => args.run(),
        Command::Plan(args) => args.run(),
        Command::Decode(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "deltacal", about = "Delta printer geometry calibration")]
struct Cli {
    /// Increase log output (-v info, -vv debug, -vvv trace). `RUST_LOG` takes
    /// precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit the geometry to probe results and print the corrected settings.
    Calibrate(cli::calibrate::CalibrateArgs),
    /// Print the probing G-code for a spiral pattern.
    Plan(cli::plan::PlanArgs),
    /// Read a firmware settings dump and print the geometry as JSON.
    Decode(cli::decode::DecodeArgs),
}
