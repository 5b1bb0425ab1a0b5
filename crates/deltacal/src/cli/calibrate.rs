use crate::{cli::read_input, config::Config};
use anyhow::{Context, Result};
use clap::Args;
use deltacal_core::{
    CalibrationError, CalibrationSession, Factor, FactorSet, KinematicParameters, SolveResult,
};
use deltacal_gcode::{CommandCodec, parse_probe_log};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args)]
pub struct CalibrateArgs {
    /// Firmware settings dump (the response to M503), or `-` for stdin.
    pub settings: PathBuf,

    /// Host log containing the probe results.
    pub probes: PathBuf,

    /// Path to the configuration file (TOML or JSON).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Factors to fit: a preset (three, four, six, seven, all) or a
    /// comma-separated list of factor names. Factors that cannot be fitted
    /// together, or that the firmware cannot store, are left out.
    #[arg(long)]
    pub factors: Option<FactorSet>,

    /// Append the command that stores the settings on the printer.
    #[arg(long)]
    pub save: bool,

    /// Print the solve result and commands as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct Calibration {
    pub initial: KinematicParameters,
    pub result: SolveResult,
    pub commands: Vec<String>,
}

impl CalibrateArgs {
    pub fn run(&self) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(factors) = self.factors {
            config.solver.factors = factors;
        }
        let settings = read_input(&self.settings)?;
        let probes = read_input(&self.probes)?;

        let calibration = self.calibrate(&config, &settings, &probes)?;

        if self.json {
            let json = serde_json::to_string_pretty(&calibration)
                .context("failed to render calibration")?;
            println!("{json}");
        } else {
            for command in &calibration.commands {
                println!("{command}");
            }
        }
        Ok(())
    }

    fn calibrate(&self, config: &Config, settings: &str, probes: &str) -> Result<Calibration> {
        let codec = CommandCodec::new(config.dialect());
        let initial = codec
            .decode(settings)
            .context("failed to decode settings")?
            .into_parameters()
            .context("settings dump is incomplete")?;

        let reports = parse_probe_log(probes);
        if reports.is_empty() {
            anyhow::bail!("no probe results found in {}", self.probes.display());
        }

        let mut session = CalibrationSession::new();
        session.start(initial.clone())?;
        for report in reports {
            match session.record_measurement(report.measurement()) {
                Ok(_) => {}
                Err(err @ CalibrationError::DuplicateMeasurement { .. }) => {
                    warn!(%err, "skipping repeated probe point");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("probe at ({}, {}) is unusable", report.x, report.y)
                    });
                }
            }
        }

        if let Some(stats) = session.measurements().stats() {
            info!(
                count = stats.count,
                rms = stats.rms,
                min = stats.min,
                max = stats.max,
                "probe errors before calibration"
            );
        }

        let mut options = config.solver.clone();
        options.factors = options
            .factors
            .intersection(codec.dialect().writable_factors());
        if options.factors != config.solver.factors {
            let dropped: Vec<Factor> = config
                .solver
                .factors
                .iter()
                .filter(|f| !options.factors.contains(*f))
                .collect();
            warn!(?dropped, "firmware cannot store these factors; not fitting them");
        }

        let result = session.run_solve(options).context("calibration failed")?;
        if !result.converged {
            warn!(
                iterations = result.iterations,
                rms = result.residual_rms,
                "solver stopped before converging; using the best geometry found"
            );
        }
        info!(
            initial_rms = result.initial_rms,
            residual_rms = result.residual_rms,
            "calibration finished"
        );

        let accepted = session.accept()?;
        let commands = if self.save {
            codec.encode_with_save(&accepted.parameters)
        } else {
            codec.encode(&accepted.parameters)
        };

        Ok(Calibration {
            initial,
            result,
            commands,
        })
    }
}
