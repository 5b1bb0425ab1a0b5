use crate::{cli::read_input, config::Config};
use anyhow::{Context, Result};
use clap::Args;
use deltacal_gcode::{CommandCodec, Firmware};
use std::path::PathBuf;

#[derive(Args)]
pub struct DecodeArgs {
    /// Firmware settings dump (the response to M503), or `-` for stdin.
    pub settings: PathBuf,

    /// Path to the configuration file (TOML or JSON).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Firmware preset, replacing the configured dialect.
    #[arg(long)]
    pub firmware: Option<Firmware>,

    /// Print only what the dump reported instead of requiring a complete
    /// geometry.
    #[arg(long)]
    pub partial: bool,
}

impl DecodeArgs {
    pub fn run(&self) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(firmware) = self.firmware {
            config.firmware = firmware;
            config.dialect = None;
        }
        let settings = read_input(&self.settings)?;
        println!("{}", self.decode(&config, &settings)?);
        Ok(())
    }

    fn decode(&self, config: &Config, settings: &str) -> Result<String> {
        let codec = CommandCodec::new(config.dialect());
        let partial = codec
            .decode(settings)
            .with_context(|| format!("failed to decode {}", self.settings.display()))?;
        if partial.is_empty() {
            anyhow::bail!("no geometry found in {}", self.settings.display());
        }

        let json = if self.partial {
            serde_json::to_string_pretty(&partial)
        } else {
            let parameters = partial
                .into_parameters()
                .context("settings dump is incomplete; use --partial to see what was found")?;
            serde_json::to_string_pretty(&parameters)
        };
        json.context("failed to render parameters")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARLIN: &str = "\
echo:  M92 X80.00 Y80.00 Z80.00
echo:  M666 X-0.50 Y0.00 Z0.00
echo:  M665 L215.00 R110.00 H250.00 S200.00 X0.00 Y0.00 Z0.00
";

    fn args(partial: bool) -> DecodeArgs {
        DecodeArgs {
            settings: PathBuf::from("-"),
            config: None,
            firmware: None,
            partial,
        }
    }

    #[test]
    fn full_geometry() {
        let json = args(false).decode(&Config::default(), MARLIN).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["diagonal_rod"], 215.0);
        assert_eq!(value["radius"], 110.0);
        // Marlin reports endstop offsets negated
        assert_eq!(value["endstop_offsets"][0], 0.5);
    }

    #[test]
    fn partial_dump() {
        let json = args(true)
            .decode(&Config::default(), "M92 X80 Y80 Z400")
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["steps_per_unit"][2], 400.0);
        assert!(value["radius"].is_null());

        let err = args(false)
            .decode(&Config::default(), "M92 X80 Y80 Z400")
            .unwrap_err();
        assert!(err.to_string().contains("--partial"));
    }

    #[test]
    fn nothing_recognised() {
        let err = args(true).decode(&Config::default(), "ok\n").unwrap_err();
        assert!(err.to_string().contains("no geometry"));
    }
}
