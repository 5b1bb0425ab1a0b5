use anyhow::{Context, Result};
use deltacal_core::SolveOptions;
use deltacal_gcode::{Firmware, FirmwareDialect};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Calibration configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Firmware preset used when no explicit dialect is given
    #[serde(default)]
    pub firmware: Firmware,

    /// Full dialect, replacing the preset
    #[serde(default)]
    pub dialect: Option<FirmwareDialect>,

    /// Solver options
    #[serde(default)]
    pub solver: SolveOptions,

    /// Probe pattern
    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Probe pattern configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Number of points on the spiral
    #[serde(default = "default_points")]
    pub points: usize,

    /// Outer radius of the spiral in mm
    #[serde(default = "default_radius")]
    pub radius: f64,

    /// Height to raise to between probes in mm
    #[serde(default = "default_safe_height")]
    pub safe_height: f64,

    /// Commands sent before anything else, such as homing
    #[serde(default = "default_init_commands")]
    pub init_commands: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            points: default_points(),
            radius: default_radius(),
            safe_height: default_safe_height(),
            init_commands: default_init_commands(),
        }
    }
}

fn default_points() -> usize {
    50
}

fn default_radius() -> f64 {
    80.0
}

fn default_safe_height() -> f64 {
    5.0
}

fn default_init_commands() -> Vec<String> {
    vec!["G28".to_string()]
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    /// Parse configuration from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    /// Loads `path` if given, otherwise the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// The dialect in force: the explicit one, or the firmware preset
    pub fn dialect(&self) -> FirmwareDialect {
        self.dialect
            .clone()
            .unwrap_or_else(|| self.firmware.dialect())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let solver = &self.solver;
        if solver.factors.is_empty() {
            anyhow::bail!("solver.factors cannot be empty");
        }
        if solver.max_iterations == 0 {
            anyhow::bail!("solver.max_iterations must be at least 1");
        }
        if !positive(solver.perturbation) {
            anyhow::bail!("solver.perturbation must be positive");
        }
        if !non_negative(solver.tolerance) || !non_negative(solver.acceptance_rms) {
            anyhow::bail!("solver.tolerance and solver.acceptance_rms cannot be negative");
        }
        if !non_negative(solver.damping) {
            anyhow::bail!("solver.damping cannot be negative");
        }

        if self.probe.points == 0 {
            anyhow::bail!("probe.points must be at least 1");
        }
        if !positive(self.probe.radius) || !positive(self.probe.safe_height) {
            anyhow::bail!("probe.radius and probe.safe_height must be positive");
        }
        if self.probe.init_commands.iter().any(|c| c.trim().is_empty()) {
            anyhow::bail!("probe.init_commands cannot contain blank commands");
        }

        self.dialect().validate().context("invalid dialect")?;
        Ok(())
    }
}

fn positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use deltacal_core::FactorSet;
    use std::io::Write;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
firmware = "smoothie"

[solver]
factors = "four"
damping = 0.001

[probe]
points = 13
radius = 60.0
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.firmware, Firmware::Smoothie);
        assert_eq!(config.solver.factors, FactorSet::FOUR);
        assert_eq!(config.solver.damping, 0.001);
        assert_eq!(config.probe.points, 13);
        assert_eq!(config.probe.safe_height, 5.0);
        assert_eq!(config.dialect(), FirmwareDialect::smoothie());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "dialect": { "probe_command": "G29", "decimals": 3 },
            "solver": { "factors": ["endstop_a", "endstop_b", "endstop_c"] }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.solver.factors, FactorSet::THREE);
        let dialect = config.dialect();
        assert_eq!(dialect.probe_command.to_string(), "G29");
        assert_eq!(dialect.decimals, 3);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.firmware, Firmware::Marlin);
        assert_eq!(config.solver, SolveOptions::default());
        assert_eq!(config.probe.points, 50);
        assert_eq!(config.probe.init_commands, ["G28"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.solver.factors = FactorSet::empty();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe.radius = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.probe.init_commands = vec!["G28".into(), " ".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_init_commands() {
        let config = Config::from_toml(r#"[probe]
init_commands = ["G28", "G29 S0"]
"#).unwrap();
        assert_eq!(config.probe.init_commands, ["G28", "G29 S0"]);

        let config = Config::from_json(r#"{ "probe": { "init_commands": [] } }"#).unwrap();
        assert!(config.probe.init_commands.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_detects_format() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{ "probe": {{ "points": 7 }} }}"#).unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.probe.points, 7);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[probe]\nradius = 42.0\n").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.probe.radius, 42.0);
    }
}
