use crate::config::Config;
use anyhow::Result;
use clap::Args;
use deltacal_core::spiral_points;
use deltacal_gcode::probe_commands;
use std::path::PathBuf;
use tracing::debug;

#[derive(Args)]
pub struct PlanArgs {
    /// Path to the configuration file (TOML or JSON).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of probe points, overriding the configuration.
    #[arg(long)]
    pub points: Option<usize>,

    /// Outer radius of the spiral in mm, overriding the configuration.
    #[arg(long)]
    pub radius: Option<f64>,

    /// Start with the command that dumps the current settings.
    #[arg(long)]
    pub fetch: bool,
}

impl PlanArgs {
    pub fn run(&self) -> Result<()> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(points) = self.points {
            config.probe.points = points;
        }
        if let Some(radius) = self.radius {
            config.probe.radius = radius;
        }
        config.validate()?;

        for line in self.plan(&config) {
            println!("{line}");
        }
        Ok(())
    }

    fn plan(&self, config: &Config) -> Vec<String> {
        let dialect = config.dialect();
        let probe = &config.probe;
        let points = spiral_points(probe.points, probe.radius);
        debug!(points = points.len(), radius = probe.radius, "planned probe spiral");

        let mut lines = probe.init_commands.clone();
        if self.fetch {
            lines.push(dialect.fetch_settings.to_string());
        }
        for p in points {
            lines.extend(probe_commands(&dialect, p.x, p.y, probe.safe_height));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(fetch: bool) -> PlanArgs {
        PlanArgs {
            config: None,
            points: None,
            radius: None,
            fetch,
        }
    }

    #[test]
    fn three_commands_per_point() {
        let mut config = Config::default();
        config.probe.points = 4;
        let lines = args(false).plan(&config);
        assert_eq!(lines.len(), 13);
        assert_eq!(lines[0], "G28");
        assert_eq!(lines[1], "G0 Z5.00000");
        assert_eq!(lines[2], "G0 X0.00000 Y0.00000");
        assert_eq!(lines[3], "G30");
    }

    #[test]
    fn homing_then_fetch_then_points() {
        let mut config = Config::default();
        config.probe.points = 1;
        let lines = args(true).plan(&config);
        assert_eq!(
            lines,
            ["G28", "M503", "G0 Z5.00000", "G0 X0.00000 Y0.00000", "G30"]
        );
    }

    #[test]
    fn custom_init_commands_keep_their_order() {
        let mut config = Config::default();
        config.probe.points = 1;
        config.probe.init_commands = vec!["G28".into(), "M420 S0".into()];
        let lines = args(true).plan(&config);
        assert_eq!(&lines[..3], ["G28", "M420 S0", "M503"]);

        config.probe.init_commands.clear();
        let lines = args(false).plan(&config);
        assert_eq!(lines[0], "G0 Z5.00000");
    }
}
