// Probe command sequences and probe result parsing

use crate::{codec::strip_host_prefixes, dialect::FirmwareDialect, parser::parse_line};
use deltacal_core::{Measurement, Point3D};
use serde::{Deserialize, Serialize};

/// Where the firmware says the nozzle was when the probe triggered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl ProbeReport {
    /// A probe aimed at the bed surface (Z = 0) whose trigger height is the
    /// measured error.
    pub fn measurement(&self) -> Measurement {
        Measurement::new(Point3D::new(self.x, self.y, 0.0), self.z)
    }
}

/// Commands that raise to `safe_height`, move over (`x`, `y`) and probe.
pub fn probe_commands(dialect: &FirmwareDialect, x: f64, y: f64, safe_height: f64) -> Vec<String> {
    let mv = dialect.move_command;
    vec![
        format!("{mv} Z{}", dialect.format_number(safe_height)),
        format!(
            "{mv} X{} Y{}",
            dialect.format_number(x),
            dialect.format_number(y)
        ),
        dialect.probe_command.to_string(),
    ]
}

/// Parses `Bed X: .. Y: .. Z: ..` (Marlin) or `PROBE: X.., Y.., Z..`
/// style result lines.
pub fn parse_probe_report(line: &str) -> Option<ProbeReport> {
    let statement = parse_line(1, strip_host_prefixes(line)).ok()??;
    if statement.command.is_some() {
        return None;
    }
    let labelled = statement
        .text
        .first()
        .is_some_and(|t| t.eq_ignore_ascii_case("bed") || t.eq_ignore_ascii_case("probe:"));
    if !labelled {
        return None;
    }

    Some(ProbeReport {
        x: statement.get('X')?,
        y: statement.get('Y')?,
        z: statement.get('Z')?,
    })
}

/// Every probe report in a host log, in order.
pub fn parse_probe_log(log: &str) -> Vec<ProbeReport> {
    log.lines().filter_map(parse_probe_report).collect()
}
