use crate::{codec::CodecError, parser::CommandCode};
use deltacal_core::{Factor, FactorSet};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Three parameter letters, one per tower, in alpha/beta/gamma order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AxisLetters(pub [char; 3]);

impl AxisLetters {
    pub const XYZ: Self = Self(['X', 'Y', 'Z']);
    pub const ABC: Self = Self(['A', 'B', 'C']);
}

impl fmt::Display for AxisLetters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for letter in self.0 {
            write!(f, "{letter}")?;
        }
        Ok(())
    }
}

impl FromStr for AxisLetters {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let letters: Vec<char> = s.trim().chars().collect();
        match letters[..] {
            [a, b, c] if letters.iter().all(char::is_ascii_alphabetic) => Ok(Self([
                a.to_ascii_uppercase(),
                b.to_ascii_uppercase(),
                c.to_ascii_uppercase(),
            ])),
            _ => Err(format!("expected three parameter letters, found '{s}'")),
        }
    }
}

impl TryFrom<String> for AxisLetters {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AxisLetters> for String {
    fn from(letters: AxisLetters) -> Self {
        letters.to_string()
    }
}

/// A command that carries one value per tower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisGroup {
    pub command: CommandCode,
    pub letters: AxisLetters,
}

/// How a firmware family names its configuration commands and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareDialect {
    pub fetch_settings: CommandCode,
    pub save_settings: CommandCode,
    pub move_command: CommandCode,
    pub probe_command: CommandCode,
    pub steps_per_unit: AxisGroup,
    pub endstop_offsets: AxisGroup,
    /// Marlin reports endstop adjustments with the opposite sign.
    pub invert_endstop_offsets: bool,
    pub delta_config: CommandCode,
    /// Letters for radius, height and diagonal rod, in that order.
    pub radius_height_rod: AxisLetters,
    pub tower_angle_offsets: AxisLetters,
    pub radius_offsets: Option<AxisLetters>,
    pub rod_offsets: Option<AxisLetters>,
    /// Digits after the decimal point in emitted commands.
    pub decimals: usize,
}

impl Default for FirmwareDialect {
    fn default() -> Self {
        Self::marlin()
    }
}

impl FirmwareDialect {
    /// Marlin 2. Its `M665` uses `B` for the probing calibration radius and
    /// has no per-tower rod trim.
    pub fn marlin() -> Self {
        Self {
            fetch_settings: CommandCode::m(503),
            save_settings: CommandCode::m(500),
            move_command: CommandCode::g(0),
            probe_command: CommandCode::g(30),
            steps_per_unit: AxisGroup {
                command: CommandCode::m(92),
                letters: AxisLetters::XYZ,
            },
            endstop_offsets: AxisGroup {
                command: CommandCode::m(666),
                letters: AxisLetters::XYZ,
            },
            invert_endstop_offsets: true,
            delta_config: CommandCode::m(665),
            radius_height_rod: AxisLetters(['R', 'H', 'L']),
            tower_angle_offsets: AxisLetters::XYZ,
            radius_offsets: None,
            rod_offsets: None,
            decimals: 5,
        }
    }

    /// Marlin 1.1 builds with per-tower diagonal rod trim on `M665 A B C`.
    pub fn marlin_rod_trim() -> Self {
        Self {
            rod_offsets: Some(AxisLetters::ABC),
            ..Self::marlin()
        }
    }

    pub fn smoothie() -> Self {
        Self {
            invert_endstop_offsets: false,
            radius_height_rod: AxisLetters(['R', 'Z', 'L']),
            tower_angle_offsets: AxisLetters(['D', 'E', 'H']),
            radius_offsets: Some(AxisLetters::ABC),
            rod_offsets: None,
            ..Self::marlin()
        }
    }

    /// Every letter group carried by the delta configuration command.
    pub fn delta_groups(&self) -> impl Iterator<Item = AxisLetters> + '_ {
        [
            Some(self.radius_height_rod),
            Some(self.tower_angle_offsets),
            self.radius_offsets,
            self.rod_offsets,
        ]
        .into_iter()
        .flatten()
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.decimals > 10 {
            return Err(CodecError::InvalidDialect(format!(
                "{} decimals is more than f64 can carry",
                self.decimals
            )));
        }

        let mut seen = Vec::new();
        for letter in self.delta_groups().flat_map(|g| g.0) {
            if seen.contains(&letter) {
                return Err(CodecError::InvalidDialect(format!(
                    "letter {letter} is used twice in {}",
                    self.delta_config
                )));
            }
            seen.push(letter);
        }

        for group in [self.steps_per_unit, self.endstop_offsets] {
            let [a, b, c] = group.letters.0;
            if a == b || b == c || a == c {
                return Err(CodecError::InvalidDialect(format!(
                    "{} repeats a letter in {}",
                    group.command, group.letters
                )));
            }
            if group.command == self.delta_config {
                return Err(CodecError::InvalidDialect(format!(
                    "{} cannot be shared with the delta configuration",
                    group.command
                )));
            }
        }

        if self.steps_per_unit.command == self.endstop_offsets.command {
            return Err(CodecError::InvalidDialect(format!(
                "steps per unit and endstop offsets both use {}",
                self.steps_per_unit.command
            )));
        }
        Ok(())
    }

    /// Factors whose values this firmware can be told about.
    pub fn writable_factors(&self) -> FactorSet {
        let mut factors: FactorSet = Factor::ALL.into_iter().collect();
        if self.radius_offsets.is_none() {
            factors = factors
                .without(Factor::RadiusOffsetA)
                .without(Factor::RadiusOffsetB)
                .without(Factor::RadiusOffsetC);
        }
        if self.rod_offsets.is_none() {
            factors = factors
                .without(Factor::RodOffsetA)
                .without(Factor::RodOffsetB)
                .without(Factor::RodOffsetC);
        }
        factors
    }

    /// Fixed-point rendering with negative zero folded to zero.
    pub fn format_number(&self, value: f64) -> String {
        let text = format!("{:.*}", self.decimals, value);
        match text.strip_prefix('-') {
            Some(magnitude) if magnitude.chars().all(|c| c == '0' || c == '.') => {
                magnitude.to_string()
            }
            _ => text,
        }
    }
}

/// Built-in dialect presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Marlin,
    #[serde(rename = "marlin-rod-trim")]
    MarlinRodTrim,
    Smoothie,
}

impl Firmware {
    pub fn dialect(self) -> FirmwareDialect {
        match self {
            Firmware::Marlin => FirmwareDialect::marlin(),
            Firmware::MarlinRodTrim => FirmwareDialect::marlin_rod_trim(),
            Firmware::Smoothie => FirmwareDialect::smoothie(),
        }
    }
}

impl FromStr for Firmware {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "marlin" => Ok(Firmware::Marlin),
            "marlin-rod-trim" => Ok(Firmware::MarlinRodTrim),
            "smoothie" | "smoothieware" => Ok(Firmware::Smoothie),
            other => Err(format!("unknown firmware '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        FirmwareDialect::marlin().validate().unwrap();
        FirmwareDialect::marlin_rod_trim().validate().unwrap();
        FirmwareDialect::smoothie().validate().unwrap();
    }

    #[test]
    fn clashing_letters_rejected() {
        let mut dialect = FirmwareDialect::marlin();
        dialect.radius_offsets = Some(AxisLetters(['R', 'D', 'E']));
        let err = dialect.validate().unwrap_err();
        assert!(matches!(err, CodecError::InvalidDialect(_)));
    }

    #[test]
    fn writable_factors_follow_letter_groups() {
        let marlin = FirmwareDialect::marlin().writable_factors();
        assert!(!marlin.contains(Factor::RodOffsetA));
        assert!(!marlin.contains(Factor::RadiusOffsetA));
        assert!(marlin.contains(Factor::StepsC));
        assert!(FirmwareDialect::marlin_rod_trim()
            .writable_factors()
            .contains(Factor::RodOffsetA));
        let smoothie = FirmwareDialect::smoothie().writable_factors();
        assert!(smoothie.contains(Factor::RadiusOffsetC));
        assert!(!smoothie.contains(Factor::RodOffsetC));
    }

    #[test]
    fn firmware_names() {
        assert_eq!("Marlin".parse::<Firmware>().unwrap(), Firmware::Marlin);
        let trim: Firmware = serde_json::from_str("\"marlin-rod-trim\"").unwrap();
        assert_eq!(trim.dialect(), FirmwareDialect::marlin_rod_trim());
    }

    #[test]
    fn negative_zero_is_folded() {
        let dialect = FirmwareDialect::marlin();
        assert_eq!(dialect.format_number(-0.000001), "0.00000");
        assert_eq!(dialect.format_number(-0.25), "-0.25000");
        assert_eq!(dialect.format_number(215.0), "215.00000");
    }

    #[test]
    fn dialect_from_json_overrides_preset_fields() {
        let dialect: FirmwareDialect = serde_json::from_str(
            r#"{ "probe_command": "G38", "radius_height_rod": "rzl", "decimals": 3 }"#,
        )
        .unwrap();
        assert_eq!(dialect.probe_command, CommandCode::g(38));
        assert_eq!(dialect.radius_height_rod, AxisLetters(['R', 'Z', 'L']));
        assert_eq!(dialect.decimals, 3);
        assert_eq!(dialect.delta_config, CommandCode::m(665));
    }

    #[test]
    fn bad_letter_groups_fail_to_deserialize() {
        let result: Result<FirmwareDialect, _> =
            serde_json::from_str(r#"{ "tower_angle_offsets": "XY" }"#);
        assert!(result.is_err());
    }
}
