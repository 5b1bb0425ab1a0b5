use crate::{
    dialect::{AxisLetters, FirmwareDialect},
    parser::{CommandCode, ParseError, Statement, parse_line},
};
use deltacal_core::KinematicParameters;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::warn;

const HOST_PREFIXES: [&str; 3] = ["Recv:", "Send:", "echo:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    NotNumeric,
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldProblem::Missing => "missing",
            FieldProblem::NotNumeric => "not numeric",
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CodecError {
    #[error("{command} on line {line}: field {field} is {problem}")]
    UnparsableResponse {
        command: CommandCode,
        field: char,
        line: usize,
        problem: FieldProblem,
    },

    #[error("line {line} could not be parsed")]
    UnparsableLine {
        line: usize,
        #[source]
        source: ParseError,
    },

    #[error("the settings never reported {field}")]
    MissingField { field: &'static str },

    #[error("invalid firmware dialect: {0}")]
    InvalidDialect(String),
}

/// Geometry values recovered from a settings dump. Groups the firmware did
/// not report stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartialParameters {
    pub diagonal_rod: Option<f64>,
    pub radius: Option<f64>,
    pub height: Option<f64>,
    pub tower_angle_offsets: Option<[f64; 3]>,
    pub radius_offsets: Option<[f64; 3]>,
    pub rod_offsets: Option<[f64; 3]>,
    pub endstop_offsets: Option<[f64; 3]>,
    pub steps_per_unit: Option<[f64; 3]>,
}

impl PartialParameters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrites the reported values in `base`.
    pub fn merge_into(&self, base: &mut KinematicParameters) {
        let scalars = [
            (self.diagonal_rod, &mut base.diagonal_rod),
            (self.radius, &mut base.radius),
            (self.height, &mut base.height),
        ];
        for (value, target) in scalars {
            if let Some(value) = value {
                *target = value;
            }
        }

        let groups = [
            (self.tower_angle_offsets, &mut base.tower_angle_offsets),
            (self.radius_offsets, &mut base.radius_offsets),
            (self.rod_offsets, &mut base.rod_offsets),
            (self.endstop_offsets, &mut base.endstop_offsets),
            (self.steps_per_unit, &mut base.steps_per_unit),
        ];
        for (value, target) in groups {
            if let Some(value) = value {
                *target = value;
            }
        }
    }

    /// Builds a full parameter set. Radius, height and rod length must have
    /// been reported; everything else falls back to defaults.
    pub fn into_parameters(self) -> Result<KinematicParameters, CodecError> {
        let diagonal_rod = self.diagonal_rod.ok_or(CodecError::MissingField {
            field: "diagonal rod",
        })?;
        let radius = self
            .radius
            .ok_or(CodecError::MissingField { field: "radius" })?;
        let height = self
            .height
            .ok_or(CodecError::MissingField { field: "height" })?;

        let mut parameters = KinematicParameters::new(diagonal_rod, radius, height);
        self.merge_into(&mut parameters);
        Ok(parameters)
    }
}

/// Translates parameters to firmware commands and settings dumps back to
/// parameters.
#[derive(Debug, Clone, Default)]
pub struct CommandCodec {
    dialect: FirmwareDialect,
}

impl CommandCodec {
    pub fn new(dialect: FirmwareDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> &FirmwareDialect {
        &self.dialect
    }

    pub fn fetch_command(&self) -> String {
        self.dialect.fetch_settings.to_string()
    }

    pub fn save_command(&self) -> String {
        self.dialect.save_settings.to_string()
    }

    /// One command per configuration group: steps per unit, endstop offsets,
    /// then the combined delta configuration.
    pub fn encode(&self, parameters: &KinematicParameters) -> Vec<String> {
        let d = &self.dialect;
        let endstops = if d.invert_endstop_offsets {
            parameters.endstop_offsets.map(|e| -e)
        } else {
            parameters.endstop_offsets
        };

        let mut delta = d.delta_config.to_string();
        self.push_group(
            &mut delta,
            d.radius_height_rod,
            [parameters.radius, parameters.height, parameters.diagonal_rod],
        );
        self.push_group(&mut delta, d.tower_angle_offsets, parameters.tower_angle_offsets);
        self.push_optional(&mut delta, d.radius_offsets, parameters.radius_offsets, "radius offsets");
        self.push_optional(&mut delta, d.rod_offsets, parameters.rod_offsets, "rod offsets");

        let mut steps = d.steps_per_unit.command.to_string();
        self.push_group(&mut steps, d.steps_per_unit.letters, parameters.steps_per_unit);
        let mut endstop = d.endstop_offsets.command.to_string();
        self.push_group(&mut endstop, d.endstop_offsets.letters, endstops);

        vec![steps, endstop, delta]
    }

    /// [`encode`](Self::encode) followed by the command that persists the
    /// settings.
    pub fn encode_with_save(&self, parameters: &KinematicParameters) -> Vec<String> {
        let mut commands = self.encode(parameters);
        commands.push(self.save_command());
        commands
    }

    fn push_group(&self, out: &mut String, letters: AxisLetters, values: [f64; 3]) {
        for (letter, value) in letters.0.into_iter().zip(values) {
            out.push(' ');
            out.push(letter);
            out.push_str(&self.dialect.format_number(value));
        }
    }

    fn push_optional(
        &self,
        out: &mut String,
        letters: Option<AxisLetters>,
        values: [f64; 3],
        name: &str,
    ) {
        match letters {
            Some(letters) => self.push_group(out, letters, values),
            None if values.iter().any(|v| *v != 0.0) => {
                warn!(?values, "firmware has no parameters for {name}; dropping them");
            }
            None => {}
        }
    }

    /// Reads the configuration commands out of a settings dump.
    ///
    /// Unknown lines and extra fields are ignored. A configuration command
    /// that is present must carry every letter of its groups.
    pub fn decode(&self, response: &str) -> Result<PartialParameters, CodecError> {
        let d = &self.dialect;
        let mut out = PartialParameters::default();

        for (index, raw) in response.lines().enumerate() {
            let line = index + 1;
            let body = strip_host_prefixes(raw);

            let statement = match parse_line(line, body) {
                Ok(Some(statement)) => statement,
                Ok(None) => continue,
                Err(source) => {
                    if self.is_tracked(body) {
                        return Err(CodecError::UnparsableLine { line, source });
                    }
                    warn!(line, %source, "skipping unparsable response line");
                    continue;
                }
            };
            let Some(command) = statement.command else {
                continue;
            };

            if command == d.steps_per_unit.command {
                out.steps_per_unit = Some(require(&statement, command, d.steps_per_unit.letters)?);
            }

            if command == d.endstop_offsets.command {
                let mut offsets = require(&statement, command, d.endstop_offsets.letters)?;
                if d.invert_endstop_offsets {
                    offsets = offsets.map(|e| -e);
                }
                out.endstop_offsets = Some(offsets);
            }

            if command == d.delta_config {
                let [radius, height, rod] = require(&statement, command, d.radius_height_rod)?;
                out.radius = Some(radius);
                out.height = Some(height);
                out.diagonal_rod = Some(rod);
                out.tower_angle_offsets =
                    Some(require(&statement, command, d.tower_angle_offsets)?);
                if let Some(letters) = d.radius_offsets {
                    if let Some(values) = optional(&statement, command, letters)? {
                        out.radius_offsets = Some(values);
                    }
                }
                if let Some(letters) = d.rod_offsets {
                    if let Some(values) = optional(&statement, command, letters)? {
                        out.rod_offsets = Some(values);
                    }
                }
            }
        }

        Ok(out)
    }

    fn is_tracked(&self, body: &str) -> bool {
        let d = &self.dialect;
        let head: String = body
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        [
            d.steps_per_unit.command,
            d.endstop_offsets.command,
            d.delta_config,
        ]
        .iter()
        .any(|c| head.eq_ignore_ascii_case(&c.to_string()))
    }
}

/// Removes host log decorations such as `Recv: echo:` from a response line.
pub fn strip_host_prefixes(line: &str) -> &str {
    let mut rest = line.trim_start();
    'outer: loop {
        for prefix in HOST_PREFIXES {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                rest = stripped.trim_start();
                continue 'outer;
            }
        }
        return rest;
    }
}

fn field(statement: &Statement, command: CommandCode, letter: char) -> Result<Option<f64>, CodecError> {
    if let Some(value) = statement.get(letter) {
        return Ok(Some(value));
    }
    if statement.has_text_field(letter) {
        return Err(CodecError::UnparsableResponse {
            command,
            field: letter,
            line: statement.line,
            problem: FieldProblem::NotNumeric,
        });
    }
    Ok(None)
}

fn optional(
    statement: &Statement,
    command: CommandCode,
    letters: AxisLetters,
) -> Result<Option<[f64; 3]>, CodecError> {
    let mut values = [None; 3];
    for (slot, letter) in values.iter_mut().zip(letters.0) {
        *slot = field(statement, command, letter)?;
    }

    match values {
        [None, None, None] => Ok(None),
        [Some(a), Some(b), Some(c)] => Ok(Some([a, b, c])),
        _ => {
            let missing = letters
                .0
                .into_iter()
                .zip(values)
                .find_map(|(letter, v)| v.is_none().then_some(letter))
                .unwrap_or(letters.0[0]);
            Err(CodecError::UnparsableResponse {
                command,
                field: missing,
                line: statement.line,
                problem: FieldProblem::Missing,
            })
        }
    }
}

fn require(
    statement: &Statement,
    command: CommandCode,
    letters: AxisLetters,
) -> Result<[f64; 3], CodecError> {
    optional(statement, command, letters)?.ok_or(CodecError::UnparsableResponse {
        command,
        field: letters.0[0],
        line: statement.line,
        problem: FieldProblem::Missing,
    })
}
