//! Firmware-facing side of delta calibration: a tokenizer and parser for
//! firmware responses, the configuration command codec and probe helpers.

mod codec;
mod dialect;
mod lexer;
mod parser;
mod probe;

pub use codec::{CodecError, CommandCodec, FieldProblem, PartialParameters, strip_host_prefixes};
pub use dialect::{AxisGroup, AxisLetters, Firmware, FirmwareDialect};
pub use lexer::{LexError, Lexer, Token, TokenKind, lex};
pub use parser::{CommandCode, ParseError, Statement, Word, parse, parse_line};
pub use probe::{ProbeReport, parse_probe_log, parse_probe_report, probe_commands};

#[cfg(test)]
mod testing;
