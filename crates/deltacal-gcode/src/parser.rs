use crate::lexer::{LexError, Token, TokenKind, lex};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// One line of firmware output or G-code.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Statement {
    pub line: usize,
    pub raw: String,
    /// Leading `G`/`M` code, if the line carries one.
    pub command: Option<CommandCode>,
    pub words: Vec<Word>,
    pub text: Vec<String>,
    pub comment: Option<String>,
}

impl Statement {
    /// Value of the first word with `letter`.
    pub fn get(&self, letter: char) -> Option<f64> {
        self.words
            .iter()
            .find(|w| w.letter == letter)
            .map(|w| w.value)
    }

    /// Whether any non-numeric field on the line starts with `letter`.
    pub fn has_text_field(&self, letter: char) -> bool {
        self.text.iter().any(|t| t.starts_with(letter))
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Word {
    pub letter: char,
    pub value: f64,
}

/// A G-code command such as `M665`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandCode {
    pub letter: char,
    pub number: u16,
}

impl CommandCode {
    pub const fn new(letter: char, number: u16) -> Self {
        Self { letter, number }
    }

    pub const fn m(number: u16) -> Self {
        Self::new('M', number)
    }

    pub const fn g(number: u16) -> Self {
        Self::new('G', number)
    }

    fn from_word(word: &Word) -> Option<Self> {
        if !matches!(word.letter, 'G' | 'M') || word.value.fract() != 0.0 {
            return None;
        }
        if !(0.0..=f64::from(u16::MAX)).contains(&word.value) {
            return None;
        }
        Some(Self::new(word.letter, word.value as u16))
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.letter, self.number)
    }
}

impl FromStr for CommandCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut chars = s.chars();
        let letter = chars
            .next()
            .filter(char::is_ascii_alphabetic)
            .ok_or_else(|| format!("invalid command '{s}'"))?
            .to_ascii_uppercase();
        let number = chars
            .as_str()
            .parse::<u16>()
            .map_err(|_| format!("invalid command '{s}'"))?;
        Ok(Self::new(letter, number))
    }
}

impl TryFrom<String> for CommandCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandCode> for String {
    fn from(code: CommandCode) -> Self {
        code.to_string()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error("multiple comments on line {line}")]
    MultipleComments { line: usize },
}

/// Parses every line of `input`, failing on the first malformed one.
pub fn parse(input: &str) -> Result<Vec<Statement>, ParseError> {
    let lines: Vec<&str> = input.lines().collect();
    let mut out = Vec::new();
    let mut pending = Vec::new();

    for token in lex(input) {
        let token = token?;
        if token.kind == TokenKind::Newline {
            let line = token.line;
            if let Some(statement) = build(line, lines.get(line - 1).copied(), std::mem::take(&mut pending))? {
                out.push(statement);
            }
            continue;
        }
        pending.push(token);
    }

    if let Some(first) = pending.first() {
        let line = first.line;
        if let Some(statement) = build(line, lines.get(line - 1).copied(), pending)? {
            out.push(statement);
        }
    }
    Ok(out)
}

/// Parses a single line, numbering it `line`. Blank lines yield `None`.
pub fn parse_line(line: usize, raw: &str) -> Result<Option<Statement>, ParseError> {
    let tokens = lex(raw)
        .filter(|t| !matches!(t, Ok(Token { kind: TokenKind::Newline, .. })))
        .collect::<Result<Vec<_>, _>>()?;
    build(line, Some(raw), tokens)
}

fn build(
    line: usize,
    raw: Option<&str>,
    tokens: Vec<Token>,
) -> Result<Option<Statement>, ParseError> {
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut words = Vec::new();
    let mut text = Vec::new();
    let mut comment = None;
    let mut tokens = tokens.into_iter().peekable();

    while let Some(token) = tokens.next() {
        match token.kind {
            TokenKind::Word { letter, value } => words.push(Word { letter, value }),
            TokenKind::Text(t) => {
                // `X: 1.5` and `X:1.5` are how firmware reports coordinates
                if let Some(letter) = axis_label(&t) {
                    if let Some(Token {
                        kind: TokenKind::Number(value),
                        ..
                    }) = tokens.peek()
                    {
                        words.push(Word {
                            letter,
                            value: *value,
                        });
                        tokens.next();
                        continue;
                    }
                }
                if let Some((letter, value)) = inline_axis_value(&t) {
                    words.push(Word { letter, value });
                    continue;
                }
                text.push(t);
            }
            TokenKind::Number(value) => text.push(value.to_string()),
            TokenKind::Comment(c) => {
                if comment.is_some() {
                    return Err(ParseError::MultipleComments { line });
                }
                comment = Some(c);
            }
            TokenKind::Newline => {}
        }
    }

    let command = words.first().and_then(CommandCode::from_word);
    if command.is_some() {
        words.remove(0);
    }

    Ok(Some(Statement {
        line,
        raw: raw.map(|r| r.trim_end().to_string()).unwrap_or_default(),
        command,
        words,
        text,
        comment,
    }))
}

fn axis_label(text: &str) -> Option<char> {
    let mut chars = text.chars();
    let letter = chars.next().filter(char::is_ascii_alphabetic)?;
    (chars.as_str() == ":").then(|| letter.to_ascii_uppercase())
}

fn inline_axis_value(text: &str) -> Option<(char, f64)> {
    let (label, value) = text.split_once(':')?;
    let letter = axis_label(&format!("{label}:"))?;
    let value = value.parse::<f64>().ok()?;
    Some((letter, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::render_statements;
    use insta::assert_snapshot;

    #[test]
    fn settings_dump() {
        let input = "\
echo:; Steps per unit:
echo:  M92 X80.00 Y80.00 Z80.00
echo:  M665 L215.00 R110.00 H250.00 S200.00 X0.10 Y-0.20 Z0.00
ok
";
        assert_snapshot!(render_statements(input), @r"
        1 text=[echo:] comment=Steps per unit:
        2 M92 X80 Y80 Z80 text=[echo:]
        3 M665 L215 R110 H250 S200 X0.1 Y-0.2 Z0 text=[echo:]
        4 text=[ok]
        ");
    }

    #[test]
    fn probe_reports_become_words() {
        let statements = parse("Bed X: 10.000 Y: -20.5 Z:0.125\n").unwrap();
        assert_eq!(statements.len(), 1);
        let s = &statements[0];
        assert_eq!(s.command, None);
        assert_eq!(s.get('X'), Some(10.0));
        assert_eq!(s.get('Y'), Some(-20.5));
        assert_eq!(s.get('Z'), Some(0.125));
        assert_eq!(s.text, ["Bed"]);
    }

    #[test]
    fn parse_line_keeps_raw_text() {
        let s = parse_line(7, "M666 X-0.5 Y0 Z-0.25  ").unwrap().unwrap();
        assert_eq!(s.line, 7);
        assert_eq!(s.raw, "M666 X-0.5 Y0 Z-0.25");
        assert_eq!(s.command, Some(CommandCode::m(666)));
        assert_eq!(s.get('Z'), Some(-0.25));
        assert!(parse_line(1, "   ").unwrap().is_none());
    }

    #[test]
    fn command_codes_round_trip_through_strings() {
        let code: CommandCode = "m503".parse().unwrap();
        assert_eq!(code, CommandCode::m(503));
        assert_eq!(code.to_string(), "M503");
        assert!("M".parse::<CommandCode>().is_err());
        assert!("503".parse::<CommandCode>().is_err());
    }

    #[test]
    fn multiple_comments_rejected() {
        let err = parse("G28 (home) ; again").unwrap_err();
        assert_eq!(err, ParseError::MultipleComments { line: 1 });
    }
}
