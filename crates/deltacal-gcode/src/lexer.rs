use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", content = "value")]
pub enum TokenKind {
    /// A letter immediately followed by a number, such as `X-0.25` or `M665`.
    Word { letter: char, value: f64 },
    Number(f64),
    /// Any other run of non-separator characters (`ok`, `echo:`, `Bed`, `X:`).
    Text(String),
    Comment(String),
    Newline,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LexError {
    #[error("invalid number '{raw}' at line {line}, column {column}")]
    InvalidNumber {
        line: usize,
        column: usize,
        raw: String,
    },

    #[error("unterminated parenthesized comment starting at line {line}, column {column}")]
    UnterminatedComment { line: usize, column: usize },
}

pub fn lex(input: &str) -> Lexer<'_> {
    Lexer::new(input)
}

/// Tokenizer for firmware responses and the commands echoed in them.
///
/// Commas separate values like whitespace does, so `X1.0, Y2.0` lexes the
/// same as `X1.0 Y2.0`.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_second(&self) -> Option<char> {
        self.chars.clone().nth(1)
    }

    fn pos(&self) -> (usize, usize) {
        (self.line, self.column)
    }

    fn at_number(&mut self) -> bool {
        match self.peek() {
            Some(ch) if ch.is_ascii_digit() => true,
            Some('+' | '-' | '.') => {
                matches!(self.peek_second(), Some(next) if next.is_ascii_digit() || next == '.')
            }
            _ => false,
        }
    }

    fn take_run(&mut self, mut raw: String) -> String {
        while let Some(c) = self.peek() {
            if is_separator(c) {
                break;
            }
            raw.push(c);
            self.bump();
        }
        raw
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(ch) = self.peek() {
            let (line, column) = self.pos();
            let token = |kind| Some(Ok(Token { kind, line, column }));

            if ch.is_ascii_whitespace() || ch == ',' {
                self.bump();
                if ch == '\n' {
                    return token(TokenKind::Newline);
                }
                continue;
            }

            if ch == ';' {
                self.bump();
                let mut text = String::new();
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    self.bump();
                }
                return token(TokenKind::Comment(text.trim().to_string()));
            }

            if ch == '(' {
                self.bump();
                let mut text = String::new();
                while let Some(c) = self.peek() {
                    if c == ')' {
                        self.bump();
                        return token(TokenKind::Comment(text));
                    }
                    if c == '\n' {
                        break;
                    }
                    text.push(c);
                    self.bump();
                }
                return Some(Err(LexError::UnterminatedComment { line, column }));
            }

            if ch.is_ascii_alphabetic() {
                self.bump();
                if self.at_number() {
                    let start = self.column;
                    return match parse_number(self) {
                        Ok(value) => token(TokenKind::Word {
                            letter: ch.to_ascii_uppercase(),
                            value,
                        }),
                        Err(raw) => Some(Err(LexError::InvalidNumber {
                            line,
                            column: start,
                            raw,
                        })),
                    };
                }
                let raw = self.take_run(ch.to_string());
                return token(TokenKind::Text(raw));
            }

            if self.at_number() {
                return match parse_number(self) {
                    Ok(value) => {
                        // `12abc` is text, not a number followed by a word
                        match self.peek() {
                            Some(c) if !is_separator(c) => {
                                let raw = self.take_run(value.to_string());
                                token(TokenKind::Text(raw))
                            }
                            _ => token(TokenKind::Number(value)),
                        }
                    }
                    Err(raw) => Some(Err(LexError::InvalidNumber { line, column, raw })),
                };
            }

            let raw = self.take_run(String::new());
            if raw.is_empty() {
                // a lone separator character
                self.bump();
                continue;
            }
            return token(TokenKind::Text(raw));
        }

        None
    }
}

fn is_separator(ch: char) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, ';' | '(' | ',')
}

/// Consumes a decimal number with optional sign, fraction and exponent.
/// Returns the raw text when it does not form a number.
fn parse_number(lexer: &mut Lexer<'_>) -> Result<f64, String> {
    let mut raw = String::new();
    if let Some(sign @ ('+' | '-')) = lexer.peek() {
        raw.push(sign);
        lexer.bump();
    }

    let mut has_digit = false;
    let mut digits = |lexer: &mut Lexer<'_>, raw: &mut String| {
        while let Some(d) = lexer.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            has_digit = true;
            raw.push(d);
            lexer.bump();
        }
    };

    digits(lexer, &mut raw);
    if let Some('.') = lexer.peek() {
        raw.push('.');
        lexer.bump();
        digits(lexer, &mut raw);
    }

    if matches!(lexer.peek(), Some('e' | 'E'))
        && matches!(lexer.peek_second(), Some(c) if c.is_ascii_digit() || c == '-' || c == '+')
    {
        raw.push('e');
        lexer.bump();
        if let Some(sign @ ('+' | '-')) = lexer.peek() {
            raw.push(sign);
            lexer.bump();
        }
        digits(lexer, &mut raw);
    }

    if !has_digit {
        return Err(raw);
    }
    raw.parse::<f64>().map_err(|_| raw)
}
