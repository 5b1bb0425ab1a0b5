//! Compact renderings for inline snapshots.

use crate::{TokenKind, lex, parse};

/// One token per line as `line:column kind value`.
pub fn render_tokens(input: &str) -> String {
    let mut out = Vec::new();
    for token in lex(input) {
        let token = match token {
            Ok(token) => token,
            Err(err) => {
                out.push(format!("lex error: {err}"));
                break;
            }
        };
        let kind = match token.kind {
            TokenKind::Word { letter, value } => format!("word {letter}{value}"),
            TokenKind::Number(value) => format!("number {value}"),
            TokenKind::Text(text) => format!("text {text}"),
            TokenKind::Comment(text) => format!("comment {text}"),
            TokenKind::Newline => "newline".to_string(),
        };
        out.push(format!("{}:{} {kind}", token.line, token.column));
    }
    out.join("\n")
}

/// One statement per line as `line command words text=[..] comment=..`.
pub fn render_statements(input: &str) -> String {
    let statements = match parse(input) {
        Ok(statements) => statements,
        Err(err) => return format!("parse error: {err}"),
    };

    statements
        .iter()
        .map(|s| {
            let mut line = s.line.to_string();
            if let Some(command) = s.command {
                line.push_str(&format!(" {command}"));
            }
            for word in &s.words {
                line.push_str(&format!(" {}{}", word.letter, word.value));
            }
            if !s.text.is_empty() {
                line.push_str(&format!(" text=[{}]", s.text.join(",")));
            }
            if let Some(comment) = &s.comment {
                line.push_str(&format!(" comment={comment}"));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
