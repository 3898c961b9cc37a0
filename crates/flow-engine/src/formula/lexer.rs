//! Tokenizer for logic formulas

use crate::error::FormulaError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(f64),
    Str(String),
    True,
    False,
    /// `{{name}}` or `{{namespace.field}}`, braces stripped and trimmed
    Variable(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the source
    pub offset: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        let kind = match c {
            b'+' => {
                pos += 1;
                TokenKind::Plus
            }
            b'-' => {
                pos += 1;
                TokenKind::Minus
            }
            b'*' => {
                pos += 1;
                TokenKind::Star
            }
            b'/' => {
                pos += 1;
                TokenKind::Slash
            }
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b'{' if bytes.get(pos + 1) == Some(&b'{') => {
                let (name, end) = read_variable(source, pos)?;
                pos = end;
                TokenKind::Variable(name)
            }
            b'"' | b'\'' => {
                let (text, end) = read_string(source, pos, c)?;
                pos = end;
                TokenKind::Str(text)
            }
            b'0'..=b'9' | b'.' => {
                let (value, end) = read_number(source, pos)?;
                pos = end;
                TokenKind::Number(value)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let end = source[pos..]
                    .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                    .map_or(source.len(), |n| pos + n);
                let word = &source[pos..end];
                pos = end;
                match word {
                    "true" => TokenKind::True,
                    "false" => TokenKind::False,
                    _ => TokenKind::Ident(word.to_string()),
                }
            }
            _ => {
                let ch = source[pos..].chars().next().unwrap_or('?');
                return Err(FormulaError::malformed(
                    pos,
                    format!("unexpected character '{}'", ch),
                ));
            }
        };
        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    Ok(tokens)
}

fn read_variable(source: &str, start: usize) -> Result<(String, usize), FormulaError> {
    let body_start = start + 2;
    let close = source[body_start..]
        .find("}}")
        .ok_or_else(|| FormulaError::malformed(start, "unterminated '{{'"))?;
    let name = source[body_start..body_start + close].trim();
    if name.is_empty() {
        return Err(FormulaError::malformed(start, "empty variable reference"));
    }
    if name.split('.').any(|segment| segment.trim().is_empty()) {
        return Err(FormulaError::malformed(
            start,
            format!("invalid variable reference '{}'", name),
        ));
    }
    Ok((name.to_string(), body_start + close + 2))
}

fn read_string(source: &str, start: usize, quote: u8) -> Result<(String, usize), FormulaError> {
    let mut text = String::new();
    let mut chars = source[start + 1..].char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some((_, escaped)) => text.push(escaped),
                None => break,
            },
            c if c as u32 == quote as u32 => return Ok((text, start + 1 + i + 1)),
            c => text.push(c),
        }
    }
    Err(FormulaError::malformed(start, "unterminated string literal"))
}

fn read_number(source: &str, start: usize) -> Result<(f64, usize), FormulaError> {
    let end = source[start..]
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .map_or(source.len(), |n| start + n);
    let text = &source[start..end];
    text.parse::<f64>()
        .map(|value| (value, end))
        .map_err(|_| FormulaError::malformed(start, format!("invalid number '{}'", text)))
}
