//! Lexer for the MathVM source language, built on the logos library.
//!
//! Produces a flat token list up front; the parser indexes into it with
//! arbitrary lookahead. Each token carries the byte offset of its first
//! character so that errors anywhere downstream can be reported as
//! `line,col` pairs.

use logos::Logos;
use thiserror::Error;

use crate::parser::token::Token;

/// Lexical error with the byte position it occurred at.
#[derive(Debug, Clone, Error)]
pub enum LexError {
    /// A character no token can start with.
    #[error("unrecognised character")]
    UnrecognisedCharacter {
        /// Byte offset of the character.
        pos: u32,
    },
    /// A string literal with no closing quote.
    #[error("unterminated string literal")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        pos: u32,
    },
    /// A string literal with an escape other than `\n \r \t \\ \'`.
    #[error("bad escape sequence in string literal")]
    BadEscape {
        /// Byte offset of the opening quote.
        pos: u32,
    },
    /// A numeric literal that does not fit its type.
    #[error("malformed numeric literal")]
    BadNumber {
        /// Byte offset of the first digit.
        pos: u32,
    },
}

impl LexError {
    /// Byte offset the error was detected at.
    pub fn pos(&self) -> u32 {
        match *self {
            LexError::UnrecognisedCharacter { pos }
            | LexError::UnterminatedString { pos }
            | LexError::BadEscape { pos }
            | LexError::BadNumber { pos } => pos,
        }
    }
}

/// Internal logos token set. Converted to [`Token`] after lexing.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
enum RawToken {
    #[token("int")]
    Int,
    #[token("double")]
    Double,
    #[token("string")]
    Str,
    #[token("for")]
    For,
    #[token("while")]
    While,
    #[token("if")]
    If,
    #[token("print")]
    Print,
    #[token("function")]
    Function,
    #[token("native")]
    Native,
    #[token("return")]
    Return,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    IntLiteral(i64),

    // A dot must be followed by a digit so that `1..3` lexes as INT RANGE INT.
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    DoubleLiteral(f64),

    #[regex(r"'(\\.|[^'\\])*'", unescape)]
    StringLiteral(String),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,

    #[token("=")]
    Assign,
    #[token("||")]
    Or,
    #[token("&&")]
    And,
    #[token("|")]
    Aor,
    #[token("&")]
    Aand,
    #[token("^")]
    Axor,
    #[token("!")]
    Not,
    #[token("==")]
    Eq,
    #[token("!=")]
    Neq,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token("..")]
    Range,
    #[token("+")]
    Add,
    #[token("-")]
    Sub,
    #[token("*")]
    Mul,
    #[token("/")]
    Div,
    #[token("%")]
    Mod,
    #[token("+=")]
    IncrSet,
    #[token("-=")]
    DecrSet,
}

/// Resolve `\n \r \t \\ \'` escapes; any other escape fails the token.
fn unescape(lex: &mut logos::Lexer<'_, RawToken>) -> Option<String> {
    let raw = lex.slice();
    let body = &raw[1..raw.len() - 1];
    let mut result = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('\\') => result.push('\\'),
            Some('\'') => result.push('\''),
            _ => return None,
        }
    }
    Some(result)
}

/// Tokenize a full source text into `(token, byte offset)` pairs.
pub fn tokenize(source: &str) -> Result<Vec<(Token, u32)>, LexError> {
    let mut tokens = Vec::new();
    let mut lexer = RawToken::lexer(source);
    while let Some(item) = lexer.next() {
        let pos = lexer.span().start as u32;
        let raw = match item {
            Ok(raw) => raw,
            Err(()) => {
                let slice = lexer.slice();
                return Err(if slice.starts_with('\'') {
                    if slice.len() > 1 && slice.ends_with('\'') {
                        LexError::BadEscape { pos }
                    } else {
                        LexError::UnterminatedString { pos }
                    }
                } else if slice.starts_with(|c: char| c.is_ascii_digit()) {
                    LexError::BadNumber { pos }
                } else {
                    LexError::UnrecognisedCharacter { pos }
                });
            }
        };
        tokens.push((convert(raw), pos));
    }
    Ok(tokens)
}

fn convert(raw: RawToken) -> Token {
    match raw {
        RawToken::Int => Token::Int,
        RawToken::Double => Token::Double,
        RawToken::Str => Token::Str,
        RawToken::For => Token::For,
        RawToken::While => Token::While,
        RawToken::If => Token::If,
        RawToken::Print => Token::Print,
        RawToken::Function => Token::Function,
        RawToken::Native => Token::Native,
        RawToken::Return => Token::Return,
        RawToken::Ident(s) => Token::Ident(s),
        RawToken::IntLiteral(v) => Token::IntLiteral(v),
        RawToken::DoubleLiteral(v) => Token::DoubleLiteral(v),
        RawToken::StringLiteral(s) => Token::StringLiteral(s),
        RawToken::LParen => Token::LParen,
        RawToken::RParen => Token::RParen,
        RawToken::LBrace => Token::LBrace,
        RawToken::RBrace => Token::RBrace,
        RawToken::Comma => Token::Comma,
        RawToken::Semicolon => Token::Semicolon,
        RawToken::Assign => Token::Assign,
        RawToken::Or => Token::Or,
        RawToken::And => Token::And,
        RawToken::Aor => Token::Aor,
        RawToken::Aand => Token::Aand,
        RawToken::Axor => Token::Axor,
        RawToken::Not => Token::Not,
        RawToken::Eq => Token::Eq,
        RawToken::Neq => Token::Neq,
        RawToken::Gt => Token::Gt,
        RawToken::Ge => Token::Ge,
        RawToken::Lt => Token::Lt,
        RawToken::Le => Token::Le,
        RawToken::Range => Token::Range,
        RawToken::Add => Token::Add,
        RawToken::Sub => Token::Sub,
        RawToken::Mul => Token::Mul,
        RawToken::Div => Token::Div,
        RawToken::Mod => Token::Mod,
        RawToken::IncrSet => Token::IncrSet,
        RawToken::DecrSet => Token::DecrSet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_keywords_and_idents() {
        assert_eq!(
            kinds("int x while whilex"),
            vec![
                Token::Int,
                Token::Ident("x".into()),
                Token::While,
                Token::Ident("whilex".into()),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("0 42 1.5 2.5e3 1e9"),
            vec![
                Token::IntLiteral(0),
                Token::IntLiteral(42),
                Token::DoubleLiteral(1.5),
                Token::DoubleLiteral(2.5e3),
                Token::DoubleLiteral(1e9),
            ]
        );
    }

    #[test]
    fn test_range_is_not_a_double() {
        assert_eq!(
            kinds("0..3"),
            vec![Token::IntLiteral(0), Token::Range, Token::IntLiteral(3)]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r"'a\n\t\\\'b'"),
            vec![Token::StringLiteral("a\n\t\\'b".into())]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(
            tokenize("'oops"),
            Err(LexError::UnterminatedString { pos: 0 })
        ));
    }

    #[test]
    fn test_bad_escape() {
        assert!(matches!(tokenize(r"'\q'"), Err(LexError::BadEscape { pos: 0 })));
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            kinds("1 // comment with ' and stuff\n2"),
            vec![Token::IntLiteral(1), Token::IntLiteral(2)]
        );
    }

    #[test]
    fn test_compound_operators() {
        assert_eq!(
            kinds("a += b <= c == d"),
            vec![
                Token::Ident("a".into()),
                Token::IncrSet,
                Token::Ident("b".into()),
                Token::Le,
                Token::Ident("c".into()),
                Token::Eq,
                Token::Ident("d".into()),
            ]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("int  x;").unwrap();
        assert_eq!(tokens[0].1, 0);
        assert_eq!(tokens[1].1, 5);
        assert_eq!(tokens[2].1, 6);
    }
}
