//! Tokenizer for rule definitions.

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Eq,
    NotEq,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character of the token
    pub pos: usize,
}

impl Token {
    /// Returns true if this token is the given keyword (case-insensitive).
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(name) if name.eq_ignore_ascii_case(keyword))
    }
}

/// Splits a rule definition into tokens, ending with `TokenKind::End`.
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let kind = match c {
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '=' => {
                chars.next();
                TokenKind::Eq
            }
            '!' | '<' => {
                chars.next();
                let expected = if c == '!' { '=' } else { '>' };
                match chars.next() {
                    Some((_, next)) if next == expected => TokenKind::NotEq,
                    _ => return Err(ParseError::new(format!("unexpected '{}'", c), pos)),
                }
            }
            '"' => {
                chars.next();
                TokenKind::Str(read_string(&mut chars, pos)?)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(ident)
            }
            other => {
                return Err(ParseError::new(
                    format!("unexpected character '{}'", other),
                    pos,
                ))
            }
        };
        tokens.push(Token { kind, pos });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        pos: input.len(),
    });
    Ok(tokens)
}

/// Reads the body of a double-quoted string literal, consuming the closing quote.
///
/// `\"` and `\\` are unescaped; any other backslash sequence is kept as-is so
/// that LIKE escapes such as `\%` reach the pattern compiler untouched.
fn read_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    start: usize,
) -> Result<String, ParseError> {
    let mut value = String::new();
    loop {
        match chars.next() {
            Some((_, '"')) => return Ok(value),
            Some((_, '\\')) => match chars.next() {
                Some((_, '"')) => value.push('"'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => break,
            },
            Some((_, c)) => value.push(c),
            None => break,
        }
    }
    Err(ParseError::new("unterminated string literal", start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_comparison() {
        assert_eq!(
            kinds(r#"test = "a.b""#),
            vec![
                TokenKind::Ident("test".to_string()),
                TokenKind::Eq,
                TokenKind::Str("a.b".to_string()),
                TokenKind::End,
            ]
        );
    }

    #[test]
    fn test_tokenize_not_equal_forms() {
        assert_eq!(kinds("!= <>")[..2], [TokenKind::NotEq, TokenKind::NotEq]);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""say \"hi\" \\ 50\%""#)[0],
            TokenKind::Str(r#"say "hi" \ 50\%"#.to_string())
        );
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize(r#"test = "abc"#).unwrap_err();
        assert_eq!(err.position, 7);
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("test ~ \"x\"").unwrap_err();
        assert_eq!(err.position, 5);
    }
}
