//! Tokenizer for the FHIRPath subset.

/// Lexical token of a path expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Integer literal (e.g. `0`, `42`)
    Integer(i64),
    /// Decimal literal (e.g. `3.5`)
    Decimal(f64),
    /// Single-quoted string literal with escapes resolved
    String(String),
    /// `true` / `false`
    Boolean(bool),
    /// Plain or backtick-delimited identifier
    Identifier(String),
    /// `$this` and friends, without the dollar sign
    Variable(String),
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `~` or `==`, treated as equality
    Equivalent,
    /// `and`
    And,
    /// `or`
    Or,
    /// `|`
    Union,
    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Eof,
}

/// Splits `input` into tokens, always ending with [`Token::Eof`].
pub fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        match c {
            c if c.is_whitespace() => pos += 1,
            '.' => {
                tokens.push(Token::Dot);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::LeftParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::LeftBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RightBracket);
                pos += 1;
            }
            '|' => {
                tokens.push(Token::Union);
                pos += 1;
            }
            '~' => {
                tokens.push(Token::Equivalent);
                pos += 1;
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Equivalent);
                    pos += 2;
                } else {
                    tokens.push(Token::Equal);
                    pos += 1;
                }
            }
            '!' if chars.get(pos + 1) == Some(&'=') => {
                tokens.push(Token::NotEqual);
                pos += 2;
            }
            '\'' => {
                let (text, next) = read_quoted(&chars, pos, '\'')?;
                tokens.push(Token::String(text));
                pos = next;
            }
            '`' => {
                let (text, next) = read_quoted(&chars, pos, '`')?;
                tokens.push(Token::Identifier(text));
                pos = next;
            }
            '$' => {
                let start = pos + 1;
                let end = scan_identifier(&chars, start);
                if end == start {
                    return Err(format!("expected variable name at offset {pos}"));
                }
                tokens.push(Token::Variable(chars[start..end].iter().collect()));
                pos = end;
            }
            c if c.is_ascii_digit() => {
                let (token, next) = read_number(&chars, pos)?;
                tokens.push(token);
                pos = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = scan_identifier(&chars, pos);
                let word: String = chars[pos..end].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "true" => Token::Boolean(true),
                    "false" => Token::Boolean(false),
                    _ => Token::Identifier(word),
                });
                pos = end;
            }
            other => return Err(format!("unexpected character `{other}` at offset {pos}")),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn scan_identifier(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
        end += 1;
    }
    end
}

fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize), String> {
    let mut text = String::new();
    let mut pos = start + 1;
    while pos < chars.len() {
        match chars[pos] {
            '\\' if pos + 1 < chars.len() => {
                let escaped = chars[pos + 1];
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                pos += 2;
            }
            c if c == quote => return Ok((text, pos + 1)),
            c => {
                text.push(c);
                pos += 1;
            }
        }
    }
    Err(format!("unterminated literal starting at offset {start}"))
}

fn read_number(chars: &[char], start: usize) -> Result<(Token, usize), String> {
    let mut end = start;
    while end < chars.len() && chars[end].is_ascii_digit() {
        end += 1;
    }
    let is_decimal = end + 1 < chars.len() && chars[end] == '.' && chars[end + 1].is_ascii_digit();
    if is_decimal {
        end += 1;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }
        let text: String = chars[start..end].iter().collect();
        let value = text
            .parse::<f64>()
            .map_err(|e| format!("bad decimal `{text}`: {e}"))?;
        Ok((Token::Decimal(value), end))
    } else {
        let text: String = chars[start..end].iter().collect();
        let value = text
            .parse::<i64>()
            .map_err(|e| format!("bad integer `{text}`: {e}"))?;
        Ok((Token::Integer(value), end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_clause_tokens() {
        let tokens =
            tokenize("code.coding.where(code.toString().contains('8480-6'))").expect("tokens");
        assert_eq!(tokens[0], Token::Identifier("code".into()));
        assert!(tokens.contains(&Token::String("8480-6".into())));
        assert_eq!(tokens.last(), Some(&Token::Eof));
    }

    #[test]
    fn numbers_and_member_access_are_distinguished() {
        let tokens = tokenize("component[1].value = 1.5").expect("tokens");
        assert!(tokens.contains(&Token::Integer(1)));
        assert!(tokens.contains(&Token::Decimal(1.5)));
        assert!(tokens.contains(&Token::Dot));
    }

    #[test]
    fn double_equals_is_equivalence() {
        let tokens = tokenize("a == 'x' and $this != b").expect("tokens");
        assert!(tokens.contains(&Token::Equivalent));
        assert!(tokens.contains(&Token::And));
        assert!(tokens.contains(&Token::Variable("this".into())));
        assert!(tokens.contains(&Token::NotEqual));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("code.where(text = 'abc)").expect_err("unterminated");
        assert!(err.contains("unterminated"));
    }
}
