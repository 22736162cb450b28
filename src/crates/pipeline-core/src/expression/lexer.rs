//! Hand-written tokenizer for the condition sandbox.
//!
//! Every byte the scanner accepts belongs to the whitelist in the condition
//! engine's doc comment: digits, `.`, whitespace, `+`/`-`, the comparators
//! `=`, `!`, `>`, `<`, the logical operators `&`, `|`, parens, and the two
//! literal keywords `true`/`false`. Anything else -- a letter outside those
//! two keywords, a quote, a bracket, a bitwise operator used alone -- is a
//! lex error, which the caller turns into `false` per the condition
//! engine's "reject, don't guess" contract.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Num(f64),
    True,
    False,
    EqEqEq,
    NotEqEq,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
    Minus,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError(pub String);

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '+' => {
                return Err(LexError(
                    "binary '+' is not part of the condition grammar".to_string(),
                ));
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') {
                    tokens.push(Token::EqEqEq);
                    i += 3;
                } else {
                    return Err(LexError("expected '===' ".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') && chars.get(i + 2) == Some(&'=') {
                    tokens.push(Token::NotEqEq);
                    i += 3;
                } else {
                    return Err(LexError("expected '!==' ".to_string()));
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(LexError("bitwise '&' is rejected".to_string()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(LexError("bitwise '|' is rejected".to_string()));
                }
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| LexError(format!("invalid number literal '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    other => {
                        return Err(LexError(format!(
                            "identifier '{other}' is not permitted in a condition"
                        )))
                    }
                }
            }
            other => {
                return Err(LexError(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_identifiers() {
        assert!(tokenize("process.exit(1)").is_err());
        assert!(tokenize("require('fs')").is_err());
        assert!(tokenize("__proto__").is_err());
    }

    #[test]
    fn rejects_quotes_and_binary_plus() {
        assert!(tokenize("'x'").is_err());
        assert!(tokenize("5 + 3").is_err());
    }

    #[test]
    fn accepts_valid_forms() {
        assert!(tokenize("5 > 3").is_ok());
        assert!(tokenize("(true && false) || true").is_ok());
        assert!(tokenize("-5 === -5").is_ok());
        assert!(tokenize("3.14 > 3").is_ok());
    }
}
