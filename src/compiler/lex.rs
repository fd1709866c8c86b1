use std::rc::Rc;

use crate::common::source::Source;
use crate::common::span::{Span, Spanned};
use crate::compiler::syntax::{ErrorKind, Note, Syntax};
use crate::construct::token::Token;

/// Characters that may follow the `$` of a symbolic name.
const NAME_CHARS: &str = "_.+-*/\\^~=<>!?@#$%&|:'`";

/// Characters that end a reserved-word run.
const DELIMITERS: &str = "()\";";

pub type Tokens = Vec<Spanned<Token>>;

/// The lexer reads a source file into a stream of spanned tokens,
/// with whitespace and comments stripped.
#[derive(Debug)]
pub struct Lexer {
    source: Rc<Source>,
    index: usize,
    tokens: Tokens,
}

impl Lexer {
    /// Lexes a source file into a stream of tokens.
    pub fn lex(source: Rc<Source>) -> Result<Tokens, Syntax> {
        let mut lexer = Lexer {
            source,
            index: 0,
            tokens: vec![],
        };

        // prime the lexer
        lexer.strip()?;

        while lexer.index < lexer.source.contents.len() {
            let token = lexer.next_token()?;
            lexer.tokens.push(token);
            lexer.strip()?;
        }

        log::debug!("lexed {} tokens", lexer.tokens.len());
        Ok(lexer.tokens)
    }

    /// Lexes a single token, for compiling trees of raw strings.
    /// The resulting token carries no position metadata.
    pub fn lex_one(word: &str) -> Result<Token, Syntax> {
        let mut tokens = Lexer::lex(Source::source(word))?;
        match (tokens.len(), tokens.pop()) {
            (1, Some(token)) => Ok(token.item),
            _ => Err(Syntax::lex(
                &format!("Expected `{}` to lex as exactly one token", word),
                &Span::empty(),
            )),
        }
    }

    fn remaining(&self) -> &str {
        &self.source.contents[self.index..]
    }

    /// Strips whitespace, `;; …` line comments, and (nestable)
    /// `(; … ;)` block comments.
    fn strip(&mut self) -> Result<(), Syntax> {
        loop {
            let old_index = self.index;
            let remaining = self.remaining();

            if let Some(c) = remaining.chars().next() {
                if c.is_whitespace() {
                    self.index += c.len_utf8();
                    continue;
                }
            }

            if remaining.starts_with(";;") {
                let line = remaining.find('\n').unwrap_or(remaining.len());
                self.index += line;
                continue;
            }

            if remaining.starts_with("(;") {
                self.block_comment()?;
                continue;
            }

            if old_index == self.index {
                break;
            }
        }

        Ok(())
    }

    /// Eats one `(; … ;)` comment, tracking nesting depth.
    fn block_comment(&mut self) -> Result<(), Syntax> {
        let open = self.index;
        let mut depth = 0usize;

        while self.index < self.source.contents.len() {
            let remaining = self.remaining();
            if remaining.starts_with("(;") {
                depth += 1;
                self.index += 2;
            } else if remaining.starts_with(";)") {
                depth -= 1;
                self.index += 2;
                if depth == 0 {
                    return Ok(());
                }
            } else {
                self.index += remaining.chars().next().unwrap().len_utf8();
            }
        }

        Err(Syntax::lex(
            "Unexpected end of source while reading block comment",
            &Span::new(&self.source, open, 2),
        ))
    }

    /// Reads the next token. Expects whitespace and comments to have
    /// been stripped.
    fn next_token(&mut self) -> Result<Spanned<Token>, Syntax> {
        let start = self.index;
        let mut chars = self.remaining().chars();

        let token = match chars.next().unwrap() {
            '(' => {
                self.index += 1;
                Token::Open
            }
            ')' => {
                self.index += 1;
                Token::Close
            }
            '"' => self.string()?,
            '$' => self.name()?,
            _ => self.word()?,
        };

        Ok(Spanned::new(
            token,
            Span::new(&self.source, start, self.index - start),
        ))
    }

    /// Reads a text literal. Escapes are resolved here, so the token
    /// carries bytes, not source characters.
    fn string(&mut self) -> Result<Token, Syntax> {
        let open = self.index;
        self.index += 1;
        let mut bytes = vec![];

        let mut chars = self.remaining().char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.index += offset + 1;
                    return Ok(Token::Str(bytes));
                }
                '\\' => {
                    let escape_at = self.index + offset;
                    match chars.next() {
                        Some((_, 'n')) => bytes.push(b'\n'),
                        Some((_, 't')) => bytes.push(b'\t'),
                        Some((_, '"')) => bytes.push(b'"'),
                        Some((_, '\\')) => bytes.push(b'\\'),
                        Some((_, high)) if high.is_ascii_hexdigit() => match chars.next() {
                            Some((_, low)) if low.is_ascii_hexdigit() => {
                                let high = high.to_digit(16).unwrap() as u8;
                                let low = low.to_digit(16).unwrap() as u8;
                                bytes.push(high << 4 | low);
                            }
                            _ => {
                                return Err(Syntax::lex(
                                    "Expected two hex digits in byte escape",
                                    &Span::new(&self.source, escape_at, 2),
                                ))
                            }
                        },
                        Some((_, unknown)) => {
                            return Err(Syntax::error_with_note(
                                ErrorKind::Lex,
                                &format!("Unknown escape `\\{}` in text literal", unknown),
                                Note::new_with_hint(
                                    "recognized escapes are \\n, \\t, \\\", \\\\, and \\hh",
                                    &Span::new(&self.source, escape_at, 2),
                                ),
                            ))
                        }
                        None => break,
                    }
                }
                c => {
                    let mut buffer = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buffer).as_bytes());
                }
            }
        }

        Err(Syntax::lex(
            "Unexpected end of source while reading text literal",
            &Span::new(&self.source, open, 1),
        ))
    }

    /// Reads a `$`-prefixed symbolic name.
    fn name(&mut self) -> Result<Token, Syntax> {
        let start = self.index;
        self.index += 1;

        let length = self
            .remaining()
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || NAME_CHARS.contains(*c))
            .map(char::len_utf8)
            .sum::<usize>();

        if length == 0 {
            return Err(Syntax::lex(
                "Expected at least one character after `$`",
                &Span::new(&self.source, start, 1),
            ));
        }

        let name = self.remaining()[..length].to_string();
        self.index += length;
        Ok(Token::Name(name))
    }

    /// Reads a reserved-word run and classifies it: keyword, value
    /// type, or opcode mnemonic by lookup; numeric literal otherwise.
    fn word(&mut self) -> Result<Token, Syntax> {
        let start = self.index;
        let length = self
            .remaining()
            .chars()
            .take_while(|c| !c.is_whitespace() && !DELIMITERS.contains(*c))
            .map(char::len_utf8)
            .sum::<usize>();
        let span = Span::new(&self.source, start, length.max(1));

        if length == 0 {
            return Err(Syntax::lex(
                &format!(
                    "The character `{}` is not recognized here",
                    self.remaining().chars().next().unwrap(),
                ),
                &span,
            ));
        }

        let word = &self.source.contents[start..start + length];
        let token = match Token::reserved(word) {
            Some(token) => Ok(token),
            None => Lexer::numeric(word, &span),
        };
        self.index += length;
        token
    }

    fn numeric(word: &str, span: &Span) -> Result<Token, Syntax> {
        let (negative, digits) = match word.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, word.strip_prefix('+').unwrap_or(word)),
        };

        if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            let signed = if negative {
                format!("-{}", hex)
            } else {
                hex.to_string()
            };
            return i64::from_str_radix(&signed, 16).map(Token::Integer).map_err(|_| {
                Syntax::lex(
                    &format!("`{}` is not a valid hexadecimal literal", word),
                    span,
                )
            });
        }

        if let Ok(integer) = word.parse::<i64>() {
            return Ok(Token::Integer(integer));
        }
        if let Ok(float) = word.parse::<f64>() {
            return Ok(Token::Float(float));
        }

        Err(Syntax::lex(&format!("Unrecognized token `{}`", word), span))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::common::opcode;
    use crate::construct::token::Keyword;

    fn items(source: &str) -> Vec<Token> {
        Lexer::lex(Source::source(source))
            .unwrap()
            .into_iter()
            .map(|token| token.item)
            .collect()
    }

    #[test]
    fn lex_empty() {
        // no source code? no tokens!
        assert_eq!(Lexer::lex(Source::source("")), Ok(vec![]));
    }

    #[test]
    fn lex_a_little_module() {
        assert_eq!(
            items("(module (func nop))"),
            vec![
                Token::Open,
                Token::Keyword(Keyword::Module),
                Token::Open,
                Token::Keyword(Keyword::Func),
                Token::Op(opcode::lookup("nop").unwrap()),
                Token::Close,
                Token::Close,
            ]
        );
    }

    #[test]
    fn spans_track_offsets() {
        let source = Source::source("(module\n  (func nop))");
        let tokens = Lexer::lex(source).unwrap();

        // the `nop`, on line two
        assert_eq!(tokens[4].span.offset(), 16);
        assert_eq!(tokens[4].span.line_col(), Some((2, 9)));
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(
            items(";; header\n(module (; inner (; nested ;) comment ;) )"),
            vec![Token::Open, Token::Keyword(Keyword::Module), Token::Close]
        );
    }

    #[test]
    fn unterminated_block_comment() {
        assert!(Lexer::lex(Source::source("(; never closed")).is_err());
    }

    #[test]
    fn numbers() {
        assert_eq!(
            items("0 -7 +7 0x2a -0x2a 1.5 -2.5e2"),
            vec![
                Token::Integer(0),
                Token::Integer(-7),
                Token::Integer(7),
                Token::Integer(42),
                Token::Integer(-42),
                Token::Float(1.5),
                Token::Float(-250.0),
            ]
        );
    }

    #[test]
    fn strings_resolve_escapes() {
        assert_eq!(
            items(r#""hi\n\t\"\\\2a""#),
            vec![Token::Str(vec![
                b'h', b'i', b'\n', b'\t', b'"', b'\\', 0x2a
            ])]
        );
    }

    #[test]
    fn unknown_escape() {
        assert!(Lexer::lex(Source::source(r#""\q""#)).is_err());
    }

    #[test]
    fn unterminated_string() {
        assert!(Lexer::lex(Source::source("\"left open")).is_err());
    }

    #[test]
    fn names() {
        assert_eq!(
            items("$a $add-two $x.y"),
            vec![
                Token::Name("a".to_string()),
                Token::Name("add-two".to_string()),
                Token::Name("x.y".to_string()),
            ]
        );
        assert!(Lexer::lex(Source::source("$ ")).is_err());
    }

    #[test]
    fn unrecognized_word() {
        let result = Lexer::lex(Source::source("(module nip)"));
        assert!(result.is_err());
    }

    #[test]
    fn lex_one_token() {
        assert_eq!(Lexer::lex_one("i32.add"), Ok(Token::Op(opcode::lookup("i32.add").unwrap())));
        assert_eq!(Lexer::lex_one("("), Ok(Token::Open));
        assert!(Lexer::lex_one("1 2").is_err());
    }

    proptest! {
        #[test]
        fn doesnt_crash(s in "\\PC*") {
            let _ = Lexer::lex(Source::source(&s));
        }

        #[test]
        fn integers(n: i64) {
            let result = items(&n.to_string());
            prop_assert_eq!(result, vec![Token::Integer(n)]);
        }

        #[test]
        fn keywords_roundtrip(keyword: Keyword) {
            let result = items(keyword.name());
            prop_assert_eq!(result, vec![Token::Keyword(keyword)]);
        }
    }
}
