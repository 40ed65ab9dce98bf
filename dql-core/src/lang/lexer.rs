/// Tokenizer for DQL statement text
///
/// Keywords are not distinguished here: every bare word is an `Ident` and the
/// parser matches keywords case-insensitively, so attribute names that happen
/// to be keywords still tokenize as ordinary identifiers.

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// Backtick-quoted identifier, never treated as a keyword
    QuotedIdent(String),
    Number(String),
    Str(String),
    Binary(Vec<u8>),
    /// `#name`, only in condition mode
    NamePlaceholder(String),
    /// `:name`, only in condition mode
    ValuePlaceholder(String),

    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Semicolon,
    Dot,
    Colon,
    Star,
    Plus,
    Minus,
    Percent,

    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    Eof,
}

impl TokenKind {
    /// Short description used in syntax errors
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) | TokenKind::QuotedIdent(s) => format!("'{}'", s),
            TokenKind::Number(n) => n.clone(),
            TokenKind::Str(s) => format!("\"{}\"", s),
            TokenKind::Binary(_) => "binary literal".to_string(),
            TokenKind::NamePlaceholder(p) | TokenKind::ValuePlaceholder(p) => p.clone(),
            TokenKind::LeftParen => "'('".to_string(),
            TokenKind::RightParen => "')'".to_string(),
            TokenKind::LeftBracket => "'['".to_string(),
            TokenKind::RightBracket => "']'".to_string(),
            TokenKind::LeftBrace => "'{'".to_string(),
            TokenKind::RightBrace => "'}'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Semicolon => "';'".to_string(),
            TokenKind::Dot => "'.'".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Percent => "'%'".to_string(),
            TokenKind::Equal => "'='".to_string(),
            TokenKind::NotEqual => "'<>'".to_string(),
            TokenKind::LessThan => "'<'".to_string(),
            TokenKind::LessThanOrEqual => "'<='".to_string(),
            TokenKind::GreaterThan => "'>'".to_string(),
            TokenKind::GreaterThanOrEqual => "'>='".to_string(),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

/// A token and the character offset it starts at
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: usize,
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    placeholders: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            placeholders: false,
        }
    }

    /// Recognise `#name` / `:name` placeholders, as found in store-native
    /// condition and update expressions.
    pub fn with_placeholders(mut self) -> Self {
        self.placeholders = true;
        self
    }

    /// Tokenizes the whole input, ending with an `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current() {
                Some(ch) if ch.is_whitespace() => self.advance(),
                Some('-') if self.peek(1) == Some('-') => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn is_ident_start(ch: char) -> bool {
        ch.is_alphabetic() || ch == '_'
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(ch) = self.current() {
            let continues = ch.is_alphanumeric()
                || ch == '_'
                || (ch == '-' && self.peek(1).is_some_and(|n| n.is_alphanumeric() || n == '_'));
            if continues {
                self.advance();
            } else {
                break;
            }
        }
        self.input[start..self.pos].iter().collect()
    }

    fn read_digits(&mut self, out: &mut String) {
        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                out.push(ch);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> String {
        let mut text = String::new();
        self.read_digits(&mut text);
        if self.current() == Some('.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            self.read_digits(&mut text);
        }
        if matches!(self.current(), Some('e') | Some('E')) {
            let sign = matches!(self.peek(1), Some('+') | Some('-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                text.push('e');
                self.advance();
                if sign {
                    if let Some(s) = self.current() {
                        text.push(s);
                    }
                    self.advance();
                }
                self.read_digits(&mut text);
            }
        }
        text
    }

    /// Reads a quoted literal body. `pos` is the offset of the opening quote.
    /// Binary bodies accept only ASCII characters outside escapes.
    fn read_quoted(&mut self, quote: char, start: usize, binary: bool) -> Result<Vec<char>> {
        self.advance();
        let mut out = Vec::new();
        loop {
            match self.current() {
                None => return Err(Error::syntax(start, "unterminated string literal")),
                Some(ch) if ch == quote => {
                    self.advance();
                    return Ok(out);
                }
                Some('\\') => {
                    self.advance();
                    let escaped = match self.current() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('x') => {
                            let hex: String = [self.peek(1), self.peek(2)]
                                .iter()
                                .flatten()
                                .collect();
                            let byte = u8::from_str_radix(&hex, 16).map_err(|_| {
                                Error::syntax(self.pos, "invalid \\x escape")
                            })?;
                            self.advance();
                            self.advance();
                            byte as char
                        }
                        Some(other) => other,
                        None => return Err(Error::syntax(start, "unterminated string literal")),
                    };
                    out.push(escaped);
                    self.advance();
                }
                Some(ch) if binary && !ch.is_ascii() => {
                    return Err(Error::syntax(self.pos, "binary literal must be ASCII or \\x escapes"));
                }
                Some(ch) => {
                    out.push(ch);
                    self.advance();
                }
            }
        }
    }

    /// Number token, rejecting literals outside the finite range.
    fn number(text: String, pos: usize) -> Result<Token> {
        if !text.parse::<f64>().is_ok_and(f64::is_finite) {
            return Err(Error::syntax(pos, format!("number '{}' is out of range", text)));
        }
        Ok(Token { kind: TokenKind::Number(text), pos })
    }

    fn single(&mut self, kind: TokenKind, pos: usize) -> Result<Token> {
        self.advance();
        Ok(Token { kind, pos })
    }

    fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace_and_comments();
        let pos = self.pos;

        let ch = match self.current() {
            None => return Ok(Token { kind: TokenKind::Eof, pos }),
            Some(ch) => ch,
        };

        match ch {
            '(' => self.single(TokenKind::LeftParen, pos),
            ')' => self.single(TokenKind::RightParen, pos),
            '[' => self.single(TokenKind::LeftBracket, pos),
            ']' => self.single(TokenKind::RightBracket, pos),
            '{' => self.single(TokenKind::LeftBrace, pos),
            '}' => self.single(TokenKind::RightBrace, pos),
            ',' => self.single(TokenKind::Comma, pos),
            ';' => self.single(TokenKind::Semicolon, pos),
            '*' => self.single(TokenKind::Star, pos),
            '+' => self.single(TokenKind::Plus, pos),
            '-' => self.single(TokenKind::Minus, pos),
            '%' => self.single(TokenKind::Percent, pos),
            '.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => {
                self.advance();
                let mut text = String::from("0.");
                self.read_digits(&mut text);
                Self::number(text, pos)
            }
            '.' => self.single(TokenKind::Dot, pos),
            '=' => {
                self.advance();
                if self.current() == Some('=') {
                    self.advance();
                }
                Ok(Token { kind: TokenKind::Equal, pos })
            }
            '!' if self.peek(1) == Some('=') => {
                self.advance();
                self.single(TokenKind::NotEqual, pos)
            }
            '<' => {
                self.advance();
                match self.current() {
                    Some('>') => self.single(TokenKind::NotEqual, pos),
                    Some('=') => self.single(TokenKind::LessThanOrEqual, pos),
                    _ => Ok(Token { kind: TokenKind::LessThan, pos }),
                }
            }
            '>' => {
                self.advance();
                match self.current() {
                    Some('=') => self.single(TokenKind::GreaterThanOrEqual, pos),
                    _ => Ok(Token { kind: TokenKind::GreaterThan, pos }),
                }
            }
            '#' if self.placeholders => {
                self.advance();
                let name = self.read_identifier();
                if name.is_empty() {
                    return Err(Error::syntax(pos, "empty name placeholder"));
                }
                Ok(Token { kind: TokenKind::NamePlaceholder(format!("#{}", name)), pos })
            }
            ':' if self.placeholders && self.peek(1).is_some_and(Self::is_ident_start) => {
                self.advance();
                let name = self.read_identifier();
                Ok(Token { kind: TokenKind::ValuePlaceholder(format!(":{}", name)), pos })
            }
            ':' => self.single(TokenKind::Colon, pos),
            '\'' | '"' => {
                let body = self.read_quoted(ch, pos, false)?;
                Ok(Token { kind: TokenKind::Str(body.into_iter().collect()), pos })
            }
            '`' => {
                let body = self.read_quoted('`', pos, false)?;
                Ok(Token { kind: TokenKind::QuotedIdent(body.into_iter().collect()), pos })
            }
            'b' | 'B' if matches!(self.peek(1), Some('\'') | Some('"')) => {
                self.advance();
                let quote = self.current().unwrap_or('"');
                let body = self.read_quoted(quote, pos, true)?;
                // Escapes yield at most 0xff and raw characters are ASCII
                let bytes: Vec<u8> = body.into_iter().map(|c| c as u32 as u8).collect();
                Ok(Token { kind: TokenKind::Binary(bytes), pos })
            }
            c if c.is_ascii_digit() => {
                let text = self.read_number();
                Self::number(text, pos)
            }
            c if Self::is_ident_start(c) => {
                let ident = self.read_identifier();
                Ok(Token { kind: TokenKind::Ident(ident), pos })
            }
            other => Err(Error::syntax(pos, format!("unexpected character '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators_and_literals() {
        assert_eq!(
            kinds("a != 1.5 AND b <> 'x'"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::NotEqual,
                TokenKind::Number("1.5".into()),
                TokenKind::Ident("AND".into()),
                TokenKind::Ident("b".into()),
                TokenKind::NotEqual,
                TokenKind::Str("x".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_hyphenated_identifier() {
        assert_eq!(
            kinds("USING bar-index"),
            vec![
                TokenKind::Ident("USING".into()),
                TokenKind::Ident("bar-index".into()),
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            kinds("a - 1"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Minus,
                TokenKind::Number("1".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("SCAN t -- everything\n;"),
            vec![
                TokenKind::Ident("SCAN".into()),
                TokenKind::Ident("t".into()),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_binary_and_escapes() {
        assert_eq!(
            kinds(r#"b"h\x01" "a\"b""#),
            vec![
                TokenKind::Binary(vec![b'h', 1]),
                TokenKind::Str("a\"b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_exponent_numbers() {
        assert_eq!(
            kinds("1e3 2.5E-2"),
            vec![
                TokenKind::Number("1e3".into()),
                TokenKind::Number("2.5e-2".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_out_of_range_numbers() {
        let err = Lexer::new("a = 1e999999").tokenize().unwrap_err();
        match err {
            Error::Syntax { position, message } => {
                assert_eq!(position, 4);
                assert!(message.contains("out of range"));
            }
            other => panic!("Expected syntax error, got {:?}", other),
        }
        assert!(Lexer::new("a = 1e308").tokenize().is_ok());
        assert!(Lexer::new("a = 1e-999999").tokenize().is_ok());
    }

    #[test]
    fn test_binary_literals_reject_non_ascii() {
        assert_eq!(
            kinds("b'\\xe9a'"),
            vec![TokenKind::Binary(vec![0xe9, b'a']), TokenKind::Eof]
        );
        let err = Lexer::new("b'caf\u{e9}'").tokenize().unwrap_err();
        assert!(matches!(err, Error::Syntax { position: 5, .. }));
    }

    #[test]
    fn test_placeholders_only_in_condition_mode() {
        let tokens: Vec<TokenKind> = Lexer::new("#n0 = :v0")
            .with_placeholders()
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            tokens,
            vec![
                TokenKind::NamePlaceholder("#n0".into()),
                TokenKind::Equal,
                TokenKind::ValuePlaceholder(":v0".into()),
                TokenKind::Eof,
            ]
        );

        let err = Lexer::new("#n0 = 1").tokenize().unwrap_err();
        assert!(matches!(err, Error::Syntax { position: 0, .. }));
    }

    #[test]
    fn test_unterminated_string_reports_start() {
        let err = Lexer::new("a = 'abc").tokenize().unwrap_err();
        match err {
            Error::Syntax { position, .. } => assert_eq!(position, 4),
            other => panic!("Expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_map_colon_outside_condition_mode() {
        assert_eq!(
            kinds("{\"a\":true}"),
            vec![
                TokenKind::LeftBrace,
                TokenKind::Str("a".into()),
                TokenKind::Colon,
                TokenKind::Ident("true".into()),
                TokenKind::RightBrace,
                TokenKind::Eof,
            ]
        );
    }
}
