use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum LexerError {
    #[error("invalid literal at byte {0}: {1}")]
    InvalidLiteral(usize, String),
    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Select,
    Insert,
    Into,
    Values,
    Delete,
    Explain,
    From,
    Where,
    Group,
    Order,
    By,
    Asc,
    Desc,
    Fill,
    Limit,
    Offset,
    As,
    And,
    Or,
    Not,
    True,
    False,
    Null,
    Time,
    Tag,
}

fn keyword_from_str(s: &str) -> Option<Keyword> {
    Some(match s.to_ascii_lowercase().as_str() {
        "select" => Keyword::Select,
        "insert" => Keyword::Insert,
        "into" => Keyword::Into,
        "values" => Keyword::Values,
        "delete" => Keyword::Delete,
        "explain" => Keyword::Explain,
        "from" => Keyword::From,
        "where" => Keyword::Where,
        "group" => Keyword::Group,
        "order" => Keyword::Order,
        "by" => Keyword::By,
        "asc" => Keyword::Asc,
        "desc" => Keyword::Desc,
        "fill" => Keyword::Fill,
        "limit" => Keyword::Limit,
        "offset" => Keyword::Offset,
        "as" => Keyword::As,
        "and" => Keyword::And,
        "or" => Keyword::Or,
        "not" => Keyword::Not,
        "true" => Keyword::True,
        "false" => Keyword::False,
        "null" => Keyword::Null,
        "time" => Keyword::Time,
        "tag" => Keyword::Tag,
        _ => return None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    QuotedIdentifier(String),
    Integer(i64),
    Float(f64),
    Str(String),
    Keyword(Keyword),
    Comma,
    Dot,
    Semicolon,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
    AndAnd,
    OrOr,
    Arrow,
    Eof,
    Unknown(char),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub lexeme: String,
    pub span: (usize, usize),
}

pub struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.pos += 1;
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            None => break,
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            _ => {
                                self.pos += 1;
                            }
                        }
                    }
                }
                _ => break,
            }
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexerError> {
        self.skip_trivia();
        let start = self.pos;
        let Some(b) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                lexeme: String::new(),
                span: (start, start),
            });
        };

        let kind = match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.read_identifier(),
            b'0'..=b'9' => self.read_number()?,
            b'"' => self.read_delimited(b'"', true)?,
            b'\'' => self.read_delimited(b'\'', false)?,
            b',' => { self.pos += 1; TokenKind::Comma }
            b'.' if !self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => { self.pos += 1; TokenKind::Dot }
            b'.' => self.read_number()?,
            b';' => { self.pos += 1; TokenKind::Semicolon }
            b':' => { self.pos += 1; TokenKind::Colon }
            b'(' => { self.pos += 1; TokenKind::LParen }
            b')' => { self.pos += 1; TokenKind::RParen }
            b'[' => { self.pos += 1; TokenKind::LBracket }
            b']' => { self.pos += 1; TokenKind::RBracket }
            b'{' => { self.pos += 1; TokenKind::LBrace }
            b'}' => { self.pos += 1; TokenKind::RBrace }
            b'+' => { self.pos += 1; TokenKind::Plus }
            b'-' => {
                if self.peek_at(1) == Some(b'>') {
                    self.pos += 2;
                    TokenKind::Arrow
                } else {
                    self.pos += 1;
                    TokenKind::Minus
                }
            }
            b'*' => { self.pos += 1; TokenKind::Star }
            b'/' => { self.pos += 1; TokenKind::Slash }
            b'%' => { self.pos += 1; TokenKind::Percent }
            b'^' => { self.pos += 1; TokenKind::Caret }
            b'=' => {
                if self.peek_at(1) == Some(b'~') {
                    self.pos += 2;
                    TokenKind::Match
                } else {
                    self.pos += 1;
                    TokenKind::Eq
                }
            }
            b'!' => {
                if self.peek_at(1) == Some(b'~') {
                    self.pos += 2;
                    TokenKind::NotMatch
                } else if self.peek_at(1) == Some(b'=') {
                    self.pos += 2;
                    TokenKind::Neq
                } else {
                    self.pos += 1;
                    TokenKind::Unknown('!')
                }
            }
            b'<' => {
                if self.peek_at(1) == Some(b'=') {
                    self.pos += 2;
                    TokenKind::Le
                } else {
                    self.pos += 1;
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.peek_at(1) == Some(b'=') {
                    self.pos += 2;
                    TokenKind::Ge
                } else {
                    self.pos += 1;
                    TokenKind::Gt
                }
            }
            b'&' if self.peek_at(1) == Some(b'&') => { self.pos += 2; TokenKind::AndAnd }
            b'|' if self.peek_at(1) == Some(b'|') => { self.pos += 2; TokenKind::OrOr }
            other => {
                self.pos += 1;
                TokenKind::Unknown(other as char)
            }
        };

        let lexeme = self.source[start..self.pos].to_string();
        Ok(Token {
            kind,
            lexeme,
            span: (start, self.pos),
        })
    }

    fn read_identifier(&mut self) -> TokenKind {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.source[start..self.pos];
        match keyword_from_str(text) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Identifier(text.to_string()),
        }
    }

    fn read_number(&mut self) -> Result<TokenKind, LexerError> {
        let start = self.pos;
        let mut is_float = false;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mark = self.pos;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            if self.peek().is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
            } else {
                self.pos = mark;
            }
        }
        let text = &self.source[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| LexerError::InvalidLiteral(start, text.to_string()))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Integer)
                .map_err(|_| LexerError::InvalidLiteral(start, text.to_string()))
        }
    }

    fn read_delimited(&mut self, delim: u8, quoted_identifier: bool) -> Result<TokenKind, LexerError> {
        let start = self.pos;
        self.pos += 1; // opening delimiter
        let mut value = String::new();
        loop {
            match self.advance() {
                None => return Err(LexerError::UnterminatedString(start)),
                Some(b) if b == delim => {
                    if self.peek() == Some(delim) {
                        value.push(delim as char);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Some(b) => {
                    // preserve utf-8 continuation bytes verbatim
                    value.push(b as char);
                }
            }
        }
        Ok(if quoted_identifier {
            TokenKind::QuotedIdentifier(value)
        } else {
            TokenKind::Str(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::new(src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn tokenizes_a_simple_select() {
        let kinds = kinds("select value from metrics where time > 0 limit 10");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::Select),
                TokenKind::Identifier("value".into()),
                TokenKind::Keyword(Keyword::From),
                TokenKind::Identifier("metrics".into()),
                TokenKind::Keyword(Keyword::Where),
                TokenKind::Keyword(Keyword::Time),
                TokenKind::Gt,
                TokenKind::Integer(0),
                TokenKind::Keyword(Keyword::Limit),
                TokenKind::Integer(10),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn distinguishes_quoted_identifiers_from_strings() {
        let kinds = kinds(r#" "my col" 'hello' "#);
        assert_eq!(
            kinds,
            vec![
                TokenKind::QuotedIdentifier("my col".into()),
                TokenKind::Str("hello".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn doubled_delimiter_escapes_one_literal_quote() {
        let kinds = kinds("'it''s'");
        assert_eq!(kinds, vec![TokenKind::Str("it's".into()), TokenKind::Eof]);
    }

    #[test]
    fn skips_line_and_block_comments() {
        let kinds = kinds("select -- trailing\n1 /* block */ + 2");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Keyword(Keyword::Select),
                TokenKind::Integer(1),
                TokenKind::Plus,
                TokenKind::Integer(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_block_comment_falls_through_to_eof() {
        let kinds = kinds("select /* never closes");
        assert_eq!(kinds, vec![TokenKind::Keyword(Keyword::Select), TokenKind::Eof]);
    }

    #[test]
    fn numbers_pick_integer_vs_float_by_shape() {
        let kinds = kinds("1 1.5 1e3 1.5e-2");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Integer(1),
                TokenKind::Float(1.5),
                TokenKind::Float(1000.0),
                TokenKind::Float(0.015),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn full_operator_set_is_recognized() {
        let kinds = kinds("=~ !~ && || -> != <= >=");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Match,
                TokenKind::NotMatch,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Arrow,
                TokenKind::Neq,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unknown_byte_becomes_single_unknown_token() {
        let kinds = kinds("@");
        assert_eq!(kinds, vec![TokenKind::Unknown('@'), TokenKind::Eof]);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = Lexer::new("'abc").tokenize().unwrap_err();
        assert_eq!(err, LexerError::UnterminatedString(0));
    }
}
