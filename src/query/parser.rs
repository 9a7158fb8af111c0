use thiserror::Error;

use crate::query::arena::Arena;
use crate::query::ast::{
    BinaryOp, DeleteStatement, Expr, ExprId, Fill, Identifier, InsertStatement, Literal,
    OrderByItem, ParsedQuery, SelectItem, SelectStatement, SeriesRef, Statement, UnaryOp,
};
use crate::query::lexer::{Keyword, Lexer, LexerError, Token, TokenKind};

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexerError),
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("unexpected statement: {0}")]
    UnexpectedStatement(String),
    #[error("unexpected expression: {0}")]
    UnexpectedExpression(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

pub fn parse(source: &str) -> Result<ParsedQuery, ParseError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        arena: Arena::new(),
    };
    let statement = parser.parse_statement()?;
    parser.skip_optional_semicolon();
    parser.expect(TokenKind::Eof)?;

    let trimmed_start = source.len() - source.trim_start().len();
    let trimmed_len = source.trim().len();
    Ok(ParsedQuery {
        arena: parser.arena,
        statement,
        span: (trimmed_start, trimmed_start + trimmed_len),
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    arena: Arena<Expr>,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        matches!(&self.peek().kind, TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(ParseError::UnexpectedToken(format!(
                "expected {:?}, found {:?}",
                kind,
                self.peek().kind
            )))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<Token, ParseError> {
        if self.check_keyword(kw) {
            Ok(self.advance())
        } else {
            Err(ParseError::UnexpectedToken(format!(
                "expected keyword {:?}, found {:?}",
                kw,
                self.peek().kind
            )))
        }
    }

    fn skip_optional_semicolon(&mut self) {
        if self.check(&TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Select) => self.parse_select().map(Statement::Select),
            TokenKind::Keyword(Keyword::Insert) => self.parse_insert().map(Statement::Insert),
            TokenKind::Keyword(Keyword::Delete) => self.parse_delete().map(Statement::Delete),
            TokenKind::Keyword(Keyword::Explain) => {
                self.advance();
                let inner = self.parse_statement()?;
                Ok(Statement::Explain(Box::new(inner)))
            }
            other => Err(ParseError::UnexpectedStatement(format!("{:?}", other))),
        }
    }

    fn parse_select(&mut self) -> Result<SelectStatement, ParseError> {
        self.expect_keyword(Keyword::Select)?;
        let projections = self.parse_select_list()?;

        let from = if self.eat_keyword(Keyword::From) {
            Some(self.parse_selector()?)
        } else {
            None
        };

        let filter = if self.eat_keyword(Keyword::Where) {
            Some(self.parse_or()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.check_keyword(Keyword::Group) {
            self.advance();
            self.expect_keyword(Keyword::By)?;
            group_by.push(self.parse_or()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                group_by.push(self.parse_or()?);
            }
        }

        let fill = if self.check_keyword(Keyword::Fill) {
            Some(self.parse_fill()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.check_keyword(Keyword::Order) {
            self.advance();
            self.expect_keyword(Keyword::By)?;
            order_by.push(self.parse_order_by_item()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                order_by.push(self.parse_order_by_item()?);
            }
        }

        let limit = if self.eat_keyword(Keyword::Limit) {
            Some(self.parse_uint()?)
        } else {
            None
        };
        let offset = if self.eat_keyword(Keyword::Offset) {
            Some(self.parse_uint()?)
        } else {
            None
        };

        Ok(SelectStatement {
            projections,
            from,
            filter,
            group_by,
            fill,
            order_by,
            limit,
            offset,
        })
    }

    fn parse_uint(&mut self) -> Result<u64, ParseError> {
        match self.advance().kind {
            TokenKind::Integer(n) if n >= 0 => Ok(n as u64),
            other => Err(ParseError::InvalidNumber(format!("{:?}", other))),
        }
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>, ParseError> {
        let mut items = vec![self.parse_select_item()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            items.push(self.parse_select_item()?);
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem, ParseError> {
        let expr = self.parse_or()?;
        let alias = self.parse_optional_alias()?;
        Ok(SelectItem { expr, alias })
    }

    /// `expr AS alias` explicitly, or an implicit alias when the next
    /// token is a (quoted) identifier, or the keywords `time`/`tag`.
    fn parse_optional_alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat_keyword(Keyword::As) {
            return Ok(Some(self.parse_alias_name()?));
        }
        match &self.peek().kind {
            TokenKind::Identifier(_)
            | TokenKind::QuotedIdentifier(_)
            | TokenKind::Keyword(Keyword::Time)
            | TokenKind::Keyword(Keyword::Tag) => Ok(Some(self.parse_alias_name()?)),
            _ => Ok(None),
        }
    }

    fn parse_alias_name(&mut self) -> Result<String, ParseError> {
        match self.advance().kind {
            TokenKind::Identifier(s) | TokenKind::QuotedIdentifier(s) => Ok(s),
            TokenKind::Keyword(Keyword::Time) => Ok("time".to_string()),
            TokenKind::Keyword(Keyword::Tag) => Ok("tag".to_string()),
            other => Err(ParseError::UnexpectedToken(format!(
                "expected alias identifier, found {:?}",
                other
            ))),
        }
    }

    /// `(ident|quoted) ('.' (ident|quoted))*`.
    fn parse_identifier_path(&mut self) -> Result<Identifier, ParseError> {
        let (mut value, mut quoted) = self.parse_identifier_segment()?;
        while self.check(&TokenKind::Dot) {
            self.advance();
            let (segment, segment_quoted) = self.parse_identifier_segment()?;
            value.push('.');
            value.push_str(&segment);
            quoted = quoted || segment_quoted;
        }
        Ok(Identifier::new(value, quoted))
    }

    fn parse_identifier_segment(&mut self) -> Result<(String, bool), ParseError> {
        match self.advance().kind {
            TokenKind::Identifier(s) => Ok((s, false)),
            TokenKind::QuotedIdentifier(s) => Ok((s, true)),
            TokenKind::Keyword(Keyword::Time) => Ok(("time".to_string(), false)),
            TokenKind::Keyword(Keyword::Tag) => Ok(("tag".to_string(), false)),
            other => Err(ParseError::UnexpectedToken(format!(
                "expected identifier, found {:?}",
                other
            ))),
        }
    }

    /// `by_id(<integer>)` selects by raw series id; anything else is a
    /// name-based selector.
    fn parse_selector(&mut self) -> Result<SeriesRef, ParseError> {
        let start = self.pos;
        let path = self.parse_identifier_path()?;
        if !path.quoted && path.value.eq_ignore_ascii_case("by_id") && self.check(&TokenKind::LParen) {
            self.advance();
            let id = match self.advance().kind {
                TokenKind::Integer(n) if n >= 0 => n as u64,
                other => return Err(ParseError::UnexpectedToken(format!("expected integer, found {:?}", other))),
            };
            self.expect(TokenKind::RParen)?;
            return Ok(SeriesRef::ById(id));
        }
        self.pos = start;
        let path = self.parse_identifier_path()?;
        Ok(SeriesRef::Name(path))
    }

    fn parse_fill(&mut self) -> Result<Fill, ParseError> {
        self.expect_keyword(Keyword::Fill)?;
        self.expect(TokenKind::LParen)?;
        let fill = match &self.peek().kind {
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Fill::Null
            }
            TokenKind::Identifier(s) if s.eq_ignore_ascii_case("previous") => {
                self.advance();
                Fill::Previous
            }
            TokenKind::Identifier(s) if s.eq_ignore_ascii_case("linear") => {
                self.advance();
                Fill::Linear
            }
            _ => Fill::Constant(self.parse_or()?),
        };
        self.expect(TokenKind::RParen)?;
        Ok(fill)
    }

    fn parse_order_by_item(&mut self) -> Result<OrderByItem, ParseError> {
        let expr = self.parse_or()?;
        let desc = if self.eat_keyword(Keyword::Desc) {
            true
        } else {
            self.eat_keyword(Keyword::Asc);
            false
        };
        Ok(OrderByItem { expr, desc })
    }

    fn parse_insert(&mut self) -> Result<InsertStatement, ParseError> {
        self.expect_keyword(Keyword::Insert)?;
        self.expect_keyword(Keyword::Into)?;
        let table = self.parse_identifier_path()?;

        let columns = if self.check(&TokenKind::LParen) {
            self.advance();
            let mut cols = vec![self.parse_identifier_path()?];
            while self.check(&TokenKind::Comma) {
                self.advance();
                cols.push(self.parse_identifier_path()?);
            }
            self.expect(TokenKind::RParen)?;
            Some(cols)
        } else {
            None
        };

        self.expect_keyword(Keyword::Values)?;
        self.expect(TokenKind::LParen)?;
        let mut values = vec![self.parse_or()?];
        while self.check(&TokenKind::Comma) {
            self.advance();
            values.push(self.parse_or()?);
        }
        self.expect(TokenKind::RParen)?;

        Ok(InsertStatement { table, columns, values })
    }

    fn parse_delete(&mut self) -> Result<DeleteStatement, ParseError> {
        self.expect_keyword(Keyword::Delete)?;
        self.expect_keyword(Keyword::From)?;
        let from = self.parse_selector()?;
        let filter = if self.eat_keyword(Keyword::Where) {
            Some(self.parse_or()?)
        } else {
            None
        };
        Ok(DeleteStatement { from, filter })
    }

    // --- expression precedence ladder (low to high) ---

    fn parse_or(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_and()?;
        loop {
            let is_or = self.check(&TokenKind::OrOr) || self.check_keyword(Keyword::Or);
            if !is_or {
                break;
            }
            self.advance();
            let right = self.parse_and()?;
            left = self.arena.alloc(Expr::Binary { op: BinaryOp::Or, left, right });
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_equality()?;
        loop {
            let is_and = self.check(&TokenKind::AndAnd) || self.check_keyword(Keyword::And);
            if !is_and {
                break;
            }
            self.advance();
            let right = self.parse_equality()?;
            left = self.arena.alloc(Expr::Binary { op: BinaryOp::And, left, right });
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Eq => BinaryOp::Eq,
                TokenKind::Neq => BinaryOp::Neq,
                TokenKind::Match => BinaryOp::Match,
                TokenKind::NotMatch => BinaryOp::NotMatch,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = self.arena.alloc(Expr::Binary { op, left, right });
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = self.arena.alloc(Expr::Binary { op, left, right });
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = self.arena.alloc(Expr::Binary { op, left, right });
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<ExprId, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match &self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                TokenKind::Caret => BinaryOp::Pow,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = self.arena.alloc(Expr::Binary { op, left, right });
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<ExprId, ParseError> {
        let op = match &self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Keyword(Keyword::Not) => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(self.arena.alloc(Expr::Unary { op, expr }));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ExprId, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(self.arena.alloc(Expr::Literal(Literal::Integer(n))))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(self.arena.alloc(Expr::Literal(Literal::Float(f))))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(self.arena.alloc(Expr::Literal(Literal::Str(s))))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(self.arena.alloc(Expr::Literal(Literal::Boolean(true))))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(self.arena.alloc(Expr::Literal(Literal::Boolean(false))))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(self.arena.alloc(Expr::Literal(Literal::Null)))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Identifier(_)
            | TokenKind::QuotedIdentifier(_)
            | TokenKind::Keyword(Keyword::Time)
            | TokenKind::Keyword(Keyword::Tag) => {
                let (first, quoted) = self.parse_identifier_segment()?;
                if !quoted && self.check(&TokenKind::LParen) {
                    return self.parse_call(first);
                }
                let mut value = first;
                let mut any_quoted = quoted;
                while self.check(&TokenKind::Dot) {
                    self.advance();
                    let (segment, segment_quoted) = self.parse_identifier_segment()?;
                    value.push('.');
                    value.push_str(&segment);
                    any_quoted = any_quoted || segment_quoted;
                }
                Ok(self
                    .arena
                    .alloc(Expr::Identifier(Identifier::new(value, any_quoted))))
            }
            other => Err(ParseError::UnexpectedExpression(format!("{:?}", other))),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<ExprId, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.parse_or()?);
            while self.check(&TokenKind::Comma) {
                self.advance();
                args.push(self.parse_or()?);
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(self.arena.alloc(Expr::Call { name, args }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Statement;

    #[test]
    fn parses_simple_select_with_time_predicate() {
        let parsed = parse("select value from metrics where time > 0 limit 10").unwrap();
        match parsed.statement {
            Statement::Select(s) => {
                assert_eq!(s.projections.len(), 1);
                assert!(matches!(s.from, Some(SeriesRef::Name(_))));
                assert!(s.filter.is_some());
                assert_eq!(s.limit, Some(10));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn span_covers_trimmed_source() {
        let src = "  select 1  ";
        let parsed = parse(src).unwrap();
        assert_eq!(&src[parsed.span.0..parsed.span.1], "select 1");
    }

    #[test]
    fn trailing_semicolon_does_not_change_the_statement() {
        let with = parse("select 1;").unwrap();
        let without = parse("select 1").unwrap();
        assert_eq!(format!("{:?}", with.statement), format!("{:?}", without.statement));
    }

    #[test]
    fn by_id_selector_parses_to_series_ref_by_id() {
        let parsed = parse("select value from by_id(42) where time > 0").unwrap();
        match parsed.statement {
            Statement::Select(s) => assert!(matches!(s.from, Some(SeriesRef::ById(42)))),
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn group_by_time_bucket_and_fill() {
        let parsed = parse(
            "select avg(value) from metrics where time >= 0 group by time_bucket(60, time) fill(null)",
        )
        .unwrap();
        match parsed.statement {
            Statement::Select(s) => {
                assert_eq!(s.group_by.len(), 1);
                assert!(matches!(s.fill, Some(Fill::Null)));
            }
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn explain_wraps_inner_statement() {
        let parsed = parse("explain select 1").unwrap();
        assert!(matches!(parsed.statement, Statement::Explain(_)));
    }

    #[test]
    fn insert_statement_parses_columns_and_values() {
        let parsed = parse("insert into metrics (time, value) values (1000, 1.5)").unwrap();
        match parsed.statement {
            Statement::Insert(s) => {
                assert_eq!(s.columns.as_ref().unwrap().len(), 2);
                assert_eq!(s.values.len(), 2);
            }
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn implicit_alias_on_identifier_following_select_expr() {
        let parsed = parse("select avg(value) avg_value from metrics where time > 0").unwrap();
        match parsed.statement {
            Statement::Select(s) => assert_eq!(s.projections[0].alias.as_deref(), Some("avg_value")),
            _ => panic!("expected select"),
        }
    }

    #[test]
    fn unknown_function_still_parses_as_a_call() {
        let parsed = parse("select foo(value) from metrics where time > 0").unwrap();
        match parsed.statement {
            Statement::Select(s) => {
                assert!(matches!(parsed.arena.get(s.projections[0].expr), Expr::Call { .. }));
            }
            _ => panic!("expected select"),
        }
    }
}
