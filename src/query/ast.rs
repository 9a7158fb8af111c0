use crate::query::arena::{Arena, ArenaId};

pub type ExprId = ArenaId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Neq,
    Match,
    NotMatch,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    Null,
}

/// A dotted identifier path, e.g. `tag.region` or `"my col".value`. `value`
/// is the source slice spanning all segments; `quoted` is true if any
/// segment was quoted.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub value: String,
    pub quoted: bool,
}

impl Identifier {
    pub fn new(value: impl Into<String>, quoted: bool) -> Self {
        Self {
            value: value.into(),
            quoted,
        }
    }

    /// The segment after the final `.`, case-folded for comparison use.
    pub fn trailing_segment(&self) -> &str {
        self.value.rsplit('.').next().unwrap_or(&self.value)
    }
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal),
    Identifier(Identifier),
    Unary {
        op: UnaryOp,
        expr: ExprId,
    },
    Binary {
        op: BinaryOp,
        left: ExprId,
        right: ExprId,
    },
    Call {
        name: String,
        args: Vec<ExprId>,
    },
}

/// Structural, case-insensitive-on-names equality shared by the optimizer
/// and the operator/aggregate layers. Exact on literal payloads; recursive
/// over call args and binary/unary operands.
pub fn structurally_equal(arena: &Arena<Expr>, a: ExprId, b: ExprId) -> bool {
    match (arena.get(a), arena.get(b)) {
        (Expr::Literal(l1), Expr::Literal(l2)) => l1 == l2,
        (Expr::Identifier(i1), Expr::Identifier(i2)) => {
            i1.value.eq_ignore_ascii_case(&i2.value)
        }
        (Expr::Unary { op: op1, expr: e1 }, Expr::Unary { op: op2, expr: e2 }) => {
            op1 == op2 && structurally_equal(arena, *e1, *e2)
        }
        (
            Expr::Binary { op: op1, left: l1, right: r1 },
            Expr::Binary { op: op2, left: l2, right: r2 },
        ) => op1 == op2 && structurally_equal(arena, *l1, *l2) && structurally_equal(arena, *r1, *r2),
        (Expr::Call { name: n1, args: a1 }, Expr::Call { name: n2, args: a2 }) => {
            n1.eq_ignore_ascii_case(n2)
                && a1.len() == a2.len()
                && a1.iter().zip(a2.iter()).all(|(x, y)| structurally_equal(arena, *x, *y))
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub enum SeriesRef {
    ById(u64),
    Name(Identifier),
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: ExprId,
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Fill {
    Previous,
    Linear,
    Null,
    Constant(ExprId),
}

#[derive(Debug, Clone)]
pub struct OrderByItem {
    pub expr: ExprId,
    pub desc: bool,
}

#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub projections: Vec<SelectItem>,
    pub from: Option<SeriesRef>,
    pub filter: Option<ExprId>,
    pub group_by: Vec<ExprId>,
    pub fill: Option<Fill>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InsertStatement {
    pub table: Identifier,
    pub columns: Option<Vec<Identifier>>,
    pub values: Vec<ExprId>,
}

#[derive(Debug, Clone)]
pub struct DeleteStatement {
    pub from: SeriesRef,
    pub filter: Option<ExprId>,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Delete(DeleteStatement),
    Explain(Box<Statement>),
}

/// The parsed output of one query: an arena of expression nodes plus the
/// single top-level statement, and the byte span the statement covers in
/// the source text.
pub struct ParsedQuery {
    pub arena: Arena<Expr>,
    pub statement: Statement,
    pub span: (usize, usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_segment_splits_on_dot() {
        let id = Identifier::new("tag.time", false);
        assert_eq!(id.trailing_segment(), "time");
        let plain = Identifier::new("value", false);
        assert_eq!(plain.trailing_segment(), "value");
    }

    #[test]
    fn structural_equality_is_case_insensitive_on_names() {
        let mut arena = Arena::new();
        let a = arena.alloc(Expr::Identifier(Identifier::new("Value", false)));
        let b = arena.alloc(Expr::Identifier(Identifier::new("value", false)));
        assert!(structurally_equal(&arena, a, b));
    }

    #[test]
    fn structural_equality_recurses_into_calls() {
        let mut arena = Arena::new();
        let lit1 = arena.alloc(Expr::Literal(Literal::Integer(60)));
        let lit2 = arena.alloc(Expr::Literal(Literal::Integer(60)));
        let call1 = arena.alloc(Expr::Call { name: "TIME_BUCKET".into(), args: vec![lit1] });
        let call2 = arena.alloc(Expr::Call { name: "time_bucket".into(), args: vec![lit2] });
        assert!(structurally_equal(&arena, call1, call2));
    }
}
