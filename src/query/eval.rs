use thiserror::Error;

use crate::query::arena::Arena;
use crate::query::ast::{BinaryOp, Expr, ExprId, Literal, UnaryOp};

#[derive(Error, Debug, PartialEq)]
pub enum EvalError {
    #[error("type mismatch evaluating expression")]
    TypeMismatch,
    #[error("unsupported expression")]
    UnsupportedExpression,
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Str(String),
    Boolean(bool),
    Null,
}

impl Value {
    fn as_f64(&self) -> Result<f64, EvalError> {
        match self {
            Value::Integer(n) => Ok(*n as f64),
            Value::Float(f) => Ok(*f),
            _ => Err(EvalError::TypeMismatch),
        }
    }

    fn as_int(&self) -> Result<i64, EvalError> {
        match self {
            Value::Integer(n) => Ok(*n),
            Value::Float(f) => Ok(*f as i64),
            _ => Err(EvalError::TypeMismatch),
        }
    }

    fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Boolean(b) => Ok(*b),
            _ => Err(EvalError::TypeMismatch),
        }
    }

    fn is_truthy(&self) -> bool {
        matches!(self.as_bool(), Ok(true))
    }
}

/// Resolves identifiers to column values at the current cursor position.
pub trait Resolver {
    fn resolve(&self, name: &str) -> Option<Value>;
}

pub fn evaluate(arena: &Arena<Expr>, id: ExprId, resolver: &dyn Resolver) -> Result<Value, EvalError> {
    match arena.get(id) {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Integer(n) => Value::Integer(*n),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
            Literal::Boolean(b) => Value::Boolean(*b),
            Literal::Null => Value::Null,
        }),
        Expr::Identifier(identifier) => Ok(resolver.resolve(&identifier.value).unwrap_or(Value::Null)),
        Expr::Unary { op, expr } => {
            let value = evaluate(arena, *expr, resolver)?;
            match op {
                UnaryOp::Plus => Ok(Value::Float(value.as_f64()?)),
                UnaryOp::Neg => Ok(Value::Float(-value.as_f64()?)),
                UnaryOp::Not => Ok(Value::Boolean(!value.is_truthy())),
            }
        }
        Expr::Binary { op, left, right } => evaluate_binary(arena, *op, *left, *right, resolver),
        Expr::Call { name, args } => evaluate_call(arena, name, args, resolver),
    }
}

fn evaluate_binary(
    arena: &Arena<Expr>,
    op: BinaryOp,
    left: ExprId,
    right: ExprId,
    resolver: &dyn Resolver,
) -> Result<Value, EvalError> {
    match op {
        BinaryOp::And => {
            let l = evaluate(arena, left, resolver)?;
            if !l.is_truthy() {
                return Ok(Value::Boolean(false));
            }
            Ok(Value::Boolean(evaluate(arena, right, resolver)?.is_truthy()))
        }
        BinaryOp::Or => {
            let l = evaluate(arena, left, resolver)?;
            if l.is_truthy() {
                return Ok(Value::Boolean(true));
            }
            Ok(Value::Boolean(evaluate(arena, right, resolver)?.is_truthy()))
        }
        BinaryOp::Eq | BinaryOp::Neq => {
            let l = evaluate(arena, left, resolver)?;
            let r = evaluate(arena, right, resolver)?;
            let equal = values_equal(&l, &r);
            Ok(Value::Boolean(if op == BinaryOp::Eq { equal } else { !equal }))
        }
        BinaryOp::Match | BinaryOp::NotMatch => Err(EvalError::UnsupportedExpression),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let l = evaluate(arena, left, resolver)?.as_f64()?;
            let r = evaluate(arena, right, resolver)?.as_f64()?;
            Ok(Value::Boolean(match op {
                BinaryOp::Lt => l < r,
                BinaryOp::Le => l <= r,
                BinaryOp::Gt => l > r,
                BinaryOp::Ge => l >= r,
                _ => unreachable!(),
            }))
        }
        BinaryOp::Mod => {
            let l = evaluate(arena, left, resolver)?.as_int()?;
            let r = evaluate(arena, right, resolver)?.as_int()?;
            if r == 0 {
                Err(EvalError::DivisionByZero)
            } else {
                Ok(Value::Integer(l % r))
            }
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow => {
            let l = evaluate(arena, left, resolver)?.as_f64()?;
            let r = evaluate(arena, right, resolver)?.as_f64()?;
            match op {
                BinaryOp::Add => Ok(Value::Float(l + r)),
                BinaryOp::Sub => Ok(Value::Float(l - r)),
                BinaryOp::Mul => Ok(Value::Float(l * r)),
                BinaryOp::Div => {
                    if r == 0.0 {
                        Err(EvalError::DivisionByZero)
                    } else {
                        Ok(Value::Float(l / r))
                    }
                }
                BinaryOp::Pow => Ok(Value::Float(l.powf(r))),
                _ => unreachable!(),
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        _ => matches!((a.as_f64(), b.as_f64()), (Ok(x), Ok(y)) if x == y),
    }
}

/// Only the handful of functions meaningful at per-row evaluation time are
/// supported here; aggregates and window functions are computed by the
/// operator layer, not through expression evaluation.
fn evaluate_call(
    arena: &Arena<Expr>,
    name: &str,
    args: &[ExprId],
    resolver: &dyn Resolver,
) -> Result<Value, EvalError> {
    if name.eq_ignore_ascii_case("abs") {
        let [x] = args else { return Err(EvalError::UnsupportedExpression) };
        let v = evaluate(arena, *x, resolver)?.as_f64()?;
        return Ok(Value::Float(v.abs()));
    }
    if name.eq_ignore_ascii_case("time_bucket") {
        let [bucket, ts] = args else { return Err(EvalError::UnsupportedExpression) };
        let bucket = evaluate(arena, *bucket, resolver)?.as_f64()? as i64;
        let ts = evaluate(arena, *ts, resolver)?.as_f64()? as i64;
        if bucket == 0 {
            return Err(EvalError::DivisionByZero);
        }
        return Ok(Value::Integer(ts.div_euclid(bucket) * bucket));
    }
    Err(EvalError::UnsupportedExpression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;
    use crate::query::ast::Statement;

    struct MapResolver(std::collections::HashMap<&'static str, Value>);
    impl Resolver for MapResolver {
        fn resolve(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    fn select_expr(src: &str) -> (crate::query::ast::ParsedQuery, ExprId) {
        let parsed = parse(src).unwrap();
        let expr = match &parsed.statement {
            Statement::Select(s) => s.projections[0].expr,
            _ => panic!("expected select"),
        };
        (parsed, expr)
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let (parsed, expr) = select_expr("select 1 + 2 * 3 from metrics where time > 0");
        let resolver = MapResolver(Default::default());
        assert_eq!(evaluate(&parsed.arena, expr, &resolver), Ok(Value::Float(7.0)));
    }

    #[test]
    fn modulo_is_evaluated_on_integers() {
        let (parsed, expr) = select_expr("select 7 % 3 from metrics where time > 0");
        let resolver = MapResolver(Default::default());
        assert_eq!(evaluate(&parsed.arena, expr, &resolver), Ok(Value::Integer(1)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let (parsed, expr) = select_expr("select 1 / 0 from metrics where time > 0");
        let resolver = MapResolver(Default::default());
        assert_eq!(evaluate(&parsed.arena, expr, &resolver), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn identifier_resolves_via_the_resolver() {
        let (parsed, expr) = select_expr("select value from metrics where time > 0");
        let mut map = std::collections::HashMap::new();
        map.insert("value", Value::Float(42.0));
        let resolver = MapResolver(map);
        assert_eq!(evaluate(&parsed.arena, expr, &resolver), Ok(Value::Float(42.0)));
    }

    #[test]
    fn abs_call_is_supported() {
        let (parsed, expr) = select_expr("select abs(-5) from metrics where time > 0");
        let resolver = MapResolver(Default::default());
        assert_eq!(evaluate(&parsed.arena, expr, &resolver), Ok(Value::Float(5.0)));
    }

    #[test]
    fn short_circuit_and_skips_right_side_errors() {
        let (parsed, expr) = select_expr("select false && (1/0 > 0) from metrics where time > 0");
        let resolver = MapResolver(Default::default());
        assert_eq!(evaluate(&parsed.arena, expr, &resolver), Ok(Value::Boolean(false)));
    }
}
