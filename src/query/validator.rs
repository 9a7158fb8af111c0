use crate::query::ast::{DeleteStatement, Expr, Identifier, ParsedQuery, SelectStatement, Statement};
use crate::query::functions::FunctionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn error(message: impl Into<String>) -> Self {
        Self { severity: Severity::Error, message: message.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        !self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }
}

/// Walks a parsed statement collecting diagnostics without aborting: every
/// applicable rule runs so a caller sees the full set of problems at once.
pub fn validate(parsed: &ParsedQuery, functions: &FunctionRegistry) -> ValidationResult {
    let mut diagnostics = Vec::new();
    match &parsed.statement {
        Statement::Select(select) => validate_select(parsed, select, functions, &mut diagnostics),
        Statement::Delete(delete) => validate_delete(parsed, delete, &mut diagnostics),
        Statement::Insert(_) => {}
        Statement::Explain(inner) => match inner.as_ref() {
            Statement::Select(select) => {
                validate_select(parsed, select, functions, &mut diagnostics)
            }
            Statement::Delete(delete) => validate_delete(parsed, delete, &mut diagnostics),
            _ => {}
        },
    }
    ValidationResult { diagnostics }
}

fn validate_select(
    parsed: &ParsedQuery,
    select: &SelectStatement,
    functions: &FunctionRegistry,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if select.from.is_some() {
        require_time_range(select.filter, parsed, diagnostics);
    }
    check_unknown_functions(parsed, &select_exprs(select), functions, diagnostics);
}

fn validate_delete(parsed: &ParsedQuery, delete: &DeleteStatement, diagnostics: &mut Vec<Diagnostic>) {
    require_time_range(delete.filter, parsed, diagnostics);
}

fn select_exprs(select: &SelectStatement) -> Vec<crate::query::ast::ExprId> {
    let mut exprs: Vec<_> = select.projections.iter().map(|p| p.expr).collect();
    exprs.extend(select.group_by.iter().copied());
    exprs.extend(select.order_by.iter().map(|o| o.expr));
    if let Some(filter) = select.filter {
        exprs.push(filter);
    }
    exprs
}

fn require_time_range(
    filter: Option<crate::query::ast::ExprId>,
    parsed: &ParsedQuery,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let has_time_bound = match filter {
        Some(id) => references_time(&parsed.arena, id),
        None => false,
    };
    if !has_time_bound {
        diagnostics.push(Diagnostic::error(
            "time_range_required: query must filter on a trailing `.time` (or bare `time`) identifier",
        ));
    }
}

fn references_time(arena: &crate::query::arena::Arena<Expr>, id: crate::query::ast::ExprId) -> bool {
    match arena.get(id) {
        Expr::Identifier(Identifier { value, .. }) => value
            .rsplit('.')
            .next()
            .unwrap_or(value)
            .eq_ignore_ascii_case("time"),
        Expr::Unary { expr, .. } => references_time(arena, *expr),
        Expr::Binary { left, right, .. } => {
            references_time(arena, *left) || references_time(arena, *right)
        }
        Expr::Call { args, .. } => args.iter().any(|a| references_time(arena, *a)),
        Expr::Literal(_) => false,
    }
}

fn check_unknown_functions(
    parsed: &ParsedQuery,
    exprs: &[crate::query::ast::ExprId],
    functions: &FunctionRegistry,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for &id in exprs {
        walk_for_calls(&parsed.arena, id, functions, diagnostics);
    }
}

fn walk_for_calls(
    arena: &crate::query::arena::Arena<Expr>,
    id: crate::query::ast::ExprId,
    functions: &FunctionRegistry,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match arena.get(id) {
        Expr::Call { name, args } => {
            if functions.lookup(name).is_none() {
                diagnostics.push(Diagnostic::error(format!(
                    "invalid_syntax: unknown function '{}'",
                    name
                )));
            }
            for &arg in args {
                walk_for_calls(arena, arg, functions, diagnostics);
            }
        }
        Expr::Unary { expr, .. } => walk_for_calls(arena, *expr, functions, diagnostics),
        Expr::Binary { left, right, .. } => {
            walk_for_calls(arena, *left, functions, diagnostics);
            walk_for_calls(arena, *right, functions, diagnostics);
        }
        Expr::Identifier(_) | Expr::Literal(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    #[test]
    fn select_without_time_predicate_is_invalid() {
        let parsed = parse("select value from metrics").unwrap();
        let result = validate(&parsed, &FunctionRegistry::with_builtins());
        assert!(!result.is_valid());
    }

    #[test]
    fn select_without_from_does_not_require_a_time_predicate() {
        let parsed = parse("select 1 + 1 as two").unwrap();
        let result = validate(&parsed, &FunctionRegistry::with_builtins());
        assert!(result.is_valid());
    }

    #[test]
    fn select_with_time_predicate_is_valid() {
        let parsed = parse("select value from metrics where time > 0").unwrap();
        let result = validate(&parsed, &FunctionRegistry::with_builtins());
        assert!(result.is_valid());
    }

    #[test]
    fn unknown_function_is_flagged() {
        let parsed = parse("select nope(value) from metrics where time > 0").unwrap();
        let result = validate(&parsed, &FunctionRegistry::with_builtins());
        assert!(!result.is_valid());
        assert!(result.diagnostics.iter().any(|d| d.message.contains("nope")));
    }

    #[test]
    fn known_aggregate_function_is_accepted() {
        let parsed = parse("select avg(value) from metrics where time > 0 group by time_bucket(60, time)").unwrap();
        let result = validate(&parsed, &FunctionRegistry::with_builtins());
        assert!(result.is_valid());
    }

    #[test]
    fn delete_without_time_predicate_is_invalid() {
        let parsed = parse("delete from metrics").unwrap();
        let result = validate(&parsed, &FunctionRegistry::with_builtins());
        assert!(!result.is_valid());
    }
}
