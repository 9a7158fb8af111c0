use thiserror::Error;

use crate::query::ast::{
    Expr, ExprId, Fill, OrderByItem as AstOrderByItem, ParsedQuery, SelectStatement, SeriesRef, Statement,
};

#[derive(Error, Debug, PartialEq)]
pub enum LogicalError {
    #[error("only select statements can be planned")]
    UnsupportedStatement,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub columns: Vec<String>,
}

impl Schema {
    pub fn scan_default() -> Self {
        Self { columns: vec!["time".to_string(), "value".to_string()] }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectItem {
    pub expr: ExprId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct AggregateItem {
    pub expr: ExprId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SortItem {
    pub expr: ExprId,
    pub desc: bool,
}

#[derive(Debug, Clone)]
pub enum LogicalPlan {
    /// A query with no `FROM` clause: a single synthetic row, used to
    /// evaluate scalar-only projections like `select 1`.
    OneRow,
    Scan {
        series: SeriesRef,
        schema: Schema,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: ExprId,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<ExprId>,
        aggregates: Vec<AggregateItem>,
        fill: Option<Fill>,
        /// set when a `time_bucket(..)` grouping key was detected, so the
        /// optimizer/physical planner can treat this as a rollup.
        rollup_hint: Option<ExprId>,
    },
    Project {
        input: Box<LogicalPlan>,
        items: Vec<ProjectItem>,
    },
    Sort {
        input: Box<LogicalPlan>,
        items: Vec<SortItem>,
    },
    Limit {
        input: Box<LogicalPlan>,
        limit: Option<u64>,
        offset: Option<u64>,
    },
}

pub fn build(parsed: &ParsedQuery) -> Result<LogicalPlan, LogicalError> {
    match unwrap_explain(&parsed.statement) {
        Statement::Select(select) => Ok(build_select(parsed, select)),
        _ => Err(LogicalError::UnsupportedStatement),
    }
}

fn unwrap_explain(statement: &Statement) -> &Statement {
    match statement {
        Statement::Explain(inner) => unwrap_explain(inner),
        other => other,
    }
}

fn build_select(parsed: &ParsedQuery, select: &SelectStatement) -> LogicalPlan {
    let mut plan = match &select.from {
        Some(series) => LogicalPlan::Scan { series: series.clone(), schema: Schema::scan_default() },
        None => LogicalPlan::OneRow,
    };

    if let Some(predicate) = select.filter {
        plan = LogicalPlan::Filter { input: Box::new(plan), predicate };
    }

    let is_aggregate = !select.group_by.is_empty()
        || select
            .projections
            .iter()
            .any(|p| expr_is_aggregate_or_window(&parsed.arena, p.expr));

    if is_aggregate {
        let rollup_hint = select.group_by.iter().copied().find(|&id| is_time_bucket_call(&parsed.arena, id));
        let aggregates = select
            .projections
            .iter()
            .enumerate()
            .map(|(i, item)| AggregateItem {
                expr: item.expr,
                name: projection_name(parsed, item.expr, item.alias.as_deref(), i),
            })
            .collect();
        plan = LogicalPlan::Aggregate {
            input: Box::new(plan),
            group_by: select.group_by.clone(),
            aggregates,
            fill: select.fill.clone(),
            rollup_hint,
        };
    } else {
        let items = select
            .projections
            .iter()
            .enumerate()
            .map(|(i, item)| ProjectItem {
                expr: item.expr,
                name: projection_name(parsed, item.expr, item.alias.as_deref(), i),
            })
            .collect();
        plan = LogicalPlan::Project { input: Box::new(plan), items };
    }

    if !select.order_by.is_empty() {
        let items = select
            .order_by
            .iter()
            .map(|o: &AstOrderByItem| SortItem { expr: o.expr, desc: o.desc })
            .collect();
        plan = LogicalPlan::Sort { input: Box::new(plan), items };
    }

    if select.limit.is_some() || select.offset.is_some() {
        plan = LogicalPlan::Limit { input: Box::new(plan), limit: select.limit, offset: select.offset };
    }

    plan
}

fn expr_is_aggregate_or_window(arena: &crate::query::arena::Arena<Expr>, id: ExprId) -> bool {
    const AGGREGATE_OR_WINDOW: &[&str] = &[
        "avg", "sum", "min", "max", "count", "first", "last", "percentile", "lag", "lead",
        "rate", "irate", "delta", "integral", "moving_avg", "ema",
    ];
    match arena.get(id) {
        Expr::Call { name, args } => {
            AGGREGATE_OR_WINDOW.iter().any(|f| f.eq_ignore_ascii_case(name))
                || args.iter().any(|&a| expr_is_aggregate_or_window(arena, a))
        }
        Expr::Unary { expr, .. } => expr_is_aggregate_or_window(arena, *expr),
        Expr::Binary { left, right, .. } => {
            expr_is_aggregate_or_window(arena, *left) || expr_is_aggregate_or_window(arena, *right)
        }
        Expr::Identifier(_) | Expr::Literal(_) => false,
    }
}

fn is_time_bucket_call(arena: &crate::query::arena::Arena<Expr>, id: ExprId) -> bool {
    matches!(arena.get(id), Expr::Call { name, .. } if name.eq_ignore_ascii_case("time_bucket"))
}

/// alias > bare identifier text > `<fn_name>_<counter>` > `_col<counter>`.
fn projection_name(parsed: &ParsedQuery, expr: ExprId, alias: Option<&str>, counter: usize) -> String {
    if let Some(alias) = alias {
        return alias.to_string();
    }
    match parsed.arena.get(expr) {
        Expr::Identifier(id) => id.value.clone(),
        Expr::Call { name, .. } => format!("{}_{}", name.to_ascii_lowercase(), counter),
        _ => format!("_col{}", counter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    #[test]
    fn simple_select_produces_project_over_filter_over_scan() {
        let parsed = parse("select value from metrics where time > 0").unwrap();
        let plan = build(&parsed).unwrap();
        assert!(matches!(plan, LogicalPlan::Project { .. }));
    }

    #[test]
    fn aggregate_query_wraps_in_aggregate_node_with_rollup_hint() {
        let parsed =
            parse("select avg(value) from metrics where time > 0 group by time_bucket(60, time)").unwrap();
        let plan = build(&parsed).unwrap();
        match plan {
            LogicalPlan::Aggregate { rollup_hint, aggregates, .. } => {
                assert!(rollup_hint.is_some());
                assert_eq!(aggregates[0].name, "avg_0");
            }
            _ => panic!("expected aggregate plan"),
        }
    }

    #[test]
    fn order_by_and_limit_layer_on_top() {
        let parsed = parse("select value from metrics where time > 0 order by time desc limit 5").unwrap();
        let plan = build(&parsed).unwrap();
        match plan {
            LogicalPlan::Limit { input, limit, .. } => {
                assert_eq!(limit, Some(5));
                assert!(matches!(*input, LogicalPlan::Sort { .. }));
            }
            _ => panic!("expected limit plan"),
        }
    }

    #[test]
    fn alias_wins_over_implicit_naming() {
        let parsed = parse("select value as v from metrics where time > 0").unwrap();
        let plan = build(&parsed).unwrap();
        match plan {
            LogicalPlan::Project { items, .. } => assert_eq!(items[0].name, "v"),
            _ => panic!("expected project plan"),
        }
    }

    #[test]
    fn select_without_from_plans_over_one_row() {
        let parsed = parse("select 1 + 1").unwrap();
        let plan = build(&parsed).unwrap();
        match plan {
            LogicalPlan::Project { input, .. } => assert!(matches!(*input, LogicalPlan::OneRow)),
            _ => panic!("expected project plan"),
        }
    }

    #[test]
    fn insert_statement_is_unsupported_by_the_query_pipeline() {
        let parsed = parse("insert into metrics (time, value) values (1, 2.0)").unwrap();
        assert_eq!(build(&parsed).unwrap_err(), LogicalError::UnsupportedStatement);
    }
}
