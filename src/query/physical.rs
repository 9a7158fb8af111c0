use crate::query::arena::Arena;
use crate::query::ast::{BinaryOp, Expr, ExprId, Fill, Identifier, Literal};
use crate::query::logical::{AggregateItem, LogicalPlan, ProjectItem, Schema, SortItem};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeBounds {
    pub min: Option<i64>,
    pub min_inclusive: bool,
    pub max: Option<i64>,
    pub max_inclusive: bool,
}

impl TimeBounds {
    fn tighten_min(&mut self, value: i64, inclusive: bool) {
        let tighter = match self.min {
            Some(current) => value > current || (value == current && !inclusive),
            None => true,
        };
        if tighter {
            self.min = Some(value);
            self.min_inclusive = inclusive;
        }
    }

    fn tighten_max(&mut self, value: i64, inclusive: bool) {
        let tighter = match self.max {
            Some(current) => value < current || (value == current && !inclusive),
            None => true,
        };
        if tighter {
            self.max = Some(value);
            self.max_inclusive = inclusive;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitHint {
    pub offset: u64,
    pub take: u64,
}

#[derive(Debug, Clone)]
pub enum PhysicalPlan {
    OneRow,
    Scan {
        series: crate::query::ast::SeriesRef,
        schema: Schema,
        time_bounds: TimeBounds,
    },
    Filter {
        input: Box<PhysicalPlan>,
        predicate: ExprId,
    },
    Aggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<ExprId>,
        aggregates: Vec<AggregateItem>,
        fill: Option<Fill>,
        requires_hash: bool,
        has_fill_clause: bool,
    },
    Project {
        input: Box<PhysicalPlan>,
        items: Vec<ProjectItem>,
        reuse_child_schema: bool,
    },
    Sort {
        input: Box<PhysicalPlan>,
        items: Vec<SortItem>,
        is_stable: bool,
        limit_hint: Option<LimitHint>,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: Option<u64>,
        offset: u64,
    },
}

pub fn plan(logical: LogicalPlan, arena: &Arena<Expr>) -> PhysicalPlan {
    match logical {
        LogicalPlan::OneRow => PhysicalPlan::OneRow,
        LogicalPlan::Scan { series, schema } => {
            PhysicalPlan::Scan { series, schema, time_bounds: TimeBounds::default() }
        }
        LogicalPlan::Filter { input, predicate } => {
            let input = plan(*input, arena);
            let input = attach_time_bounds(input, arena, predicate);
            PhysicalPlan::Filter { input: Box::new(input), predicate }
        }
        LogicalPlan::Aggregate { input, group_by, aggregates, fill, rollup_hint } => {
            let has_fill_clause = fill.is_some();
            PhysicalPlan::Aggregate {
                input: Box::new(plan(*input, arena)),
                requires_hash: !group_by.is_empty() || rollup_hint.is_some(),
                group_by,
                aggregates,
                fill,
                has_fill_clause,
            }
        }
        LogicalPlan::Project { input, items } => {
            let reuse_child_schema = is_identity_projection(&items, arena);
            PhysicalPlan::Project { input: Box::new(plan(*input, arena)), items, reuse_child_schema }
        }
        LogicalPlan::Sort { input, items } => {
            PhysicalPlan::Sort { input: Box::new(plan(*input, arena)), items, is_stable: true, limit_hint: None }
        }
        LogicalPlan::Limit { input, limit, offset } => {
            let offset = offset.unwrap_or(0);
            let physical_input = plan(*input, arena);
            match physical_input {
                PhysicalPlan::Sort { input, items, is_stable, .. } => PhysicalPlan::Sort {
                    input,
                    items,
                    is_stable,
                    limit_hint: Some(LimitHint { offset, take: limit.unwrap_or(u64::MAX) }),
                },
                other => PhysicalPlan::Limit { input: Box::new(other), limit, offset },
            }
        }
    }
}

/// A `Scan` whose only ancestor chain up to here is a stack of `Filter`
/// nodes receives the merged time bounds; anything richer (joins across
/// scans, for example) is out of scope for this single-series engine.
fn attach_time_bounds(plan: PhysicalPlan, arena: &Arena<Expr>, predicate: ExprId) -> PhysicalPlan {
    match plan {
        PhysicalPlan::Scan { series, schema, mut time_bounds } => {
            extract_time_bounds(arena, predicate, &mut time_bounds);
            PhysicalPlan::Scan { series, schema, time_bounds }
        }
        PhysicalPlan::Filter { input, predicate: inner_predicate } => {
            PhysicalPlan::Filter { input: Box::new(attach_time_bounds(*input, arena, predicate)), predicate: inner_predicate }
        }
        other => other,
    }
}

fn extract_time_bounds(arena: &Arena<Expr>, id: ExprId, bounds: &mut TimeBounds) {
    let Expr::Binary { op, left, right } = arena.get(id) else { return };
    if *op == BinaryOp::And {
        extract_time_bounds(arena, *left, bounds);
        extract_time_bounds(arena, *right, bounds);
        return;
    }
    if let Some((value, op)) = as_time_comparison(arena, *op, *left, *right) {
        apply_bound(bounds, op, value);
    }
}

/// Normalizes `time <op> N` and `N <op> time` to the same `(op, N)` shape
/// with `op` always read as "time `op` N".
fn as_time_comparison(arena: &Arena<Expr>, op: BinaryOp, left: ExprId, right: ExprId) -> Option<(i64, BinaryOp)> {
    if is_time_identifier(arena, left) {
        integer_literal(arena, right).map(|v| (v, op))
    } else if is_time_identifier(arena, right) {
        integer_literal(arena, left).map(|v| (v, swap_sides(op)))
    } else {
        None
    }
}

fn swap_sides(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::Le => BinaryOp::Ge,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::Ge => BinaryOp::Le,
        other => other,
    }
}

fn apply_bound(bounds: &mut TimeBounds, op: BinaryOp, value: i64) {
    match op {
        BinaryOp::Gt => bounds.tighten_min(value, false),
        BinaryOp::Ge => bounds.tighten_min(value, true),
        BinaryOp::Lt => bounds.tighten_max(value, false),
        BinaryOp::Le => bounds.tighten_max(value, true),
        BinaryOp::Eq => {
            bounds.tighten_min(value, true);
            bounds.tighten_max(value, true);
        }
        _ => {}
    }
}

fn is_time_identifier(arena: &Arena<Expr>, id: ExprId) -> bool {
    matches!(arena.get(id), Expr::Identifier(Identifier { value, .. }) if value.rsplit('.').next().unwrap_or(value).eq_ignore_ascii_case("time"))
}

fn integer_literal(arena: &Arena<Expr>, id: ExprId) -> Option<i64> {
    match arena.get(id) {
        Expr::Literal(Literal::Integer(n)) => Some(*n),
        Expr::Literal(Literal::Float(f)) => Some(*f as i64),
        _ => None,
    }
}

fn is_identity_projection(items: &[ProjectItem], arena: &Arena<Expr>) -> bool {
    items.iter().all(|item| match arena.get(item.expr) {
        Expr::Identifier(id) => id.value.eq_ignore_ascii_case(&item.name),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::logical::build;
    use crate::query::optimizer::optimize;
    use crate::query::parser::parse;

    #[test]
    fn lower_bound_is_extracted_from_a_gt_predicate() {
        let mut parsed = parse("select value from metrics where time > 100").unwrap();
        let logical = optimize(build(&parsed).unwrap(), &mut parsed.arena);
        let physical = plan(logical, &parsed.arena);
        let bounds = find_scan_bounds(&physical);
        assert_eq!(bounds.min, Some(100));
        assert!(!bounds.min_inclusive);
    }

    #[test]
    fn swapped_side_predicate_still_extracts_correctly() {
        let mut parsed = parse("select value from metrics where 100 < time").unwrap();
        let logical = optimize(build(&parsed).unwrap(), &mut parsed.arena);
        let physical = plan(logical, &parsed.arena);
        let bounds = find_scan_bounds(&physical);
        assert_eq!(bounds.min, Some(100));
        assert!(!bounds.min_inclusive);
    }

    #[test]
    fn tighter_of_two_conjuncts_wins() {
        let mut parsed = parse("select value from metrics where time > 100 && time > 200").unwrap();
        let logical = build(&parsed).unwrap();
        let physical = plan(logical, &parsed.arena);
        let bounds = find_scan_bounds(&physical);
        assert_eq!(bounds.min, Some(200));
    }

    #[test]
    fn limit_over_sort_collapses_into_a_limit_hint() {
        let mut parsed = parse("select value from metrics where time > 0 order by time limit 5 offset 2").unwrap();
        let logical = build(&parsed).unwrap();
        let physical = plan(logical, &parsed.arena);
        fn find_sort(p: &PhysicalPlan) -> Option<&PhysicalPlan> {
            match p {
                PhysicalPlan::Sort { .. } => Some(p),
                PhysicalPlan::Filter { input, .. }
                | PhysicalPlan::Project { input, .. }
                | PhysicalPlan::Aggregate { input, .. }
                | PhysicalPlan::Limit { input, .. } => find_sort(input),
                PhysicalPlan::Scan { .. } | PhysicalPlan::OneRow => None,
            }
        }
        match find_sort(&physical).unwrap() {
            PhysicalPlan::Sort { limit_hint, .. } => {
                assert_eq!(*limit_hint, Some(LimitHint { offset: 2, take: 5 }));
            }
            _ => unreachable!(),
        }
    }

    fn find_scan_bounds(plan: &PhysicalPlan) -> TimeBounds {
        match plan {
            PhysicalPlan::Scan { time_bounds, .. } => *time_bounds,
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Project { input, .. }
            | PhysicalPlan::Aggregate { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. } => find_scan_bounds(input),
            PhysicalPlan::OneRow => TimeBounds::default(),
        }
    }
}
