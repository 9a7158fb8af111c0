use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::query::arena::Arena;
use crate::query::ast::{Expr, ParsedQuery};
use crate::query::functions::FunctionRegistry;
use crate::query::logical::{self, LogicalError};
use crate::query::operators::{
    self, collect_stats, Aggregate, ExecutionError, Filter, Limit, Operator, OneRow, Project, Scan, Sort,
};
use crate::query::optimizer::optimize;
use crate::query::parser::{self, ParseError};
use crate::query::physical::{self, PhysicalPlan};
use crate::query::validator::{validate, Diagnostic};
use crate::storage::engine::Engine;

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("validation failed: {0:?}")]
    ValidationFailed(Vec<Diagnostic>),
    #[error("plan error: {0}")]
    Build(#[from] LogicalError),
    #[error("execution error: {0}")]
    Execute(#[from] ExecutionError),
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub trace_id: String,
    pub parse_us: u64,
    pub validate_us: u64,
    pub optimize_us: u64,
    pub physical_us: u64,
    pub build_pipeline_us: u64,
    pub operator_stats: Vec<OperatorStatsRecord>,
}

#[derive(Debug, Clone)]
pub struct OperatorStatsRecord {
    pub name: &'static str,
    pub rows_emitted: u64,
    pub elapsed_ns: u64,
}

impl std::fmt::Display for ExecutionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trace={} parse={}us validate={}us optimize={}us physical={}us pipeline={}us",
            self.trace_id, self.parse_us, self.validate_us, self.optimize_us, self.physical_us, self.build_pipeline_us
        )
    }
}

pub fn generate_trace_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    encode_base32(&bytes)
}

/// Maps each of the 16 random bytes to a single base-32 symbol, yielding a
/// 16-character trace id (not a full base32 encoding of the bytes).
fn encode_base32(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        out.push(BASE32_ALPHABET[(byte & 0x1F) as usize] as char);
    }
    out
}

pub struct ExecutionCursor<'a> {
    operator: Box<dyn Operator + 'a>,
    columns: Vec<String>,
    #[allow(dead_code)]
    arena: Box<Arena<Expr>>,
    stats: ExecutionStats,
}

impl<'a> std::fmt::Debug for ExecutionCursor<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCursor")
            .field("columns", &self.columns)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'a> ExecutionCursor<'a> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn next(&mut self) -> Result<Option<operators::Row>, ExecutionError> {
        self.operator.next()
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn deinit(mut self) {
        self.operator.destroy();
        let mut records = Vec::new();
        collect_stats(self.operator.as_ref(), &mut records);
        self.stats.operator_stats = records
            .into_iter()
            .map(|s| OperatorStatsRecord { name: s.name, rows_emitted: s.rows_emitted, elapsed_ns: s.elapsed_ns })
            .collect();
    }
}

/// Parses, validates, plans, and builds a streaming operator pipeline for
/// one query. Every stage is timed; validation failures short-circuit
/// before any storage access happens.
pub fn execute<'a>(engine: &'a Engine, query_text: &str) -> Result<ExecutionCursor<'a>, ExecuteError> {
    let trace_id = generate_trace_id();

    let parse_start = Instant::now();
    let parsed: ParsedQuery = parser::parse(query_text)?;
    let parse_us = parse_start.elapsed().as_micros() as u64;

    let validate_start = Instant::now();
    let functions = FunctionRegistry::with_builtins();
    let validation = validate(&parsed, &functions);
    let validate_us = validate_start.elapsed().as_micros() as u64;
    if !validation.is_valid() {
        return Err(ExecuteError::ValidationFailed(validation.diagnostics));
    }

    let logical = logical::build(&parsed)?;

    let optimize_start = Instant::now();
    let ParsedQuery { arena, statement: _, span: _ } = parsed;
    let mut arena = Box::new(arena);
    let optimized = optimize(logical, &mut arena);
    let optimize_us = optimize_start.elapsed().as_micros() as u64;

    let physical_start = Instant::now();
    let physical = physical::plan(optimized, &arena);
    let physical_us = physical_start.elapsed().as_micros() as u64;

    // SAFETY: `arena` is heap-allocated via `Box`, so its contents live at a
    // stable address that outlives this function frame; moving the `Box`
    // into `ExecutionCursor` below does not invalidate this reference. The
    // cursor owns both the arena and everything that borrows from it (per
    // spec: "the cursor owns the arena"), so the borrow is valid for as
    // long as the `ExecutionCursor` itself, i.e. `'a`.
    let arena_ref: &'a Arena<Expr> = unsafe { &*(arena.as_ref() as *const Arena<Expr>) };

    let pipeline_start = Instant::now();
    let columns = physical_columns(&physical);
    let operator = build_operator(physical, engine, arena_ref)?;
    let build_pipeline_us = pipeline_start.elapsed().as_micros() as u64;

    Ok(ExecutionCursor {
        operator,
        columns,
        arena,
        stats: ExecutionStats {
            trace_id,
            parse_us,
            validate_us,
            optimize_us,
            physical_us,
            build_pipeline_us,
            operator_stats: Vec::new(),
        },
    })
}

fn physical_columns(plan: &PhysicalPlan) -> Vec<String> {
    match plan {
        PhysicalPlan::OneRow => Vec::new(),
        PhysicalPlan::Scan { schema, .. } => schema.columns.clone(),
        PhysicalPlan::Filter { input, .. } => physical_columns(input),
        PhysicalPlan::Aggregate { aggregates, .. } => aggregates.iter().map(|a| a.name.clone()).collect(),
        PhysicalPlan::Project { items, .. } => items.iter().map(|i| i.name.clone()).collect(),
        PhysicalPlan::Sort { input, .. } => physical_columns(input),
        PhysicalPlan::Limit { input, .. } => physical_columns(input),
    }
}

fn build_operator<'a>(
    plan: PhysicalPlan,
    engine: &'a Engine,
    arena: &'a Arena<Expr>,
) -> Result<Box<dyn Operator + 'a>, ExecutionError> {
    Ok(match plan {
        PhysicalPlan::OneRow => Box::new(OneRow::new()),
        PhysicalPlan::Scan { series, time_bounds, .. } => {
            Box::new(Scan::new(engine, &series, time_bounds.min, time_bounds.max)?)
        }
        PhysicalPlan::Filter { input, predicate } => {
            Box::new(Filter::new(build_operator(*input, engine, arena)?, predicate, arena))
        }
        PhysicalPlan::Aggregate { input, group_by, aggregates, .. } => Box::new(Aggregate::new(
            build_operator(*input, engine, arena)?,
            group_by,
            aggregates,
            arena,
        )?),
        PhysicalPlan::Project { input, items, reuse_child_schema } => {
            let child = build_operator(*input, engine, arena)?;
            if reuse_child_schema {
                child
            } else {
                Box::new(Project::new(child, items, arena))
            }
        }
        PhysicalPlan::Sort { input, items, limit_hint, .. } => {
            Box::new(Sort::new(build_operator(*input, engine, arena)?, items, arena, limit_hint))
        }
        PhysicalPlan::Limit { input, limit, offset } => {
            Box::new(Limit::new(build_operator(*input, engine, arena)?, limit, offset))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FsyncPolicy};
    use crate::storage::engine::IngestItem;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> Engine {
        let config = Config::default()
            .with_data_dir(dir.to_path_buf())
            .with_fsync_policy(FsyncPolicy::None)
            .with_memtable_max_bytes(1 << 30)
            .with_flush_interval_ms(3_600_000);
        Engine::init(config).unwrap()
    }

    #[test]
    fn base32_trace_id_is_16_characters_from_the_expected_alphabet() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 16);
        assert!(id.bytes().all(|b| BASE32_ALPHABET.contains(&b)));
    }

    #[test]
    fn select_literal_with_no_from_returns_a_single_row() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let mut cursor = execute(&engine, "select 1 + 1 as two").unwrap();
        let row = cursor.next().unwrap().unwrap();
        assert_eq!(row.values.len(), 1);
        assert!(cursor.next().unwrap().is_none());
        cursor.deinit();
        engine.deinit();
    }

    #[test]
    fn select_without_time_predicate_fails_validation() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let err = execute(&engine, "select value from by_id(1)").unwrap_err();
        assert!(matches!(err, ExecuteError::ValidationFailed(_)));
        engine.deinit();
    }

    #[test]
    fn name_based_series_selection_is_unsupported() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        let err = execute(&engine, "select value from metrics where time > 0").unwrap_err();
        assert!(matches!(err, ExecuteError::Execute(ExecutionError::UnsupportedPlan(_))));
        engine.deinit();
    }

    #[test]
    fn scans_ingested_points_in_time_order() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        for (ts, value) in [(1, 1.0), (2, 2.0), (3, 3.0)] {
            engine
                .ingest(IngestItem { series_id: 7, ts, value, tags_json: None })
                .unwrap();
        }
        sleep(Duration::from_millis(50));

        let mut cursor = execute(&engine, "select value from by_id(7) where time > 0").unwrap();
        let mut values = Vec::new();
        while let Some(row) = cursor.next().unwrap() {
            values.push(row.values[0].clone());
        }
        cursor.deinit();
        assert_eq!(values.len(), 3);
        engine.deinit();
    }
}
