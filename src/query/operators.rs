use std::cmp::Ordering;
use std::time::Instant;

use thiserror::Error;

use crate::query::arena::Arena;
use crate::query::ast::{structurally_equal, Expr, ExprId, SeriesRef};
use crate::query::eval::{evaluate, EvalError, Resolver, Value};
use crate::query::logical::{AggregateItem, ProjectItem, SortItem};
use crate::query::physical::LimitHint;
use crate::storage::engine::Engine;
use crate::types::Point;

#[derive(Error, Debug, PartialEq)]
pub enum ExecutionError {
    #[error("unsupported plan: {0}")]
    UnsupportedPlan(String),
    #[error("unsupported aggregate function: {0}")]
    UnsupportedAggregate(String),
    #[error("unsupported expression")]
    UnsupportedExpression,
    #[error("division by zero")]
    DivisionByZero,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<EvalError> for ExecutionError {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::TypeMismatch => ExecutionError::TypeMismatch,
            EvalError::UnsupportedExpression => ExecutionError::UnsupportedExpression,
            EvalError::DivisionByZero => ExecutionError::DivisionByZero,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct OperatorStats {
    pub name: &'static str,
    pub rows_emitted: u64,
    pub elapsed_ns: u64,
}

pub trait Operator {
    fn schema(&self) -> &[String];
    fn next(&mut self) -> Result<Option<Row>, ExecutionError>;
    fn destroy(&mut self) {}
    fn stats(&self) -> OperatorStats;
    fn children(&self) -> Vec<&dyn Operator> {
        Vec::new()
    }
}

/// Walks the operator tree post-order so every child's stats precede its
/// parent's, matching the order operators are torn down in.
pub fn collect_stats(op: &dyn Operator, out: &mut Vec<OperatorStats>) {
    for child in op.children() {
        collect_stats(child, out);
    }
    out.push(op.stats());
}

struct RowResolver<'a> {
    schema: &'a [String],
    row: &'a Row,
}

impl<'a> Resolver for RowResolver<'a> {
    fn resolve(&self, name: &str) -> Option<Value> {
        let trailing = name.rsplit('.').next().unwrap_or(name);
        self.schema
            .iter()
            .position(|c| c.eq_ignore_ascii_case(trailing) || c.eq_ignore_ascii_case(name))
            .map(|i| self.row.values[i].clone())
    }
}

fn eval_against_row(arena: &Arena<Expr>, expr: ExprId, schema: &[String], row: &Row) -> Result<Value, ExecutionError> {
    let resolver = RowResolver { schema, row };
    Ok(evaluate(arena, expr, &resolver)?)
}

/// Yields every point between a scan's time bounds for a single series
/// selected by raw id. Name-based selection is not implemented; inclusivity
/// of the bounds is not re-checked here since the storage layer's range read
/// is already bounds-inclusive on both ends.
pub struct Scan {
    schema: Vec<String>,
    points: Vec<Point>,
    idx: usize,
    rows_emitted: u64,
    elapsed_ns: u64,
}

impl Scan {
    pub fn new(
        engine: &Engine,
        series: &SeriesRef,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Result<Self, ExecutionError> {
        let series_id = match series {
            SeriesRef::ById(id) => *id,
            SeriesRef::Name(name) => {
                return Err(ExecutionError::UnsupportedPlan(format!(
                    "series selection by name ('{}') is not supported; use by_id(<id>)",
                    name.value
                )))
            }
        };
        let mut points = Vec::new();
        engine
            .query_range(series_id, min.unwrap_or(i64::MIN), max.unwrap_or(i64::MAX), &mut points)
            .map_err(|e| ExecutionError::Storage(e.to_string()))?;
        points.sort_by_key(|p| p.ts);
        Ok(Self {
            schema: vec!["time".to_string(), "value".to_string()],
            points,
            idx: 0,
            rows_emitted: 0,
            elapsed_ns: 0,
        })
    }
}

impl Operator for Scan {
    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        let start = Instant::now();
        let result = if self.idx < self.points.len() {
            let point = &self.points[self.idx];
            self.idx += 1;
            Some(Row { values: vec![Value::Integer(point.ts), Value::Float(point.value)] })
        } else {
            None
        };
        self.elapsed_ns += start.elapsed().as_nanos() as u64;
        if result.is_some() {
            self.rows_emitted += 1;
        }
        Ok(result)
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "scan", rows_emitted: self.rows_emitted, elapsed_ns: self.elapsed_ns }
    }
}

/// A zero-input root for queries with no `FROM` clause: one empty row, then
/// done.
pub struct OneRow {
    schema: Vec<String>,
    emitted: bool,
    rows_emitted: u64,
}

impl OneRow {
    pub fn new() -> Self {
        Self { schema: Vec::new(), emitted: false, rows_emitted: 0 }
    }
}

impl Default for OneRow {
    fn default() -> Self {
        Self::new()
    }
}

impl Operator for OneRow {
    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        if self.emitted {
            return Ok(None);
        }
        self.emitted = true;
        self.rows_emitted += 1;
        Ok(Some(Row { values: Vec::new() }))
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "one_row", rows_emitted: self.rows_emitted, elapsed_ns: 0 }
    }
}

pub struct Filter<'a> {
    input: Box<dyn Operator + 'a>,
    predicate: ExprId,
    arena: &'a Arena<Expr>,
    rows_emitted: u64,
    elapsed_ns: u64,
}

impl<'a> Filter<'a> {
    pub fn new(input: Box<dyn Operator + 'a>, predicate: ExprId, arena: &'a Arena<Expr>) -> Self {
        Self { input, predicate, arena, rows_emitted: 0, elapsed_ns: 0 }
    }
}

impl<'a> Operator for Filter<'a> {
    fn schema(&self) -> &[String] {
        self.input.schema()
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        let start = Instant::now();
        let result = loop {
            match self.input.next()? {
                None => break None,
                Some(row) => {
                    let schema = self.input.schema().to_vec();
                    if eval_against_row(self.arena, self.predicate, &schema, &row)?.is_truthy_for_filter() {
                        break Some(row);
                    }
                }
            }
        };
        self.elapsed_ns += start.elapsed().as_nanos() as u64;
        if result.is_some() {
            self.rows_emitted += 1;
        }
        Ok(result)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "filter", rows_emitted: self.rows_emitted, elapsed_ns: self.elapsed_ns }
    }

    fn children(&self) -> Vec<&dyn Operator> {
        vec![self.input.as_ref()]
    }
}

trait TruthyForFilter {
    fn is_truthy_for_filter(&self) -> bool;
}

impl TruthyForFilter for Value {
    fn is_truthy_for_filter(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }
}

pub struct Project<'a> {
    input: Box<dyn Operator + 'a>,
    items: Vec<ProjectItem>,
    arena: &'a Arena<Expr>,
    schema: Vec<String>,
    rows_emitted: u64,
    elapsed_ns: u64,
}

impl<'a> Project<'a> {
    pub fn new(input: Box<dyn Operator + 'a>, items: Vec<ProjectItem>, arena: &'a Arena<Expr>) -> Self {
        let schema = items.iter().map(|i| i.name.clone()).collect();
        Self { input, items, arena, schema, rows_emitted: 0, elapsed_ns: 0 }
    }
}

impl<'a> Operator for Project<'a> {
    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        let start = Instant::now();
        let result = match self.input.next()? {
            None => None,
            Some(row) => {
                let input_schema = self.input.schema().to_vec();
                let mut values = Vec::with_capacity(self.items.len());
                for item in &self.items {
                    values.push(eval_against_row(self.arena, item.expr, &input_schema, &row)?);
                }
                Some(Row { values })
            }
        };
        self.elapsed_ns += start.elapsed().as_nanos() as u64;
        if result.is_some() {
            self.rows_emitted += 1;
        }
        Ok(result)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "project", rows_emitted: self.rows_emitted, elapsed_ns: self.elapsed_ns }
    }

    fn children(&self) -> Vec<&dyn Operator> {
        vec![self.input.as_ref()]
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ValueKey {
    Integer(i64),
    FloatBits(u64),
    Str(String),
    Boolean(bool),
    Null,
}

fn value_key(v: &Value) -> ValueKey {
    match v {
        Value::Integer(n) => ValueKey::Integer(*n),
        Value::Float(f) => ValueKey::FloatBits(f.to_bits()),
        Value::Str(s) => ValueKey::Str(s.clone()),
        Value::Boolean(b) => ValueKey::Boolean(*b),
        Value::Null => ValueKey::Null,
    }
}

#[derive(Clone, Copy)]
enum AggKind {
    Sum,
    Avg,
    Count,
}

fn agg_kind(name: &str) -> Option<AggKind> {
    if name.eq_ignore_ascii_case("sum") {
        Some(AggKind::Sum)
    } else if name.eq_ignore_ascii_case("avg") {
        Some(AggKind::Avg)
    } else if name.eq_ignore_ascii_case("count") {
        Some(AggKind::Count)
    } else {
        None
    }
}

#[derive(Default, Clone, Copy)]
struct AggAccumulator {
    sum: f64,
    count: u64,
}

impl AggAccumulator {
    fn add(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn finish(&self, kind: AggKind) -> Value {
        match kind {
            AggKind::Sum => Value::Float(self.sum),
            AggKind::Avg => Value::Float(if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }),
            AggKind::Count => Value::Integer(self.count as i64),
        }
    }
}

/// Either a real aggregate call (with an optional argument — `count()` takes
/// none, counting every row in the group) or an output column that is
/// exactly a grouping expression, passed through from the group's key.
enum OutputSpec {
    Agg(AggKind, Option<ExprId>),
    GroupKey(usize),
}

fn resolve_output_spec(
    arena: &Arena<Expr>,
    expr: ExprId,
    group_by: &[ExprId],
) -> Result<OutputSpec, ExecutionError> {
    if let Some(i) = group_by.iter().position(|&g| structurally_equal(arena, expr, g)) {
        return Ok(OutputSpec::GroupKey(i));
    }
    match arena.get(expr) {
        Expr::Call { name, args } => {
            let kind = agg_kind(name).ok_or_else(|| ExecutionError::UnsupportedAggregate(name.clone()))?;
            match args.first() {
                Some(&arg) => Ok(OutputSpec::Agg(kind, Some(arg))),
                None if matches!(kind, AggKind::Count) => Ok(OutputSpec::Agg(kind, None)),
                None => Err(ExecutionError::UnsupportedExpression),
            }
        }
        _ => Err(ExecutionError::UnsupportedExpression),
    }
}

/// Materializes the full input before emitting grouped rows — aggregation
/// is inherently blocking, so this is the one operator that isn't a pure
/// pipeline stage.
pub struct Aggregate<'a> {
    schema: Vec<String>,
    output: Vec<Row>,
    idx: usize,
    rows_emitted: u64,
    elapsed_ns: u64,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> Aggregate<'a> {
    pub fn new(
        mut input: Box<dyn Operator + 'a>,
        group_by: Vec<ExprId>,
        aggregates: Vec<AggregateItem>,
        arena: &'a Arena<Expr>,
    ) -> Result<Self, ExecutionError> {
        let specs: Vec<OutputSpec> = aggregates
            .iter()
            .map(|item| resolve_output_spec(arena, item.expr, &group_by))
            .collect::<Result<_, ExecutionError>>()?;

        let mut groups: Vec<(Vec<ValueKey>, Vec<Value>, Vec<AggAccumulator>)> = Vec::new();
        let input_schema = input.schema().to_vec();

        while let Some(row) = input.next()? {
            let mut key_values = Vec::with_capacity(group_by.len());
            for &g in &group_by {
                key_values.push(eval_against_row(arena, g, &input_schema, &row)?);
            }
            let key: Vec<ValueKey> = key_values.iter().map(value_key).collect();
            let group = match groups.iter_mut().find(|(k, _, _)| *k == key) {
                Some(g) => g,
                None => {
                    groups.push((key, key_values, vec![AggAccumulator::default(); specs.len()]));
                    groups.last_mut().unwrap()
                }
            };
            for (acc, spec) in group.2.iter_mut().zip(specs.iter()) {
                if let OutputSpec::Agg(_, arg) = spec {
                    match arg {
                        Some(arg) => {
                            let value = eval_against_row(arena, *arg, &input_schema, &row)?;
                            if let Ok(f) = value_as_f64(&value) {
                                acc.add(f);
                            }
                        }
                        None => acc.add(0.0),
                    }
                }
            }
        }
        input.destroy();

        let schema: Vec<String> = aggregates.iter().map(|a| a.name.clone()).collect();
        let output = groups
            .into_iter()
            .map(|(_, key_values, accs)| Row {
                values: accs
                    .into_iter()
                    .zip(specs.iter())
                    .map(|(acc, spec)| match spec {
                        OutputSpec::Agg(kind, _) => acc.finish(*kind),
                        OutputSpec::GroupKey(i) => key_values[*i].clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(Self { schema, output, idx: 0, rows_emitted: 0, elapsed_ns: 0, _marker: std::marker::PhantomData })
    }
}

fn value_as_f64(v: &Value) -> Result<f64, ExecutionError> {
    match v {
        Value::Integer(n) => Ok(*n as f64),
        Value::Float(f) => Ok(*f),
        _ => Err(ExecutionError::TypeMismatch),
    }
}

impl<'a> Operator for Aggregate<'a> {
    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        let start = Instant::now();
        let result = if self.idx < self.output.len() {
            let row = self.output[self.idx].clone();
            self.idx += 1;
            Some(row)
        } else {
            None
        };
        self.elapsed_ns += start.elapsed().as_nanos() as u64;
        if result.is_some() {
            self.rows_emitted += 1;
        }
        Ok(result)
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "aggregate", rows_emitted: self.rows_emitted, elapsed_ns: self.elapsed_ns }
    }
}

pub struct Sort<'a> {
    input: Option<Box<dyn Operator + 'a>>,
    items: Vec<SortItem>,
    arena: &'a Arena<Expr>,
    schema: Vec<String>,
    buffered: Vec<Row>,
    idx: usize,
    materialized: bool,
    limit_hint: Option<LimitHint>,
    rows_emitted: u64,
    elapsed_ns: u64,
}

impl<'a> Sort<'a> {
    pub fn new(
        input: Box<dyn Operator + 'a>,
        items: Vec<SortItem>,
        arena: &'a Arena<Expr>,
        limit_hint: Option<LimitHint>,
    ) -> Self {
        let schema = input.schema().to_vec();
        Self {
            input: Some(input),
            items,
            arena,
            schema,
            buffered: Vec::new(),
            idx: 0,
            materialized: false,
            limit_hint,
            rows_emitted: 0,
            elapsed_ns: 0,
        }
    }

    fn materialize(&mut self) -> Result<(), ExecutionError> {
        let mut input = self.input.take().expect("materialize called once");
        let schema = input.schema().to_vec();
        let mut rows = Vec::new();
        while let Some(row) = input.next()? {
            rows.push(row);
        }
        input.destroy();

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut row_keys = Vec::with_capacity(self.items.len());
            for item in &self.items {
                row_keys.push(eval_against_row(self.arena, item.expr, &schema, row)?);
            }
            keys.push(row_keys);
        }

        let mut order: Vec<usize> = (0..rows.len()).collect();
        order.sort_by(|&a, &b| compare_rows(&keys[a], &keys[b], &self.items));

        let sliced: Vec<usize> = if let Some(hint) = self.limit_hint {
            order
                .into_iter()
                .skip(hint.offset as usize)
                .take(hint.take as usize)
                .collect()
        } else {
            order
        };

        self.buffered = sliced.into_iter().map(|i| rows[i].clone()).collect();
        self.materialized = true;
        Ok(())
    }
}

fn compare_rows(a: &[Value], b: &[Value], items: &[SortItem]) -> Ordering {
    for (i, item) in items.iter().enumerate() {
        let ord = compare_values(&a[i], &b[i]);
        let ord = if item.desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// NULLs sort first; numbers compare numerically; everything else falls
/// back to lexical string comparison.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        _ => match (value_as_f64(a), value_as_f64(b)) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
    }
}

impl<'a> Operator for Sort<'a> {
    fn schema(&self) -> &[String] {
        &self.schema
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        if !self.materialized {
            self.materialize()?;
        }
        let start = Instant::now();
        let result = if self.idx < self.buffered.len() {
            let row = self.buffered[self.idx].clone();
            self.idx += 1;
            Some(row)
        } else {
            None
        };
        self.elapsed_ns += start.elapsed().as_nanos() as u64;
        if result.is_some() {
            self.rows_emitted += 1;
        }
        Ok(result)
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "sort", rows_emitted: self.rows_emitted, elapsed_ns: self.elapsed_ns }
    }
}

pub struct Limit<'a> {
    input: Box<dyn Operator + 'a>,
    remaining_offset: u64,
    remaining_limit: Option<u64>,
    rows_emitted: u64,
    elapsed_ns: u64,
}

impl<'a> Limit<'a> {
    pub fn new(input: Box<dyn Operator + 'a>, limit: Option<u64>, offset: u64) -> Self {
        Self { input, remaining_offset: offset, remaining_limit: limit, rows_emitted: 0, elapsed_ns: 0 }
    }
}

impl<'a> Operator for Limit<'a> {
    fn schema(&self) -> &[String] {
        self.input.schema()
    }

    fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
        let start = Instant::now();
        if self.remaining_limit == Some(0) {
            self.elapsed_ns += start.elapsed().as_nanos() as u64;
            return Ok(None);
        }
        let result = loop {
            match self.input.next()? {
                None => break None,
                Some(row) => {
                    if self.remaining_offset > 0 {
                        self.remaining_offset -= 1;
                        continue;
                    }
                    if let Some(limit) = &mut self.remaining_limit {
                        *limit -= 1;
                    }
                    break Some(row);
                }
            }
        };
        self.elapsed_ns += start.elapsed().as_nanos() as u64;
        if result.is_some() {
            self.rows_emitted += 1;
        }
        Ok(result)
    }

    fn destroy(&mut self) {
        self.input.destroy();
    }

    fn stats(&self) -> OperatorStats {
        OperatorStats { name: "limit", rows_emitted: self.rows_emitted, elapsed_ns: self.elapsed_ns }
    }

    fn children(&self) -> Vec<&dyn Operator> {
        vec![self.input.as_ref()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::logical::build;
    use crate::query::optimizer::optimize;
    use crate::query::parser::parse;
    use crate::query::physical::{plan, PhysicalPlan};

    struct VecOperator {
        schema: Vec<String>,
        rows: std::vec::IntoIter<Row>,
    }

    impl VecOperator {
        fn new(schema: Vec<String>, rows: Vec<Row>) -> Self {
            Self { schema, rows: rows.into_iter() }
        }
    }

    impl Operator for VecOperator {
        fn schema(&self) -> &[String] {
            &self.schema
        }

        fn next(&mut self) -> Result<Option<Row>, ExecutionError> {
            Ok(self.rows.next())
        }

        fn stats(&self) -> OperatorStats {
            OperatorStats { name: "vec", rows_emitted: 0, elapsed_ns: 0 }
        }
    }

    fn build_aggregate(query: &str, rows: Vec<Row>, schema: Vec<String>) -> Aggregate<'static> {
        let mut parsed = Box::leak(Box::new(parse(query).unwrap()));
        let logical = optimize(build(parsed).unwrap(), &mut parsed.arena);
        let physical = plan(logical, &parsed.arena);
        match physical {
            PhysicalPlan::Aggregate { group_by, aggregates, .. } => {
                let input: Box<dyn Operator> = Box::new(VecOperator::new(schema, rows));
                Aggregate::new(input, group_by, aggregates, &parsed.arena).unwrap()
            }
            _ => panic!("expected aggregate plan"),
        }
    }

    #[test]
    fn count_with_no_args_counts_every_row_in_the_group() {
        let rows = vec![
            Row { values: vec![Value::Integer(0), Value::Float(1.0)] },
            Row { values: vec![Value::Integer(0), Value::Float(2.0)] },
            Row { values: vec![Value::Integer(0), Value::Float(3.0)] },
        ];
        let mut agg = build_aggregate(
            "select count() from metrics where time > 0",
            rows,
            vec!["time".to_string(), "value".to_string()],
        );
        let row = agg.next().unwrap().unwrap();
        assert_eq!(row.values[0], Value::Integer(3));
        assert!(agg.next().unwrap().is_none());
    }

    #[test]
    fn output_column_matching_a_grouping_expression_passes_through_the_key() {
        let rows = vec![
            Row { values: vec![Value::Integer(0), Value::Float(1.0)] },
            Row { values: vec![Value::Integer(0), Value::Float(3.0)] },
            Row { values: vec![Value::Integer(60), Value::Float(5.0)] },
        ];
        let mut agg = build_aggregate(
            "select time_bucket(60, time), avg(value) from metrics where time >= 0 group by time_bucket(60, time)",
            rows,
            vec!["time".to_string(), "value".to_string()],
        );
        let mut seen = Vec::new();
        while let Some(row) = agg.next().unwrap() {
            seen.push((row.values[0].clone(), row.values[1].clone()));
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&(Value::Integer(0), Value::Float(2.0))));
        assert!(seen.contains(&(Value::Integer(60), Value::Float(5.0))));
    }
}
