//! Pipeline planning and execution.
//!
//! The first `search` stage and the time range are pushed down into the
//! index engine; every later stage streams over the materialized results in
//! memory. Executions carry a deadline and go through the search cache.

use super::ast::*;
use super::parser::parse_pipeline;
use crate::cache::SearchCache;
use crate::core::config::QueryConfig;
use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{LogEntry, LogId, TimeRange};
use crate::index::plan::{PlanNode, SearchPlan};
use crate::index::{IndexEngine, SearchHits};
use crate::partition::PartitionManager;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Final shape of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Entries(Vec<LogEntry>),
    Stats(BTreeMap<String, u64>),
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub output: QueryOutput,
    pub total: usize,
    pub warnings: Vec<String>,
}

/// One page of plain search results, with the histogram the search endpoint
/// renders.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub results: Vec<LogEntry>,
    pub total: usize,
    pub time_slots: Vec<(i64, u64)>,
    pub warnings: Vec<String>,
}

const DEADLINE_CHECK_EVERY: usize = 1024;
const HISTOGRAM_SLOTS: i64 = 50;

pub struct QueryExecutor {
    engine: Arc<IndexEngine>,
    manager: Arc<PartitionManager>,
    cache: Arc<SearchCache<Arc<QueryResult>>>,
    config: QueryConfig,
}

impl QueryExecutor {
    pub fn new(
        engine: Arc<IndexEngine>,
        manager: Arc<PartitionManager>,
        cache: Arc<SearchCache<Arc<QueryResult>>>,
        config: QueryConfig,
    ) -> Self {
        Self {
            engine,
            manager,
            cache,
            config,
        }
    }

    pub fn engine(&self) -> &Arc<IndexEngine> {
        &self.engine
    }

    /// Execute a full SPL pipeline over a time range.
    pub async fn execute(&self, spl: &str, range: TimeRange) -> Result<QueryResult> {
        let deadline = Instant::now() + self.config.timeout;
        let (pipeline, mut warnings) = parse_pipeline(spl)?;

        // Archived partitions intersecting the range come back first.
        warnings.extend(self.manager.ensure_range_available(&range));

        let fingerprint = format!(
            "{}|{}..{}|v{:016x}",
            pipeline,
            range.start_ms,
            range.end_ms,
            self.engine.range_version(&range)
        );
        let partitions = self.engine.partition_keys_for_range(&range);

        let engine = self.engine.clone();
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let cached = self
            .cache
            .get_or_build(&fingerprint, partitions, || async move {
                run_pipeline(&engine, &pipeline, range, deadline, timeout_ms).map(Arc::new)
            })
            .await?;

        warnings.extend(cached.warnings.iter().cloned());
        Ok(QueryResult {
            output: cached.output.clone(),
            total: cached.total,
            warnings,
        })
    }

    /// Plain criteria search with paging and a time-slot histogram, for the
    /// search endpoint. `q` is criteria only (no pipes).
    pub async fn search_page(
        &self,
        q: &str,
        range: TimeRange,
        size: usize,
        page: usize,
    ) -> Result<SearchPage> {
        let deadline = Instant::now() + self.config.timeout;
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let criteria = if q.trim().is_empty() { "*" } else { q.trim() };
        let (pipeline, _) = parse_pipeline(&format!("search {}", criteria))?;
        let expr = match pipeline.stages.as_slice() {
            [Stage::Search(expr)] => expr.clone(),
            _ => {
                return Err(GrepWiseError::syntax(
                    "the search endpoint accepts criteria only; use the SPL endpoint for pipelines",
                ))
            },
        };

        let mut warnings = self.manager.ensure_range_available(&range);
        let node = compile_expr(&expr);
        let plan = SearchPlan::new(node, range).with_limit(size.saturating_mul(page + 1));
        let hits = self.engine.search(&plan)?;
        warnings.extend(hits.warnings.iter().cloned());
        let total = hits.total;
        let entries = drain_stream(hits, deadline, timeout_ms)?;
        let results: Vec<LogEntry> = entries
            .into_iter()
            .skip(size.saturating_mul(page))
            .take(size)
            .collect();

        let timestamps = self.engine.match_timestamps(&plan)?;
        let time_slots = histogram(&timestamps, &range);

        Ok(SearchPage {
            results,
            total,
            time_slots,
            warnings,
        })
    }

    /// Total match count for plain criteria.
    pub async fn count(&self, q: &str, range: TimeRange) -> Result<usize> {
        let criteria = if q.trim().is_empty() { "*" } else { q.trim() };
        let (pipeline, _) = parse_pipeline(&format!("search {}", criteria))?;
        let expr = match pipeline.stages.as_slice() {
            [Stage::Search(expr)] => expr.clone(),
            _ => return Err(GrepWiseError::syntax("count accepts criteria only")),
        };
        self.manager.ensure_range_available(&range);
        self.engine.count(&SearchPlan::new(compile_expr(&expr), range))
    }

    /// Point lookup by id across hot partitions.
    pub fn get_by_id(&self, id: &LogId) -> Option<LogEntry> {
        self.engine.get_by_id(id)
    }
}

/// Lower a search expression into the engine's plan language.
pub fn compile_expr(expr: &SearchExpr) -> PlanNode {
    match expr {
        SearchExpr::All => PlanNode::All,
        SearchExpr::Term(t) => PlanNode::Term(t.clone()),
        SearchExpr::Phrase(p) => PlanNode::Phrase(p.clone()),
        SearchExpr::Wildcard(w) => PlanNode::Wildcard(w.clone()),
        SearchExpr::Regex(r) => PlanNode::Regex(r.clone()),
        SearchExpr::FieldEq { field, value } => PlanNode::FieldEq {
            field: field.clone(),
            value: value.clone(),
        },
        SearchExpr::Not(inner) => PlanNode::Not(Box::new(compile_expr(inner))),
        SearchExpr::And(left, right) => {
            PlanNode::And(vec![compile_expr(left), compile_expr(right)])
        },
        SearchExpr::Or(left, right) => PlanNode::Or(vec![compile_expr(left), compile_expr(right)]),
    }
}

fn check_deadline(deadline: Instant, timeout_ms: u64) -> Result<()> {
    if Instant::now() >= deadline {
        Err(GrepWiseError::QueryTimeout { timeout_ms })
    } else {
        Ok(())
    }
}

fn drain_stream(hits: SearchHits, deadline: Instant, timeout_ms: u64) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    for (i, entry) in hits.stream.enumerate() {
        if i % DEADLINE_CHECK_EVERY == 0 {
            check_deadline(deadline, timeout_ms)?;
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn run_pipeline(
    engine: &IndexEngine,
    pipeline: &Pipeline,
    range: TimeRange,
    deadline: Instant,
    timeout_ms: u64,
) -> Result<QueryResult> {
    let Some(Stage::Search(first)) = pipeline.stages.first() else {
        return Err(GrepWiseError::syntax("query must start with 'search'"));
    };
    let node = compile_expr(first);
    let rest = &pipeline.stages[1..];

    // Aggregation-only pipelines run entirely on the doc-value columns.
    if let [Stage::Stats { by }] = rest {
        let plan = SearchPlan::new(node, range);
        let stats = if by.is_empty() {
            let mut map = BTreeMap::new();
            map.insert("count".to_string(), engine.count(&plan)? as u64);
            map
        } else {
            engine.aggregate(&plan, by)?
        };
        let total = stats.values().sum::<u64>() as usize;
        return Ok(QueryResult {
            output: QueryOutput::Stats(stats),
            total,
            warnings: Vec::new(),
        });
    }

    let plan = SearchPlan::new(node, range);
    let hits = engine.search(&plan)?;
    let warnings = hits.warnings.clone();
    let mut entries = drain_stream(hits, deadline, timeout_ms)?;

    for (i, stage) in rest.iter().enumerate() {
        check_deadline(deadline, timeout_ms)?;
        match stage {
            Stage::Search(expr) => {
                let matcher = crate::index::plan::Matcher::compile(&compile_expr(expr))?;
                entries.retain(|e| matcher.matches(e));
            },
            Stage::Where(cond) => {
                let eval = CompiledCondition::new(cond)?;
                entries.retain(|e| eval.matches(e));
            },
            Stage::Eval { name, expr } => {
                let value = match expr {
                    EvalExpr::StrLit(s) => EvalValue::Fixed(s.clone()),
                    EvalExpr::NumLit(n) => EvalValue::Fixed(n.to_string()),
                    EvalExpr::FieldRef(f) => EvalValue::Field(f.clone()),
                    EvalExpr::Unsupported(raw) => {
                        return Err(GrepWiseError::EvalUnsupported(raw.clone()));
                    },
                };
                for entry in &mut entries {
                    let resolved = match &value {
                        EvalValue::Fixed(v) => v.clone(),
                        EvalValue::Field(f) => entry.field_value(f).unwrap_or_default(),
                    };
                    entry.metadata.insert(name, resolved);
                }
            },
            Stage::Sort(fields) => {
                sort_entries(&mut entries, fields);
            },
            Stage::Head(n) => entries.truncate(*n),
            Stage::Tail(n) => {
                let keep = entries.len().saturating_sub(*n);
                entries.drain(..keep);
            },
            Stage::Stats { by } => {
                if i + 1 != rest.len() {
                    return Err(GrepWiseError::syntax("stats must be the final command"));
                }
                let mut stats = BTreeMap::new();
                if by.is_empty() {
                    stats.insert("count".to_string(), entries.len() as u64);
                } else {
                    for entry in &entries {
                        let key = by
                            .iter()
                            .map(|f| entry.field_value(f).unwrap_or_default())
                            .collect::<Vec<_>>()
                            .join(",");
                        *stats.entry(key).or_insert(0) += 1;
                    }
                }
                let total = stats.values().sum::<u64>() as usize;
                return Ok(QueryResult {
                    output: QueryOutput::Stats(stats),
                    total,
                    warnings,
                });
            },
        }
    }

    let total = entries.len();
    Ok(QueryResult {
        output: QueryOutput::Entries(entries),
        total,
        warnings,
    })
}

enum EvalValue {
    Fixed(String),
    Field(String),
}

/// `where` condition with its patterns compiled once.
struct CompiledCondition {
    field: String,
    kind: ConditionKind,
}

enum ConditionKind {
    Compare { op: CompareOp, value: String },
    Pattern(Regex),
}

impl CompiledCondition {
    fn new(cond: &Condition) -> Result<Self> {
        Ok(match cond {
            Condition::Compare { field, op, value } => Self {
                field: field.clone(),
                kind: ConditionKind::Compare {
                    op: *op,
                    value: value.clone(),
                },
            },
            Condition::Like { field, pattern } => Self {
                field: field.clone(),
                kind: ConditionKind::Pattern(like_regex(pattern)?),
            },
            Condition::Regex { field, pattern } => Self {
                field: field.clone(),
                kind: ConditionKind::Pattern(Regex::new(pattern).map_err(|e| {
                    GrepWiseError::syntax(format!("bad regex in where: {}", e))
                })?),
            },
        })
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        let Some(actual) = entry.field_value(&self.field) else {
            return false;
        };
        match &self.kind {
            ConditionKind::Compare { op, value } => {
                let ordering = match (actual.parse::<f64>(), value.parse::<f64>()) {
                    (Ok(a), Ok(b)) => a.partial_cmp(&b),
                    _ => Some(actual.as_str().cmp(value.as_str())),
                };
                let Some(ordering) = ordering else { return false };
                match op {
                    CompareOp::Eq => ordering.is_eq(),
                    CompareOp::Ne => !ordering.is_eq(),
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Le => ordering.is_le(),
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Ge => ordering.is_ge(),
                }
            },
            ConditionKind::Pattern(regex) => regex.is_match(&actual),
        }
    }
}

/// SQL-style LIKE: `%` any run, `_` one char; case-insensitive, anchored.
fn like_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| GrepWiseError::syntax(format!("bad LIKE pattern: {}", e)))
}

/// Stable multi-key sort; missing values sort last in either direction,
/// numeric comparison when both sides parse as numbers.
fn sort_entries(entries: &mut [LogEntry], fields: &[SortField]) {
    entries.sort_by(|a, b| {
        for sort in fields {
            let av = a.field_value(&sort.field);
            let bv = b.field_value(&sort.field);
            let ordering = match (&av, &bv) {
                (None, None) => continue,
                (None, Some(_)) => return std::cmp::Ordering::Greater,
                (Some(_), None) => return std::cmp::Ordering::Less,
                (Some(a), Some(b)) => {
                    let cmp = match (a.parse::<f64>(), b.parse::<f64>()) {
                        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                        _ => a.cmp(b),
                    };
                    if sort.descending {
                        cmp.reverse()
                    } else {
                        cmp
                    }
                },
            };
            if !ordering.is_eq() {
                return ordering;
            }
        }
        // Deterministic tiebreak.
        a.id.cmp(&b.id)
    });
}

/// Bucket timestamps into up to `HISTOGRAM_SLOTS` slots of at least one
/// second each.
fn histogram(timestamps: &[i64], range: &TimeRange) -> Vec<(i64, u64)> {
    if timestamps.is_empty() {
        return Vec::new();
    }
    let span = range.duration_ms().max(1);
    let width = (span / HISTOGRAM_SLOTS).max(1000);
    let mut buckets: BTreeMap<i64, u64> = BTreeMap::new();
    for &ts in timestamps {
        let slot = range.start_ms + ((ts - range.start_ms) / width) * width;
        *buckets.entry(slot).or_insert(0) += 1;
    }
    buckets.into_iter().collect()
}
