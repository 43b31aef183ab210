//! Compiled search plans handed to the index engine.
//!
//! The query planner lowers the `search` stage of a pipeline into a
//! `SearchPlan`; the engine evaluates it with postings where it can and an
//! exact verification pass everywhere.

use crate::core::error::{GrepWiseError, Result};
use crate::core::types::{LogEntry, TimeRange};
use crate::index::tokenizer::tokens;
use regex::Regex;

/// Index-time search predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    /// Match every entry.
    All,
    /// A single tokenized term in `message`.
    Term(String),
    /// Quoted phrase: case-insensitive substring of `message`.
    Phrase(String),
    /// Token pattern with `*` wildcards.
    Wildcard(String),
    /// Regex applied to `message`.
    Regex(String),
    /// Exact field equality (case-insensitive); `message` degrades to a
    /// phrase match. Unknown fields match nothing.
    FieldEq { field: String, value: String },
    Not(Box<PlanNode>),
    And(Vec<PlanNode>),
    Or(Vec<PlanNode>),
}

/// Sort key for result ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn timestamp_desc() -> Self {
        Self {
            field: "timestamp".to_string(),
            descending: true,
        }
    }
}

/// A compiled plan: predicate, time range, ordering, and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPlan {
    pub node: PlanNode,
    pub range: TimeRange,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl SearchPlan {
    pub fn new(node: PlanNode, range: TimeRange) -> Self {
        Self {
            node,
            range,
            sort: vec![SortKey::timestamp_desc()],
            limit: None,
        }
    }

    pub fn with_sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical representation folded into cache fingerprints.
    pub fn fingerprint_key(&self) -> String {
        let sort = self
            .sort
            .iter()
            .map(|k| format!("{}{}", if k.descending { "-" } else { "+" }, k.field))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{:?}|{}..{}|{}|{}",
            self.node,
            self.range.start_ms,
            self.range.end_ms,
            sort,
            self.limit.map(|l| l.to_string()).unwrap_or_default()
        )
    }
}

/// Exact matcher compiled from a plan node. Regexes and wildcard patterns
/// are compiled once per search.
pub struct Matcher {
    node: CompiledNode,
}

enum CompiledNode {
    All,
    Term(String),
    Phrase(String),
    Wildcard(Regex),
    Regex(Regex),
    FieldEq { field: String, value: String },
    Not(Box<CompiledNode>),
    And(Vec<CompiledNode>),
    Or(Vec<CompiledNode>),
}

/// Lower a `*` wildcard token pattern to an anchored regex.
pub(crate) fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        if c == '*' {
            re.push_str(".*");
        } else {
            re.push_str(&regex::escape(&c.to_lowercase().to_string()));
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| GrepWiseError::syntax(format!("bad wildcard pattern: {}", e)))
}

fn compile(node: &PlanNode) -> Result<CompiledNode> {
    Ok(match node {
        PlanNode::All => CompiledNode::All,
        PlanNode::Term(t) => CompiledNode::Term(t.to_lowercase()),
        PlanNode::Phrase(p) => CompiledNode::Phrase(p.to_lowercase()),
        PlanNode::Wildcard(w) => CompiledNode::Wildcard(wildcard_regex(w)?),
        PlanNode::Regex(r) => CompiledNode::Regex(
            Regex::new(r).map_err(|e| GrepWiseError::syntax(format!("bad regex: {}", e)))?,
        ),
        PlanNode::FieldEq { field, value } => CompiledNode::FieldEq {
            field: field.clone(),
            value: value.to_lowercase(),
        },
        PlanNode::Not(inner) => CompiledNode::Not(Box::new(compile(inner)?)),
        PlanNode::And(nodes) => {
            CompiledNode::And(nodes.iter().map(compile).collect::<Result<Vec<_>>>()?)
        },
        PlanNode::Or(nodes) => {
            CompiledNode::Or(nodes.iter().map(compile).collect::<Result<Vec<_>>>()?)
        },
    })
}

impl Matcher {
    pub fn compile(node: &PlanNode) -> Result<Self> {
        Ok(Self {
            node: compile(node)?,
        })
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        eval(&self.node, entry)
    }
}

fn eval(node: &CompiledNode, entry: &LogEntry) -> bool {
    match node {
        CompiledNode::All => true,
        CompiledNode::Term(term) => tokens(&entry.message).any(|t| t == *term),
        CompiledNode::Phrase(phrase) => entry.message.to_lowercase().contains(phrase.as_str()),
        CompiledNode::Wildcard(regex) => tokens(&entry.message).any(|t| regex.is_match(&t)),
        CompiledNode::Regex(regex) => regex.is_match(&entry.message),
        CompiledNode::FieldEq { field, value } => match field.as_str() {
            "message" => entry.message.to_lowercase().contains(value.as_str()),
            _ => entry
                .field_value(field)
                .map(|v| v.to_lowercase() == *value)
                .unwrap_or(false),
        },
        CompiledNode::Not(inner) => !eval(inner, entry),
        CompiledNode::And(nodes) => nodes.iter().all(|n| eval(n, entry)),
        CompiledNode::Or(nodes) => nodes.iter().any(|n| eval(n, entry)),
    }
}
