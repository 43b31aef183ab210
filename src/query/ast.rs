//! Abstract syntax tree for the piped search language.

use std::fmt;

/// A parsed pipeline: `search <criteria> ( '|' <command> <args> )*`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

/// One piped command.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Search(SearchExpr),
    Where(Condition),
    /// `stats count [by field, ...]`; empty `by` list is a scalar count.
    Stats { by: Vec<String> },
    Sort(Vec<SortField>),
    Head(usize),
    Tail(usize),
    Eval { name: String, expr: EvalExpr },
}

/// Search criteria tree.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchExpr {
    /// `*`
    All,
    /// Bare token matched against tokenized `message`.
    Term(String),
    /// `"quoted phrase"`
    Phrase(String),
    /// Token containing `*` wildcards.
    Wildcard(String),
    /// `/regex/`
    Regex(String),
    /// `field=value`
    FieldEq { field: String, value: String },
    Not(Box<SearchExpr>),
    And(Box<SearchExpr>, Box<SearchExpr>),
    Or(Box<SearchExpr>, Box<SearchExpr>),
}

/// `where` condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        field: String,
        op: CompareOp,
        value: String,
    },
    Like {
        field: String,
        pattern: String,
    },
    Regex {
        field: String,
        pattern: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// One sort key; `descending` renders as a `-` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

/// Right-hand side of an `eval` assignment. Only literals and field
/// references execute; anything richer is preserved verbatim and rejected
/// at execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalExpr {
    FieldRef(String),
    StrLit(String),
    NumLit(f64),
    Unsupported(String),
}

impl SearchExpr {
    fn precedence(&self) -> u8 {
        match self {
            SearchExpr::Or(..) => 1,
            SearchExpr::And(..) => 2,
            _ => 3,
        }
    }

    fn fmt_child(&self, child: &SearchExpr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if child.precedence() < self.precedence() {
            write!(f, "({})", child)
        } else {
            write!(f, "{}", child)
        }
    }
}

impl fmt::Display for SearchExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchExpr::All => write!(f, "*"),
            SearchExpr::Term(t) | SearchExpr::Wildcard(t) => write!(f, "{}", t),
            SearchExpr::Phrase(p) => write!(f, "\"{}\"", p),
            SearchExpr::Regex(r) => write!(f, "/{}/", r),
            SearchExpr::FieldEq { field, value } => {
                if value.contains(char::is_whitespace) || value.is_empty() {
                    write!(f, "{}=\"{}\"", field, value)
                } else {
                    write!(f, "{}={}", field, value)
                }
            },
            SearchExpr::Not(inner) => {
                write!(f, "NOT ")?;
                if inner.precedence() < 3 {
                    write!(f, "({})", inner)
                } else {
                    write!(f, "{}", inner)
                }
            },
            SearchExpr::And(left, right) => {
                self.fmt_child(left, f)?;
                write!(f, " AND ")?;
                self.fmt_child(right, f)
            },
            SearchExpr::Or(left, right) => {
                self.fmt_child(left, f)?;
                write!(f, " OR ")?;
                self.fmt_child(right, f)
            },
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        write!(f, "{}", op)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare { field, op, value } => {
                if value.contains(char::is_whitespace) || value.is_empty() {
                    write!(f, "{} {} \"{}\"", field, op, value)
                } else {
                    write!(f, "{} {} {}", field, op, value)
                }
            },
            Condition::Like { field, pattern } => write!(f, "{} LIKE \"{}\"", field, pattern),
            Condition::Regex { field, pattern } => write!(f, "{} REGEX /{}/", field, pattern),
        }
    }
}

impl fmt::Display for EvalExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalExpr::FieldRef(name) => write!(f, "{}", name),
            EvalExpr::StrLit(s) => write!(f, "\"{}\"", s),
            EvalExpr::NumLit(n) => write!(f, "{}", n),
            EvalExpr::Unsupported(raw) => write!(f, "{}", raw),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Search(expr) => write!(f, "search {}", expr),
            Stage::Where(cond) => write!(f, "where {}", cond),
            Stage::Stats { by } => {
                write!(f, "stats count")?;
                if !by.is_empty() {
                    write!(f, " by {}", by.join(", "))?;
                }
                Ok(())
            },
            Stage::Sort(fields) => {
                let rendered: Vec<String> = fields
                    .iter()
                    .map(|s| {
                        if s.descending {
                            format!("-{}", s.field)
                        } else {
                            s.field.clone()
                        }
                    })
                    .collect();
                write!(f, "sort {}", rendered.join(", "))
            },
            Stage::Head(n) => write!(f, "head {}", n),
            Stage::Tail(n) => write!(f, "tail {}", n),
            Stage::Eval { name, expr } => write!(f, "eval {} = {}", name, expr),
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.stages.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", rendered.join(" | "))
    }
}
