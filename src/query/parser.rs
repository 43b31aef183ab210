//! Pipeline parser built on nom.
//!
//! Grammar: `search <criteria> ( '|' <command> <args> )*`. Unknown commands
//! are skipped with a warning so a pipeline keeps working across versions;
//! malformed arguments inside a recognized command are a syntax error.

use super::ast::*;
use crate::core::error::{GrepWiseError, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{anychar, char, digit1, multispace0, multispace1},
    combinator::{map, not, opt, peek, recognize, verify},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};

/// Parse a pipeline, returning the AST plus warnings for skipped commands.
pub fn parse_pipeline(input: &str) -> Result<(Pipeline, Vec<String>)> {
    let segments = split_pipes(input);
    if segments.is_empty() || segments.iter().all(|s| s.trim().is_empty()) {
        return Err(GrepWiseError::syntax("empty query"));
    }

    let mut stages = Vec::new();
    let mut warnings = Vec::new();
    for (i, segment) in segments.iter().enumerate() {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(GrepWiseError::syntax("empty pipeline segment"));
        }
        match parse_stage(segment)? {
            Some(stage) => {
                if i == 0 && !matches!(stage, Stage::Search(_)) {
                    return Err(GrepWiseError::syntax("query must start with 'search'"));
                }
                stages.push(stage);
            },
            None => {
                let command = segment.split_whitespace().next().unwrap_or(segment);
                warnings.push(format!("unknown command '{}' skipped", command));
            },
        }
    }
    if stages.is_empty() {
        return Err(GrepWiseError::syntax("no recognized commands in query"));
    }
    if !matches!(stages[0], Stage::Search(_)) {
        return Err(GrepWiseError::syntax("query must start with 'search'"));
    }
    Ok((Pipeline { stages }, warnings))
}

/// Split on `|` outside quotes and regex literals.
fn split_pipes(input: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_regex = false;
    let mut prev: Option<char> = None;
    for c in input.chars() {
        match c {
            '"' if !in_regex => in_quotes = !in_quotes,
            '/' if !in_quotes => {
                if in_regex {
                    in_regex = false;
                } else if prev.map_or(true, |p| p.is_whitespace() || p == '(') {
                    in_regex = true;
                }
            },
            '|' if !in_quotes && !in_regex => {
                segments.push(std::mem::take(&mut current));
                prev = Some('|');
                continue;
            },
            _ => {},
        }
        current.push(c);
        prev = Some(c);
    }
    segments.push(current);
    segments
}

/// Parse one segment. `Ok(None)` means the command is unrecognized.
fn parse_stage(segment: &str) -> Result<Option<Stage>> {
    let command = segment
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    let finish = |result: IResult<&str, Stage>| -> Result<Option<Stage>> {
        match result {
            Ok((rest, stage)) if rest.trim().is_empty() => Ok(Some(stage)),
            Ok((rest, _)) => Err(GrepWiseError::syntax(format!(
                "unexpected input after command: '{}'",
                rest.trim()
            ))),
            Err(e) => Err(GrepWiseError::syntax(format!("failed to parse '{}': {}", segment, e))),
        }
    };
    match command.as_str() {
        "search" => finish(search_stage(segment)),
        "where" => finish(where_stage(segment)),
        "stats" => finish(stats_stage(segment)),
        "sort" => finish(sort_stage(segment)),
        "head" => finish(head_stage(segment)),
        "tail" => finish(tail_stage(segment)),
        "eval" => eval_stage(segment).map(Some),
        _ => Ok(None),
    }
}

/// A keyword with a word boundary behind it.
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag_no_case(kw),
        peek(not(verify(anychar, |c: &char| c.is_alphanumeric() || *c == '_'))),
    )
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.')(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_while(|c| c != '"'), char('"'))(input)
}

fn regex_literal(input: &str) -> IResult<&str, &str> {
    delimited(char('/'), take_while(|c| c != '/'), char('/'))(input)
}

// --- search criteria ---

fn search_stage(input: &str) -> IResult<&str, Stage> {
    map(
        preceded(pair(keyword("search"), multispace1), search_expr),
        Stage::Search,
    )(input)
}

fn search_expr(input: &str) -> IResult<&str, SearchExpr> {
    or_expr(input)
}

fn or_expr(input: &str) -> IResult<&str, SearchExpr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(
        tuple((multispace0, keyword("OR"), multispace1)),
        and_expr,
    ))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, right| SearchExpr::Or(Box::new(acc), Box::new(right))),
    ))
}

fn and_expr(input: &str) -> IResult<&str, SearchExpr> {
    let (input, first) = unary_expr(input)?;
    // Juxtaposed criteria are an implicit AND.
    let (input, rest) = many0(alt((
        preceded(tuple((multispace0, keyword("AND"), multispace1)), unary_expr),
        preceded(
            pair(multispace1, peek(not(keyword("OR")))),
            unary_expr,
        ),
    )))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |acc, right| SearchExpr::And(Box::new(acc), Box::new(right))),
    ))
}

fn unary_expr(input: &str) -> IResult<&str, SearchExpr> {
    alt((
        map(
            preceded(pair(keyword("NOT"), multispace1), unary_expr),
            |inner| SearchExpr::Not(Box::new(inner)),
        ),
        primary_expr,
    ))(input)
}

fn primary_expr(input: &str) -> IResult<&str, SearchExpr> {
    preceded(
        multispace0,
        alt((
            delimited(
                pair(char('('), multispace0),
                search_expr,
                pair(multispace0, char(')')),
            ),
            map(regex_literal, |r: &str| SearchExpr::Regex(r.to_string())),
            map(quoted, |p: &str| SearchExpr::Phrase(p.to_string())),
            field_eq_expr,
            term_expr,
        )),
    )(input)
}

fn field_eq_expr(input: &str) -> IResult<&str, SearchExpr> {
    map(
        tuple((ident, char('='), field_value)),
        |(field, _, value)| SearchExpr::FieldEq {
            field: field.to_string(),
            value,
        },
    )(input)
}

fn field_value(input: &str) -> IResult<&str, String> {
    alt((
        map(quoted, str::to_string),
        map(
            take_while1(|c: char| {
                c.is_alphanumeric() || "_-.:*@/+#".contains(c)
            }),
            str::to_string,
        ),
    ))(input)
}

fn term_expr(input: &str) -> IResult<&str, SearchExpr> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || "_-.:*@+#".contains(c)),
        |t: &str| {
            if t == "*" {
                SearchExpr::All
            } else if t.contains('*') {
                SearchExpr::Wildcard(t.to_string())
            } else {
                SearchExpr::Term(t.to_string())
            }
        },
    )(input)
}

// --- where ---

fn where_stage(input: &str) -> IResult<&str, Stage> {
    map(
        preceded(pair(keyword("where"), multispace1), condition),
        Stage::Where,
    )(input)
}

fn condition(input: &str) -> IResult<&str, Condition> {
    let (input, field) = ident(input)?;
    let (input, _) = multispace0(input)?;
    alt((
        map(
            preceded(pair(keyword("LIKE"), multispace0), quoted),
            |pattern: &str| Condition::Like {
                field: field.to_string(),
                pattern: pattern.to_string(),
            },
        ),
        map(
            preceded(pair(keyword("REGEX"), multispace0), regex_literal),
            |pattern: &str| Condition::Regex {
                field: field.to_string(),
                pattern: pattern.to_string(),
            },
        ),
        map(
            tuple((compare_op, multispace0, field_value)),
            |(op, _, value)| Condition::Compare {
                field: field.to_string(),
                op,
                value,
            },
        ),
    ))(input)
}

fn compare_op(input: &str) -> IResult<&str, CompareOp> {
    alt((
        map(tag("!="), |_| CompareOp::Ne),
        map(tag("<="), |_| CompareOp::Le),
        map(tag(">="), |_| CompareOp::Ge),
        map(tag("="), |_| CompareOp::Eq),
        map(tag("<"), |_| CompareOp::Lt),
        map(tag(">"), |_| CompareOp::Gt),
    ))(input)
}

// --- stats / sort / head / tail ---

fn stats_stage(input: &str) -> IResult<&str, Stage> {
    map(
        preceded(
            tuple((keyword("stats"), multispace1, keyword("count"))),
            opt(preceded(
                tuple((multispace1, keyword("by"), multispace1)),
                separated_list1(tuple((multispace0, char(','), multispace0)), ident),
            )),
        ),
        |by| Stage::Stats {
            by: by
                .unwrap_or_default()
                .into_iter()
                .map(str::to_string)
                .collect(),
        },
    )(input)
}

fn sort_stage(input: &str) -> IResult<&str, Stage> {
    map(
        preceded(
            pair(keyword("sort"), multispace1),
            separated_list1(tuple((multispace0, char(','), multispace0)), sort_field),
        ),
        Stage::Sort,
    )(input)
}

fn sort_field(input: &str) -> IResult<&str, SortField> {
    map(pair(opt(char('-')), ident), |(desc, field)| SortField {
        field: field.to_string(),
        descending: desc.is_some(),
    })(input)
}

fn head_stage(input: &str) -> IResult<&str, Stage> {
    map(
        preceded(pair(keyword("head"), multispace1), recognize(digit1)),
        |n: &str| Stage::Head(n.parse().unwrap_or(0)),
    )(input)
}

fn tail_stage(input: &str) -> IResult<&str, Stage> {
    map(
        preceded(pair(keyword("tail"), multispace1), recognize(digit1)),
        |n: &str| Stage::Tail(n.parse().unwrap_or(0)),
    )(input)
}

// --- eval ---

/// `eval name = expr`. The right-hand side is captured verbatim; only
/// literals and field references are executable.
fn eval_stage(segment: &str) -> Result<Stage> {
    let header: IResult<&str, &str> = preceded(
        tuple((keyword("eval"), multispace1)),
        terminated(ident, tuple((multispace0, char('='), multispace0))),
    )(segment);
    let (rest, name) = header
        .map_err(|_| GrepWiseError::syntax(format!("malformed eval: '{}'", segment)))?;
    let raw = rest.trim();
    if raw.is_empty() {
        return Err(GrepWiseError::syntax("eval is missing an expression"));
    }
    Ok(Stage::Eval {
        name: name.to_string(),
        expr: classify_eval_expr(raw),
    })
}

fn classify_eval_expr(raw: &str) -> EvalExpr {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        if !inner.contains('"') {
            return EvalExpr::StrLit(inner.to_string());
        }
    }
    if let Ok(n) = raw.parse::<f64>() {
        return EvalExpr::NumLit(n);
    }
    if raw.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        return EvalExpr::FieldRef(raw.to_string());
    }
    EvalExpr::Unsupported(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(input: &str) -> Pipeline {
        parse_pipeline(input).unwrap().0
    }

    #[test]
    fn test_parse_simple_search() {
        let p = parse("search error");
        assert_eq!(p.stages, vec![Stage::Search(SearchExpr::Term("error".to_string()))]);
    }

    #[test]
    fn test_parse_star() {
        let p = parse("search *");
        assert_eq!(p.stages, vec![Stage::Search(SearchExpr::All)]);
    }

    #[test]
    fn test_parse_implicit_and() {
        let p = parse("search error timeout");
        assert_eq!(
            p.stages,
            vec![Stage::Search(SearchExpr::And(
                Box::new(SearchExpr::Term("error".to_string())),
                Box::new(SearchExpr::Term("timeout".to_string())),
            ))]
        );
    }

    #[test]
    fn test_parse_boolean_precedence() {
        let p = parse("search a OR b AND c");
        // AND binds tighter than OR.
        assert_eq!(
            p.stages,
            vec![Stage::Search(SearchExpr::Or(
                Box::new(SearchExpr::Term("a".to_string())),
                Box::new(SearchExpr::And(
                    Box::new(SearchExpr::Term("b".to_string())),
                    Box::new(SearchExpr::Term("c".to_string())),
                )),
            ))]
        );
    }

    #[test]
    fn test_parse_grouping_and_not() {
        let p = parse("search (a OR b) AND NOT c");
        assert_eq!(
            p.stages,
            vec![Stage::Search(SearchExpr::And(
                Box::new(SearchExpr::Or(
                    Box::new(SearchExpr::Term("a".to_string())),
                    Box::new(SearchExpr::Term("b".to_string())),
                )),
                Box::new(SearchExpr::Not(Box::new(SearchExpr::Term("c".to_string())))),
            ))]
        );
    }

    #[test]
    fn test_parse_field_phrase_regex_wildcard() {
        let p = parse("search level=ERROR \"connection lost\" /time.ut/ time*");
        let Stage::Search(expr) = &p.stages[0] else { panic!() };
        let rendered = expr.to_string();
        assert!(rendered.contains("level=ERROR"));
        assert!(rendered.contains("\"connection lost\""));
        assert!(rendered.contains("/time.ut/"));
        assert!(rendered.contains("time*"));
    }

    #[test]
    fn test_parse_full_pipeline() {
        let p = parse("search * | where level = ERROR | stats count by level, source");
        assert_eq!(p.stages.len(), 3);
        assert_eq!(
            p.stages[2],
            Stage::Stats {
                by: vec!["level".to_string(), "source".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_sort_head_tail() {
        let p = parse("search * | sort -timestamp, level | head 10 | tail 3");
        assert_eq!(
            p.stages[1],
            Stage::Sort(vec![
                SortField {
                    field: "timestamp".to_string(),
                    descending: true
                },
                SortField {
                    field: "level".to_string(),
                    descending: false
                },
            ])
        );
        assert_eq!(p.stages[2], Stage::Head(10));
        assert_eq!(p.stages[3], Stage::Tail(3));
    }

    #[test]
    fn test_parse_where_variants() {
        let p = parse("search * | where duration >= 100 | where message LIKE \"%timeout%\" | where source REGEX /app.*/");
        assert_eq!(
            p.stages[1],
            Stage::Where(Condition::Compare {
                field: "duration".to_string(),
                op: CompareOp::Ge,
                value: "100".to_string(),
            })
        );
        assert!(matches!(&p.stages[2], Stage::Where(Condition::Like { .. })));
        assert!(matches!(&p.stages[3], Stage::Where(Condition::Regex { .. })));
    }

    #[test]
    fn test_parse_eval_forms() {
        let p = parse("search * | eval env = \"prod\" | eval lvl = level | eval n = 42");
        assert_eq!(
            p.stages[1],
            Stage::Eval {
                name: "env".to_string(),
                expr: EvalExpr::StrLit("prod".to_string())
            }
        );
        assert_eq!(
            p.stages[2],
            Stage::Eval {
                name: "lvl".to_string(),
                expr: EvalExpr::FieldRef("level".to_string())
            }
        );
        assert_eq!(
            p.stages[3],
            Stage::Eval {
                name: "n".to_string(),
                expr: EvalExpr::NumLit(42.0)
            }
        );
    }

    #[test]
    fn test_eval_arithmetic_is_unsupported_not_error() {
        let p = parse("search * | eval x = len(message) + 1");
        assert!(matches!(
            &p.stages[1],
            Stage::Eval {
                expr: EvalExpr::Unsupported(_),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_command_warns_and_skips() {
        let (p, warnings) = parse_pipeline("search * | frobnicate hard | head 1").unwrap();
        assert_eq!(p.stages.len(), 2);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("frobnicate"));
    }

    #[test]
    fn test_malformed_recognized_command_is_error() {
        assert!(matches!(
            parse_pipeline("search * | head ten"),
            Err(GrepWiseError::QuerySyntax { .. })
        ));
        assert!(matches!(
            parse_pipeline("search * | where level !!"),
            Err(GrepWiseError::QuerySyntax { .. })
        ));
    }

    #[test]
    fn test_must_start_with_search() {
        assert!(matches!(
            parse_pipeline("where level = ERROR"),
            Err(GrepWiseError::QuerySyntax { .. })
        ));
    }

    #[test]
    fn test_pipe_inside_quotes_and_regex() {
        let p = parse("search \"a | b\" | head 1");
        assert_eq!(p.stages.len(), 2);
        let p = parse("search /a|b/ | head 1");
        assert_eq!(p.stages.len(), 2);
    }

    #[test]
    fn test_format_parse_roundtrip() {
        let queries = [
            "search error",
            "search *",
            "search level=ERROR AND \"connection lost\"",
            "search (a OR b) AND NOT c",
            "search /timeout/ | sort -timestamp | head 1",
            "search * | where duration >= 100 | stats count by level",
            "search * | eval env = \"prod\"",
            "search web* source=app.log | tail 5",
        ];
        for q in queries {
            let (first, _) = parse_pipeline(q).unwrap();
            let formatted = first.to_string();
            let (second, _) = parse_pipeline(&formatted).unwrap();
            assert_eq!(first, second, "round-trip failed for {:?} → {:?}", q, formatted);
        }
    }
}
