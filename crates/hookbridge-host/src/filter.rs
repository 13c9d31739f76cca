//! Record filter and sort expressions.
//!
//! Filters are clauses joined by `&&`, each `field <op> literal`:
//!
//! ```text
//! author = 'ada' && views >= 10 && title ~ "rust"
//! ```
//!
//! Operators: `=`, `!=`, `>`, `>=`, `<`, `<=`, `~` (case-insensitive
//! substring).  Literals are single- or double-quoted strings, numbers,
//! `true`, `false` and `null`.  Sort expressions are comma-separated field
//! names with an optional `-` prefix for descending order.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::Fault;

static CLAUSE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.]*)\s*(!=|>=|<=|=|>|<|~)\s*(.+?)\s*$")
});

static FIELD: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$"));

fn pattern(compiled: &'static Result<Regex, regex::Error>) -> Result<&'static Regex, Fault> {
    compiled
        .as_ref()
        .map_err(|e| Fault::host(format!("filter pattern failed to compile: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    field: String,
    op: Op,
    literal: Value,
}

/// A parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// Parse `expr`, reporting problems against the `filter` field.
    pub fn parse(expr: &str) -> Result<Self, Fault> {
        let clauses = split_and(expr)?
            .into_iter()
            .map(parse_clause)
            .collect::<Result<Vec<_>, _>>()?;
        if clauses.is_empty() {
            return Err(Fault::invalid("filter", "filter is empty"));
        }
        Ok(Self { clauses })
    }

    /// Whether `record` satisfies every clause.
    pub fn matches(&self, record: &Value) -> bool {
        self.clauses.iter().all(|clause| {
            let actual = lookup(record, &clause.field);
            eval(clause.op, actual, &clause.literal)
        })
    }
}

/// Split on `&&` outside quoted strings.
fn split_and(expr: &str) -> Result<Vec<&str>, Fault> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut chars = expr.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '&') if matches!(chars.peek(), Some((_, '&'))) => {
                parts.push(&expr[start..i]);
                chars.next();
                start = i + 2;
            }
            (None, _) => {}
        }
    }
    if quote.is_some() {
        return Err(Fault::invalid("filter", "unterminated string literal"));
    }
    parts.push(&expr[start..]);
    Ok(parts.into_iter().filter(|p| !p.trim().is_empty()).collect())
}

fn parse_clause(text: &str) -> Result<Clause, Fault> {
    let caps = pattern(&CLAUSE)?
        .captures(text)
        .ok_or_else(|| Fault::invalid("filter", format!("cannot parse clause `{}`", text.trim())))?;
    let op = match &caps[2] {
        "=" => Op::Eq,
        "!=" => Op::Ne,
        ">" => Op::Gt,
        ">=" => Op::Ge,
        "<" => Op::Lt,
        "<=" => Op::Le,
        _ => Op::Like,
    };
    Ok(Clause {
        field: caps[1].to_owned(),
        op,
        literal: parse_literal(&caps[3])?,
    })
}

fn parse_literal(raw: &str) -> Result<Value, Fault> {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Ok(Value::String(raw[1..raw.len() - 1].to_owned()));
        }
    }
    match raw {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        "null" => Ok(Value::Null),
        _ => match serde_json::from_str::<Value>(raw) {
            Ok(n @ Value::Number(_)) => Ok(n),
            _ => Err(Fault::invalid(
                "filter",
                format!("`{raw}` is not a string, number, boolean or null"),
            )),
        },
    }
}

/// Resolve a dotted path inside a record object.
fn lookup<'a>(record: &'a Value, path: &str) -> &'a Value {
    path.split('.')
        .try_fold(record, |value, key| value.get(key))
        .unwrap_or(&Value::Null)
}

fn eval(op: Op, actual: &Value, literal: &Value) -> bool {
    match op {
        Op::Eq => loosely_equal(actual, literal),
        Op::Ne => !loosely_equal(actual, literal),
        Op::Like => match (actual.as_str(), literal.as_str()) {
            (Some(a), Some(l)) => a.to_lowercase().contains(&l.to_lowercase()),
            _ => false,
        },
        Op::Gt | Op::Ge | Op::Lt | Op::Le => {
            let Some(ord) = compare_scalar(actual, literal) else {
                return false;
            };
            match op {
                Op::Gt => ord == Ordering::Greater,
                Op::Ge => ord != Ordering::Less,
                Op::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        }
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Order two numbers or two strings; other pairs are incomparable.
fn compare_scalar(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// One key of a sort expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Parse `-created,title` style sort expressions.
pub fn parse_sort(expr: &str) -> Result<Vec<SortKey>, Fault> {
    let field_name = pattern(&FIELD)?;
    expr.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (descending, field) = match part.strip_prefix('-') {
                Some(rest) => (true, rest.trim()),
                None => (false, part.strip_prefix('+').unwrap_or(part).trim()),
            };
            if !field_name.is_match(field) {
                return Err(Fault::invalid("sort", format!("`{part}` is not a field name")));
            }
            Ok(SortKey {
                field: field.to_owned(),
                descending,
            })
        })
        .collect()
}

/// Compare two records by `keys`.
pub fn compare(a: &Value, b: &Value, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ord = total_order(lookup(a, &key.field), lookup(b, &key.field));
        let ord = if key.descending { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// null < bool < number < string < everything else.
fn total_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            compare_scalar(a, b).unwrap_or(Ordering::Equal)
        }
        _ => rank(a).cmp(&rank(b)),
    }
}
