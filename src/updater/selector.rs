//! Label selector parsing and matching
//!
//! Selectors are comma separated clauses joined by AND. Each clause is one of
//! `key=value`, `key!=value`, `key in (a,b)` or `key notin (a,b)`. Values are
//! compared case-insensitively.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

use crate::{Error, Result};

/// Comparison applied by a single clause
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
}

impl Operator {
    fn as_str(self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::In => "in",
            Operator::NotIn => "notin",
        }
    }
}

/// One `key <op> values` term of a selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Clause {
    /// Evaluate the clause against a label set. An absent key never matches.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let Some(actual) = labels.get(&self.key) else {
            return false;
        };
        let any_equal = self.values.iter().any(|v| v.eq_ignore_ascii_case(actual));
        match self.operator {
            Operator::Equals | Operator::In => any_equal,
            Operator::NotEquals | Operator::NotIn => !any_equal,
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals | Operator::NotEquals => {
                let value = self.values.first().map(String::as_str).unwrap_or_default();
                write!(f, "{}{}{}", self.key, self.operator.as_str(), value)
            }
            Operator::In | Operator::NotIn => write!(
                f,
                "{} {} ({})",
                self.key,
                self.operator.as_str(),
                self.values.join(",")
            ),
        }
    }
}

/// Parsed label selector expression
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    clauses: Vec<Clause>,
}

impl Selector {
    /// Parse a selector, dropping malformed clauses with a warning
    pub fn parse(expr: &str) -> Selector {
        let clauses = split_clauses(expr)
            .into_iter()
            .filter_map(|raw| match parse_clause(raw) {
                Ok(clause) => Some(clause),
                Err(reason) => {
                    warn!(clause = raw, selector = expr, "Ignoring malformed selector clause: {}", reason);
                    None
                }
            })
            .collect();
        Selector { clauses }
    }

    /// Parse a selector, failing on the first malformed clause
    pub fn parse_strict(expr: &str) -> Result<Selector> {
        let clauses = split_clauses(expr)
            .into_iter()
            .map(|raw| {
                parse_clause(raw)
                    .map_err(|reason| Error::SelectorError(format!("clause '{}': {}", raw, reason)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Selector { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// True iff every clause matches. An empty selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.clauses.iter().all(|c| c.matches(labels))
    }

    /// Match against object metadata, treating missing labels as an empty set
    pub fn matches_meta(&self, meta: &ObjectMeta) -> bool {
        match &meta.labels {
            Some(labels) => self.matches(labels),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}

/// Split on commas that are not inside parentheses
fn split_clauses(expr: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in expr.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&expr[start..]);
    out.into_iter().filter(|s| !s.trim().is_empty()).collect()
}

fn parse_clause(raw: &str) -> std::result::Result<Clause, String> {
    let raw = raw.trim();

    if let Some((key, rest)) = raw.split_once(" notin (") {
        return set_clause(key, rest, Operator::NotIn);
    }
    if let Some((key, rest)) = raw.split_once(" in (") {
        return set_clause(key, rest, Operator::In);
    }
    if let Some((key, value)) = raw.split_once("!=") {
        return single_clause(key, value, Operator::NotEquals);
    }
    if let Some((key, value)) = raw.split_once('=') {
        return single_clause(key, value, Operator::Equals);
    }

    Err("no operator found".to_string())
}

fn checked_key(key: &str) -> std::result::Result<String, String> {
    let key = key.trim();
    if key.is_empty() {
        return Err("empty key".to_string());
    }
    if key.chars().any(char::is_whitespace) {
        return Err(format!("key '{}' contains whitespace", key));
    }
    Ok(key.to_string())
}

fn single_clause(key: &str, value: &str, operator: Operator) -> std::result::Result<Clause, String> {
    let key = checked_key(key)?;
    let value = value.trim();
    if value.contains('=') {
        return Err(format!("value '{}' contains '='", value));
    }
    Ok(Clause {
        key,
        operator,
        values: vec![value.to_string()],
    })
}

fn set_clause(key: &str, rest: &str, operator: Operator) -> std::result::Result<Clause, String> {
    let key = checked_key(key)?;
    let list = rest
        .trim_end()
        .strip_suffix(')')
        .ok_or_else(|| "value list is not closed with ')'".to_string())?;
    let values: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();
    if values.is_empty() {
        return Err("empty value list".to_string());
    }
    Ok(Clause {
        key,
        operator,
        values,
    })
}
