use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;

/// Why a condition node could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition node must have exactly one of path, allOf, anyOf or not (found {0})")]
    AmbiguousShape(usize),
    #[error("comparator on `{path}` must have exactly one operator (found {found})")]
    OperatorCount { path: String, found: usize },
    #[error("operator given without a path")]
    MissingPath,
    #[error("invalid regex `{pattern}`: {reason}")]
    InvalidRegex { pattern: String, reason: String },
    #[error("`exists` only accepts true; wrap the comparator in `not` instead")]
    ExistsFalse,
}

/// A location query into the payload.
///
/// A path that fails to parse is kept verbatim and matches nothing.
#[derive(Clone, Debug)]
pub struct PathQuery {
    raw: String,
    compiled: Option<JsonPath>,
}

impl PathQuery {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let normalized = if raw.starts_with('$') {
            raw.clone()
        } else if raw.starts_with('[') {
            format!("${raw}")
        } else {
            format!("$.{raw}")
        };
        let compiled = JsonPath::parse(&normalized).ok();
        if compiled.is_none() {
            tracing::warn!(path = %raw, "routing path does not parse; it will never match");
        }
        Self { raw, compiled }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_valid(&self) -> bool {
        self.compiled.is_some()
    }

    /// Every value the query selects in `payload`.
    pub fn select<'a>(&self, payload: &'a Value) -> Vec<&'a Value> {
        match &self.compiled {
            Some(path) => path.query(payload).all(),
            None => Vec::new(),
        }
    }
}

/// Leaf test applied to each value a path selects.
#[derive(Clone, Debug)]
pub enum Operator {
    Exact(Value),
    Match(Regex),
    Exists,
    Lte(f64),
    Gte(f64),
    Lt(f64),
    Gt(f64),
}

impl Operator {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Operator::Exact(expected) => json_eq(value, expected),
            Operator::Match(regex) => value.as_str().is_some_and(|s| regex.is_match(s)),
            Operator::Exists => true,
            Operator::Lte(bound) => number(value).is_some_and(|n| n <= *bound),
            Operator::Gte(bound) => number(value).is_some_and(|n| n >= *bound),
            Operator::Lt(bound) => number(value).is_some_and(|n| n < *bound),
            Operator::Gt(bound) => number(value).is_some_and(|n| n > *bound),
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Structural equality where `1` and `1.0` are the same number.
fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => left == right,
    }
}

/// `{path, op}`: true when at least one selected value satisfies `op`.
#[derive(Clone, Debug)]
pub struct Comparator {
    pub path: PathQuery,
    pub op: Operator,
}

impl Comparator {
    pub fn evaluate(&self, payload: &Value) -> bool {
        self.path
            .select(payload)
            .into_iter()
            .any(|value| self.op.matches(value))
    }
}

/// A routing condition tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    Compare(Comparator),
    AllOf(Vec<Condition>),
    AnyOf(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn evaluate(&self, payload: &Value) -> bool {
        match self {
            Condition::Compare(comparator) => comparator.evaluate(payload),
            Condition::AllOf(conditions) => conditions.iter().all(|c| c.evaluate(payload)),
            Condition::AnyOf(conditions) => conditions.iter().any(|c| c.evaluate(payload)),
            Condition::Not(condition) => !condition.evaluate(payload),
        }
    }

    pub fn compare(path: impl Into<String>, op: Operator) -> Self {
        Condition::Compare(Comparator {
            path: PathQuery::new(path),
            op,
        })
    }

    pub fn exact(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Exact(value.into()))
    }

    pub fn matches(path: impl Into<String>, pattern: &str) -> Result<Self, ConditionError> {
        let regex = compile(pattern)?;
        Ok(Self::compare(path, Operator::Match(regex)))
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::compare(path, Operator::Exists)
    }

    pub fn all_of(conditions: Vec<Condition>) -> Self {
        Condition::AllOf(conditions)
    }

    pub fn any_of(conditions: Vec<Condition>) -> Self {
        Condition::AnyOf(conditions)
    }

    pub fn negate(condition: Condition) -> Self {
        Condition::Not(Box::new(condition))
    }

    /// Every comparator path in the tree that cannot be parsed.
    pub fn invalid_paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_invalid_paths(&mut out);
        out
    }

    fn collect_invalid_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Compare(c) if !c.path.is_valid() => out.push(c.path.as_str()),
            Condition::Compare(_) => {}
            Condition::AllOf(cs) | Condition::AnyOf(cs) => {
                cs.iter().for_each(|c| c.collect_invalid_paths(out))
            }
            Condition::Not(c) => c.collect_invalid_paths(out),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, ConditionError> {
    Regex::new(pattern).map_err(|e| ConditionError::InvalidRegex {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Wire shape of a condition node: every key optional, validated on
/// conversion.
#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    exact: Option<Value>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    all_of: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    any_of: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    not: Option<Box<Condition>>,
}

// `"exact": null` must mean "equals null", not "absent".
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawCondition> for Condition {
    type Error = ConditionError;

    fn try_from(raw: RawCondition) -> Result<Self, Self::Error> {
        let shapes = [
            raw.path.is_some(),
            raw.all_of.is_some(),
            raw.any_of.is_some(),
            raw.not.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();

        let mut operators = Vec::new();
        if let Some(value) = raw.exact {
            operators.push(Operator::Exact(value));
        }
        if let Some(pattern) = raw.pattern.as_deref() {
            operators.push(Operator::Match(compile(pattern)?));
        }
        match raw.exists {
            Some(true) => operators.push(Operator::Exists),
            Some(false) => return Err(ConditionError::ExistsFalse),
            None => {}
        }
        operators.extend(raw.lte.map(Operator::Lte));
        operators.extend(raw.gte.map(Operator::Gte));
        operators.extend(raw.lt.map(Operator::Lt));
        operators.extend(raw.gt.map(Operator::Gt));

        if shapes != 1 {
            if shapes == 0 && !operators.is_empty() {
                return Err(ConditionError::MissingPath);
            }
            return Err(ConditionError::AmbiguousShape(shapes));
        }

        if let Some(path) = raw.path {
            if operators.len() != 1 {
                return Err(ConditionError::OperatorCount {
                    path,
                    found: operators.len(),
                });
            }
            let op = operators.remove(0);
            return Ok(Condition::compare(path, op));
        }

        if !operators.is_empty() {
            return Err(ConditionError::MissingPath);
        }

        if let Some(all_of) = raw.all_of {
            return Ok(Condition::AllOf(all_of));
        }
        if let Some(any_of) = raw.any_of {
            return Ok(Condition::AnyOf(any_of));
        }
        match raw.not {
            Some(not) => Ok(Condition::Not(not)),
            None => Err(ConditionError::AmbiguousShape(0)),
        }
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Compare(Comparator { path, op }) => {
                let mut raw = RawCondition {
                    path: Some(path.raw),
                    ..Default::default()
                };
                match op {
                    Operator::Exact(value) => raw.exact = Some(value),
                    Operator::Match(regex) => raw.pattern = Some(regex.as_str().to_string()),
                    Operator::Exists => raw.exists = Some(true),
                    Operator::Lte(n) => raw.lte = Some(n),
                    Operator::Gte(n) => raw.gte = Some(n),
                    Operator::Lt(n) => raw.lt = Some(n),
                    Operator::Gt(n) => raw.gt = Some(n),
                }
                raw
            }
            Condition::AllOf(all_of) => RawCondition {
                all_of: Some(all_of),
                ..Default::default()
            },
            Condition::AnyOf(any_of) => RawCondition {
                any_of: Some(any_of),
                ..Default::default()
            },
            Condition::Not(not) => RawCondition {
                not: Some(not),
                ..Default::default()
            },
        }
    }
}
