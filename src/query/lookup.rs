//! Filter predicates and value expressions.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

use serde::{Deserialize, Serialize};

use crate::core::Value;

/// Comparison applied by a single filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    IsNull,
    Regex,
    IRegex,
    /// SQL `LIKE`; only produced by raw queries
    Like,
    /// SQL `ILIKE`; only produced by raw queries
    ILike,
}

impl Lookup {
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        let lookup = match suffix {
            "exact" => Self::Exact,
            "iexact" => Self::IExact,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            "in" => Self::In,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "range" => Self::Range,
            "isnull" => Self::IsNull,
            "regex" => Self::Regex,
            "iregex" => Self::IRegex,
            _ => return None,
        };
        Some(lookup)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Range => "range",
            Self::IsNull => "isnull",
            Self::Regex => "regex",
            Self::IRegex => "iregex",
            Self::Like => "like",
            Self::ILike => "ilike",
        }
    }
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(Value),
    List(Vec<Value>),
}

impl Operand {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(values) => Some(values),
            Self::Value(_) => None,
        }
    }
}

/// A filter predicate
///
/// Conditions are written as `"field__lookup"`, where the path
/// may traverse forward relations (`"box__name"`) and a missing lookup means
/// `exact`. Predicates compose with `&`, `|` and `!`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Q {
    /// Matches everything
    All,
    Condition {
        path: Vec<String>,
        lookup: Lookup,
        operand: Operand,
    },
    And(Vec<Q>),
    Or(Vec<Q>),
    Not(Box<Q>),
}

impl Q {
    /// Condition from a `field__lookup` key.
    pub fn new(key: &str, value: impl Into<Value>) -> Self {
        let (path, lookup) = split_key(key);
        let value = value.into();
        let operand = match (lookup, value) {
            (Lookup::In | Lookup::Range, Value::Null) => Operand::List(Vec::new()),
            (_, value) => Operand::Value(value),
        };
        Q::Condition {
            path,
            lookup,
            operand,
        }
    }

    /// `field__in` condition.
    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Q::Condition {
            path: split_path(field),
            lookup: Lookup::In,
            operand: Operand::List(values.into_iter().map(Into::into).collect()),
        }
    }

    /// `field__range` condition, both ends inclusive.
    pub fn range(field: &str, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        Q::Condition {
            path: split_path(field),
            lookup: Lookup::Range,
            operand: Operand::List(vec![low.into(), high.into()]),
        }
    }

    pub fn with_lookup(field: &str, lookup: Lookup, value: impl Into<Value>) -> Self {
        Q::Condition {
            path: split_path(field),
            lookup,
            operand: Operand::Value(value.into()),
        }
    }

    /// Conjunction of `field = value` conditions.
    pub fn from_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let conditions: Vec<Q> = fields
            .into_iter()
            .map(|(key, value)| Q::new(key, value.clone()))
            .collect();
        match conditions.len() {
            0 => Q::All,
            1 => conditions.into_iter().next().unwrap_or(Q::All),
            _ => Q::And(conditions),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Q::All)
    }
}

fn split_path(field: &str) -> Vec<String> {
    field.split("__").map(str::to_string).collect()
}

fn split_key(key: &str) -> (Vec<String>, Lookup) {
    let mut path = split_path(key);
    if path.len() > 1
        && let Some(lookup) = path.last().and_then(|last| Lookup::from_suffix(last))
    {
        path.pop();
        return (path, lookup);
    }
    (path, Lookup::Exact)
}

impl BitAnd for Q {
    type Output = Q;

    fn bitand(self, rhs: Q) -> Q {
        match (self, rhs) {
            (Q::All, other) | (other, Q::All) => other,
            (Q::And(mut left), Q::And(right)) => {
                left.extend(right);
                Q::And(left)
            }
            (Q::And(mut left), right) => {
                left.push(right);
                Q::And(left)
            }
            (left, right) => Q::And(vec![left, right]),
        }
    }
}

impl BitOr for Q {
    type Output = Q;

    fn bitor(self, rhs: Q) -> Q {
        match (self, rhs) {
            (Q::All, _) | (_, Q::All) => Q::All,
            (Q::Or(mut left), Q::Or(right)) => {
                left.extend(right);
                Q::Or(left)
            }
            (Q::Or(mut left), right) => {
                left.push(right);
                Q::Or(left)
            }
            (left, right) => Q::Or(vec![left, right]),
        }
    }
}

impl Not for Q {
    type Output = Q;

    fn not(self) -> Q {
        match self {
            Q::Not(inner) => *inner,
            other => Q::Not(Box::new(other)),
        }
    }
}

impl fmt::Display for Q {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Q::All => write!(f, "TRUE"),
            Q::Condition {
                path,
                lookup,
                operand,
            } => {
                write!(f, "{} {} ", path.join("."), lookup.as_str().to_uppercase())?;
                match operand {
                    Operand::Value(Value::Text(s)) => write!(f, "'{}'", s),
                    Operand::Value(v) => write!(f, "{}", v),
                    Operand::List(values) => {
                        let items: Vec<String> = values.iter().map(ToString::to_string).collect();
                        write!(f, "({})", items.join(", "))
                    }
                }
            }
            Q::And(parts) => write_joined(f, parts, " AND "),
            Q::Or(parts) => write_joined(f, parts, " OR "),
            Q::Not(inner) => write!(f, "NOT ({})", inner),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Q], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", part)?;
    }
    write!(f, ")")
}

/// Value expression used by annotations, aliases, `values()` and aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a field (or relation path) on the row
    F(String),
    Value(Value),
    Count { field: String, distinct: bool },
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl Expr {
    pub fn f(field: &str) -> Self {
        Self::F(field.to_string())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn count(field: &str) -> Self {
        Self::Count {
            field: field.to_string(),
            distinct: false,
        }
    }

    pub fn count_distinct(field: &str) -> Self {
        Self::Count {
            field: field.to_string(),
            distinct: true,
        }
    }

    pub fn sum(field: &str) -> Self {
        Self::Sum(field.to_string())
    }

    pub fn avg(field: &str) -> Self {
        Self::Avg(field.to_string())
    }

    pub fn min(field: &str) -> Self {
        Self::Min(field.to_string())
    }

    pub fn max(field: &str) -> Self {
        Self::Max(field.to_string())
    }

    pub fn is_aggregate(&self) -> bool {
        !matches!(self, Self::F(_) | Self::Value(_))
    }

    /// Field the expression reads, if any.
    pub fn source(&self) -> Option<&str> {
        match self {
            Self::F(field)
            | Self::Count { field, .. }
            | Self::Sum(field)
            | Self::Avg(field)
            | Self::Min(field)
            | Self::Max(field) => Some(field),
            Self::Value(_) => None,
        }
    }

    /// Alias an unnamed aggregate gets, e.g. `amount__sum`.
    pub fn default_alias(&self) -> Option<String> {
        let (field, function) = match self {
            Self::Count { field, .. } => (field, "count"),
            Self::Sum(field) => (field, "sum"),
            Self::Avg(field) => (field, "avg"),
            Self::Min(field) => (field, "min"),
            Self::Max(field) => (field, "max"),
            _ => return None,
        };
        Some(format!("{}__{}", field, function))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F(field) => write!(f, "F({})", field),
            Self::Value(v) => write!(f, "Value({})", v),
            Self::Count { field, distinct } => {
                if *distinct {
                    write!(f, "Count(DISTINCT {})", field)
                } else {
                    write!(f, "Count({})", field)
                }
            }
            Self::Sum(field) => write!(f, "Sum({})", field),
            Self::Avg(field) => write!(f, "Avg({})", field),
            Self::Min(field) => write!(f, "Min({})", field),
            Self::Max(field) => write!(f, "Max({})", field),
        }
    }
}
