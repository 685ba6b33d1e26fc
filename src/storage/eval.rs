//! Row-level evaluation: field paths, lookups, expressions and aggregates.

use std::cmp::Ordering;
use std::collections::HashSet;

use super::catalog::{Catalog, Relation};
use super::pattern::{eval_like, eval_regex};
use super::record::Record;
use super::schema::PK;
use super::table::Database;
use crate::core::{ModelError, Result, Value};
use crate::query::{Expr, Lookup, Operand, Q};

/// Read-only view used while evaluating one query.
#[derive(Clone, Copy)]
pub struct Ctx<'a> {
    pub catalog: &'a Catalog,
    pub db: &'a Database,
    pub alias: &'a str,
}

pub fn split_path(field: &str) -> Vec<String> {
    field.split("__").map(str::to_string).collect()
}

fn canonical(name: &str) -> &str {
    if name == "pk" { PK } else { name }
}

impl<'a> Ctx<'a> {
    /// Fail early on a path that names nothing on `model`.
    pub fn check_path(&self, model: &str, path: &[String], annotations: &[String]) -> Result<()> {
        let Some((head, rest)) = path.split_first() else {
            return Err(ModelError::InvalidQuery("Empty field path".to_string()));
        };
        let head = canonical(head);
        let schema = self.catalog.get_model(model)?;

        if rest.is_empty() && (schema.is_stored(head) || annotations.iter().any(|a| a == head)) {
            return Ok(());
        }
        match self.catalog.relation(model, head) {
            Some(_) if rest.is_empty() => Ok(()),
            Some(relation) => self.check_path(relation.target(), rest, &[]),
            None => Err(ModelError::field_not_found(model, head)),
        }
    }

    /// Records on the other side of `relation`, seen from `record`.
    pub fn related_records(&self, record: &Record, relation: &Relation) -> Result<Vec<Record>> {
        match relation {
            Relation::Forward(key) => {
                let target = record.get(&key.name).and_then(Value::as_i64);
                Ok(target
                    .and_then(|pk| self.db.record(&key.target, pk, self.alias))
                    .into_iter()
                    .collect())
            }
            Relation::ReverseOne { child, key } | Relation::ReverseMany { child, key } => {
                let Some(pk) = record.pk() else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .db
                    .table(child)?
                    .iter()
                    .filter(|(_, row)| row.get(&key.name).and_then(Value::as_i64) == Some(pk))
                    .map(|(child_pk, row)| Record::from_row(child, child_pk, row, self.alias))
                    .collect())
            }
            Relation::Link(side) => {
                let Some(pk) = record.pk() else {
                    return Ok(Vec::new());
                };
                Ok(self
                    .db
                    .linked(side, pk)?
                    .into_iter()
                    .filter_map(|other| self.db.record(&side.target, other, self.alias))
                    .collect())
            }
        }
    }

    /// Every value reached by `path`; to-many hops fan out.
    pub fn resolve(&self, record: &Record, path: &[String]) -> Result<Vec<Value>> {
        let Some((head, rest)) = path.split_first() else {
            return Ok(Vec::new());
        };
        let head = canonical(head);

        if rest.is_empty() {
            if let Some(value) = record.get(head) {
                return Ok(vec![value.clone()]);
            }
            if self.catalog.get_model(record.model())?.is_stored(head) {
                return Ok(vec![Value::Null]);
            }
        }

        let Some(relation) = self.catalog.relation(record.model(), head) else {
            return Err(ModelError::field_not_found(record.model(), head));
        };
        let related = self.related_records(record, relation)?;

        if rest.is_empty() {
            return Ok(related
                .iter()
                .filter_map(Record::pk)
                .map(Value::Integer)
                .collect());
        }

        let mut values = Vec::new();
        for other in &related {
            values.extend(self.resolve(other, rest)?);
        }
        if values.is_empty() && relation.is_to_one() {
            values.push(Value::Null);
        }
        Ok(values)
    }

    /// First value reached by `path`, `Null` when nothing is reached.
    pub fn resolve_one(&self, record: &Record, path: &[String]) -> Result<Value> {
        Ok(self
            .resolve(record, path)?
            .into_iter()
            .next()
            .unwrap_or(Value::Null))
    }

    pub fn matches(&self, record: &Record, q: &Q) -> Result<bool> {
        match q {
            Q::All => Ok(true),
            Q::And(parts) => {
                for part in parts {
                    if !self.matches(record, part)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Q::Or(parts) => {
                for part in parts {
                    if self.matches(record, part)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Q::Not(inner) => Ok(!self.matches(record, inner)?),
            Q::Condition {
                path,
                lookup,
                operand,
            } => {
                let values = self.resolve(record, path)?;

                let null_test = match (lookup, operand) {
                    (Lookup::IsNull, Operand::Value(want)) => Some(want.as_bool()),
                    (Lookup::Exact, Operand::Value(Value::Null)) => Some(true),
                    _ => None,
                };
                if let Some(want) = null_test {
                    let is_null = values.iter().all(Value::is_null);
                    return Ok(is_null == want);
                }

                for value in &values {
                    if test_lookup(*lookup, value, operand)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Per-row value of an annotation.
    pub fn eval_expr(&self, record: &Record, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::F(field) => self.resolve_one(record, &split_path(field)),
            Expr::Value(value) => Ok(value.clone()),
            aggregate => {
                let values = match aggregate.source() {
                    Some("*") => vec![Value::Integer(1)],
                    Some(field) => self.resolve(record, &split_path(field))?,
                    None => Vec::new(),
                };
                reduce(aggregate, values)
            }
        }
    }

    /// Queryset-wide value of an aggregate.
    pub fn aggregate(&self, records: &[Record], expr: &Expr) -> Result<Value> {
        if !expr.is_aggregate() {
            return Err(ModelError::InvalidQuery(format!(
                "{} is not an aggregate expression",
                expr
            )));
        }
        let mut values = Vec::new();
        for record in records {
            match expr.source() {
                Some("*") => values.push(Value::Integer(1)),
                Some(field) => values.extend(self.resolve(record, &split_path(field))?),
                None => {}
            }
        }
        reduce(expr, values)
    }
}

/// Fold values with an aggregate function; empty input gives `Null`
/// (zero for counts).
pub fn reduce(expr: &Expr, values: Vec<Value>) -> Result<Value> {
    let values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();

    match expr {
        Expr::Count { distinct, .. } => {
            if *distinct {
                let unique: HashSet<&Value> = values.iter().collect();
                Ok(Value::Integer(unique.len() as i64))
            } else {
                Ok(Value::Integer(values.len() as i64))
            }
        }
        Expr::Sum(_) => sum(&values),
        Expr::Avg(_) => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let total = sum(&values)?.as_f64().unwrap_or(0.0);
            Ok(Value::Float(total / values.len() as f64))
        }
        Expr::Min(_) => Ok(extreme(values, Ordering::Less)),
        Expr::Max(_) => Ok(extreme(values, Ordering::Greater)),
        Expr::F(_) | Expr::Value(_) => Err(ModelError::InvalidQuery(format!(
            "{} is not an aggregate expression",
            expr
        ))),
    }
}

fn sum(values: &[Value]) -> Result<Value> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    if let Some(bad) = values.iter().find(|v| !v.is_numeric()) {
        return Err(ModelError::TypeMismatch(format!(
            "Cannot sum values of type {}",
            bad.type_name()
        )));
    }
    if values.iter().all(|v| matches!(v, Value::Integer(_))) {
        Ok(Value::Integer(values.iter().filter_map(Value::as_i64).sum()))
    } else {
        Ok(Value::Float(values.iter().filter_map(Value::as_f64).sum()))
    }
}

fn extreme(values: Vec<Value>, wanted: Ordering) -> Value {
    values
        .into_iter()
        .reduce(|best, v| if v.sort_cmp(&best) == wanted { v } else { best })
        .unwrap_or(Value::Null)
}

fn as_text(value: &Value) -> String {
    match value {
        Value::Text(s) => s.clone(),
        other => other.to_string(),
    }
}

fn operand_value<'o>(lookup: Lookup, operand: &'o Operand) -> Result<&'o Value> {
    operand.as_value().ok_or_else(|| {
        ModelError::InvalidQuery(format!("Lookup '{}' expects a single value", lookup.as_str()))
    })
}

/// Apply one lookup to one non-aggregated field value.
pub fn test_lookup(lookup: Lookup, value: &Value, operand: &Operand) -> Result<bool> {
    if value.is_null() {
        return Ok(false);
    }

    match lookup {
        Lookup::Exact => Ok(value.matches(operand_value(lookup, operand)?)),
        Lookup::IExact => {
            let other = operand_value(lookup, operand)?;
            Ok(!other.is_null() && as_text(value).to_lowercase() == as_text(other).to_lowercase())
        }
        Lookup::Contains
        | Lookup::IContains
        | Lookup::StartsWith
        | Lookup::IStartsWith
        | Lookup::EndsWith
        | Lookup::IEndsWith => {
            let other = operand_value(lookup, operand)?;
            if other.is_null() {
                return Ok(false);
            }
            let insensitive = matches!(
                lookup,
                Lookup::IContains | Lookup::IStartsWith | Lookup::IEndsWith
            );
            let (hay, needle) = if insensitive {
                (as_text(value).to_lowercase(), as_text(other).to_lowercase())
            } else {
                (as_text(value), as_text(other))
            };
            Ok(match lookup {
                Lookup::Contains | Lookup::IContains => hay.contains(&needle),
                Lookup::StartsWith | Lookup::IStartsWith => hay.starts_with(&needle),
                _ => hay.ends_with(&needle),
            })
        }
        Lookup::In => {
            let list = match operand {
                Operand::List(list) => list.as_slice(),
                Operand::Value(single) => std::slice::from_ref(single),
            };
            Ok(list.iter().any(|candidate| value.matches(candidate)))
        }
        Lookup::Gt | Lookup::Gte | Lookup::Lt | Lookup::Lte => {
            let other = operand_value(lookup, operand)?;
            if other.is_null() {
                return Ok(false);
            }
            let ordering = value.compare(other)?;
            Ok(match lookup {
                Lookup::Gt => ordering == Ordering::Greater,
                Lookup::Gte => ordering != Ordering::Less,
                Lookup::Lt => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            })
        }
        Lookup::Range => {
            let Some([low, high]) = operand.as_list() else {
                return Err(ModelError::InvalidQuery(
                    "Lookup 'range' expects exactly two bounds".to_string(),
                ));
            };
            Ok(value.compare(low)? != Ordering::Less && value.compare(high)? != Ordering::Greater)
        }
        Lookup::IsNull => Ok(!operand_value(lookup, operand)?.as_bool()),
        Lookup::Regex | Lookup::IRegex => {
            let pattern = as_text(operand_value(lookup, operand)?);
            eval_regex(&as_text(value), &pattern, lookup == Lookup::Regex)
        }
        Lookup::Like | Lookup::ILike => {
            let pattern = as_text(operand_value(lookup, operand)?);
            eval_like(&as_text(value), &pattern, lookup == Lookup::Like)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(v: impl Into<Value>) -> Operand {
        Operand::Value(v.into())
    }

    #[test]
    fn test_text_lookups() {
        let name = Value::from("Pepperoni");
        assert!(test_lookup(Lookup::IExact, &name, &value("pepperoni")).unwrap());
        assert!(test_lookup(Lookup::StartsWith, &name, &value("Pep")).unwrap());
        assert!(!test_lookup(Lookup::StartsWith, &name, &value("pep")).unwrap());
        assert!(test_lookup(Lookup::IContains, &name, &value("PERO")).unwrap());
        assert!(test_lookup(Lookup::EndsWith, &name, &value("oni")).unwrap());
    }

    #[test]
    fn test_comparisons_and_ranges() {
        let amount = Value::from(19.99);
        assert!(test_lookup(Lookup::Gt, &amount, &value(10)).unwrap());
        assert!(test_lookup(Lookup::Lte, &amount, &value(19.99)).unwrap());
        assert!(test_lookup(Lookup::Range, &amount, &Operand::List(vec![10.into(), 20.into()])).unwrap());
        assert!(test_lookup(Lookup::In, &Value::from(2), &Operand::List(vec![1.into(), 2.into()])).unwrap());
        assert!(!test_lookup(Lookup::Gt, &Value::Null, &value(1)).unwrap());
        assert!(test_lookup(Lookup::Gt, &Value::from("a"), &value(1)).is_err());
    }

    #[test]
    fn test_reduce() {
        let values = vec![Value::from(1), Value::from(2.5), Value::Null];
        assert_eq!(reduce(&Expr::sum("x"), values.clone()).unwrap(), Value::Float(3.5));
        assert_eq!(reduce(&Expr::count("x"), values.clone()).unwrap(), Value::Integer(2));
        assert_eq!(reduce(&Expr::max("x"), values.clone()).unwrap(), Value::Float(2.5));
        assert_eq!(reduce(&Expr::min("x"), values).unwrap(), Value::Integer(1));
        assert_eq!(reduce(&Expr::avg("x"), Vec::new()).unwrap(), Value::Null);
        assert_eq!(
            reduce(&Expr::sum("x"), vec![Value::from(2), Value::from(3)]).unwrap(),
            Value::Integer(5)
        );
        assert_eq!(
            reduce(&Expr::count_distinct("x"), vec![Value::from(2), Value::from(2)]).unwrap(),
            Value::Integer(1)
        );
    }
}
