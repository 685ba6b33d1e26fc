//! `raw()` support: a single-table `SELECT` parsed into a filter and an ordering.

use std::collections::BTreeMap;

use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::core::{ModelError, Result, Value};
use crate::query::{Lookup, Operand, Q, RawQuery};

/// What a raw query selects, in queryset terms.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPlan {
    pub table: String,
    pub filter: Q,
    pub ordering: Vec<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Rewrite `%s` placeholders to numbered ones, leaving quoted text alone.
fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut quoted = false;
    let mut index = 0;

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                out.push(c);
            }
            '%' if !quoted && chars.peek() == Some(&'s') => {
                chars.next();
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            c => out.push(c),
        }
    }
    out
}

pub fn plan(query: &RawQuery) -> Result<RawPlan> {
    let sql = number_placeholders(&query.sql);
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, &sql)
        .map_err(|e| ModelError::InvalidQuery(format!("Raw query does not parse: {}", e)))?;
    if statements.len() != 1 {
        return Err(ModelError::InvalidQuery(
            "Raw query must be a single statement".to_string(),
        ));
    }
    let sql_ast::Statement::Query(select_query) = statements.remove(0) else {
        return Err(ModelError::InvalidQuery(
            "Raw query must be a SELECT".to_string(),
        ));
    };

    let converter = Converter {
        params: &query.params,
        translations: &query.translations,
    };
    converter.convert_query(*select_query)
}

struct Converter<'a> {
    params: &'a [Value],
    translations: &'a BTreeMap<String, String>,
}

impl<'a> Converter<'a> {
    fn convert_query(&self, query: sql_ast::Query) -> Result<RawPlan> {
        let sql_ast::SetExpr::Select(select) = *query.body else {
            return Err(ModelError::NotSupported(
                "Only plain SELECT raw queries are supported".to_string(),
            ));
        };

        let [from] = select.from.as_slice() else {
            return Err(ModelError::NotSupported(
                "Raw queries must select from exactly one table".to_string(),
            ));
        };
        if !from.joins.is_empty() {
            return Err(ModelError::NotSupported(
                "Joins are not supported in raw queries".to_string(),
            ));
        }
        let table = match &from.relation {
            sql_ast::TableFactor::Table { name, .. } => name
                .0
                .last()
                .map(|part| part.to_string())
                .ok_or_else(|| ModelError::InvalidQuery("Invalid table name".to_string()))?,
            _ => {
                return Err(ModelError::NotSupported(
                    "Complex table references are not supported in raw queries".to_string(),
                ));
            }
        };

        let filter = match select.selection {
            Some(expr) => self.convert_predicate(expr)?,
            None => Q::All,
        };

        let ordering = self.convert_order_by(query.order_by)?;
        let (offset, limit) = self.convert_limit(query.limit_clause)?;

        Ok(RawPlan {
            table,
            filter,
            ordering,
            offset,
            limit,
        })
    }

    fn convert_order_by(&self, order_by: Option<sql_ast::OrderBy>) -> Result<Vec<String>> {
        let Some(order_by) = order_by else {
            return Ok(Vec::new());
        };
        let sql_ast::OrderByKind::Expressions(exprs) = order_by.kind else {
            return Err(ModelError::NotSupported("ORDER BY ALL is not supported".to_string()));
        };

        exprs
            .into_iter()
            .map(|order| {
                let field = self.field(order.expr)?;
                let descending = order.options.asc.map(|asc| !asc).unwrap_or(false);
                Ok(if descending { format!("-{}", field) } else { field })
            })
            .collect()
    }

    fn convert_limit(&self, clause: Option<sql_ast::LimitClause>) -> Result<(usize, Option<usize>)> {
        let Some(clause) = clause else {
            return Ok((0, None));
        };
        match clause {
            sql_ast::LimitClause::LimitOffset { limit, offset, .. } => {
                let limit = limit.map(|expr| self.count(expr)).transpose()?;
                let offset = offset.map(|o| self.count(o.value)).transpose()?;
                Ok((offset.unwrap_or(0), limit))
            }
            sql_ast::LimitClause::OffsetCommaLimit { offset, limit } => {
                Ok((self.count(offset)?, Some(self.count(limit)?)))
            }
        }
    }

    fn count(&self, expr: sql_ast::Expr) -> Result<usize> {
        self.literal(expr)?
            .as_i64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ModelError::InvalidQuery("LIMIT and OFFSET must be non-negative integers".to_string()))
    }

    fn field(&self, expr: sql_ast::Expr) -> Result<String> {
        let column = match expr {
            sql_ast::Expr::Identifier(ident) => ident.value,
            sql_ast::Expr::CompoundIdentifier(idents) => idents
                .into_iter()
                .last()
                .map(|ident| ident.value)
                .ok_or_else(|| ModelError::InvalidQuery("Empty identifier".to_string()))?,
            other => {
                return Err(ModelError::NotSupported(format!(
                    "Expected a column name in raw query, got {}",
                    other
                )));
            }
        };
        Ok(self
            .translations
            .get(&column)
            .cloned()
            .unwrap_or(column))
    }

    fn literal(&self, expr: sql_ast::Expr) -> Result<Value> {
        let sql_ast::Expr::Value(value) = expr else {
            return Err(ModelError::NotSupported(format!(
                "Expected a literal in raw query, got {}",
                expr
            )));
        };
        match value.value {
            sql_ast::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(Value::Integer(i))
                } else {
                    n.parse::<f64>()
                        .map(Value::Float)
                        .map_err(|_| ModelError::TypeMismatch(format!("Invalid number: {}", n)))
                }
            }
            sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
                Ok(Value::Text(s))
            }
            sql_ast::Value::Boolean(b) => Ok(Value::Boolean(b)),
            sql_ast::Value::Null => Ok(Value::Null),
            sql_ast::Value::Placeholder(name) => {
                let position = name
                    .trim_start_matches('$')
                    .parse::<usize>()
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| {
                        ModelError::InvalidQuery(format!("Unsupported placeholder {}", name))
                    })?;
                self.params.get(position - 1).cloned().ok_or_else(|| {
                    ModelError::InvalidQuery(format!(
                        "Raw query expects at least {} parameters, got {}",
                        position,
                        self.params.len()
                    ))
                })
            }
            other => Err(ModelError::NotSupported(format!(
                "Unsupported literal in raw query: {}",
                other
            ))),
        }
    }

    fn condition(&self, field: String, lookup: Lookup, operand: Operand) -> Q {
        Q::Condition {
            path: vec![field],
            lookup,
            operand,
        }
    }

    fn convert_predicate(&self, expr: sql_ast::Expr) -> Result<Q> {
        use sql_ast::BinaryOperator as Op;

        match expr {
            sql_ast::Expr::Nested(inner) => self.convert_predicate(*inner),
            sql_ast::Expr::UnaryOp {
                op: sql_ast::UnaryOperator::Not,
                expr,
            } => Ok(!self.convert_predicate(*expr)?),
            sql_ast::Expr::BinaryOp { left, op, right } => match op {
                Op::And => Ok(self.convert_predicate(*left)? & self.convert_predicate(*right)?),
                Op::Or => Ok(self.convert_predicate(*left)? | self.convert_predicate(*right)?),
                Op::Eq | Op::NotEq | Op::Gt | Op::GtEq | Op::Lt | Op::LtEq => {
                    self.convert_comparison(*left, op, *right)
                }
                other => Err(ModelError::NotSupported(format!(
                    "Operator {} is not supported in raw queries",
                    other
                ))),
            },
            sql_ast::Expr::IsNull(inner) => Ok(self.condition(
                self.field(*inner)?,
                Lookup::IsNull,
                Operand::Value(Value::Boolean(true)),
            )),
            sql_ast::Expr::IsNotNull(inner) => Ok(self.condition(
                self.field(*inner)?,
                Lookup::IsNull,
                Operand::Value(Value::Boolean(false)),
            )),
            sql_ast::Expr::InList {
                expr,
                list,
                negated,
            } => {
                let values = list
                    .into_iter()
                    .map(|item| self.literal(item))
                    .collect::<Result<Vec<_>>>()?;
                let q = self.condition(self.field(*expr)?, Lookup::In, Operand::List(values));
                Ok(if negated { !q } else { q })
            }
            sql_ast::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let bounds = vec![self.literal(*low)?, self.literal(*high)?];
                let q = self.condition(self.field(*expr)?, Lookup::Range, Operand::List(bounds));
                Ok(if negated { !q } else { q })
            }
            sql_ast::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let q = self.condition(
                    self.field(*expr)?,
                    Lookup::Like,
                    Operand::Value(self.literal(*pattern)?),
                );
                Ok(if negated { !q } else { q })
            }
            sql_ast::Expr::ILike {
                negated,
                expr,
                pattern,
                ..
            } => {
                let q = self.condition(
                    self.field(*expr)?,
                    Lookup::ILike,
                    Operand::Value(self.literal(*pattern)?),
                );
                Ok(if negated { !q } else { q })
            }
            other => Err(ModelError::NotSupported(format!(
                "Unsupported expression in raw query: {}",
                other
            ))),
        }
    }

    fn convert_comparison(
        &self,
        left: sql_ast::Expr,
        op: sql_ast::BinaryOperator,
        right: sql_ast::Expr,
    ) -> Result<Q> {
        use sql_ast::BinaryOperator as Op;

        // `5 < amount` reads as `amount > 5`
        let (column, literal, op) = if matches!(left, sql_ast::Expr::Value(_)) {
            let flipped = match op {
                Op::Gt => Op::Lt,
                Op::GtEq => Op::LtEq,
                Op::Lt => Op::Gt,
                Op::LtEq => Op::GtEq,
                other => other,
            };
            (right, left, flipped)
        } else {
            (left, right, op)
        };

        let field = self.field(column)?;
        let value = Operand::Value(self.literal(literal)?);
        let q = match op {
            Op::Eq => self.condition(field, Lookup::Exact, value),
            Op::NotEq => !self.condition(field, Lookup::Exact, value),
            Op::Gt => self.condition(field, Lookup::Gt, value),
            Op::GtEq => self.condition(field, Lookup::Gte, value),
            Op::Lt => self.condition(field, Lookup::Lt, value),
            _ => self.condition(field, Lookup::Lte, value),
        };
        Ok(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_are_numbered_outside_quotes() {
        assert_eq!(
            number_placeholders("SELECT * FROM t WHERE a = %s AND b = '%s' AND c = %s"),
            "SELECT * FROM t WHERE a = $1 AND b = '%s' AND c = $2"
        );
    }

    #[test]
    fn test_plan_with_params_and_translations() {
        let query = RawQuery::new(
            "SELECT * FROM price WHERE cost > %s AND currency = 'usd' ORDER BY cost DESC LIMIT 2",
        )
        .params([10.0])
        .translate("cost", "amount");
        let plan = plan(&query).unwrap();

        assert_eq!(plan.table, "price");
        assert_eq!(plan.ordering, vec!["-amount".to_string()]);
        assert_eq!(plan.limit, Some(2));
        assert_eq!(
            plan.filter,
            Q::with_lookup("amount", Lookup::Gt, 10.0) & Q::new("currency", "usd")
        );
    }

    #[test]
    fn test_rejects_non_select_and_missing_params() {
        assert!(plan(&RawQuery::new("DELETE FROM price")).is_err());
        let err = plan(&RawQuery::new("SELECT * FROM price WHERE id = %s")).unwrap_err();
        assert!(matches!(err, ModelError::InvalidQuery(_)));
    }

    #[test]
    fn test_flipped_and_set_predicates() {
        let plan = plan(&RawQuery::new(
            "SELECT * FROM price WHERE 5 < amount AND id IN (1, 2) AND note IS NULL",
        ))
        .unwrap();
        let Q::And(parts) = plan.filter else {
            panic!("expected a conjunction");
        };
        assert_eq!(parts[0], Q::with_lookup("amount", Lookup::Gt, 5));
        assert_eq!(parts[1], Q::is_in("id", [1, 2]));
        assert_eq!(parts[2], Q::new("note__isnull", true));
    }
}
