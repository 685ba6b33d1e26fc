//! Argument types for narrowing and executing operations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::Value;

/// Granularity for `dates()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatePart {
    Year,
    Month,
    Week,
    Day,
}

/// Granularity for `datetimes()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateTimePart {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Shape of the tuples produced by `values_list()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValuesListMode {
    #[default]
    Tuple,
    /// Single field, yields bare values
    Flat,
    /// Tuples with field names attached
    Named,
}

/// Options of `select_for_update()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    pub nowait: bool,
    pub skip_locked: bool,
    pub of: Vec<String>,
    pub no_key: bool,
}

impl LockOptions {
    pub fn nowait(mut self) -> Self {
        self.nowait = true;
        self
    }

    pub fn skip_locked(mut self) -> Self {
        self.skip_locked = true;
        self
    }

    pub fn of(mut self, relations: &[&str]) -> Self {
        self.of = relations.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn no_key(mut self) -> Self {
        self.no_key = true;
        self
    }
}

impl fmt::Display for LockOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.no_key {
            write!(f, "FOR NO KEY UPDATE")?;
        } else {
            write!(f, "FOR UPDATE")?;
        }
        if !self.of.is_empty() {
            write!(f, " OF {}", self.of.join(", "))?;
        }
        if self.nowait {
            write!(f, " NOWAIT")?;
        }
        if self.skip_locked {
            write!(f, " SKIP LOCKED")?;
        }
        Ok(())
    }
}

/// A raw SQL query with positional `%s` parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawQuery {
    pub sql: String,
    pub params: Vec<Value>,
    /// Maps query column names to model field names
    pub translations: BTreeMap<String, String>,
    pub using: Option<String>,
}

impl RawQuery {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            ..Self::default()
        }
    }

    pub fn params<V: Into<Value>>(mut self, params: impl IntoIterator<Item = V>) -> Self {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn translate(mut self, column: &str, field: &str) -> Self {
        self.translations.insert(column.to_string(), field.to_string());
        self
    }

    pub fn using(mut self, alias: &str) -> Self {
        self.using = Some(alias.to_string());
        self
    }
}

/// Options of `bulk_create()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    pub batch_size: Option<usize>,
    pub ignore_conflicts: bool,
}

impl BulkOptions {
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn ignore_conflicts(mut self) -> Self {
        self.ignore_conflicts = true;
        self
    }
}

/// Default chunk size of `iterator()`.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;
