use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::schema::PK;
use crate::core::{Fields, Value};

/// A model instance held by the in-memory backend.
///
/// Saved records carry their primary key under `id`. Related records loaded
/// by `select_related`/`prefetch_related` travel with the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Record {
    model: String,
    fields: Fields,
    annotations: Fields,
    #[serde(skip)]
    related: BTreeMap<String, Option<Box<Record>>>,
    #[serde(skip)]
    prefetched: BTreeMap<String, Vec<Record>>,
    #[serde(skip)]
    deferred: BTreeSet<String>,
    db: Option<String>,
}

impl Record {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub(crate) fn from_row(model: &str, pk: i64, row: &Fields, db: &str) -> Self {
        let mut fields = row.clone();
        fields.insert(PK.to_string(), Value::Integer(pk));
        Self {
            model: model.to_string(),
            fields,
            db: Some(db.to_string()),
            ..Self::default()
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pk(&self) -> Option<i64> {
        self.fields.get(PK).and_then(Value::as_i64)
    }

    pub fn set_pk(&mut self, pk: Option<i64>) {
        match pk {
            Some(pk) => {
                self.fields.insert(PK.to_string(), Value::Integer(pk));
            }
            None => {
                self.fields.remove(PK);
            }
        }
    }

    /// Stored field or annotation; `pk` aliases the primary key.
    pub fn get(&self, field: &str) -> Option<&Value> {
        let field = if field == "pk" { PK } else { field };
        self.fields
            .get(field)
            .or_else(|| self.annotations.get(field))
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        let field = if field == "pk" { PK } else { field };
        self.deferred.remove(field);
        self.fields.insert(field.to_string(), value.into());
    }

    /// Point a relation field at `target`, caching it for later access.
    pub fn set_related(&mut self, field: &str, target: Option<&Record>) {
        let pk = target.and_then(Record::pk);
        self.set(field, pk);
        self.related
            .insert(field.to_string(), target.map(|t| Box::new(t.clone())));
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn annotations(&self) -> &Fields {
        &self.annotations
    }

    /// Related record cached by `select_related`; `None` when not loaded.
    pub fn related(&self, field: &str) -> Option<Option<&Record>> {
        self.related.get(field).map(|r| r.as_deref())
    }

    pub fn prefetched(&self, relation: &str) -> Option<&[Record]> {
        self.prefetched.get(relation).map(Vec::as_slice)
    }

    pub fn is_deferred(&self, field: &str) -> bool {
        self.deferred.contains(field)
    }

    /// Database alias the record was loaded from or saved to.
    pub fn db(&self) -> Option<&str> {
        self.db.as_deref()
    }

    pub(crate) fn set_db(&mut self, alias: &str) {
        self.db = Some(alias.to_string());
    }

    pub(crate) fn annotate(&mut self, name: &str, value: Value) {
        self.annotations.insert(name.to_string(), value);
    }

    pub(crate) fn drop_annotation(&mut self, name: &str) {
        self.annotations.remove(name);
    }

    pub(crate) fn cache_related(&mut self, field: &str, target: Option<Record>) {
        self.related.insert(field.to_string(), target.map(Box::new));
    }

    pub(crate) fn cache_prefetched(&mut self, relation: &str, records: Vec<Record>) {
        self.prefetched.insert(relation.to_string(), records);
    }

    pub(crate) fn defer_field(&mut self, field: &str) {
        if self.fields.remove(field).is_some() {
            self.deferred.insert(field.to_string());
        }
    }

    /// Fields to write on save, without the primary key.
    pub(crate) fn payload(&self) -> Fields {
        self.fields
            .iter()
            .filter(|(name, _)| name.as_str() != PK)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn replace_fields(&mut self, fields: Fields) {
        self.fields = fields;
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        match (self.pk(), other.pk()) {
            (Some(a), Some(b)) => self.model == other.model && a == b,
            _ => self.model == other.model && self.fields == other.fields,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pk() {
            Some(pk) => write!(f, "{} object ({})", self.model, pk),
            None => write!(f, "{} object (None)", self.model),
        }
    }
}

/// One element of an evaluated queryset.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Instance(Record),
    /// `values()` row
    Values(Fields),
    /// `values_list()` row
    Tuple(Vec<Value>),
    /// `values_list(named)` row, in requested order
    Named(Vec<(String, Value)>),
    /// `values_list(flat)`, `dates()` and `datetimes()` element
    Flat(Value),
}

impl Row {
    pub fn as_instance(&self) -> Option<&Record> {
        match self {
            Row::Instance(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_instance(self) -> Option<Record> {
        match self {
            Row::Instance(record) => Some(record),
            _ => None,
        }
    }

    /// Named value from an instance, `values()` or named row.
    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Row::Instance(record) => record.get(field),
            Row::Values(values) => values.get(field),
            Row::Named(pairs) => pairs.iter().find(|(k, _)| k == field).map(|(_, v)| v),
            Row::Tuple(_) | Row::Flat(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Row::Flat(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Row::Tuple(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Row::Instance(record) => write!(f, "<{}>", record),
            Row::Values(values) => {
                let parts: Vec<String> = values.iter().map(|(k, v)| format!("'{k}': {v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Row::Tuple(values) => {
                let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(", "))
            }
            Row::Named(pairs) => {
                let parts: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "Row({})", parts.join(", "))
            }
            Row::Flat(value) => write!(f, "{}", value),
        }
    }
}
