use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Value;

/// Named field values, used for create/update payloads, lookups and defaults.
pub type Fields = BTreeMap<String, Value>;

/// The type of relationship a field describes, seen from the model that owns the field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// One-to-one: a `Pizza` has one `Price` (or the reverse side of it).
    OneToOne,
    /// Many-to-one: many `Pizza`s reference one `Box` through a foreign key.
    #[default]
    ManyToOne,
    /// One-to-many: a `Box` sees the `Pizza`s pointing at it.
    OneToMany,
    /// Many-to-many: `Pizza`s have many `Topping`s through a join table.
    ManyToMany,
}

impl RelationshipKind {
    /// Relations that resolve to at most one related record.
    pub fn is_to_one(&self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToOne)
    }
}

/// Relation details attached to a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub kind: RelationshipKind,
    /// Name of the related model.
    pub target: String,
    /// True when the field is the implicit reverse side of a relation declared elsewhere.
    pub reverse: bool,
}

/// Field metadata a backend reports for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub relation: Option<RelationInfo>,
}

impl FieldMeta {
    pub fn concrete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relation: None,
        }
    }

    pub fn relation(
        name: impl Into<String>,
        kind: RelationshipKind,
        target: impl Into<String>,
        reverse: bool,
    ) -> Self {
        Self {
            name: name.into(),
            relation: Some(RelationInfo {
                kind,
                target: target.into(),
                reverse,
            }),
        }
    }

    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }
}

/// Options forwarded verbatim to a backend save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveOptions {
    pub force_insert: bool,
    pub force_update: bool,
    pub using: Option<String>,
    pub update_fields: Option<Vec<String>>,
}

impl SaveOptions {
    pub fn force_insert(mut self) -> Self {
        self.force_insert = true;
        self
    }

    pub fn force_update(mut self) -> Self {
        self.force_update = true;
        self
    }

    pub fn using(mut self, alias: &str) -> Self {
        self.using = Some(alias.to_string());
        self
    }

    pub fn update_fields(mut self, fields: &[&str]) -> Self {
        self.update_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }
}

/// Options forwarded verbatim to a backend delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub using: Option<String>,
    pub keep_parents: bool,
}

impl DeleteOptions {
    pub fn using(mut self, alias: &str) -> Self {
        self.using = Some(alias.to_string());
        self
    }

    pub fn keep_parents(mut self) -> Self {
        self.keep_parents = true;
        self
    }
}

/// Rows removed by a delete, in total and per model (join tables included).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSummary {
    pub total: usize,
    pub per_model: BTreeMap<String, usize>,
}

impl DeleteSummary {
    pub fn record(&mut self, model: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.total += count;
        *self.per_model.entry(model.to_string()).or_insert(0) += count;
    }

    pub fn merge(&mut self, other: DeleteSummary) {
        for (model, count) in other.per_model {
            self.record(&model, count);
        }
    }
}
