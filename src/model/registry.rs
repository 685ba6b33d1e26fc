//! Per-model descriptor tables.
//!
//! Each model is introspected once, at registration, into a table mapping
//! every prefixed async accessor name (`atoppings`, `apizza_set`, ...) to the
//! relation it resolves to.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::core::{FieldMeta, ModelError, RelationshipKind, Result};

/// Marker for a model type known to the backend by name.
///
/// ```ignore
/// struct Pizza;
/// impl Model for Pizza {
///     const NAME: &'static str = "pizza";
/// }
/// ```
pub trait Model: 'static {
    const NAME: &'static str;
}

/// What an accessor resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// At most one related record
    One,
    /// Records whose foreign key points at the owner
    ManyToOne,
    /// Records linked through a join table
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    /// Prefixed async accessor name
    pub accessor: String,
    /// Relation name as the backend knows it
    pub relation: String,
    pub kind: RelationshipKind,
    pub target: String,
    pub reverse: bool,
}

impl RelationDescriptor {
    pub fn cardinality(&self) -> Cardinality {
        match self.kind {
            RelationshipKind::OneToOne | RelationshipKind::ManyToOne => Cardinality::One,
            RelationshipKind::OneToMany => Cardinality::ManyToOne,
            RelationshipKind::ManyToMany => Cardinality::ManyToMany,
        }
    }
}

#[derive(Debug)]
pub struct ModelDescriptor {
    name: String,
    fields: Vec<FieldMeta>,
    accessors: BTreeMap<String, Arc<RelationDescriptor>>,
}

impl ModelDescriptor {
    /// Build the accessor table; fails when a prefixed accessor shadows a field.
    pub fn build(name: &str, fields: Vec<FieldMeta>, prefix: &str) -> Result<Self> {
        let mut accessors = BTreeMap::new();

        for field in &fields {
            let Some(relation) = &field.relation else {
                continue;
            };
            let accessor = format!("{}{}", prefix, field.name);

            if fields.iter().any(|other| other.name == accessor) {
                return Err(ModelError::Configuration(format!(
                    "Async accessor '{}' of model '{}' collides with a field of the same name",
                    accessor, name
                )));
            }

            let descriptor = RelationDescriptor {
                accessor: accessor.clone(),
                relation: field.name.clone(),
                kind: relation.kind,
                target: relation.target.clone(),
                reverse: relation.reverse,
            };
            if accessors.insert(accessor.clone(), Arc::new(descriptor)).is_some() {
                return Err(ModelError::Configuration(format!(
                    "Model '{}' declares accessor '{}' twice",
                    name, accessor
                )));
            }
        }

        Ok(Self {
            name: name.to_string(),
            fields,
            accessors,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    pub fn accessor(&self, name: &str) -> Option<&Arc<RelationDescriptor>> {
        self.accessors.get(name)
    }

    pub fn accessor_names(&self) -> impl Iterator<Item = &str> {
        self.accessors.keys().map(String::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

/// Registry of model descriptors keyed by model name.
#[derive(Debug)]
pub struct ModelRegistry {
    prefix: String,
    models: RwLock<HashMap<String, Arc<ModelDescriptor>>>,
}

impl ModelRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register `name` with the given metadata; registering twice returns the
    /// existing descriptor.
    pub fn register(&self, name: &str, fields: Vec<FieldMeta>) -> Result<Arc<ModelDescriptor>> {
        if let Some(existing) = self.models.read()?.get(name) {
            return Ok(Arc::clone(existing));
        }

        let descriptor = Arc::new(ModelDescriptor::build(name, fields, &self.prefix)?);
        let mut models = self.models.write()?;
        let entry = models
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&descriptor));
        debug!(model = name, accessors = entry.accessors.len(), "model registered");
        Ok(Arc::clone(entry))
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        self.models
            .read()?
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models
            .read()
            .map(|models| models.contains_key(name))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|models| models.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
