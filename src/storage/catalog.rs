use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::schema::{Column, ForeignKey, ModelSchema};
use crate::core::{FieldMeta, ModelError, RelationshipKind, Result};

/// One side of a many-to-many link table.
#[derive(Debug, Clone)]
pub struct LinkSide {
    pub table: String,
    /// `true` on the declaring model, whose pk is stored as the link source
    pub forward: bool,
    pub target: String,
    pub through_columns: Vec<Column>,
}

/// A relation as seen from one model.
#[derive(Debug, Clone)]
pub enum Relation {
    /// The model holds the key
    Forward(ForeignKey),
    /// Reverse side of a one-to-one key held by `child`
    ReverseOne { child: String, key: ForeignKey },
    /// Reverse side of a foreign key held by `child`
    ReverseMany { child: String, key: ForeignKey },
    Link(LinkSide),
}

impl Relation {
    pub fn target(&self) -> &str {
        match self {
            Relation::Forward(key) => &key.target,
            Relation::ReverseOne { child, .. } | Relation::ReverseMany { child, .. } => child,
            Relation::Link(side) => &side.target,
        }
    }

    pub fn kind(&self) -> RelationshipKind {
        match self {
            Relation::Forward(key) if key.unique => RelationshipKind::OneToOne,
            Relation::Forward(_) => RelationshipKind::ManyToOne,
            Relation::ReverseOne { .. } => RelationshipKind::OneToOne,
            Relation::ReverseMany { .. } => RelationshipKind::OneToMany,
            Relation::Link(_) => RelationshipKind::ManyToMany,
        }
    }

    pub fn is_reverse(&self) -> bool {
        match self {
            Relation::Forward(_) => false,
            Relation::ReverseOne { .. } | Relation::ReverseMany { .. } => true,
            Relation::Link(side) => !side.forward,
        }
    }

    pub fn is_to_one(&self) -> bool {
        matches!(self, Relation::Forward(_) | Relation::ReverseOne { .. })
    }
}

/// Model schemas plus every relation resolved from both ends.
///
/// Immutable once built; clones share the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: Arc<HashMap<String, Arc<ModelSchema>>>,
    relations: Arc<HashMap<String, BTreeMap<String, Relation>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model; returns a new catalog.
    pub fn with_model(self, schema: ModelSchema) -> Result<Self> {
        let name = schema.name().to_string();
        if self.models.contains_key(&name) {
            return Err(ModelError::Configuration(format!(
                "Model '{}' is declared twice",
                name
            )));
        }
        schema.check_unique_names()?;

        let mut models = (*self.models).clone();
        models.insert(name, Arc::new(schema));
        Ok(Self {
            models: Arc::new(models),
            relations: self.relations,
        })
    }

    /// Resolve relation targets and reverse accessors.
    pub fn resolve(self) -> Result<Self> {
        let mut relations: HashMap<String, BTreeMap<String, Relation>> = self
            .models
            .keys()
            .map(|name| (name.clone(), BTreeMap::new()))
            .collect();

        let mut names: Vec<&String> = self.models.keys().collect();
        names.sort();

        for owner in names {
            let schema = &self.models[owner];

            for key in schema.foreign_keys() {
                self.require(owner, &key.target)?;
                insert_relation(&mut relations, owner, &key.name, Relation::Forward(key.clone()))?;

                let reverse = if key.unique {
                    Relation::ReverseOne {
                        child: owner.clone(),
                        key: key.clone(),
                    }
                } else {
                    Relation::ReverseMany {
                        child: owner.clone(),
                        key: key.clone(),
                    }
                };
                insert_relation(&mut relations, &key.target, &key.reverse_name(owner), reverse)?;
            }

            for m2m in schema.many_to_many_relations() {
                self.require(owner, &m2m.target)?;
                let table = m2m.link_table(owner);
                let forward = LinkSide {
                    table: table.clone(),
                    forward: true,
                    target: m2m.target.clone(),
                    through_columns: m2m.through_columns.clone(),
                };
                let backward = LinkSide {
                    table,
                    forward: false,
                    target: owner.clone(),
                    through_columns: m2m.through_columns.clone(),
                };
                insert_relation(&mut relations, owner, &m2m.name, Relation::Link(forward))?;
                insert_relation(
                    &mut relations,
                    &m2m.target,
                    &m2m.reverse_name(owner),
                    Relation::Link(backward),
                )?;
            }
        }

        Ok(Self {
            models: self.models,
            relations: Arc::new(relations),
        })
    }

    fn require(&self, owner: &str, target: &str) -> Result<()> {
        if self.models.contains_key(target) {
            Ok(())
        } else {
            Err(ModelError::Configuration(format!(
                "Model '{}' relates to unknown model '{}'",
                owner, target
            )))
        }
    }

    pub fn get_model(&self, name: &str) -> Result<&Arc<ModelSchema>> {
        self.models
            .get(name)
            .ok_or_else(|| ModelError::UnknownModel(name.to_string()))
    }

    pub fn model_exists(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn list_models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn relation(&self, model: &str, name: &str) -> Option<&Relation> {
        self.relations.get(model).and_then(|r| r.get(name))
    }

    pub fn relations(&self, model: &str) -> impl Iterator<Item = (&str, &Relation)> {
        self.relations
            .get(model)
            .into_iter()
            .flat_map(|r| r.iter().map(|(name, rel)| (name.as_str(), rel)))
    }

    /// Every link table, each listed once.
    pub fn link_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .relations
            .values()
            .flat_map(|r| r.values())
            .filter_map(|rel| match rel {
                Relation::Link(side) if side.forward => Some(side.table.clone()),
                _ => None,
            })
            .collect();
        tables.sort();
        tables
    }

    /// Field metadata: stored fields, forward relations, reverse accessors.
    pub fn field_meta(&self, model: &str) -> Result<Vec<FieldMeta>> {
        let schema = self.get_model(model)?;
        let mut fields: Vec<FieldMeta> = std::iter::once(super::schema::PK)
            .chain(schema.columns().iter().map(|c| c.name.as_str()))
            .map(FieldMeta::concrete)
            .collect();

        for (name, relation) in self.relations(model) {
            fields.push(FieldMeta::relation(
                name,
                relation.kind(),
                relation.target(),
                relation.is_reverse(),
            ));
        }
        Ok(fields)
    }
}

fn insert_relation(
    relations: &mut HashMap<String, BTreeMap<String, Relation>>,
    model: &str,
    name: &str,
    relation: Relation,
) -> Result<()> {
    let entry = relations.entry(model.to_string()).or_default();
    if entry.insert(name.to_string(), relation).is_some() {
        return Err(ModelError::Configuration(format!(
            "Relation name '{}' is used twice on model '{}'",
            name, model
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::storage::schema::ManyToMany;

    fn catalog() -> Catalog {
        Catalog::new()
            .with_model(ModelSchema::new("box").column(Column::new("name", DataType::Text)))
            .unwrap()
            .with_model(ModelSchema::new("topping").column(Column::new("name", DataType::Text)))
            .unwrap()
            .with_model(
                ModelSchema::new("pizza")
                    .foreign_key(ForeignKey::new("box", "box").nullable())
                    .many_to_many(ManyToMany::new("toppings", "topping")),
            )
            .unwrap()
            .resolve()
            .unwrap()
    }

    #[test]
    fn test_reverse_relations_are_resolved() {
        let catalog = catalog();
        assert!(matches!(
            catalog.relation("box", "pizza_set"),
            Some(Relation::ReverseMany { child, .. }) if child == "pizza"
        ));
        let Some(Relation::Link(side)) = catalog.relation("topping", "pizza_set") else {
            panic!("missing reverse link");
        };
        assert!(!side.forward);
        assert_eq!(side.table, "pizza_toppings");
        assert_eq!(catalog.link_tables(), vec!["pizza_toppings".to_string()]);
    }

    #[test]
    fn test_field_meta_includes_reverse_accessors() {
        let catalog = catalog();
        let fields = catalog.field_meta("box").unwrap();
        let reverse = fields.iter().find(|f| f.name == "pizza_set").unwrap();
        let info = reverse.relation.as_ref().unwrap();
        assert_eq!(info.kind, RelationshipKind::OneToMany);
        assert!(info.reverse);
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let err = Catalog::new()
            .with_model(ModelSchema::new("pizza").foreign_key(ForeignKey::new("box", "box")))
            .unwrap()
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ModelError::Configuration(_)));
    }
}
