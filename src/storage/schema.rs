use serde::{Deserialize, Serialize};

use crate::core::{DataType, ModelError, Result, Value};

/// Name of the implicit integer primary key.
pub const PK: &str = "id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub unique: bool,
    pub default: Option<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            unique: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Check a value against the column and widen it to the storage type.
    pub fn validate(&self, model: &str, value: Value) -> Result<Value> {
        if value.is_null() {
            if !self.nullable {
                return Err(ModelError::Integrity(format!(
                    "NOT NULL constraint failed: {}.{}",
                    model, self.name
                )));
            }
            return Ok(value);
        }

        if !self.data_type.is_compatible(&value) {
            return Err(ModelError::TypeMismatch(format!(
                "Field '{}.{}' expects type {}, got {}",
                model,
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(self.data_type.coerce(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDelete {
    Cascade,
    SetNull,
    Protect,
}

/// A foreign key (or one-to-one key when `unique`) stored under its field name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub target: String,
    pub nullable: bool,
    pub unique: bool,
    pub on_delete: OnDelete,
    pub related_name: Option<String>,
}

impl ForeignKey {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            nullable: false,
            unique: false,
            on_delete: OnDelete::Cascade,
            related_name: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn on_delete(mut self, action: OnDelete) -> Self {
        self.on_delete = action;
        self
    }

    pub fn related_name(mut self, name: &str) -> Self {
        self.related_name = Some(name.to_string());
        self
    }

    /// Accessor name on the target model.
    pub fn reverse_name(&self, owner: &str) -> String {
        match &self.related_name {
            Some(name) => name.clone(),
            None if self.unique => owner.to_string(),
            None => format!("{}_set", owner),
        }
    }
}

/// A many-to-many relation backed by a link table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManyToMany {
    pub name: String,
    pub target: String,
    pub related_name: Option<String>,
    /// Extra columns stored on each link row.
    pub through_columns: Vec<Column>,
}

impl ManyToMany {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            related_name: None,
            through_columns: Vec::new(),
        }
    }

    pub fn related_name(mut self, name: &str) -> Self {
        self.related_name = Some(name.to_string());
        self
    }

    pub fn through_column(mut self, column: Column) -> Self {
        self.through_columns.push(column);
        self
    }

    pub fn link_table(&self, owner: &str) -> String {
        format!("{}_{}", owner, self.name)
    }

    pub fn reverse_name(&self, owner: &str) -> String {
        self.related_name
            .clone()
            .unwrap_or_else(|| format!("{}_set", owner))
    }
}

/// Declarative description of one model.
///
/// ```ignore
/// let pizza = ModelSchema::new("pizza")
///     .column(Column::new("name", DataType::Text).not_null())
///     .foreign_key(ForeignKey::new("box", "box").nullable().on_delete(OnDelete::SetNull))
///     .one_to_one(ForeignKey::new("price", "price").nullable())
///     .many_to_many(ManyToMany::new("toppings", "topping"))
///     .ordering(&["name"]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSchema {
    name: String,
    columns: Vec<Column>,
    foreign_keys: Vec<ForeignKey>,
    many_to_many: Vec<ManyToMany>,
    ordering: Vec<String>,
    get_latest_by: Vec<String>,
}

impl ModelSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            many_to_many: Vec::new(),
            ordering: Vec::new(),
            get_latest_by: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn foreign_key(mut self, key: ForeignKey) -> Self {
        self.foreign_keys.push(key);
        self
    }

    pub fn one_to_one(mut self, mut key: ForeignKey) -> Self {
        key.unique = true;
        self.foreign_keys.push(key);
        self
    }

    pub fn many_to_many(mut self, relation: ManyToMany) -> Self {
        self.many_to_many.push(relation);
        self
    }

    /// Default ordering applied when a query has none.
    pub fn ordering(mut self, fields: &[&str]) -> Self {
        self.ordering = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn get_latest_by(mut self, fields: &[&str]) -> Self {
        self.get_latest_by = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn many_to_many_relations(&self) -> &[ManyToMany] {
        &self.many_to_many
    }

    pub fn default_ordering(&self) -> &[String] {
        &self.ordering
    }

    pub fn latest_by(&self) -> &[String] {
        &self.get_latest_by
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_foreign_key(&self, name: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|k| k.name == name)
    }

    pub fn get_many_to_many(&self, name: &str) -> Option<&ManyToMany> {
        self.many_to_many.iter().find(|m| m.name == name)
    }

    /// Whether `name` is stored on the row (primary key, column or foreign key).
    pub fn is_stored(&self, name: &str) -> bool {
        name == PK || self.get_column(name).is_some() || self.get_foreign_key(name).is_some()
    }

    /// Stored field names in declaration order, primary key first.
    pub fn stored_fields(&self) -> Vec<String> {
        std::iter::once(PK.to_string())
            .chain(self.columns.iter().map(|c| c.name.clone()))
            .chain(self.foreign_keys.iter().map(|k| k.name.clone()))
            .collect()
    }

    pub(crate) fn check_unique_names(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let names = self
            .stored_fields()
            .into_iter()
            .chain(self.many_to_many.iter().map(|m| m.name.clone()));
        for name in names {
            if !seen.insert(name.clone()) {
                return Err(ModelError::Configuration(format!(
                    "Model '{}' declares field '{}' twice",
                    self.name, name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_validation() {
        let amount = Column::new("amount", DataType::Float).not_null();
        assert_eq!(
            amount.validate("price", Value::Integer(10)).unwrap(),
            Value::Float(10.0)
        );
        assert!(matches!(
            amount.validate("price", Value::Null).unwrap_err(),
            ModelError::Integrity(_)
        ));
        assert!(matches!(
            amount.validate("price", Value::from("ten")).unwrap_err(),
            ModelError::TypeMismatch(_)
        ));
    }

    #[test]
    fn test_reverse_names() {
        let fk = ForeignKey::new("box", "box");
        assert_eq!(fk.reverse_name("pizza"), "pizza_set");

        let schema = ModelSchema::new("pizza").one_to_one(ForeignKey::new("price", "price"));
        assert_eq!(schema.get_foreign_key("price").unwrap().reverse_name("pizza"), "pizza");

        let m2m = ManyToMany::new("toppings", "topping").related_name("pizzas");
        assert_eq!(m2m.reverse_name("pizza"), "pizzas");
        assert_eq!(m2m.link_table("pizza"), "pizza_toppings");
    }

    #[test]
    fn test_duplicate_field_is_rejected() {
        let schema = ModelSchema::new("pizza")
            .column(Column::new("box", DataType::Text))
            .foreign_key(ForeignKey::new("box", "box"));
        assert!(schema.check_unique_names().is_err());
        assert_eq!(
            ModelSchema::new("box").column(Column::new("name", DataType::Text)).stored_fields(),
            vec!["id".to_string(), "name".to_string()]
        );
    }
}
