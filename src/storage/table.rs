use std::collections::{BTreeMap, BTreeSet};

use im::{HashMap as ImHashMap, OrdMap, Vector};

use super::catalog::{Catalog, LinkSide, Relation};
use super::record::Record;
use super::schema::{ModelSchema, OnDelete, PK};
use crate::core::{DeleteSummary, Fields, ModelError, Result, Value};

/// Rows of one model keyed by primary key.
#[derive(Debug, Clone, Default)]
pub struct Table {
    rows: OrdMap<i64, Fields>,
    last_id: i64,
}

impl Table {
    pub fn get(&self, pk: i64) -> Option<&Fields> {
        self.rows.get(&pk)
    }

    pub fn contains(&self, pk: i64) -> bool {
        self.rows.contains_key(&pk)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &Fields)> {
        self.rows.iter().map(|(pk, row)| (*pk, row))
    }

    pub fn pks(&self) -> Vec<i64> {
        self.rows.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn allocate(&mut self, requested: Option<i64>) -> i64 {
        match requested {
            Some(pk) => {
                self.last_id = self.last_id.max(pk);
                pk
            }
            None => {
                self.last_id += 1;
                self.last_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkRow {
    /// Primary key on the declaring side
    pub source: i64,
    pub target: i64,
    pub extra: Fields,
}

impl LinkRow {
    fn owner(&self, side: &LinkSide) -> i64 {
        if side.forward { self.source } else { self.target }
    }

    fn other(&self, side: &LinkSide) -> i64 {
        if side.forward { self.target } else { self.source }
    }
}

/// Rows of a many-to-many link table, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct LinkTable {
    rows: Vector<LinkRow>,
}

impl LinkTable {
    pub fn rows(&self) -> impl Iterator<Item = &LinkRow> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn retain<F: Fn(&LinkRow) -> bool>(&mut self, keep: F) -> usize {
        let before = self.rows.len();
        self.rows = self.rows.iter().filter(|row| keep(row)).cloned().collect();
        before - self.rows.len()
    }
}

/// Every table of one database alias.
///
/// Clones are cheap and share structure, so writers work on a copy and
/// publish it only when the whole operation succeeded.
#[derive(Debug, Clone, Default)]
pub struct Database {
    tables: ImHashMap<String, Table>,
    links: ImHashMap<String, LinkTable>,
}

impl Database {
    pub fn new(catalog: &Catalog) -> Self {
        let mut db = Self::default();
        for model in catalog.list_models() {
            db.tables.insert(model.to_string(), Table::default());
        }
        for table in catalog.link_tables() {
            db.links.insert(table, LinkTable::default());
        }
        db
    }

    pub fn table(&self, model: &str) -> Result<&Table> {
        self.tables
            .get(model)
            .ok_or_else(|| ModelError::UnknownModel(model.to_string()))
    }

    fn table_mut(&mut self, model: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(model)
            .ok_or_else(|| ModelError::UnknownModel(model.to_string()))
    }

    pub fn links(&self, table: &str) -> Result<&LinkTable> {
        self.links
            .get(table)
            .ok_or_else(|| ModelError::Configuration(format!("Unknown link table '{}'", table)))
    }

    fn links_mut(&mut self, table: &str) -> Result<&mut LinkTable> {
        self.links
            .get_mut(table)
            .ok_or_else(|| ModelError::Configuration(format!("Unknown link table '{}'", table)))
    }

    pub fn record(&self, model: &str, pk: i64, alias: &str) -> Option<Record> {
        let row = self.tables.get(model)?.get(pk)?;
        Some(Record::from_row(model, pk, row, alias))
    }

    pub fn records(&self, model: &str, alias: &str) -> Result<Vec<Record>> {
        Ok(self
            .table(model)?
            .iter()
            .map(|(pk, row)| Record::from_row(model, pk, row, alias))
            .collect())
    }

    /// Primary keys linked to `owner` through `side`, in link order.
    pub fn linked(&self, side: &LinkSide, owner: i64) -> Result<Vec<i64>> {
        Ok(self
            .links(&side.table)?
            .rows()
            .filter(|row| row.owner(side) == owner)
            .map(|row| row.other(side))
            .collect())
    }

    pub fn link_rows(&self, side: &LinkSide, owner: i64) -> Result<Vec<LinkRow>> {
        Ok(self
            .links(&side.table)?
            .rows()
            .filter(|row| row.owner(side) == owner)
            .cloned()
            .collect())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert a row and return its primary key.
    pub fn insert(&mut self, catalog: &Catalog, model: &str, mut input: Fields) -> Result<i64> {
        let schema = catalog.get_model(model)?;
        let requested = match input.remove(PK) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| {
                ModelError::TypeMismatch(format!(
                    "Primary key of '{}' must be an integer, got {}",
                    model,
                    value.type_name()
                ))
            })?),
        };

        let row = self.normalize(catalog, schema, input, false)?;
        self.check_unique(schema, &row, None)?;

        let table = self.table_mut(model)?;
        if let Some(pk) = requested
            && table.contains(pk)
        {
            return Err(ModelError::Integrity(format!(
                "UNIQUE constraint failed: {}.{}",
                model, PK
            )));
        }
        let pk = table.allocate(requested);
        table.rows.insert(pk, row);
        Ok(pk)
    }

    /// Apply `changes` to an existing row; `false` when the row is gone.
    pub fn update(
        &mut self,
        catalog: &Catalog,
        model: &str,
        pk: i64,
        mut changes: Fields,
    ) -> Result<bool> {
        let schema = catalog.get_model(model)?;
        changes.remove(PK);
        let Some(existing) = self.table(model)?.get(pk).cloned() else {
            return Ok(false);
        };

        let changes = self.normalize(catalog, schema, changes, true)?;
        let mut row = existing;
        row.extend(changes);
        self.check_unique(schema, &row, Some(pk))?;

        self.table_mut(model)?.rows.insert(pk, row);
        Ok(true)
    }

    /// Delete rows of `model` and everything that cascades from them.
    pub fn delete(&mut self, catalog: &Catalog, model: &str, pks: Vec<i64>) -> Result<DeleteSummary> {
        let mut doomed: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        let mut nulled: Vec<(String, String, i64)> = Vec::new();
        let mut queue = vec![(model.to_string(), pks)];

        while let Some((current, pks)) = queue.pop() {
            let table = self.table(&current)?;
            let entry = doomed.entry(current.clone()).or_default();
            let fresh: Vec<i64> = pks
                .into_iter()
                .filter(|pk| table.contains(*pk) && entry.insert(*pk))
                .collect();
            if fresh.is_empty() {
                continue;
            }

            for (_, relation) in catalog.relations(&current) {
                let (Relation::ReverseOne { child, key } | Relation::ReverseMany { child, key }) =
                    relation
                else {
                    continue;
                };
                let children: Vec<i64> = self
                    .table(child)?
                    .iter()
                    .filter(|(_, row)| {
                        row.get(&key.name)
                            .and_then(Value::as_i64)
                            .is_some_and(|fk| fresh.contains(&fk))
                    })
                    .map(|(pk, _)| pk)
                    .collect();
                if children.is_empty() {
                    continue;
                }

                match key.on_delete {
                    OnDelete::Cascade => queue.push((child.clone(), children)),
                    OnDelete::SetNull => nulled.extend(
                        children
                            .into_iter()
                            .map(|pk| (child.clone(), key.name.clone(), pk)),
                    ),
                    OnDelete::Protect => {
                        return Err(ModelError::Integrity(format!(
                            "Cannot delete some instances of model '{}' because they are \
                             referenced through protected foreign key '{}.{}'",
                            current, child, key.name
                        )));
                    }
                }
            }
        }

        for (child, field, pk) in nulled {
            if doomed.get(&child).is_some_and(|pks| pks.contains(&pk)) {
                continue;
            }
            if let Some(row) = self.table_mut(&child)?.rows.get_mut(&pk) {
                row.insert(field, Value::Null);
            }
        }

        let mut summary = DeleteSummary::default();
        for (current, pks) in &doomed {
            let sides: Vec<LinkSide> = catalog
                .relations(current)
                .filter_map(|(_, relation)| match relation {
                    Relation::Link(side) => Some(side.clone()),
                    _ => None,
                })
                .collect();
            for side in sides {
                let removed = self
                    .links_mut(&side.table)?
                    .retain(|row| !pks.contains(&row.owner(&side)));
                summary.record(&side.table, removed);
            }
        }
        for (current, pks) in doomed {
            let table = self.table_mut(&current)?;
            let mut removed = 0;
            for pk in pks {
                if table.rows.remove(&pk).is_some() {
                    removed += 1;
                }
            }
            summary.record(&current, removed);
        }
        Ok(summary)
    }

    /// Add a link row unless the pair is already linked.
    pub fn link(&mut self, side: &LinkSide, owner: i64, other: i64, extra: Fields) -> Result<bool> {
        let (source, target) = if side.forward { (owner, other) } else { (other, owner) };
        let links = self.links_mut(&side.table)?;
        if links
            .rows()
            .any(|row| row.source == source && row.target == target)
        {
            return Ok(false);
        }
        links.rows.push_back(LinkRow {
            source,
            target,
            extra,
        });
        Ok(true)
    }

    pub fn unlink(&mut self, side: &LinkSide, owner: i64, others: &[i64]) -> Result<usize> {
        Ok(self
            .links_mut(&side.table)?
            .retain(|row| !(row.owner(side) == owner && others.contains(&row.other(side)))))
    }

    pub fn unlink_all(&mut self, side: &LinkSide, owner: i64) -> Result<usize> {
        Ok(self
            .links_mut(&side.table)?
            .retain(|row| row.owner(side) != owner))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    fn normalize(
        &self,
        catalog: &Catalog,
        schema: &ModelSchema,
        input: Fields,
        partial: bool,
    ) -> Result<Fields> {
        let model = schema.name();
        let mut row = Fields::new();

        for (name, value) in input {
            if let Some(column) = schema.get_column(&name) {
                row.insert(name, column.validate(model, value)?);
            } else if let Some(key) = schema.get_foreign_key(&name) {
                let value = self.check_foreign_key(catalog, model, &key.name, &key.target, key.nullable, value)?;
                row.insert(name, value);
            } else if schema.get_many_to_many(&name).is_some() {
                return Err(ModelError::InvalidQuery(format!(
                    "Direct assignment to the forward side of a many-to-many set is prohibited. \
                     Use {}.set() instead.",
                    name
                )));
            } else if catalog.relation(model, &name).is_some() {
                return Err(ModelError::InvalidQuery(format!(
                    "Direct assignment to the reverse side of a related set is prohibited. \
                     Use {}.set() instead.",
                    name
                )));
            } else {
                return Err(ModelError::field_not_found(model, name));
            }
        }

        if !partial {
            for column in schema.columns() {
                if !row.contains_key(&column.name) {
                    let value = column.default.clone().unwrap_or(Value::Null);
                    row.insert(column.name.clone(), column.validate(model, value)?);
                }
            }
            for key in schema.foreign_keys() {
                if !row.contains_key(&key.name) {
                    if !key.nullable {
                        return Err(ModelError::Integrity(format!(
                            "NOT NULL constraint failed: {}.{}",
                            model, key.name
                        )));
                    }
                    row.insert(key.name.clone(), Value::Null);
                }
            }
        }
        Ok(row)
    }

    fn check_foreign_key(
        &self,
        catalog: &Catalog,
        model: &str,
        field: &str,
        target: &str,
        nullable: bool,
        value: Value,
    ) -> Result<Value> {
        if value.is_null() {
            if !nullable {
                return Err(ModelError::Integrity(format!(
                    "NOT NULL constraint failed: {}.{}",
                    model, field
                )));
            }
            return Ok(value);
        }

        let pk = value.as_i64().ok_or_else(|| {
            ModelError::TypeMismatch(format!(
                "Field '{}.{}' expects a primary key of '{}', got {}",
                model,
                field,
                target,
                value.type_name()
            ))
        })?;
        catalog.get_model(target)?;
        if !self.table(target)?.contains(pk) {
            return Err(ModelError::Integrity(format!(
                "FOREIGN KEY constraint failed: {}.{} references missing {} {}",
                model, field, target, pk
            )));
        }
        Ok(Value::Integer(pk))
    }

    fn check_unique(&self, schema: &ModelSchema, row: &Fields, exclude: Option<i64>) -> Result<()> {
        let unique_fields = schema
            .columns()
            .iter()
            .filter(|c| c.unique)
            .map(|c| c.name.as_str())
            .chain(
                schema
                    .foreign_keys()
                    .iter()
                    .filter(|k| k.unique)
                    .map(|k| k.name.as_str()),
            );

        let table = self.table(schema.name())?;
        for field in unique_fields {
            let Some(value) = row.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = table.iter().any(|(pk, other)| {
                Some(pk) != exclude && other.get(field).is_some_and(|v| v.matches(value))
            });
            if clash {
                return Err(ModelError::Integrity(format!(
                    "UNIQUE constraint failed: {}.{}",
                    schema.name(),
                    field
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DataType;
    use crate::fields;
    use crate::storage::schema::{Column, ForeignKey, ManyToMany};

    fn catalog() -> Catalog {
        Catalog::new()
            .with_model(ModelSchema::new("box").column(Column::new("name", DataType::Text)))
            .unwrap()
            .with_model(
                ModelSchema::new("topping").column(Column::new("name", DataType::Text).unique()),
            )
            .unwrap()
            .with_model(
                ModelSchema::new("pizza")
                    .column(Column::new("name", DataType::Text).not_null())
                    .foreign_key(ForeignKey::new("box", "box").nullable().on_delete(OnDelete::SetNull))
                    .many_to_many(ManyToMany::new("toppings", "topping")),
            )
            .unwrap()
            .resolve()
            .unwrap()
    }

    #[test]
    fn test_insert_validates_and_allocates() {
        let catalog = catalog();
        let mut db = Database::new(&catalog);

        let first = db.insert(&catalog, "topping", fields! { "name" => "ham" }).unwrap();
        let second = db.insert(&catalog, "topping", fields! { "name" => "egg" }).unwrap();
        assert_eq!((first, second), (1, 2));

        let dup = db.insert(&catalog, "topping", fields! { "name" => "ham" }).unwrap_err();
        assert!(matches!(dup, ModelError::Integrity(_)));

        let missing = db.insert(&catalog, "pizza", fields! { "box" => 99 }).unwrap_err();
        assert!(matches!(missing, ModelError::Integrity(_)));

        let unknown = db.insert(&catalog, "box", fields! { "colour" => "red" }).unwrap_err();
        assert!(matches!(unknown, ModelError::FieldNotFound { .. }));
    }

    #[test]
    fn test_delete_sets_null_and_drops_links() {
        let catalog = catalog();
        let mut db = Database::new(&catalog);
        let boxed = db.insert(&catalog, "box", fields! { "name" => "large" }).unwrap();
        let ham = db.insert(&catalog, "topping", fields! { "name" => "ham" }).unwrap();
        let pizza = db
            .insert(&catalog, "pizza", fields! { "name" => "hawaii", "box" => boxed })
            .unwrap();

        let Some(Relation::Link(side)) = catalog.relation("pizza", "toppings").cloned() else {
            panic!("missing link");
        };
        assert!(db.link(&side, pizza, ham, Fields::new()).unwrap());
        assert!(!db.link(&side, pizza, ham, Fields::new()).unwrap());

        let summary = db.delete(&catalog, "box", vec![boxed]).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(db.table("pizza").unwrap().get(pizza).unwrap()["box"], Value::Null);

        let summary = db.delete(&catalog, "topping", vec![ham]).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.per_model.get("pizza_toppings"), Some(&1));
        assert!(db.links("pizza_toppings").unwrap().is_empty());
    }
}
