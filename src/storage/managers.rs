//! Blocking related managers of the in-memory backend.

use std::collections::BTreeSet;

use tracing::debug;

use super::catalog::{Catalog, LinkSide};
use super::eval::Ctx;
use super::queryset::{MemoryQuerySet, Scope};
use super::record::Record;
use super::schema::{ForeignKey, PK};
use super::table::{Database, LinkRow};
use super::MemoryBackend;
use crate::core::{Fields, ModelError, Result, Value};
use crate::query::{BlockingQuerySet, ManyToManyManager, ManyToOneManager};

fn saved_pk(obj: &Record, hint: &str) -> Result<i64> {
    obj.pk().ok_or_else(|| {
        ModelError::InvalidQuery(format!("{} instance isn't saved. {}", obj, hint))
    })
}

fn check_model(expected: &str, obj: &Record) -> Result<()> {
    if obj.model() == expected {
        Ok(())
    } else {
        Err(ModelError::TypeMismatch(format!(
            "'{}' instance expected, got {}",
            expected, obj
        )))
    }
}

/// Manager over the records whose foreign key points at one owner.
#[derive(Debug, Clone)]
pub struct RelatedManager {
    backend: MemoryBackend,
    owner_model: String,
    owner_pk: i64,
    child: String,
    key: ForeignKey,
    alias: String,
}

impl RelatedManager {
    pub(crate) fn new(
        backend: MemoryBackend,
        owner_model: &str,
        owner_pk: i64,
        child: &str,
        key: ForeignKey,
        alias: &str,
    ) -> Self {
        Self {
            backend,
            owner_model: owner_model.to_string(),
            owner_pk,
            child: child.to_string(),
            key,
            alias: alias.to_string(),
        }
    }

    pub fn field_name(&self) -> &str {
        &self.key.name
    }

    fn require_nullable(&self, action: &str) -> Result<()> {
        if self.key.nullable {
            Ok(())
        } else {
            Err(ModelError::NotSupported(format!(
                "{}() is only available on nullable foreign keys; '{}.{}' is not nullable",
                action, self.child, self.key.name
            )))
        }
    }

    fn owner_value(&self) -> Value {
        Value::Integer(self.owner_pk)
    }

    fn current(&self, db: &Database) -> Result<BTreeSet<i64>> {
        Ok(db
            .table(&self.child)?
            .iter()
            .filter(|(_, row)| row.get(&self.key.name).and_then(Value::as_i64) == Some(self.owner_pk))
            .map(|(pk, _)| pk)
            .collect())
    }

    fn point_at(&self, catalog: &Catalog, db: &mut Database, pks: &[i64], owner: Value) -> Result<()> {
        for pk in pks {
            let mut changes = Fields::new();
            changes.insert(self.key.name.clone(), owner.clone());
            if !db.update(catalog, &self.child, *pk, changes)? {
                return Err(ModelError::does_not_exist(&self.child));
            }
        }
        Ok(())
    }

    fn detach(&self, catalog: &Catalog, db: &mut Database, pks: &[i64]) -> Result<()> {
        self.point_at(catalog, db, pks, Value::Null)
    }

    /// Point `objs` at the owner inside an open draft.
    fn attach(&self, catalog: &Catalog, db: &mut Database, objs: Vec<Record>, bulk: bool) -> Result<()> {
        if bulk {
            let pks = objs
                .iter()
                .map(|obj| saved_pk(obj, "Use bulk=false or save the object first."))
                .collect::<Result<Vec<_>>>()?;
            return self.point_at(catalog, db, &pks, self.owner_value());
        }

        // Each object is saved on its own, creating unsaved ones.
        for obj in objs {
            let mut fields = obj.payload();
            fields.insert(self.key.name.clone(), self.owner_value());
            match obj.pk() {
                Some(pk) if db.table(&self.child)?.contains(pk) => {
                    db.update(catalog, &self.child, pk, fields)?;
                }
                Some(pk) => {
                    fields.insert(PK.to_string(), Value::Integer(pk));
                    db.insert(catalog, &self.child, fields)?;
                }
                None => {
                    db.insert(catalog, &self.child, fields)?;
                }
            }
        }
        Ok(())
    }
}

impl ManyToOneManager for RelatedManager {
    type QuerySet = MemoryQuerySet;

    fn queryset(&self) -> MemoryQuerySet {
        MemoryQuerySet::new(self.backend.clone(), &self.child, &self.alias).scoped(
            Scope::ForeignKey {
                field: self.key.name.clone(),
                owner: self.owner_pk,
            },
        )
    }

    fn add(&self, objs: Vec<Record>, bulk: bool) -> Result<()> {
        self.backend.enter("add")?;
        for obj in &objs {
            check_model(&self.child, obj)?;
        }
        debug!(owner = %self.owner_model, child = %self.child, count = objs.len(), bulk, "add");
        self.backend.write(&self.alias, |catalog, db| self.attach(catalog, db, objs, bulk))
    }

    fn remove(&self, objs: Vec<Record>, _bulk: bool) -> Result<()> {
        self.require_nullable("remove")?;
        self.backend.enter("remove")?;
        let mut pks = Vec::with_capacity(objs.len());
        for obj in &objs {
            check_model(&self.child, obj)?;
            pks.push(saved_pk(obj, "Save it first.")?);
        }

        self.backend.write(&self.alias, |catalog, db| {
            let current = self.current(db)?;
            if let Some(stranger) = objs
                .iter()
                .find(|obj| obj.pk().is_some_and(|pk| !current.contains(&pk)))
            {
                return Err(ModelError::InvalidQuery(format!(
                    "{} is not related to {} object ({}).",
                    stranger, self.owner_model, self.owner_pk
                )));
            }
            self.detach(catalog, db, &pks)
        })
    }

    fn clear(&self, _bulk: bool) -> Result<()> {
        self.require_nullable("clear")?;
        self.backend.enter("clear")?;
        self.backend.write(&self.alias, |catalog, db| {
            let current: Vec<i64> = self.current(db)?.into_iter().collect();
            self.detach(catalog, db, &current)
        })
    }

    fn set(&self, objs: Vec<Record>, bulk: bool, clear: bool) -> Result<()> {
        if !self.key.nullable {
            return self.add(objs, bulk);
        }

        self.backend.enter("set")?;
        for obj in &objs {
            check_model(&self.child, obj)?;
        }
        // The detach and the attach publish together or not at all.
        self.backend.write(&self.alias, |catalog, db| {
            let current = self.current(db)?;
            if clear {
                let all: Vec<i64> = current.into_iter().collect();
                self.detach(catalog, db, &all)?;
                return self.attach(catalog, db, objs, bulk);
            }

            let wanted: BTreeSet<i64> = objs.iter().filter_map(Record::pk).collect();
            let stale: Vec<i64> = current.difference(&wanted).copied().collect();
            let fresh: Vec<Record> = objs
                .into_iter()
                .filter(|obj| obj.pk().is_none_or(|pk| !current.contains(&pk)))
                .collect();
            self.detach(catalog, db, &stale)?;
            self.attach(catalog, db, fresh, bulk)
        })
    }

    fn create(&self, fields: Fields) -> Result<Record> {
        self.queryset().create(fields)
    }

    fn get_or_create(&self, lookup: Fields, defaults: Fields) -> Result<(Record, bool)> {
        self.queryset().get_or_create(lookup, defaults)
    }

    fn update_or_create(&self, lookup: Fields, defaults: Fields) -> Result<(Record, bool)> {
        self.queryset().update_or_create(lookup, defaults)
    }
}

/// Manager over the records linked to one owner through a link table.
#[derive(Debug, Clone)]
pub struct LinkManager {
    backend: MemoryBackend,
    owner_model: String,
    owner_pk: i64,
    side: LinkSide,
    alias: String,
}

impl LinkManager {
    pub(crate) fn new(
        backend: MemoryBackend,
        owner_model: &str,
        owner_pk: i64,
        side: LinkSide,
        alias: &str,
    ) -> Self {
        Self {
            backend,
            owner_model: owner_model.to_string(),
            owner_pk,
            side,
            alias: alias.to_string(),
        }
    }

    pub fn link_table(&self) -> &str {
        &self.side.table
    }

    /// Link rows of the owner, with their extra columns.
    pub fn link_rows(&self) -> Result<Vec<LinkRow>> {
        self.backend.enter("link_rows")?;
        self.backend
            .read(&self.alias, |_, db| db.link_rows(&self.side, self.owner_pk))
    }

    /// Validated extra columns for new link rows.
    fn link_extra(&self, through_defaults: &Fields) -> Result<Fields> {
        let mut extra = Fields::new();
        for column in &self.side.through_columns {
            let value = through_defaults
                .get(&column.name)
                .cloned()
                .or_else(|| column.default.clone())
                .unwrap_or(Value::Null);
            extra.insert(column.name.clone(), column.validate(&self.side.table, value)?);
        }
        if let Some(unknown) = through_defaults
            .keys()
            .find(|name| !self.side.through_columns.iter().any(|c| &c.name == *name))
        {
            return Err(ModelError::field_not_found(&self.side.table, unknown.as_str()));
        }
        Ok(extra)
    }

    fn target_pks(&self, objs: &[Record], action: &str) -> Result<Vec<i64>> {
        objs.iter()
            .map(|obj| {
                check_model(&self.side.target, obj)?;
                obj.pk().ok_or_else(|| {
                    ModelError::InvalidQuery(format!(
                        "Cannot {} \"{}\": instance isn't saved. Save it first.",
                        action, obj
                    ))
                })
            })
            .collect()
    }

    fn link_all(&self, db: &mut Database, pks: &[i64], extra: &Fields) -> Result<()> {
        for pk in pks {
            if !db.table(&self.side.target)?.contains(*pk) {
                return Err(ModelError::Integrity(format!(
                    "FOREIGN KEY constraint failed: {} has no {} row {}",
                    self.side.table, self.side.target, pk
                )));
            }
            db.link(&self.side, self.owner_pk, *pk, extra.clone())?;
        }
        Ok(())
    }

    fn insert_target(&self, catalog: &Catalog, db: &mut Database, fields: Fields) -> Result<Record> {
        let pk = db.insert(catalog, &self.side.target, fields)?;
        db.record(&self.side.target, pk, &self.alias)
            .ok_or_else(|| ModelError::does_not_exist(&self.side.target))
    }

    /// Run `make` and link its record when it was created, in one write.
    fn create_linked<F>(&self, through_defaults: &Fields, make: F) -> Result<(Record, bool)>
    where
        F: FnOnce(&Catalog, &mut Database) -> Result<(Record, bool)>,
    {
        let extra = self.link_extra(through_defaults)?;
        self.backend.write(&self.alias, |catalog, db| {
            let (record, created) = make(catalog, db)?;
            if created {
                let pk = record
                    .pk()
                    .ok_or_else(|| ModelError::does_not_exist(&self.side.target))?;
                db.link(&self.side, self.owner_pk, pk, extra)?;
            }
            Ok((record, created))
        })
    }
}

fn creation_fields(lookup: &Fields, defaults: Fields) -> Fields {
    let mut fields: Fields = lookup
        .iter()
        .filter(|(name, _)| !name.contains("__"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    fields.extend(defaults);
    fields
}

impl ManyToManyManager for LinkManager {
    type QuerySet = MemoryQuerySet;

    fn queryset(&self) -> MemoryQuerySet {
        MemoryQuerySet::new(self.backend.clone(), &self.side.target, &self.alias).scoped(
            Scope::Link {
                side: self.side.clone(),
                owner: self.owner_pk,
            },
        )
    }

    fn add(&self, objs: Vec<Record>, through_defaults: &Fields) -> Result<()> {
        self.backend.enter("add")?;
        let pks = self.target_pks(&objs, "add")?;
        let extra = self.link_extra(through_defaults)?;
        debug!(owner = %self.owner_model, table = %self.side.table, count = pks.len(), "link add");
        self.backend
            .write(&self.alias, |_, db| self.link_all(db, &pks, &extra))
    }

    fn remove(&self, objs: Vec<Record>) -> Result<()> {
        self.backend.enter("remove")?;
        let pks = self.target_pks(&objs, "remove")?;
        self.backend.write(&self.alias, |_, db| {
            db.unlink(&self.side, self.owner_pk, &pks).map(|_| ())
        })
    }

    fn clear(&self) -> Result<()> {
        self.backend.enter("clear")?;
        self.backend.write(&self.alias, |_, db| {
            db.unlink_all(&self.side, self.owner_pk).map(|_| ())
        })
    }

    fn set(&self, objs: Vec<Record>, clear: bool, through_defaults: &Fields) -> Result<()> {
        self.backend.enter("set")?;
        let wanted = self.target_pks(&objs, "set")?;
        let extra = self.link_extra(through_defaults)?;
        self.backend.write(&self.alias, |_, db| {
            if clear {
                db.unlink_all(&self.side, self.owner_pk)?;
                return self.link_all(db, &wanted, &extra);
            }
            let current = db.linked(&self.side, self.owner_pk)?;
            let stale: Vec<i64> = current
                .iter()
                .copied()
                .filter(|pk| !wanted.contains(pk))
                .collect();
            db.unlink(&self.side, self.owner_pk, &stale)?;
            let fresh: Vec<i64> = wanted
                .iter()
                .copied()
                .filter(|pk| !current.contains(pk))
                .collect();
            self.link_all(db, &fresh, &extra)
        })
    }

    fn create(&self, fields: Fields, through_defaults: &Fields) -> Result<Record> {
        self.backend.enter("create")?;
        self.create_linked(through_defaults, |catalog, db| {
            Ok((self.insert_target(catalog, db, fields)?, true))
        })
        .map(|(record, _)| record)
    }

    fn get_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
        through_defaults: &Fields,
    ) -> Result<(Record, bool)> {
        self.backend.enter("get_or_create")?;
        let linked = self.queryset();
        self.create_linked(through_defaults, |catalog, db| {
            let ctx = Ctx {
                catalog,
                db,
                alias: &self.alias,
            };
            if let Some(found) = linked.find_one(ctx, &lookup)? {
                return Ok((found, false));
            }
            let fields = creation_fields(&lookup, defaults);
            Ok((self.insert_target(catalog, db, fields)?, true))
        })
    }

    fn update_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
        through_defaults: &Fields,
    ) -> Result<(Record, bool)> {
        self.backend.enter("update_or_create")?;
        let linked = self.queryset();
        self.create_linked(through_defaults, |catalog, db| {
            let ctx = Ctx {
                catalog,
                db,
                alias: &self.alias,
            };
            if let Some(found) = linked.find_one(ctx, &lookup)? {
                let pk = found
                    .pk()
                    .ok_or_else(|| ModelError::does_not_exist(&self.side.target))?;
                db.update(catalog, &self.side.target, pk, defaults)?;
                let record = db
                    .record(&self.side.target, pk, &self.alias)
                    .ok_or_else(|| ModelError::does_not_exist(&self.side.target))?;
                return Ok((record, false));
            }
            let fields = creation_fields(&lookup, defaults);
            Ok((self.insert_target(catalog, db, fields)?, true))
        })
    }
}
