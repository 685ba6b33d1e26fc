//! In-memory blocking backend.
//!
//! Every database alias holds one [`Database`] behind a lock. Reads see a
//! consistent view; writes run on a cheap structural clone and are published
//! only when the whole operation succeeded, so a failed `get_or_create` or
//! cascade leaves nothing behind.

pub mod catalog;
pub mod eval;
pub mod managers;
pub mod pattern;
pub mod queryset;
pub mod raw;
pub mod record;
pub mod schema;
pub mod table;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, trace};

pub use catalog::{Catalog, LinkSide, Relation};
pub use managers::{LinkManager, RelatedManager};
pub use queryset::MemoryQuerySet;
pub use record::{Record, Row};
pub use schema::{Column, ForeignKey, ManyToMany, ModelSchema, OnDelete, PK};
pub use table::{Database, LinkRow};

use crate::core::{DeleteOptions, DeleteSummary, FieldMeta, ModelError, Result, SaveOptions};
use crate::query::Backend;

pub const DEFAULT_ALIAS: &str = "default";

#[derive(Default)]
struct StoreStats {
    blocking_calls: AtomicUsize,
    writes: AtomicUsize,
}

/// Counters of blocking work done by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Executing operations entered
    pub blocking_calls: usize,
    /// Writes published
    pub writes: usize,
}

struct Shared {
    catalog: Catalog,
    databases: HashMap<String, RwLock<Database>>,
    default_alias: String,
    strict: bool,
    stats: StoreStats,
}

/// Blocking backend keeping every alias in memory.
///
/// Handles are cheap to clone and share the same databases.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn builder() -> MemoryBackendBuilder {
        MemoryBackendBuilder::default()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub fn default_alias(&self) -> &str {
        &self.shared.default_alias
    }

    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.shared.databases.keys().map(String::as_str).collect();
        aliases.sort();
        aliases
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocking_calls: self.shared.stats.blocking_calls.load(Ordering::Relaxed),
            writes: self.shared.stats.writes.load(Ordering::Relaxed),
        }
    }

    /// Gate for every executing operation.
    ///
    /// A strict backend refuses to block a thread that drives an async
    /// runtime.
    pub(crate) fn enter(&self, op: &str) -> Result<()> {
        if self.shared.strict && !crate::bridge::can_block() {
            return Err(ModelError::SynchronousOnlyOperation(op.to_string()));
        }
        self.shared.stats.blocking_calls.fetch_add(1, Ordering::Relaxed);
        trace!(op, "blocking call");
        Ok(())
    }

    fn database(&self, alias: &str) -> Result<&RwLock<Database>> {
        self.shared.databases.get(alias).ok_or_else(|| {
            ModelError::Configuration(format!("The connection '{}' doesn't exist.", alias))
        })
    }

    pub(crate) fn read<T>(
        &self,
        alias: &str,
        func: impl FnOnce(&Catalog, &Database) -> Result<T>,
    ) -> Result<T> {
        let db = self.database(alias)?.read()?;
        func(&self.shared.catalog, &db)
    }

    /// Run `func` on a draft of the alias and publish it on success.
    pub(crate) fn write<T>(
        &self,
        alias: &str,
        func: impl FnOnce(&Catalog, &mut Database) -> Result<T>,
    ) -> Result<T> {
        let mut db = self.database(alias)?.write()?;
        let mut draft = db.clone();
        let result = func(&self.shared.catalog, &mut draft)?;
        *db = draft;
        self.shared.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Point-in-time copy of an alias.
    pub fn snapshot(&self, alias: &str) -> Result<Database> {
        Ok(self.database(alias)?.read()?.clone())
    }

    fn alias_for<'a>(&'a self, using: Option<&'a str>, record: &'a Record) -> &'a str {
        using
            .or_else(|| record.db())
            .unwrap_or(&self.shared.default_alias)
    }

    fn save_record(&self, db: &mut Database, record: &Record, options: &SaveOptions) -> Result<i64> {
        let catalog = &self.shared.catalog;
        let model = record.model();
        let schema = catalog.get_model(model)?;

        if options.force_insert && (options.force_update || options.update_fields.is_some()) {
            return Err(ModelError::InvalidQuery(
                "Cannot force both insert and updating in model saving.".to_string(),
            ));
        }
        if let Some(fields) = &options.update_fields {
            let missing: Vec<&str> = fields
                .iter()
                .map(String::as_str)
                .filter(|f| !schema.is_stored(f))
                .collect();
            if !missing.is_empty() {
                return Err(ModelError::InvalidQuery(format!(
                    "The following fields do not exist in this model, are m2m fields, or are \
                     non-concrete fields: {}",
                    missing.join(", ")
                )));
            }
        }

        let payload = record.payload();
        match record.pk() {
            None if options.force_update || options.update_fields.is_some() => {
                Err(ModelError::InvalidQuery(
                    "Cannot force an update in save() with no primary key.".to_string(),
                ))
            }
            None => db.insert(catalog, model, payload),
            Some(pk) if options.force_insert => {
                let mut fields = payload;
                fields.insert(PK.to_string(), pk.into());
                db.insert(catalog, model, fields)
            }
            Some(pk) => {
                let changes = match &options.update_fields {
                    Some(names) => payload
                        .into_iter()
                        .filter(|(name, _)| names.contains(name))
                        .collect(),
                    None => payload,
                };
                if db.update(catalog, model, pk, changes.clone())? {
                    return Ok(pk);
                }
                if options.update_fields.is_some() {
                    return Err(ModelError::InvalidQuery(
                        "Save with update_fields did not affect any rows.".to_string(),
                    ));
                }
                if options.force_update {
                    return Err(ModelError::InvalidQuery(
                        "Forced update did not affect any rows.".to_string(),
                    ));
                }
                let mut fields = changes;
                fields.insert(PK.to_string(), pk.into());
                db.insert(catalog, model, fields)
            }
        }
    }

    fn owner_pk(record: &Record) -> Result<i64> {
        record.pk().ok_or_else(|| {
            ModelError::InvalidQuery(format!(
                "'{}' instance needs to have a primary key value before this relationship can be used.",
                record.model()
            ))
        })
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("models", &self.shared.catalog.list_models())
            .field("aliases", &self.aliases())
            .field("strict", &self.shared.strict)
            .finish()
    }
}

impl Backend for MemoryBackend {
    type QuerySet = MemoryQuerySet;
    type ManyToOne = RelatedManager;
    type ManyToMany = LinkManager;

    fn objects(&self, model: &str) -> Result<MemoryQuerySet> {
        self.shared.catalog.get_model(model)?;
        Ok(MemoryQuerySet::new(
            self.clone(),
            model,
            &self.shared.default_alias,
        ))
    }

    fn fields(&self, model: &str) -> Result<Vec<FieldMeta>> {
        self.shared.catalog.field_meta(model)
    }

    fn record_model<'a>(&self, record: &'a Record) -> &'a str {
        record.model()
    }

    fn save(&self, record: &mut Record, options: &SaveOptions) -> Result<()> {
        self.enter("save")?;
        let alias = self
            .alias_for(options.using.as_deref(), record)
            .to_string();
        let (pk, stored) = self.write(&alias, |_, db| {
            let pk = self.save_record(db, record, options)?;
            let stored = db
                .record(record.model(), pk, &alias)
                .ok_or_else(|| ModelError::does_not_exist(record.model()))?;
            Ok((pk, stored))
        })?;
        trace!(model = record.model(), pk, alias = %alias, "saved");
        record.replace_fields(stored.fields().clone());
        record.set_db(&alias);
        Ok(())
    }

    fn delete(&self, record: &Record, options: &DeleteOptions) -> Result<DeleteSummary> {
        self.enter("delete")?;
        let pk = record.pk().ok_or_else(|| {
            ModelError::InvalidQuery(format!(
                "{} object can't be deleted because its id attribute is set to None.",
                record.model()
            ))
        })?;
        let alias = self.alias_for(options.using.as_deref(), record);
        self.write(alias, |catalog, db| db.delete(catalog, record.model(), vec![pk]))
    }

    fn related_object(&self, record: &Record, field: &str) -> Result<Option<Record>> {
        self.enter("related_object")?;
        let catalog = &self.shared.catalog;
        let relation = catalog
            .relation(record.model(), field)
            .ok_or_else(|| ModelError::field_not_found(record.model(), field))?;
        if !relation.is_to_one() {
            return Err(ModelError::TypeMismatch(format!(
                "'{}.{}' is not a to-one relation",
                record.model(),
                field
            )));
        }
        let alias = self.alias_for(None, record);

        self.read(alias, |catalog, db| {
            let ctx = eval::Ctx { catalog, db, alias };
            let found = ctx.related_records(record, relation)?.into_iter().next();
            match (relation, found) {
                (Relation::Forward(key), None) => {
                    if record.get(&key.name).is_none_or(|v| v.is_null()) {
                        Ok(None)
                    } else {
                        Err(ModelError::does_not_exist(&key.target))
                    }
                }
                (Relation::ReverseOne { child, .. }, None) => Err(ModelError::does_not_exist(child)),
                (_, found) => Ok(found),
            }
        })
    }

    fn cached_related(&self, record: &Record, field: &str) -> Option<Option<Record>> {
        record.related(field).map(|related| related.cloned())
    }

    fn many_to_one(&self, record: &Record, field: &str) -> Result<RelatedManager> {
        match self.shared.catalog.relation(record.model(), field) {
            Some(Relation::ReverseMany { child, key }) => Ok(RelatedManager::new(
                self.clone(),
                record.model(),
                Self::owner_pk(record)?,
                child,
                key.clone(),
                self.alias_for(None, record),
            )),
            Some(_) => Err(ModelError::TypeMismatch(format!(
                "'{}.{}' is not a reverse foreign key",
                record.model(),
                field
            ))),
            None => Err(ModelError::field_not_found(record.model(), field)),
        }
    }

    fn many_to_many(&self, record: &Record, field: &str) -> Result<LinkManager> {
        match self.shared.catalog.relation(record.model(), field) {
            Some(Relation::Link(side)) => Ok(LinkManager::new(
                self.clone(),
                record.model(),
                Self::owner_pk(record)?,
                side.clone(),
                self.alias_for(None, record),
            )),
            Some(_) => Err(ModelError::TypeMismatch(format!(
                "'{}.{}' is not a many-to-many relation",
                record.model(),
                field
            ))),
            None => Err(ModelError::field_not_found(record.model(), field)),
        }
    }
}

/// Builder for [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryBackendBuilder {
    models: Vec<ModelSchema>,
    aliases: Vec<String>,
    default_alias: String,
    strict: bool,
}

impl Default for MemoryBackendBuilder {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            aliases: Vec::new(),
            default_alias: DEFAULT_ALIAS.to_string(),
            strict: true,
        }
    }
}

impl MemoryBackendBuilder {
    pub fn model(mut self, schema: ModelSchema) -> Self {
        self.models.push(schema);
        self
    }

    /// Add another database alias with the same models.
    pub fn alias(mut self, name: &str) -> Self {
        self.aliases.push(name.to_string());
        self
    }

    pub fn default_alias(mut self, name: &str) -> Self {
        self.default_alias = name.to_string();
        self
    }

    /// Allow blocking calls from threads driving an async runtime.
    pub fn allow_async_context(mut self, allow: bool) -> Self {
        self.strict = !allow;
        self
    }

    pub fn build(self) -> Result<MemoryBackend> {
        let mut catalog = Catalog::new();
        for schema in self.models {
            catalog = catalog.with_model(schema)?;
        }
        let catalog = catalog.resolve()?;

        let mut databases = HashMap::new();
        databases.insert(
            self.default_alias.clone(),
            RwLock::new(Database::new(&catalog)),
        );
        for alias in self.aliases {
            databases
                .entry(alias)
                .or_insert_with(|| RwLock::new(Database::new(&catalog)));
        }

        info!(
            models = catalog.list_models().len(),
            aliases = databases.len(),
            strict = self.strict,
            "memory backend ready"
        );
        Ok(MemoryBackend {
            shared: Arc::new(Shared {
                catalog,
                databases,
                default_alias: self.default_alias,
                strict: self.strict,
                stats: StoreStats::default(),
            }),
        })
    }
}
