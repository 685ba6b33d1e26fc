//! Record handles with async persistence and relation accessors.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::registry::{Cardinality, ModelDescriptor, RelationDescriptor};
use crate::core::{DeleteOptions, DeleteSummary, ModelError, Result, SaveOptions};
use crate::facade::AsyncDatabase;
use crate::query::{AsyncManyToManyRelated, AsyncManyToOneRelated, Backend, RecordOf};

/// Async save and delete for a single record.
#[async_trait]
pub trait AsyncPersist {
    /// Insert or update the record from a bridge worker.
    async fn asave(&mut self, options: SaveOptions) -> Result<()>;

    /// Delete the record (and whatever cascades from it).
    async fn adelete(&self, options: DeleteOptions) -> Result<DeleteSummary>;
}

/// What a prefixed accessor resolved to.
pub enum Related<B: Backend> {
    Object(Option<RecordOf<B::QuerySet>>),
    ManyToOne(AsyncManyToOneRelated<B::ManyToOne>),
    ManyToMany(AsyncManyToManyRelated<B::ManyToMany>),
}

impl<B: Backend> Related<B> {
    fn shape(&self) -> &'static str {
        match self {
            Related::Object(_) => "object",
            Related::ManyToOne(_) => "many-to-one manager",
            Related::ManyToMany(_) => "many-to-many manager",
        }
    }
}

impl<B: Backend> fmt::Debug for Related<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Related::Object(record) => f.debug_tuple("Object").field(record).finish(),
            Related::ManyToOne(qs) => write!(f, "ManyToOne({qs})"),
            Related::ManyToMany(qs) => write!(f, "ManyToMany({qs})"),
        }
    }
}

/// A record bound to the database handle that loaded it.
///
/// Derefs to the underlying record so fields are read and written as usual;
/// `related("abox")`, `related("atoppings")` and friends resolve the prefixed
/// accessors registered for the record's model.
pub struct Instance<B: Backend> {
    db: AsyncDatabase<B>,
    descriptor: Arc<ModelDescriptor>,
    record: RecordOf<B::QuerySet>,
}

impl<B: Backend> Instance<B> {
    pub(crate) fn new(
        db: AsyncDatabase<B>,
        descriptor: Arc<ModelDescriptor>,
        record: RecordOf<B::QuerySet>,
    ) -> Self {
        Self {
            db,
            descriptor,
            record,
        }
    }

    pub fn model(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn record(&self) -> &RecordOf<B::QuerySet> {
        &self.record
    }

    pub fn into_record(self) -> RecordOf<B::QuerySet> {
        self.record
    }

    fn descriptor_for(&self, accessor: &str) -> Result<Arc<RelationDescriptor>> {
        self.descriptor
            .accessor(accessor)
            .cloned()
            .ok_or_else(|| ModelError::UnknownAttribute {
                model: self.descriptor.name().to_string(),
                attribute: accessor.to_string(),
            })
    }

    /// Resolve a prefixed accessor.
    ///
    /// To-one relations are fetched (unless already cached on the record);
    /// to-many relations return a relation-aware proxy without touching
    /// storage.
    pub async fn related(&self, accessor: &str) -> Result<Related<B>> {
        let relation = self.descriptor_for(accessor)?;
        let backend = self.db.backend();
        let bridge = self.db.bridge().clone();

        match relation.cardinality() {
            Cardinality::One => Ok(Related::Object(self.resolve_one(&relation.relation).await?)),
            Cardinality::ManyToOne => {
                let manager = backend.many_to_one(&self.record, &relation.relation)?;
                Ok(Related::ManyToOne(AsyncManyToOneRelated::<B::ManyToOne>::from_manager(
                    manager, bridge,
                )))
            }
            Cardinality::ManyToMany => {
                let manager = backend.many_to_many(&self.record, &relation.relation)?;
                Ok(Related::ManyToMany(AsyncManyToManyRelated::<B::ManyToMany>::from_manager(
                    manager, bridge,
                )))
            }
        }
    }

    /// Record on the other side of a to-one accessor.
    pub async fn related_object(&self, accessor: &str) -> Result<Option<RecordOf<B::QuerySet>>> {
        match self.related(accessor).await? {
            Related::Object(record) => Ok(record),
            other => Err(self.wrong_shape(accessor, "object", &other)),
        }
    }

    pub async fn many_to_one(&self, accessor: &str) -> Result<AsyncManyToOneRelated<B::ManyToOne>> {
        match self.related(accessor).await? {
            Related::ManyToOne(qs) => Ok(qs),
            other => Err(self.wrong_shape(accessor, "many-to-one manager", &other)),
        }
    }

    pub async fn many_to_many(
        &self,
        accessor: &str,
    ) -> Result<AsyncManyToManyRelated<B::ManyToMany>> {
        match self.related(accessor).await? {
            Related::ManyToMany(qs) => Ok(qs),
            other => Err(self.wrong_shape(accessor, "many-to-many manager", &other)),
        }
    }

    fn wrong_shape(&self, accessor: &str, wanted: &str, got: &Related<B>) -> ModelError {
        ModelError::TypeMismatch(format!(
            "'{}.{}' resolves to a {}, not a {}",
            self.descriptor.name(),
            accessor,
            got.shape(),
            wanted
        ))
    }

    async fn resolve_one(&self, field: &str) -> Result<Option<RecordOf<B::QuerySet>>> {
        let backend = self.db.backend();
        if let Some(cached) = backend.cached_related(&self.record, field) {
            return Ok(cached);
        }

        if backend.can_block() {
            match backend.related_object(&self.record, field) {
                Err(ModelError::SynchronousOnlyOperation(reason)) => {
                    debug!(field, %reason, "direct relation fetch refused, bridging");
                }
                other => return other,
            }
        }

        let backend = backend.clone();
        let record = self.record.clone();
        let field = field.to_string();
        self.db
            .bridge()
            .call("related_object", move || backend.related_object(&record, &field))
            .await
    }
}

#[async_trait]
impl<B: Backend> AsyncPersist for Instance<B> {
    async fn asave(&mut self, mut options: SaveOptions) -> Result<()> {
        if options.using.is_none() {
            options.using = Some(self.db.config().default_alias.clone());
        }
        let backend = self.db.backend().clone();
        let mut record = self.record.clone();

        self.record = self
            .db
            .bridge()
            .call("save", move || {
                backend.save(&mut record, &options)?;
                Ok(record)
            })
            .await?;
        Ok(())
    }

    async fn adelete(&self, mut options: DeleteOptions) -> Result<DeleteSummary> {
        if options.using.is_none() {
            options.using = Some(self.db.config().default_alias.clone());
        }
        let backend = self.db.backend().clone();
        let record = self.record.clone();

        self.db
            .bridge()
            .call("delete", move || backend.delete(&record, &options))
            .await
    }
}

impl<B: Backend> Deref for Instance<B> {
    type Target = RecordOf<B::QuerySet>;

    fn deref(&self) -> &Self::Target {
        &self.record
    }
}

impl<B: Backend> DerefMut for Instance<B> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.record
    }
}

impl<B: Backend> Clone for Instance<B> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            descriptor: Arc::clone(&self.descriptor),
            record: self.record.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for Instance<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("model", &self.descriptor.name())
            .field("record", &self.record)
            .finish()
    }
}
