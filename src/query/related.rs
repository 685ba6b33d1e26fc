//! Relation variants of the async proxy.
//!
//! The variant travels with the proxy through every narrowing operation and
//! decides how `create`/`get_or_create`/`update_or_create` are carried out:
//! plain proxies create on the queryset, relation proxies create through the
//! relation manager so the new record is linked to the owner.

use super::backend::{BlockingQuerySet, ManyToManyManager, ManyToOneManager, RecordOf};
use crate::core::{Fields, Result};

pub trait RelationVariant<Q: BlockingQuerySet>: Clone + Send + Sync + 'static {
    /// Proxy kind shown by `Display`.
    const KIND: &'static str;

    fn create(&self, qs: &Q, fields: Fields) -> Result<RecordOf<Q>> {
        qs.create(fields)
    }

    fn get_or_create(
        &self,
        qs: &Q,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<Q>, bool)> {
        qs.get_or_create(lookup, defaults)
    }

    fn update_or_create(
        &self,
        qs: &Q,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<Q>, bool)> {
        qs.update_or_create(lookup, defaults)
    }
}

/// Plain proxy over a model's records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unrelated;

impl<Q: BlockingQuerySet> RelationVariant<Q> for Unrelated {
    const KIND: &'static str = "AsyncQuerySet";
}

/// Records on the many side of a foreign key pointing at one owner.
#[derive(Debug, Clone)]
pub struct ManyToOneRelation<M> {
    pub(crate) manager: M,
    pub(crate) bulk: bool,
}

impl<M> ManyToOneRelation<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            bulk: true,
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }
}

impl<M: ManyToOneManager> RelationVariant<M::QuerySet> for ManyToOneRelation<M> {
    const KIND: &'static str = "AsyncManyToOneRelatedQuerySet";

    fn create(&self, _qs: &M::QuerySet, fields: Fields) -> Result<RecordOf<M::QuerySet>> {
        self.manager.create(fields)
    }

    fn get_or_create(
        &self,
        _qs: &M::QuerySet,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<M::QuerySet>, bool)> {
        self.manager.get_or_create(lookup, defaults)
    }

    fn update_or_create(
        &self,
        _qs: &M::QuerySet,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<M::QuerySet>, bool)> {
        self.manager.update_or_create(lookup, defaults)
    }
}

/// Records linked to one owner through a join table.
#[derive(Debug, Clone)]
pub struct ManyToManyRelation<M> {
    pub(crate) manager: M,
    pub(crate) through_defaults: Fields,
}

impl<M> ManyToManyRelation<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            through_defaults: Fields::new(),
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }
}

impl<M: ManyToManyManager> RelationVariant<M::QuerySet> for ManyToManyRelation<M> {
    const KIND: &'static str = "AsyncManyToManyRelatedQuerySet";

    fn create(&self, _qs: &M::QuerySet, fields: Fields) -> Result<RecordOf<M::QuerySet>> {
        self.manager.create(fields, &self.through_defaults)
    }

    fn get_or_create(
        &self,
        _qs: &M::QuerySet,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<M::QuerySet>, bool)> {
        self.manager
            .get_or_create(lookup, defaults, &self.through_defaults)
    }

    fn update_or_create(
        &self,
        _qs: &M::QuerySet,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<M::QuerySet>, bool)> {
        self.manager
            .update_or_create(lookup, defaults, &self.through_defaults)
    }
}
