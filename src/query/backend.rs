//! Capabilities required from a blocking data-access layer.
//!
//! Narrowing methods are pure: they build a new handle and never touch
//! storage. Executing methods may block and are only ever invoked by the
//! async layer from a bridge worker.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::args::{BulkOptions, DatePart, DateTimePart, LockOptions, RawQuery, SortOrder, ValuesListMode};
use super::lookup::{Expr, Q};
use crate::core::{DeleteOptions, DeleteSummary, FieldMeta, Fields, Result, SaveOptions, Value};

/// Record type produced by a queryset.
pub type RecordOf<Q> = <Q as BlockingQuerySet>::Record;

/// Iterator returned by chunked evaluation.
pub type RowIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Named projections or aggregates: `(alias, expression)`.
pub type NamedExprs = Vec<(String, Expr)>;

/// A lazy, immutable, blocking query over one model.
pub trait BlockingQuerySet: Clone + Send + Sync + 'static {
    /// Element produced by evaluation (an instance or a projected row).
    type Item: Clone + Send + Sync + fmt::Debug + 'static;
    /// A model instance.
    type Record: Clone + Send + Sync + fmt::Debug + 'static;

    fn model_name(&self) -> &str;

    // Narrowing

    fn filter(&self, q: Q) -> Self;
    fn exclude(&self, q: Q) -> Self;
    fn annotate(&self, annotations: NamedExprs) -> Self;
    fn alias(&self, aliases: NamedExprs) -> Self;
    fn order_by(&self, fields: &[&str]) -> Self;
    fn reverse(&self) -> Self;
    fn distinct(&self, fields: &[&str]) -> Self;
    fn values(&self, fields: &[&str], expressions: NamedExprs) -> Self;
    fn values_list(&self, fields: &[&str], mode: ValuesListMode) -> Self;
    fn dates(&self, field: &str, kind: DatePart, order: SortOrder) -> Self;
    fn datetimes(&self, field: &str, kind: DateTimePart, order: SortOrder) -> Self;
    fn none(&self) -> Self;
    fn all(&self) -> Self;
    fn union(&self, others: &[Self], all: bool) -> Self;
    fn intersection(&self, others: &[Self]) -> Self;
    fn difference(&self, others: &[Self]) -> Self;
    fn select_related(&self, fields: &[&str]) -> Self;
    fn prefetch_related(&self, lookups: &[&str]) -> Self;
    fn only(&self, fields: &[&str]) -> Self;
    fn defer(&self, fields: &[&str]) -> Self;
    fn using(&self, alias: &str) -> Self;
    fn select_for_update(&self, options: LockOptions) -> Self;
    fn raw(&self, query: RawQuery) -> Self;
    /// Unit-step slice relative to the current window.
    fn slice(&self, start: usize, stop: Option<usize>) -> Self;
    fn and(&self, other: &Self) -> Self;
    fn or(&self, other: &Self) -> Self;

    // Executing

    fn eval(&self) -> Result<Vec<Self::Item>>;
    fn get(&self, q: Q) -> Result<Self::Item>;
    fn create(&self, fields: Fields) -> Result<Self::Record>;
    fn get_or_create(&self, lookup: Fields, defaults: Fields) -> Result<(Self::Record, bool)>;
    fn update_or_create(&self, lookup: Fields, defaults: Fields)
    -> Result<(Self::Record, bool)>;
    fn bulk_create(
        &self,
        objs: Vec<Self::Record>,
        options: BulkOptions,
    ) -> Result<Vec<Self::Record>>;
    fn bulk_update(
        &self,
        objs: Vec<Self::Record>,
        fields: &[&str],
        batch_size: Option<usize>,
    ) -> Result<usize>;
    fn count(&self) -> Result<usize>;
    fn in_bulk(
        &self,
        ids: Option<Vec<Value>>,
        field_name: &str,
    ) -> Result<HashMap<Value, Self::Item>>;
    fn iterator(&self, chunk_size: usize) -> Result<RowIter<Self::Item>>;
    fn latest(&self, fields: &[&str]) -> Result<Self::Item>;
    fn earliest(&self, fields: &[&str]) -> Result<Self::Item>;
    fn first(&self) -> Result<Option<Self::Item>>;
    fn last(&self) -> Result<Option<Self::Item>>;
    fn aggregate(&self, aggregates: NamedExprs) -> Result<BTreeMap<String, Value>>;
    fn exists(&self) -> Result<bool>;
    fn update(&self, fields: Fields) -> Result<usize>;
    fn delete(&self) -> Result<DeleteSummary>;
    fn explain(&self, format: Option<&str>) -> Result<String>;
}

/// Manager for the "many" side of a foreign key, seen from the referenced record.
pub trait ManyToOneManager: Clone + Send + Sync + 'static {
    type QuerySet: BlockingQuerySet;

    /// Records currently pointing at the owner.
    fn queryset(&self) -> Self::QuerySet;

    fn add(&self, objs: Vec<RecordOf<Self::QuerySet>>, bulk: bool) -> Result<()>;
    fn remove(&self, objs: Vec<RecordOf<Self::QuerySet>>, bulk: bool) -> Result<()>;
    fn clear(&self, bulk: bool) -> Result<()>;
    fn set(&self, objs: Vec<RecordOf<Self::QuerySet>>, bulk: bool, clear: bool) -> Result<()>;

    fn create(&self, fields: Fields) -> Result<RecordOf<Self::QuerySet>>;
    fn get_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<Self::QuerySet>, bool)>;
    fn update_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<Self::QuerySet>, bool)>;
}

/// Manager for one side of a many-to-many relation.
pub trait ManyToManyManager: Clone + Send + Sync + 'static {
    type QuerySet: BlockingQuerySet;

    /// Records currently linked to the owner.
    fn queryset(&self) -> Self::QuerySet;

    fn add(&self, objs: Vec<RecordOf<Self::QuerySet>>, through_defaults: &Fields) -> Result<()>;
    fn remove(&self, objs: Vec<RecordOf<Self::QuerySet>>) -> Result<()>;
    fn clear(&self) -> Result<()>;
    fn set(
        &self,
        objs: Vec<RecordOf<Self::QuerySet>>,
        clear: bool,
        through_defaults: &Fields,
    ) -> Result<()>;

    fn create(
        &self,
        fields: Fields,
        through_defaults: &Fields,
    ) -> Result<RecordOf<Self::QuerySet>>;
    fn get_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
        through_defaults: &Fields,
    ) -> Result<(RecordOf<Self::QuerySet>, bool)>;
    fn update_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
        through_defaults: &Fields,
    ) -> Result<(RecordOf<Self::QuerySet>, bool)>;
}

/// A blocking data-access layer.
pub trait Backend: Clone + Send + Sync + 'static {
    type QuerySet: BlockingQuerySet;
    type ManyToOne: ManyToOneManager<QuerySet = Self::QuerySet>;
    type ManyToMany: ManyToManyManager<QuerySet = Self::QuerySet>;

    /// Fresh queryset over every record of `model`. Performs no I/O.
    fn objects(&self, model: &str) -> Result<Self::QuerySet>;

    /// Ordinary fields, forward relations and reverse accessors of `model`.
    fn fields(&self, model: &str) -> Result<Vec<FieldMeta>>;

    fn record_model<'a>(&self, record: &'a RecordOf<Self::QuerySet>) -> &'a str;

    fn save(&self, record: &mut RecordOf<Self::QuerySet>, options: &SaveOptions) -> Result<()>;

    fn delete(
        &self,
        record: &RecordOf<Self::QuerySet>,
        options: &DeleteOptions,
    ) -> Result<DeleteSummary>;

    /// Fetch the record on the other side of a to-one relation.
    fn related_object(
        &self,
        record: &RecordOf<Self::QuerySet>,
        field: &str,
    ) -> Result<Option<RecordOf<Self::QuerySet>>>;

    /// The related record if it is already loaded on `record`.
    fn cached_related(
        &self,
        _record: &RecordOf<Self::QuerySet>,
        _field: &str,
    ) -> Option<Option<RecordOf<Self::QuerySet>>> {
        None
    }

    fn many_to_one(
        &self,
        record: &RecordOf<Self::QuerySet>,
        field: &str,
    ) -> Result<Self::ManyToOne>;

    fn many_to_many(
        &self,
        record: &RecordOf<Self::QuerySet>,
        field: &str,
    ) -> Result<Self::ManyToMany>;

    /// Whether blocking calls may run directly on the current thread.
    fn can_block(&self) -> bool {
        crate::bridge::can_block()
    }
}
