use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{BitAnd, BitOr, Bound, RangeBounds};

use futures::StreamExt;
use futures::stream::{self, BoxStream};

use super::args::{
    BulkOptions, DEFAULT_CHUNK_SIZE, DatePart, DateTimePart, LockOptions, RawQuery, SortOrder,
    ValuesListMode,
};
use super::backend::{BlockingQuerySet, ManyToManyManager, ManyToOneManager, NamedExprs, RecordOf};
use super::chunked::ChunkedRows;
use super::lookup::Q;
use super::related::{ManyToManyRelation, ManyToOneRelation, RelationVariant, Unrelated};
use crate::bridge::Bridge;
use crate::core::{DeleteSummary, Fields, ModelError, Result, Value};

/// Lazy, chainable, immutable async view over a blocking queryset
///
/// Narrowing operations (`filter`, `order_by`, `slice`, ...) return a new
/// proxy and never touch storage. Executing operations (`eval`, `count`,
/// `get`, ...) run the blocking call through the [`Bridge`] and resolve with
/// its result.
///
/// ```ignore
/// let cheapest = db
///     .aobjects::<Price>()?
///     .filter(Q::new("currency", "usd"))
///     .order_by(&["amount"])
///     .first()
///     .await?;
/// ```
pub struct AsyncQuerySet<QS: BlockingQuerySet, K = Unrelated> {
    inner: QS,
    bridge: Bridge,
    relation: K,
}

/// Proxy over every record of a model.
pub type AsyncManager<QS> = AsyncQuerySet<QS, Unrelated>;

/// Proxy over the records pointing at one owner through a foreign key.
pub type AsyncManyToOneRelated<M> =
    AsyncQuerySet<<M as ManyToOneManager>::QuerySet, ManyToOneRelation<M>>;

/// Proxy over the records linked to one owner through a join table.
pub type AsyncManyToManyRelated<M> =
    AsyncQuerySet<<M as ManyToManyManager>::QuerySet, ManyToManyRelation<M>>;

impl<QS: BlockingQuerySet> AsyncQuerySet<QS, Unrelated> {
    pub fn new(inner: QS, bridge: Bridge) -> Self {
        Self {
            inner,
            bridge,
            relation: Unrelated,
        }
    }
}

impl<QS: BlockingQuerySet, K: RelationVariant<QS>> AsyncQuerySet<QS, K> {
    pub fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    /// The wrapped blocking queryset.
    pub fn inner(&self) -> &QS {
        &self.inner
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn relation(&self) -> &K {
        &self.relation
    }

    fn derive(&self, inner: QS) -> Self {
        Self {
            inner,
            bridge: self.bridge.clone(),
            relation: self.relation.clone(),
        }
    }

    async fn exec<T, F>(&self, op: &'static str, func: F) -> Result<T>
    where
        F: FnOnce(QS) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let qs = self.inner.clone();
        self.bridge.call(op, move || func(qs)).await
    }

    // ------------------------------------------------------------------
    // Narrowing
    // ------------------------------------------------------------------

    pub fn filter(&self, q: Q) -> Self {
        self.derive(self.inner.filter(q))
    }

    pub fn exclude(&self, q: Q) -> Self {
        self.derive(self.inner.exclude(q))
    }

    pub fn annotate(&self, annotations: NamedExprs) -> Self {
        self.derive(self.inner.annotate(annotations))
    }

    pub fn alias(&self, aliases: NamedExprs) -> Self {
        self.derive(self.inner.alias(aliases))
    }

    pub fn order_by(&self, fields: &[&str]) -> Self {
        self.derive(self.inner.order_by(fields))
    }

    pub fn reverse(&self) -> Self {
        self.derive(self.inner.reverse())
    }

    pub fn distinct(&self, fields: &[&str]) -> Self {
        self.derive(self.inner.distinct(fields))
    }

    pub fn values(&self, fields: &[&str]) -> Self {
        self.derive(self.inner.values(fields, Vec::new()))
    }

    /// `values()` with extra named expressions.
    pub fn values_with(&self, fields: &[&str], expressions: NamedExprs) -> Self {
        self.derive(self.inner.values(fields, expressions))
    }

    pub fn values_list(&self, fields: &[&str], mode: ValuesListMode) -> Self {
        self.derive(self.inner.values_list(fields, mode))
    }

    pub fn dates(&self, field: &str, kind: DatePart, order: SortOrder) -> Self {
        self.derive(self.inner.dates(field, kind, order))
    }

    pub fn datetimes(&self, field: &str, kind: DateTimePart, order: SortOrder) -> Self {
        self.derive(self.inner.datetimes(field, kind, order))
    }

    pub fn none(&self) -> Self {
        self.derive(self.inner.none())
    }

    pub fn all(&self) -> Self {
        self.derive(self.inner.all())
    }

    pub fn union(&self, others: &[&Self], all: bool) -> Self {
        let others: Vec<QS> = others.iter().map(|o| o.inner.clone()).collect();
        self.derive(self.inner.union(&others, all))
    }

    pub fn intersection(&self, others: &[&Self]) -> Self {
        let others: Vec<QS> = others.iter().map(|o| o.inner.clone()).collect();
        self.derive(self.inner.intersection(&others))
    }

    pub fn difference(&self, others: &[&Self]) -> Self {
        let others: Vec<QS> = others.iter().map(|o| o.inner.clone()).collect();
        self.derive(self.inner.difference(&others))
    }

    pub fn select_related(&self, fields: &[&str]) -> Self {
        self.derive(self.inner.select_related(fields))
    }

    pub fn prefetch_related(&self, lookups: &[&str]) -> Self {
        self.derive(self.inner.prefetch_related(lookups))
    }

    pub fn only(&self, fields: &[&str]) -> Self {
        self.derive(self.inner.only(fields))
    }

    pub fn defer(&self, fields: &[&str]) -> Self {
        self.derive(self.inner.defer(fields))
    }

    pub fn using(&self, alias: &str) -> Self {
        self.derive(self.inner.using(alias))
    }

    pub fn select_for_update(&self, options: LockOptions) -> Self {
        self.derive(self.inner.select_for_update(options))
    }

    pub fn raw(&self, query: RawQuery) -> Self {
        self.derive(self.inner.raw(query))
    }

    /// Unit-step slice, e.g. `slice(1..3)` or `slice(..2)`.
    pub fn slice<R: RangeBounds<usize>>(&self, range: R) -> Self {
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let stop = match range.end_bound() {
            Bound::Included(end) => Some(end.saturating_add(1)),
            Bound::Excluded(end) => Some(*end),
            Bound::Unbounded => None,
        };
        self.derive(self.inner.slice(start, stop))
    }

    /// Slice with an explicit step; only a step of 1 is accepted.
    pub fn slice_stepped<R: RangeBounds<usize>>(&self, range: R, step: usize) -> Result<Self> {
        if step != 1 {
            return Err(ModelError::NotSupported(format!(
                "slicing with step {} is not supported; use a unit-step slice() and pick \
                 elements after eval()",
                step
            )));
        }
        Ok(self.slice(range))
    }

    /// Always fails: the size of a lazy query is only known after I/O.
    pub fn len(&self) -> Result<usize> {
        Err(ModelError::NotSupported(
            "len() is not supported on an async queryset; use `.count().await` instead".into(),
        ))
    }

    /// Always fails: emptiness of a lazy query is only known after I/O.
    pub fn is_empty(&self) -> Result<bool> {
        Err(ModelError::NotSupported(
            "is_empty() is not supported on an async queryset; use `.exists().await` instead"
                .into(),
        ))
    }

    /// Conjunction of two proxies over the same model.
    pub fn and(&self, other: &Self) -> Result<Self> {
        self.check_same_model(other, "&")?;
        Ok(self.derive(self.inner.and(&other.inner)))
    }

    /// Disjunction of two proxies over the same model.
    pub fn or(&self, other: &Self) -> Result<Self> {
        self.check_same_model(other, "|")?;
        Ok(self.derive(self.inner.or(&other.inner)))
    }

    fn check_same_model(&self, other: &Self, op: &str) -> Result<()> {
        if self.model_name() != other.model_name() {
            return Err(ModelError::TypeMismatch(format!(
                "Cannot combine queries on two different models with '{}': {} and {}",
                op,
                self.model_name(),
                other.model_name()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Executing
    // ------------------------------------------------------------------

    /// Evaluate the query into a list.
    pub async fn eval(&self) -> Result<Vec<QS::Item>> {
        self.exec("eval", |qs| qs.eval()).await
    }

    /// Element at `index` of the evaluated collection; negative indices count
    /// from the end.
    pub async fn item(&self, index: isize) -> Result<QS::Item> {
        let mut items = self.eval().await?;
        let len = items.len();
        let position = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            Some(index as usize).filter(|p| *p < len)
        };
        match position {
            Some(position) => Ok(items.swap_remove(position)),
            None => Err(ModelError::IndexOutOfRange { index, len }),
        }
    }

    /// Evaluate once, then yield the elements one by one.
    pub fn stream(&self) -> BoxStream<'static, Result<QS::Item>> {
        let this = self.clone();
        stream::once(async move { this.eval().await })
            .flat_map(|evaluated| match evaluated {
                Ok(items) => stream::iter(items.into_iter().map(Ok)).left_stream(),
                Err(err) => stream::iter(vec![Err(err)]).right_stream(),
            })
            .boxed()
    }

    pub async fn get(&self, q: Q) -> Result<QS::Item> {
        self.exec("get", move |qs| qs.get(q)).await
    }

    pub async fn create(&self, fields: Fields) -> Result<RecordOf<QS>> {
        let relation = self.relation.clone();
        self.exec("create", move |qs| relation.create(&qs, fields))
            .await
    }

    pub async fn get_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<QS>, bool)> {
        let relation = self.relation.clone();
        self.exec("get_or_create", move |qs| {
            relation.get_or_create(&qs, lookup, defaults)
        })
        .await
    }

    pub async fn update_or_create(
        &self,
        lookup: Fields,
        defaults: Fields,
    ) -> Result<(RecordOf<QS>, bool)> {
        let relation = self.relation.clone();
        self.exec("update_or_create", move |qs| {
            relation.update_or_create(&qs, lookup, defaults)
        })
        .await
    }

    pub async fn bulk_create(
        &self,
        objs: Vec<RecordOf<QS>>,
        options: BulkOptions,
    ) -> Result<Vec<RecordOf<QS>>> {
        self.exec("bulk_create", move |qs| qs.bulk_create(objs, options))
            .await
    }

    pub async fn bulk_update(
        &self,
        objs: Vec<RecordOf<QS>>,
        fields: &[&str],
        batch_size: Option<usize>,
    ) -> Result<usize> {
        let fields = owned(fields);
        self.exec("bulk_update", move |qs| {
            qs.bulk_update(objs, &borrowed(&fields), batch_size)
        })
        .await
    }

    pub async fn count(&self) -> Result<usize> {
        self.exec("count", |qs| qs.count()).await
    }

    /// Map of `field_name` value to element; `ids = None` fetches everything.
    pub async fn in_bulk(
        &self,
        ids: Option<Vec<Value>>,
        field_name: &str,
    ) -> Result<HashMap<Value, QS::Item>> {
        let field_name = field_name.to_string();
        self.exec("in_bulk", move |qs| qs.in_bulk(ids, &field_name))
            .await
    }

    /// Chunked cursor; every chunk is fetched through the bridge.
    pub async fn iterator(&self, chunk_size: Option<usize>) -> Result<ChunkedRows<QS::Item>> {
        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(ModelError::InvalidQuery(
                "Chunk size must be strictly positive.".into(),
            ));
        }
        let rows = self
            .exec("iterator", move |qs| qs.iterator(chunk_size))
            .await?;
        Ok(ChunkedRows::new(rows, chunk_size, self.bridge.clone()))
    }

    pub async fn latest(&self, fields: &[&str]) -> Result<QS::Item> {
        let fields = owned(fields);
        self.exec("latest", move |qs| qs.latest(&borrowed(&fields)))
            .await
    }

    pub async fn earliest(&self, fields: &[&str]) -> Result<QS::Item> {
        let fields = owned(fields);
        self.exec("earliest", move |qs| qs.earliest(&borrowed(&fields)))
            .await
    }

    pub async fn first(&self) -> Result<Option<QS::Item>> {
        self.exec("first", |qs| qs.first()).await
    }

    pub async fn last(&self) -> Result<Option<QS::Item>> {
        self.exec("last", |qs| qs.last()).await
    }

    pub async fn aggregate(&self, aggregates: NamedExprs) -> Result<BTreeMap<String, Value>> {
        self.exec("aggregate", move |qs| qs.aggregate(aggregates))
            .await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.exec("exists", |qs| qs.exists()).await
    }

    pub async fn update(&self, fields: Fields) -> Result<usize> {
        self.exec("update", move |qs| qs.update(fields)).await
    }

    pub async fn delete(&self) -> Result<DeleteSummary> {
        self.exec("delete", |qs| qs.delete()).await
    }

    pub async fn explain(&self, format: Option<&str>) -> Result<String> {
        let format = format.map(str::to_string);
        self.exec("explain", move |qs| qs.explain(format.as_deref()))
            .await
    }
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

fn borrowed(fields: &[String]) -> Vec<&str> {
    fields.iter().map(String::as_str).collect()
}

// ----------------------------------------------------------------------
// Relation mutations
// ----------------------------------------------------------------------

impl<M: ManyToOneManager> AsyncQuerySet<M::QuerySet, ManyToOneRelation<M>> {
    pub fn from_manager(manager: M, bridge: Bridge) -> Self {
        Self {
            inner: manager.queryset(),
            bridge,
            relation: ManyToOneRelation::new(manager),
        }
    }

    /// Choose between one batched write (the default) and per-object saves.
    pub fn bulk(&self, bulk: bool) -> Self {
        let mut next = self.clone();
        next.relation.bulk = bulk;
        next
    }

    pub async fn add(&self, objs: Vec<RecordOf<M::QuerySet>>) -> Result<()> {
        let (manager, bulk) = (self.relation.manager.clone(), self.relation.bulk);
        self.bridge.call("add", move || manager.add(objs, bulk)).await
    }

    pub async fn remove(&self, objs: Vec<RecordOf<M::QuerySet>>) -> Result<()> {
        let (manager, bulk) = (self.relation.manager.clone(), self.relation.bulk);
        self.bridge
            .call("remove", move || manager.remove(objs, bulk))
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        let (manager, bulk) = (self.relation.manager.clone(), self.relation.bulk);
        self.bridge.call("clear", move || manager.clear(bulk)).await
    }

    /// Make `objs` the exact membership; `clear` empties the relation first.
    pub async fn set(&self, objs: Vec<RecordOf<M::QuerySet>>, clear: bool) -> Result<()> {
        let (manager, bulk) = (self.relation.manager.clone(), self.relation.bulk);
        self.bridge
            .call("set", move || manager.set(objs, bulk, clear))
            .await
    }
}

impl<M: ManyToManyManager> AsyncQuerySet<M::QuerySet, ManyToManyRelation<M>> {
    pub fn from_manager(manager: M, bridge: Bridge) -> Self {
        Self {
            inner: manager.queryset(),
            bridge,
            relation: ManyToManyRelation::new(manager),
        }
    }

    /// Extra join-row fields for join records created by this proxy.
    pub fn through_defaults(&self, defaults: Fields) -> Self {
        let mut next = self.clone();
        next.relation.through_defaults = defaults;
        next
    }

    pub async fn add(&self, objs: Vec<RecordOf<M::QuerySet>>) -> Result<()> {
        let manager = self.relation.manager.clone();
        let through = self.relation.through_defaults.clone();
        self.bridge
            .call("add", move || manager.add(objs, &through))
            .await
    }

    pub async fn remove(&self, objs: Vec<RecordOf<M::QuerySet>>) -> Result<()> {
        let manager = self.relation.manager.clone();
        self.bridge.call("remove", move || manager.remove(objs)).await
    }

    pub async fn clear(&self) -> Result<()> {
        let manager = self.relation.manager.clone();
        self.bridge.call("clear", move || manager.clear()).await
    }

    /// Make `objs` the exact membership; `clear` empties the relation first.
    pub async fn set(&self, objs: Vec<RecordOf<M::QuerySet>>, clear: bool) -> Result<()> {
        let manager = self.relation.manager.clone();
        let through = self.relation.through_defaults.clone();
        self.bridge
            .call("set", move || manager.set(objs, clear, &through))
            .await
    }
}

// ----------------------------------------------------------------------
// Trait impls
// ----------------------------------------------------------------------

impl<QS: BlockingQuerySet, K: Clone> Clone for AsyncQuerySet<QS, K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            bridge: self.bridge.clone(),
            relation: self.relation.clone(),
        }
    }
}

impl<QS: BlockingQuerySet, K: RelationVariant<QS>> BitAnd for AsyncQuerySet<QS, K> {
    type Output = Result<Self>;

    fn bitand(self, rhs: Self) -> Result<Self> {
        self.and(&rhs)
    }
}

impl<QS: BlockingQuerySet, K: RelationVariant<QS>> BitOr for AsyncQuerySet<QS, K> {
    type Output = Result<Self>;

    fn bitor(self, rhs: Self) -> Result<Self> {
        self.or(&rhs)
    }
}

impl<'a, QS: BlockingQuerySet, K: RelationVariant<QS>> BitAnd<&'a AsyncQuerySet<QS, K>>
    for &'a AsyncQuerySet<QS, K>
{
    type Output = Result<AsyncQuerySet<QS, K>>;

    fn bitand(self, rhs: &'a AsyncQuerySet<QS, K>) -> Self::Output {
        self.and(rhs)
    }
}

impl<'a, QS: BlockingQuerySet, K: RelationVariant<QS>> BitOr<&'a AsyncQuerySet<QS, K>>
    for &'a AsyncQuerySet<QS, K>
{
    type Output = Result<AsyncQuerySet<QS, K>>;

    fn bitor(self, rhs: &'a AsyncQuerySet<QS, K>) -> Self::Output {
        self.or(rhs)
    }
}

impl<QS: BlockingQuerySet, K: RelationVariant<QS>> fmt::Display for AsyncQuerySet<QS, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} [...{}]>", K::KIND, self.model_name())
    }
}

impl<QS: BlockingQuerySet, K: RelationVariant<QS>> fmt::Debug for AsyncQuerySet<QS, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
