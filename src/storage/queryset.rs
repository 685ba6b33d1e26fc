//! The in-memory blocking queryset.
//!
//! A queryset is an immutable description of a query: narrowing methods copy
//! the state and never read storage. Executing methods take the backend's
//! lock for the alias, evaluate against a consistent view and release it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde_json::json;
use tracing::debug;

use super::catalog::{Catalog, LinkSide, Relation};
use super::eval::{Ctx, split_path};
use super::raw;
use super::record::{Record, Row};
use super::schema::{ModelSchema, PK};
use super::table::Database;
use super::MemoryBackend;
use crate::core::{DataType, DeleteSummary, Fields, ModelError, Result, Value};
use crate::query::{
    BlockingQuerySet, BulkOptions, DatePart, DateTimePart, Expr, LockOptions, NamedExprs, Q,
    RawQuery, RowIter, SortOrder, ValuesListMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetOp {
    Union { all: bool },
    Intersection,
    Difference,
}

#[derive(Debug, Clone)]
enum Source {
    Table,
    Raw(RawQuery),
    Combined { op: SetOp, parts: Vec<MemoryQuerySet> },
}

/// Restriction of a related-manager queryset to one owner.
#[derive(Debug, Clone)]
pub(crate) enum Scope {
    ForeignKey { field: String, owner: i64 },
    Link { side: LinkSide, owner: i64 },
}

impl Scope {
    fn key(&self) -> String {
        match self {
            Scope::ForeignKey { field, owner } => format!("fk:{}={}", field, owner),
            Scope::Link { side, owner } => format!("link:{}:{}={}", side.table, side.forward, owner),
        }
    }
}

#[derive(Debug, Clone)]
enum Projection {
    Records,
    Values {
        fields: Vec<String>,
        expressions: NamedExprs,
    },
    ValuesList {
        fields: Vec<String>,
        mode: ValuesListMode,
    },
    Dates {
        field: String,
        kind: DatePart,
        order: SortOrder,
    },
    DateTimes {
        field: String,
        kind: DateTimePart,
        order: SortOrder,
    },
}

#[derive(Debug, Clone)]
struct Annotation {
    name: String,
    expr: Expr,
    visible: bool,
}

#[derive(Debug, Clone)]
struct QueryState {
    source: Source,
    scope: Option<Scope>,
    filter: Q,
    annotations: Vec<Annotation>,
    ordering: Option<Vec<String>>,
    reversed: bool,
    distinct: Option<Vec<String>>,
    projection: Projection,
    select_related: Vec<String>,
    prefetch: Vec<String>,
    only: Option<Vec<String>>,
    defer: Vec<String>,
    lock: Option<LockOptions>,
    window: Option<(usize, Option<usize>)>,
    empty: bool,
    /// Deferred error for an illegal narrowing, raised on execution
    poisoned: Option<String>,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            source: Source::Table,
            scope: None,
            filter: Q::All,
            annotations: Vec::new(),
            ordering: None,
            reversed: false,
            distinct: None,
            projection: Projection::Records,
            select_related: Vec::new(),
            prefetch: Vec::new(),
            only: None,
            defer: Vec::new(),
            lock: None,
            window: None,
            empty: false,
            poisoned: None,
        }
    }
}

/// Blocking queryset over one model of a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryQuerySet {
    backend: MemoryBackend,
    model: String,
    alias: String,
    state: Arc<QueryState>,
}

fn flip(field: &str) -> String {
    match field.strip_prefix('-') {
        Some(rest) => rest.to_string(),
        None => format!("-{}", field),
    }
}

fn strings(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

fn compose_window(
    current: Option<(usize, Option<usize>)>,
    start: usize,
    stop: Option<usize>,
) -> (usize, Option<usize>) {
    let (base, limit) = current.unwrap_or((0, None));
    let new_start = match limit {
        Some(limit) => base.saturating_add(start).min(limit),
        None => base.saturating_add(start),
    };
    let new_stop = match (limit, stop) {
        (Some(limit), Some(stop)) => Some(base.saturating_add(stop).min(limit)),
        (None, Some(stop)) => Some(base.saturating_add(stop)),
        (limit, None) => limit,
    };
    let new_stop = new_stop.map(|s| s.max(new_start));
    (new_start, new_stop)
}

fn apply_window<T>(items: Vec<T>, window: Option<(usize, Option<usize>)>) -> Vec<T> {
    let Some((start, stop)) = window else {
        return items;
    };
    let stop = stop.unwrap_or(usize::MAX);
    items
        .into_iter()
        .skip(start)
        .take(stop.saturating_sub(start))
        .collect()
}

fn truncate_date(date: NaiveDate, kind: DatePart) -> Option<NaiveDate> {
    match kind {
        DatePart::Year => date.with_day(1)?.with_month(1),
        DatePart::Month => date.with_day(1),
        DatePart::Week => date.checked_sub_days(chrono::Days::new(
            u64::from(date.weekday().num_days_from_monday()),
        )),
        DatePart::Day => Some(date),
    }
}

fn truncate_datetime(dt: NaiveDateTime, kind: DateTimePart) -> Option<NaiveDateTime> {
    let midnight = |date: NaiveDate| date.and_hms_opt(0, 0, 0);
    match kind {
        DateTimePart::Year => midnight(truncate_date(dt.date(), DatePart::Year)?),
        DateTimePart::Month => midnight(truncate_date(dt.date(), DatePart::Month)?),
        DateTimePart::Week => midnight(truncate_date(dt.date(), DatePart::Week)?),
        DateTimePart::Day => midnight(dt.date()),
        DateTimePart::Hour => dt.with_nanosecond(0)?.with_second(0)?.with_minute(0),
        DateTimePart::Minute => dt.with_nanosecond(0)?.with_second(0),
        DateTimePart::Second => dt.with_nanosecond(0),
    }
}

impl MemoryQuerySet {
    pub(crate) fn new(backend: MemoryBackend, model: &str, alias: &str) -> Self {
        Self {
            backend,
            model: model.to_string(),
            alias: alias.to_string(),
            state: Arc::new(QueryState::default()),
        }
    }

    pub(crate) fn scoped(&self, scope: Scope) -> Self {
        self.derive(|s| s.scope = Some(scope))
    }

    /// Database alias this queryset reads from.
    pub fn db(&self) -> &str {
        &self.alias
    }

    pub fn is_sliced(&self) -> bool {
        self.state.window.is_some()
    }

    pub fn is_ordered(&self) -> bool {
        !self.effective_ordering().is_empty()
    }

    fn derive(&self, update: impl FnOnce(&mut QueryState)) -> Self {
        let mut state = (*self.state).clone();
        update(&mut state);
        Self {
            backend: self.backend.clone(),
            model: self.model.clone(),
            alias: self.alias.clone(),
            state: Arc::new(state),
        }
    }

    /// Narrowing that is illegal on a sliced query; the error surfaces on execution.
    fn derive_unsliced(&self, message: &str, update: impl FnOnce(&mut QueryState)) -> Self {
        self.derive(|s| {
            if s.window.is_some() && s.poisoned.is_none() {
                s.poisoned = Some(message.to_string());
            }
            update(s);
        })
    }

    fn poison(&self, message: String) -> Self {
        self.derive(|s| {
            if s.poisoned.is_none() {
                s.poisoned = Some(message);
            }
        })
    }

    fn combined(&self, op: SetOp, others: &[Self]) -> Self {
        let mut parts = Vec::with_capacity(others.len() + 1);
        parts.push(self.clone());
        parts.extend(others.iter().cloned());

        let mut result = Self::new(self.backend.clone(), &self.model, &self.alias);
        if let Some(other) = others.iter().find(|o| o.model != self.model) {
            return result.poison(format!(
                "Cannot combine queries on two different base models: '{}' and '{}'",
                self.model, other.model
            ));
        }
        result.state = Arc::new(QueryState {
            source: Source::Combined { op, parts },
            ..QueryState::default()
        });
        result
    }

    fn is_plain(&self) -> bool {
        matches!(self.state.source, Source::Table)
            && self.state.window.is_none()
            && self.state.distinct.is_none()
            && self.state.annotations.is_empty()
            && matches!(self.state.projection, Projection::Records)
    }

    fn same_scope(&self, other: &Self) -> bool {
        self.state.scope.as_ref().map(Scope::key) == other.state.scope.as_ref().map(Scope::key)
    }

    fn schema(&self) -> Result<&Arc<ModelSchema>> {
        self.backend.catalog().get_model(&self.model)
    }

    fn ctx<'a>(&'a self, catalog: &'a Catalog, db: &'a Database) -> Ctx<'a> {
        Ctx {
            catalog,
            db,
            alias: &self.alias,
        }
    }

    fn effective_ordering(&self) -> Vec<String> {
        let ordering = match (&self.state.ordering, &self.state.source) {
            (Some(ordering), _) => ordering.clone(),
            (None, Source::Table) => self
                .schema()
                .map(|s| s.default_ordering().to_vec())
                .unwrap_or_default(),
            (None, _) => Vec::new(),
        };
        if self.state.reversed {
            ordering.iter().map(|f| flip(f)).collect()
        } else {
            ordering
        }
    }

    fn annotation_names(&self) -> Vec<String> {
        self.state.annotations.iter().map(|a| a.name.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    fn check(&self) -> Result<()> {
        match &self.state.poisoned {
            Some(message) => Err(ModelError::InvalidQuery(message.clone())),
            None => Ok(()),
        }
    }

    fn validate(&self, ctx: Ctx<'_>) -> Result<()> {
        let annotations = self.annotation_names();
        let schema = self.schema()?;

        for annotation in &self.state.annotations {
            if schema.is_stored(&annotation.name) || ctx.catalog.relation(&self.model, &annotation.name).is_some() {
                return Err(ModelError::InvalidQuery(format!(
                    "The annotation '{}' conflicts with a field on the model.",
                    annotation.name
                )));
            }
            if let Some(source) = annotation.expr.source()
                && source != "*"
            {
                ctx.check_path(&self.model, &split_path(source), &annotations)?;
            }
        }

        let mut paths = Vec::new();
        collect_paths(&self.state.filter, &mut paths);
        for field in self.effective_ordering() {
            let field = field.trim_start_matches('-');
            if field == "?" {
                return Err(ModelError::NotSupported(
                    "Random ordering is not supported".to_string(),
                ));
            }
            paths.push(split_path(field));
        }
        if let Some(fields) = &self.state.distinct {
            paths.extend(fields.iter().map(|f| split_path(f)));
        }
        match &self.state.projection {
            Projection::Values { fields, .. } | Projection::ValuesList { fields, .. } => {
                paths.extend(fields.iter().map(|f| split_path(f)));
            }
            Projection::Dates { field, .. } | Projection::DateTimes { field, .. } => {
                self.check_temporal(field)?;
            }
            Projection::Records => {}
        }
        for path in paths {
            ctx.check_path(&self.model, &path, &annotations)?;
        }
        Ok(())
    }

    fn check_temporal(&self, field: &str) -> Result<()> {
        let schema = self.schema()?;
        let column = schema
            .get_column(field)
            .ok_or_else(|| ModelError::field_not_found(&self.model, field))?;
        if matches!(column.data_type, DataType::Date | DataType::DateTime) {
            Ok(())
        } else {
            Err(ModelError::InvalidQuery(format!(
                "'{}' isn't a DateField or DateTimeField.",
                field
            )))
        }
    }

    fn base(&self, ctx: Ctx<'_>) -> Result<Vec<Record>> {
        if self.state.empty {
            return Ok(Vec::new());
        }

        let mut records = match &self.state.source {
            Source::Table => ctx.db.records(&self.model, &self.alias)?,
            Source::Raw(query) => self.raw_records(ctx, query)?,
            Source::Combined { op, parts } => combine(ctx, *op, parts)?,
        };

        match &self.state.scope {
            Some(Scope::ForeignKey { field, owner }) => {
                records.retain(|r| r.get(field).and_then(Value::as_i64) == Some(*owner));
            }
            Some(Scope::Link { side, owner }) => {
                let linked: HashSet<i64> = ctx.db.linked(side, *owner)?.into_iter().collect();
                records.retain(|r| r.pk().is_some_and(|pk| linked.contains(&pk)));
            }
            None => {}
        }
        Ok(records)
    }

    fn raw_records(&self, ctx: Ctx<'_>, query: &RawQuery) -> Result<Vec<Record>> {
        let plan = raw::plan(query)?;
        if plan.table != self.model {
            return Err(ModelError::InvalidQuery(format!(
                "Raw query selects from '{}' but the queryset is over '{}'",
                plan.table, self.model
            )));
        }
        let mut records = Vec::new();
        for record in ctx.db.records(&self.model, &self.alias)? {
            if ctx.matches(&record, &plan.filter)? {
                records.push(record);
            }
        }
        sort_records(ctx, &mut records, &plan.ordering)?;
        let stop = plan.limit.map(|limit| plan.offset.saturating_add(limit));
        Ok(apply_window(records, Some((plan.offset, stop))))
    }

    /// Filtered, annotated and ordered records before projection and slicing.
    fn selected(&self, ctx: Ctx<'_>) -> Result<Vec<Record>> {
        self.check()?;
        self.validate(ctx)?;

        let mut records = self.base(ctx)?;
        for record in records.iter_mut() {
            for annotation in &self.state.annotations {
                let value = ctx.eval_expr(record, &annotation.expr)?;
                record.annotate(&annotation.name, value);
            }
        }

        let mut kept = Vec::with_capacity(records.len());
        for record in records {
            if ctx.matches(&record, &self.state.filter)? {
                kept.push(record);
            }
        }

        sort_records(ctx, &mut kept, &self.effective_ordering())?;

        if let Some(fields) = self.state.distinct.as_ref().filter(|f| !f.is_empty()) {
            let mut seen = HashSet::new();
            let mut unique = Vec::with_capacity(kept.len());
            for record in kept {
                let mut key = Vec::with_capacity(fields.len());
                for field in fields {
                    key.push(ctx.resolve_one(&record, &split_path(field))?);
                }
                if seen.insert(key) {
                    unique.push(record);
                }
            }
            kept = unique;
        }
        Ok(kept)
    }

    /// Selected records with the slice window applied.
    fn windowed(&self, ctx: Ctx<'_>) -> Result<Vec<Record>> {
        Ok(apply_window(self.selected(ctx)?, self.state.window))
    }

    /// Whether rows map one-to-one onto records, so slicing commutes with projection.
    fn projects_per_record(&self) -> bool {
        let whole_row_distinct = matches!(&self.state.distinct, Some(fields) if fields.is_empty());
        !whole_row_distinct
            && !matches!(
                self.state.projection,
                Projection::Dates { .. } | Projection::DateTimes { .. }
            )
    }

    fn evaluate(&self, ctx: Ctx<'_>) -> Result<Vec<Row>> {
        if self.projects_per_record() {
            let records = self.windowed(ctx)?;
            return self.project(ctx, records);
        }

        let records = self.selected(ctx)?;
        let mut rows = self.project(ctx, records)?;
        if matches!(&self.state.distinct, Some(fields) if fields.is_empty()) {
            let mut unique: Vec<Row> = Vec::with_capacity(rows.len());
            for row in rows {
                if !unique.contains(&row) {
                    unique.push(row);
                }
            }
            rows = unique;
        }
        Ok(apply_window(rows, self.state.window))
    }

    fn default_columns(&self) -> Result<Vec<String>> {
        let mut names = self.schema()?.stored_fields();
        names.extend(
            self.state
                .annotations
                .iter()
                .filter(|a| a.visible)
                .map(|a| a.name.clone()),
        );
        Ok(names)
    }

    fn project(&self, ctx: Ctx<'_>, records: Vec<Record>) -> Result<Vec<Row>> {
        match &self.state.projection {
            Projection::Records => records
                .into_iter()
                .map(|record| self.finish_record(ctx, record).map(Row::Instance))
                .collect(),
            Projection::Values {
                fields,
                expressions,
            } => {
                let names = if fields.is_empty() && expressions.is_empty() {
                    self.default_columns()?
                } else {
                    fields.clone()
                };
                records
                    .iter()
                    .map(|record| {
                        let mut row = Fields::new();
                        for name in &names {
                            row.insert(name.clone(), ctx.resolve_one(record, &split_path(name))?);
                        }
                        for (name, expr) in expressions {
                            row.insert(name.clone(), ctx.eval_expr(record, expr)?);
                        }
                        Ok(Row::Values(row))
                    })
                    .collect()
            }
            Projection::ValuesList { fields, mode } => {
                let names = if fields.is_empty() {
                    self.default_columns()?
                } else {
                    fields.clone()
                };
                if *mode == ValuesListMode::Flat && names.len() != 1 {
                    return Err(ModelError::InvalidQuery(
                        "'flat' is not valid when values_list is called with more than one field."
                            .to_string(),
                    ));
                }
                records
                    .iter()
                    .map(|record| {
                        let values = names
                            .iter()
                            .map(|name| ctx.resolve_one(record, &split_path(name)))
                            .collect::<Result<Vec<_>>>()?;
                        Ok(match mode {
                            ValuesListMode::Tuple => Row::Tuple(values),
                            ValuesListMode::Named => {
                                Row::Named(names.iter().cloned().zip(values).collect())
                            }
                            ValuesListMode::Flat => {
                                Row::Flat(values.into_iter().next().unwrap_or(Value::Null))
                            }
                        })
                    })
                    .collect()
            }
            Projection::Dates { field, kind, order } => {
                let dates: BTreeSet<NaiveDate> = records
                    .iter()
                    .filter_map(|r| r.get(field).and_then(Value::as_date))
                    .filter_map(|d| truncate_date(d, *kind))
                    .collect();
                let mut rows: Vec<Row> = dates.into_iter().map(|d| Row::Flat(Value::Date(d))).collect();
                if *order == SortOrder::Desc {
                    rows.reverse();
                }
                Ok(rows)
            }
            Projection::DateTimes { field, kind, order } => {
                let stamps: BTreeSet<NaiveDateTime> = records
                    .iter()
                    .filter_map(|r| r.get(field).and_then(Value::as_datetime))
                    .filter_map(|dt| truncate_datetime(dt, *kind))
                    .collect();
                let mut rows: Vec<Row> = stamps
                    .into_iter()
                    .map(|dt| Row::Flat(Value::DateTime(dt)))
                    .collect();
                if *order == SortOrder::Desc {
                    rows.reverse();
                }
                Ok(rows)
            }
        }
    }

    fn finish_record(&self, ctx: Ctx<'_>, mut record: Record) -> Result<Record> {
        for path in &self.state.select_related {
            attach_related(ctx, &mut record, &split_path(path))?;
        }
        for lookup in &self.state.prefetch {
            attach_prefetched(ctx, &mut record, &split_path(lookup))?;
        }

        for annotation in self.state.annotations.iter().filter(|a| !a.visible) {
            record.drop_annotation(&annotation.name);
        }

        let schema = self.schema()?;
        let mut deferred: Vec<String> = self.state.defer.clone();
        if let Some(only) = &self.state.only {
            deferred.extend(
                schema
                    .stored_fields()
                    .into_iter()
                    .filter(|f| f != PK && !only.contains(f)),
            );
        }
        for field in deferred {
            if !schema.is_stored(&field) {
                return Err(ModelError::field_not_found(&self.model, field));
            }
            if field != PK {
                record.defer_field(&field);
            }
        }
        Ok(record)
    }

    fn run<T>(&self, op: &'static str, f: impl FnOnce(Ctx<'_>) -> Result<T>) -> Result<T> {
        self.backend.enter(op)?;
        debug!(model = %self.model, alias = %self.alias, op, "query");
        self.backend
            .read(&self.alias, |catalog, db| f(self.ctx(catalog, db)))
    }

    /// Fields for a row created through this queryset: scope key included.
    fn creation_fields(&self, mut fields: Fields) -> Fields {
        if let Some(Scope::ForeignKey { field, owner }) = &self.state.scope {
            fields.insert(field.clone(), Value::Integer(*owner));
        }
        fields
    }

    fn insert_scoped(&self, catalog: &Catalog, db: &mut Database, fields: Fields) -> Result<Record> {
        let pk = db.insert(catalog, &self.model, self.creation_fields(fields))?;
        if let Some(Scope::Link { side, owner }) = &self.state.scope {
            db.link(side, *owner, pk, Fields::new())?;
        }
        db.record(&self.model, pk, &self.alias)
            .ok_or_else(|| ModelError::does_not_exist(&self.model))
    }

    /// The single record matching `lookup`, if any.
    pub(crate) fn find_one(&self, ctx: Ctx<'_>, lookup: &Fields) -> Result<Option<Record>> {
        let found = self.filter(Q::from_fields(lookup)).selected(ctx)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.into_iter().next()),
            count => Err(ModelError::MultipleObjectsReturned {
                model: self.model.clone(),
                count,
            }),
        }
    }

    fn require_unsliced(&self, message: &str) -> Result<()> {
        if self.state.window.is_some() {
            return Err(ModelError::InvalidQuery(message.to_string()));
        }
        if matches!(self.state.source, Source::Combined { .. }) {
            return Err(ModelError::NotSupported(format!(
                "{} after union(), intersection() or difference() is not supported",
                message.split_whitespace().next().unwrap_or("This operation")
            )));
        }
        Ok(())
    }

    fn plan_steps(&self) -> Vec<(&'static str, String)> {
        let mut steps = Vec::new();
        match &self.state.source {
            Source::Table => steps.push(("scan", format!("{} [{}]", self.model, self.alias))),
            Source::Raw(query) => steps.push(("raw", query.sql.clone())),
            Source::Combined { op, parts } => {
                let name = match op {
                    SetOp::Union { all: true } => "union all",
                    SetOp::Union { all: false } => "union",
                    SetOp::Intersection => "intersection",
                    SetOp::Difference => "difference",
                };
                steps.push(("combine", format!("{} of {} queries", name, parts.len())));
            }
        }
        if self.state.empty {
            steps.push(("empty", "no rows".to_string()));
        }
        match &self.state.scope {
            Some(Scope::ForeignKey { field, owner }) => {
                steps.push(("scope", format!("{}.{} = {}", self.model, field, owner)))
            }
            Some(Scope::Link { side, owner }) => {
                steps.push(("scope", format!("linked through {} to {}", side.table, owner)))
            }
            None => {}
        }
        for annotation in &self.state.annotations {
            let step = if annotation.visible { "annotate" } else { "alias" };
            steps.push((step, format!("{} = {}", annotation.name, annotation.expr)));
        }
        if !self.state.filter.is_all() {
            steps.push(("filter", self.state.filter.to_string()));
        }
        let ordering = self.effective_ordering();
        if !ordering.is_empty() {
            steps.push(("order by", ordering.join(", ")));
        }
        if let Some(fields) = &self.state.distinct {
            steps.push(("distinct", fields.join(", ")));
        }
        if let Some((start, stop)) = self.state.window {
            let stop = stop.map(|s| s.to_string()).unwrap_or_default();
            steps.push(("slice", format!("[{}:{}]", start, stop)));
        }
        if !self.state.select_related.is_empty() {
            steps.push(("select related", self.state.select_related.join(", ")));
        }
        if !self.state.prefetch.is_empty() {
            steps.push(("prefetch", self.state.prefetch.join(", ")));
        }
        let projection = match &self.state.projection {
            Projection::Records => None,
            Projection::Values { fields, expressions } => Some(format!(
                "values({})",
                fields
                    .iter()
                    .cloned()
                    .chain(expressions.iter().map(|(n, e)| format!("{}={}", n, e)))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            Projection::ValuesList { fields, mode } => {
                Some(format!("values_list({}) {:?}", fields.join(", "), mode))
            }
            Projection::Dates { field, kind, order } => {
                Some(format!("dates({}, {:?}, {:?})", field, kind, order))
            }
            Projection::DateTimes { field, kind, order } => {
                Some(format!("datetimes({}, {:?}, {:?})", field, kind, order))
            }
        };
        if let Some(projection) = projection {
            steps.push(("project", projection));
        }
        if let Some(lock) = &self.state.lock {
            steps.push(("lock", lock.to_string()));
        }
        steps
    }
}

fn collect_paths(q: &Q, out: &mut Vec<Vec<String>>) {
    match q {
        Q::All => {}
        Q::Condition { path, .. } => out.push(path.clone()),
        Q::And(parts) | Q::Or(parts) => parts.iter().for_each(|p| collect_paths(p, out)),
        Q::Not(inner) => collect_paths(inner, out),
    }
}

fn combine(ctx: Ctx<'_>, op: SetOp, parts: &[MemoryQuerySet]) -> Result<Vec<Record>> {
    let mut lists = Vec::with_capacity(parts.len());
    for part in parts {
        lists.push(part.windowed(ctx)?);
    }
    let mut lists = lists.into_iter();
    let first = lists.next().unwrap_or_default();

    let pk_set = |records: &[Record]| -> HashSet<i64> { records.iter().filter_map(Record::pk).collect() };

    Ok(match op {
        SetOp::Union { all } => {
            let mut out = first;
            for list in lists {
                out.extend(list);
            }
            if !all {
                let mut seen = HashSet::new();
                out.retain(|r| r.pk().is_none_or(|pk| seen.insert(pk)));
            }
            out
        }
        SetOp::Intersection => {
            let others: Vec<HashSet<i64>> = lists.map(|l| pk_set(&l)).collect();
            first
                .into_iter()
                .filter(|r| {
                    r.pk()
                        .is_some_and(|pk| others.iter().all(|set| set.contains(&pk)))
                })
                .collect()
        }
        SetOp::Difference => {
            let others: Vec<HashSet<i64>> = lists.map(|l| pk_set(&l)).collect();
            first
                .into_iter()
                .filter(|r| {
                    r.pk()
                        .is_none_or(|pk| others.iter().all(|set| !set.contains(&pk)))
                })
                .collect()
        }
    })
}

fn sort_records(ctx: Ctx<'_>, records: &mut Vec<Record>, ordering: &[String]) -> Result<()> {
    if ordering.is_empty() || records.len() < 2 {
        return Ok(());
    }
    let keys: Vec<(Vec<String>, bool)> = ordering
        .iter()
        .map(|field| match field.strip_prefix('-') {
            Some(rest) => (split_path(rest), true),
            None => (split_path(field), false),
        })
        .collect();

    let mut decorated = Vec::with_capacity(records.len());
    for record in records.drain(..) {
        let mut values = Vec::with_capacity(keys.len());
        for (path, _) in &keys {
            values.push(ctx.resolve_one(&record, path)?);
        }
        decorated.push((values, record));
    }

    decorated.sort_by(|(a, _), (b, _)| {
        for (index, (_, descending)) in keys.iter().enumerate() {
            let ordering = a[index].sort_cmp(&b[index]);
            let ordering = if *descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
    records.extend(decorated.into_iter().map(|(_, record)| record));
    Ok(())
}

fn attach_related(ctx: Ctx<'_>, record: &mut Record, path: &[String]) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    let relation = ctx
        .catalog
        .relation(record.model(), head)
        .filter(|r| r.is_to_one())
        .ok_or_else(|| {
            let choices: Vec<&str> = ctx
                .catalog
                .relations(record.model())
                .filter(|(_, r)| r.is_to_one())
                .map(|(name, _)| name)
                .collect();
            ModelError::InvalidQuery(format!(
                "Invalid field name(s) given in select_related: '{}'. Choices are: {}",
                head,
                choices.join(", ")
            ))
        })?;

    let mut target = ctx.related_records(record, relation)?.into_iter().next();
    if let Some(target) = target.as_mut() {
        attach_related(ctx, target, rest)?;
    }
    record.cache_related(head, target);
    Ok(())
}

fn attach_prefetched(ctx: Ctx<'_>, record: &mut Record, path: &[String]) -> Result<()> {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    let relation = ctx.catalog.relation(record.model(), head).ok_or_else(|| {
        ModelError::InvalidQuery(format!(
            "Cannot find '{}' on {} object, '{}' is an invalid parameter to prefetch_related()",
            head,
            record.model(),
            head
        ))
    })?;

    let mut related = ctx.related_records(record, relation)?;
    for other in related.iter_mut() {
        attach_prefetched(ctx, other, rest)?;
    }
    if relation.is_to_one() {
        record.cache_related(head, related.into_iter().next());
    } else {
        let ordering = ctx.catalog.get_model(relation.target())?.default_ordering().to_vec();
        sort_records(ctx, &mut related, &ordering)?;
        record.cache_prefetched(head, related);
    }
    Ok(())
}

/// Rows produced chunk by chunk from a snapshot taken when iteration started.
struct LazyRows {
    queryset: MemoryQuerySet,
    snapshot: Database,
    pending: std::vec::IntoIter<Record>,
    chunk_size: usize,
    buffer: VecDeque<Row>,
    failed: bool,
}

impl Iterator for LazyRows {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() {
            let chunk: Vec<Record> = self.pending.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                return None;
            }
            let ctx = self.queryset.ctx(self.queryset.backend.catalog(), &self.snapshot);
            match self.queryset.project(ctx, chunk) {
                Ok(rows) => self.buffer.extend(rows),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl BlockingQuerySet for MemoryQuerySet {
    type Item = Row;
    type Record = Record;

    fn model_name(&self) -> &str {
        &self.model
    }

    fn filter(&self, q: Q) -> Self {
        self.derive_unsliced("Cannot filter a query once a slice has been taken.", |s| {
            s.filter = std::mem::replace(&mut s.filter, Q::All) & q;
        })
    }

    fn exclude(&self, q: Q) -> Self {
        self.derive_unsliced("Cannot filter a query once a slice has been taken.", |s| {
            s.filter = std::mem::replace(&mut s.filter, Q::All) & !q;
        })
    }

    fn annotate(&self, annotations: NamedExprs) -> Self {
        self.derive(|s| {
            s.annotations.extend(annotations.into_iter().map(|(name, expr)| Annotation {
                name,
                expr,
                visible: true,
            }))
        })
    }

    fn alias(&self, aliases: NamedExprs) -> Self {
        self.derive(|s| {
            s.annotations.extend(aliases.into_iter().map(|(name, expr)| Annotation {
                name,
                expr,
                visible: false,
            }))
        })
    }

    fn order_by(&self, fields: &[&str]) -> Self {
        self.derive_unsliced("Cannot reorder a query once a slice has been taken.", |s| {
            s.ordering = Some(strings(fields));
            s.reversed = false;
        })
    }

    fn reverse(&self) -> Self {
        self.derive_unsliced("Cannot reverse a query once a slice has been taken.", |s| {
            s.reversed = !s.reversed;
        })
    }

    fn distinct(&self, fields: &[&str]) -> Self {
        self.derive_unsliced(
            "Cannot create distinct fields once a slice has been taken.",
            |s| s.distinct = Some(strings(fields)),
        )
    }

    fn values(&self, fields: &[&str], expressions: NamedExprs) -> Self {
        self.derive(|s| {
            s.projection = Projection::Values {
                fields: strings(fields),
                expressions,
            }
        })
    }

    fn values_list(&self, fields: &[&str], mode: ValuesListMode) -> Self {
        self.derive(|s| {
            s.projection = Projection::ValuesList {
                fields: strings(fields),
                mode,
            }
        })
    }

    fn dates(&self, field: &str, kind: DatePart, order: SortOrder) -> Self {
        self.derive(|s| {
            s.projection = Projection::Dates {
                field: field.to_string(),
                kind,
                order,
            }
        })
    }

    fn datetimes(&self, field: &str, kind: DateTimePart, order: SortOrder) -> Self {
        self.derive(|s| {
            s.projection = Projection::DateTimes {
                field: field.to_string(),
                kind,
                order,
            }
        })
    }

    fn none(&self) -> Self {
        self.derive(|s| s.empty = true)
    }

    fn all(&self) -> Self {
        self.clone()
    }

    fn union(&self, others: &[Self], all: bool) -> Self {
        let parts: Vec<Self> = others.iter().filter(|o| !o.state.empty).cloned().collect();
        if self.state.empty && parts.is_empty() {
            return self.clone();
        }
        self.combined(SetOp::Union { all }, &parts)
    }

    fn intersection(&self, others: &[Self]) -> Self {
        if self.state.empty || others.iter().any(|o| o.state.empty) {
            return self.none();
        }
        self.combined(SetOp::Intersection, others)
    }

    fn difference(&self, others: &[Self]) -> Self {
        if self.state.empty {
            return self.clone();
        }
        self.combined(SetOp::Difference, others)
    }

    fn select_related(&self, fields: &[&str]) -> Self {
        let fields = if fields.is_empty() {
            let catalog = self.backend.catalog();
            catalog
                .relations(&self.model)
                .filter(|(_, r)| matches!(r, Relation::Forward(key) if !key.nullable))
                .map(|(name, _)| name.to_string())
                .collect()
        } else {
            strings(fields)
        };
        self.derive(|s| {
            for field in fields {
                if !s.select_related.contains(&field) {
                    s.select_related.push(field);
                }
            }
        })
    }

    fn prefetch_related(&self, lookups: &[&str]) -> Self {
        self.derive(|s| {
            if lookups.is_empty() {
                s.prefetch.clear();
            }
            for lookup in lookups {
                if !s.prefetch.iter().any(|p| p == lookup) {
                    s.prefetch.push(lookup.to_string());
                }
            }
        })
    }

    fn only(&self, fields: &[&str]) -> Self {
        self.derive(|s| s.only = Some(strings(fields)))
    }

    fn defer(&self, fields: &[&str]) -> Self {
        self.derive(|s| {
            if fields.is_empty() {
                s.defer.clear();
            }
            s.defer.extend(strings(fields));
        })
    }

    fn using(&self, alias: &str) -> Self {
        let mut qs = self.clone();
        qs.alias = alias.to_string();
        qs
    }

    fn select_for_update(&self, options: LockOptions) -> Self {
        self.derive(|s| s.lock = Some(options))
    }

    fn raw(&self, query: RawQuery) -> Self {
        let alias = query.using.clone().unwrap_or_else(|| self.alias.clone());
        let mut qs = Self::new(self.backend.clone(), &self.model, &alias);
        qs.state = Arc::new(QueryState {
            source: Source::Raw(query),
            ..QueryState::default()
        });
        qs
    }

    fn slice(&self, start: usize, stop: Option<usize>) -> Self {
        self.derive(|s| s.window = Some(compose_window(s.window, start, stop)))
    }

    fn and(&self, other: &Self) -> Self {
        if self.is_sliced() || other.is_sliced() {
            return self.poison("Cannot combine queries once a slice has been taken.".to_string());
        }
        if self.model != other.model {
            return self.poison("Cannot combine queries on two different base models.".to_string());
        }
        if self.state.empty || other.state.empty {
            return self.none();
        }
        if self.is_plain() && other.is_plain() && self.same_scope(other) {
            let extra = other.state.filter.clone();
            return self.derive(|s| s.filter = std::mem::replace(&mut s.filter, Q::All) & extra);
        }
        self.combined(SetOp::Intersection, std::slice::from_ref(other))
    }

    fn or(&self, other: &Self) -> Self {
        if self.is_sliced() || other.is_sliced() {
            return self.poison("Cannot combine queries once a slice has been taken.".to_string());
        }
        if self.model != other.model {
            return self.poison("Cannot combine queries on two different base models.".to_string());
        }
        if self.state.empty {
            return other.clone();
        }
        if other.state.empty {
            return self.clone();
        }
        if self.is_plain() && other.is_plain() && self.same_scope(other) {
            let extra = other.state.filter.clone();
            return self.derive(|s| s.filter = std::mem::replace(&mut s.filter, Q::All) | extra);
        }
        self.combined(SetOp::Union { all: false }, std::slice::from_ref(other))
    }

    fn eval(&self) -> Result<Vec<Row>> {
        self.run("eval", |ctx| self.evaluate(ctx))
    }

    fn get(&self, q: Q) -> Result<Row> {
        let qs = if q.is_all() { self.clone() } else { self.filter(q) };
        let mut rows = qs.run("get", |ctx| qs.evaluate(ctx))?;
        match rows.len() {
            0 => Err(ModelError::does_not_exist(&self.model)),
            1 => rows.pop().ok_or_else(|| ModelError::does_not_exist(&self.model)),
            count => Err(ModelError::MultipleObjectsReturned {
                model: self.model.clone(),
                count,
            }),
        }
    }

    fn create(&self, fields: Fields) -> Result<Record> {
        self.backend.enter("create")?;
        self.backend
            .write(&self.alias, |catalog, db| self.insert_scoped(catalog, db, fields))
    }

    fn get_or_create(&self, lookup: Fields, defaults: Fields) -> Result<(Record, bool)> {
        self.backend.enter("get_or_create")?;
        self.backend.write(&self.alias, |catalog, db| {
            if let Some(found) = self.find_one(self.ctx(catalog, db), &lookup)? {
                return Ok((found, false));
            }
            let mut fields: Fields = lookup
                .into_iter()
                .filter(|(name, _)| !name.contains("__"))
                .collect();
            fields.extend(defaults);
            Ok((self.insert_scoped(catalog, db, fields)?, true))
        })
    }

    fn update_or_create(&self, lookup: Fields, defaults: Fields) -> Result<(Record, bool)> {
        self.backend.enter("update_or_create")?;
        self.backend.write(&self.alias, |catalog, db| {
            if let Some(found) = self.find_one(self.ctx(catalog, db), &lookup)? {
                let pk = found.pk().ok_or_else(|| ModelError::does_not_exist(&self.model))?;
                db.update(catalog, &self.model, pk, defaults)?;
                let record = db
                    .record(&self.model, pk, &self.alias)
                    .ok_or_else(|| ModelError::does_not_exist(&self.model))?;
                return Ok((record, false));
            }
            let mut fields: Fields = lookup
                .into_iter()
                .filter(|(name, _)| !name.contains("__"))
                .collect();
            fields.extend(defaults);
            Ok((self.insert_scoped(catalog, db, fields)?, true))
        })
    }

    fn bulk_create(&self, objs: Vec<Record>, options: BulkOptions) -> Result<Vec<Record>> {
        self.backend.enter("bulk_create")?;
        if options.batch_size == Some(0) {
            return Err(ModelError::InvalidQuery(
                "Batch size must be a positive integer.".to_string(),
            ));
        }
        if let Some(wrong) = objs.iter().find(|o| o.model() != self.model) {
            return Err(ModelError::TypeMismatch(format!(
                "bulk_create() on '{}' got a '{}' record",
                self.model,
                wrong.model()
            )));
        }

        self.backend.write(&self.alias, |catalog, db| {
            let mut created = Vec::with_capacity(objs.len());
            for mut obj in objs {
                let mut fields = obj.payload();
                if let Some(pk) = obj.pk() {
                    fields.insert(PK.to_string(), Value::Integer(pk));
                }
                match db.insert(catalog, &self.model, self.creation_fields(fields)) {
                    Ok(pk) => {
                        obj.set_pk(Some(pk));
                        if let Some(row) = db.record(&self.model, pk, &self.alias) {
                            obj.replace_fields(row.fields().clone());
                        }
                        obj.set_db(&self.alias);
                    }
                    Err(ModelError::Integrity(reason)) if options.ignore_conflicts => {
                        debug!(model = %self.model, %reason, "bulk_create conflict ignored");
                    }
                    Err(err) => return Err(err),
                }
                created.push(obj);
            }
            Ok(created)
        })
    }

    fn bulk_update(&self, objs: Vec<Record>, fields: &[&str], batch_size: Option<usize>) -> Result<usize> {
        self.backend.enter("bulk_update")?;
        if batch_size == Some(0) {
            return Err(ModelError::InvalidQuery(
                "Batch size must be a positive integer.".to_string(),
            ));
        }
        if fields.is_empty() {
            return Err(ModelError::InvalidQuery(
                "Field names must be given to bulk_update().".to_string(),
            ));
        }
        let schema = self.schema()?;
        for field in fields {
            if *field == PK || *field == "pk" {
                return Err(ModelError::InvalidQuery(
                    "bulk_update() cannot be used with primary key fields.".to_string(),
                ));
            }
            if !schema.is_stored(field) {
                return Err(ModelError::field_not_found(&self.model, *field));
            }
        }
        if objs.iter().any(|o| o.pk().is_none()) {
            return Err(ModelError::InvalidQuery(
                "All bulk_update() objects must have a primary key set.".to_string(),
            ));
        }

        self.backend.write(&self.alias, |catalog, db| {
            let mut updated = 0;
            for obj in &objs {
                let Some(pk) = obj.pk() else { continue };
                let changes: Fields = fields
                    .iter()
                    .map(|f| (f.to_string(), obj.get(f).cloned().unwrap_or(Value::Null)))
                    .collect();
                if db.update(catalog, &self.model, pk, changes)? {
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }

    fn count(&self) -> Result<usize> {
        self.run("count", |ctx| {
            if self.projects_per_record() {
                Ok(self.windowed(ctx)?.len())
            } else {
                Ok(self.evaluate(ctx)?.len())
            }
        })
    }

    fn in_bulk(&self, ids: Option<Vec<Value>>, field_name: &str) -> Result<HashMap<Value, Row>> {
        if self.is_sliced() {
            return Err(ModelError::InvalidQuery(
                "Cannot use 'limit' or 'offset' with in_bulk().".to_string(),
            ));
        }
        let field = if field_name == "pk" { PK } else { field_name };
        let schema = self.schema()?;
        let unique = field == PK
            || schema.get_column(field).is_some_and(|c| c.unique)
            || schema.get_foreign_key(field).is_some_and(|k| k.unique);
        if !unique {
            return Err(ModelError::InvalidQuery(format!(
                "in_bulk()'s field_name must be a unique field but '{}' isn't.",
                field_name
            )));
        }
        if ids.as_ref().is_some_and(Vec::is_empty) {
            self.backend.enter("in_bulk")?;
            return Ok(HashMap::new());
        }

        let qs = match ids {
            Some(ids) => self.filter(Q::is_in(field, ids)),
            None => self.clone(),
        };
        let rows = qs.run("in_bulk", |ctx| qs.evaluate(ctx))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get(field).cloned().map(|key| (key, row)))
            .collect())
    }

    fn iterator(&self, chunk_size: usize) -> Result<RowIter<Row>> {
        if chunk_size == 0 {
            return Err(ModelError::InvalidQuery(
                "Chunk size must be strictly positive.".to_string(),
            ));
        }
        self.backend.enter("iterator")?;
        let snapshot = self.backend.snapshot(&self.alias)?;
        let ctx = self.ctx(self.backend.catalog(), &snapshot);

        if !self.projects_per_record() {
            let rows = self.evaluate(ctx)?;
            return Ok(Box::new(rows.into_iter().map(Ok)));
        }
        let pending = self.windowed(ctx)?;
        Ok(Box::new(LazyRows {
            queryset: self.clone(),
            snapshot,
            pending: pending.into_iter(),
            chunk_size,
            buffer: VecDeque::new(),
            failed: false,
        }))
    }

    fn latest(&self, fields: &[&str]) -> Result<Row> {
        self.latest_or_earliest(fields, true)
    }

    fn earliest(&self, fields: &[&str]) -> Result<Row> {
        self.latest_or_earliest(fields, false)
    }

    fn first(&self) -> Result<Option<Row>> {
        let qs = if self.is_ordered() || self.is_sliced() {
            self.clone()
        } else {
            self.order_by(&[PK])
        };
        let qs = qs.slice(0, Some(1));
        Ok(qs.run("first", |ctx| qs.evaluate(ctx))?.into_iter().next())
    }

    fn last(&self) -> Result<Option<Row>> {
        let qs = if self.is_ordered() || self.is_sliced() {
            self.clone()
        } else {
            self.order_by(&[PK])
        };
        Ok(qs.run("last", |ctx| qs.evaluate(ctx))?.pop())
    }

    fn aggregate(&self, aggregates: NamedExprs) -> Result<BTreeMap<String, Value>> {
        self.run("aggregate", |ctx| {
            let records = self.windowed(ctx)?;
            let mut result = BTreeMap::new();
            for (name, expr) in &aggregates {
                result.insert(name.clone(), ctx.aggregate(&records, expr)?);
            }
            Ok(result)
        })
    }

    fn exists(&self) -> Result<bool> {
        self.count().map(|count| count > 0)
    }

    fn update(&self, fields: Fields) -> Result<usize> {
        self.require_unsliced("Cannot update a query once a slice has been taken.")?;
        self.backend.enter("update")?;
        self.backend.write(&self.alias, |catalog, db| {
            let pks: Vec<i64> = self
                .selected(self.ctx(catalog, db))?
                .iter()
                .filter_map(Record::pk)
                .collect();
            let mut updated = 0;
            for pk in pks {
                if db.update(catalog, &self.model, pk, fields.clone())? {
                    updated += 1;
                }
            }
            Ok(updated)
        })
    }

    fn delete(&self) -> Result<DeleteSummary> {
        self.require_unsliced("Cannot use 'limit' or 'offset' with delete().")?;
        if !matches!(self.state.projection, Projection::Records) {
            return Err(ModelError::InvalidQuery(
                "Cannot call delete() after .values() or .values_list()".to_string(),
            ));
        }
        if self.state.distinct.as_ref().is_some_and(|f| !f.is_empty()) {
            return Err(ModelError::InvalidQuery(
                "Cannot call delete() after .distinct(*fields).".to_string(),
            ));
        }
        self.backend.enter("delete")?;
        self.backend.write(&self.alias, |catalog, db| {
            let pks: Vec<i64> = self
                .selected(self.ctx(catalog, db))?
                .iter()
                .filter_map(Record::pk)
                .collect();
            db.delete(catalog, &self.model, pks)
        })
    }

    fn explain(&self, format: Option<&str>) -> Result<String> {
        self.backend.enter("explain")?;
        self.check()?;
        let steps = self.plan_steps();
        match format.map(str::to_ascii_lowercase).as_deref() {
            None | Some("text") => Ok(steps
                .iter()
                .enumerate()
                .map(|(depth, (step, detail))| {
                    format!("{}{} {}", "  ".repeat(depth.min(1)), step.to_uppercase(), detail)
                })
                .collect::<Vec<_>>()
                .join("\n")),
            Some("json") => {
                let plan: Vec<serde_json::Value> = steps
                    .iter()
                    .map(|(step, detail)| json!({ "step": step, "detail": detail }))
                    .collect();
                serde_json::to_string_pretty(&json!({
                    "model": self.model,
                    "alias": self.alias,
                    "plan": plan,
                }))
                .map_err(ModelError::backend)
            }
            Some(other) => Err(ModelError::InvalidQuery(format!(
                "Unknown explain format '{}'; use 'text' or 'json'",
                other
            ))),
        }
    }
}

impl MemoryQuerySet {
    fn latest_or_earliest(&self, fields: &[&str], latest: bool) -> Result<Row> {
        let op = if latest { "latest" } else { "earliest" };
        if self.is_sliced() {
            return Err(ModelError::InvalidQuery(
                "Cannot change a query once a slice has been taken.".to_string(),
            ));
        }
        let mut ordering: Vec<String> = strings(fields);
        if ordering.is_empty() {
            ordering = self.schema()?.latest_by().to_vec();
        }
        if ordering.is_empty() {
            return Err(ModelError::InvalidQuery(
                "earliest() and latest() require either fields as positional arguments or \
                 'get_latest_by' in the model's Meta."
                    .to_string(),
            ));
        }
        if latest {
            ordering = ordering.iter().map(|f| flip(f)).collect();
        }
        let ordering: Vec<&str> = ordering.iter().map(String::as_str).collect();
        let qs = self.order_by(&ordering).slice(0, Some(1));
        qs.run(op, |ctx| qs.evaluate(ctx))?
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::does_not_exist(&self.model))
    }
}

impl fmt::Debug for MemoryQuerySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQuerySet")
            .field("model", &self.model)
            .field("alias", &self.alias)
            .field("state", &self.state)
            .finish()
    }
}
