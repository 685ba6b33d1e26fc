//! Everything an application usually needs, in one import.
//!
//! `use asyncmodel::prelude::*;` brings in the async database handle, the
//! query building blocks and the in-memory backend with its schema types.

pub use crate::bridge::{BridgeConfig, async_to_sync, sync_to_async, thread_sensitive_scope};
pub use crate::core::{
    DataType, DeleteOptions, DeleteSummary, Fields, ModelError, Result, SaveOptions, Value,
};
pub use crate::facade::AsyncDatabase;
pub use crate::model::{AsyncPersist, Instance, Model, Related};
pub use crate::query::{
    AsyncManager, AsyncManyToManyRelated, AsyncManyToOneRelated, AsyncQuerySet, BulkOptions,
    DatePart, DateTimePart, Expr, LockOptions, Lookup, Q, RawQuery, SortOrder, ValuesListMode,
};
pub use crate::storage::{
    Column, ForeignKey, ManyToMany, MemoryBackend, ModelSchema, OnDelete, Record, Row,
};
pub use crate::{fields, q};

pub mod advanced {
    //! Escape hatch for backend authors.
    //!
    //! Application code should normally stay on the top-level prelude.
    pub use crate::bridge::{AffinityThread, Bridge, WorkerPool};
    pub use crate::query::{Backend, BlockingQuerySet, ManyToManyManager, ManyToOneManager};
    pub use crate::storage::{Catalog, Database, MemoryQuerySet, StatsSnapshot};
}
