//! Lazy async query proxies over blocking querysets.

pub mod args;
pub mod backend;
pub mod chunked;
pub mod lookup;
pub mod proxy;
pub mod related;

pub use args::{
    BulkOptions, DEFAULT_CHUNK_SIZE, DatePart, DateTimePart, LockOptions, RawQuery, SortOrder,
    ValuesListMode,
};
pub use backend::{
    Backend, BlockingQuerySet, ManyToManyManager, ManyToOneManager, NamedExprs, RecordOf, RowIter,
};
pub use chunked::ChunkedRows;
pub use lookup::{Expr, Lookup, Operand, Q};
pub use proxy::{AsyncManager, AsyncManyToManyRelated, AsyncManyToOneRelated, AsyncQuerySet};
pub use related::{ManyToManyRelation, ManyToOneRelation, RelationVariant, Unrelated};
