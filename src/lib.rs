// ============================================================================
// asyncmodel Library
// ============================================================================

//! Async query and record access over blocking data layers.
//!
//! A blocking [`Backend`](query::Backend) supplies querysets, related
//! managers and record persistence. This crate wraps it so async code can
//! build queries lazily and await them, while every blocking call runs on a
//! bridge worker instead of the runtime's threads.
//!
//! ```ignore
//! use asyncmodel::prelude::*;
//!
//! let db = AsyncDatabase::new(backend);
//! let prices = db.objects("price")?;
//! let cheap = prices.filter(q! { "amount__lt" => 10.0 }).order_by(&["-amount"]);
//! for row in cheap.eval().await? {
//!     println!("{}", row);
//! }
//!
//! let found = db.objects("pizza")?.get(q! { "pk" => 1 }).await?;
//! let mut pizza = db.instance(found.into_instance().unwrap())?;
//! let toppings = pizza.many_to_many("atoppings").await?;
//! toppings.through_defaults(fields! { "position" => 1 }).add(vec![bacon]).await?;
//! pizza.set("name", "margherita");
//! pizza.asave(SaveOptions::default()).await?;
//! ```

#[macro_use]
mod macros;

pub mod bridge;
pub mod core;
pub mod facade;
pub mod model;
pub mod prelude;
pub mod query;
pub mod storage;

// Re-export main types for convenience
pub use bridge::{Bridge, BridgeConfig, async_to_sync, can_block, sync_to_async};
pub use core::{
    DataType, DeleteOptions, DeleteSummary, Fields, ModelError, Result, SaveOptions, Value,
};
pub use facade::AsyncDatabase;
pub use model::{AsyncPersist, Instance, Model, Related};
pub use query::{AsyncManager, AsyncQuerySet, Expr, Lookup, Q};
pub use storage::{MemoryBackend, Record, Row};
