//! Model registration and record-level async operations.

pub mod instance;
pub mod registry;

pub use instance::{AsyncPersist, Instance, Related};
pub use registry::{Cardinality, Model, ModelDescriptor, ModelRegistry, RelationDescriptor};
