pub mod error;
pub mod types;
pub mod value;

pub use error::{ModelError, Result};
pub use types::{
    DeleteOptions, DeleteSummary, FieldMeta, Fields, RelationInfo, RelationshipKind, SaveOptions,
};
pub use value::{DataType, Value};
