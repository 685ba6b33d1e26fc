use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("{model} matching query does not exist")]
    DoesNotExist { model: String },

    #[error("get() returned more than one {model} -- it returned {count}!")]
    MultipleObjectsReturned { model: String, count: usize },

    #[error("You cannot call this from an async context - use a bridged call instead: {0}")]
    SynchronousOnlyOperation(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Field '{field}' not found on model '{model}'")]
    FieldNotFound { model: String, field: String },

    #[error("Model '{0}' is not registered")]
    UnknownModel(String),

    #[error("'{model}' object has no attribute '{attribute}'")]
    UnknownAttribute { model: String, attribute: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Index {index} out of range for {len} rows")]
    IndexOutOfRange { index: isize, len: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl ModelError {
    pub fn does_not_exist(model: impl Into<String>) -> Self {
        Self::DoesNotExist { model: model.into() }
    }

    pub fn field_not_found(model: impl Into<String>, field: impl Into<String>) -> Self {
        Self::FieldNotFound {
            model: model.into(),
            field: field.into(),
        }
    }

    /// Wrap a foreign backend error so it passes through untouched.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }

    pub fn is_does_not_exist(&self) -> bool {
        matches!(self, Self::DoesNotExist { .. })
    }

    pub fn is_scheduling(&self) -> bool {
        matches!(self, Self::Scheduling(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

impl<T> From<std::sync::PoisonError<T>> for ModelError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_model() {
        let err = ModelError::does_not_exist("Price");
        assert_eq!(err.to_string(), "Price matching query does not exist");

        let err = ModelError::MultipleObjectsReturned {
            model: "Topping".into(),
            count: 3,
        };
        assert!(err.to_string().contains("it returned 3"));
    }

    #[test]
    fn test_backend_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = ModelError::backend(io);
        assert_eq!(err.to_string(), "disk on fire");
    }

    #[test]
    fn test_poison_maps_to_lock() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(0));
        let poisoner = std::sync::Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        let err: ModelError = lock.lock().unwrap_err().into();
        assert!(matches!(err, ModelError::Lock(_)));
    }
}
