use std::sync::Arc;

use tracing::info;

use crate::bridge::{Bridge, BridgeConfig};
use crate::core::Result;
use crate::model::{Instance, Model, ModelDescriptor, ModelRegistry};
use crate::query::{AsyncManager, Backend, RecordOf};

struct Inner<B> {
    backend: B,
    bridge: Bridge,
    registry: ModelRegistry,
    config: BridgeConfig,
}

/// Async entry point over a blocking backend.
///
/// Cheap to clone; every clone shares the backend, the bridge and the model
/// registry.
///
/// ```
/// # use asyncmodel::prelude::*;
/// # tokio_test::block_on(async {
/// let backend = MemoryBackend::builder()
///     .model(ModelSchema::new("price").column(Column::new("amount", DataType::Float)))
///     .build()?;
/// let db = AsyncDatabase::new(backend);
/// let prices = db.objects("price")?;
/// prices.create(fields! { "amount" => 9.5 }).await?;
/// prices.create(fields! { "amount" => 4.0 }).await?;
///
/// let cheapest = prices.order_by(&["amount"]).first().await?;
/// assert_eq!(cheapest.and_then(|row| row.get("amount").cloned()), Some(Value::Float(4.0)));
/// # Ok::<(), ModelError>(())
/// # }).unwrap();
/// ```
pub struct AsyncDatabase<B: Backend> {
    inner: Arc<Inner<B>>,
}

impl<B: Backend> AsyncDatabase<B> {
    pub fn new(backend: B) -> Self {
        let config = BridgeConfig::default();
        let bridge = Bridge::new(&config);
        Self::assemble(backend, bridge, config)
    }

    /// Database handle with its own worker pool sized by `config`.
    pub fn with_config(backend: B, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let bridge = Bridge::new(&config);
        Ok(Self::assemble(backend, bridge, config))
    }

    /// Database handle scheduling through an existing bridge.
    pub fn with_bridge(backend: B, bridge: Bridge, config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(backend, bridge, config))
    }

    fn assemble(backend: B, bridge: Bridge, config: BridgeConfig) -> Self {
        info!(
            max_workers = config.max_workers,
            thread_sensitive = bridge.is_thread_sensitive(),
            "async database ready"
        );
        Self {
            inner: Arc::new(Inner {
                backend,
                registry: ModelRegistry::new(&config.accessor_prefix),
                bridge,
                config,
            }),
        }
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn register<M: Model>(&self) -> Result<Arc<ModelDescriptor>> {
        self.register_model(M::NAME)
    }

    /// Introspect `name` and build its accessor table.
    pub fn register_model(&self, name: &str) -> Result<Arc<ModelDescriptor>> {
        if self.inner.registry.contains(name) {
            return self.inner.registry.get(name);
        }
        let fields = self.inner.backend.fields(name)?;
        self.inner.registry.register(name, fields)
    }

    /// Async manager over every record of `M`.
    pub fn aobjects<M: Model>(&self) -> Result<AsyncManager<B::QuerySet>> {
        self.objects(M::NAME)
    }

    pub fn objects(&self, name: &str) -> Result<AsyncManager<B::QuerySet>> {
        let inner = self.inner.backend.objects(name)?;
        Ok(AsyncManager::new(inner, self.inner.bridge.clone()))
    }

    /// Bind a record to this handle, registering its model on first use.
    pub fn instance(&self, record: RecordOf<B::QuerySet>) -> Result<Instance<B>> {
        let model = self.inner.backend.record_model(&record).to_string();
        let descriptor = self.register_model(&model)?;
        Ok(Instance::new(self.clone(), descriptor, record))
    }

    /// Run a blocking closure against the backend from a bridge worker.
    pub async fn run<F, T>(&self, op: &'static str, func: F) -> Result<T>
    where
        F: FnOnce(B) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.inner.backend.clone();
        self.inner.bridge.call(op, move || func(backend)).await
    }
}

impl<B: Backend> Clone for AsyncDatabase<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for AsyncDatabase<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDatabase")
            .field("config", &self.inner.config)
            .field("models", &self.inner.registry.len())
            .finish()
    }
}
