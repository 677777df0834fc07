use std::sync::Arc;

use keystone_oids::{OidAllocator, StorageOidStrategy};
use keystone_storage::{AppStores, StorageEngine};
use tokio::sync::broadcast;

use crate::config::DataConfig;
use crate::error::DataResult;
use crate::event::DataEvent;
use crate::serialization::SerializationRegistry;
use crate::transaction::Transaction;

const EVENT_CAPACITY: usize = 1024;

/// Everything a transaction needs for one application.
pub struct DataContext {
    engine: Arc<dyn StorageEngine>,
    stores: AppStores,
    allocator: Arc<OidAllocator>,
    registry: Arc<SerializationRegistry>,
    events: broadcast::Sender<DataEvent>,
    config: DataConfig,
}

impl DataContext {
    /// Open `app` on `engine` with a local, storage-backed oid allocator.
    pub fn open(
        app: &str,
        engine: Arc<dyn StorageEngine>,
        registry: Arc<SerializationRegistry>,
        config: DataConfig,
    ) -> DataResult<Self> {
        let stores = AppStores::open(engine.as_ref(), app)?;
        let strategy =
            StorageOidStrategy::with_block_size(engine.clone(), stores.meta.clone(), config.oid_block_size);
        let allocator = Arc::new(OidAllocator::new(Arc::new(strategy)));
        Self::with_allocator(app, engine, registry, allocator, config)
    }

    /// Open `app` with an externally supplied allocator, as nodes that read
    /// and commit through the metaserver do.
    pub fn with_allocator(
        app: &str,
        engine: Arc<dyn StorageEngine>,
        registry: Arc<SerializationRegistry>,
        allocator: Arc<OidAllocator>,
        config: DataConfig,
    ) -> DataResult<Self> {
        let stores = AppStores::open(engine.as_ref(), app)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            engine,
            stores,
            allocator,
            registry,
            events,
            config,
        })
    }

    pub fn app(&self) -> &str {
        &self.stores.app
    }

    pub fn stores(&self) -> &AppStores {
        &self.stores
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub fn allocator(&self) -> &Arc<OidAllocator> {
        &self.allocator
    }

    pub fn registry(&self) -> &Arc<SerializationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    /// Subscribe to byte-count events.
    pub fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: DataEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn begin(&self) -> DataResult<Transaction<'_>> {
        Transaction::begin(self)
    }
}

impl std::fmt::Debug for DataContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("app", &self.stores.app)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
