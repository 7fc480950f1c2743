//! Shared handle wiring the store, pins and command queue together.

use crate::config::{Config, FileLocations};
use crate::db::Database;
use crate::error::Result;
use crate::offline_store::OfflineStore;
use crate::pins::PinRegistry;
use crate::queue::{
    CommandRunner, CommandStore, EventuallyQueue, FileCommandStore, Reachability, SessionProvider,
    SqlCommandStore,
};
use mooring_engine::ClassRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// An opened local datastore with its command queue running.
#[derive(Clone)]
pub struct Mooring {
    pub db: Arc<Database>,
    pub store: Arc<OfflineStore>,
    pub pins: PinRegistry,
    pub queue: EventuallyQueue,
    pub reachability: Reachability,
    monitor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Mooring {
    /// Open the datastore described by `config` with no registered classes.
    pub async fn open(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        Self::open_with_registry(config, ClassRegistry::new(), runner, session).await
    }

    /// Open the datastore, start the command queue and, if enabled, follow
    /// connectivity changes.
    pub async fn open_with_registry(
        config: &Config,
        registry: ClassRegistry,
        runner: Arc<dyn CommandRunner>,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self> {
        let db = Arc::new(Database::new(config.database_path()));
        db.open().await?;

        let store = Arc::new(OfflineStore::new(db.clone(), registry));
        let pins = PinRegistry::new(store.clone());
        let commands: Arc<dyn CommandStore> = match config.legacy_queue_dir() {
            Some(dir) => Arc::new(FileCommandStore::open(dir).await?),
            None => Arc::new(SqlCommandStore::new(db.clone())),
        };

        let queue = EventuallyQueue::new(store.clone(), commands, runner, session, config.queue);
        let reachability = Reachability::default();
        let monitor = config
            .monitor_reachability
            .then(|| queue.monitor(&reachability));
        queue.start().await?;

        tracing::info!(
            path = %config.database_path.display(),
            legacy_queue = config.legacy_queue_dir.is_some(),
            "Local datastore opened"
        );

        Ok(Self {
            db,
            store,
            pins,
            queue,
            reachability,
            monitor: Arc::new(Mutex::new(monitor)),
        })
    }

    /// Stop the queue and close the database.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.terminate().await;
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.db.close().await?;
        tracing::info!("Local datastore closed");
        Ok(())
    }
}
