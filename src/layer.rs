use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::QueryCache;
use crate::config::DataLayerConfig;
use crate::database::DatabaseService;
use crate::index_manager::{default_access_patterns, default_indexes, IndexManager};
use crate::traits::StoreClient;
use crate::transaction::{TransactionManager, TransactionOptions};

/// One shared instance of every data-access component, wired together.
///
/// Construct it once at startup and hand out clones of the `Arc`s; the
/// background sweeps only run after [`DataLayer::start_background_tasks`].
pub struct DataLayer {
    cache: Arc<QueryCache<Value>>,
    transactions: Arc<TransactionManager>,
    database: Arc<DatabaseService>,
    indexes: Arc<IndexManager>,
    config: DataLayerConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataLayer {
    pub fn new(client: Arc<dyn StoreClient>, config: DataLayerConfig) -> Self {
        let cache = Arc::new(QueryCache::new(config.cache_config()));
        let transactions = Arc::new(TransactionManager::new(config.transaction_config()));
        let database = Arc::new(DatabaseService::new(
            client,
            transactions.clone(),
            config.database_config(),
        ));

        let mut indexes = IndexManager::new(database.clone(), config.index_config());
        if config.indexes.register_defaults {
            indexes = indexes
                .with_indexes(default_indexes())
                .with_access_patterns(default_access_patterns());
        }

        Self {
            cache,
            transactions,
            database,
            indexes: Arc::new(indexes),
            config,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts the cache sweeper, the connection reaper and, if configured,
    /// periodic index analysis. Must be called inside a tokio runtime.
    pub fn start_background_tasks(&self) {
        self.cache.start_sweeper();
        self.transactions.pool().start_reaper();

        if let Some(handle) = self.indexes.start_periodic_analysis() {
            let mut tasks = self.tasks.lock();
            for previous in tasks.drain(..) {
                previous.abort();
            }
            tasks.push(handle);
        }
        info!("Data layer background tasks started");
    }

    /// Stops every background task and destroys the cache
    pub async fn shutdown(&self) {
        self.cache.destroy();
        self.transactions.pool().stop_reaper();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for outcome in join_all(tasks).await {
            if let Err(e) = outcome {
                if !e.is_cancelled() {
                    debug!("Background task ended abnormally: {}", e);
                }
            }
        }
        info!("Data layer shut down");
    }

    pub fn cache(&self) -> &Arc<QueryCache<Value>> {
        &self.cache
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn database(&self) -> &Arc<DatabaseService> {
        &self.database
    }

    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    /// Transaction options built from the configured defaults
    pub fn transaction_options(&self) -> TransactionOptions {
        self.transactions.default_options()
    }

    pub fn config(&self) -> &DataLayerConfig {
        &self.config
    }
}
