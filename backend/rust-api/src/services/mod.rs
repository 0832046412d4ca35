use crate::config::{Config, StorageBackend};
use std::sync::Arc;

pub mod attempt_service;
pub mod mongo_step_store;
pub mod step_log;
pub mod step_store;

use attempt_service::AttemptService;
use mongo_step_store::MongoStepStore;
use step_store::{InMemoryStepStore, StepStore};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn StepStore>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn StepStore> = match config.storage_backend {
            StorageBackend::Mongo => {
                let client = mongodb::Client::with_uri_str(&config.mongo_uri).await?;
                let store = MongoStepStore::new(client, &config.mongo_database);

                tokio::time::timeout(std::time::Duration::from_secs(30), store.ensure_indexes())
                    .await
                    .map_err(|_| anyhow::anyhow!("MongoDB index setup timeout after 30s"))??;

                tracing::info!("MongoDB step store ready: {}", config.mongo_database);
                Arc::new(store)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory step store, data is lost on restart");
                Arc::new(InMemoryStepStore::new())
            }
        };

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn StepStore>) -> Self {
        Self { config, store }
    }

    pub fn attempt_service(&self) -> AttemptService {
        AttemptService::new(self.store.clone())
    }
}
