pub mod config;
pub mod controller;
pub mod cookies;
pub mod draft;
pub mod error;
pub mod exchange;
pub mod headers;
pub mod history;
pub mod host;
pub mod legacy;
pub mod notify;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod virtual_protocol;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;

pub use crate::config::Config;
use crate::controller::RequestLifecycleController;
use crate::exchange::Client;
use crate::history::{HistoryStore, Settings};
use crate::notify::Notifier;
use crate::registry::InFlightRegistry;
use crate::storage::Storage;

const IN_MEMORY_DATABASE: &str = "sqlite::memory:";

/// Everything a send needs, shared by the host service and every
/// controller.
#[derive(Clone, Debug)]
pub struct Engine {
    pub client: Client,
    pub storage: Storage,
    pub registry: InFlightRegistry,
    config: Config,
}

impl Engine {
    pub async fn new(config: &Config) -> Result<Self> {
        let client = if config.exchange.cookie_jar {
            Client::with_cookie_jar()?
        } else {
            Client::without_cookie_jar()?
        };

        let storage = if config.database_url == IN_MEMORY_DATABASE {
            tracing::debug!("storage is not persisted");
            Storage::in_memory()
        } else {
            Storage::open(&config.database_url).await?
        };

        Ok(Self {
            client,
            storage,
            registry: InFlightRegistry::new(),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A history store on a new storage context.
    pub fn history(&self) -> HistoryStore {
        let defaults = Settings::new(
            self.config.exchange.default_timeout_ms,
            self.config.history.limit,
        );
        HistoryStore::new(self.storage.context(), defaults)
    }

    pub fn controller(&self, notifier: Arc<dyn Notifier>) -> RequestLifecycleController {
        RequestLifecycleController::new(
            self.client.clone(),
            self.history(),
            self.registry.clone(),
            notifier,
            self.config.exchange.clone(),
        )
    }
}

pub async fn app(config: &Config) -> Result<(Router, Engine)> {
    let engine = Engine::new(config).await?;

    let router = host::router(
        engine.client.clone(),
        engine.registry.clone(),
        engine.history(),
    );

    Ok((router, engine))
}
