//! Collaborative document sync gateway.
//!
//! Authenticated WebSocket connections edit Automerge documents. Every flush
//! persists the binary state, projects it to markdown and fans it out to a
//! full-text index, a vector index, the document metadata and per-user usage
//! totals.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod index;
pub mod storage;
pub mod sync;
pub mod usage;

use axum::Router;
use std::sync::Arc;

use auth::AuthVerifier;
use config::GatewayConfig;
use gateway::{build_router, AppState};
use index::{SearchIndex, VectorIndex};
use storage::SledStore;
use sync::{PersistenceHooks, SyncServer, SyncServerConfig};
use usage::{StoreUsageAccountant, UsageAccountant};

/// The assembled gateway: storage, sync engine and auth wired together
pub struct Gateway {
    pub store: Arc<SledStore>,
    pub sync: Arc<SyncServer>,
    pub auth: Arc<AuthVerifier>,
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        store: Arc<SledStore>,
        search: Arc<dyn SearchIndex>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        let usage: Arc<dyn UsageAccountant> = Arc::new(StoreUsageAccountant::new(store.clone()));
        let hooks = PersistenceHooks::new(store.clone(), store.clone(), search, vectors, usage)
            .with_preview_length(config.preview_length);

        let sync_config = SyncServerConfig {
            flush: config.flush.clone(),
            ..Default::default()
        };
        let sync = Arc::new(SyncServer::new(Arc::new(hooks), sync_config));
        let auth = Arc::new(AuthVerifier::new(
            config.jwt_secret.as_bytes(),
            config.jwt_leeway_secs,
            store.clone(),
        ));

        Self { store, sync, auth }
    }

    pub fn router(&self) -> Router {
        build_router(Arc::new(AppState::new(self.sync.clone(), self.auth.clone())))
    }
}
