//! Collab Gateway - authenticated CRDT document sync
//!
//! - Automerge documents synchronized over WebSocket
//! - Sled for state blobs, document records and usage rows
//! - Elasticsearch and Qdrant fan-out on every flush

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

use collab_gateway::config::GatewayConfig;
use collab_gateway::index::search::{DisabledSearchIndex, ElasticsearchIndex};
use collab_gateway::index::vector::{DisabledVectorIndex, QdrantVectorIndex};
use collab_gateway::index::{SearchIndex, VectorIndex};
use collab_gateway::storage::SledStore;
use collab_gateway::sync::protocol::PROTOCOL_VERSION;
use collab_gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_gateway=info,tower_http=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env().context("invalid configuration")?;

    info!("Initializing storage at: {}", config.storage.path);
    let store = Arc::new(SledStore::open(config.storage.clone()).context("failed to open storage")?);

    let search: Arc<dyn SearchIndex> = match &config.search {
        Some(search_config) => {
            let index = ElasticsearchIndex::new(search_config.clone());
            if let Err(e) = index.ensure_index().await {
                warn!("Search index {} not ready: {}", search_config.index, e);
            }
            Arc::new(index)
        }
        None => {
            warn!("ELASTICSEARCH_URL not set, full-text indexing disabled");
            Arc::new(DisabledSearchIndex)
        }
    };

    let vectors: Arc<dyn VectorIndex> = match &config.vector {
        Some(vector_config) => Arc::new(QdrantVectorIndex::new(vector_config.clone())),
        None => {
            warn!("QDRANT_URL or EMBEDDINGS_URL not set, vector indexing disabled");
            Arc::new(DisabledVectorIndex)
        }
    };

    let gateway = Gateway::new(&config, store, search, vectors);
    let background = gateway.sync.clone().start_background_tasks();
    let app = gateway.router();

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Collab gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   WebSocket: ws://{}/ws/:document_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Flush every dirty document before exiting
    gateway.sync.shutdown();
    background.wait().await;
    gateway.store.flush().context("failed to flush storage")?;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
