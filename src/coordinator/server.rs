//! Gateway server

use std::sync::Arc;

use crate::common::auth::{CredentialVerifier, TokenTableVerifier};
use crate::common::{GatewayConfig, Result};
use crate::coordinator::http::{create_router, GatewayState};
use crate::coordinator::registry::Coordinator;
use crate::store::{RedisStore, SharedStore};

pub struct Gateway {
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Connect to the shared store (if configured) and build the coordinator
    pub async fn build_coordinator(&self) -> Result<Coordinator> {
        let store: Option<Arc<dyn SharedStore>> = match &self.config.redis_url {
            Some(url) => {
                let store: Arc<dyn SharedStore> = Arc::new(RedisStore::connect(url).await?);
                Some(store)
            }
            None => {
                tracing::warn!("No redis_url configured, running in single-instance mode");
                None
            }
        };

        let verifier = TokenTableVerifier::new(self.config.tokens.clone());
        if verifier.is_empty() {
            tracing::warn!("Token table is empty, every connector will be rejected");
        }
        let verifier: Arc<dyn CredentialVerifier> = Arc::new(verifier);

        Ok(Coordinator::new(&self.config, store, verifier))
    }

    pub async fn serve(self) -> Result<()> {
        tracing::info!("Starting gateway: {}", self.config.instance_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!(
            "  Shared store: {}",
            self.config.redis_url.as_deref().unwrap_or("none")
        );

        let coordinator = self.build_coordinator().await?;
        coordinator.start();

        let router = create_router(GatewayState {
            coordinator: coordinator.clone(),
        });
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Gateway ready");

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        coordinator.shutdown().await;
        if let Err(e) = served {
            tracing::error!("HTTP server error: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}
