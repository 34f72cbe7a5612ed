// src/server/mod.rs
pub mod client;
pub mod handler;
pub mod health;
pub mod lifecycle;
pub mod message;
pub mod middleware;
pub mod tls;
pub mod vault;

// Re-export public components
pub use client::{BroadcastReport, Client, ClientManager, ConnectionPolicy, WriteOutcomes};
pub use handler::handle_connection;
pub use health::HealthMetrics;
pub use lifecycle::{StartOutcome, StreamServer};
pub use message::{Frame, Response};
pub use middleware::{Credentials, FailureRateLimiter, RateLimitPolicy};
pub use vault::{EnvSecretStore, MemorySecretStore, SecretKey, SecretStore};

// Import internal dependencies
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use crate::config::ServerConfig;

/// State shared by the accept loop, every connection task and the broadcaster.
pub struct ServerState<S> {
    pub config: Arc<ServerConfig>,
    pub clients: ClientManager<S>,
    pub rate_limiter: FailureRateLimiter,
    pub metrics: HealthMetrics,
    pub secrets: Arc<dyn SecretStore>,
}

impl<S> Clone for ServerState<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            clients: self.clients.clone(),
            rate_limiter: self.rate_limiter.clone(),
            metrics: self.metrics.clone(),
            secrets: self.secrets.clone(),
        }
    }
}

impl<S> ServerState<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(config: ServerConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            config: Arc::new(config),
            clients: ClientManager::new(),
            rate_limiter: FailureRateLimiter::new(RateLimitPolicy::default()),
            metrics: HealthMetrics::new(),
            secrets,
        }
    }
}
