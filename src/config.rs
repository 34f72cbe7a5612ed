use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use serde::{Deserialize, Serialize};
use config::Config;
use tokio_rustls::TlsAcceptor;
use crate::server::{
    client::ConnectionPolicy,
    middleware::validation::{validate_cert_path, validate_stream_delay},
    tls,
    vault::SecretStore,
};
use crate::utils::error::StreamError;

/// Configuration settings for the streaming server.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// The port on which the server will listen.
    pub port: u16,
    /// Ceiling for clients admitted without credentials.
    pub max_clients: usize,
    /// Ceiling for authenticated clients.
    pub max_authenticated_clients: usize,
    /// Read/write timeout applied to every socket operation.
    pub socket_timeout_secs: u64,
    /// Minimum spacing between broadcast frames.
    pub stream_delay_ms: u64,
    /// Custom PKCS#12 key store. Falls back to `<data_dir>/personal_certificate.p12`.
    pub cert_path: Option<PathBuf>,
    /// Directory holding the app-private key store.
    pub data_dir: PathBuf,
    /// Pause after closing the listener so the OS releases the port.
    pub settle_delay_ms: u64,
    /// Maximum lifetime of an unauthenticated connection.
    pub max_connection_secs: u64,
    /// Maximum lifetime of an authenticated connection.
    pub max_authenticated_connection_secs: u64,
    /// Interval of the expiry and rate-limit maintenance sweep.
    pub sweep_interval_secs: u64,
    /// Port for the Prometheus/status endpoint, disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4444,
            max_clients: 3,
            max_authenticated_clients: 10,
            socket_timeout_secs: 60,
            stream_delay_ms: 33,
            cert_path: None,
            data_dir: PathBuf::from("."),
            settle_delay_ms: 500,
            max_connection_secs: 30 * 60,
            max_authenticated_connection_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `MJPEG_`; anything unset
    /// keeps its default.
    ///
    /// # Errors
    /// Returns a `StreamError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, StreamError> {
        let defaults = Config::try_from(&Self::default())
            .map_err(|e| StreamError::ConfigurationError(e.to_string()))?;
        Config::builder()
            .add_source(defaults)
            .add_source(config::Environment::with_prefix("MJPEG").try_parsing(true))
            .build()
            .map_err(|e| StreamError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| StreamError::ConfigurationError(e.to_string()))
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `StreamError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.max_authenticated_clients == 0 {
            return Err(StreamError::ConfigurationError(
                "max_authenticated_clients must be greater than 0".into()
            ));
        }

        if self.max_authenticated_clients > 10_000 || self.max_clients > 10_000 {
            return Err(StreamError::ConfigurationError(
                "client ceilings cannot exceed 10,000".into()
            ));
        }

        if self.socket_timeout_secs == 0 {
            return Err(StreamError::ConfigurationError(
                "socket_timeout_secs must be greater than 0".into()
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(StreamError::ConfigurationError(
                "sweep_interval_secs must be greater than 0".into()
            ));
        }

        if !validate_stream_delay(self.stream_delay_ms) {
            return Err(StreamError::ConfigurationError(format!(
                "stream_delay_ms out of range: {}",
                self.stream_delay_ms
            )));
        }

        if let Some(path) = &self.cert_path {
            validate_cert_path(path).map_err(StreamError::ConfigurationError)?;
        }

        Ok(())
    }

    /// Address the listener binds: all interfaces on the configured port.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Registry ceiling for a client with the given authentication status.
    pub fn client_ceiling(&self, authenticated: bool) -> usize {
        if authenticated {
            self.max_authenticated_clients
        } else {
            self.max_clients
        }
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn stream_delay(&self) -> Duration {
        Duration::from_millis(self.stream_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn connection_policy(&self) -> ConnectionPolicy {
        ConnectionPolicy {
            max_duration: Duration::from_secs(self.max_connection_secs),
            max_authenticated_duration: Duration::from_secs(self.max_authenticated_connection_secs),
        }
    }

    /// Creates the TLS acceptor from the configured (or app-private) key store.
    ///
    /// # Errors
    /// Returns a `StreamError::TlsError` naming the missing or wrong piece of key material.
    pub fn create_tls_acceptor(&self, secrets: &dyn SecretStore) -> Result<TlsAcceptor, StreamError> {
        Ok(tls::provision(self.cert_path.as_deref(), &self.data_dir, secrets)?)
    }
}
