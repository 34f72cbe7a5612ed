//! Start/stop/restart of the listener and its accept loop.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use serde::Serialize;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{watch, Notify},
    task::{JoinHandle, JoinSet},
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    server::{
        client::{BroadcastReport, ClientManager},
        handler,
        message::Frame,
        vault::SecretStore,
        ServerState,
    },
    utils::error::StreamError,
};

/// Socket type of every admitted client.
pub type ClientStream = TlsStream<TcpStream>;

/// Pause before accepting again after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What a call to [`StreamServer::start`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new listener is bound at this address.
    Started(SocketAddr),
    /// A healthy listener was already running; nothing changed.
    AlreadyRunning(SocketAddr),
    /// Another start is in progress; nothing changed.
    AlreadyStarting,
    /// `stop` was called while this start was binding; nothing is left running.
    Cancelled,
}

/// JSON summary served at `/status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerStatus {
    pub listening: bool,
    pub local_addr: Option<SocketAddr>,
    pub active_clients: usize,
    pub max_authenticated_clients: usize,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl RunningServer {
    fn is_healthy(&self) -> bool {
        !self.accept_task.is_finished()
    }

    /// Signals both loops and waits until they have exited. The listener is
    /// dropped by the accept loop on its way out.
    async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_task.await {
            error!("Accept loop ended abnormally: {}", e);
        }
        if let Err(e) = self.sweep_task.await {
            error!("Maintenance sweep ended abnormally: {}", e);
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    running: Option<RunningServer>,
    starting: bool,
    /// Set by `stop` while a start is in progress.
    stop_requested: bool,
}

/// Clears the start flags however `start` exits and wakes a waiting `stop`.
struct StartingFlag<'a>(&'a StreamServer);

impl Drop for StartingFlag<'_> {
    fn drop(&mut self) {
        {
            let mut lifecycle = lock(&self.0.lifecycle);
            lifecycle.starting = false;
            lifecycle.stop_requested = false;
        }
        self.0.start_finished.notify_waiters();
    }
}

fn lock(lifecycle: &Mutex<Lifecycle>) -> MutexGuard<'_, Lifecycle> {
    match lifecycle.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The streaming server: at most one listener and one accept loop at a time.
///
/// The client registry and rate-limit table live in the shared state and
/// survive restarts; `stop` closes every client.
pub struct StreamServer {
    state: Arc<ServerState<ClientStream>>,
    lifecycle: Mutex<Lifecycle>,
    start_finished: Notify,
    last_frame: Mutex<Option<Instant>>,
}

impl StreamServer {
    pub fn new(config: ServerConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            state: Arc::new(ServerState::new(config, secrets)),
            lifecycle: Mutex::new(Lifecycle::default()),
            start_finished: Notify::new(),
            last_frame: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<ServerState<ClientStream>> {
        &self.state
    }

    pub fn clients(&self) -> &ClientManager<ClientStream> {
        &self.state.clients
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Binds the listener and spawns the accept loop.
    ///
    /// Idempotent: returns early while another start is in progress or when a
    /// healthy listener exists. A dead listener is torn down completely (accept
    /// loop joined, clients closed, settle delay) before the port is bound again.
    ///
    /// # Errors
    /// Returns `StreamError::TlsError` when the key store cannot be used and
    /// `StreamError::ListenerError` when the port cannot be bound.
    pub async fn start(&self) -> Result<StartOutcome, StreamError> {
        let previous = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.starting {
                return Ok(StartOutcome::AlreadyStarting);
            }
            if let Some(running) = lifecycle.running.as_ref().filter(|r| r.is_healthy()) {
                return Ok(StartOutcome::AlreadyRunning(running.local_addr));
            }
            lifecycle.starting = true;
            lifecycle.stop_requested = false;
            lifecycle.running.take()
        };
        let _starting = StartingFlag(self);

        if let Some(previous) = previous {
            info!("Replacing listener on {}", previous.local_addr);
            previous.shutdown().await;
            self.state.clients.close_all().await;
            self.state.metrics.active_clients.set(0);
            tokio::time::sleep(self.state.config.settle_delay()).await;
        }

        let acceptor = self
            .state
            .config
            .create_tls_acceptor(self.state.secrets.as_ref())?;

        let bind_addr = self.state.config.bind_addr();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| StreamError::ListenerError(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StreamError::ListenerError(e.to_string()))?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.state.clone(),
            shutdown_rx.clone(),
        ));
        let sweep_task = tokio::spawn(maintenance_loop(self.state.clone(), shutdown_rx));

        let running = RunningServer {
            local_addr,
            shutdown,
            accept_task,
            sweep_task,
        };
        let cancelled = {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.stop_requested {
                Some(running)
            } else {
                lifecycle.running = Some(running);
                None
            }
        };
        if let Some(running) = cancelled {
            running.shutdown().await;
            self.state.clients.close_all().await;
            info!("Start on port {} cancelled by stop", local_addr.port());
            return Ok(StartOutcome::Cancelled);
        }
        info!("Server started on port {} (HTTPS)", local_addr.port());
        Ok(StartOutcome::Started(local_addr))
    }

    /// Closes the listener, joins the accept loop, closes every client and
    /// waits the settle delay. Does nothing when the server is not running.
    ///
    /// A start in progress is cancelled and waited for, so no listener is left
    /// bound once this returns.
    pub async fn stop(&self) {
        let running = loop {
            let start_finished = self.start_finished.notified();
            {
                let mut lifecycle = lock(&self.lifecycle);
                if !lifecycle.starting {
                    break lifecycle.running.take();
                }
                lifecycle.stop_requested = true;
            }
            start_finished.await;
        };
        let Some(running) = running else {
            return;
        };

        let local_addr = running.local_addr;
        running.shutdown().await;
        let closed = self.state.clients.close_all().await;
        self.state.metrics.active_clients.set(0);
        tokio::time::sleep(self.state.config.settle_delay()).await;
        info!("Server on {} stopped, {} client(s) closed", local_addr, closed);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.lifecycle)
            .running
            .as_ref()
            .map_or(false, RunningServer::is_healthy)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.lifecycle).running.as_ref().map(|r| r.local_addr)
    }

    /// Lets the frame producer skip encoding when nobody is watching.
    pub fn has_active_clients(&self) -> bool {
        self.state.clients.has_active_clients()
    }

    /// Hands `frame` to every admitted client and updates the metrics.
    ///
    /// Returns as soon as the writes are dispatched; their results reach the
    /// metrics on the next broadcast or maintenance tick.
    pub async fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let report = self.state.clients.broadcast(frame).await;
        record_write_outcomes(&self.state);
        report
    }

    /// Broadcasts `frame` unless nobody is connected or the previous frame
    /// went out less than the stream delay ago.
    pub async fn offer_frame(&self, frame: &Frame) -> Option<BroadcastReport> {
        if !self.has_active_clients() {
            return None;
        }
        {
            let mut last_frame = match self.last_frame.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            if let Some(last) = *last_frame {
                if now.saturating_duration_since(last) < self.state.config.stream_delay() {
                    return None;
                }
            }
            *last_frame = Some(now);
        }
        Some(self.broadcast(frame).await)
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            listening: self.is_running(),
            local_addr: self.local_addr(),
            active_clients: self.state.clients.len(),
            max_authenticated_clients: self.state.config.max_authenticated_clients,
        }
    }
}

/// Accepts connections until shutdown is signalled. Each connection gets its
/// own task so a slow TLS handshake never holds up the next accept.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState<ClientStream>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                info!("Server socket closed, stopping accept loop");
                break;
            }

            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    state.metrics.connections_accepted.inc();
                    connections.spawn(serve_connection(socket, addr, acceptor.clone(), state.clone()));
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    error!("Accept error: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(joined) = connections.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("A connection task panicked: {:?}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    connections.shutdown().await;
}

/// TLS handshake (bounded by the socket timeout) followed by the connection handler.
async fn serve_connection(
    socket: TcpStream,
    addr: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ServerState<ClientStream>>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
    }

    let tls_stream = match tokio::time::timeout(state.config.socket_timeout(), acceptor.accept(socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("TLS handshake failed for {}: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("TLS handshake timed out for {}", addr);
            return;
        }
    };

    match handler::handle_connection(tls_stream, addr, state).await {
        Ok(outcome) => debug!("Connection from {} finished: {:?}", addr, outcome),
        Err(e) => warn!("Error handling client connection from {}: {}", addr, e),
    }
}

/// Moves finished frame writes into the Prometheus counters.
fn record_write_outcomes(state: &ServerState<ClientStream>) {
    let outcomes = state.clients.take_write_outcomes();
    let metrics = &state.metrics;
    metrics.frames_sent.inc_by(outcomes.delivered);
    metrics.clients_evicted.inc_by(outcomes.evicted);
    metrics.active_clients.set(state.clients.len() as i64);
}

/// Periodically evicts clients past their maximum duration and forgets stale
/// rate-limit entries.
async fn maintenance_loop(state: Arc<ServerState<ClientStream>>, mut shutdown: watch::Receiver<bool>) {
    let policy = state.config.connection_policy();
    let mut ticker = tokio::time::interval(state.config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let expired = state.clients.evict_expired(&policy).await;
                let purged = state.rate_limiter.purge_expired();
                if expired > 0 || purged > 0 {
                    debug!("Maintenance: {} expired client(s), {} stale address(es)", expired, purged);
                }
                record_write_outcomes(&state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        tls::TlsError,
        vault::{MemorySecretStore, SecretKey},
    };

    fn server() -> StreamServer {
        let config = ServerConfig {
            port: 0,
            settle_delay_ms: 0,
            data_dir: std::env::temp_dir().join("mjpeg-rs-lifecycle-missing"),
            ..ServerConfig::default()
        };
        StreamServer::new(config, Arc::new(MemorySecretStore::with_credentials("viewer", "Secret123")))
    }

    #[tokio::test]
    async fn idle_server_reports_not_listening() {
        let server = server();
        let status = server.status();
        assert!(!status.listening);
        assert_eq!(status.local_addr, None);
        assert_eq!(status.active_clients, 0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["listening"], false);
        assert_eq!(json["max_authenticated_clients"], 10);

        // no clients, nothing to do
        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 1, 1);
        assert!(server.offer_frame(&frame).await.is_none());
        server.stop().await;
    }

    #[tokio::test]
    async fn start_without_passphrase_fails_closed() {
        let server = server();
        assert!(matches!(
            server.start().await,
            Err(StreamError::TlsError(TlsError::PassphraseNotConfigured))
        ));
        assert!(!server.is_running());

        // the starting flag is cleared after a failure
        assert!(matches!(
            server.start().await,
            Err(StreamError::TlsError(TlsError::PassphraseNotConfigured))
        ));
    }

    #[tokio::test]
    async fn stop_during_replacing_start_leaves_nothing_bound() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let pfx = p12::PFX::new(
            &cert.serialize_der().unwrap(),
            &cert.serialize_private_key_der(),
            None,
            "Key-Store-Pass1",
            "camera",
        )
        .unwrap();
        std::fs::write(dir.path().join("personal_certificate.p12"), pfx.to_der()).unwrap();

        let config = ServerConfig {
            port: 0,
            settle_delay_ms: 200,
            data_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let secrets = MemorySecretStore::with_credentials("viewer", "Secret123");
        secrets.set(SecretKey::CertificatePassword, "Key-Store-Pass1");
        let server = StreamServer::new(config, Arc::new(secrets));

        assert!(matches!(server.start().await.unwrap(), StartOutcome::Started(_)));

        // a dead accept loop makes the next start replace the listener
        if let Some(running) = lock(&server.lifecycle).running.as_ref() {
            running.accept_task.abort();
        }
        while server.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let (outcome, ()) = tokio::join!(server.start(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            server.stop().await;
        });
        assert_eq!(outcome.unwrap(), StartOutcome::Cancelled);
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
        assert!(!server.status().listening);

        // a later start is not affected by the cancelled one
        assert!(matches!(server.start().await.unwrap(), StartOutcome::Started(_)));
        server.stop().await;
    }
}
