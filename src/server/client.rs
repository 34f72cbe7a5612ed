use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use uuid::Uuid;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{Mutex as TokioMutex, Notify};
use tracing::{debug, info, instrument, warn};

use crate::server::message::Frame;

/// How long an admitted connection may stay open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Limit for connections admitted without credentials.
    pub max_duration: Duration,
    /// Limit for authenticated connections.
    pub max_authenticated_duration: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(30 * 60),
            max_authenticated_duration: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ConnectionPolicy {
    pub fn max_duration_for(&self, authenticated: bool) -> Duration {
        if authenticated {
            self.max_authenticated_duration
        } else {
            self.max_duration
        }
    }
}

/// An admitted viewer and the write half of its socket.
///
/// Header lines and JPEG bytes share one writer so a frame is always written
/// as a unit.
pub struct Client<S> {
    /// Unique identifier for the client.
    pub id: Uuid,
    /// Socket address of the client.
    pub addr: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Whether the client presented valid credentials.
    pub authenticated: bool,
    writer: TokioMutex<WriteHalf<S>>,
    write_timeout: Duration,
    streaming: AtomicBool,
    writing: AtomicBool,
    closed: AtomicBool,
    shutdown: Notify,
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("authenticated", &self.authenticated)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a new `Client` around the write half of an accepted socket.
    ///
    /// Every write is bounded by `write_timeout`.
    pub fn new(
        addr: SocketAddr,
        writer: WriteHalf<S>,
        authenticated: bool,
        write_timeout: Duration,
    ) -> Self {
        Client {
            id: Uuid::new_v4(),
            addr,
            connected_at: Instant::now(),
            authenticated,
            writer: TokioMutex::new(writer),
            write_timeout,
            streaming: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Writes raw bytes and flushes.
    pub async fn write_bytes(&self, bytes: &[u8]) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(self.write_timeout, async {
            writer.write_all(bytes).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ClientError::Timeout)?
        .map_err(|e| ClientError::SendFailed(e.to_string()))
    }

    /// Writes the streaming response head and marks the client ready for frames.
    pub async fn start_stream(&self, head: &[u8]) -> Result<(), ClientError> {
        self.write_bytes(head).await?;
        self.streaming.store(true, Ordering::Release);
        Ok(())
    }

    /// Writes one multipart part: boundary and headers, flush, JPEG bytes, flush.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let header = frame.part_header();
        let write = async {
            let mut writer = self.writer.lock().await;
            tokio::time::timeout(self.write_timeout, async {
                writer.write_all(header.as_bytes()).await?;
                writer.flush().await?;
                writer.write_all(&frame.data).await?;
                writer.flush().await
            })
            .await
        };

        // A close abandons the write and releases the writer for shutdown.
        tokio::select! {
            written = write => written
                .map_err(|_| ClientError::Timeout)?
                .map_err(|e| ClientError::SendFailed(e.to_string())),
            _ = self.closed() => Err(ClientError::Closed),
        }
    }

    /// Claims the client for one frame write. Fails while the previous frame
    /// is still being written.
    fn try_begin_write(&self) -> bool {
        !self.writing.swap(true, Ordering::AcqRel)
    }

    fn end_write(&self) {
        self.writing.store(false, Ordering::Release);
    }

    /// Whether the streaming response head has been written.
    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire) && !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection. Only the first call does anything; returns
    /// whether this call performed the close.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.notify_waiters();
        if let Ok(mut writer) = tokio::time::timeout(self.write_timeout, self.writer.lock()).await {
            let _ = tokio::time::timeout(self.write_timeout, writer.shutdown()).await;
        }
        debug!("Closed client {} ({})", self.id, self.addr);
        true
    }

    /// Resolves once [`Client::close`] has been called.
    pub async fn closed(&self) {
        let notified = self.shutdown.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub fn is_expired(&self, now: Instant, policy: &ConnectionPolicy) -> bool {
        now.saturating_duration_since(self.connected_at)
            > policy.max_duration_for(self.authenticated)
    }
}

/// Outcome of one frame fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients a write of this frame was started for.
    pub queued: usize,
    /// Clients still busy with an earlier frame; they miss this one.
    pub skipped: usize,
}

/// Frame writes that finished since the outcomes were last taken.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcomes {
    /// Frames fully written to a client.
    pub delivered: u64,
    /// Clients closed and removed after a failed or timed-out write.
    pub evicted: u64,
}

/// The registry of admitted clients.
pub struct ClientManager<S> {
    /// A concurrent map storing active clients.
    clients: Arc<DashMap<Uuid, Arc<Client<S>>>>,
    /// Serializes the capacity check with the insert.
    admission: Arc<Mutex<()>>,
    /// Frame writes currently running.
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    delivered: Arc<AtomicU64>,
    evicted: Arc<AtomicU64>,
}

// Manual Clone implementation
impl<S> Clone for ClientManager<S> {
    fn clone(&self) -> Self {
        ClientManager {
            clients: Arc::clone(&self.clients),
            admission: Arc::clone(&self.admission),
            in_flight: Arc::clone(&self.in_flight),
            idle: Arc::clone(&self.idle),
            delivered: Arc::clone(&self.delivered),
            evicted: Arc::clone(&self.evicted),
        }
    }
}

impl<S> Default for ClientManager<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ClientManager<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Creates a new `ClientManager` instance.
    pub fn new() -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            admission: Arc::new(Mutex::new(())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            delivered: Arc::new(AtomicU64::new(0)),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Lets the frame producer skip encoding when nobody is watching.
    pub fn has_active_clients(&self) -> bool {
        !self.clients.is_empty()
    }

    /// Registers `client` unless the registry already holds `ceiling` clients.
    ///
    /// On refusal the client is handed back so the caller can answer on its socket.
    pub fn try_admit(&self, client: Arc<Client<S>>, ceiling: usize) -> Result<(), Arc<Client<S>>> {
        let _guard = match self.admission.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.clients.len() >= ceiling {
            return Err(client);
        }
        self.clients.insert(client.id, client);
        Ok(())
    }

    /// Removes a client by ID without closing it.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Client<S>>> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    /// Removes a client by ID and closes its connection.
    pub async fn evict(&self, id: &Uuid) -> bool {
        match self.remove(id) {
            Some(client) => {
                client.close().await;
                true
            }
            None => false,
        }
    }

    /// Clones the current client list so I/O happens without holding map locks.
    pub fn snapshot(&self) -> Vec<Arc<Client<S>>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Hands `frame` to every streaming client without waiting for any of them.
    ///
    /// Each write runs in its own task, bounded by the client's write timeout.
    /// A client still writing an earlier frame is skipped, so a stalled viewer
    /// only ever holds one frame and never delays the others or the caller. A
    /// failed write closes the client and removes it from the registry.
    #[instrument(skip(self, frame), fields(bytes = frame.data.len()))]
    pub async fn broadcast(&self, frame: &Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut shared = None;

        for client in self.snapshot() {
            if !client.is_streaming() {
                continue;
            }
            if !client.try_begin_write() {
                debug!("Client {} still writing, skipping frame", client.addr);
                report.skipped += 1;
                continue;
            }
            let frame = Arc::clone(shared.get_or_insert_with(|| Arc::new(frame.clone())));
            let manager = self.clone();
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            report.queued += 1;

            tokio::spawn(async move {
                let result = client.write_frame(&frame).await;
                client.end_write();
                match result {
                    Ok(()) => {
                        manager.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("Error sending frame to {}: {}", client.addr, e);
                        if manager.remove(&client.id).is_some() {
                            manager.evicted.fetch_add(1, Ordering::Relaxed);
                        }
                        client.close().await;
                    }
                }
                if manager.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    manager.idle.notify_waiters();
                }
            });
        }
        report
    }

    /// Resolves once no frame write is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Returns and resets the counts of finished frame writes.
    pub fn take_write_outcomes(&self) -> WriteOutcomes {
        WriteOutcomes {
            delivered: self.delivered.swap(0, Ordering::Relaxed),
            evicted: self.evicted.swap(0, Ordering::Relaxed),
        }
    }

    /// Closes and removes clients that outlived their connection policy.
    pub async fn evict_expired(&self, policy: &ConnectionPolicy) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|client| client.is_expired(now, policy))
            .collect();

        for client in &expired {
            info!(
                "Removing expired {} connection from {}",
                if client.authenticated { "authenticated" } else { "unauthenticated" },
                client.addr
            );
            self.remove(&client.id);
            client.close().await;
        }
        expired.len()
    }

    /// Closes every client and empties the registry.
    pub async fn close_all(&self) -> usize {
        let clients = self.snapshot();
        for client in &clients {
            self.remove(&client.id);
            client.close().await;
        }
        clients.len()
    }
}

/// Represents errors that may occur in client operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send data: {0}")]
    SendFailed(String),
    #[error("Write timed out")]
    Timeout,
    #[error("Client connection already closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Returns a streaming client plus the viewer's end of its socket.
    async fn streaming_client(port: u16) -> (Arc<Client<DuplexStream>>, DuplexStream) {
        let (server, viewer) = tokio::io::duplex(64 * 1024);
        let (_read, write) = tokio::io::split(server);
        let client = Arc::new(Client::new(addr(port), write, true, TIMEOUT));
        client.start_stream(b"HEAD\r\n\r\n").await.unwrap();
        (client, viewer)
    }

    async fn read_exact_string(viewer: &mut DuplexStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        viewer.read_exact(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn admission_respects_ceiling() {
        let manager = ClientManager::new();
        let mut viewers = Vec::new();
        for port in 0..3 {
            let (client, viewer) = streaming_client(port).await;
            viewers.push(viewer);
            let result = manager.try_admit(client, 2);
            assert_eq!(result.is_ok(), port < 2);
        }
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn broadcast_writes_multipart_part() {
        let manager = ClientManager::new();
        let (client, mut viewer) = streaming_client(1).await;
        manager.try_admit(client, 10).unwrap();

        let frame = Frame::new(b"JPEGDATA".to_vec(), 4, 2);
        let report = manager.broadcast(&frame).await;
        assert_eq!(report, BroadcastReport { queued: 1, skipped: 0 });

        let expected = format!("HEAD\r\n\r\n{}JPEGDATA", frame.part_header());
        assert_eq!(read_exact_string(&mut viewer, expected.len()).await, expected);
        manager.wait_idle().await;
        assert_eq!(
            manager.take_write_outcomes(),
            WriteOutcomes { delivered: 1, evicted: 0 }
        );
        assert_eq!(manager.take_write_outcomes(), WriteOutcomes::default());
    }

    #[tokio::test]
    async fn failing_client_is_evicted_and_others_still_served() {
        let manager = ClientManager::new();
        let mut viewers = Vec::new();
        let mut broken_id = None;
        for port in 0..4 {
            let (client, viewer) = streaming_client(port).await;
            if port == 2 {
                broken_id = Some(client.id);
                drop(viewer);
            } else {
                viewers.push(viewer);
            }
            manager.try_admit(client, 10).unwrap();
        }
        let broken = manager
            .snapshot()
            .into_iter()
            .find(|client| Some(client.id) == broken_id)
            .unwrap();

        let frame = Frame::new(vec![7u8; 32], 1, 1);
        let report = manager.broadcast(&frame).await;
        assert_eq!(report.queued, 4);
        manager.wait_idle().await;

        assert_eq!(
            manager.take_write_outcomes(),
            WriteOutcomes { delivered: 3, evicted: 1 }
        );
        assert_eq!(manager.len(), 3);
        assert!(broken.is_closed());
        assert!(manager.snapshot().iter().all(|client| client.id != broken.id));
    }

    #[tokio::test]
    async fn stalled_client_never_holds_up_the_others() {
        let manager = ClientManager::new();
        let (fast, mut fast_viewer) = streaming_client(1).await;
        manager.try_admit(fast, 10).unwrap();

        // A pipe nobody reads fills after 16 bytes.
        let (server, _stalled_viewer) = tokio::io::duplex(16);
        let (_read, write) = tokio::io::split(server);
        let stalled = Arc::new(Client::new(addr(2), write, true, Duration::from_secs(30)));
        stalled.start_stream(b"HEAD").await.unwrap();
        manager.try_admit(stalled.clone(), 10).unwrap();

        let frame = Frame::new(vec![0xAB; 4096], 64, 64);
        let expected_len = "HEAD\r\n\r\n".len() + frame.part_header().len() + frame.data.len();
        let started = Instant::now();

        let first = manager.broadcast(&frame).await;
        assert_eq!(first, BroadcastReport { queued: 2, skipped: 0 });
        read_exact_string(&mut fast_viewer, expected_len).await;

        let second = manager.broadcast(&frame).await;
        assert_eq!(second, BroadcastReport { queued: 1, skipped: 1 });
        let part_len = frame.part_header().len() + frame.data.len();
        read_exact_string(&mut fast_viewer, part_len).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(manager.len(), 2);
        assert!(!stalled.is_closed());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn clients_without_stream_head_are_skipped() {
        let manager = ClientManager::new();
        let (server, _viewer) = tokio::io::duplex(1024);
        let (_read, write) = tokio::io::split(server);
        let pending = Arc::new(Client::new(addr(9), write, true, TIMEOUT));
        manager.try_admit(pending, 10).unwrap();

        let report = manager.broadcast(&Frame::new(vec![1], 1, 1)).await;
        assert_eq!(report, BroadcastReport::default());
        manager.wait_idle().await;
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn close_happens_once() {
        let (client, _viewer) = streaming_client(5).await;
        assert!(client.close().await);
        assert!(!client.close().await);
        assert!(client.is_closed());
        assert!(matches!(
            client.write_frame(&Frame::new(vec![1], 1, 1)).await,
            Err(ClientError::Closed)
        ));
        tokio::time::timeout(TIMEOUT, client.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn expired_clients_are_removed() {
        let manager = ClientManager::new();
        let (client, _viewer) = streaming_client(6).await;
        manager.try_admit(client.clone(), 10).unwrap();

        let policy = ConnectionPolicy {
            max_duration: Duration::ZERO,
            max_authenticated_duration: Duration::ZERO,
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.evict_expired(&policy).await, 1);
        assert!(manager.is_empty());
        assert!(client.is_closed());

        assert_eq!(
            ConnectionPolicy::default().max_duration_for(true),
            Duration::from_secs(86_400)
        );
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let manager = ClientManager::new();
        let (a, _va) = streaming_client(7).await;
        let (b, _vb) = streaming_client(8).await;
        manager.try_admit(a.clone(), 10).unwrap();
        manager.try_admit(b.clone(), 10).unwrap();

        assert!(manager.has_active_clients());
        assert_eq!(manager.close_all().await, 2);
        assert!(!manager.has_active_clients());
        assert!(a.is_closed() && b.is_closed());
    }
}
