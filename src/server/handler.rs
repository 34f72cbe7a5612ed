use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, instrument, warn};

use crate::{
    server::{
        message::{decode_basic, read_request_head, RequestHead, Response},
        middleware::Credentials,
        Client, ServerState,
    },
    utils::error::StreamError,
};

/// Pause after a 429 or 503 so a misbehaving client cannot reconnect in a tight loop.
pub const ANTI_HAMMER_DELAY: Duration = Duration::from_millis(100);

/// Longest wait for a request head when the answer is `403` regardless.
pub const UNCONFIGURED_DRAIN: Duration = Duration::from_secs(2);

/// Result of checking the `Authorization` header against the configured credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    /// No usable `Authorization: Basic` header, or the head itself was malformed.
    Missing,
    /// The token was not valid Base64 / UTF-8.
    Malformed,
    /// Decoded fine but did not match.
    Mismatch,
    Valid,
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Answered with an error status and closed.
    Rejected(Response),
    /// Streamed until the peer went away.
    Disconnected,
    /// Streamed until the server closed it (failed write, expiry or shutdown).
    Evicted,
}

/// Compares the request's Basic token with `credentials` by exact match.
pub fn check_authorization(head: Option<&RequestHead>, credentials: &Credentials) -> AuthCheck {
    let Some(token) = head.and_then(RequestHead::basic_token) else {
        return AuthCheck::Missing;
    };
    match decode_basic(token) {
        None => AuthCheck::Malformed,
        Some(decoded) if credentials.matches(&decoded) => AuthCheck::Valid,
        Some(_) => AuthCheck::Mismatch,
    }
}

/// Writes `response`, flushes and shuts the socket down, all within `timeout`.
async fn respond_and_close<W>(
    writer: &mut W,
    response: Response,
    timeout: Duration,
) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, async {
        writer.write_all(&response.to_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await
    })
    .await
    .map_err(|_| StreamError::Timeout)?
    .map_err(StreamError::from)
}

/// Answers a failed attempt: `429` if the address is already blocked,
/// otherwise records the failure and answers `401`.
async fn reject_failed_attempt<S, W>(
    writer: &mut W,
    addr: SocketAddr,
    check: AuthCheck,
    state: &ServerState<S>,
) -> Result<ConnectionOutcome, StreamError>
where
    W: AsyncWrite + Unpin,
{
    let timeout = state.config.socket_timeout();
    let ip = addr.ip();

    if state.rate_limiter.is_blocked(ip) {
        warn!("SECURITY: Rate limited request from {} ({:?})", ip, check);
        state.metrics.record_rejection(Response::TooManyRequests.status());
        let written = respond_and_close(writer, Response::TooManyRequests, timeout).await;
        tokio::time::sleep(ANTI_HAMMER_DELAY).await;
        written?;
        return Ok(ConnectionOutcome::Rejected(Response::TooManyRequests));
    }

    state.rate_limiter.record_failure(ip);
    state.metrics.auth_failures.inc();
    state.metrics.record_rejection(Response::Unauthorized.status());
    warn!("SECURITY: Failed authentication attempt from {} ({:?})", ip, check);
    respond_and_close(writer, Response::Unauthorized, timeout).await?;
    Ok(ConnectionOutcome::Rejected(Response::Unauthorized))
}

/// Answers `403` when no valid credentials are configured.
///
/// The failure is recorded before anything is read, so a silent or stalled
/// peer still counts. Whatever the peer sent is drained for at most
/// [`UNCONFIGURED_DRAIN`] before the response goes out.
async fn reject_unconfigured<R, W, S>(
    reader: &mut R,
    writer: &mut W,
    addr: SocketAddr,
    state: &ServerState<S>,
) -> Result<ConnectionOutcome, StreamError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    state.rate_limiter.record_failure(addr.ip());
    state.metrics.auth_failures.inc();
    state.metrics.record_rejection(Response::Forbidden.status());
    warn!("SECURITY: Connection from {} rejected - authentication credentials not configured", addr);

    let drain = UNCONFIGURED_DRAIN.min(state.config.socket_timeout());
    if let Err(e) = read_request_head(reader, drain).await {
        debug!("No complete request head from {} before 403: {}", addr, e);
    }
    respond_and_close(writer, Response::Forbidden, state.config.socket_timeout()).await?;
    Ok(ConnectionOutcome::Rejected(Response::Forbidden))
}

/// Handles one accepted connection from request head to disconnect.
///
/// Stages: the request head is read, credentials are checked, and the client
/// is either rejected with an error status or admitted into the registry. An
/// admitted connection is then passive: frames are written by the broadcaster
/// and this task only waits for the peer to go away or for the client to be
/// closed from elsewhere.
///
/// # Errors
/// Returns `StreamError` for socket failures and timeouts; these only ever end
/// this connection.
#[instrument(skip(stream, state))]
pub async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ServerState<S>>,
) -> Result<ConnectionOutcome, StreamError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let timeout = state.config.socket_timeout();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    // Credentials are re-read on every connection so live changes apply.
    let Some(credentials) = Credentials::load(state.secrets.as_ref()) else {
        return reject_unconfigured(&mut reader, &mut write_half, addr, &state).await;
    };

    let head = match read_request_head(&mut reader, timeout).await {
        Ok(head) => Some(head),
        Err(StreamError::RequestError(e)) => {
            debug!("Malformed request head from {}: {}", addr, e);
            None
        }
        Err(e) => return Err(e),
    };

    let check = check_authorization(head.as_ref(), &credentials);
    if check != AuthCheck::Valid {
        return reject_failed_attempt(&mut write_half, addr, check, &state).await;
    }

    let client = Arc::new(Client::new(addr, write_half, true, timeout));
    let ceiling = state.config.client_ceiling(client.authenticated);
    if let Err(client) = state.clients.try_admit(Arc::clone(&client), ceiling) {
        warn!("Client ceiling of {} reached, refusing {}", ceiling, addr);
        state.metrics.record_rejection(Response::ServiceUnavailable.status());
        let written = client.write_bytes(&Response::ServiceUnavailable.to_bytes()).await;
        client.close().await;
        tokio::time::sleep(ANTI_HAMMER_DELAY).await;
        written?;
        return Ok(ConnectionOutcome::Rejected(Response::ServiceUnavailable));
    }

    if let Err(e) = client.start_stream(&Response::Stream.to_bytes()).await {
        state.clients.remove(&client.id);
        client.close().await;
        return Err(e.into());
    }
    state.metrics.active_clients.set(state.clients.len() as i64);
    info!("Client {} admitted from {}", client.id, addr);

    let peer_closed = wait_for_disconnect(&mut reader, &client).await;

    state.clients.remove(&client.id);
    let closed_here = client.close().await;
    state.metrics.active_clients.set(state.clients.len() as i64);
    info!("Client {} from {} disconnected", client.id, addr);

    Ok(if peer_closed && closed_here {
        ConnectionOutcome::Disconnected
    } else {
        ConnectionOutcome::Evicted
    })
}

/// Waits until the peer closes its side or the client is closed by the server.
///
/// Anything the peer sends after the request head is discarded. Returns `true`
/// when the peer went away first.
async fn wait_for_disconnect<R, S>(reader: &mut R, client: &Client<S>) -> bool
where
    R: AsyncRead + Unpin,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = client.closed() => return false,
            read = reader.read(&mut buf) => match read {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Read error from {}: {}", client.addr, e);
                    return true;
                }
            },
        }
    }
}
