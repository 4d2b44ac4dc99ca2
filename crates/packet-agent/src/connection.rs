//! Connection manager
//!
//! Dials control, peer and target endpoints and keeps a registry of every
//! live connection. A [`Connection`] is owned by the worker that opened it;
//! the registry only holds shared counters and a cancellation token, so
//! other components see read-only [`ConnectionSnapshot`]s.

use crate::error::NetworkError;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Registry identifier of a live connection
pub type ConnectionId = u64;

/// What a connection is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Control,
    Peer,
    Target,
}

/// Where to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// host:port
    pub address: String,
    /// Wrap in TLS with this server name
    pub tls_server_name: Option<String>,
}

impl Endpoint {
    pub fn plain(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls_server_name: None,
        }
    }
}

impl From<&crate::config::ControlEndpoint> for Endpoint {
    fn from(endpoint: &crate::config::ControlEndpoint) -> Self {
        Self {
            address: endpoint.address.clone(),
            tls_server_name: endpoint
                .tls
                .then(|| endpoint.tls_server_name().to_string()),
        }
    }
}

/// Any duplex byte stream a connection can wrap
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Counters shared between a connection and its registry entry
#[derive(Debug)]
struct ConnectionStats {
    established_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Milliseconds after `established_at` when bytes last moved
    last_activity_ms: AtomicU64,
}

impl ConnectionStats {
    fn new() -> Self {
        Self {
            established_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.established_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last_activity(&self) -> Instant {
        self.established_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }
}

struct RegistryEntry {
    remote: String,
    kind: ConnectionKind,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
}

type Registry = Arc<RwLock<HashMap<ConnectionId, RegistryEntry>>>;

/// Read-only view of a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote: String,
    pub kind: ConnectionKind,
    pub established_at: Instant,
    /// Last time bytes moved in either direction
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// An owned, registered network connection
///
/// Dropping it (on any path, including task aborts) removes the registry
/// entry.
pub struct Connection {
    id: ConnectionId,
    kind: ConnectionKind,
    remote: String,
    stream: Box<dyn IoStream>,
    stats: Arc<ConnectionStats>,
    cancel: CancellationToken,
    registry: Registry,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Resolves once the manager closes this connection
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats.bytes_received.load(Ordering::Relaxed)
    }

    fn aborted() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by manager")
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);

        if removed.is_some() {
            tracing::debug!(
                connection_id = self.id,
                kind = ?self.kind,
                remote = %self.remote,
                duration_ms = self.stats.established_at.elapsed().as_millis() as u64,
                bytes_sent = self.bytes_sent(),
                bytes_received = self.bytes_received(),
                "Connection released"
            );
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(Self::aborted()));
        }

        let before = buf.filled().len();
        let poll = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                this.stats
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                this.stats.touch();
            }
        }
        poll
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(Self::aborted()));
        }

        let poll = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                this.stats.bytes_sent.fetch_add(*n as u64, Ordering::Relaxed);
                this.stats.touch();
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Dials endpoints and tracks live connections
#[derive(Clone)]
pub struct ConnectionManager {
    registry: Registry,
    next_id: Arc<AtomicU64>,
    connect_timeout: Duration,
    tls: TlsConnector,
}

impl ConnectionManager {
    pub fn new(connect_timeout: Duration, tls: TlsConnector) -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            connect_timeout,
            tls,
        }
    }

    /// Establish a connection; DNS, TCP and TLS together are bounded by the
    /// connect timeout
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        kind: ConnectionKind,
    ) -> Result<Connection, NetworkError> {
        let address = endpoint.address.clone();
        let deadline = tokio::time::Instant::now() + self.connect_timeout;

        tracing::debug!(remote = %address, kind = ?kind, "Connecting");

        let addrs: Vec<SocketAddr> =
            match tokio::time::timeout_at(deadline, tokio::net::lookup_host(address.as_str()))
                .await
            {
                Err(_) => return Err(NetworkError::Timeout(address.clone())),
                Ok(Err(e)) => {
                    return Err(NetworkError::DnsFailure {
                        endpoint: address.clone(),
                        reason: e.to_string(),
                    })
                }
                Ok(Ok(addrs)) => addrs.collect(),
            };

        if addrs.is_empty() {
            return Err(NetworkError::DnsFailure {
                endpoint: address,
                reason: "no addresses resolved".to_string(),
            });
        }

        let mut last_error = None;
        let mut tcp = None;
        for addr in addrs {
            match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    tcp = Some(stream);
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(remote = %address, addr = %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
                Err(_) => return Err(NetworkError::Timeout(address)),
            }
        }

        let tcp = match (tcp, last_error) {
            (Some(tcp), _) => tcp,
            (None, Some(e)) => return Err(classify_io_error(address, e)),
            (None, None) => return Err(NetworkError::Refused(address)),
        };
        let _ = tcp.set_nodelay(true);

        let stream: Box<dyn IoStream> = match &endpoint.tls_server_name {
            None => Box::new(tcp),
            Some(server_name) => {
                let name = rustls::pki_types::ServerName::try_from(server_name.clone()).map_err(
                    |e| NetworkError::TlsFailure {
                        endpoint: address.clone(),
                        reason: format!("invalid server name '{}': {}", server_name, e),
                    },
                )?;

                match tokio::time::timeout_at(deadline, self.tls.connect(name, tcp)).await {
                    Ok(Ok(tls)) => Box::new(tls),
                    Ok(Err(e)) => {
                        return Err(NetworkError::TlsFailure {
                            endpoint: address,
                            reason: e.to_string(),
                        })
                    }
                    Err(_) => return Err(NetworkError::Timeout(address)),
                }
            }
        };

        Ok(self.register(address, kind, stream))
    }

    /// Register an already established stream
    pub fn register(
        &self,
        remote: String,
        kind: ConnectionKind,
        stream: Box<dyn IoStream>,
    ) -> Connection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::new(ConnectionStats::new());
        let cancel = CancellationToken::new();

        let active = {
            let mut registry = self
                .registry
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry.insert(
                id,
                RegistryEntry {
                    remote: remote.clone(),
                    kind,
                    stats: stats.clone(),
                    cancel: cancel.clone(),
                },
            );
            registry.len()
        };

        tracing::debug!(
            connection_id = id,
            kind = ?kind,
            remote = %remote,
            active_connections = active,
            "Connection registered"
        );

        Connection {
            id,
            kind,
            remote,
            stream,
            stats,
            cancel,
            registry: self.registry.clone(),
        }
    }

    /// Close a connection; returns false if it was already gone
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let entry = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);

        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::debug!(connection_id = id, remote = %entry.remote, "Connection closed");
                true
            }
            None => false,
        }
    }

    /// Close every connection; returns how many were live
    pub fn force_close_all(&self) -> usize {
        let entries: Vec<(ConnectionId, RegistryEntry)> = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();

        for (_, entry) in &entries {
            entry.cancel.cancel();
        }

        if !entries.is_empty() {
            tracing::info!(closed_connections = entries.len(), "All connections closed");
        }
        entries.len()
    }

    pub fn count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn count_kind(&self, kind: ConnectionKind) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|entry| entry.kind == kind)
            .count()
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionSnapshot> {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .map(|entry| Self::snapshot_entry(id, entry))
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut list: Vec<ConnectionSnapshot> = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, entry)| Self::snapshot_entry(*id, entry))
            .collect();
        list.sort_by_key(|snapshot| snapshot.id);
        list
    }

    fn snapshot_entry(id: ConnectionId, entry: &RegistryEntry) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id,
            remote: entry.remote.clone(),
            kind: entry.kind,
            established_at: entry.stats.established_at,
            last_activity: entry.stats.last_activity(),
            bytes_sent: entry.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: entry.stats.bytes_received.load(Ordering::Relaxed),
        }
    }
}

fn classify_io_error(endpoint: String, error: io::Error) -> NetworkError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => NetworkError::Refused(endpoint),
        io::ErrorKind::TimedOut => NetworkError::Timeout(endpoint),
        _ => NetworkError::Io {
            endpoint,
            source: error,
        },
    }
}

/// Build the TLS connector used for `tls` endpoints
///
/// Trusts the webpki roots plus an optional PEM bundle.
pub fn build_tls_connector(extra_roots: Option<&Path>) -> Result<TlsConnector, String> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = extra_roots {
        let file = std::fs::File::open(path)
            .map_err(|e| format!("Failed to open root cert {}: {}", path.display(), e))?;
        let mut reader = io::BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| format!("Invalid root cert {}: {}", path.display(), e))?;
            roots
                .add(cert)
                .map_err(|e| format!("Invalid root cert {}: {}", path.display(), e))?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}
