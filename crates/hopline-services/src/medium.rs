//! Medium factory. Opens and recreates the endpoints a relay pumps between.
//!
//! Two medium kinds, each with a role per direction:
//!
//!   pipe,   send   FIFO opened write-only. Waits until a reader attaches,
//!                  which paces the relay against its consumer.
//!   pipe,   recv   FIFO opened non-blocking for reading.
//!   socket, server bind the data port, accept one connection, close the port.
//!   socket, client resolve a node name, dial with a bounded timeout, retry
//!                  while the peer is not ready (refused, timed out, no DNS).
//!
//! A failed medium is never repaired in place. The relay drops it and asks
//! the factory for a new one built from the same `MediumSpec`.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::net::{TcpListener, TcpStream};

use hopline_core::config::{ClusterConfig, PortsConfig, RelaySettings};
use hopline_core::fault::{classify, Fault};

use crate::retry::RetryPolicy;

/// Readable end of a medium.
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// Writable end of a medium.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything needed to (re)create one end of a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediumSpec {
    /// Named pipe at a filesystem path. Role follows from the direction.
    Pipe(PathBuf),
    /// Socket accepted on this node's data port (server role).
    Inbound,
    /// Socket dialed to a node's data port (client role).
    Outbound(String),
}

impl MediumSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            MediumSpec::Pipe(_) => "pipe",
            MediumSpec::Inbound | MediumSpec::Outbound(_) => "socket",
        }
    }
}

/// Immutable description of one relay: where frames come from and go to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub from: MediumSpec,
    pub to: MediumSpec,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum MediumError {
    #[error("failed to create fifo {0}: {1}")]
    Mkfifo(PathBuf, Errno),

    #[error("failed to open pipe {0}: {1}")]
    Pipe(PathBuf, io::Error),

    #[error("invalid listen address {0}")]
    BadAddress(String),

    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, io::Error),

    #[error("accept failed: {0}")]
    Accept(io::Error),

    #[error("dial {0} failed: {1}")]
    Dial(String, io::Error),

    #[error("{0} cannot be opened as a {1}")]
    WrongDirection(&'static str, &'static str),
}

// ── Factory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MediumFactory {
    cluster: ClusterConfig,
    bind_host: String,
    data_port: u16,
    dial_timeout: Duration,
    pipe_poll: Duration,
    retry: RetryPolicy,
}

impl MediumFactory {
    pub fn new(
        cluster: ClusterConfig,
        ports: &PortsConfig,
        relay: &RelaySettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cluster,
            bind_host: ports.bind_host.clone(),
            data_port: ports.data,
            dial_timeout: relay.dial_timeout(),
            pipe_poll: relay.pipe_poll(),
            retry,
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Open the readable end described by `spec`.
    pub async fn open_source(&self, spec: &MediumSpec) -> Result<Source, MediumError> {
        match spec {
            MediumSpec::Pipe(path) => Ok(Box::new(self.open_pipe_receiver(path)?)),
            MediumSpec::Inbound => Ok(Box::new(self.accept_one().await?)),
            MediumSpec::Outbound(_) => Err(MediumError::WrongDirection("outbound socket", "source")),
        }
    }

    /// Open the writable end described by `spec`.
    pub async fn open_sink(&self, spec: &MediumSpec) -> Result<Sink, MediumError> {
        match spec {
            MediumSpec::Pipe(path) => Ok(Box::new(self.open_pipe_sender(path).await?)),
            MediumSpec::Outbound(node) => Ok(Box::new(self.dial(node).await?)),
            MediumSpec::Inbound => Err(MediumError::WrongDirection("inbound socket", "sink")),
        }
    }

    // ── Pipes ────────────────────────────────────────────────────────────────

    /// Open a FIFO for writing, creating it if absent. Returns once a reader
    /// has the other end open.
    pub async fn open_pipe_sender(&self, path: &Path) -> Result<pipe::Sender, MediumError> {
        ensure_fifo(path)?;
        let mut waited = false;
        loop {
            match pipe::OpenOptions::new().open_sender(path) {
                Ok(sender) => {
                    tracing::info!(path = %path.display(), "send pipe opened");
                    return Ok(sender);
                }
                // ENXIO: no reader yet.
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if !waited {
                        tracing::info!(path = %path.display(), "waiting for pipe reader");
                        waited = true;
                    }
                    tokio::time::sleep(self.pipe_poll).await;
                }
                Err(e) => return Err(MediumError::Pipe(path.to_path_buf(), e)),
            }
        }
    }

    /// Open a FIFO for non-blocking reads, creating it if absent.
    pub fn open_pipe_receiver(&self, path: &Path) -> Result<pipe::Receiver, MediumError> {
        ensure_fifo(path)?;
        let mut opts = pipe::OpenOptions::new();
        // Holding a write handle too keeps the read side from seeing EOF
        // every time the producer closes and reopens.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        opts.read_write(true);
        let receiver = opts
            .open_receiver(path)
            .map_err(|e| MediumError::Pipe(path.to_path_buf(), e))?;
        tracing::info!(path = %path.display(), "recv pipe opened");
        Ok(receiver)
    }

    // ── Sockets ──────────────────────────────────────────────────────────────

    /// Server role: accept exactly one connection on the data port, then
    /// close the listener.
    pub async fn accept_one(&self) -> Result<TcpStream, MediumError> {
        let listener = bind_with_retry(&self.bind_host, self.data_port, &self.retry).await?;
        tracing::info!(port = self.data_port, "waiting for inbound connection");
        let (stream, peer) = listener.accept().await.map_err(MediumError::Accept)?;
        drop(listener);
        let _ = stream.set_nodelay(true);
        tracing::info!(%peer, "inbound connection accepted");
        Ok(stream)
    }

    /// Client role: dial `node` on the data port until it answers.
    pub async fn dial(&self, node: &str) -> Result<TcpStream, MediumError> {
        let host = self.cluster.host_for(node);
        dial_with_retry(&host, self.data_port, self.dial_timeout, &self.retry).await
    }

    /// Establish both sockets of a hop concurrently. Neither side knows
    /// whether its neighbours are up yet, so the accept and the dial race
    /// independently and this returns once both have resolved.
    ///
    /// Returns `(outbound, inbound)`.
    pub async fn connect_hop(&self, next: &str) -> Result<(TcpStream, TcpStream), MediumError> {
        let (outbound, inbound) = tokio::try_join!(self.dial(next), self.accept_one())?;
        Ok((outbound, inbound))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn ensure_fifo(path: &Path) -> Result<(), MediumError> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o666)) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "created fifo");
            Ok(())
        }
        Err(Errno::EEXIST) => Ok(()),
        Err(e) => Err(MediumError::Mkfifo(path.to_path_buf(), e)),
    }
}

/// Bind a TCP listener with SO_REUSEADDR so a recreated server socket can
/// take the port back while the previous connection is in TIME_WAIT.
pub fn bind_listener(host: &str, port: u16) -> Result<TcpListener, MediumError> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|_| MediumError::BadAddress(format!("{host}:{port}")))?;

    let build = || -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        TcpListener::from_std(socket.into())
    };
    build().map_err(|e| MediumError::Bind(addr, e))
}

/// Bind, retrying while the port is still held by a previous listener.
pub async fn bind_with_retry(
    host: &str,
    port: u16,
    retry: &RetryPolicy,
) -> Result<TcpListener, MediumError> {
    let mut backoff = retry.backoff();
    loop {
        match bind_listener(host, port) {
            Err(MediumError::Bind(addr, e)) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(%addr, attempt = backoff.attempts(), "port busy, retrying bind");
                backoff.wait().await;
            }
            other => return other,
        }
    }
}

enum DialFailure {
    NotReady(io::Error),
    Fatal(io::Error),
}

/// Dial `host:port`, retrying for as long as the peer is not ready.
/// Any other failure is returned.
pub async fn dial_with_retry(
    host: &str,
    port: u16,
    timeout: Duration,
    retry: &RetryPolicy,
) -> Result<TcpStream, MediumError> {
    let mut backoff = retry.backoff();
    loop {
        match dial_once(host, port, timeout).await {
            Ok(stream) => {
                tracing::info!(host, port, attempts = backoff.attempts() + 1, "connected");
                return Ok(stream);
            }
            Err(DialFailure::NotReady(e)) => {
                tracing::debug!(host, port, error = %e, "peer not ready, retrying");
                backoff.wait().await;
            }
            Err(DialFailure::Fatal(e)) => return Err(MediumError::Dial(format!("{host}:{port}"), e)),
        }
    }
}

async fn dial_once(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, DialFailure> {
    // A node's service record may not exist yet, so every resolution
    // failure counts as not-ready.
    let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((host, port)).await {
        Ok(it) => it.collect(),
        Err(e) => return Err(DialFailure::NotReady(e)),
    };
    if addrs.is_empty() {
        return Err(DialFailure::NotReady(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host} resolved to no addresses"),
        )));
    }

    let mut last = None;
    for addr in addrs {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Ok(Err(e)) => last = Some(e),
            Err(_) => last = Some(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
        }
    }

    let err = last.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected));
    if peer_not_ready(&err) {
        Err(DialFailure::NotReady(err))
    } else {
        Err(DialFailure::Fatal(err))
    }
}

fn peer_not_ready(err: &io::Error) -> bool {
    classify(err) == Fault::PeerNotReady
        || matches!(
            err.raw_os_error(),
            Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH)
        )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
