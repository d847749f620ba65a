//! Error taxonomy shared by every component that touches a transport.
//!
//! Each I/O failure falls into exactly one class, and each class has one
//! recovery policy:
//!   Transient      retried in place, never surfaced
//!   TransportLoss  the endpoint is recreated
//!   PeerNotReady   the dial is retried after a backoff interval
//!   Fatal          propagated to the owning task, which stops

use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Would-block / interrupted. Expected on non-blocking pipe I/O.
    Transient,
    /// Peer reset, broken pipe, or EOF where more bytes were owed.
    TransportLoss,
    /// Connection refused or dial timed out: the peer has not started yet.
    PeerNotReady,
    /// Anything else.
    Fatal,
}

impl Fault {
    /// Whether a component may absorb this class locally.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Fault::Fatal)
    }
}

/// Classify an I/O error.
///
/// Name-resolution failures surface from `getaddrinfo` with an
/// uncategorized kind, so the medium factory classifies those at the
/// call site rather than here.
pub fn classify(err: &io::Error) -> Fault {
    use io::ErrorKind::*;
    match err.kind() {
        WouldBlock | Interrupted => Fault::Transient,
        ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | UnexpectedEof
        | WriteZero => Fault::TransportLoss,
        ConnectionRefused | TimedOut => Fault::PeerNotReady,
        _ => Fault::Fatal,
    }
}
