use std::io;

/// Error taxonomy for the gateway core (spec §7).
///
/// Distinguishing these (rather than a single opaque error) lets callers
/// tell "refuse the accept" apart from "retry locally" apart from
/// "the session is already gone, just free it".
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// SOCKS5 `connect()` could not reach the proxy at the transport level.
    #[error("socks5 proxy unreachable: {0}")]
    Unreachable(#[source] io::Error),

    /// SOCKS5 framing mismatch (bad version, bad method, truncated reply).
    #[error("socks5 protocol error: {0}")]
    ProtocolError(String),

    /// SOCKS5 reply `rep != 0`.
    #[error("socks5 auth/request failed: rep={0:#04x}")]
    AuthError(u8),

    /// The userspace stack side (downstream write/output) returned a
    /// non-OK status that isn't transient memory pressure.
    #[error("stack write failed: {0}")]
    StackError(String),

    /// Transient backpressure on the stack-facing write path (the
    /// `ERR_MEM`/`EWOULDBLOCK` analogue); retried locally by halving the
    /// attempted length until it escalates to `StackError`.
    #[error("transient memory pressure")]
    TransientMem,

    /// The peer (proxy or host) closed its side; the opposite buffer is
    /// drained once and then the session tears down.
    #[error("peer closed")]
    PeerClosed,

    /// I/O error on the outbound (SOCKS5-facing) socket.
    #[error("local I/O error: {0}")]
    LocalIO(#[source] io::Error),
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => GatewayError::TransientMem,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                GatewayError::PeerClosed
            }
            _ => GatewayError::LocalIO(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
