use std::fmt;

/// All error types produced by the wirecall runtime.
///
/// The variants mirror the error kinds of the wire protocol: client lifecycle
/// errors (`Shutdown`, `ConnectTimeout`, `Canceled`), dispatch errors carried
/// in a response header (`Server`), codec and transport failures, and the
/// discovery/balancer/pool errors of the multi-endpoint path.
#[derive(Debug)]
pub enum RpcError {
    /// The client connection was closed, either by the user or because it is
    /// already dead. No further calls may be registered.
    Shutdown,

    /// Establishing a connection (including the option prelude and any HTTP
    /// upgrade) did not finish within the configured connect timeout.
    ConnectTimeout,

    /// The balancer was asked to pick from an empty server set.
    NoServer,

    /// Discovery produced no endpoint before the multi-endpoint client's
    /// deadline elapsed.
    NoService,

    /// The caller abandoned the call (timeout or cancellation) before a reply
    /// arrived. The string carries the cause.
    Canceled(String),

    /// An error reported by the server in a response header, verbatim.
    Server(String),

    /// The connection died with in-flight calls; each of them is resolved
    /// with this error, carrying the terminating failure.
    ConnectionLost(String),

    /// A framing or (de)serialization failure in one of the codecs.
    Codec(String),

    /// The HTTP CONNECT upgrade was answered with something other than the
    /// connected banner.
    Handshake(String),

    /// A service address did not have the `protocol@host:port` form.
    InvalidAddress(String),

    /// Service registration was rejected (bad name, duplicate).
    InvalidService(String),

    /// A connection-pool failure; surfaces to callers as a dial error.
    Pool(String),

    /// A coordination-service (registry) failure.
    Registry(String),

    /// An I/O error on the underlying transport.
    Io(std::io::Error),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Shutdown => write!(f, "connection is shut down"),
            RpcError::ConnectTimeout => write!(f, "rpc client: connect timeout"),
            RpcError::NoServer => write!(f, "no server"),
            RpcError::NoService => write!(f, "no expect service"),
            RpcError::Canceled(cause) => write!(f, "rpc client: call failed {cause}"),
            RpcError::Server(msg) => write!(f, "{msg}"),
            RpcError::ConnectionLost(msg) => write!(f, "rpc client: connection lost: {msg}"),
            RpcError::Codec(msg) => write!(f, "rpc codec: {msg}"),
            RpcError::Handshake(status) => write!(f, "unexpected HTTP response: {status}"),
            RpcError::InvalidAddress(msg) => write!(f, "{msg}"),
            RpcError::InvalidService(msg) => write!(f, "{msg}"),
            RpcError::Pool(msg) => write!(f, "rpc pool: {msg}"),
            RpcError::Registry(msg) => write!(f, "rpc registry: {msg}"),
            RpcError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io(err)
    }
}

/// Convenience type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RpcError>;
