use crate::peer::Lifecycle;
use thiserror::Error;

/// Error kinds raised by the overlay core.
///
/// Transport failures are soft: routing falls back to its local best guess
/// and membership changes abort, but nothing panics and nothing is retried.
#[derive(Error, Debug)]
pub enum DhtError {
    #[error("transport failure for {addr}: {reason}")]
    Transport { addr: String, reason: String },
    #[error("key not found")]
    NotFound,
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("node is {0}, operation refused")]
    BadState(Lifecycle),
    #[error("malformed identifier {0:?}")]
    BadId(String),
    #[error("malformed node address {0:?}, expected host:port")]
    BadAddress(String),
}

impl DhtError {
    pub fn transport(addr: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        DhtError::Transport {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for failures the routing layer absorbs with a fallback answer.
    pub fn is_soft(&self) -> bool {
        matches!(self, DhtError::Transport { .. } | DhtError::Protocol(_))
    }
}
