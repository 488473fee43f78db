use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by the listener and client controllers.
#[derive(Debug, Error)]
pub enum Error {
    /// A socket operation failed after setup.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Host name resolution failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    /// Resolution succeeded but produced no usable address.
    #[error("no addresses resolved for {0}")]
    NoAddress(String),
    /// Binding or listening on the local address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// A phase did not complete before its deadline.
    #[error("{phase} timed out after {elapsed:?}")]
    Timeout { phase: &'static str, elapsed: Duration },
    /// A client phase was started out of order.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// The configuration file could not be read or parsed.
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
