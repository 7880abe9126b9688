//! Transport layer
//!
//! Two upstream transports exist, selected by configuration:
//! - raw TCP via [`socket::PeerSocket`]
//! - TLS-wrapped via [`tls::TlsClient`]
//!
//! The local (incoming) side is always a [`socket::PeerSocket`].

pub mod socket;
pub mod tls;

pub use socket::{HalfState, PeerSocket, ReadEnd, WriteEnd};
pub use tls::{TlsClient, TlsEvent};

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connection closed")]
    Closed,

    #[error("Socket not connected")]
    NotConnected,
}
