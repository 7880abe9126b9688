//! # Shadow Tunnel
//!
//! A client-side SOCKS5 proxy front-end that terminates SOCKS5 CONNECT
//! sessions from local applications and pipes their TCP payload to a remote
//! SSR-style obfuscation server, optionally wrapped in an outer TLS
//! transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Local application                    │
//! │               (SOCKS5 CONNECT client)                │
//! ├──────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │  (per-session state machine, half-state sockets)     │
//! ├──────────────────────────────────────────────────────┤
//! │             Cipher / Obfuscation Layer               │
//! │     (chunk codec, protocol feedback handshake)       │
//! ├──────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │              (raw TCP or TLS-wrapped)                │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Each accepted local connection becomes one [`tunnel::Tunnel`]: SOCKS5
//! negotiation, upstream resolve/connect, the obfuscation handshake (with an
//! optional challenge-response round trip), then bidirectional streaming.

pub mod acl;
pub mod cipher;
pub mod config;
pub mod env;
pub mod socks5;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use env::ServerEnv;

/// Fixed allocation size for socket read buffers and the initial address
/// package. Matches the largest frame the upstream server accepts.
pub const SSR_BUFF_SIZE: usize = 2048;

/// Maximum plaintext chunk handed to the cipher pipeline in one call.
pub const MAX_CHUNK_SIZE: usize = 1452;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cipher error: {0}")]
    Cipher(#[from] cipher::CipherError),

    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] socks5::Socks5Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
