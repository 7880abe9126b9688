//! Cipher / obfuscation pipeline
//!
//! A [`TunnelCipher`] is created once per tunnel and transforms plaintext
//! chunks into wire bytes and back. The pipeline is split into an encoding
//! half and a decoding half so the two streaming directions can progress
//! independently; each half keeps its own codec state and must be fed in
//! strictly increasing stream order.
//!
//! Some protocols require a challenge-response round after the first client
//! payload: the server sends one challenge chunk, and the decoder answers
//! with a receipt delivered through the optional feedback buffer of
//! [`ProtocolDecoder::decrypt`]. Whether a protocol does this is fixed at
//! creation time and exposed via [`TunnelCipher::needs_feedback`].

mod chunk;

pub use chunk::{ChunkOpener, ChunkSealer, LEN_PREFIX, TAG_LEN};

use ring::hkdf;
use ring::hmac;
use thiserror::Error;
use tracing::debug;

/// Cipher pipeline errors
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Unknown cipher method: {0}")]
    UnknownMethod(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unknown obfuscator: {0}")]
    UnknownObfs(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Malformed wire frame of {0} bytes")]
    BadFrame(usize),

    #[error("Challenge exceeds negotiated buffer size")]
    OversizedChallenge,
}

/// Cipher method selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Plaintext passthrough, for interop testing only
    None,
    /// ChaCha20-Poly1305 chunk codec
    Chacha20Poly1305,
}

impl Method {
    pub fn from_name(name: &str) -> Result<Self, CipherError> {
        match name {
            "none" | "plain" => Ok(Method::None),
            "chacha20-poly1305" | "chacha20-ietf-poly1305" => Ok(Method::Chacha20Poly1305),
            other => Err(CipherError::UnknownMethod(other.to_string())),
        }
    }
}

/// Obfuscation protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// No protocol-level handshake
    Origin,
    /// Server issues a challenge after the first client payload; the client
    /// answers with an HMAC receipt before application data may flow.
    AuthChallenge,
}

impl Protocol {
    pub fn from_name(name: &str) -> Result<Self, CipherError> {
        match name {
            "origin" => Ok(Protocol::Origin),
            "auth-challenge" | "auth_challenge" => Ok(Protocol::AuthChallenge),
            other => Err(CipherError::UnknownProtocol(other.to_string())),
        }
    }

    fn needs_feedback(self) -> bool {
        matches!(self, Protocol::AuthChallenge)
    }
}

/// Obfuscation plugin selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Obfs {
    Plain,
}

impl Obfs {
    pub fn from_name(name: &str) -> Result<Self, CipherError> {
        match name {
            "plain" => Ok(Obfs::Plain),
            other => Err(CipherError::UnknownObfs(other.to_string())),
        }
    }
}

/// Seeding surface for obfuscation plugins: the negotiated buffer size and
/// the length of the address header at the front of the first payload.
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo {
    pub buffer_size: usize,
    pub head_len: usize,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            buffer_size: crate::SSR_BUFF_SIZE,
            head_len: 30,
        }
    }
}

enum MethodSealer {
    None,
    Aead(ChunkSealer),
}

enum MethodOpener {
    None,
    Aead(ChunkOpener),
}

/// Encoding half: plaintext in, wire bytes out.
pub struct ProtocolEncoder {
    sealer: MethodSealer,
}

impl ProtocolEncoder {
    /// Encrypt `buf` in place into wire bytes.
    pub fn encrypt(&mut self, buf: &mut Vec<u8>) -> Result<(), CipherError> {
        match &mut self.sealer {
            MethodSealer::None => Ok(()),
            MethodSealer::Aead(sealer) => sealer.seal(buf),
        }
    }
}

/// Decoding half: wire bytes in, plaintext out, plus the optional feedback
/// buffer a challenge protocol produces on its first chunk.
pub struct ProtocolDecoder {
    opener: MethodOpener,
    receipt_key: hmac::Key,
    info: ServerInfo,
    awaiting_challenge: bool,
}

impl ProtocolDecoder {
    /// Decrypt `buf` in place. Returns the feedback bytes to send upstream,
    /// if the protocol produced any for this chunk.
    pub fn decrypt(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, CipherError> {
        match &mut self.opener {
            MethodOpener::None => {}
            MethodOpener::Aead(opener) => opener.open(buf)?,
        }

        if self.awaiting_challenge && !buf.is_empty() {
            self.awaiting_challenge = false;
            if buf.len() > self.info.buffer_size {
                return Err(CipherError::OversizedChallenge);
            }
            let receipt = hmac::sign(&self.receipt_key, buf);
            debug!("answering {}-byte protocol challenge", buf.len());
            buf.clear();
            return Ok(Some(receipt.as_ref().to_vec()));
        }

        Ok(None)
    }

    /// True while the protocol still owes the server a challenge answer.
    pub fn challenge_pending(&self) -> bool {
        self.awaiting_challenge
    }
}

/// Per-tunnel cipher context
pub struct TunnelCipher {
    tx: ProtocolEncoder,
    rx: ProtocolDecoder,
    needs_feedback: bool,
}

impl TunnelCipher {
    /// Create a pipeline for one tunnel. `max_chunk` bounds the plaintext
    /// handed to the sealer in a single frame.
    pub fn create(
        method: Method,
        protocol: Protocol,
        _obfs: Obfs,
        password: &str,
        max_chunk: usize,
    ) -> Result<Self, CipherError> {
        let key = derive_key(password);
        let (sealer, opener) = match method {
            Method::None => (MethodSealer::None, MethodOpener::None),
            Method::Chacha20Poly1305 => (
                MethodSealer::Aead(ChunkSealer::new(&key, max_chunk)?),
                MethodOpener::Aead(ChunkOpener::new(&key)?),
            ),
        };

        Ok(Self {
            tx: ProtocolEncoder { sealer },
            rx: ProtocolDecoder {
                opener,
                receipt_key: hmac::Key::new(hmac::HMAC_SHA256, &key),
                info: ServerInfo::default(),
                awaiting_challenge: protocol.needs_feedback(),
            },
            needs_feedback: protocol.needs_feedback(),
        })
    }

    /// Whether the protocol requires the challenge-response round after the
    /// first client payload.
    pub fn needs_feedback(&self) -> bool {
        self.needs_feedback
    }

    /// Seed the plugin surface with the negotiated buffer size and the
    /// first-payload header length.
    pub fn set_server_info(&mut self, info: ServerInfo) {
        self.rx.info = info;
    }

    /// Encrypt a plaintext chunk in place into wire bytes.
    pub fn encrypt(&mut self, buf: &mut Vec<u8>) -> Result<(), CipherError> {
        self.tx.encrypt(buf)
    }

    /// Decrypt a wire chunk in place, yielding optional feedback bytes.
    pub fn decrypt(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>, CipherError> {
        self.rx.decrypt(buf)
    }

    /// True while the protocol still owes the server a challenge answer.
    pub fn challenge_pending(&self) -> bool {
        self.rx.challenge_pending()
    }

    /// Borrow the two halves disjointly for concurrent streaming.
    pub fn halves_mut(&mut self) -> (&mut ProtocolEncoder, &mut ProtocolDecoder) {
        (&mut self.tx, &mut self.rx)
    }
}

/// Derive the 32-byte session key from the configured password.
fn derive_key(password: &str) -> [u8; 32] {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, b"shadow-tunnel-session-v1");
    let prk = salt.extract(password.as_bytes());
    let okm = prk
        .expand(&[b"chunk-codec"], hkdf::HKDF_SHA256)
        .expect("HKDF expand with fixed-length output cannot fail");
    let mut key = [0u8; 32];
    okm.fill(&mut key)
        .expect("HKDF fill with fixed-length output cannot fail");
    key
}
