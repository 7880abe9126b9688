//! Chunk-level AEAD codec
//!
//! The wire stream is a sequence of frames: a 2-byte big-endian ciphertext
//! length followed by the ciphertext (plaintext + 16-byte tag), sealed with
//! ChaCha20-Poly1305 under a monotonic counter nonce. Each direction owns
//! its own counter; frames must be opened in send order.

use super::CipherError;
use bytes::{Buf, BytesMut};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};

/// Length of the authentication tag appended to every frame
pub const TAG_LEN: usize = 16;

/// Size of the frame length prefix
pub const LEN_PREFIX: usize = 2;

/// Sealing half of the chunk codec
pub struct ChunkSealer {
    key: LessSafeKey,
    nonce_counter: u64,
    max_chunk: usize,
}

impl ChunkSealer {
    pub fn new(key: &[u8; 32], max_chunk: usize) -> Result<Self, CipherError> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CipherError::InvalidKeyLength)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce_counter: 0,
            max_chunk,
        })
    }

    /// Transform `buf` from plaintext into wire frames in place. Oversized
    /// input is split into frames of at most `max_chunk` plaintext bytes.
    pub fn seal(&mut self, buf: &mut Vec<u8>) -> Result<(), CipherError> {
        let plaintext = std::mem::take(buf);
        let mut wire =
            Vec::with_capacity(plaintext.len() + LEN_PREFIX + TAG_LEN);

        for chunk in plaintext.chunks(self.max_chunk.max(1)) {
            let mut frame = chunk.to_vec();
            let nonce = Nonce::assume_unique_for_key(self.next_nonce());
            self.key
                .seal_in_place_append_tag(nonce, Aad::empty(), &mut frame)
                .map_err(|_| CipherError::Encryption("seal failed".to_string()))?;

            wire.extend_from_slice(&(frame.len() as u16).to_be_bytes());
            wire.extend_from_slice(&frame);
        }

        // Zero-length input still produces one (empty-payload) frame so the
        // peer's counter stays in step.
        if plaintext.is_empty() {
            let mut frame = Vec::new();
            let nonce = Nonce::assume_unique_for_key(self.next_nonce());
            self.key
                .seal_in_place_append_tag(nonce, Aad::empty(), &mut frame)
                .map_err(|_| CipherError::Encryption("seal failed".to_string()))?;
            wire.extend_from_slice(&(frame.len() as u16).to_be_bytes());
            wire.extend_from_slice(&frame);
        }

        *buf = wire;
        Ok(())
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        nonce
    }
}

/// Opening half of the chunk codec. Stateful: partial frames are buffered
/// until the rest of the bytes arrive.
pub struct ChunkOpener {
    key: LessSafeKey,
    nonce_counter: u64,
    pending: BytesMut,
}

impl ChunkOpener {
    pub fn new(key: &[u8; 32]) -> Result<Self, CipherError> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CipherError::InvalidKeyLength)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            nonce_counter: 0,
            pending: BytesMut::new(),
        })
    }

    /// Transform `buf` from wire bytes into plaintext in place. Incomplete
    /// trailing frames are retained internally; `buf` holds whatever
    /// plaintext the complete frames yielded (possibly nothing).
    pub fn open(&mut self, buf: &mut Vec<u8>) -> Result<(), CipherError> {
        self.pending.extend_from_slice(buf);
        buf.clear();

        loop {
            if self.pending.len() < LEN_PREFIX {
                break;
            }
            let frame_len =
                u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
            if frame_len < TAG_LEN {
                return Err(CipherError::BadFrame(frame_len));
            }
            if self.pending.len() < LEN_PREFIX + frame_len {
                break;
            }

            self.pending.advance(LEN_PREFIX);
            let mut frame = self.pending.split_to(frame_len).to_vec();
            let nonce = Nonce::assume_unique_for_key(self.next_nonce());
            let plaintext = self
                .key
                .open_in_place(nonce, Aad::empty(), &mut frame)
                .map_err(|_| CipherError::Decryption("open failed".to_string()))?;
            buf.extend_from_slice(plaintext);
        }

        Ok(())
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ChunkSealer, ChunkOpener) {
        let key = [0x42u8; 32];
        (
            ChunkSealer::new(&key, 1452).unwrap(),
            ChunkOpener::new(&key).unwrap(),
        )
    }

    #[test]
    fn test_seal_open() {
        let (mut sealer, mut opener) = pair();
        let mut buf = b"Hello, upstream!".to_vec();
        sealer.seal(&mut buf).unwrap();
        assert_ne!(&buf[LEN_PREFIX..LEN_PREFIX + 5], b"Hello");

        opener.open(&mut buf).unwrap();
        assert_eq!(buf, b"Hello, upstream!");
    }

    #[test]
    fn test_open_partial_frames() {
        let (mut sealer, mut opener) = pair();
        let mut wire = b"split delivery".to_vec();
        sealer.seal(&mut wire).unwrap();

        let (a, b) = wire.split_at(wire.len() / 2);
        let mut first = a.to_vec();
        opener.open(&mut first).unwrap();
        assert!(first.is_empty());

        let mut second = b.to_vec();
        opener.open(&mut second).unwrap();
        assert_eq!(second, b"split delivery");
    }

    #[test]
    fn test_oversized_input_is_chunked() {
        let key = [7u8; 32];
        let mut sealer = ChunkSealer::new(&key, 100).unwrap();
        let mut opener = ChunkOpener::new(&key).unwrap();

        let payload: Vec<u8> = (0..350).map(|i| (i % 251) as u8).collect();
        let mut wire = payload.clone();
        sealer.seal(&mut wire).unwrap();
        // 4 frames of <=100 plaintext bytes each
        assert_eq!(wire.len(), payload.len() + 4 * (LEN_PREFIX + TAG_LEN));

        opener.open(&mut wire).unwrap();
        assert_eq!(wire, payload);
    }

    #[test]
    fn test_tamper_detection() {
        let (mut sealer, mut opener) = pair();
        let mut wire = b"integrity".to_vec();
        sealer.seal(&mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(opener.open(&mut wire).is_err());
    }

    #[test]
    fn test_deterministic_for_same_key() {
        let (mut a, _) = pair();
        let (mut b, _) = pair();
        let mut x = b"same bytes".to_vec();
        let mut y = b"same bytes".to_vec();
        a.seal(&mut x).unwrap();
        b.seal(&mut y).unwrap();
        assert_eq!(x, y);
    }
}
