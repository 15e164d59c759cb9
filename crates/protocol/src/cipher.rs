//! Keystream cipher for post-handshake traffic.
//!
//! All bytes after the handshake are XOR'd against an XChaCha20 keystream,
//! one independent (key, nonce) pair per direction. The key is the handshake
//! split half for that direction; the nonce is the 24-byte value each peer
//! announced in its handshake payload.
//!
//! This is **not** an authenticated cipher: there is no per-frame MAC. The
//! construction obfuscates traffic and binds it to the handshake-derived
//! session keys; integrity comes from that binding, and peers must treat any
//! frame that fails to decode as adversarial and destroy the session. The
//! trade (no AEAD overhead per frame) is deliberate.
//!
//! The keystream is offset-sensitive: the i-th byte on the wire is XOR'd
//! against keystream byte i no matter how the sender grouped bytes into
//! calls. `XChaCha20` tracks the block counter and partial-block position
//! internally, so residual pad bytes carry over between calls.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{Key, XChaCha20, XNonce};

use crate::noise::Split;

/// Cipher key size in bytes (one split half).
pub const KEY_SIZE: usize = 32;

/// Cipher nonce size in bytes.
pub const NONCE_SIZE: usize = 24;

/// Two-direction stream cipher state.
///
/// Owned exclusively by the session; dropping it wipes the key schedule
/// (the underlying cipher zeroizes on drop).
pub struct Cipher {
    tx: XChaCha20,
    rx: XChaCha20,
}

impl Cipher {
    /// Creates the cipher from a handshake split and the two session nonces.
    ///
    /// `tx_nonce` is the locally generated nonce, `rx_nonce` the one the
    /// remote peer announced in its handshake payload.
    pub fn new(split: &Split, tx_nonce: &[u8; NONCE_SIZE], rx_nonce: &[u8; NONCE_SIZE]) -> Self {
        Self {
            tx: XChaCha20::new(
                Key::from_slice(split.tx.as_ref()),
                XNonce::from_slice(tx_nonce),
            ),
            rx: XChaCha20::new(
                Key::from_slice(split.rx.as_ref()),
                XNonce::from_slice(rx_nonce),
            ),
        }
    }

    /// XORs `data` in place against the transmit keystream.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        self.tx.apply_keystream(data);
    }

    /// XORs `data` in place against the receive keystream.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        self.rx.apply_keystream(data);
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never expose cipher state
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
