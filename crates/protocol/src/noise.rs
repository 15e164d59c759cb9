//! Noise protocol handshake for mutual authentication.
//!
//! This module drives the Noise XX handshake pattern between two peers over
//! an untrusted byte stream, carrying each peer's cipher nonce as an
//! application payload, and exports the raw symmetric split the transport
//! cipher and capability derivation are built on.
//!
//! The XX pattern provides:
//! - Mutual authentication: both parties prove their identity
//! - Forward secrecy: compromise of long-term keys doesn't compromise past sessions
//! - Identity hiding: static keys are encrypted before transmission
//!
//! ## Noise XX Pattern
//! ```text
//! -> e
//! <- e, ee, s, es
//! -> s, se
//! ```
//!
//! Each handshake message travels as `varint(len) || message` so the driver
//! can accept arbitrary chunk boundaries and split trailing bytes (the
//! "overflow" belonging to the first encrypted frame) off the final message.
//! The NoisePayload is attached to the final message each role writes:
//! message 2 for the responder, message 3 for the initiator.

use snow::{Builder, HandshakeState};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ProtocolError, Result};
use crate::framing::{read_varint, write_varint};

/// The Noise protocol pattern used for handshakes.
///
/// We use Noise_XX_25519_ChaChaPoly_BLAKE2b:
/// - XX: Mutual authentication with identity hiding
/// - 25519: Curve25519 for DH key exchange
/// - ChaChaPoly: ChaCha20-Poly1305 for AEAD
/// - BLAKE2b: BLAKE2b for hashing
///
/// The same string, as raw bytes, is the handshake prologue.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2b";

/// Maximum size for a Noise handshake message, per the Noise specification.
pub const MAX_HANDSHAKE_MESSAGE_SIZE: usize = 65535;

/// Size of a Curve25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a Curve25519 secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Role in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake (sends message 1).
    Initiator,
    /// Responds to the handshake (receives message 1).
    Responder,
}

/// A static Curve25519 key pair.
///
/// May be reused across sessions to present a stable identity. The secret
/// half is wiped when the pair is dropped.
#[derive(Clone)]
pub struct Keypair {
    /// Public key, shared with peers during the handshake.
    pub public: [u8; PUBLIC_KEY_SIZE],
    secret: [u8; SECRET_KEY_SIZE],
}

impl Keypair {
    /// Builds a key pair from existing halves.
    pub fn new(public: [u8; PUBLIC_KEY_SIZE], secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self { public, secret }
    }

    /// Returns the secret half.
    pub fn secret(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.secret
    }
}

impl Drop for Keypair {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Generates a fresh Curve25519 key pair valid for the handshake.
pub fn generate_keypair() -> Result<Keypair> {
    let builder = Builder::new(parse_pattern()?);
    let keypair = builder
        .generate_keypair()
        .map_err(|e| ProtocolError::Handshake(format!("failed to generate keypair: {}", e)))?;

    let mut public = [0u8; PUBLIC_KEY_SIZE];
    let mut secret = [0u8; SECRET_KEY_SIZE];
    public.copy_from_slice(&keypair.public);
    secret.copy_from_slice(&keypair.private);
    Ok(Keypair::new(public, secret))
}

/// The symmetric split produced by a completed handshake.
///
/// `tx` keys bytes this peer sends, `rx` bytes it receives; the halves are
/// mirrored on the remote peer. Both wipe on drop.
pub struct Split {
    /// Transmit half.
    pub tx: Zeroizing<[u8; 32]>,
    /// Receive half.
    pub rx: Zeroizing<[u8; 32]>,
}

/// Everything a completed handshake hands back to the session.
pub struct HandshakeOutcome {
    /// The application payload the remote peer attached to its final message.
    pub remote_payload: Vec<u8>,
    /// Symmetric split for the transport cipher and capability derivation.
    pub split: Split,
    /// The remote peer's static public key.
    pub remote_public_key: [u8; PUBLIC_KEY_SIZE],
    /// Trailing bytes received after the final handshake message. They belong
    /// to the first encrypted frame and must be re-fed through the session.
    pub overflow: Vec<u8>,
}

/// Outcome of feeding inbound bytes to the handshake.
pub enum Progress {
    /// Handshake still in flight. `replies` are framed handshake messages to
    /// put on the wire, in order.
    Pending {
        /// Framed handshake messages to send.
        replies: Vec<Vec<u8>>,
    },
    /// Handshake complete. Send `replies` first, then act on the outcome.
    Complete {
        /// Framed handshake messages to send (the initiator's final message).
        replies: Vec<Vec<u8>>,
        /// The completed handshake state.
        outcome: HandshakeOutcome,
    },
}

/// Driver for one Noise XX handshake.
pub struct Handshake {
    /// Handshake state, taken on completion.
    state: Option<HandshakeState>,
    role: Role,
    /// Encoded NoisePayload attached to the final message this role writes.
    payload: Vec<u8>,
    /// Inbound bytes not yet consumed.
    recv_buf: Vec<u8>,
    /// Scratch buffer for snow operations.
    buffer: Vec<u8>,
}

fn parse_pattern() -> Result<snow::params::NoiseParams> {
    NOISE_PATTERN
        .parse()
        .map_err(|e| ProtocolError::Handshake(format!("invalid noise pattern: {}", e)))
}

fn already_complete() -> ProtocolError {
    ProtocolError::Handshake("handshake already complete".to_string())
}

/// Frames a handshake message for the wire: `varint(len) || message`.
fn frame_message(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 3);
    write_varint(&mut out, message.len() as u64);
    out.extend_from_slice(message);
    out
}

impl Handshake {
    /// Creates a handshake driver for the given role.
    ///
    /// `payload` is the encoded application payload (the local cipher nonce)
    /// to attach to the final message this role writes.
    pub fn new(role: Role, payload: Vec<u8>, keypair: &Keypair) -> Result<Self> {
        let builder = Builder::new(parse_pattern()?)
            .prologue(NOISE_PATTERN.as_bytes())
            .local_private_key(&keypair.secret);

        let state = match role {
            Role::Initiator => builder.build_initiator(),
            Role::Responder => builder.build_responder(),
        }
        .map_err(|e| ProtocolError::Handshake(format!("failed to build handshake: {}", e)))?;

        Ok(Self {
            state: Some(state),
            role,
            payload,
            recv_buf: Vec::new(),
            buffer: vec![0u8; MAX_HANDSHAKE_MESSAGE_SIZE],
        })
    }

    /// Produces the opening message.
    ///
    /// Returns the framed first message for the initiator and `None` for the
    /// responder, whose first move is to read.
    pub fn start(&mut self) -> Result<Option<Vec<u8>>> {
        match self.role {
            Role::Responder => Ok(None),
            Role::Initiator => {
                let state = self.state.as_mut().ok_or_else(already_complete)?;
                let len = state.write_message(&[], &mut self.buffer)?;
                Ok(Some(frame_message(&self.buffer[..len])))
            }
        }
    }

    /// Feeds inbound handshake bytes.
    ///
    /// Consumes as many complete handshake messages as `data` (plus buffered
    /// bytes) contains, collecting any replies that become due. Cryptographic
    /// failures are fatal and leave the driver unusable.
    pub fn recv(&mut self, data: &[u8]) -> Result<Progress> {
        self.recv_buf.extend_from_slice(data);
        let mut replies = Vec::new();

        loop {
            let (len, prefix) = match read_varint(&self.recv_buf)? {
                Some(parsed) => parsed,
                None => return Ok(Progress::Pending { replies }),
            };
            let len = len as usize;
            if len > MAX_HANDSHAKE_MESSAGE_SIZE {
                return Err(ProtocolError::Handshake(format!(
                    "handshake message of {} bytes exceeds maximum of {}",
                    len, MAX_HANDSHAKE_MESSAGE_SIZE
                )));
            }
            if self.recv_buf.len() < prefix + len {
                return Ok(Progress::Pending { replies });
            }

            let message: Vec<u8> = self.recv_buf.drain(..prefix + len).skip(prefix).collect();
            let state = self.state.as_mut().ok_or_else(already_complete)?;
            let payload_len = state.read_message(&message, &mut self.buffer)?;
            let remote_payload = self.buffer[..payload_len].to_vec();

            if state.is_handshake_finished() {
                // responder just read message 3
                return self.complete(replies, remote_payload);
            }

            if state.is_my_turn() {
                // every reply written mid-handshake is this role's final
                // message, so the payload rides along
                let payload = std::mem::take(&mut self.payload);
                let len = state.write_message(&payload, &mut self.buffer)?;
                replies.push(frame_message(&self.buffer[..len]));

                if state.is_handshake_finished() {
                    // initiator just wrote message 3
                    return self.complete(replies, remote_payload);
                }
            }
        }
    }

    fn complete(&mut self, replies: Vec<Vec<u8>>, remote_payload: Vec<u8>) -> Result<Progress> {
        let mut state = self.state.take().ok_or_else(already_complete)?;

        let remote_static = state.get_remote_static().ok_or_else(|| {
            ProtocolError::Handshake("remote static key not available".to_string())
        })?;
        let mut remote_public_key = [0u8; PUBLIC_KEY_SIZE];
        remote_public_key.copy_from_slice(remote_static);

        // snow orients the halves to this party: first is the sending key
        let (tx, rx) = state.dangerously_get_raw_split();
        let split = Split {
            tx: Zeroizing::new(tx),
            rx: Zeroizing::new(rx),
        };

        Ok(Progress::Complete {
            replies,
            outcome: HandshakeOutcome {
                remote_payload,
                split,
                remote_public_key,
                overflow: std::mem::take(&mut self.recv_buf),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Handshake, Handshake, Keypair, Keypair) {
        let kp_a = generate_keypair().unwrap();
        let kp_b = generate_keypair().unwrap();
        let a = Handshake::new(Role::Initiator, b"payload-a".to_vec(), &kp_a).unwrap();
        let b = Handshake::new(Role::Responder, b"payload-b".to_vec(), &kp_b).unwrap();
        (a, b, kp_a, kp_b)
    }

    fn run_to_completion(
        a: &mut Handshake,
        b: &mut Handshake,
    ) -> (HandshakeOutcome, HandshakeOutcome) {
        let msg1 = a.start().unwrap().unwrap();
        assert!(b.start().unwrap().is_none());

        let msg2 = match b.recv(&msg1).unwrap() {
            Progress::Pending { mut replies } => {
                assert_eq!(replies.len(), 1);
                replies.pop().unwrap()
            }
            Progress::Complete { .. } => panic!("responder finished after message 1"),
        };

        let (msg3, outcome_a) = match a.recv(&msg2).unwrap() {
            Progress::Complete {
                mut replies,
                outcome,
            } => {
                assert_eq!(replies.len(), 1);
                (replies.pop().unwrap(), outcome)
            }
            Progress::Pending { .. } => panic!("initiator did not finish after message 2"),
        };

        let outcome_b = match b.recv(&msg3).unwrap() {
            Progress::Complete { replies, outcome } => {
                assert!(replies.is_empty());
                outcome
            }
            Progress::Pending { .. } => panic!("responder did not finish after message 3"),
        };

        (outcome_a, outcome_b)
    }

    #[test]
    fn test_full_handshake_exchanges_payloads() {
        let (mut a, mut b, _, _) = pair();
        let (outcome_a, outcome_b) = run_to_completion(&mut a, &mut b);

        assert_eq!(outcome_a.remote_payload, b"payload-b");
        assert_eq!(outcome_b.remote_payload, b"payload-a");
    }

    #[test]
    fn test_remote_public_keys_cross() {
        let (mut a, mut b, kp_a, kp_b) = pair();
        let (outcome_a, outcome_b) = run_to_completion(&mut a, &mut b);

        assert_eq!(outcome_a.remote_public_key, kp_b.public);
        assert_eq!(outcome_b.remote_public_key, kp_a.public);
    }

    #[test]
    fn test_split_halves_mirror() {
        let (mut a, mut b, _, _) = pair();
        let (outcome_a, outcome_b) = run_to_completion(&mut a, &mut b);

        assert_eq!(*outcome_a.split.tx, *outcome_b.split.rx);
        assert_eq!(*outcome_a.split.rx, *outcome_b.split.tx);
        assert_ne!(*outcome_a.split.tx, *outcome_a.split.rx);
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let (mut a, mut b, _, _) = pair();
        let msg1 = a.start().unwrap().unwrap();

        let mut msg2 = Vec::new();
        for &byte in &msg1 {
            match b.recv(&[byte]).unwrap() {
                Progress::Pending { replies } => msg2.extend(replies),
                Progress::Complete { .. } => panic!("responder finished early"),
            }
        }
        assert_eq!(msg2.len(), 1);

        let mut done_a = None;
        for &byte in &msg2[0] {
            match a.recv(&[byte]).unwrap() {
                Progress::Pending { replies } => assert!(replies.is_empty()),
                Progress::Complete { replies, outcome } => {
                    done_a = Some((replies, outcome));
                }
            }
        }
        let (replies, outcome_a) = done_a.expect("initiator never finished");
        assert_eq!(outcome_a.remote_payload, b"payload-b");
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn test_overflow_bytes_returned() {
        let (mut a, mut b, _, _) = pair();
        let msg1 = a.start().unwrap().unwrap();
        let msg2 = match b.recv(&msg1).unwrap() {
            Progress::Pending { mut replies } => replies.pop().unwrap(),
            _ => panic!(),
        };
        let msg3 = match a.recv(&msg2).unwrap() {
            Progress::Complete { mut replies, .. } => replies.pop().unwrap(),
            _ => panic!(),
        };

        // glue trailing bytes onto the final handshake message
        let mut glued = msg3.clone();
        glued.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        match b.recv(&glued).unwrap() {
            Progress::Complete { outcome, .. } => {
                assert_eq!(outcome.overflow, vec![0xde, 0xad, 0xbe, 0xef]);
            }
            _ => panic!("responder did not finish"),
        }
    }

    #[test]
    fn test_corrupted_message_fails() {
        let (mut a, mut b, _, _) = pair();
        let msg1 = a.start().unwrap().unwrap();
        let msg2 = match b.recv(&msg1).unwrap() {
            Progress::Pending { mut replies } => replies.pop().unwrap(),
            _ => panic!(),
        };
        let mut msg3 = match a.recv(&msg2).unwrap() {
            Progress::Complete { mut replies, .. } => replies.pop().unwrap(),
            _ => panic!(),
        };

        // flip a bit inside the noise message body (past the length prefix)
        let last = msg3.len() - 1;
        msg3[last] ^= 0xff;
        let result = b.recv(&msg3);
        assert!(matches!(result, Err(ProtocolError::Handshake(_))));
    }

    #[test]
    fn test_oversize_handshake_message_rejected() {
        let (_, mut b, _, _) = pair();
        let mut data = Vec::new();
        write_varint(&mut data, (MAX_HANDSHAKE_MESSAGE_SIZE + 1) as u64);
        let result = b.recv(&data);
        assert!(matches!(result, Err(ProtocolError::Handshake(_))));
    }

    #[test]
    fn test_keypair_debug_hides_secret() {
        let kp = generate_keypair().unwrap();
        let rendered = format!("{:?}", kp);
        assert!(!rendered.contains("secret"));
    }
}
