//! # Feed Replication Protocol Core
//!
//! This crate implements the core state machine of a peer-to-peer
//! replication protocol for append-only log feeds, exchanged between two
//! endpoints over any bidirectional byte stream.
//!
//! ## Overview
//!
//! The crate provides:
//!
//! - **Noise Handshake**: mutual authentication and key agreement using
//!   Noise XX over Curve25519
//! - **Keystream Cipher**: XChaCha20 obfuscation of all post-handshake bytes
//! - **Frame Codec**: varint length-prefixed, channel-multiplexed framing
//! - **Message Schemas**: the eleven typed replication messages plus
//!   extensions, in protobuf wire format (see `schema.proto`)
//! - **Session**: lifecycle orchestration, pre-handshake send buffering, and
//!   capability derivation for proving feed-key possession
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Typed Messages                │  protobuf wire format
//! ├─────────────────────────────────────────┤
//! │             Framing                     │  varint length + channel/type
//! ├─────────────────────────────────────────┤
//! │         Keystream Cipher                │  XChaCha20 XOR
//! ├─────────────────────────────────────────┤
//! │   Transport (caller-provided stream)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The session is transport-free: the caller feeds inbound bytes through
//! [`Session::recv`] and ships outbound bytes from the
//! [`send`](session::Handlers::send) handler. All dispatch is synchronous and
//! single-threaded.
//!
//! Post-handshake traffic is XOR-obfuscated, not authenticated per frame;
//! integrity rests on the handshake-derived session binding, and any frame
//! that fails to decode destroys the session. See [`cipher`] for the
//! trade-off.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Handlers, Role, Session};
//!
//! /// Collects outbound bytes for the transport to ship.
//! #[derive(Default)]
//! struct Outbox {
//!     wire: Vec<Vec<u8>>,
//! }
//!
//! impl Handlers for Outbox {
//!     fn send(&mut self, data: &[u8]) {
//!         self.wire.push(data.to_vec());
//!     }
//! }
//!
//! // the initiator's first handshake message is emitted on construction
//! let session = Session::new(Role::Initiator, Outbox::default()).unwrap();
//! assert_eq!(session.handlers().wire.len(), 1);
//! ```
//!
//! ## Modules
//!
//! - [`noise`]: Noise XX handshake and key pairs
//! - [`cipher`]: post-handshake keystream cipher
//! - [`framing`]: varints and the frame codec
//! - [`messages`]: typed message schemas
//! - [`session`]: the session orchestrator
//! - [`error`]: error types

pub mod cipher;
pub mod error;
pub mod framing;
pub mod messages;
pub mod noise;
pub mod session;

pub use cipher::{Cipher, KEY_SIZE, NONCE_SIZE};
pub use error::{ProtocolError, Result};
pub use framing::{MAX_CHANNEL, MAX_FRAME_SIZE};
pub use messages::{
    Cancel, ChannelMessage, Close, Data, Have, Node, NoisePayload, Open, Options, Request, Status,
    Unhave, Unwant, Want,
};
pub use noise::{generate_keypair, Keypair, Role, Split};
pub use session::{Handlers, Session, SessionOptions, CAPABILITY_NAMESPACE, MAX_PENDING};
