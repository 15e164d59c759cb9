//! Session orchestrator: lifecycle, queueing, capabilities, dispatch.
//!
//! A [`Session`] owns one protocol conversation with a remote peer over a
//! bidirectional byte stream the caller provides. It runs the handshake,
//! derives the transport cipher, frames and encrypts outbound messages,
//! decrypts and dispatches inbound ones, and buffers sends issued before the
//! handshake finishes.
//!
//! The session is single-threaded and synchronous: `recv` and the send
//! operations run to completion, invoking handler callbacks inline. Handlers
//! only receive their own state, so a handler cannot re-enter the session.
//!
//! ## Lifecycle
//!
//! ```text
//! NEW ──construct──▶ HANDSHAKING ──complete──▶ ACTIVE ──destroy──▶ DEAD
//!                       │                         │
//!                       └──err/destroy────────────┴──▶ DEAD
//! ```

use std::collections::VecDeque;

use blake2::digest::consts::U32;
use blake2::digest::{KeyInit, Mac};
use blake2::Blake2bMac;
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use crate::cipher::{Cipher, NONCE_SIZE};
use crate::error::{ProtocolError, Result};
use crate::framing::{encode_frame, encode_keepalive, Decoder, RawFrame};
use crate::messages::{
    Cancel, ChannelMessage, Close, Data, Have, NoisePayload, Open, Options, Request, Status,
    Unhave, Unwant, Want,
};
use crate::noise::{generate_keypair, Handshake, HandshakeOutcome, Keypair, Progress, Role, Split};

/// Namespace prefix for capability derivation. Wire contract; raw bytes, no
/// terminator.
pub const CAPABILITY_NAMESPACE: &[u8] = b"hypercore capability";

/// Maximum number of sends buffered before handshake completion.
///
/// The pending queue would otherwise grow without bound on a slow handshake;
/// exceeding the cap destroys the session with
/// [`ProtocolError::PendingOverflow`].
pub const MAX_PENDING: usize = 1024;

/// Event callbacks for one session.
///
/// Only [`send`](Handlers::send) is required; every other handler defaults to
/// a no-op. All callbacks are invoked synchronously from within `recv` or the
/// send operations. Key material never reaches a handler.
#[allow(unused_variables)]
pub trait Handlers {
    /// Outbound bytes ready for the transport: handshake messages and
    /// encrypted frames, in wire order.
    fn send(&mut self, data: &[u8]);

    /// The session reached its terminal state. `err` is `None` for a clean
    /// local `destroy`. Invoked at most once; no callback fires after it.
    fn on_destroy(&mut self, err: Option<&ProtocolError>) {}

    /// The handshake completed and the session is active.
    fn on_handshake(&mut self) {}

    /// An Open message arrived.
    fn on_open(&mut self, channel: u64, message: Open) {}

    /// An Options message arrived.
    fn on_options(&mut self, channel: u64, message: Options) {}

    /// A Status message arrived.
    fn on_status(&mut self, channel: u64, message: Status) {}

    /// A Have message arrived.
    fn on_have(&mut self, channel: u64, message: Have) {}

    /// An Unhave message arrived.
    fn on_unhave(&mut self, channel: u64, message: Unhave) {}

    /// A Want message arrived.
    fn on_want(&mut self, channel: u64, message: Want) {}

    /// An Unwant message arrived.
    fn on_unwant(&mut self, channel: u64, message: Unwant) {}

    /// A Request message arrived.
    fn on_request(&mut self, channel: u64, message: Request) {}

    /// A Cancel message arrived.
    fn on_cancel(&mut self, channel: u64, message: Cancel) {}

    /// A Data message arrived.
    fn on_data(&mut self, channel: u64, message: Data) {}

    /// A Close message arrived.
    fn on_close(&mut self, channel: u64, message: Close) {}

    /// An extension frame arrived.
    fn on_extension(&mut self, channel: u64, id: u64, data: &[u8]) {}
}

/// Session construction options.
#[derive(Default)]
pub struct SessionOptions {
    /// Static key pair to present during the handshake. Generated fresh when
    /// absent. A pair may be reused across sessions; the session does not
    /// mutate it.
    pub keypair: Option<Keypair>,
}

/// Exclusive session stage. Handshake precedes the cipher; destroyed is
/// terminal.
enum Stage {
    Handshake(Handshake),
    Established { cipher: Cipher, decoder: Decoder },
    Destroyed,
}

/// One protocol conversation with a remote peer.
///
/// See the [module docs](self) for the lifecycle and threading model.
pub struct Session<H: Handlers> {
    handlers: H,
    role: Role,
    stage: Stage,
    keypair: Keypair,
    local_nonce: [u8; NONCE_SIZE],
    remote_nonce: Option<[u8; NONCE_SIZE]>,
    remote_public_key: Option<[u8; 32]>,
    split: Option<Split>,
    pending: VecDeque<(u64, ChannelMessage)>,
}

impl<H: Handlers> Session<H> {
    /// Creates a session and, for the initiator, emits the opening handshake
    /// message through `send`.
    pub fn new(role: Role, handlers: H) -> Result<Self> {
        Self::with_options(role, handlers, SessionOptions::default())
    }

    /// Creates a session with explicit options.
    pub fn with_options(role: Role, handlers: H, options: SessionOptions) -> Result<Self> {
        let keypair = match options.keypair {
            Some(keypair) => keypair,
            None => generate_keypair()?,
        };

        let mut local_nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut local_nonce);

        let mut payload = Vec::new();
        NoisePayload { nonce: local_nonce }.encode(&mut payload);

        let mut handshake = Handshake::new(role, payload, &keypair)?;
        let first = handshake.start()?;

        let mut session = Self {
            handlers,
            role,
            stage: Stage::Handshake(handshake),
            keypair,
            local_nonce,
            remote_nonce: None,
            remote_public_key: None,
            split: None,
            pending: VecDeque::new(),
        };

        if let Some(message) = first {
            session.handlers.send(&message);
        }
        Ok(session)
    }

    /// Returns this session's handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns whether the handshake has completed and the session is live.
    pub fn is_established(&self) -> bool {
        matches!(self.stage, Stage::Established { .. })
    }

    /// Returns whether the session has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.stage, Stage::Destroyed)
    }

    /// Returns the local static public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.keypair.public
    }

    /// Returns the remote static public key, known once the handshake has
    /// completed.
    pub fn remote_public_key(&self) -> Option<&[u8; 32]> {
        self.remote_public_key.as_ref()
    }

    /// Returns the nonce the remote peer announced in its handshake payload,
    /// known once the handshake has completed.
    pub fn remote_nonce(&self) -> Option<&[u8; NONCE_SIZE]> {
        self.remote_nonce.as_ref()
    }

    /// Returns the event handlers.
    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    /// Returns the event handlers mutably.
    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Sends an Open message. If `message.key` is set and `capability` is
    /// not, the key is replaced by a derived capability before the frame is
    /// emitted; the raw key never reaches the wire.
    pub fn open(&mut self, channel: u64, message: Open) -> bool {
        self.send_message(channel, ChannelMessage::Open(message))
    }

    /// Sends an Options message.
    pub fn options(&mut self, channel: u64, message: Options) -> bool {
        self.send_message(channel, ChannelMessage::Options(message))
    }

    /// Sends a Status message.
    pub fn status(&mut self, channel: u64, message: Status) -> bool {
        self.send_message(channel, ChannelMessage::Status(message))
    }

    /// Sends a Have message.
    pub fn have(&mut self, channel: u64, message: Have) -> bool {
        self.send_message(channel, ChannelMessage::Have(message))
    }

    /// Sends an Unhave message.
    pub fn unhave(&mut self, channel: u64, message: Unhave) -> bool {
        self.send_message(channel, ChannelMessage::Unhave(message))
    }

    /// Sends a Want message.
    pub fn want(&mut self, channel: u64, message: Want) -> bool {
        self.send_message(channel, ChannelMessage::Want(message))
    }

    /// Sends an Unwant message.
    pub fn unwant(&mut self, channel: u64, message: Unwant) -> bool {
        self.send_message(channel, ChannelMessage::Unwant(message))
    }

    /// Sends a Request message.
    pub fn request(&mut self, channel: u64, message: Request) -> bool {
        self.send_message(channel, ChannelMessage::Request(message))
    }

    /// Sends a Cancel message.
    pub fn cancel(&mut self, channel: u64, message: Cancel) -> bool {
        self.send_message(channel, ChannelMessage::Cancel(message))
    }

    /// Sends a Data message.
    pub fn data(&mut self, channel: u64, message: Data) -> bool {
        self.send_message(channel, ChannelMessage::Data(message))
    }

    /// Sends a Close message. A frame is always emitted, even for an
    /// all-default Close.
    pub fn close(&mut self, channel: u64, message: Close) -> bool {
        self.send_message(channel, ChannelMessage::Close(message))
    }

    /// Sends an extension frame: `varint(id)` followed by `payload`.
    pub fn extension(&mut self, channel: u64, id: u64, payload: &[u8]) -> bool {
        self.send_message(
            channel,
            ChannelMessage::Extension {
                id,
                payload: payload.to_vec(),
            },
        )
    }

    /// Sends an encrypted zero-length keepalive frame. Keepalives are never
    /// queued; before the handshake completes this is a no-op.
    pub fn ping(&mut self) -> bool {
        let Stage::Established { cipher, .. } = &mut self.stage else {
            return false;
        };
        let mut frame = encode_keepalive();
        cipher.encrypt(&mut frame);
        self.handlers.send(&frame);
        true
    }

    /// Queues or emits one message. Returns `true` when the frame went out
    /// synchronously, `false` when it was queued (or the session is dead).
    fn send_message(&mut self, channel: u64, message: ChannelMessage) -> bool {
        if self.is_destroyed() {
            return false;
        }
        // queue while the handshake runs, and behind an in-progress drain so
        // FIFO order holds
        if matches!(self.stage, Stage::Handshake(_)) || !self.pending.is_empty() {
            self.enqueue(channel, message);
            return false;
        }
        match self.emit(channel, message) {
            Ok(()) => true,
            Err(err) => {
                self.teardown(Some(&err));
                false
            }
        }
    }

    fn enqueue(&mut self, channel: u64, message: ChannelMessage) {
        if self.pending.len() >= MAX_PENDING {
            self.teardown(Some(&ProtocolError::PendingOverflow));
            return;
        }
        self.pending.push_back((channel, message));
    }

    /// Encodes, encrypts and emits one frame. Requires an established stage.
    fn emit(&mut self, channel: u64, mut message: ChannelMessage) -> Result<()> {
        if let ChannelMessage::Open(open) = &mut message {
            if open.capability.is_none() {
                if let Some(key) = open.key.take() {
                    open.capability = self.capability(&key).map(|c| c.to_vec());
                }
            }
        }

        let mut payload = Vec::new();
        message.encode_payload(&mut payload);
        let mut frame = encode_frame(channel, message.typ(), &payload)?;

        let Stage::Established { cipher, .. } = &mut self.stage else {
            unreachable!("emit requires an established session");
        };
        cipher.encrypt(&mut frame);
        trace!(channel, typ = message.typ(), len = frame.len(), "frame out");
        self.handlers.send(&frame);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// Derives the capability this peer sends to prove possession of
    /// `feed_key`. Returns `None` before the handshake completes.
    pub fn capability(&self, feed_key: &[u8]) -> Option<[u8; 32]> {
        let split = self.split.as_ref()?;
        Some(derive_capability(&split.tx, &split.rx, feed_key))
    }

    /// Derives the capability this peer expects from the remote side for
    /// `feed_key`. Returns `None` before the handshake completes.
    pub fn remote_capability(&self, feed_key: &[u8]) -> Option<[u8; 32]> {
        let split = self.split.as_ref()?;
        Some(derive_capability(&split.rx, &split.tx, feed_key))
    }

    /// Checks a received capability against the one expected for `feed_key`,
    /// in constant time. Returns `false` before the handshake completes.
    pub fn verify_remote_capability(&self, capability: &[u8], feed_key: &[u8]) -> bool {
        match self.remote_capability(feed_key) {
            Some(expected) => expected.ct_eq(capability).into(),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Feeds inbound bytes from the transport.
    ///
    /// Accepts arbitrary chunk boundaries. Every fatal error destroys the
    /// session (invoking `on_destroy` once) and is also returned. After
    /// destruction this is a no-op.
    pub fn recv(&mut self, data: &[u8]) -> Result<()> {
        match &self.stage {
            Stage::Destroyed => Ok(()),
            Stage::Handshake(_) => self.recv_handshake(data),
            Stage::Established { .. } => self.recv_established(data),
        }
    }

    /// Destroys the session: wipes key material, invokes `on_destroy` with no
    /// error, and makes every further operation a no-op. Idempotent.
    pub fn destroy(&mut self) {
        self.teardown(None);
    }

    fn recv_handshake(&mut self, data: &[u8]) -> Result<()> {
        let progress = {
            let Stage::Handshake(handshake) = &mut self.stage else {
                unreachable!("checked by recv");
            };
            handshake.recv(data)
        };

        match progress {
            Err(err) => self.fatal(err),
            Ok(Progress::Pending { replies }) => {
                for reply in replies {
                    self.handlers.send(&reply);
                }
                Ok(())
            }
            Ok(Progress::Complete { replies, outcome }) => {
                for reply in replies {
                    self.handlers.send(&reply);
                }
                self.finish_handshake(outcome)
            }
        }
    }

    /// Handshake completion: store peer identity and split, bring up the
    /// cipher, notify, replay overflow, drain the pending queue. Strictly in
    /// that order.
    fn finish_handshake(&mut self, outcome: HandshakeOutcome) -> Result<()> {
        if outcome.remote_payload.is_empty() {
            return self.fatal(ProtocolError::MissingRemotePayload);
        }
        let payload = match NoisePayload::decode(&outcome.remote_payload) {
            Ok(payload) => payload,
            Err(err) => return self.fatal(ProtocolError::BadRemotePayload(err.to_string())),
        };

        let cipher = Cipher::new(&outcome.split, &self.local_nonce, &payload.nonce);
        self.remote_public_key = Some(outcome.remote_public_key);
        self.remote_nonce = Some(payload.nonce);
        self.split = Some(outcome.split);
        self.stage = Stage::Established {
            cipher,
            decoder: Decoder::new(),
        };
        debug!(role = ?self.role, "handshake complete");

        self.handlers.on_handshake();

        if !outcome.overflow.is_empty() {
            // already ciphertext for the first frame(s)
            self.recv(&outcome.overflow)?;
        }

        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Result<()> {
        while let Some((channel, message)) = self.pending.pop_front() {
            if self.is_destroyed() {
                self.pending.clear();
                break;
            }
            if let Err(err) = self.emit(channel, message) {
                return self.fatal(err);
            }
        }
        Ok(())
    }

    fn recv_established(&mut self, data: &[u8]) -> Result<()> {
        let mut frames = Vec::new();
        let decoded = {
            let Stage::Established { cipher, decoder } = &mut self.stage else {
                unreachable!("checked by recv");
            };
            let mut plaintext = data.to_vec();
            cipher.decrypt(&mut plaintext);
            decoder.push(&plaintext, &mut frames)
        };

        // frames that preceded any error still dispatch, in wire order
        for frame in frames {
            if self.is_destroyed() {
                return Ok(());
            }
            self.dispatch(frame)?;
        }
        if let Err(err) = decoded {
            return self.fatal(err);
        }
        Ok(())
    }

    fn dispatch(&mut self, frame: RawFrame) -> Result<()> {
        let message = match ChannelMessage::decode(frame.typ, &frame.payload) {
            Ok(message) => message,
            Err(err) => return self.fatal(err),
        };
        trace!(channel = frame.channel, typ = frame.typ, "frame in");

        let channel = frame.channel;
        match message {
            ChannelMessage::Open(m) => self.handlers.on_open(channel, m),
            ChannelMessage::Options(m) => self.handlers.on_options(channel, m),
            ChannelMessage::Status(m) => self.handlers.on_status(channel, m),
            ChannelMessage::Have(m) => self.handlers.on_have(channel, m),
            ChannelMessage::Unhave(m) => self.handlers.on_unhave(channel, m),
            ChannelMessage::Want(m) => self.handlers.on_want(channel, m),
            ChannelMessage::Unwant(m) => self.handlers.on_unwant(channel, m),
            ChannelMessage::Request(m) => self.handlers.on_request(channel, m),
            ChannelMessage::Cancel(m) => self.handlers.on_cancel(channel, m),
            ChannelMessage::Data(m) => self.handlers.on_data(channel, m),
            ChannelMessage::Close(m) => self.handlers.on_close(channel, m),
            ChannelMessage::Extension { id, payload } => {
                self.handlers.on_extension(channel, id, &payload)
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Routes a fatal error: destroy once, then surface the error.
    fn fatal(&mut self, err: ProtocolError) -> Result<()> {
        self.teardown(Some(&err));
        Err(err)
    }

    fn teardown(&mut self, err: Option<&ProtocolError>) {
        if self.is_destroyed() {
            return;
        }
        // dropping the stage wipes the cipher key schedule; the split wipes
        // with its zeroizing buffers
        self.stage = Stage::Destroyed;
        self.split = None;
        self.pending.clear();
        debug!(err = ?err, "session destroyed");
        self.handlers.on_destroy(err);
    }
}

/// Keyed BLAKE2b-256 over the capability namespace, a split half, and the
/// feed key.
fn derive_capability(half: &[u8; 32], mac_key: &[u8; 32], feed_key: &[u8]) -> [u8; 32] {
    let mut mac =
        <Blake2bMac<U32> as KeyInit>::new_from_slice(mac_key).expect("valid key size");
    Mac::update(&mut mac, CAPABILITY_NAMESPACE);
    Mac::update(&mut mac, half);
    Mac::update(&mut mac, feed_key);
    mac.finalize().into_bytes().into()
}
