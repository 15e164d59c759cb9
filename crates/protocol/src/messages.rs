//! Protocol message definitions and their wire codecs.
//!
//! Messages are encoded in protobuf wire format (varint and length-delimited
//! fields, canonical tag numbers) for compatibility with existing peers. The
//! tag numbers are fixed by `schema.proto` in the crate root; that file is
//! the wire contract and this module mirrors it field by field. Unknown
//! fields are skipped on decode so newer peers can extend messages.
//!
//! Frame type numbers:
//!
//! | Type | Message | | Type | Message |
//! |------|---------|-|------|---------|
//! | 0 | Open | | 6 | Unwant |
//! | 1 | Options | | 7 | Request |
//! | 2 | Status | | 8 | Cancel |
//! | 3 | Have | | 9 | Data |
//! | 4 | Unhave | | 10 | Close |
//! | 5 | Want | | 15 | Extension |
//!
//! Types 11 through 14 are unassigned and fatal when received.

use crate::error::{ProtocolError, Result};
use crate::framing::{read_varint, write_varint};

/// Frame type numbers, fixed by the wire contract.
pub mod message_type {
    /// Open a channel for a feed (type 0).
    pub const OPEN: u8 = 0;
    /// Channel options and extension announcement (type 1).
    pub const OPTIONS: u8 = 1;
    /// Upload/download status (type 2).
    pub const STATUS: u8 = 2;
    /// Announce possession of blocks (type 3).
    pub const HAVE: u8 = 3;
    /// Retract a possession announcement (type 4).
    pub const UNHAVE: u8 = 4;
    /// Register interest in a block range (type 5).
    pub const WANT: u8 = 5;
    /// Retract interest in a block range (type 6).
    pub const UNWANT: u8 = 6;
    /// Request a single block (type 7).
    pub const REQUEST: u8 = 7;
    /// Cancel an outstanding request (type 8).
    pub const CANCEL: u8 = 8;
    /// Deliver a block with its integrity proof (type 9).
    pub const DATA: u8 = 9;
    /// Close a channel (type 10).
    pub const CLOSE: u8 = 10;
    /// Application-defined extension message (type 15).
    pub const EXTENSION: u8 = 15;
}

/// Size of the session nonce carried in the handshake payload.
pub const PAYLOAD_NONCE_SIZE: usize = 24;

// ============================================================================
// Protobuf wire helpers
// ============================================================================

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

fn put_tag(buf: &mut Vec<u8>, field: u64, wire: u64) {
    write_varint(buf, field << 3 | wire);
}

fn put_uint(buf: &mut Vec<u8>, field: u64, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    write_varint(buf, value);
}

fn put_bool(buf: &mut Vec<u8>, field: u64, value: bool) {
    put_uint(buf, field, u64::from(value));
}

fn put_bytes(buf: &mut Vec<u8>, field: u64, value: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    write_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

fn missing(message: &'static str, field: &str) -> ProtocolError {
    ProtocolError::Decode(message, format!("missing required field {}", field))
}

/// A decoded field value.
enum FieldValue<'a> {
    Uint(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    fn uint(self, message: &'static str) -> Result<u64> {
        match self {
            FieldValue::Uint(v) => Ok(v),
            FieldValue::Bytes(_) => Err(ProtocolError::Decode(
                message,
                "expected varint field".to_string(),
            )),
        }
    }

    fn boolean(self, message: &'static str) -> Result<bool> {
        Ok(self.uint(message)? != 0)
    }

    fn bytes(self, message: &'static str) -> Result<&'a [u8]> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            FieldValue::Uint(_) => Err(ProtocolError::Decode(
                message,
                "expected length-delimited field".to_string(),
            )),
        }
    }

    fn string(self, message: &'static str) -> Result<String> {
        let bytes = self.bytes(message)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| ProtocolError::Decode(message, "invalid utf-8 in string field".to_string()))
    }
}

/// Iterates `(field_number, value)` pairs over a message body.
struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
    message: &'static str,
}

impl<'a> FieldReader<'a> {
    fn new(data: &'a [u8], message: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            message,
        }
    }

    fn truncated(&self) -> ProtocolError {
        ProtocolError::Decode(self.message, "truncated message".to_string())
    }

    fn varint(&mut self) -> Result<u64> {
        match read_varint(&self.data[self.pos..]) {
            Ok(Some((value, consumed))) => {
                self.pos += consumed;
                Ok(value)
            }
            Ok(None) => Err(self.truncated()),
            Err(_) => Err(ProtocolError::Decode(
                self.message,
                "invalid varint".to_string(),
            )),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(self.truncated());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn next(&mut self) -> Result<Option<(u64, FieldValue<'a>)>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let tag = self.varint()?;
        let field = tag >> 3;
        let value = match tag & 0x7 {
            WIRE_VARINT => FieldValue::Uint(self.varint()?),
            WIRE_FIXED64 => {
                let raw = self.take(8)?;
                FieldValue::Uint(u64::from_le_bytes(raw.try_into().expect("8-byte slice")))
            }
            WIRE_LEN => {
                let len = self.varint()? as usize;
                FieldValue::Bytes(self.take(len)?)
            }
            WIRE_FIXED32 => {
                let raw = self.take(4)?;
                FieldValue::Uint(u64::from(u32::from_le_bytes(
                    raw.try_into().expect("4-byte slice"),
                )))
            }
            wire => {
                return Err(ProtocolError::Decode(
                    self.message,
                    format!("unsupported wire type {}", wire),
                ))
            }
        };
        Ok(Some((field, value)))
    }
}

// ============================================================================
// Handshake payload
// ============================================================================

/// Application payload attached to the final handshake message: the sender's
/// transport cipher nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoisePayload {
    /// 24-byte nonce keying the sender's transmit keystream.
    pub nonce: [u8; PAYLOAD_NONCE_SIZE],
}

impl NoisePayload {
    /// Encodes the payload, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, 1, &self.nonce);
    }

    /// Decodes a payload, requiring an exactly 24-byte nonce.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "NoisePayload");
        let mut nonce = None;
        while let Some((field, value)) = reader.next()? {
            if field == 1 {
                let bytes = value.bytes("NoisePayload")?;
                nonce = Some(bytes.try_into().map_err(|_| {
                    ProtocolError::Decode(
                        "NoisePayload",
                        format!("nonce must be {} bytes, got {}", PAYLOAD_NONCE_SIZE, bytes.len()),
                    )
                })?);
            }
        }
        Ok(Self {
            nonce: nonce.ok_or_else(|| missing("NoisePayload", "nonce"))?,
        })
    }
}

// ============================================================================
// Channel messages
// ============================================================================

/// Open a channel for replicating one feed.
///
/// The `key` field is session-local: callers set it to the raw feed key, and
/// the session replaces it with a derived `capability` before the message is
/// emitted. It is never wire-encoded; on the wire an Open carries only
/// `discovery_key` and `capability`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Open {
    /// Public discovery identifier of the feed being opened.
    pub discovery_key: Vec<u8>,
    /// Session-bound proof of feed-key possession.
    pub capability: Option<Vec<u8>>,
    /// Raw feed key; session-local, replaced by `capability` on send.
    pub key: Option<Vec<u8>>,
}

impl Open {
    /// Encodes the message, appending to `buf`. `key` is not encoded.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, 1, &self.discovery_key);
        if let Some(capability) = &self.capability {
            put_bytes(buf, 2, capability);
        }
    }

    /// Decodes an Open message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Open");
        let mut discovery_key = None;
        let mut capability = None;
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => discovery_key = Some(value.bytes("Open")?.to_vec()),
                2 => capability = Some(value.bytes("Open")?.to_vec()),
                _ => {}
            }
        }
        Ok(Self {
            discovery_key: discovery_key.ok_or_else(|| missing("Open", "discovery_key"))?,
            capability,
            key: None,
        })
    }
}

/// Channel options, including the extension names the sender understands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Options {
    /// Extension names, sorted by the application.
    pub extensions: Vec<String>,
    /// Whether the sender wants acknowledgements for delivered blocks.
    pub ack: Option<bool>,
}

impl Options {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for extension in &self.extensions {
            put_bytes(buf, 1, extension.as_bytes());
        }
        if let Some(ack) = self.ack {
            put_bool(buf, 2, ack);
        }
    }

    /// Decodes an Options message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Options");
        let mut options = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => options.extensions.push(value.string("Options")?),
                2 => options.ack = Some(value.boolean("Options")?),
                _ => {}
            }
        }
        Ok(options)
    }
}

/// Upload/download willingness for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    /// Whether the sender is uploading.
    pub uploading: Option<bool>,
    /// Whether the sender is downloading.
    pub downloading: Option<bool>,
}

impl Status {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(uploading) = self.uploading {
            put_bool(buf, 1, uploading);
        }
        if let Some(downloading) = self.downloading {
            put_bool(buf, 2, downloading);
        }
    }

    /// Decodes a Status message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Status");
        let mut status = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => status.uploading = Some(value.boolean("Status")?),
                2 => status.downloading = Some(value.boolean("Status")?),
                _ => {}
            }
        }
        Ok(status)
    }
}

/// Announce possession of a block range or bitfield.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Have {
    /// First block index of the range.
    pub start: u64,
    /// Range length; readers treat a missing length as 1.
    pub length: Option<u64>,
    /// Run-length-encoded bitfield, alternative to a plain range.
    pub bitfield: Option<Vec<u8>>,
    /// Acknowledges a received block rather than announcing a new one.
    pub ack: Option<bool>,
}

impl Have {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.start);
        if let Some(length) = self.length {
            put_uint(buf, 2, length);
        }
        if let Some(bitfield) = &self.bitfield {
            put_bytes(buf, 3, bitfield);
        }
        if let Some(ack) = self.ack {
            put_bool(buf, 4, ack);
        }
    }

    /// Decodes a Have message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Have");
        let mut start = None;
        let mut have = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => start = Some(value.uint("Have")?),
                2 => have.length = Some(value.uint("Have")?),
                3 => have.bitfield = Some(value.bytes("Have")?.to_vec()),
                4 => have.ack = Some(value.boolean("Have")?),
                _ => {}
            }
        }
        have.start = start.ok_or_else(|| missing("Have", "start"))?;
        Ok(have)
    }
}

/// Retract a previous possession announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unhave {
    /// First block index of the range.
    pub start: u64,
    /// Range length; readers treat a missing length as 1.
    pub length: Option<u64>,
}

impl Unhave {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.start);
        if let Some(length) = self.length {
            put_uint(buf, 2, length);
        }
    }

    /// Decodes an Unhave message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Unhave");
        let mut start = None;
        let mut unhave = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => start = Some(value.uint("Unhave")?),
                2 => unhave.length = Some(value.uint("Unhave")?),
                _ => {}
            }
        }
        unhave.start = start.ok_or_else(|| missing("Unhave", "start"))?;
        Ok(unhave)
    }
}

/// Register interest in a block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Want {
    /// First block index of the range.
    pub start: u64,
    /// Range length; missing means "to the end of the feed".
    pub length: Option<u64>,
}

impl Want {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.start);
        if let Some(length) = self.length {
            put_uint(buf, 2, length);
        }
    }

    /// Decodes a Want message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Want");
        let mut start = None;
        let mut want = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => start = Some(value.uint("Want")?),
                2 => want.length = Some(value.uint("Want")?),
                _ => {}
            }
        }
        want.start = start.ok_or_else(|| missing("Want", "start"))?;
        Ok(want)
    }
}

/// Retract interest in a block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unwant {
    /// First block index of the range.
    pub start: u64,
    /// Range length; missing means "to the end of the feed".
    pub length: Option<u64>,
}

impl Unwant {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.start);
        if let Some(length) = self.length {
            put_uint(buf, 2, length);
        }
    }

    /// Decodes an Unwant message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Unwant");
        let mut start = None;
        let mut unwant = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => start = Some(value.uint("Unwant")?),
                2 => unwant.length = Some(value.uint("Unwant")?),
                _ => {}
            }
        }
        unwant.start = start.ok_or_else(|| missing("Unwant", "start"))?;
        Ok(unwant)
    }
}

/// Request one block, optionally by byte offset or as a hash-only proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Request {
    /// Block index being requested.
    pub index: u64,
    /// Byte offset to resolve to a block instead of `index`.
    pub bytes: Option<u64>,
    /// Request only the integrity hash, not the block value.
    pub hash: Option<bool>,
    /// Number of proof nodes wanted alongside the block.
    pub nodes: Option<u64>,
}

impl Request {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.index);
        if let Some(bytes) = self.bytes {
            put_uint(buf, 2, bytes);
        }
        if let Some(hash) = self.hash {
            put_bool(buf, 3, hash);
        }
        if let Some(nodes) = self.nodes {
            put_uint(buf, 4, nodes);
        }
    }

    /// Decodes a Request message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Request");
        let mut index = None;
        let mut request = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => index = Some(value.uint("Request")?),
                2 => request.bytes = Some(value.uint("Request")?),
                3 => request.hash = Some(value.boolean("Request")?),
                4 => request.nodes = Some(value.uint("Request")?),
                _ => {}
            }
        }
        request.index = index.ok_or_else(|| missing("Request", "index"))?;
        Ok(request)
    }
}

/// Cancel an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cancel {
    /// Block index of the request being cancelled.
    pub index: u64,
    /// Byte offset of the request being cancelled.
    pub bytes: Option<u64>,
    /// Whether the cancelled request was hash-only.
    pub hash: Option<bool>,
}

impl Cancel {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.index);
        if let Some(bytes) = self.bytes {
            put_uint(buf, 2, bytes);
        }
        if let Some(hash) = self.hash {
            put_bool(buf, 3, hash);
        }
    }

    /// Decodes a Cancel message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Cancel");
        let mut index = None;
        let mut cancel = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => index = Some(value.uint("Cancel")?),
                2 => cancel.bytes = Some(value.uint("Cancel")?),
                3 => cancel.hash = Some(value.boolean("Cancel")?),
                _ => {}
            }
        }
        cancel.index = index.ok_or_else(|| missing("Cancel", "index"))?;
        Ok(cancel)
    }
}

/// One node of a block's integrity proof.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// Merkle tree index of the node.
    pub index: u64,
    /// Node hash.
    pub hash: Vec<u8>,
    /// Byte span covered by the node.
    pub size: u64,
}

impl Node {
    fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.index);
        put_bytes(buf, 2, &self.hash);
        put_uint(buf, 3, self.size);
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Data.Node");
        let mut index = None;
        let mut hash = None;
        let mut size = None;
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => index = Some(value.uint("Data.Node")?),
                2 => hash = Some(value.bytes("Data.Node")?.to_vec()),
                3 => size = Some(value.uint("Data.Node")?),
                _ => {}
            }
        }
        Ok(Self {
            index: index.ok_or_else(|| missing("Data.Node", "index"))?,
            hash: hash.ok_or_else(|| missing("Data.Node", "hash"))?,
            size: size.ok_or_else(|| missing("Data.Node", "size"))?,
        })
    }
}

/// Deliver a block, its integrity proof, or both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Data {
    /// Block index being delivered.
    pub index: u64,
    /// Block contents; absent for hash-only responses.
    pub value: Option<Vec<u8>>,
    /// Integrity proof nodes.
    pub nodes: Vec<Node>,
    /// Feed signature covering the proof.
    pub signature: Option<Vec<u8>>,
}

impl Data {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_uint(buf, 1, self.index);
        if let Some(value) = &self.value {
            put_bytes(buf, 2, value);
        }
        for node in &self.nodes {
            let mut encoded = Vec::new();
            node.encode(&mut encoded);
            put_bytes(buf, 3, &encoded);
        }
        if let Some(signature) = &self.signature {
            put_bytes(buf, 4, signature);
        }
    }

    /// Decodes a Data message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Data");
        let mut index = None;
        let mut message = Self::default();
        while let Some((field, value)) = reader.next()? {
            match field {
                1 => index = Some(value.uint("Data")?),
                2 => message.value = Some(value.bytes("Data")?.to_vec()),
                3 => message.nodes.push(Node::decode(value.bytes("Data")?)?),
                4 => message.signature = Some(value.bytes("Data")?.to_vec()),
                _ => {}
            }
        }
        message.index = index.ok_or_else(|| missing("Data", "index"))?;
        Ok(message)
    }
}

/// Close a channel. Always emitted as a frame, fields or no fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Close {
    /// Discovery key of the channel being closed; absent closes the frame's
    /// own channel.
    pub discovery_key: Option<Vec<u8>>,
}

impl Close {
    /// Encodes the message, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(discovery_key) = &self.discovery_key {
            put_bytes(buf, 1, discovery_key);
        }
    }

    /// Decodes a Close message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data, "Close");
        let mut close = Self::default();
        while let Some((field, value)) = reader.next()? {
            if field == 1 {
                close.discovery_key = Some(value.bytes("Close")?.to_vec());
            }
        }
        Ok(close)
    }
}

// ============================================================================
// Message union
// ============================================================================

/// A typed channel message, the unit the session sends and dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// Open a channel (type 0).
    Open(Open),
    /// Channel options (type 1).
    Options(Options),
    /// Upload/download status (type 2).
    Status(Status),
    /// Possession announcement (type 3).
    Have(Have),
    /// Possession retraction (type 4).
    Unhave(Unhave),
    /// Interest registration (type 5).
    Want(Want),
    /// Interest retraction (type 6).
    Unwant(Unwant),
    /// Block request (type 7).
    Request(Request),
    /// Request cancellation (type 8).
    Cancel(Cancel),
    /// Block delivery (type 9).
    Data(Data),
    /// Channel close (type 10).
    Close(Close),
    /// Application extension (type 15), `varint(id) || bytes` on the wire.
    Extension {
        /// Application-assigned extension identifier.
        id: u64,
        /// Opaque extension bytes.
        payload: Vec<u8>,
    },
}

impl ChannelMessage {
    /// Returns the frame type number for this message.
    pub fn typ(&self) -> u8 {
        match self {
            ChannelMessage::Open(_) => message_type::OPEN,
            ChannelMessage::Options(_) => message_type::OPTIONS,
            ChannelMessage::Status(_) => message_type::STATUS,
            ChannelMessage::Have(_) => message_type::HAVE,
            ChannelMessage::Unhave(_) => message_type::UNHAVE,
            ChannelMessage::Want(_) => message_type::WANT,
            ChannelMessage::Unwant(_) => message_type::UNWANT,
            ChannelMessage::Request(_) => message_type::REQUEST,
            ChannelMessage::Cancel(_) => message_type::CANCEL,
            ChannelMessage::Data(_) => message_type::DATA,
            ChannelMessage::Close(_) => message_type::CLOSE,
            ChannelMessage::Extension { .. } => message_type::EXTENSION,
        }
    }

    /// Encodes the frame payload for this message, appending to `buf`.
    pub fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            ChannelMessage::Open(m) => m.encode(buf),
            ChannelMessage::Options(m) => m.encode(buf),
            ChannelMessage::Status(m) => m.encode(buf),
            ChannelMessage::Have(m) => m.encode(buf),
            ChannelMessage::Unhave(m) => m.encode(buf),
            ChannelMessage::Want(m) => m.encode(buf),
            ChannelMessage::Unwant(m) => m.encode(buf),
            ChannelMessage::Request(m) => m.encode(buf),
            ChannelMessage::Cancel(m) => m.encode(buf),
            ChannelMessage::Data(m) => m.encode(buf),
            ChannelMessage::Close(m) => m.encode(buf),
            ChannelMessage::Extension { id, payload } => {
                write_varint(buf, *id);
                buf.extend_from_slice(payload);
            }
        }
    }

    /// Decodes a frame payload by type number.
    ///
    /// Types 11 through 14 have no schema and are a protocol error.
    pub fn decode(typ: u8, payload: &[u8]) -> Result<Self> {
        match typ {
            message_type::OPEN => Ok(ChannelMessage::Open(Open::decode(payload)?)),
            message_type::OPTIONS => Ok(ChannelMessage::Options(Options::decode(payload)?)),
            message_type::STATUS => Ok(ChannelMessage::Status(Status::decode(payload)?)),
            message_type::HAVE => Ok(ChannelMessage::Have(Have::decode(payload)?)),
            message_type::UNHAVE => Ok(ChannelMessage::Unhave(Unhave::decode(payload)?)),
            message_type::WANT => Ok(ChannelMessage::Want(Want::decode(payload)?)),
            message_type::UNWANT => Ok(ChannelMessage::Unwant(Unwant::decode(payload)?)),
            message_type::REQUEST => Ok(ChannelMessage::Request(Request::decode(payload)?)),
            message_type::CANCEL => Ok(ChannelMessage::Cancel(Cancel::decode(payload)?)),
            message_type::DATA => Ok(ChannelMessage::Data(Data::decode(payload)?)),
            message_type::CLOSE => Ok(ChannelMessage::Close(Close::decode(payload)?)),
            message_type::EXTENSION => {
                let (id, consumed) = read_varint(payload)
                    .ok()
                    .flatten()
                    .ok_or(ProtocolError::InvalidVarint)?;
                Ok(ChannelMessage::Extension {
                    id,
                    payload: payload[consumed..].to_vec(),
                })
            }
            typ => Err(ProtocolError::UnknownType(typ)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to test roundtrip encoding through the union.
    fn roundtrip(message: ChannelMessage) {
        let mut buf = Vec::new();
        message.encode_payload(&mut buf);
        let decoded = ChannelMessage::decode(message.typ(), &buf).expect("decode failed");
        assert_eq!(message, decoded);
    }

    #[test]
    fn test_noise_payload_roundtrip() {
        let payload = NoisePayload { nonce: [7; 24] };
        let mut buf = Vec::new();
        payload.encode(&mut buf);
        assert_eq!(NoisePayload::decode(&buf).unwrap(), payload);
    }

    #[test]
    fn test_noise_payload_wrong_nonce_length() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, 1, &[0; 16]);
        assert!(matches!(
            NoisePayload::decode(&buf),
            Err(ProtocolError::Decode("NoisePayload", _))
        ));
    }

    #[test]
    fn test_noise_payload_missing_nonce() {
        assert!(matches!(
            NoisePayload::decode(&[]),
            Err(ProtocolError::Decode("NoisePayload", _))
        ));
    }

    #[test]
    fn test_open_roundtrip() {
        roundtrip(ChannelMessage::Open(Open {
            discovery_key: vec![1; 32],
            capability: Some(vec![2; 32]),
            key: None,
        }));
    }

    #[test]
    fn test_open_key_is_not_encoded() {
        let open = Open {
            discovery_key: vec![1; 32],
            capability: None,
            key: Some(vec![0xee; 32]),
        };
        let mut buf = Vec::new();
        open.encode(&mut buf);

        let decoded = Open::decode(&buf).unwrap();
        assert_eq!(decoded.key, None);
        assert_eq!(decoded.discovery_key, open.discovery_key);
        // nothing resembling the key made it to the wire
        assert!(!buf
            .windows(4)
            .any(|window| window == [0xee, 0xee, 0xee, 0xee]));
    }

    #[test]
    fn test_open_missing_discovery_key() {
        assert!(matches!(
            Open::decode(&[]),
            Err(ProtocolError::Decode("Open", _))
        ));
    }

    #[test]
    fn test_options_roundtrip() {
        roundtrip(ChannelMessage::Options(Options {
            extensions: vec!["search".to_string(), "presence".to_string()],
            ack: Some(true),
        }));
    }

    #[test]
    fn test_options_empty_roundtrip() {
        roundtrip(ChannelMessage::Options(Options::default()));
    }

    #[test]
    fn test_options_invalid_utf8() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, 1, &[0xff, 0xfe]);
        assert!(matches!(
            Options::decode(&buf),
            Err(ProtocolError::Decode("Options", _))
        ));
    }

    #[test]
    fn test_status_roundtrip() {
        roundtrip(ChannelMessage::Status(Status {
            uploading: Some(true),
            downloading: Some(false),
        }));
    }

    #[test]
    fn test_have_roundtrip() {
        roundtrip(ChannelMessage::Have(Have {
            start: 1000,
            length: Some(64),
            bitfield: Some(vec![0b1010_1010; 8]),
            ack: None,
        }));
    }

    #[test]
    fn test_have_minimal_roundtrip() {
        roundtrip(ChannelMessage::Have(Have {
            start: 0,
            length: None,
            bitfield: None,
            ack: None,
        }));
    }

    #[test]
    fn test_unhave_roundtrip() {
        roundtrip(ChannelMessage::Unhave(Unhave {
            start: 5,
            length: Some(10),
        }));
    }

    #[test]
    fn test_want_roundtrip() {
        roundtrip(ChannelMessage::Want(Want {
            start: 0,
            length: None,
        }));
    }

    #[test]
    fn test_unwant_roundtrip() {
        roundtrip(ChannelMessage::Unwant(Unwant {
            start: 128,
            length: Some(128),
        }));
    }

    #[test]
    fn test_request_roundtrip() {
        roundtrip(ChannelMessage::Request(Request {
            index: 42,
            bytes: None,
            hash: Some(true),
            nodes: Some(2),
        }));
    }

    #[test]
    fn test_cancel_roundtrip() {
        roundtrip(ChannelMessage::Cancel(Cancel {
            index: 42,
            bytes: Some(1024),
            hash: None,
        }));
    }

    #[test]
    fn test_data_roundtrip() {
        roundtrip(ChannelMessage::Data(Data {
            index: 7,
            value: Some(b"block contents".to_vec()),
            nodes: vec![
                Node {
                    index: 14,
                    hash: vec![0xab; 32],
                    size: 512,
                },
                Node {
                    index: 15,
                    hash: vec![0xcd; 32],
                    size: 256,
                },
            ],
            signature: Some(vec![0x55; 64]),
        }));
    }

    #[test]
    fn test_data_hash_only_roundtrip() {
        roundtrip(ChannelMessage::Data(Data {
            index: 9,
            value: None,
            nodes: vec![Node {
                index: 18,
                hash: vec![1; 32],
                size: 64,
            }],
            signature: None,
        }));
    }

    #[test]
    fn test_close_roundtrip() {
        roundtrip(ChannelMessage::Close(Close {
            discovery_key: Some(vec![9; 32]),
        }));
    }

    #[test]
    fn test_close_empty_roundtrip() {
        roundtrip(ChannelMessage::Close(Close::default()));
    }

    #[test]
    fn test_extension_roundtrip() {
        roundtrip(ChannelMessage::Extension {
            id: 7,
            payload: vec![0xaa, 0xbb],
        });
    }

    #[test]
    fn test_extension_empty_payload() {
        roundtrip(ChannelMessage::Extension {
            id: 0,
            payload: vec![],
        });
    }

    #[test]
    fn test_unknown_types_rejected() {
        for typ in 11..=14u8 {
            assert!(matches!(
                ChannelMessage::decode(typ, &[]),
                Err(ProtocolError::UnknownType(t)) if t == typ
            ));
        }
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // a Want with start = 3 plus unknown varint, fixed64, fixed32 and
        // length-delimited fields a future peer might add
        let mut buf = Vec::new();
        put_uint(&mut buf, 1, 3);
        put_uint(&mut buf, 9, 99);
        put_tag(&mut buf, 10, WIRE_FIXED64);
        buf.extend_from_slice(&[0; 8]);
        put_tag(&mut buf, 11, WIRE_FIXED32);
        buf.extend_from_slice(&[0; 4]);
        put_bytes(&mut buf, 12, b"future");

        let want = Want::decode(&buf).unwrap();
        assert_eq!(want.start, 3);
        assert_eq!(want.length, None);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, 1, &[1; 32]);
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            Open::decode(&buf),
            Err(ProtocolError::Decode("Open", _))
        ));
    }

    #[test]
    fn test_wrong_wire_type_rejected() {
        // Have.start declared as length-delimited instead of varint
        let mut buf = Vec::new();
        put_bytes(&mut buf, 1, &[1, 2, 3]);
        assert!(matches!(
            Have::decode(&buf),
            Err(ProtocolError::Decode("Have", _))
        ));
    }
}
