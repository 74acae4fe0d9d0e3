// Copyright 2020 Joyent, Inc.

use std::cmp;
use std::collections::BTreeMap;
use std::fmt::LowerHex;
use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::Num;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{FcpError, Result};

pub const FCP_PROTOCOL_VERSION: u32 = 2;
pub const FCP_PREAMBLE_LEN: usize = 4;

/*
 * Raw payloads are handed to the socket at most this many bytes at a time so
 * that a large segment never sits in the write buffer all at once.
 */
pub const MAX_RAW_WRITE: usize = 1024 * 1024;

/*
 * Upper bound on the size of a message header.  Anything longer than this
 * without a terminator line is treated as garbage.
 */
const MAX_HEADER_LEN: usize = 64 * 1024;

pub const END_MESSAGE: &str = "EndMessage";
pub const DATA: &str = "Data";

// Messages produced by the client.
pub const CLIENT_HELLO: &str = "ClientHello";
pub const GENERATE_CHK: &str = "GenerateCHK";
pub const CLIENT_GET: &str = "ClientGet";
pub const CLIENT_PUT: &str = "ClientPut";
pub const GENERATE_SVK_PAIR: &str = "GenerateSVKPair";
pub const FEC_SEGMENT_FILE: &str = "FECSegmentFile";
pub const FEC_SEGMENT_SPLIT_FILE: &str = "FECSegmentSplitFile";
pub const FEC_ENCODE_SEGMENT: &str = "FECEncodeSegment";
pub const FEC_DECODE_SEGMENT: &str = "FECDecodeSegment";
pub const FEC_MAKE_METADATA: &str = "FECMakeMetadata";

// Messages produced by the node.
pub const NODE_HELLO: &str = "NodeHello";
pub const SUCCESS: &str = "Success";
pub const KEY_COLLISION: &str = "KeyCollision";
pub const PENDING: &str = "Pending";
pub const DATA_FOUND: &str = "DataFound";
pub const DATA_CHUNK: &str = "DataChunk";
pub const RESTARTED: &str = "Restarted";
pub const METADATA_HINT: &str = "MetadataHint";
pub const SEGMENT_HEADER: &str = "SegmentHeader";
pub const BLOCK_MAP: &str = "BlockMap";
pub const BLOCKS_ENCODED: &str = "BlocksEncoded";
pub const BLOCKS_DECODED: &str = "BlocksDecoded";
pub const MADE_METADATA: &str = "MadeMetadata";

/// Bit 0 of the `Flags` field: the node may drop its local copy of the key
/// once the operation completes.
pub const FLAG_DELETE_LOCAL: u32 = 0x1;

pub type FieldMap = BTreeMap<String, String>;

/// How a message header ends: either the message is complete, or it is
/// immediately followed by a raw payload of a previously declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    EndMessage,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FcpMessage {
    pub name: String,
    pub fields: FieldMap,
    pub terminator: Terminator,
}

impl FcpMessage {
    pub fn new<S: Into<String>>(name: S) -> FcpMessage {
        FcpMessage {
            name: name.into(),
            fields: FieldMap::new(),
            terminator: Terminator::EndMessage,
        }
    }

    pub fn with_field<K, V>(mut self, key: K, value: V) -> FcpMessage
    where
        K: Into<String>,
        V: ToString,
    {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    /// Add an integer field, rendered as lowercase hex with no prefix.
    pub fn with_hex<K, V>(mut self, key: K, value: V) -> FcpMessage
    where
        K: Into<String>,
        V: LowerHex,
    {
        self.fields.insert(key.into(), hex(value));
        self
    }

    /// Mark the message as followed by a raw payload.
    pub fn with_data(mut self) -> FcpMessage {
        self.terminator = Terminator::Data;
        self
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn has_data(&self) -> bool {
        self.terminator == Terminator::Data
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.field(key).ok_or_else(|| {
            FcpError::Protocol(format!("{} message is missing field {}", self.name, key))
        })
    }

    pub fn hex_field<T: Num>(&self, key: &str) -> Result<Option<T>> {
        match self.field(key) {
            Some(value) => parse_hex(value).map(Some),
            None => Ok(None),
        }
    }

    pub fn require_hex<T: Num>(&self, key: &str) -> Result<T> {
        parse_hex(self.require(key)?)
    }

    /// Length of the raw payload that follows a `Data` terminated message.
    /// A `DataChunk` declares its own `Length`; any other message declares
    /// the length of its whole payload in `DataLength`.
    pub fn payload_len(&self) -> Result<u64> {
        if self.is(DATA_CHUNK) {
            self.require_hex("Length")
        } else {
            self.require_hex("DataLength")
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let terminator = match self.terminator {
            Terminator::EndMessage => END_MESSAGE,
            Terminator::Data => DATA,
        };
        let len = self.fields.iter().fold(
            self.name.len() + terminator.len() + 2,
            |acc, (k, v)| acc + k.len() + v.len() + 2,
        );
        buf.reserve(len);

        buf.put_slice(self.name.as_bytes());
        buf.put_u8(b'\n');
        for (key, value) in &self.fields {
            buf.put_slice(key.as_bytes());
            buf.put_u8(b'=');
            buf.put_slice(value.as_bytes());
            buf.put_u8(b'\n');
        }
        buf.put_slice(terminator.as_bytes());
        buf.put_u8(b'\n');
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse one message header from the front of `buf`.
    ///
    /// The first line without an `=` is the message name; every following
    /// `Field=Value` line is a field.  The header ends at an `EndMessage`
    /// line, or at a `Data` line when a raw payload follows.  Blank lines
    /// and other bare lines are skipped.
    ///
    /// Returns the message and the number of bytes it occupied, or `None` if
    /// `buf` does not yet hold a complete header.
    pub fn parse(buf: &[u8]) -> Result<Option<(FcpMessage, usize)>> {
        let mut offset = 0;
        let mut name: Option<String> = None;
        let mut fields = FieldMap::new();

        loop {
            let rest = &buf[offset..];
            let newline = match rest.iter().position(|b| *b == b'\n') {
                Some(pos) => pos,
                None => {
                    if buf.len() > MAX_HEADER_LEN {
                        let msg = format!(
                            "no message terminator within {} bytes",
                            MAX_HEADER_LEN
                        );
                        return Err(FcpError::Protocol(msg));
                    }
                    return Ok(None);
                }
            };
            let line = str::from_utf8(&rest[..newline]).map_err(|_| {
                FcpError::protocol("message header is not valid UTF-8")
            })?;
            let line = line.trim_end_matches('\r');
            offset += newline + 1;

            if let Some(eq) = line.find('=') {
                fields.insert(line[..eq].to_string(), line[eq + 1..].to_string());
                continue;
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let terminator = match line {
                DATA => Terminator::Data,
                END_MESSAGE => Terminator::EndMessage,
                _ => {
                    if name.is_none() {
                        name = Some(line.to_string());
                    }
                    continue;
                }
            };
            if let Some(name) = name {
                let msg = FcpMessage {
                    name,
                    fields,
                    terminator,
                };
                return Ok(Some((msg, offset)));
            }
        }
    }
}

/// Render an integer the way every FCP integer field is rendered.
pub fn hex<T: LowerHex>(value: T) -> String {
    format!("{:x}", value)
}

pub fn parse_hex<T: Num>(value: &str) -> Result<T> {
    T::from_str_radix(value.trim(), 16).map_err(|_| {
        FcpError::Protocol(format!("invalid hex value '{}'", value))
    })
}

/// Comma separated lowercase hex list, as used by `BlockList` and friends.
pub fn hex_list(indices: &[usize]) -> String {
    indices.iter().map(hex).collect::<Vec<String>>().join(",")
}

pub fn parse_hex_list(value: &str) -> Result<Vec<usize>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_hex)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FcpFrame {
    Message(FcpMessage),
    /// A piece of the raw payload declared by the preceding message.
    Payload(Bytes),
}

/// Codec for FCP connections.
///
/// Decoding yields a `Message` frame per message header, followed, for
/// `Data` terminated headers, by `Payload` frames covering exactly the
/// declared payload length.  Payload frames are handed out as soon as bytes
/// arrive, so a payload never needs to be buffered whole.
///
/// The client side writes the 4 byte protocol preamble ahead of its first
/// frame; the node side expects it ahead of the first message it reads.
#[derive(Debug, Default)]
pub struct FcpCodec {
    send_preamble: bool,
    expect_preamble: bool,
    payload_remaining: u64,
}

impl FcpCodec {
    pub fn client() -> FcpCodec {
        FcpCodec {
            send_preamble: true,
            ..FcpCodec::default()
        }
    }

    pub fn node() -> FcpCodec {
        FcpCodec {
            expect_preamble: true,
            ..FcpCodec::default()
        }
    }

    /// Bytes of the current payload that have not been decoded yet.
    pub fn payload_remaining(&self) -> u64 {
        self.payload_remaining
    }
}

impl Decoder for FcpCodec {
    type Item = FcpFrame;
    type Error = FcpError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FcpFrame>> {
        if self.expect_preamble {
            if buf.len() < FCP_PREAMBLE_LEN {
                return Ok(None);
            }
            let version = BigEndian::read_u32(&buf[..FCP_PREAMBLE_LEN]);
            if version != FCP_PROTOCOL_VERSION {
                let msg = format!("unsupported protocol version {:#x}", version);
                return Err(FcpError::Protocol(msg));
            }
            buf.advance(FCP_PREAMBLE_LEN);
            self.expect_preamble = false;
        }

        if self.payload_remaining > 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            let len = cmp::min(buf.len() as u64, self.payload_remaining) as usize;
            self.payload_remaining -= len as u64;
            return Ok(Some(FcpFrame::Payload(buf.split_to(len).freeze())));
        }

        match FcpMessage::parse(buf)? {
            Some((msg, consumed)) => {
                buf.advance(consumed);
                if msg.has_data() {
                    self.payload_remaining = msg.payload_len()?;
                }
                Ok(Some(FcpFrame::Message(msg)))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<FcpFrame> for FcpCodec {
    type Error = FcpError;

    fn encode(&mut self, item: FcpFrame, buf: &mut BytesMut) -> Result<()> {
        if self.send_preamble {
            let mut preamble = [0u8; FCP_PREAMBLE_LEN];
            BigEndian::write_u32(&mut preamble, FCP_PROTOCOL_VERSION);
            buf.put_slice(&preamble);
            self.send_preamble = false;
        }

        match item {
            FcpFrame::Message(msg) => msg.encode(buf),
            FcpFrame::Payload(data) => buf.extend_from_slice(&data),
        }

        Ok(())
    }
}
