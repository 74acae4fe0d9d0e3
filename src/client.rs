// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use slog::{debug, o, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::codec::Framed;

use crate::config::ClientConfig;
use crate::error::{FailureKind, FcpError, Result};
use crate::metadata::{self, MetadataHint};
use crate::protocol::*;
use crate::uri::KeyUri;

/// Map a message that should not have arrived to an error.  Failure messages
/// become `FcpError::Remote`, anything else is a protocol error.
pub(crate) fn unexpected(msg: &FcpMessage, expected: &str) -> FcpError {
    match FailureKind::from_message_name(&msg.name) {
        Some(kind) => FcpError::Remote {
            kind,
            reason: msg.field("Reason").map(String::from),
        },
        None => FcpError::Protocol(format!("expected {}, got {}", expected, msg.name)),
    }
}

pub enum ChunkEvent {
    Data(Bytes),
    Restarted,
}

enum ReadState {
    WaitingForResponse,
    ReadingHeader(FcpMessage),
    ReadingMetadata { metadata_len: u64, data_len: u64 },
    ReadingData { metadata: Bytes, data_len: u64 },
    /*
     * The node restarted the payload.  It either announces the key again
     * with a new DataFound, or resends the chunks straight away.
     */
    Restarted { metadata_len: u64, data_len: u64 },
}

/// One FCP connection, used for exactly one request.  The socket is closed
/// when the connection is dropped.
pub struct Connection<S = TcpStream> {
    framed: Framed<S, FcpCodec>,
    /*
     * Bytes of the current payload that arrived in a DataChunk but belong to
     * a region the caller has not asked for yet.
     */
    pending: BytesMut,
    log: Logger,
}

impl Connection<TcpStream> {
    pub async fn connect(host: &str, port: u16, log: &Logger) -> Result<Connection> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| FcpError::Connect {
                addr: format!("{}:{}", host, port),
                source,
            })?;
        Ok(Connection::new(stream, log.clone()))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, log: Logger) -> Connection<S> {
        Connection {
            framed: Framed::new(stream, FcpCodec::client()),
            pending: BytesMut::new(),
            log,
        }
    }

    pub async fn send(&mut self, msg: FcpMessage) -> Result<()> {
        debug!(self.log, "sending message"; "name" => &msg.name);
        self.framed.send(FcpFrame::Message(msg)).await
    }

    /// Write raw payload bytes, at most `MAX_RAW_WRITE` bytes per write.
    pub async fn send_raw(&mut self, data: &Bytes) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let end = std::cmp::min(offset + MAX_RAW_WRITE, data.len());
            self.framed.send(FcpFrame::Payload(data.slice(offset..end))).await?;
            offset = end;
        }
        Ok(())
    }

    /// Send a message followed by its payload, given as consecutive parts.
    pub async fn send_request(&mut self, msg: FcpMessage, payload: &[&Bytes]) -> Result<()> {
        self.send(msg).await?;
        for part in payload {
            self.send_raw(part).await?;
        }
        Ok(())
    }

    /// Read the next message header, or `None` once the node has closed the
    /// connection.
    pub async fn read_message(&mut self) -> Result<Option<FcpMessage>> {
        match self.framed.next().await {
            Some(Ok(FcpFrame::Message(msg))) => {
                debug!(self.log, "received message"; "name" => &msg.name);
                Ok(Some(msg))
            }
            Some(Ok(FcpFrame::Payload(_))) => Err(FcpError::protocol(
                "received raw bytes where a message was expected",
            )),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    pub async fn expect_message(&mut self) -> Result<FcpMessage> {
        self.read_message()
            .await?
            .ok_or_else(|| FcpError::protocol("connection closed by node"))
    }

    /// Read exactly `len` bytes of raw payload.
    pub async fn read_raw(&mut self, len: u64) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(len as usize);
        while (buf.len() as u64) < len {
            match self.framed.next().await {
                Some(Ok(FcpFrame::Payload(piece))) => buf.extend_from_slice(&piece),
                Some(Ok(FcpFrame::Message(msg))) => {
                    let msg = format!("expected raw bytes, got {} message", msg.name);
                    return Err(FcpError::Protocol(msg));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(FcpError::protocol(
                        "connection closed in the middle of a payload",
                    ))
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Read one `DataChunk`, or notice that the node restarted the payload.
    pub async fn read_chunk(&mut self) -> Result<ChunkEvent> {
        let msg = self.expect_message().await?;
        self.chunk_event(msg).await
    }

    async fn chunk_event(&mut self, msg: FcpMessage) -> Result<ChunkEvent> {
        match msg.name.as_str() {
            DATA_CHUNK => {
                if !msg.has_data() {
                    return Err(FcpError::protocol("DataChunk without a Data line"));
                }
                let len: u64 = msg.require_hex("Length")?;
                Ok(ChunkEvent::Data(self.read_raw(len).await?))
            }
            RESTARTED => {
                self.pending.clear();
                Ok(ChunkEvent::Restarted)
            }
            _ => Err(unexpected(&msg, DATA_CHUNK)),
        }
    }

    /// Read the next `len` bytes of a chunked payload.  Region boundaries need
    /// not line up with chunk boundaries: the rest of a chunk is kept for the
    /// next call.  Returns `None` if the node restarted the payload, in which
    /// case everything received so far has been discarded.
    pub async fn read_payload(&mut self, len: u64) -> Result<Option<Bytes>> {
        let len = len as usize;
        while self.pending.len() < len {
            match self.read_chunk().await? {
                ChunkEvent::Data(data) => self.pending.extend_from_slice(&data),
                ChunkEvent::Restarted => return Ok(None),
            }
        }
        Ok(Some(self.pending.split_to(len).freeze()))
    }

    /// Read `count` consecutive blocks of `size` bytes from a chunked payload.
    pub async fn read_blocks(&mut self, count: usize, size: u64) -> Result<Vec<Bytes>> {
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            match self.read_payload(size).await? {
                Some(block) => blocks.push(block),
                None => return Err(FcpError::protocol("node restarted a block transfer")),
            }
        }
        Ok(blocks)
    }

    /// Receive the answer to a `ClientGet`: `DataFound` followed by the
    /// metadata and data, delivered as one chunked payload.  A restart
    /// throws away both regions; the node may then announce the key again
    /// or resend the chunks from the start of the payload.
    pub async fn receive_key(&mut self) -> Result<KeyData> {
        let mut state = ReadState::WaitingForResponse;
        loop {
            state = match state {
                ReadState::WaitingForResponse => {
                    let msg = self.expect_message().await?;
                    match msg.name.as_str() {
                        DATA_FOUND => ReadState::ReadingHeader(msg),
                        RESTARTED => {
                            debug!(self.log, "request restarted");
                            ReadState::WaitingForResponse
                        }
                        _ => return Err(unexpected(&msg, DATA_FOUND)),
                    }
                }
                ReadState::ReadingHeader(msg) => {
                    let total: u64 = msg.require_hex("DataLength")?;
                    let metadata_len: u64 = msg.hex_field("MetadataLength")?.unwrap_or(0);
                    if metadata_len > total {
                        return Err(FcpError::protocol(
                            "MetadataLength exceeds DataLength",
                        ));
                    }
                    self.pending.clear();
                    ReadState::ReadingMetadata {
                        metadata_len,
                        data_len: total - metadata_len,
                    }
                }
                ReadState::ReadingMetadata {
                    metadata_len,
                    data_len,
                } => match self.read_payload(metadata_len).await? {
                    Some(metadata) => ReadState::ReadingData { metadata, data_len },
                    None => ReadState::Restarted {
                        metadata_len,
                        data_len,
                    },
                },
                ReadState::ReadingData { metadata, data_len } => {
                    match self.read_payload(data_len).await? {
                        Some(data) => return Ok(KeyData { metadata, data }),
                        None => ReadState::Restarted {
                            metadata_len: metadata.len() as u64,
                            data_len,
                        },
                    }
                }
                ReadState::Restarted {
                    metadata_len,
                    data_len,
                } => {
                    debug!(self.log, "payload restarted");
                    let msg = self.expect_message().await?;
                    match msg.name.as_str() {
                        DATA_FOUND => ReadState::ReadingHeader(msg),
                        DATA_CHUNK => {
                            if let ChunkEvent::Data(data) = self.chunk_event(msg).await? {
                                self.pending.extend_from_slice(&data);
                            }
                            ReadState::ReadingMetadata {
                                metadata_len,
                                data_len,
                            }
                        }
                        RESTARTED => ReadState::Restarted {
                            metadata_len,
                            data_len,
                        },
                        _ => return Err(unexpected(&msg, DATA_CHUNK)),
                    }
                }
            }
        }
    }
}

/// Fields of the node's `NodeHello`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub fields: FieldMap,
}

impl NodeInfo {
    pub fn node(&self) -> Option<&str> {
        self.fields.get("Node").map(String::as_str)
    }

    pub fn protocol(&self) -> Option<&str> {
        self.fields.get("Protocol").map(String::as_str)
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.fields
            .get("MaxFileSize")
            .and_then(|v| parse_hex(v).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

/// The two regions of a retrieved key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyData {
    pub metadata: Bytes,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutcome {
    Success(KeyData),
    MetadataHint { hint: MetadataHint, key: KeyData },
}

impl GetOutcome {
    pub fn key(&self) -> &KeyData {
        match self {
            GetOutcome::Success(key) => key,
            GetOutcome::MetadataHint { key, .. } => key,
        }
    }

    pub fn into_key(self) -> KeyData {
        match self {
            GetOutcome::Success(key) => key,
            GetOutcome::MetadataHint { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetRequest {
    pub hops_to_live: u32,
    pub metadata_hint: bool,
    /// Time at which the node should evaluate date redirects.
    pub redirect_time: Option<DateTime<Utc>>,
    pub flags: Option<u32>,
}

impl GetRequest {
    pub fn new(hops_to_live: u32) -> GetRequest {
        GetRequest {
            hops_to_live,
            metadata_hint: false,
            redirect_time: None,
            flags: None,
        }
    }

    pub fn with_hint(mut self, redirect_time: DateTime<Utc>) -> GetRequest {
        self.metadata_hint = true;
        self.redirect_time = Some(redirect_time);
        self
    }

    pub fn with_flags(mut self, flags: u32) -> GetRequest {
        self.flags = Some(flags);
        self
    }

    fn to_message(&self, uri: &KeyUri) -> FcpMessage {
        let mut msg = FcpMessage::new(CLIENT_GET)
            .with_field("URI", uri)
            .with_hex("HopsToLive", self.hops_to_live);
        if self.metadata_hint {
            msg = msg.with_field("MetadataHint", "true");
            if let Some(when) = self.redirect_time {
                msg = msg.with_field("RedirectTimeSec", metadata::redirect_time_sec(when));
            }
        }
        if let Some(flags) = self.flags {
            msg = msg.with_hex("Flags", flags);
        }
        msg
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub uri: KeyUri,
    /// The node already held this key.  The returned URI is still valid.
    pub collision: bool,
    pub public_key: Option<String>,
    pub private_key: Option<String>,
}

/// Client for one FCP node.  Cloning is cheap; clones share the worker pool
/// that bounds concurrent block operations.
#[derive(Clone)]
pub struct FcpClient {
    config: Arc<ClientConfig>,
    pool: Arc<Semaphore>,
    log: Logger,
}

impl FcpClient {
    pub fn new(config: ClientConfig, log: Option<&Logger>) -> Result<FcpClient> {
        config.validate()?;

        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = log.new(o!("node" => config.address()));

        Ok(FcpClient {
            pool: Arc::new(Semaphore::new(config.max_workers)),
            config: Arc::new(config),
            log,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn pool(&self) -> Arc<Semaphore> {
        Arc::clone(&self.pool)
    }

    pub async fn connect(&self) -> Result<Connection> {
        Connection::connect(&self.config.host, self.config.port, &self.log).await
    }

    pub async fn hello(&self) -> Result<NodeInfo> {
        let mut conn = self.connect().await?;
        conn.send(FcpMessage::new(CLIENT_HELLO)).await?;

        let msg = conn.expect_message().await?;
        if !msg.is(NODE_HELLO) {
            return Err(unexpected(&msg, NODE_HELLO));
        }
        Ok(NodeInfo { fields: msg.fields })
    }

    /// Ask the node for a fresh key pair for signed key inserts.
    pub async fn gen_key_pair(&self) -> Result<KeyPair> {
        let mut conn = self.connect().await?;
        conn.send(FcpMessage::new(GENERATE_SVK_PAIR)).await?;

        let msg = conn.expect_message().await?;
        if !msg.is(SUCCESS) {
            return Err(unexpected(&msg, SUCCESS));
        }
        Ok(KeyPair {
            public_key: msg.require("PublicKey")?.to_string(),
            private_key: msg.require("PrivateKey")?.to_string(),
        })
    }

    /// The CHK the node would assign to this metadata and data.
    pub async fn generate_chk(&self, metadata: &Bytes, data: &Bytes) -> Result<KeyUri> {
        let mut msg = FcpMessage::new(GENERATE_CHK)
            .with_hex("DataLength", metadata.len() + data.len())
            .with_data();
        if !metadata.is_empty() {
            msg = msg.with_hex("MetadataLength", metadata.len());
        }

        let mut conn = self.connect().await?;
        conn.send_request(msg, &[metadata, data]).await?;

        let msg = conn.expect_message().await?;
        if !msg.is(SUCCESS) {
            return Err(unexpected(&msg, SUCCESS));
        }
        Ok(KeyUri::new(msg.require("URI")?))
    }

    pub async fn get(&self, uri: &KeyUri, request: &GetRequest) -> Result<GetOutcome> {
        let mut conn = self.connect().await?;
        conn.send(request.to_message(uri)).await?;

        let key = conn.receive_key().await?;
        debug!(self.log, "retrieved key"; "uri" => %uri,
            "metadata_len" => key.metadata.len(), "data_len" => key.data.len());
        if !request.metadata_hint {
            return Ok(GetOutcome::Success(key));
        }

        let msg = conn.expect_message().await?;
        if !msg.is(METADATA_HINT) {
            return Err(unexpected(&msg, METADATA_HINT));
        }
        Ok(GetOutcome::MetadataHint {
            hint: MetadataHint::from_message(&msg)?,
            key,
        })
    }

    pub async fn put(
        &self,
        uri: &KeyUri,
        hops_to_live: u32,
        metadata: &Bytes,
        data: &Bytes,
        flags: Option<u32>,
    ) -> Result<PutOutcome> {
        let mut msg = FcpMessage::new(CLIENT_PUT)
            .with_field("URI", uri)
            .with_hex("HopsToLive", hops_to_live)
            .with_hex("DataLength", metadata.len() + data.len())
            .with_data();
        if !metadata.is_empty() {
            msg = msg.with_hex("MetadataLength", metadata.len());
        }
        if let Some(flags) = flags {
            msg = msg.with_hex("Flags", flags);
        }

        let mut conn = self.connect().await?;
        conn.send_request(msg, &[metadata, data]).await?;

        loop {
            let msg = conn.expect_message().await?;
            match msg.name.as_str() {
                PENDING => continue,
                RESTARTED => {
                    debug!(self.log, "insert restarted"; "uri" => %uri);
                    continue;
                }
                SUCCESS | KEY_COLLISION => {
                    let inserted = match msg.field("URI") {
                        Some(value) => KeyUri::new(value),
                        None if !uri.is_chk() => uri.clone(),
                        None => return Err(FcpError::protocol("insert result has no URI")),
                    };
                    let collision = msg.is(KEY_COLLISION);
                    if collision {
                        debug!(self.log, "key collision"; "uri" => %inserted);
                    }
                    return Ok(PutOutcome {
                        uri: inserted,
                        collision,
                        public_key: msg.field("PublicKey").map(String::from),
                        private_key: msg.field("PrivateKey").map(String::from),
                    });
                }
                _ => return Err(unexpected(&msg, SUCCESS)),
            }
        }
    }

    /// Probe whether a key can be fetched.  Never fails: connection and
    /// protocol errors count as "not there".
    pub async fn key_exists(&self, uri: &KeyUri, hops_to_live: u32) -> bool {
        match self.probe_key(uri, hops_to_live).await {
            Ok(found) => found,
            Err(e) => {
                debug!(self.log, "key probe failed"; "uri" => %uri, "error" => %e);
                false
            }
        }
    }

    async fn probe_key(&self, uri: &KeyUri, hops_to_live: u32) -> Result<bool> {
        let mut conn = self.connect().await?;
        conn.send(GetRequest::new(hops_to_live).to_message(uri)).await?;

        loop {
            match conn.read_message().await? {
                Some(ref msg) if msg.is(RESTARTED) => continue,
                Some(ref msg) if msg.is(DATA_FOUND) => return Ok(true),
                _ => return Ok(false),
            }
        }
    }
}
