// Copyright 2020 Joyent, Inc.

//! An in-process FCP node for integration tests.
//!
//! Keys live in memory.  CHKs are derived from a SHA-256 of the content,
//! FEC is a Reed-Solomon code over GF(2^8), and payloads are sent back in
//! small chunks that never line up with block or region boundaries.  Tests
//! can make keys disappear, fail puts and make the node restart transfers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use reed_solomon_erasure::galois_8::ReedSolomon;
use sha2::{Digest, Sha256};
use slog::{debug, info, o, Drain, Level, LevelFilter, Logger};
use tokio::net::TcpListener;

use fcp_client::error::{FcpError, Result};
use fcp_client::fec::SegmentHeader;
use fcp_client::protocol::*;
use fcp_client::server::{self, NodeRequest};
use fcp_client::{ClientConfig, FcpClient, KeyUri};

const SPLITFILE_DOCUMENT: &str = "SplitFile";
const MAX_SMALL_KEY: usize = 32768;

pub fn test_logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub block_size: u64,
    pub blocks_per_segment: u64,
    /// Check blocks per segment, as a percentage of its data blocks.
    pub check_percent: u64,
    pub chunk_size: usize,
    /// How long the node spends on each put and get.
    pub op_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            block_size: 32768,
            blocks_per_segment: 160,
            check_percent: 25,
            chunk_size: 1000,
            op_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Stored {
    metadata: Bytes,
    data: Bytes,
}

#[derive(Default)]
struct NodeState {
    store: HashMap<String, Stored>,
    lost: HashSet<String>,
    block_uris: Vec<String>,
    puts: usize,
    gets: usize,
    failing_puts: usize,
    restarting_gets: usize,
    hiding_puts: usize,
    hidden: HashSet<String>,
    in_flight: usize,
    peak_in_flight: usize,
    redirect_times: Vec<String>,
}

pub struct MockNode {
    pub port: u16,
    config: NodeConfig,
    state: Arc<Mutex<NodeState>>,
}

impl MockNode {
    pub async fn start(config: NodeConfig) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind");
        let port = listener.local_addr().expect("no local address").port();
        let state = Arc::new(Mutex::new(NodeState::default()));

        let log = test_logger();
        info!(log, "listening for fcp requests"; "port" => port);

        let node_state = Arc::clone(&state);
        let node_config = config.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&node_state);
                let config = node_config.clone();
                let process_log = log.clone();
                tokio::spawn(async move {
                    let handler = move |req: &NodeRequest, log: &Logger| {
                        handle(&state, &config, req, log)
                    };
                    server::make_task(stream, handler, Some(&process_log)).await;
                });
            }
        });

        MockNode {
            port,
            config,
            state,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("127.0.0.1", self.port);
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 50;
        config
    }

    pub fn client(&self) -> FcpClient {
        FcpClient::new(self.client_config(), Some(&test_logger())).expect("bad client config")
    }

    /// Make keys unfetchable.
    pub fn lose<'a, I: IntoIterator<Item = &'a String>>(&self, uris: I) {
        let mut state = self.state.lock().unwrap();
        for uri in uris {
            state.lost.insert(uri.clone());
        }
    }

    /// URIs of everything inserted with the delete-local flag, i.e. splitfile
    /// blocks, in insertion order.
    pub fn block_uris(&self) -> Vec<String> {
        self.state.lock().unwrap().block_uris.clone()
    }

    pub fn put_count(&self) -> usize {
        self.state.lock().unwrap().puts
    }

    pub fn get_count(&self) -> usize {
        self.state.lock().unwrap().gets
    }

    /// Answer the next `n` puts with `RouteNotFound`.
    pub fn fail_puts(&self, n: usize) {
        self.state.lock().unwrap().failing_puts = n;
    }

    /// Restart the payload transfer of the next `n` gets half way through.
    pub fn restart_gets(&self, n: usize) {
        self.state.lock().unwrap().restarting_gets = n;
    }

    /// Store the next `n` puts without making them fetchable.  A later put
    /// of the same key makes it fetchable again.
    pub fn hide_puts(&self, n: usize) {
        self.state.lock().unwrap().hiding_puts = n;
    }

    /// Most puts and gets that were being served at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().unwrap().peak_in_flight
    }

    /// `RedirectTimeSec` of every get that asked for one, in arrival order.
    pub fn redirect_times(&self) -> Vec<String> {
        self.state.lock().unwrap().redirect_times.clone()
    }

    pub fn contains(&self, uri: &KeyUri) -> bool {
        self.state.lock().unwrap().store.contains_key(uri.as_str())
    }
}

pub fn chk_of(metadata: &[u8], data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((metadata.len() as u64).to_be_bytes());
    hasher.update(metadata);
    hasher.update(data);
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("CHK@{}", hex)
}

fn message(frames: &mut Vec<FcpFrame>, msg: FcpMessage) {
    frames.push(FcpFrame::Message(msg));
}

fn failure(name: &str, reason: &str) -> Result<Vec<FcpFrame>> {
    Ok(vec![FcpFrame::Message(
        FcpMessage::new(name).with_field("Reason", reason),
    )])
}

fn payload_message(name: &str, payload: &Bytes, config: &NodeConfig) -> Vec<FcpFrame> {
    let mut frames = vec![];
    message(
        &mut frames,
        FcpMessage::new(name).with_hex("DataLength", payload.len()),
    );
    frames.extend(server::data_chunks(payload, config.chunk_size));
    frames
}

fn handle(
    state: &Mutex<NodeState>,
    config: &NodeConfig,
    req: &NodeRequest,
    log: &Logger,
) -> Result<Vec<FcpFrame>> {
    debug!(log, "mock node request"; "name" => &req.message.name);

    match req.message.name.as_str() {
        CLIENT_HELLO => Ok(vec![FcpFrame::Message(
            FcpMessage::new(NODE_HELLO)
                .with_field("Node", "Fred,0.5,1.46,7000")
                .with_field("Protocol", "1.2")
                .with_hex("MaxFileSize", 0x7fff_ffffu64),
        )]),
        GENERATE_SVK_PAIR => Ok(vec![FcpFrame::Message(
            FcpMessage::new(SUCCESS)
                .with_field("PublicKey", "pubkey-0")
                .with_field("PrivateKey", "privkey-0"),
        )]),
        GENERATE_CHK => Ok(vec![FcpFrame::Message(
            FcpMessage::new(SUCCESS).with_field("URI", chk_of(&req.metadata()?, &req.data()?)),
        )]),
        CLIENT_PUT => tracked(state, config, || handle_put(state, req)),
        CLIENT_GET => tracked(state, config, || handle_get(state, config, req)),
        FEC_SEGMENT_FILE => segment_file(config, req),
        FEC_ENCODE_SEGMENT => encode_segment(config, req),
        FEC_DECODE_SEGMENT => decode_segment(config, req),
        FEC_MAKE_METADATA => make_metadata(config, req),
        FEC_SEGMENT_SPLIT_FILE => segment_split_file(req),
        _ => failure("Failed", "unknown request"),
    }
}

/// Run a put or get, counting it as in flight for `op_delay_ms`.
fn tracked<F>(state: &Mutex<NodeState>, config: &NodeConfig, op: F) -> Result<Vec<FcpFrame>>
where
    F: FnOnce() -> Result<Vec<FcpFrame>>,
{
    {
        let mut state = state.lock().unwrap();
        state.in_flight += 1;
        state.peak_in_flight = std::cmp::max(state.peak_in_flight, state.in_flight);
    }
    if config.op_delay_ms > 0 {
        std::thread::sleep(std::time::Duration::from_millis(config.op_delay_ms));
    }
    let result = op();
    state.lock().unwrap().in_flight -= 1;
    result
}

fn handle_put(state: &Mutex<NodeState>, req: &NodeRequest) -> Result<Vec<FcpFrame>> {
    let metadata = req.metadata()?;
    let data = req.data()?;
    let target = KeyUri::new(req.message.require("URI")?);
    let flags: u32 = req.message.hex_field("Flags")?.unwrap_or(0);

    let mut state = state.lock().unwrap();
    if state.failing_puts > 0 {
        state.failing_puts -= 1;
        return failure("RouteNotFound", "no route");
    }
    state.puts += 1;

    let uri = if target.is_chk() {
        chk_of(&metadata, &data)
    } else if metadata.len() + data.len() > MAX_SMALL_KEY {
        return failure("SizeError", "key too large");
    } else {
        target.render()
    };

    let mut frames = vec![];
    message(&mut frames, FcpMessage::new(PENDING).with_hex("Timeout", 1000));
    let name = if state.store.contains_key(&uri) {
        KEY_COLLISION
    } else {
        SUCCESS
    };
    if flags & FLAG_DELETE_LOCAL != 0 && !state.block_uris.contains(&uri) {
        state.block_uris.push(uri.clone());
    }
    state.lost.remove(&uri);
    if state.hiding_puts > 0 {
        state.hiding_puts -= 1;
        state.hidden.insert(uri.clone());
    } else {
        state.hidden.remove(&uri);
    }
    state.store.insert(uri.clone(), Stored { metadata, data });
    message(&mut frames, FcpMessage::new(name).with_field("URI", uri));
    Ok(frames)
}

fn handle_get(
    state: &Mutex<NodeState>,
    config: &NodeConfig,
    req: &NodeRequest,
) -> Result<Vec<FcpFrame>> {
    let uri = KeyUri::new(req.message.require("URI")?).render();

    let redirect_time = req.message.field("RedirectTimeSec").map(String::from);

    let mut state = state.lock().unwrap();
    state.gets += 1;
    if let Some(time) = &redirect_time {
        state.redirect_times.push(time.clone());
    }
    let stored = match state.store.get(&uri) {
        Some(stored) if !state.lost.contains(&uri) && !state.hidden.contains(&uri) => {
            stored.clone()
        }
        _ => return failure("DataNotFound", "not in store"),
    };
    let restart = state.restarting_gets > 0;
    if restart {
        state.restarting_gets -= 1;
    }
    drop(state);

    let mut payload = BytesMut::with_capacity(stored.metadata.len() + stored.data.len());
    payload.put_slice(&stored.metadata);
    payload.put_slice(&stored.data);
    let payload = payload.freeze();

    let mut found = FcpMessage::new(DATA_FOUND).with_hex("DataLength", payload.len());
    if !stored.metadata.is_empty() {
        found = found.with_hex("MetadataLength", stored.metadata.len());
    }

    let mut frames = vec![];
    if restart {
        message(&mut frames, found.clone());
        frames.extend(server::data_chunks(
            &payload.slice(..payload.len() / 2),
            config.chunk_size,
        ));
        frames.push(server::restarted());
    }
    message(&mut frames, found);
    frames.extend(server::data_chunks(&payload, config.chunk_size));

    if req.message.field("MetadataHint") == Some("true") {
        message(&mut frames, metadata_hint(&stored.metadata, redirect_time.as_deref()));
    }
    Ok(frames)
}

fn metadata_hint(metadata: &[u8], redirect_time: Option<&str>) -> FcpMessage {
    let text = String::from_utf8_lossy(metadata);
    let field = |prefix: &str| text.lines().find_map(|l| l.strip_prefix(prefix)).map(String::from);

    let hint = match redirect_time {
        Some(time) => FcpMessage::new(METADATA_HINT).with_field("TimeSec", time),
        None => FcpMessage::new(METADATA_HINT),
    };
    if text.starts_with(SPLITFILE_DOCUMENT) {
        let hint = hint.with_field("Kind", "4");
        match field("MimeType=") {
            Some(mime_type) => hint.with_field("MimeType", mime_type),
            None => hint,
        }
    } else if let Some(target) = field("Redirect.Target=") {
        hint.with_field("Kind", "2").with_field("NextURI", target)
    } else if let Some(target) = field("DateRedirect.Target=") {
        hint.with_field("Kind", "3")
            .with_field("NextURI", target)
            .with_field(
                "Increment",
                field("DateRedirect.Increment=").unwrap_or_else(|| String::from("15180")),
            )
            .with_field(
                "Offset",
                field("DateRedirect.Offset=").unwrap_or_else(|| String::from("0")),
            )
    } else {
        let hint = hint.with_field("Kind", "1");
        match field("Info.Format=") {
            Some(mime_type) => hint.with_field("MimeType", mime_type),
            None => hint,
        }
    }
}

fn segment_file(config: &NodeConfig, req: &NodeRequest) -> Result<Vec<FcpFrame>> {
    let file_length: u64 = req.message.require_hex("FileLength")?;
    let segment_bytes = config.block_size * config.blocks_per_segment;
    let segments = std::cmp::max(1, (file_length + segment_bytes - 1) / segment_bytes);

    let mut frames = vec![];
    for segment in 0..segments {
        let offset = segment * segment_bytes;
        let len = std::cmp::min(segment_bytes, file_length - offset);
        let block_count = std::cmp::max(1, (len + config.block_size - 1) / config.block_size);
        let check_count = std::cmp::max(1, block_count * config.check_percent / 100);
        message(
            &mut frames,
            FcpMessage::new(SEGMENT_HEADER)
                .with_field("FECAlgorithm", req.message.require("AlgoName")?)
                .with_hex("SegmentNum", segment)
                .with_hex("Segments", segments)
                .with_hex("BlockCount", block_count)
                .with_hex("BlockSize", config.block_size)
                .with_hex("CheckBlockCount", check_count)
                .with_hex("CheckBlockSize", config.block_size)
                .with_hex("BlocksRequired", block_count)
                .with_hex("FileLength", file_length)
                .with_hex("Offset", offset),
        );
    }
    Ok(frames)
}

fn request_header(req: &NodeRequest) -> Result<SegmentHeader> {
    let metadata = req.metadata()?;
    let (msg, _) = FcpMessage::parse(&metadata)?
        .ok_or_else(|| FcpError::protocol("no segment header in metadata"))?;
    SegmentHeader::from_message(&msg)
}

fn codec(header: &SegmentHeader) -> Result<ReedSolomon> {
    ReedSolomon::new(header.block_count, header.check_block_count)
        .map_err(|e| FcpError::Protocol(format!("bad FEC parameters: {:?}", e)))
}

fn encode_segment(config: &NodeConfig, req: &NodeRequest) -> Result<Vec<FcpFrame>> {
    let header = request_header(req)?;
    let data = req.data()?;
    if data.len() as u64 != header.padded_length() {
        return failure("FormatError", "segment is not padded");
    }

    let block_size = header.block_size as usize;
    let mut shards: Vec<Vec<u8>> = data.chunks(block_size).map(|c| c.to_vec()).collect();
    shards.extend((0..header.check_block_count).map(|_| vec![0u8; block_size]));
    codec(&header)?
        .encode(&mut shards)
        .map_err(|e| FcpError::Protocol(format!("encode failed: {:?}", e)))?;

    let mut checks = BytesMut::new();
    for shard in &shards[header.block_count..] {
        checks.put_slice(shard);
    }
    let checks = checks.freeze();

    let mut frames = vec![];
    message(
        &mut frames,
        FcpMessage::new(BLOCKS_ENCODED)
            .with_hex("BlockCount", header.check_block_count)
            .with_hex("BlockSize", header.check_block_size),
    );
    frames.extend(server::data_chunks(&checks, config.chunk_size));
    Ok(frames)
}

fn decode_segment(config: &NodeConfig, req: &NodeRequest) -> Result<Vec<FcpFrame>> {
    let header = request_header(req)?;
    let data = req.data()?;
    let blocks = parse_hex_list(req.message.require("BlockList")?)?;
    let checks = parse_hex_list(req.message.require("CheckList")?)?;
    let requested = parse_hex_list(req.message.require("RequestedList")?)?;

    let block_size = header.block_size as usize;
    if data.len() != (blocks.len() + checks.len()) * block_size {
        return failure("FormatError", "wrong number of blocks");
    }

    let mut shards: Vec<Option<Vec<u8>>> = vec![None; header.total_blocks()];
    for (index, block) in blocks.iter().chain(checks.iter()).zip(data.chunks(block_size)) {
        match shards.get_mut(*index) {
            Some(shard) => *shard = Some(block.to_vec()),
            None => return failure("FormatError", "block index out of range"),
        }
    }
    codec(&header)?
        .reconstruct_data(&mut shards)
        .map_err(|e| FcpError::Protocol(format!("decode failed: {:?}", e)))?;

    let mut decoded = BytesMut::new();
    for index in requested {
        match shards.get(index) {
            Some(Some(shard)) => decoded.put_slice(shard),
            _ => return failure("FormatError", "requested block out of range"),
        }
    }
    let decoded = decoded.freeze();

    let mut frames = vec![];
    message(&mut frames, FcpMessage::new(BLOCKS_DECODED));
    frames.extend(server::data_chunks(&decoded, config.chunk_size));
    Ok(frames)
}

fn make_metadata(config: &NodeConfig, req: &NodeRequest) -> Result<Vec<FcpFrame>> {
    let mut doc = FcpMessage::new(SPLITFILE_DOCUMENT)
        .with_field("Segments", req.message.require("Segments")?);
    for field in &["Description", "MimeType"] {
        if let Some(value) = req.message.field(field) {
            doc = doc.with_field(*field, value);
        }
    }

    let mut metadata = BytesMut::new();
    doc.encode(&mut metadata);
    metadata.put_slice(&req.payload);
    Ok(payload_message(MADE_METADATA, &metadata.freeze(), config))
}

fn segment_split_file(req: &NodeRequest) -> Result<Vec<FcpFrame>> {
    let mut rest = &req.payload[..];
    let mut frames = vec![];
    while let Some((msg, consumed)) = FcpMessage::parse(rest)? {
        rest = &rest[consumed..];
        if msg.is(SPLITFILE_DOCUMENT) {
            continue;
        }
        frames.push(FcpFrame::Message(msg));
    }
    if frames.is_empty() {
        return failure("FormatError", "not a splitfile");
    }
    Ok(frames)
}
