// Copyright 2020 Joyent, Inc.

//! Requests to the node's FEC service.
//!
//! The node does the segmenting, encoding and decoding; the client only
//! moves bytes.  A file is split into segments described by a
//! `SegmentHeader`.  Every segment has `BlockCount` data blocks and
//! `CheckBlockCount` check blocks, and any `BlocksRequired` of them are
//! enough to rebuild the segment.  Data and check blocks share one index
//! space on the wire: check block `i` is index `BlockCount + i`.

use std::cmp;

use bytes::{BufMut, Bytes, BytesMut};
use slog::{debug, info};

use crate::client::{unexpected, FcpClient};
use crate::error::{FcpError, Result};
use crate::protocol::*;
use crate::uri::KeyUri;

const HEADER_FIELDS: &[&str] = &[
    "SegmentNum",
    "Segments",
    "BlockCount",
    "BlockSize",
    "CheckBlockCount",
    "CheckBlockSize",
    "BlocksRequired",
    "FileLength",
    "Offset",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_num: u64,
    pub segments: u64,
    pub block_count: usize,
    pub block_size: u64,
    pub check_block_count: usize,
    pub check_block_size: u64,
    pub blocks_required: usize,
    pub file_length: u64,
    pub offset: u64,
    /// Fields the client does not interpret, such as the algorithm name.
    /// They are sent back to the node unchanged.
    pub extra: FieldMap,
}

impl SegmentHeader {
    pub fn from_message(msg: &FcpMessage) -> Result<SegmentHeader> {
        if !msg.is(SEGMENT_HEADER) {
            return Err(unexpected(msg, SEGMENT_HEADER));
        }

        let extra = msg
            .fields
            .iter()
            .filter(|(k, _)| !HEADER_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let header = SegmentHeader {
            segment_num: msg.require_hex("SegmentNum")?,
            segments: msg.require_hex("Segments")?,
            block_count: msg.require_hex("BlockCount")?,
            block_size: msg.require_hex("BlockSize")?,
            check_block_count: msg.require_hex("CheckBlockCount")?,
            check_block_size: msg.require_hex("CheckBlockSize")?,
            blocks_required: msg.require_hex("BlocksRequired")?,
            file_length: msg.require_hex("FileLength")?,
            offset: msg.require_hex("Offset")?,
            extra,
        };

        if header.blocks_required == 0
            || header.blocks_required > header.block_count + header.check_block_count
        {
            return Err(FcpError::Protocol(format!(
                "segment {}: BlocksRequired {} outside 1..={}",
                header.segment_num,
                header.blocks_required,
                header.block_count + header.check_block_count
            )));
        }
        if header.segment_num >= header.segments || header.offset > header.file_length {
            return Err(FcpError::Protocol(format!(
                "segment {} of {} at offset {} does not fit a {} byte file",
                header.segment_num, header.segments, header.offset, header.file_length
            )));
        }

        Ok(header)
    }

    pub fn to_message(&self) -> FcpMessage {
        let mut msg = FcpMessage::new(SEGMENT_HEADER)
            .with_hex("SegmentNum", self.segment_num)
            .with_hex("Segments", self.segments)
            .with_hex("BlockCount", self.block_count)
            .with_hex("BlockSize", self.block_size)
            .with_hex("CheckBlockCount", self.check_block_count)
            .with_hex("CheckBlockSize", self.check_block_size)
            .with_hex("BlocksRequired", self.blocks_required)
            .with_hex("FileLength", self.file_length)
            .with_hex("Offset", self.offset);
        for (k, v) in &self.extra {
            msg.fields.insert(k.clone(), v.clone());
        }
        msg
    }

    pub fn is_final(&self) -> bool {
        self.segment_num + 1 == self.segments
    }

    /// Bytes of the file covered by this segment.
    pub fn segment_length(&self) -> u64 {
        let remaining = self.file_length - self.offset;
        if self.is_final() {
            remaining
        } else {
            cmp::min(remaining, self.padded_length())
        }
    }

    /// Length of the segment as the encoder sees it, zero padded.
    pub fn padded_length(&self) -> u64 {
        self.block_count as u64 * self.block_size
    }

    pub fn total_blocks(&self) -> usize {
        self.block_count + self.check_block_count
    }
}

/// The keys a segment's blocks were inserted under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    pub blocks: Vec<KeyUri>,
    pub checks: Vec<KeyUri>,
}

impl BlockMap {
    pub fn from_message(msg: &FcpMessage) -> Result<BlockMap> {
        if !msg.is(BLOCK_MAP) {
            return Err(unexpected(msg, BLOCK_MAP));
        }

        let mut blocks = vec![];
        let mut checks = vec![];
        for (key, value) in &msg.fields {
            let (list, index) = if let Some(index) = key.strip_prefix("Block.") {
                (&mut blocks, index)
            } else if let Some(index) = key.strip_prefix("Check.") {
                (&mut checks, index)
            } else {
                continue;
            };
            let index: usize = parse_hex(index)?;
            list.push((index, KeyUri::new(value.as_str())));
        }

        Ok(BlockMap {
            blocks: contiguous(blocks, "Block")?,
            checks: contiguous(checks, "Check")?,
        })
    }

    pub fn to_message(&self) -> FcpMessage {
        let mut msg = FcpMessage::new(BLOCK_MAP);
        for (i, uri) in self.blocks.iter().enumerate() {
            msg = msg.with_field(format!("Block.{:x}", i), uri);
        }
        for (i, uri) in self.checks.iter().enumerate() {
            msg = msg.with_field(format!("Check.{:x}", i), uri);
        }
        msg
    }

    /// Key for an index in the combined data+check index space.
    pub fn key(&self, index: usize) -> Option<&KeyUri> {
        if index < self.blocks.len() {
            self.blocks.get(index)
        } else {
            self.checks.get(index - self.blocks.len())
        }
    }

    pub fn matches(&self, header: &SegmentHeader) -> bool {
        self.blocks.len() == header.block_count && self.checks.len() == header.check_block_count
    }
}

fn contiguous(mut entries: Vec<(usize, KeyUri)>, kind: &str) -> Result<Vec<KeyUri>> {
    entries.sort_by_key(|(i, _)| *i);
    for (expected, (index, _)) in entries.iter().enumerate() {
        if *index != expected {
            return Err(FcpError::Protocol(format!(
                "block map has no {}.{:x}",
                kind, expected
            )));
        }
    }
    Ok(entries.into_iter().map(|(_, uri)| uri).collect())
}

/// Zero pad a segment's data to `BlockCount * BlockSize` bytes.
pub fn pad_segment(header: &SegmentHeader, data: &Bytes) -> Result<Bytes> {
    let padded_len = header.padded_length() as usize;
    if data.len() > padded_len {
        return Err(FcpError::Protocol(format!(
            "segment {} holds {} bytes, got {}",
            header.segment_num,
            padded_len,
            data.len()
        )));
    }
    if data.len() == padded_len {
        return Ok(data.clone());
    }

    let mut buf = BytesMut::with_capacity(padded_len);
    buf.put_slice(data);
    buf.put_bytes(0, padded_len - data.len());
    Ok(buf.freeze())
}

/// Blocks handed to `decode_segment`, with their indices.  Check indices
/// are relative to the first check block.
#[derive(Debug, Clone, Default)]
pub struct KnownBlocks {
    pub data_indices: Vec<usize>,
    pub data: Vec<Bytes>,
    pub check_indices: Vec<usize>,
    pub checks: Vec<Bytes>,
}

impl FcpClient {
    /// Ask the node how a file of `file_length` bytes is segmented.
    pub async fn segment_file(&self, algorithm: &str, file_length: u64) -> Result<Vec<SegmentHeader>> {
        let msg = FcpMessage::new(FEC_SEGMENT_FILE)
            .with_field("AlgoName", algorithm)
            .with_hex("FileLength", file_length);

        let mut conn = self.connect().await?;
        conn.send(msg).await?;

        let first = SegmentHeader::from_message(&conn.expect_message().await?)?;
        let segments = first.segments;
        let mut headers = vec![first];
        while (headers.len() as u64) < segments {
            let msg = conn.expect_message().await?;
            headers.push(SegmentHeader::from_message(&msg)?);
        }

        debug!(self.log(), "segmented file"; "file_length" => file_length,
            "segments" => headers.len());
        Ok(headers)
    }

    /// Recover the headers and block maps of a splitfile from its metadata.
    pub async fn segment_split_file(
        &self,
        metadata: &Bytes,
    ) -> Result<(Vec<SegmentHeader>, Vec<BlockMap>)> {
        let msg = FcpMessage::new(FEC_SEGMENT_SPLIT_FILE)
            .with_hex("DataLength", metadata.len())
            .with_data();

        let mut conn = self.connect().await?;
        conn.send_request(msg, &[metadata]).await?;

        let mut headers: Vec<SegmentHeader> = vec![];
        let mut maps = vec![];
        loop {
            let header = SegmentHeader::from_message(&conn.expect_message().await?)?;
            let map = BlockMap::from_message(&conn.expect_message().await?)?;
            if !map.matches(&header) {
                return Err(FcpError::Protocol(format!(
                    "block map for segment {} does not match its header",
                    header.segment_num
                )));
            }
            let segments = header.segments;
            headers.push(header);
            maps.push(map);
            if headers.len() as u64 >= segments {
                break;
            }
        }

        Ok((headers, maps))
    }

    /// Compute the check blocks for one segment.  `data` is the segment's
    /// part of the file; it is zero padded here to the full segment length.
    pub async fn encode_segment(&self, header: &SegmentHeader, data: &Bytes) -> Result<Vec<Bytes>> {
        let padded = pad_segment(header, data)?;
        let header_bytes = header.to_message().to_bytes();
        let msg = FcpMessage::new(FEC_ENCODE_SEGMENT)
            .with_hex("DataLength", header_bytes.len() + padded.len())
            .with_hex("MetadataLength", header_bytes.len())
            .with_data();

        let mut conn = self.connect().await?;
        conn.send_request(msg, &[&header_bytes, &padded]).await?;

        let msg = conn.expect_message().await?;
        if !msg.is(BLOCKS_ENCODED) {
            return Err(unexpected(&msg, BLOCKS_ENCODED));
        }
        let checks = conn
            .read_blocks(header.check_block_count, header.check_block_size)
            .await?;

        info!(self.log(), "segment encoded"; "segment" => header.segment_num,
            "check_blocks" => checks.len());
        Ok(checks)
    }

    /// Rebuild the data blocks named in `requested` from the known blocks.
    /// The result holds one block of `BlockSize` bytes per requested index,
    /// in the order requested.
    pub async fn decode_segment(
        &self,
        header: &SegmentHeader,
        known: &KnownBlocks,
        requested: &[usize],
    ) -> Result<Vec<Bytes>> {
        if known.data.len() != known.data_indices.len()
            || known.checks.len() != known.check_indices.len()
        {
            return Err(FcpError::protocol("block indices do not match the blocks given"));
        }
        if let Some(block) = known
            .data
            .iter()
            .find(|b| b.len() as u64 != header.block_size)
        {
            return Err(FcpError::Protocol(format!(
                "data block of {} bytes in a segment of {} byte blocks",
                block.len(),
                header.block_size
            )));
        }
        if let Some(block) = known
            .checks
            .iter()
            .find(|b| b.len() as u64 != header.check_block_size)
        {
            return Err(FcpError::Protocol(format!(
                "check block of {} bytes in a segment of {} byte check blocks",
                block.len(),
                header.check_block_size
            )));
        }

        let shifted: Vec<usize> = known
            .check_indices
            .iter()
            .map(|i| i + header.block_count)
            .collect();
        let header_bytes = header.to_message().to_bytes();
        let blocks_len: usize = known
            .data
            .iter()
            .chain(known.checks.iter())
            .map(Bytes::len)
            .sum();

        let msg = FcpMessage::new(FEC_DECODE_SEGMENT)
            .with_hex("DataLength", header_bytes.len() + blocks_len)
            .with_hex("MetadataLength", header_bytes.len())
            .with_field("BlockList", hex_list(&known.data_indices))
            .with_field("CheckList", hex_list(&shifted))
            .with_field("RequestedList", hex_list(requested))
            .with_data();

        let mut payload = vec![&header_bytes];
        payload.extend(known.data.iter());
        payload.extend(known.checks.iter());

        let mut conn = self.connect().await?;
        conn.send_request(msg, &payload).await?;

        let msg = conn.expect_message().await?;
        if !msg.is(BLOCKS_DECODED) {
            return Err(unexpected(&msg, BLOCKS_DECODED));
        }
        conn.read_blocks(requested.len(), header.block_size).await
    }

    /// Have the node render the splitfile metadata document.
    pub async fn make_metadata(
        &self,
        headers: &[SegmentHeader],
        maps: &[BlockMap],
        description: &str,
        mime_type: Option<&str>,
    ) -> Result<Bytes> {
        if headers.len() != maps.len() {
            return Err(FcpError::protocol("one block map is needed per segment"));
        }

        let mut list = BytesMut::new();
        for (header, map) in headers.iter().zip(maps) {
            header.to_message().encode(&mut list);
            map.to_message().encode(&mut list);
        }
        let list = list.freeze();

        let mut msg = FcpMessage::new(FEC_MAKE_METADATA)
            .with_hex("Segments", headers.len())
            .with_hex("DataLength", list.len())
            .with_data();
        if !description.is_empty() {
            msg = msg.with_field("Description", description);
        }
        if let Some(mime_type) = mime_type {
            msg = msg.with_field("MimeType", mime_type);
        }

        let mut conn = self.connect().await?;
        conn.send_request(msg, &[&list]).await?;

        let msg = conn.expect_message().await?;
        if !msg.is(MADE_METADATA) {
            return Err(unexpected(&msg, MADE_METADATA));
        }
        let len: u64 = msg.require_hex("DataLength")?;
        conn.read_payload(len)
            .await?
            .ok_or_else(|| FcpError::protocol("node restarted metadata transfer"))
    }
}
