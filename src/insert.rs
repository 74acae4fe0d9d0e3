// Copyright 2020 Joyent, Inc.

//! Splitfile insertion.
//!
//! A file larger than a single key is segmented by the node, each segment is
//! encoded into check blocks, and every data and check block is inserted as
//! its own CHK.  Block inserts run as tasks, bounded by the client's worker
//! pool; each task hands its URI back to the segment's `BlockSlots`.  Once
//! all segments are inserted the node renders the splitfile metadata, which
//! is inserted under the caller's target URI.

use std::path::Path;

use bytes::Bytes;
use slog::{error, info};
use tokio::task::JoinSet;

use crate::client::FcpClient;
use crate::error::{FcpError, Result};
use crate::fec::{pad_segment, BlockMap, SegmentHeader};
use crate::metadata;
use crate::protocol::FLAG_DELETE_LOCAL;
use crate::uri::KeyUri;

#[derive(Debug, Clone, Default)]
pub struct SplitfileOptions {
    pub mime_type: Option<String>,
    /// Defaults to the client's configured description.
    pub description: Option<String>,
    /// Re-insert of content that may still be in the network: blocks whose
    /// CHK can already be fetched are not inserted again.
    pub refresh: bool,
}

/// The URIs of one segment's blocks, filled in as block inserts finish.
/// Indices are in the combined data+check index space.
#[derive(Debug)]
pub struct BlockSlots {
    blocks: Vec<Option<KeyUri>>,
    checks: Vec<Option<KeyUri>>,
}

impl BlockSlots {
    pub fn new(block_count: usize, check_block_count: usize) -> BlockSlots {
        BlockSlots {
            blocks: vec![None; block_count],
            checks: vec![None; check_block_count],
        }
    }

    pub fn fill(&mut self, index: usize, uri: KeyUri) -> Result<()> {
        let block_count = self.blocks.len();
        let slot = if index < block_count {
            self.blocks.get_mut(index)
        } else {
            self.checks.get_mut(index - block_count)
        }
        .ok_or_else(|| FcpError::Worker(format!("no block {} in segment", index)))?;

        if slot.is_some() {
            return Err(FcpError::Worker(format!("block {} inserted twice", index)));
        }
        *slot = Some(uri);
        Ok(())
    }

    pub fn missing(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .chain(self.checks.iter())
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .chain(self.checks.iter())
            .all(Option::is_some)
    }

    pub fn into_map(self) -> Result<BlockMap> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(FcpError::Worker(format!(
                "{} blocks were never inserted",
                missing.len()
            )));
        }

        Ok(BlockMap {
            blocks: self.blocks.into_iter().flatten().collect(),
            checks: self.checks.into_iter().flatten().collect(),
        })
    }
}

impl FcpClient {
    /// Insert `data`, choosing between a single key and a splitfile by size.
    pub async fn insert(&self, target: &KeyUri, data: Bytes, mime_type: Option<&str>) -> Result<KeyUri> {
        if data.len() > self.config().splitfile_threshold {
            let options = SplitfileOptions {
                mime_type: mime_type.map(String::from),
                ..SplitfileOptions::default()
            };
            return self.insert_splitfile(target, &data, &options).await;
        }

        let metadata = match mime_type {
            Some(mime_type) => metadata::simple_document(mime_type),
            None => Bytes::new(),
        };
        self.attempt_insert_redirecting(target, &metadata, &data)
            .await
    }

    pub async fn insert_file<P: AsRef<Path>>(
        &self,
        target: &KeyUri,
        path: P,
        mime_type: Option<&str>,
    ) -> Result<KeyUri> {
        let data = tokio::fs::read(path).await?;
        self.insert(target, Bytes::from(data), mime_type).await
    }

    pub async fn insert_splitfile(
        &self,
        target: &KeyUri,
        data: &Bytes,
        options: &SplitfileOptions,
    ) -> Result<KeyUri> {
        let config = self.config();
        let headers = self
            .segment_file(&config.fec_algorithm, data.len() as u64)
            .await?;

        let mut maps = Vec::with_capacity(headers.len());
        for header in &headers {
            let start = header.offset as usize;
            let end = start + header.segment_length() as usize;
            if end > data.len() {
                return Err(FcpError::Protocol(format!(
                    "segment {} ends at {}, past the end of the file",
                    header.segment_num, end
                )));
            }

            let segment = pad_segment(header, &data.slice(start..end))?;
            let checks = self.encode_segment(header, &segment).await?;
            let map = self
                .insert_segment(header, &segment, checks, options.refresh)
                .await?;
            info!(self.log(), "segment inserted"; "segment" => header.segment_num,
                "blocks" => header.total_blocks());
            maps.push(map);
        }

        let description = options
            .description
            .as_deref()
            .unwrap_or(config.description.as_str());
        let metadata = self
            .make_metadata(&headers, &maps, description, options.mime_type.as_deref())
            .await?;

        let uri = self
            .attempt_insert_redirecting(target, &metadata, &Bytes::new())
            .await?;
        info!(self.log(), "splitfile inserted"; "uri" => %uri, "segments" => headers.len());
        Ok(uri)
    }

    /// Insert every data and check block of a padded segment.
    async fn insert_segment(
        &self,
        header: &SegmentHeader,
        segment: &Bytes,
        checks: Vec<Bytes>,
        refresh: bool,
    ) -> Result<BlockMap> {
        if checks.len() != header.check_block_count {
            return Err(FcpError::Protocol(format!(
                "segment {} has {} check blocks, expected {}",
                header.segment_num,
                checks.len(),
                header.check_block_count
            )));
        }

        let block_size = header.block_size as usize;
        let data_blocks =
            (0..header.block_count).map(|i| segment.slice(i * block_size..(i + 1) * block_size));

        let mut tasks = JoinSet::new();
        for (index, block) in data_blocks.chain(checks).enumerate() {
            let client = self.clone();
            tasks.spawn(async move { (index, client.insert_block(block, refresh).await) });
        }

        let mut slots = BlockSlots::new(header.block_count, header.check_block_count);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(uri))) => slots.fill(index, uri)?,
                Ok((index, Err(e))) => {
                    error!(self.log(), "block insert failed"; "segment" => header.segment_num,
                        "block" => index, "error" => %e);
                    return Err(e);
                }
                Err(e) => return Err(FcpError::Worker(e.to_string())),
            }
        }

        slots.into_map()
    }

    async fn insert_block(&self, block: Bytes, refresh: bool) -> Result<KeyUri> {
        let _permit = self
            .pool()
            .acquire_owned()
            .await
            .map_err(|e| FcpError::Worker(e.to_string()))?;

        let metadata = Bytes::new();
        let predicted = if refresh {
            Some(self.generate_chk(&metadata, &block).await?)
        } else {
            None
        };

        self.attempt_insert(
            &KeyUri::chk(),
            &metadata,
            &block,
            predicted.as_ref(),
            Some(FLAG_DELETE_LOCAL),
        )
        .await
    }
}
