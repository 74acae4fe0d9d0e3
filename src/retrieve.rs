// Copyright 2020 Joyent, Inc.

//! Splitfile retrieval.
//!
//! For every segment a random set of `BlocksRequired` block indices is drawn
//! from the combined data+check index space and those blocks are fetched.
//! Blocks that cannot be fetched are replaced by further random draws from
//! the indices not tried yet; the segment only fails once fewer than
//! `BlocksRequired` blocks remain possible.  Missing data blocks are then
//! rebuilt by the node and the segment is cut back to its logical length.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use slog::{debug, error, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::client::{FcpClient, GetOutcome, GetRequest};
use crate::error::{FcpError, Result};
use crate::fec::{BlockMap, KnownBlocks, SegmentHeader};
use crate::metadata::HintKind;
use crate::uri::KeyUri;

/// Pick `count` of `candidates` uniformly at random, without replacement.
/// The result is sorted ascending.
pub fn select_indices<R: Rng + ?Sized>(rng: &mut R, candidates: &[usize], count: usize) -> Vec<usize> {
    let mut chosen: Vec<usize> = candidates.choose_multiple(rng, count).cloned().collect();
    chosen.sort_unstable();
    chosen
}

/// Split combined indices into data block indices and check block indices,
/// the latter counted from the first check block.
pub fn partition_indices(indices: &[usize], block_count: usize) -> (Vec<usize>, Vec<usize>) {
    let (data, checks): (Vec<usize>, Vec<usize>) =
        indices.iter().cloned().partition(|i| *i < block_count);
    let checks = checks.into_iter().map(|i| i - block_count).collect();
    (data, checks)
}

/// Data block indices in `0..block_count` that are not in `present`.
pub fn missing_indices(present: &[usize], block_count: usize) -> Vec<usize> {
    let present: BTreeSet<usize> = present.iter().cloned().collect();
    (0..block_count).filter(|i| !present.contains(i)).collect()
}

/// Put a segment back together from the data blocks that were fetched and
/// the ones the node rebuilt, and cut it to the segment's length.
pub fn reassemble(
    header: &SegmentHeader,
    data_indices: &[usize],
    data: &[Bytes],
    requested: &[usize],
    decoded: &[Bytes],
) -> Result<Bytes> {
    if data_indices.len() != data.len() || requested.len() != decoded.len() {
        return Err(FcpError::protocol("block indices do not match the blocks given"));
    }

    let mut blocks: Vec<Option<&Bytes>> = vec![None; header.block_count];
    let sources = data_indices
        .iter()
        .zip(data)
        .chain(requested.iter().zip(decoded));
    for (index, block) in sources {
        match blocks.get_mut(*index) {
            Some(slot) => *slot = Some(block),
            None => {
                return Err(FcpError::Protocol(format!(
                    "segment {} has no block {}",
                    header.segment_num, index
                )))
            }
        }
    }

    let mut out = BytesMut::with_capacity(header.padded_length() as usize);
    for (index, block) in blocks.iter().enumerate() {
        match block {
            Some(block) => out.extend_from_slice(block),
            None => {
                return Err(FcpError::Protocol(format!(
                    "segment {} is missing block {}",
                    header.segment_num, index
                )))
            }
        }
    }

    let len = header.segment_length() as usize;
    if out.len() < len {
        return Err(FcpError::Protocol(format!(
            "segment {} rebuilt to {} bytes, expected {}",
            header.segment_num,
            out.len(),
            len
        )));
    }
    out.truncate(len);
    Ok(out.freeze())
}

/// A date based redirect followed on the way to the content.  The values
/// are the node's hex strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRedirect {
    pub target: KeyUri,
    pub increment: Option<String>,
    pub offset: Option<String>,
    /// Evaluation time the target was computed for.
    pub time_sec: Option<String>,
}

/// Result of following a key to its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieved {
    pub data: Bytes,
    pub mime_type: Option<String>,
    /// Every URI visited, starting with the one asked for.
    pub uris: Vec<KeyUri>,
    pub date_redirects: Vec<DateRedirect>,
}

impl FcpClient {
    /// Fetch a key, following redirects and reassembling splitfiles.  Date
    /// redirects are evaluated at the current time.
    pub async fn retrieve(&self, uri: &KeyUri) -> Result<Retrieved> {
        self.retrieve_at(uri, Utc::now()).await
    }

    /// Like `retrieve`, with date redirects evaluated at `when`.  Later hops
    /// use the evaluation time the node reports, so a whole redirect chain
    /// is resolved at one instant.
    pub async fn retrieve_at(&self, uri: &KeyUri, when: DateTime<Utc>) -> Result<Retrieved> {
        let config = self.config();
        let mut uri = uri.clone();
        let mut when = when;
        let mut uris = vec![];
        let mut date_redirects = vec![];
        let mut mime_type = None;

        loop {
            uris.push(uri.clone());
            let request = GetRequest::new(config.hops_to_live).with_hint(when);
            let (hint, key) = match self.get(&uri, &request).await? {
                GetOutcome::MetadataHint { hint, key } => (hint, key),
                GetOutcome::Success(key) => {
                    return Ok(Retrieved {
                        data: key.data,
                        mime_type,
                        uris,
                        date_redirects,
                    })
                }
            };
            if mime_type.is_none() {
                mime_type = hint.mime_type.clone();
            }
            if let Some(reported) = hint.time()? {
                when = reported;
            }

            match hint.kind {
                HintKind::Data => {
                    return Ok(Retrieved {
                        data: key.data,
                        mime_type,
                        uris,
                        date_redirects,
                    })
                }
                HintKind::SplitFile => {
                    let data = self.fetch_splitfile(&key.metadata).await?;
                    return Ok(Retrieved {
                        data,
                        mime_type,
                        uris,
                        date_redirects,
                    });
                }
                HintKind::Redirect | HintKind::DateRedirect => {
                    if uris.len() > config.max_redirects {
                        return Err(FcpError::Protocol(format!(
                            "more than {} redirects starting at {}",
                            config.max_redirects, uris[0]
                        )));
                    }
                    let next = hint.next_uri.clone().ok_or_else(|| {
                        FcpError::protocol("redirect hint without a NextURI")
                    })?;
                    if hint.kind == HintKind::DateRedirect {
                        debug!(self.log(), "following date redirect"; "from" => %uri,
                            "to" => %next, "time_sec" => ?hint.time_sec);
                        date_redirects.push(DateRedirect {
                            target: next.clone(),
                            increment: hint.increment,
                            offset: hint.offset,
                            time_sec: hint.time_sec,
                        });
                    }
                    uri = next;
                }
                HintKind::TooDumb | HintKind::Error => {
                    return Err(FcpError::Protocol(format!(
                        "node could not interpret the metadata of {} ({:?})",
                        uri, hint.kind
                    )))
                }
            }
        }
    }

    /// Download a splitfile given its metadata document.
    pub async fn fetch_splitfile(&self, metadata: &Bytes) -> Result<Bytes> {
        let mut out = Vec::new();
        self.fetch_to_writer(metadata, &mut out).await?;
        Ok(Bytes::from(out))
    }

    /// Download a splitfile, appending each segment to `writer` as soon as
    /// it is rebuilt.  Returns the number of bytes written.
    pub async fn fetch_to_writer<W>(&self, metadata: &Bytes, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let (headers, maps) = self.segment_split_file(metadata).await?;

        let mut written = 0;
        for (header, map) in headers.iter().zip(&maps) {
            let segment = self.fetch_segment(header, map).await?;
            writer.write_all(&segment).await?;
            written += segment.len() as u64;
            info!(self.log(), "segment reassembled"; "segment" => header.segment_num,
                "bytes" => segment.len());
        }
        writer.flush().await?;

        if let Some(header) = headers.first() {
            if written != header.file_length {
                return Err(FcpError::Protocol(format!(
                    "splitfile rebuilt to {} bytes, expected {}",
                    written, header.file_length
                )));
            }
        }
        Ok(written)
    }

    /// Fetch enough blocks of one segment and rebuild it.
    pub async fn fetch_segment(&self, header: &SegmentHeader, map: &BlockMap) -> Result<Bytes> {
        if !map.matches(header) {
            return Err(FcpError::Protocol(format!(
                "block map for segment {} does not match its header",
                header.segment_num
            )));
        }

        let held = self.download_blocks(header, map).await?;

        let indices: Vec<usize> = held.keys().cloned().collect();
        let (data_indices, check_indices) = partition_indices(&indices, header.block_count);
        let known = KnownBlocks {
            data: data_indices.iter().map(|i| held[i].clone()).collect(),
            checks: check_indices
                .iter()
                .map(|i| held[&(i + header.block_count)].clone())
                .collect(),
            data_indices,
            check_indices,
        };

        let requested = missing_indices(&known.data_indices, header.block_count);
        let decoded = if requested.is_empty() {
            vec![]
        } else {
            self.decode_segment(header, &known, &requested).await?
        };

        reassemble(header, &known.data_indices, &known.data, &requested, &decoded)
    }

    /// Fetch `BlocksRequired` blocks of a segment, drawing replacements for
    /// blocks that fail.  Returns the blocks keyed by combined index.
    async fn download_blocks(
        &self,
        header: &SegmentHeader,
        map: &BlockMap,
    ) -> Result<BTreeMap<usize, Bytes>> {
        let required = header.blocks_required;
        let mut held: BTreeMap<usize, Bytes> = BTreeMap::new();
        let mut failed: BTreeSet<usize> = BTreeSet::new();

        while held.len() < required {
            let need = required - held.len();
            let candidates: Vec<usize> = (0..header.total_blocks())
                .filter(|i| !held.contains_key(i) && !failed.contains(i))
                .collect();
            if candidates.len() < need {
                let available = held.len() + candidates.len();
                error!(self.log(), "segment cannot be rebuilt"; "segment" => header.segment_num,
                    "available" => available, "required" => required);
                return Err(FcpError::ReconstructionShortfall {
                    segment: header.segment_num,
                    required,
                    available,
                });
            }

            let chosen = select_indices(&mut rand::thread_rng(), &candidates, need);
            let mut tasks = JoinSet::new();
            for index in chosen {
                let uri = map.key(index).cloned().ok_or_else(|| {
                    FcpError::Protocol(format!("no key for block {}", index))
                })?;
                let client = self.clone();
                tasks.spawn(async move { (index, client.fetch_block(&uri).await) });
            }

            while let Some(joined) = tasks.join_next().await {
                let (index, result) = joined.map_err(|e| FcpError::Worker(e.to_string()))?;
                let expected = if index < header.block_count {
                    header.block_size
                } else {
                    header.check_block_size
                };
                match result {
                    Ok(block) if block.len() as u64 == expected => {
                        held.insert(index, block);
                    }
                    Ok(block) => {
                        warn!(self.log(), "block has the wrong size"; "segment" => header.segment_num,
                            "block" => index, "size" => block.len());
                        failed.insert(index);
                    }
                    Err(e) => {
                        warn!(self.log(), "block fetch failed"; "segment" => header.segment_num,
                            "block" => index, "error" => %e);
                        failed.insert(index);
                    }
                }
            }
        }

        Ok(held)
    }

    async fn fetch_block(&self, uri: &KeyUri) -> Result<Bytes> {
        let _permit = self
            .pool()
            .acquire_owned()
            .await
            .map_err(|e| FcpError::Worker(e.to_string()))?;

        let request = GetRequest::new(self.config().hops_to_live);
        let outcome = self.get(uri, &request).await?;
        Ok(outcome.into_key().data)
    }
}
