// Copyright 2020 Joyent, Inc.

//! Insert with verification and retry.
//!
//! An insert only counts once the inserted key can be fetched back (when
//! `verify_inserts` is set).  Failed or unverifiable inserts are retried
//! with exponential backoff as described by the client's `RetryPolicy`.

use bytes::Bytes;
use slog::{debug, info, warn};

use crate::client::FcpClient;
use crate::error::{FcpError, Result};
use crate::metadata;
use crate::uri::KeyUri;

impl FcpClient {
    /// Insert `metadata` and `data` under `target`, returning the URI the
    /// node assigned.
    ///
    /// If `predicted` is given and that key can already be fetched, nothing
    /// is inserted and `predicted` is returned.
    pub async fn attempt_insert(
        &self,
        target: &KeyUri,
        metadata: &Bytes,
        data: &Bytes,
        predicted: Option<&KeyUri>,
        flags: Option<u32>,
    ) -> Result<KeyUri> {
        let config = self.config();
        let htl = config.hops_to_live;

        if let Some(predicted) = predicted {
            if self.key_exists(predicted, htl).await {
                debug!(self.log(), "key already present, skipping insert"; "uri" => %predicted);
                return Ok(predicted.clone());
            }
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.put(target, htl, metadata, data, flags).await {
                Ok(outcome) => {
                    if !config.verify_inserts || self.key_exists(&outcome.uri, htl).await {
                        return Ok(outcome.uri);
                    }
                    warn!(self.log(), "inserted key not retrievable"; "uri" => %outcome.uri,
                        "attempt" => attempts);
                }
                Err(e) => {
                    warn!(self.log(), "insert failed"; "target" => %target,
                        "attempt" => attempts, "error" => %e);
                }
            }

            if config.retry.exhausted(attempts) {
                return Err(FcpError::RetriesExhausted {
                    target: target.render(),
                    attempts,
                });
            }
            tokio::time::sleep(config.retry.backoff(attempts)).await;
        }
    }

    /// Like `attempt_insert`, but payloads too large for a non-CHK key are
    /// inserted as a CHK, and `target` receives a redirect to it.
    pub async fn attempt_insert_redirecting(
        &self,
        target: &KeyUri,
        metadata: &Bytes,
        data: &Bytes,
    ) -> Result<KeyUri> {
        if target.is_chk() || metadata.len() + data.len() < self.config().redirect_threshold {
            return self.attempt_insert(target, metadata, data, None, None).await;
        }

        let chk = self
            .attempt_insert(&KeyUri::chk(), metadata, data, None, None)
            .await?;
        info!(self.log(), "inserting redirect"; "target" => %target, "chk" => %chk);

        let redirect = metadata::redirect_document(&chk);
        self.attempt_insert(target, &redirect, &Bytes::new(), None, None)
            .await
    }
}
