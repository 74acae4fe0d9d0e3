// Copyright 2020 Joyent, Inc.

//! The small part of the metadata document format the client writes itself,
//! and the `MetadataHint` summary a node returns in place of parsing
//! metadata client side.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::error::{FcpError, Result};
use crate::protocol::{self, FcpMessage};
use crate::uri::KeyUri;

const DOCUMENT_HEADER: &str = "Version\nRevision=1\nEndPart\n";

/// What the node found in a key's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum HintKind {
    Data = 1,
    Redirect = 2,
    DateRedirect = 3,
    SplitFile = 4,
    TooDumb = 5,
    Error = 6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHint {
    pub kind: HintKind,
    pub next_uri: Option<KeyUri>,
    pub mime_type: Option<String>,
    /// Evaluation time of a date redirect, left as the node's hex string.
    pub time_sec: Option<String>,
    pub increment: Option<String>,
    pub offset: Option<String>,
}

impl MetadataHint {
    pub fn from_message(msg: &FcpMessage) -> Result<MetadataHint> {
        let raw_kind = msg.require("Kind")?;
        let kind = raw_kind
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(HintKind::from_u8)
            .ok_or_else(|| {
                FcpError::Protocol(format!("unknown metadata hint kind '{}'", raw_kind))
            })?;

        Ok(MetadataHint {
            kind,
            next_uri: msg.field("NextURI").map(KeyUri::new),
            mime_type: msg.field("MimeType").map(String::from),
            time_sec: msg.field("TimeSec").map(String::from),
            increment: msg.field("Increment").map(String::from),
            offset: msg.field("Offset").map(String::from),
        })
    }

    /// The instant the node evaluated date redirects at, from `TimeSec`.
    pub fn time(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = match &self.time_sec {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let secs: i64 = protocol::parse_hex(raw)?;
        match Utc.timestamp_opt(secs, 0).single() {
            Some(when) => Ok(Some(when)),
            None => Err(FcpError::Protocol(format!("TimeSec '{}' is out of range", raw))),
        }
    }
}

/// `RedirectTimeSec` value for a hinted request evaluated at `when`.
pub fn redirect_time_sec(when: DateTime<Utc>) -> String {
    protocol::hex(when.timestamp().max(0) as u64)
}

/// A document redirecting to `target`.
pub fn redirect_document(target: &KeyUri) -> Bytes {
    let doc = format!(
        "{}Document\nRedirect.Target={}\nEnd\n",
        DOCUMENT_HEADER, target
    );
    Bytes::from(doc)
}

/// A document with nothing but a content type.
pub fn simple_document(mime_type: &str) -> Bytes {
    let doc = format!("{}Document\nInfo.Format={}\nEnd\n", DOCUMENT_HEADER, mime_type);
    Bytes::from(doc)
}
