// Copyright 2020 Joyent, Inc.

//! Error types for FCP client operations.
//!
//! Errors fall into a few groups:
//!
//! * connection errors: `Connect` and `Io`. These abort the current
//!   operation and are never retried below the retry controller.
//! * framing errors: `Protocol`, raised for unexpected messages, missing
//!   fields and malformed chunk framing.
//! * remote failures: `Remote`, a well-formed failure message from the node.
//! * orchestration errors: `ReconstructionShortfall`, `RetriesExhausted`
//!   and `Worker`.

use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FcpError>;

/// The failure messages a node may answer a request with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    RouteNotFound,
    UriError,
    SizeError,
    FormatError,
    DataNotFound,
    Failed,
}

impl FailureKind {
    /// Map a message name to a failure kind, if it names one.
    pub fn from_message_name(name: &str) -> Option<FailureKind> {
        match name {
            "RouteNotFound" => Some(FailureKind::RouteNotFound),
            "URIError" => Some(FailureKind::UriError),
            "SizeError" => Some(FailureKind::SizeError),
            "FormatError" => Some(FailureKind::FormatError),
            "DataNotFound" => Some(FailureKind::DataNotFound),
            "Failed" => Some(FailureKind::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::RouteNotFound => "RouteNotFound",
            FailureKind::UriError => "URIError",
            FailureKind::SizeError => "SizeError",
            FailureKind::FormatError => "FormatError",
            FailureKind::DataNotFound => "DataNotFound",
            FailureKind::Failed => "Failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FcpError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The node answered with one of the named failure messages.
    #[error("node returned {kind}{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Remote {
        kind: FailureKind,
        reason: Option<String>,
    },

    /// Not enough blocks of a segment could be downloaded to rebuild it.
    #[error("segment {segment}: {available} blocks available, {required} required")]
    ReconstructionShortfall {
        segment: u64,
        required: usize,
        available: usize,
    },

    #[error("insert of {target} failed after {attempts} attempts")]
    RetriesExhausted { target: String, attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("block worker failed: {0}")]
    Worker(String),
}

impl FcpError {
    pub fn protocol<S: Into<String>>(msg: S) -> FcpError {
        FcpError::Protocol(msg.into())
    }

    /// True if this is a remote failure of the given kind.
    pub fn is_remote(&self, kind: FailureKind) -> bool {
        match self {
            FcpError::Remote { kind: k, .. } => *k == kind,
            _ => false,
        }
    }
}
