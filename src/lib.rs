// Copyright 2020 Joyent, Inc.

//! fcp-client: a client for the Freenet Client Protocol (FCP)
//!
//! FCP is the protocol a program uses to talk to its local Freenet node.
//! This crate inserts and retrieves keys through a node, and splits content
//! too large for a single key into erasure coded blocks ("splitfiles") with
//! the help of the node's FEC service.
//!
//! Protocol definition
//!
//! A client opens one TCP connection per request.  The first four bytes it
//! writes are the protocol version, `00 00 00 02`.  After that both sides
//! exchange text messages:
//!
//! ```text
//! ClientGet
//! URI=freenet:KSK@gpl.txt
//! HopsToLive=14
//! EndMessage
//! ```
//!
//! * The first line is the message name.
//!
//! * Each following `Field=Value` line is a field.  Integer values are
//!   lowercase hex without a `0x` prefix.
//!
//! * `EndMessage` ends the message.  A message may instead end with `Data`,
//!   in which case exactly `DataLength` raw bytes follow.  The first
//!   `MetadataLength` bytes of a payload are the key's metadata, the rest
//!   its data.
//!
//! Payloads sent by the node are delivered as a sequence of
//! `DataChunk` messages, each carrying `Length` raw bytes.  At any point in
//! the sequence the node may send `Restarted`, after which everything
//! received for the payload so far is void and the transfer starts over.
//!
//! Module overview
//!
//! * `protocol`: message framing and the tokio codec
//! * `client`: connections and the basic requests (get, put, CHK and key
//!   pair generation)
//! * `fec`: segment headers, block maps and the FEC requests
//! * `retry`: verified inserts with retry and backoff
//! * `insert`, `retrieve`: splitfile insertion and retrieval
//! * `server`: the node side of a connection, for in-process test nodes

#![allow(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod fec;
pub mod insert;
pub mod metadata;
pub mod protocol;
pub mod retrieve;
pub mod retry;
pub mod server;
pub mod uri;

pub use crate::client::FcpClient;
pub use crate::config::{ClientConfig, RetryPolicy};
pub use crate::error::{FailureKind, FcpError, Result};
pub use crate::uri::KeyUri;
