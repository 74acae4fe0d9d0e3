// Copyright 2020 Joyent, Inc.

//! Node side of an FCP connection.
//!
//! `make_task` drives one accepted connection: it checks the protocol
//! preamble, reads each client request together with its raw payload, hands
//! it to a handler, and writes back whatever frames the handler returns.
//! This is enough to stand up a small in-process node, e.g. for tests:
//!
//! ```ignore
//! while let Ok((stream, _)) = listener.accept().await {
//!     let log = log.clone();
//!     tokio::spawn(async move {
//!         server::make_task(stream, handler, Some(&log)).await;
//!     });
//! }
//! ```

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use slog::{debug, error, o, Drain, Logger};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{FcpError, Result};
use crate::protocol::{FcpCodec, FcpFrame, FcpMessage, DATA_CHUNK, RESTARTED};

/// A client request and the raw payload that followed it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub message: FcpMessage,
    pub payload: Bytes,
}

impl NodeRequest {
    /// The metadata part of the payload, as declared by `MetadataLength`.
    pub fn metadata(&self) -> Result<Bytes> {
        let len: usize = self.message.hex_field("MetadataLength")?.unwrap_or(0);
        if len > self.payload.len() {
            return Err(FcpError::protocol("MetadataLength exceeds the payload"));
        }
        Ok(self.payload.slice(..len))
    }

    /// The payload after the metadata.
    pub fn data(&self) -> Result<Bytes> {
        let len = self.metadata()?.len();
        Ok(self.payload.slice(len..))
    }
}

/// Frames delivering `payload` as `DataChunk` messages of at most
/// `chunk_size` bytes each.
pub fn data_chunks(payload: &Bytes, chunk_size: usize) -> Vec<FcpFrame> {
    let chunk_size = std::cmp::max(chunk_size, 1);
    let mut frames = vec![];
    let mut offset = 0;
    while offset < payload.len() {
        let end = std::cmp::min(offset + chunk_size, payload.len());
        let header = FcpMessage::new(DATA_CHUNK)
            .with_hex("Length", end - offset)
            .with_data();
        frames.push(FcpFrame::Message(header));
        frames.push(FcpFrame::Payload(payload.slice(offset..end)));
        offset = end;
    }
    frames
}

pub fn restarted() -> FcpFrame {
    FcpFrame::Message(FcpMessage::new(RESTARTED))
}

async fn read_request<S>(
    framed: &mut Framed<S, FcpCodec>,
) -> Result<Option<NodeRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let message = match framed.next().await {
        Some(Ok(FcpFrame::Message(msg))) => msg,
        Some(Ok(FcpFrame::Payload(_))) => {
            return Err(FcpError::protocol("raw bytes where a request was expected"))
        }
        Some(Err(e)) => return Err(e),
        None => return Ok(None),
    };

    let mut payload = BytesMut::new();
    if message.has_data() {
        let len = message.payload_len()? as usize;
        while payload.len() < len {
            match framed.next().await {
                Some(Ok(FcpFrame::Payload(piece))) => payload.extend_from_slice(&piece),
                Some(Ok(FcpFrame::Message(_))) => {
                    return Err(FcpError::protocol("request payload cut short"))
                }
                Some(Err(e)) => return Err(e),
                None => return Err(FcpError::protocol("connection closed in a payload")),
            }
        }
    }

    Ok(Some(NodeRequest {
        message,
        payload: payload.freeze(),
    }))
}

pub async fn make_task<S, F>(socket: S, handler: F, log: Option<&Logger>)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&NodeRequest, &Logger) -> Result<Vec<FcpFrame>>,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    let mut framed = Framed::new(socket, FcpCodec::node());

    loop {
        let request = match read_request(&mut framed).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                error!(log, "failed to read request"; "err" => %e);
                break;
            }
        };
        debug!(log, "handling request"; "name" => &request.message.name,
            "payload_len" => request.payload.len());

        let frames = match handler(&request, &log) {
            Ok(frames) => frames,
            Err(e) => {
                error!(log, "request handler failed"; "err" => %e);
                break;
            }
        };

        let mut out = futures::stream::iter(frames.into_iter().map(Ok::<FcpFrame, FcpError>));
        if let Err(e) = framed.send_all(&mut out).await {
            error!(log, "failed to write response"; "err" => %e);
            break;
        }
    }
}
