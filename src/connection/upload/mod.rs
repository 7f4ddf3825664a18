//! Request body streams and the strategy that picks one.
//!
//! | Strategy | Stream | Request starts |
//! |----------|--------|----------------|
//! | chunk length > 0 | [`ChunkedOutputStream`] | when the stream is opened |
//! | fixed length set | [`FixedLengthOutputStream`] | when the stream is opened |
//! | otherwise | [`BufferedOutputStream`] | on connect or first response access |
//!
//! Streaming variants hand bytes to the engine while the caller writes: a full
//! staging buffer parks the writer in the message loop until the engine's
//! provider read has drained it. The buffered variant only exposes its bytes
//! after the request starts, which is when its length becomes
//! `Content-Length`.

mod buffered;
mod chunked;
mod fixed;

pub use buffered::BufferedOutputStream;
pub use chunked::ChunkedOutputStream;
pub use fixed::FixedLengthOutputStream;

use super::bridge::MessageLoop;
use super::lifecycle::RequestCompletion;
use crate::config::ConnectionConfig;
use crate::engine::UploadDataProvider;
use crate::error::{ConnectionError, Result};
use std::io::Write;
use std::sync::Arc;

/// A writable request body.
pub trait UploadStream: Write + Send {
    /// The engine-facing view of this stream.
    fn data_provider(&self) -> Box<dyn UploadDataProvider>;

    /// Called once the request has been built with this stream's provider.
    fn set_connected(&mut self) -> Result<()>;

    /// Fails when fewer bytes were written than the stream promised.
    fn check_received_enough_content(&self) -> Result<()>;

    /// Finish the body. For chunked streams this emits the last chunk.
    fn close(&mut self) -> Result<()>;

    /// Completion notification set by the callback adapter.
    fn completion(&self) -> RequestCompletion;
}

/// How the request body is supplied to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// Chunked transfer with the given chunk size.
    Chunked {
        /// Staging buffer size.
        chunk_length: usize,
    },
    /// Streaming with a length known up front.
    FixedLength {
        /// Exact body length.
        content_length: u64,
    },
    /// Whole body kept in memory until the request starts.
    Buffered {
        /// Length the caller declared through a `Content-Length` header.
        declared_length: Option<u64>,
    },
}

impl UploadStrategy {
    /// Pick a strategy from the connection configuration and the caller's
    /// `Content-Length` request header, if any.
    pub fn select(config: &ConnectionConfig, declared_content_length: Option<&str>) -> Result<Self> {
        if config.is_chunked() {
            return Ok(UploadStrategy::Chunked {
                chunk_length: config.chunk_length,
            });
        }
        if let Some(content_length) = config.fixed_content_length {
            return Ok(UploadStrategy::FixedLength { content_length });
        }
        let declared_length = declared_content_length
            .map(|value| {
                value.trim().parse::<u64>().map_err(|_| {
                    ConnectionError::protocol(format!("invalid Content-Length: {value}"))
                })
            })
            .transpose()?;
        Ok(UploadStrategy::Buffered { declared_length })
    }

    /// Whether opening the stream must start the request.
    pub fn starts_immediately(&self) -> bool {
        !matches!(self, UploadStrategy::Buffered { .. })
    }

    /// Create the stream for this strategy.
    pub fn open(self, message_loop: Arc<MessageLoop>) -> Box<dyn UploadStream> {
        match self {
            UploadStrategy::Chunked { chunk_length } => {
                Box::new(ChunkedOutputStream::new(chunk_length, message_loop))
            }
            UploadStrategy::FixedLength { content_length } => {
                Box::new(FixedLengthOutputStream::new(content_length, message_loop))
            }
            UploadStrategy::Buffered { declared_length } => {
                tracing::debug!(?declared_length, "request body is buffered in memory");
                Box::new(BufferedOutputStream::new(declared_length))
            }
        }
    }
}

/// Fail once the request has ended: with its failure, or with a protocol
/// error when it completed while body bytes were still being written.
fn check_writable(completion: &RequestCompletion) -> Result<()> {
    match completion.outcome() {
        None => Ok(()),
        Some(Err(failure)) => Err(failure),
        Some(Ok(())) => Err(ConnectionError::protocol("writing after request completed")),
    }
}

fn stream_closed() -> ConnectionError {
    ConnectionError::protocol("stream has been closed")
}
