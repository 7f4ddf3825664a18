use super::{check_writable, stream_closed, UploadStream};
use crate::connection::bridge::MessageLoop;
use crate::connection::lifecycle::RequestCompletion;
use crate::engine::{UploadDataProvider, UploadDataSink};
use crate::error::{ConnectionError, Result};
use crate::protocol::constants::FIXED_MODE_BUFFER_SIZE;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::{Arc, Weak};

/// Streams a body whose exact length is known before the request starts.
///
/// Bytes are staged in a fixed-size buffer; when it fills, or when the last
/// byte is written, the writer runs the message loop until the engine has
/// drained the buffer.
pub struct FixedLengthOutputStream {
    content_length: u64,
    bytes_written: u64,
    buffer: Arc<Mutex<BytesMut>>,
    buffer_size: usize,
    message_loop: Arc<MessageLoop>,
    completion: RequestCompletion,
    closed: bool,
}

impl FixedLengthOutputStream {
    /// A stream that must receive exactly `content_length` bytes.
    pub fn new(content_length: u64, message_loop: Arc<MessageLoop>) -> Self {
        Self::with_buffer_size(content_length, FIXED_MODE_BUFFER_SIZE, message_loop)
    }

    pub(crate) fn with_buffer_size(
        content_length: u64,
        buffer_size: usize,
        message_loop: Arc<MessageLoop>,
    ) -> Self {
        let buffer_size = buffer_size.max(1);
        let capacity = (content_length.min(buffer_size as u64)) as usize;
        FixedLengthOutputStream {
            content_length,
            bytes_written: 0,
            buffer: Arc::new(Mutex::new(BytesMut::with_capacity(capacity))),
            buffer_size,
            message_loop,
            completion: RequestCompletion::new(),
            closed: false,
        }
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(stream_closed());
        }
        check_writable(&self.completion)?;
        let total = self.bytes_written + buf.len() as u64;
        if total > self.content_length {
            return Err(ConnectionError::protocol(format!(
                "expected {} bytes but received {}",
                self.content_length, total
            )));
        }

        let mut rest = buf;
        while !rest.is_empty() {
            let full = {
                let mut staged = self.buffer.lock();
                let n = rest.len().min(self.buffer_size - staged.len());
                staged.extend_from_slice(&rest[..n]);
                rest = &rest[n..];
                staged.len() == self.buffer_size
            };
            if full {
                self.upload_buffer()?;
            }
        }
        self.bytes_written = total;

        if self.bytes_written == self.content_length && !self.buffer.lock().is_empty() {
            self.upload_buffer()?;
        }
        Ok(())
    }

    /// Park in the message loop until the engine drains the staging buffer.
    fn upload_buffer(&mut self) -> Result<()> {
        self.message_loop.run()?;
        check_writable(&self.completion)
    }
}

impl Write for FixedLengthOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl UploadStream for FixedLengthOutputStream {
    fn data_provider(&self) -> Box<dyn UploadDataProvider> {
        Box::new(FixedLengthProvider {
            content_length: self.content_length,
            buffer: self.buffer.clone(),
            message_loop: Arc::downgrade(&self.message_loop),
        })
    }

    fn set_connected(&mut self) -> Result<()> {
        Ok(())
    }

    fn check_received_enough_content(&self) -> Result<()> {
        if self.bytes_written < self.content_length {
            return Err(ConnectionError::protocol(
                "content received is less than Content-Length",
            ));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn completion(&self) -> RequestCompletion {
        self.completion.clone()
    }
}

struct FixedLengthProvider {
    content_length: u64,
    buffer: Arc<Mutex<BytesMut>>,
    message_loop: Weak<MessageLoop>,
}

impl UploadDataProvider for FixedLengthProvider {
    fn length(&self) -> Option<u64> {
        Some(self.content_length)
    }

    fn read(&mut self, sink: &dyn UploadDataSink, max_bytes: usize) {
        let (chunk, drained) = {
            let mut staged = self.buffer.lock();
            if max_bytes >= staged.len() {
                (staged.split().freeze(), true)
            } else {
                (staged.split_to(max_bytes).freeze(), false)
            }
        };
        sink.on_read_succeeded(chunk, false);
        if drained {
            if let Some(message_loop) = self.message_loop.upgrade() {
                message_loop.quit();
            }
        }
    }

    fn rewind(&mut self, sink: &dyn UploadDataSink) {
        sink.on_rewind_error(ConnectionError::protocol("cannot retry streamed HTTP body"));
    }
}
