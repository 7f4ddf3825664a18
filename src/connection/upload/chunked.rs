use super::{check_writable, stream_closed, UploadStream};
use crate::connection::bridge::MessageLoop;
use crate::connection::lifecycle::RequestCompletion;
use crate::engine::{UploadDataProvider, UploadDataSink};
use crate::error::{ConnectionError, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::{Arc, Weak};

#[derive(Debug, Default)]
struct ChunkBuffer {
    data: BytesMut,
    last_chunk: bool,
}

/// Streams a body of unknown length with chunked transfer encoding.
///
/// Writes fill a `chunk_length` buffer; a full buffer is handed to the engine
/// before the write returns. Closing the stream marks whatever is left as the
/// final chunk.
pub struct ChunkedOutputStream {
    chunk_length: usize,
    buffer: Arc<Mutex<ChunkBuffer>>,
    message_loop: Arc<MessageLoop>,
    completion: RequestCompletion,
    closed: bool,
}

impl ChunkedOutputStream {
    /// A stream that uploads in chunks of `chunk_length` bytes.
    pub fn new(chunk_length: usize, message_loop: Arc<MessageLoop>) -> Self {
        let chunk_length = chunk_length.max(1);
        ChunkedOutputStream {
            chunk_length,
            buffer: Arc::new(Mutex::new(ChunkBuffer {
                data: BytesMut::with_capacity(chunk_length),
                last_chunk: false,
            })),
            message_loop,
            completion: RequestCompletion::new(),
            closed: false,
        }
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(stream_closed());
        }
        check_writable(&self.completion)?;

        let mut rest = buf;
        while !rest.is_empty() {
            let full = {
                let mut chunk = self.buffer.lock();
                let n = rest.len().min(self.chunk_length - chunk.data.len());
                chunk.data.extend_from_slice(&rest[..n]);
                rest = &rest[n..];
                chunk.data.len() == self.chunk_length
            };
            if full {
                self.message_loop.run()?;
                check_writable(&self.completion)?;
            }
        }
        Ok(())
    }
}

impl Write for ChunkedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl UploadStream for ChunkedOutputStream {
    fn data_provider(&self) -> Box<dyn UploadDataProvider> {
        Box::new(ChunkedProvider {
            buffer: self.buffer.clone(),
            message_loop: Arc::downgrade(&self.message_loop),
        })
    }

    fn set_connected(&mut self) -> Result<()> {
        Ok(())
    }

    fn check_received_enough_content(&self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.buffer.lock().last_chunk = true;
        }
        Ok(())
    }

    fn completion(&self) -> RequestCompletion {
        self.completion.clone()
    }
}

struct ChunkedProvider {
    buffer: Arc<Mutex<ChunkBuffer>>,
    message_loop: Weak<MessageLoop>,
}

impl UploadDataProvider for ChunkedProvider {
    fn length(&self) -> Option<u64> {
        None
    }

    fn read(&mut self, sink: &dyn UploadDataSink, max_bytes: usize) {
        let (data, final_chunk, drained) = {
            let mut chunk = self.buffer.lock();
            if max_bytes >= chunk.data.len() {
                (chunk.data.split().freeze(), chunk.last_chunk, true)
            } else {
                (chunk.data.split_to(max_bytes).freeze(), false, false)
            }
        };
        sink.on_read_succeeded(data, final_chunk);
        // The writer is only parked while the chunk is not final.
        if drained && !final_chunk {
            if let Some(message_loop) = self.message_loop.upgrade() {
                message_loop.quit();
            }
        }
    }

    fn rewind(&mut self, sink: &dyn UploadDataSink) {
        sink.on_rewind_error(ConnectionError::protocol(
            "cannot rewind a chunked request body",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::upload::test_support::RecordingSink;
    use crate::engine::Executor;
    use bytes::Bytes;

    #[test]
    fn test_full_chunk_parks_writer_until_read() {
        let message_loop = Arc::new(MessageLoop::new());
        let mut stream = ChunkedOutputStream::new(4, message_loop.clone());
        let provider = Arc::new(Mutex::new(stream.data_provider()));
        let sink = Arc::new(RecordingSink::default());
        for _ in 0..2 {
            let provider = provider.clone();
            let sink = sink.clone();
            message_loop.execute(Box::new(move || provider.lock().read(sink.as_ref(), 64)));
        }

        stream.write_all(b"abcdefgh").unwrap();
        assert_eq!(*sink.reads.lock(), vec![(4, false), (4, false)]);
        assert_eq!(message_loop.pending_tasks(), 0);
    }

    #[test]
    fn test_close_marks_final_chunk() {
        let message_loop = Arc::new(MessageLoop::new());
        let mut stream = ChunkedOutputStream::new(16, message_loop.clone());
        stream.write_all(b"tail").unwrap();
        stream.close().unwrap();
        stream.close().unwrap();

        let mut provider = stream.data_provider();
        assert_eq!(provider.length(), None);
        let sink = RecordingSink::default();
        provider.read(&sink, 2);
        provider.read(&sink, 64);
        assert_eq!(*sink.reads.lock(), vec![(2, false), (2, true)]);
        assert_eq!(sink.bytes(), Bytes::from_static(b"tail"));
        // Final chunk does not release the loop.
        assert_eq!(
            message_loop.run_timeout(std::time::Duration::from_millis(5)),
            Err(ConnectionError::Timeout)
        );
    }

    #[test]
    fn test_write_after_close_fails() {
        let message_loop = Arc::new(MessageLoop::new());
        let mut stream = ChunkedOutputStream::new(16, message_loop);
        stream.close().unwrap();
        assert!(stream.write_all(b"x").is_err());
    }

    #[test]
    fn test_failure_stops_writes() {
        let message_loop = Arc::new(MessageLoop::new());
        let mut stream = ChunkedOutputStream::new(16, message_loop);
        let failure = ConnectionError::protocol("boom");
        stream.completion().complete(Some(failure.clone()));
        assert_eq!(stream.write_bytes(b"x"), Err(failure));
    }

    #[test]
    fn test_success_while_parked_ends_write() {
        let message_loop = Arc::new(MessageLoop::new());
        let mut stream = ChunkedOutputStream::new(4, message_loop.clone());
        let completion = stream.completion();
        let releaser = message_loop.clone();
        message_loop.execute(Box::new(move || {
            completion.complete(None);
            releaser.quit();
        }));

        let err = stream.write_bytes(b"abcdefgh1234").unwrap_err();
        assert_eq!(err, ConnectionError::protocol("writing after request completed"));
        assert_eq!(message_loop.pending_tasks(), 0);
    }
}
