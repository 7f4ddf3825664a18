use super::{stream_closed, UploadStream};
use crate::connection::lifecycle::RequestCompletion;
use crate::engine::{UploadDataProvider, UploadDataSink};
use crate::error::{ConnectionError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

#[derive(Debug, Default)]
struct BufferedState {
    data: BytesMut,
    position: usize,
    connected: bool,
}

/// Keeps the whole body in memory; the request starts after the caller is
/// done writing.
pub struct BufferedOutputStream {
    state: Arc<Mutex<BufferedState>>,
    declared_length: Option<u64>,
    closed: bool,
    completion: RequestCompletion,
}

impl BufferedOutputStream {
    /// A buffer optionally capped at `declared_length` bytes.
    pub fn new(declared_length: Option<u64>) -> Self {
        let capacity = declared_length.map_or(0, |len| len.min(64 * 1024) as usize);
        BufferedOutputStream {
            state: Arc::new(Mutex::new(BufferedState {
                data: BytesMut::with_capacity(capacity),
                ..Default::default()
            })),
            declared_length,
            closed: false,
            completion: RequestCompletion::new(),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(stream_closed());
        }
        let mut state = self.state.lock();
        if state.connected {
            return Err(ConnectionError::protocol("cannot write after being connected"));
        }
        if let Some(limit) = self.declared_length {
            if (state.data.len() + buf.len()) as u64 > limit {
                return Err(ConnectionError::protocol(format!(
                    "exceeded content-length limit of {limit} bytes"
                )));
            }
        }
        state.data.extend_from_slice(buf);
        Ok(())
    }
}

impl Write for BufferedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl UploadStream for BufferedOutputStream {
    fn data_provider(&self) -> Box<dyn UploadDataProvider> {
        Box::new(BufferedProvider {
            state: self.state.clone(),
        })
    }

    fn set_connected(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(limit) = self.declared_length {
            if (state.data.len() as u64) < limit {
                return Err(ConnectionError::protocol(
                    "content received is less than Content-Length",
                ));
            }
        }
        state.connected = true;
        Ok(())
    }

    fn check_received_enough_content(&self) -> Result<()> {
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

struct BufferedProvider {
    state: Arc<Mutex<BufferedState>>,
}

impl UploadDataProvider for BufferedProvider {
    fn length(&self) -> Option<u64> {
        Some(self.state.lock().data.len() as u64)
    }

    fn read(&mut self, sink: &dyn UploadDataSink, max_bytes: usize) {
        let chunk = {
            let mut state = self.state.lock();
            let end = state.data.len().min(state.position + max_bytes);
            let chunk = Bytes::copy_from_slice(&state.data[state.position..end]);
            state.position = end;
            chunk
        };
        sink.on_read_succeeded(chunk, false);
    }

    fn rewind(&mut self, sink: &dyn UploadDataSink) {
        self.state.lock().position = 0;
        sink.on_rewind_succeeded();
    }
}
