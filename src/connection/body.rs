//! Blocking reader for the response body.

use super::lifecycle::{Exchange, RequestCompletion};
use crate::error::Result;
use crate::protocol::constants::READ_BUFFER_SIZE;
use bytes::{Buf, Bytes};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

/// The response body of a connection, read with [`std::io::Read`].
///
/// Each refill issues one engine read and waits at most the connection's read
/// timeout. Once the request completes, reads return the remaining buffered
/// bytes and then either end of stream or the recorded failure.
pub struct ResponseBody {
    exchange: Arc<Exchange>,
    completion: RequestCompletion,
    buffer: Bytes,
    read_timeout: Option<Duration>,
}

impl ResponseBody {
    pub(crate) fn new(exchange: Arc<Exchange>, read_timeout: Option<Duration>) -> Self {
        ResponseBody {
            exchange,
            completion: RequestCompletion::new(),
            buffer: Bytes::new(),
            read_timeout,
        }
    }

    pub(crate) fn completion(&self) -> RequestCompletion {
        self.completion.clone()
    }

    pub(crate) fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.read_timeout = read_timeout;
    }

    /// Whether the engine reported the end of the response.
    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// Read the rest of the body into memory.
    pub fn read_all(&mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        while self.fill()? {
            out.extend_from_slice(&self.buffer);
            self.buffer.clear();
        }
        Ok(Bytes::from(out))
    }

    /// Make sure `buffer` holds data; `Ok(false)` at end of stream.
    fn fill(&mut self) -> Result<bool> {
        while self.buffer.is_empty() {
            if let Some(outcome) = self.completion.outcome() {
                // Bytes delivered just before completion are still readable.
                match self.exchange.take_read_data() {
                    Some(data) if !data.is_empty() => self.buffer = data,
                    _ => return outcome.map(|()| false),
                }
                continue;
            }
            self.exchange
                .get_more_data(READ_BUFFER_SIZE, self.read_timeout)?;
            if let Some(data) = self.exchange.take_read_data() {
                self.buffer = data;
            }
        }
        Ok(true)
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.fill()? {
            return Ok(0);
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer.advance(n);
        Ok(n)
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("buffered", &self.buffer.len())
            .field("complete", &self.completion.is_complete())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}
