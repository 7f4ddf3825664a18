#![warn(missing_docs)]

//! # url_connection: blocking HTTP over an asynchronous engine
//!
//! This crate implements the classic blocking URL-connection interface
//! (configure, connect, write a request body, read status, headers and body)
//! on top of an asynchronous, callback-driven HTTP request engine.
//!
//! Every blocking call drives the engine request to its next point of
//! interest and parks the calling thread until a callback releases it.
//!
//! ## Overview
//!
//! 1. **Request lifecycle** - the request is built and started exactly once,
//!    on the first of `connect`, output-stream acquisition (streaming modes)
//!    or response access
//! 2. **Blocking bridge** - a message loop that the caller parks in; engine
//!    callbacks run on the parked thread
//! 3. **Request headers** - one entry per case-insensitive name, frozen once
//!    the request starts
//! 4. **Upload strategies** - chunked, fixed-length streaming, or buffered
//! 5. **Redirect policy** - same-protocol redirects are followed when enabled;
//!    otherwise the redirect itself is the response
//! 6. **Response headers** - ordinal and name → values views
//!
//! ## Usage
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//! use url_connection::{HttpUrlConnection, ReqwestEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(ReqwestEngine::new()?);
//!
//! let mut connection = HttpUrlConnection::new("http://localhost:8080/echo".parse()?, engine);
//! connection.set_do_output(true)?;
//! connection.set_fixed_length_streaming_mode(5)?;
//! connection.output_stream()?.write_all(b"hello")?;
//!
//! assert_eq!(connection.response_code()?, 200);
//! let mut body = Vec::new();
//! connection.input_stream()?.read_to_end(&mut body)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - [`connection`] - [`HttpUrlConnection`], the lifecycle, bridge, callback
//!   adapter, body reader and upload streams
//! - [`engine`] - the engine seam and [`ReqwestEngine`]
//! - [`protocol`] - header store, response header views, HTTP constants
//! - [`config`] - [`ConnectionConfig`] and [`EngineConfig`]
//! - [`error`] - [`ConnectionError`] and [`Result`]

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod protocol;

pub use config::{ConnectionConfig, EngineConfig};
pub use connection::{HttpUrlConnection, ResponseBody};
pub use engine::ReqwestEngine;
pub use error::{ConnectionError, RequestError, RequestErrorKind, Result};
