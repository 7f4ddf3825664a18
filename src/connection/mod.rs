//! The blocking connection.
//!
//! [`HttpUrlConnection`] exposes the classic blocking URL-connection surface
//! (configure, connect, write a body, read status, headers and body) on top of
//! an asynchronous [`Engine`]. Every blocking call drives the engine request to
//! its next point of interest and parks the calling thread in the
//! connection's [`MessageLoop`] until the callback adapter releases it.
//!
//! # Module Organization
//!
//! ```text
//! connection/
//! ├── mod       - HttpUrlConnection, request start and response access
//! ├── bridge    - MessageLoop, the blocking bridge and engine executor
//! ├── lifecycle - Phase/Outcome state machine and shared exchange state
//! ├── callback  - engine events → lifecycle transitions
//! ├── body      - ResponseBody reader
//! └── upload    - buffered, fixed-length and chunked request bodies
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use std::sync::Arc;
//! use url_connection::{HttpUrlConnection, ReqwestEngine};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(ReqwestEngine::new()?);
//! let url = url::Url::parse("http://localhost:8080/status").unwrap();
//! let mut connection = HttpUrlConnection::new(url, engine);
//! connection.set_request_property("Accept", "text/plain")?;
//!
//! println!("{}", connection.response_code()?);
//! let mut body = String::new();
//! connection.input_stream()?.read_to_string(&mut body)?;
//! # Ok(())
//! # }
//! ```

mod body;
mod bridge;
mod callback;
mod lifecycle;
pub mod upload;

pub use body::ResponseBody;
pub use bridge::MessageLoop;
pub use lifecycle::{Lifecycle, Outcome, Phase, RequestCompletion};

use crate::config::ConnectionConfig;
use crate::engine::{Engine, Executor, RequestBuilder, UrlResponseInfo};
use crate::error::{ConnectionError, Result};
use crate::protocol::constants::headers::{CONTENT_LENGTH, CONTENT_TYPE};
use crate::protocol::constants::{DEFAULT_CHUNK_LENGTH, DEFAULT_CONTENT_TYPE, HTTP_BAD_REQUEST};
use crate::protocol::{HeaderFields, RequestHeaders, ResponseHeaders};
use callback::ConnectionCallback;
use http::Method;
use lifecycle::Exchange;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use upload::{UploadStrategy, UploadStream};
use url::Url;

/// A blocking HTTP connection to a single URL.
///
/// A connection performs at most one request. Configuration and request
/// headers may be changed until the request starts; the request starts on the
/// first of [`connect`](Self::connect), [`output_stream`](Self::output_stream)
/// (for streaming upload modes) or any accessor that needs the response.
///
/// Not meant for concurrent use by several threads.
pub struct HttpUrlConnection {
    engine: Arc<dyn Engine>,
    config: ConnectionConfig,
    method: Method,
    headers: RequestHeaders,
    exchange: Arc<Exchange>,
    output: Option<Box<dyn UploadStream>>,
    body: ResponseBody,
    response_headers: OnceLock<ResponseHeaders>,
}

impl HttpUrlConnection {
    /// A connection to `url` with the default configuration.
    pub fn new(url: Url, engine: Arc<dyn Engine>) -> Self {
        Self::with_config(url, engine, ConnectionConfig::default())
    }

    /// A connection to `url` with the given configuration.
    pub fn with_config(url: Url, engine: Arc<dyn Engine>, config: ConnectionConfig) -> Self {
        let exchange = Arc::new(Exchange::new(url));
        let body = ResponseBody::new(exchange.clone(), config.read_timeout());
        HttpUrlConnection {
            engine,
            config,
            method: Method::GET,
            headers: RequestHeaders::new(),
            exchange,
            output: None,
            body,
            response_headers: OnceLock::new(),
        }
    }

    // ========== Lifecycle ==========

    /// Start the request if it has not been started yet.
    ///
    /// With `do_output` set and no body stream acquired yet, an empty buffered
    /// body is created first. Calling `connect` again is a no-op.
    pub fn connect(&mut self) -> Result<()> {
        self.ensure_output_stream()?;
        self.start_request()
    }

    /// Cancel the request if it was started. Before that, does nothing.
    pub fn disconnect(&mut self) {
        if let Some(request) = self.exchange.request() {
            tracing::debug!(url = %self.exchange.url(), "disconnect");
            request.cancel();
        }
    }

    /// Whether the request has been started.
    pub fn is_connected(&self) -> bool {
        self.exchange.is_connected()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.exchange.lifecycle.lock().phase().clone()
    }

    /// The connection's URL. After a followed redirect this is the redirect
    /// target.
    pub fn url(&self) -> Url {
        self.exchange.url()
    }

    /// Always `false`: proxies are not detected.
    pub fn using_proxy(&self) -> bool {
        false
    }

    // ========== Request body ==========

    /// The writable request body.
    ///
    /// Requires `do_output`. In chunked and fixed-length modes, acquiring the
    /// stream starts the request; in buffered mode the request starts on
    /// [`connect`](Self::connect) or the first response access. Repeated calls
    /// return the same stream.
    pub fn output_stream(&mut self) -> Result<&mut dyn UploadStream> {
        if !self.config.do_output {
            return Err(ConnectionError::protocol(
                "output is disabled; call set_do_output(true) first",
            ));
        }
        self.ensure_output_stream()?;
        match self.output.as_mut() {
            Some(stream) => Ok(&mut **stream),
            None => Err(ConnectionError::Invariant("output stream missing after creation")),
        }
    }

    fn ensure_output_stream(&mut self) -> Result<()> {
        if self.output.is_some() || !self.config.do_output {
            return Ok(());
        }
        if self.is_connected() {
            return Err(ConnectionError::protocol(
                "cannot write to output stream after receiving response",
            ));
        }
        let strategy =
            UploadStrategy::select(&self.config, self.headers.get(CONTENT_LENGTH.as_str()))?;
        self.output = Some(strategy.open(self.exchange.message_loop.clone()));
        if strategy.starts_immediately() {
            // All headers are known, so the body can stream as it is written.
            if let Err(err) = self.start_request() {
                self.output = None;
                return Err(err);
            }
        }
        Ok(())
    }

    // ========== Response ==========

    /// HTTP status code of the response.
    pub fn response_code(&mut self) -> Result<u16> {
        Ok(self.ensure_response()?.status)
    }

    /// HTTP reason phrase of the response.
    pub fn response_message(&mut self) -> Result<String> {
        Ok(self.ensure_response()?.status_text.clone())
    }

    /// Full response metadata.
    pub fn response_info(&mut self) -> Result<Arc<UrlResponseInfo>> {
        self.ensure_response()
    }

    /// The response body.
    ///
    /// Fails with [`ConnectionError::RedirectBody`] when the response is an
    /// unfollowed redirect and redirects are disabled, and with
    /// [`ConnectionError::NotFound`] for status codes of 400 and above; use
    /// [`error_stream`](Self::error_stream) for those.
    pub fn input_stream(&mut self) -> Result<&mut ResponseBody> {
        if !self.config.do_input {
            return Err(ConnectionError::protocol(
                "input is disabled; call set_do_input(true) first",
            ));
        }
        let info = self.ensure_response()?;
        if !self.config.instance_follow_redirects
            && self.exchange.lifecycle.lock().redirect_observed()
        {
            return Err(ConnectionError::RedirectBody);
        }
        if info.status >= HTTP_BAD_REQUEST {
            return Err(ConnectionError::NotFound(self.exchange.url().to_string()));
        }
        Ok(&mut self.body)
    }

    /// The response body of an error response (status 400 and above), or
    /// `None` for successful responses and failed requests.
    pub fn error_stream(&mut self) -> Option<&mut ResponseBody> {
        match self.ensure_response() {
            Ok(info) if info.status >= HTTP_BAD_REQUEST => Some(&mut self.body),
            _ => None,
        }
    }

    // ========== Response headers ==========

    /// All response headers as name → values. Empty when the request failed.
    pub fn header_fields(&mut self) -> &HeaderFields {
        match self.response_headers() {
            Ok(headers) => headers.map_view(),
            Err(_) => HeaderFields::empty_ref(),
        }
    }

    /// Last value of the response header `name`.
    pub fn header_field(&mut self, name: &str) -> Option<&str> {
        self.header_fields().last(name)
    }

    /// Name of the response header at position `pos`.
    pub fn header_field_key(&mut self, pos: usize) -> Option<&str> {
        let headers = self.response_headers().ok()?;
        headers.indexed_entry(pos).map(|(name, _)| name)
    }

    /// Value of the response header at position `pos`.
    pub fn header_field_at(&mut self, pos: usize) -> Option<&str> {
        let headers = self.response_headers().ok()?;
        headers.indexed_entry(pos).map(|(_, value)| value)
    }

    /// Parsed `Content-Length` response header.
    pub fn content_length(&mut self) -> Option<u64> {
        self.header_field(CONTENT_LENGTH.as_str())?.trim().parse().ok()
    }

    /// `Content-Type` response header.
    pub fn content_type(&mut self) -> Option<&str> {
        self.header_field(CONTENT_TYPE.as_str())
    }

    fn response_headers(&mut self) -> Result<&ResponseHeaders> {
        let info = self.ensure_response()?;
        Ok(self
            .response_headers
            .get_or_init(|| ResponseHeaders::new(info.header_pairs())))
    }

    // ========== Request headers ==========

    /// Set a request header, replacing any existing value.
    pub fn set_request_property(&mut self, name: &str, value: &str) -> Result<()> {
        self.headers.set(name, value)
    }

    /// Add a request header. Adding a name that is already present fails
    /// with [`ConnectionError::Unsupported`].
    pub fn add_request_property(&mut self, name: &str, value: &str) -> Result<()> {
        self.headers.add(name, value)
    }

    /// Value of the request header `name`.
    pub fn request_property(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// All request headers. Fails once the request started.
    pub fn request_properties(&self) -> Result<HeaderFields> {
        self.headers.snapshot()
    }

    // ========== Configuration ==========

    /// Current configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The HTTP method.
    pub fn request_method(&self) -> &Method {
        &self.method
    }

    /// Set the HTTP method, e.g. `"PUT"`.
    pub fn set_request_method(&mut self, method: &str) -> Result<()> {
        self.check_not_connected()?;
        self.method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ConnectionError::protocol(format!("invalid HTTP method: {method}")))?;
        Ok(())
    }

    /// Whether a response body will be read.
    pub fn set_do_input(&mut self, do_input: bool) -> Result<()> {
        self.check_not_connected()?;
        self.config.do_input = do_input;
        Ok(())
    }

    /// Whether a request body will be written. A `GET` becomes a `POST`.
    pub fn set_do_output(&mut self, do_output: bool) -> Result<()> {
        self.check_not_connected()?;
        self.config.do_output = do_output;
        Ok(())
    }

    /// Whether the engine may answer from its cache.
    pub fn set_use_caches(&mut self, use_caches: bool) -> Result<()> {
        self.check_not_connected()?;
        self.config.use_caches = use_caches;
        Ok(())
    }

    /// Whether same-protocol redirects are followed.
    pub fn set_instance_follow_redirects(&mut self, follow: bool) -> Result<()> {
        self.check_not_connected()?;
        self.config.instance_follow_redirects = follow;
        Ok(())
    }

    /// Stream the body in chunks of `chunk_length` bytes; `0` picks the
    /// default of 4096.
    pub fn set_chunked_streaming_mode(&mut self, chunk_length: usize) -> Result<()> {
        self.check_not_connected()?;
        if self.config.fixed_content_length.is_some() {
            return Err(ConnectionError::illegal_state(
                "fixed length streaming mode already set",
            ));
        }
        self.config.chunk_length = if chunk_length == 0 {
            DEFAULT_CHUNK_LENGTH
        } else {
            chunk_length
        };
        Ok(())
    }

    /// Stream a body of exactly `content_length` bytes.
    pub fn set_fixed_length_streaming_mode(&mut self, content_length: u64) -> Result<()> {
        self.check_not_connected()?;
        if self.config.is_chunked() {
            return Err(ConnectionError::illegal_state(
                "chunked streaming mode already set",
            ));
        }
        self.config.fixed_content_length = Some(content_length);
        Ok(())
    }

    /// Upper bound for a single body read; `None` waits forever.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.check_not_connected()?;
        // Sub-millisecond timeouts round up; 0 means no timeout.
        self.config.read_timeout_ms = timeout.map_or(0, |timeout| {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            u64::try_from(millis).unwrap_or(u64::MAX)
        });
        self.body.set_read_timeout(self.config.read_timeout());
        Ok(())
    }

    /// Ignored: the engine binds sockets late by host and port, so a
    /// per-request connect timeout has no meaning. Configure
    /// [`EngineConfig::connect_timeout_ms`](crate::EngineConfig) instead.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        tracing::warn!(?timeout, "set_connect_timeout is not supported by this connection");
    }

    fn check_not_connected(&self) -> Result<()> {
        if self.is_connected() {
            return Err(ConnectionError::illegal_state(
                "cannot change configuration after connection is made",
            ));
        }
        Ok(())
    }

    // ========== Request start ==========

    /// Build and start the engine request. No-op once started.
    ///
    /// Method and header changes implied by the body are made on copies and
    /// only kept once the engine accepted the request.
    fn start_request(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let content_length = CONTENT_LENGTH.as_str();
        let mut method = self.method.clone();
        let mut headers = self.headers.clone();

        if self.config.do_output {
            if method == Method::GET {
                method = Method::POST;
            }
            match &self.output {
                Some(stream) => {
                    if headers.get(content_length).is_none() && !self.config.is_chunked() {
                        if let Some(length) = stream.data_provider().length() {
                            headers.add(content_length, &length.to_string())?;
                        }
                    }
                }
                None => {
                    if headers.get(content_length).is_none() {
                        headers.add(content_length, "0")?;
                    }
                }
            }
            if headers.get(CONTENT_TYPE.as_str()).is_none() {
                headers.add(CONTENT_TYPE.as_str(), DEFAULT_CONTENT_TYPE)?;
            }
        }

        let callback = Arc::new(ConnectionCallback::new(
            &self.exchange,
            self.config.instance_follow_redirects,
            self.body.completion(),
            self.output.as_ref().map(|stream| stream.completion()),
        ));
        let executor: Arc<dyn Executor> = self.exchange.message_loop.clone();
        let mut builder = RequestBuilder::new(
            self.exchange.url(),
            callback,
            executor.clone(),
            self.engine.clone(),
        );
        for (name, value) in headers.iter() {
            builder = builder.add_header(name, value);
        }
        if let Some(stream) = &self.output {
            builder = builder.upload_data_provider(stream.data_provider(), executor);
        }
        if !self.config.use_caches {
            builder = builder.disable_cache();
        }
        let request = builder.http_method(method.clone()).build()?;
        if let Some(stream) = self.output.as_mut() {
            stream.set_connected()?;
        }

        headers.freeze();
        self.method = method;
        self.headers = headers;
        if !self.exchange.attach(request.clone()) {
            return Err(ConnectionError::Invariant("request started twice"));
        }
        tracing::debug!(
            method = %self.method,
            url = %self.exchange.url(),
            headers = self.headers.len(),
            "starting request"
        );
        request.start();
        Ok(())
    }

    /// Block until response headers or a terminal event are available.
    fn ensure_response(&mut self) -> Result<Arc<UrlResponseInfo>> {
        if let Some(stream) = self.output.as_mut() {
            stream.check_received_enough_content()?;
            if self.config.is_chunked() {
                stream.close()?;
            }
        }
        if !self.exchange.has_response() {
            self.start_request()?;
            while !self.exchange.has_response() {
                self.exchange.message_loop.run()?;
            }
        }
        self.exchange.lifecycle.lock().check_response()
    }
}

impl Drop for HttpUrlConnection {
    fn drop(&mut self) {
        let in_flight = {
            let lifecycle = self.exchange.lifecycle.lock();
            lifecycle.is_connected() && !lifecycle.is_complete()
        };
        if in_flight {
            if let Some(request) = self.exchange.request() {
                tracing::debug!(url = %self.exchange.url(), "canceling request of dropped connection");
                request.cancel();
            }
        }
    }
}

impl fmt::Debug for HttpUrlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUrlConnection")
            .field("url", &self.exchange.url().as_str())
            .field("method", &self.method)
            .field("phase", &self.phase())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
