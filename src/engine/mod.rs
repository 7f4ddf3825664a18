//! The asynchronous request engine seam.
//!
//! A blocking connection never performs network I/O itself. It builds a
//! request through [`RequestBuilder`], hands it to an [`Engine`], and then
//! waits for the engine to report progress through a [`UrlRequestCallback`].
//!
//! # Contract
//!
//! - Every callback and every [`UploadDataProvider`] call is posted to the
//!   [`Executor`] supplied with the request; engines never invoke them inline
//!   from their own threads.
//! - A started request produces exactly one of: `response_started` followed by
//!   a terminal event, `failed`, or `canceled`. Redirects may precede any of
//!   them.
//! - `read_completed` is only delivered in answer to an outstanding
//!   [`UrlRequest::read`].
//!
//! # Module Organization
//!
//! ```text
//! engine/
//! ├── mod            - traits, request builder, response info
//! └── reqwest_engine - Engine implementation on reqwest + tokio
//! ```

mod reqwest_engine;

pub use reqwest_engine::ReqwestEngine;

use crate::error::{ConnectionError, RequestError, Result};
use bytes::Bytes;
use http::Method;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// A unit of work posted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks posted by an engine.
pub trait Executor: Send + Sync {
    /// Queue `task` for execution.
    fn execute(&self, task: Task);
}

/// A started (or startable) asynchronous request.
pub trait UrlRequest: Send + Sync {
    /// Begin executing the request.
    fn start(&self);

    /// Ask for up to `max_bytes` of response body.
    fn read(&self, max_bytes: usize);

    /// Continue to the location reported by the last redirect.
    fn follow_redirect(&self);

    /// Cancel the request; results in a `canceled` callback unless the request
    /// already finished.
    fn cancel(&self);
}

/// Receives request progress from an engine.
pub trait UrlRequestCallback: Send + Sync {
    /// The server answered with a redirect to `new_location`.
    fn on_redirect_received(
        &self,
        request: &dyn UrlRequest,
        info: Arc<UrlResponseInfo>,
        new_location: &str,
    );

    /// Response status and headers are available.
    fn on_response_started(&self, request: &dyn UrlRequest, info: Arc<UrlResponseInfo>);

    /// An outstanding read produced `data`.
    fn on_read_completed(&self, request: &dyn UrlRequest, info: Arc<UrlResponseInfo>, data: Bytes);

    /// The response body was fully received.
    fn on_succeeded(&self, request: &dyn UrlRequest, info: Arc<UrlResponseInfo>);

    /// The request failed; `error` must be present.
    fn on_failed(
        &self,
        request: &dyn UrlRequest,
        info: Option<Arc<UrlResponseInfo>>,
        error: Option<RequestError>,
    );

    /// The request was canceled.
    fn on_canceled(&self, request: &dyn UrlRequest, info: Option<Arc<UrlResponseInfo>>);
}

/// Supplies request body bytes to an engine.
pub trait UploadDataProvider: Send {
    /// Total body length, or `None` for chunked bodies of unknown length.
    fn length(&self) -> Option<u64>;

    /// Deliver at most `max_bytes` through `sink`.
    fn read(&mut self, sink: &dyn UploadDataSink, max_bytes: usize);

    /// Restart the body from the beginning, answering through `sink`.
    fn rewind(&mut self, sink: &dyn UploadDataSink);
}

/// Engine-side receiver of [`UploadDataProvider`] answers.
pub trait UploadDataSink: Send + Sync {
    /// A read produced `data`; `final_chunk` marks the end of a chunked body.
    fn on_read_succeeded(&self, data: Bytes, final_chunk: bool);

    /// A read failed.
    fn on_read_error(&self, error: ConnectionError);

    /// The provider is back at the start of the body.
    fn on_rewind_succeeded(&self);

    /// The provider cannot rewind.
    fn on_rewind_error(&self, error: ConnectionError);
}

/// Creates requests.
pub trait Engine: Send + Sync {
    /// Create a request from `params`; callbacks and upload reads are posted
    /// to `executor`.
    fn create_request(
        &self,
        params: RequestParams,
        callback: Arc<dyn UrlRequestCallback>,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<dyn UrlRequest>>;
}

/// Request body attached to [`RequestParams`].
pub struct UploadAttachment {
    /// Source of body bytes.
    pub provider: Box<dyn UploadDataProvider>,
    /// Where provider calls are posted.
    pub executor: Arc<dyn Executor>,
}

impl fmt::Debug for UploadAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadAttachment")
            .field("length", &self.provider.length())
            .finish_non_exhaustive()
    }
}

/// Everything an engine needs to execute a request.
#[derive(Debug)]
pub struct RequestParams {
    /// Target URL.
    pub url: Url,
    /// HTTP method.
    pub method: Method,
    /// Headers in the order they are sent.
    pub headers: Vec<(String, String)>,
    /// Request body, if any.
    pub upload: Option<UploadAttachment>,
    /// Bypass any response cache.
    pub disable_cache: bool,
}

/// Builder for a single engine request.
///
/// # Examples
///
/// ```ignore
/// let request = RequestBuilder::new(url, callback, executor.clone(), engine)
///     .add_header("Accept", "text/plain")
///     .http_method(Method::POST)
///     .upload_data_provider(provider, executor)
///     .disable_cache()
///     .build()?;
/// request.start();
/// ```
pub struct RequestBuilder {
    engine: Arc<dyn Engine>,
    callback: Arc<dyn UrlRequestCallback>,
    executor: Arc<dyn Executor>,
    params: RequestParams,
}

impl RequestBuilder {
    /// Start building a `GET` for `url`.
    pub fn new(
        url: Url,
        callback: Arc<dyn UrlRequestCallback>,
        executor: Arc<dyn Executor>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        RequestBuilder {
            engine,
            callback,
            executor,
            params: RequestParams {
                url,
                method: Method::GET,
                headers: Vec::new(),
                upload: None,
                disable_cache: false,
            },
        }
    }

    /// Append a header.
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.params
            .headers
            .push((name.to_string(), value.to_string()));
        self
    }

    /// Set the HTTP method.
    pub fn http_method(mut self, method: Method) -> Self {
        self.params.method = method;
        self
    }

    /// Attach a request body; provider calls are posted to `executor`.
    pub fn upload_data_provider(
        mut self,
        provider: Box<dyn UploadDataProvider>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        self.params.upload = Some(UploadAttachment { provider, executor });
        self
    }

    /// Bypass the engine's response cache.
    pub fn disable_cache(mut self) -> Self {
        self.params.disable_cache = true;
        self
    }

    /// Create the request. It does not run until [`UrlRequest::start`].
    pub fn build(self) -> Result<Arc<dyn UrlRequest>> {
        self.engine
            .create_request(self.params, self.callback, self.executor)
    }
}

/// Response metadata reported with every callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlResponseInfo {
    /// The original URL followed by every redirect target that was followed.
    pub url_chain: Vec<Url>,
    /// HTTP status code.
    pub status: u16,
    /// HTTP reason phrase.
    pub status_text: String,
    /// Header lines in arrival order.
    pub headers: Vec<(String, String)>,
    /// Protocol used on the wire, e.g. `HTTP/1.1`.
    pub negotiated_protocol: String,
    /// Whether the response came from a cache.
    pub was_cached: bool,
}

impl UrlResponseInfo {
    /// The URL this response was received from.
    pub fn url(&self) -> Option<&Url> {
        self.url_chain.last()
    }

    /// Header lines as borrowed pairs.
    pub fn header_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_info_url_is_last_in_chain() {
        let info = UrlResponseInfo {
            url_chain: vec![
                Url::parse("http://a.test/").unwrap(),
                Url::parse("http://b.test/final").unwrap(),
            ],
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("A".to_string(), "1".to_string())],
            negotiated_protocol: "HTTP/1.1".to_string(),
            was_cached: false,
        };
        assert_eq!(info.url().map(Url::as_str), Some("http://b.test/final"));
        assert_eq!(info.header_pairs().collect::<Vec<_>>(), vec![("A", "1")]);
    }
}
