//! [`Engine`] implementation on `reqwest` and an owned `tokio` runtime.
//!
//! Each request is driven by one tokio task. The task talks to the blocking
//! side in two directions:
//!
//! - commands (`start`, `read`, `follow_redirect`, `cancel`) arrive over an
//!   unbounded channel from [`UrlRequest`] calls;
//! - callbacks and upload provider calls are posted to the request's
//!   [`Executor`], so they run on the thread parked in the connection.
//!
//! The client never follows redirects itself. A 3xx with `Location` is
//! reported through `on_redirect_received` and the task waits for the
//! callback's decision.

use super::{
    Engine, Executor, RequestParams, UploadAttachment, UploadDataProvider, UploadDataSink,
    UrlRequest, UrlRequestCallback, UrlResponseInfo,
};
use crate::config::EngineConfig;
use crate::error::{ConnectionError, RequestError, RequestErrorKind, Result};
use crate::protocol::constants::headers::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use crate::protocol::is_redirect_status;
use bytes::Bytes;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue, TRANSFER_ENCODING};
use http::Method;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Largest chunk requested from an upload provider per read.
const UPLOAD_READ_SIZE: usize = 16 * 1024;

/// Production engine backed by a shared [`reqwest::Client`].
///
/// # Examples
///
/// ```no_run
/// use url_connection::{EngineConfig, ReqwestEngine};
///
/// let engine = ReqwestEngine::with_config(EngineConfig {
///     request_timeout_ms: 30_000,
///     user_agent: Some("my-app/1.0".into()),
///     ..Default::default()
/// })?;
/// # Ok::<(), url_connection::ConnectionError>(())
/// ```
pub struct ReqwestEngine {
    client: reqwest::Client,
    runtime: Option<Runtime>,
    config: EngineConfig,
}

impl ReqwestEngine {
    /// An engine with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(EngineConfig::default())
    }

    /// An engine with a custom configuration.
    pub fn with_config(config: EngineConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("url-connection-engine")
            .enable_all()
            .build()
            .map_err(|e| ConnectionError::Engine(format!("failed to start runtime: {e}")))?;

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host);
        if config.request_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(config.request_timeout_ms));
        }
        if config.connect_timeout_ms > 0 {
            builder = builder.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|e| ConnectionError::Engine(format!("failed to build client: {e}")))?;

        Ok(ReqwestEngine {
            client,
            runtime: Some(runtime),
            config,
        })
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Engine for ReqwestEngine {
    fn create_request(
        &self,
        params: RequestParams,
        callback: Arc<dyn UrlRequestCallback>,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<dyn UrlRequest>> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| ConnectionError::Engine("engine has been shut down".into()))?;
        let headers = to_header_map(&params.headers)?;
        if params.disable_cache {
            tracing::debug!(url = %params.url, "cache disabled; the engine keeps no cache");
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let request = ReqwestRequest { commands };
        let driver = Driver {
            client: self.client.clone(),
            method: params.method,
            headers,
            upload: params.upload.map(UploadSource::new),
            url_chain: vec![params.url.clone()],
            url: params.url,
            callback,
            executor,
            handle: request.commands.downgrade(),
            commands: receiver,
        };
        runtime.spawn(driver.run());
        Ok(Arc::new(request))
    }
}

impl Drop for ReqwestEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ReqwestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Validate caller headers into a [`HeaderMap`].
fn to_header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConnectionError::InvalidHeader(format!("invalid header name: {name:?}")))?;
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            ConnectionError::InvalidHeader(format!("invalid value for header {name}"))
        })?;
        map.append(header_name, header_value);
    }
    Ok(map)
}

#[derive(Debug)]
enum Command {
    Start,
    Read(usize),
    FollowRedirect,
    Cancel,
}

/// Handle to a request driven by a [`ReqwestEngine`].
#[derive(Clone)]
struct ReqwestRequest {
    commands: mpsc::UnboundedSender<Command>,
}

impl ReqwestRequest {
    fn send(&self, command: Command) {
        if let Err(err) = self.commands.send(command) {
            tracing::trace!(command = ?err.0, "request already finished");
        }
    }
}

impl UrlRequest for ReqwestRequest {
    fn start(&self) {
        self.send(Command::Start);
    }

    fn read(&self, max_bytes: usize) {
        self.send(Command::Read(max_bytes));
    }

    fn follow_redirect(&self) {
        self.send(Command::FollowRedirect);
    }

    fn cancel(&self) {
        self.send(Command::Cancel);
    }
}

/// How a driven request ended, when it did not succeed.
enum Terminal {
    Canceled(Option<Arc<UrlResponseInfo>>),
    Failed(Option<Arc<UrlResponseInfo>>, RequestError),
    /// Every handle was dropped; nobody is listening anymore.
    Closed,
}

impl Terminal {
    fn with_info(self, info: &Arc<UrlResponseInfo>) -> Self {
        match self {
            Terminal::Canceled(None) => Terminal::Canceled(Some(info.clone())),
            Terminal::Failed(None, err) => Terminal::Failed(Some(info.clone()), err),
            other => other,
        }
    }
}

struct Driver {
    client: reqwest::Client,
    method: Method,
    headers: HeaderMap,
    upload: Option<UploadSource>,
    url: Url,
    url_chain: Vec<Url>,
    callback: Arc<dyn UrlRequestCallback>,
    executor: Arc<dyn Executor>,
    // Weak, so dropping every request handle closes `commands` and ends the task.
    handle: mpsc::WeakUnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            match self.commands.recv().await {
                Some(Command::Start) => break,
                Some(Command::Cancel) => {
                    self.post(|callback, request| callback.on_canceled(request, None));
                    return;
                }
                None => return,
                Some(command) => tracing::debug!(?command, "ignoring command before start"),
            }
        }

        tracing::debug!(method = %self.method, url = %self.url, "request started");
        match self.drive().await {
            Ok(info) => {
                tracing::debug!(url = %self.url, status = info.status, "request succeeded");
                self.post(move |callback, request| callback.on_succeeded(request, info));
            }
            Err(Terminal::Canceled(info)) => {
                tracing::debug!(url = %self.url, "request canceled");
                self.post(move |callback, request| callback.on_canceled(request, info));
            }
            Err(Terminal::Failed(info, error)) => {
                tracing::warn!(url = %self.url, error = %error, "request failed");
                self.post(move |callback, request| callback.on_failed(request, info, Some(error)));
            }
            Err(Terminal::Closed) => {
                tracing::debug!(url = %self.url, "request handle dropped");
            }
        }
    }

    async fn drive(&mut self) -> std::result::Result<Arc<UrlResponseInfo>, Terminal> {
        loop {
            let request = self.build_request();
            let client = self.client.clone();
            let response = self
                .interruptible(client.execute(request))
                .await?
                .map_err(|err| Terminal::Failed(None, err.into()))?;
            let info = Arc::new(self.response_info(&response));

            let Some(location) = self.redirect_location(&response) else {
                let started = info.clone();
                self.post(move |callback, request| callback.on_response_started(request, started));
                return self.stream_body(response, info).await;
            };

            tracing::debug!(status = info.status, location = %location, "redirect received");
            let reported = info.clone();
            let target = location.clone();
            self.post(move |callback, request| {
                callback.on_redirect_received(request, reported, &target)
            });
            self.await_follow(&info).await?;
            self.follow(info.status, &location, &info).await?;
        }
    }

    fn build_request(&self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method.clone(), self.url.clone());
        *request.headers_mut() = self.headers.clone();
        if let Some(upload) = &self.upload {
            *request.body_mut() = Some(upload.body());
        }
        request
    }

    fn response_info(&self, response: &reqwest::Response) -> UrlResponseInfo {
        let status = response.status();
        UrlResponseInfo {
            url_chain: self.url_chain.clone(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers: response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            negotiated_protocol: format!("{:?}", response.version()),
            was_cached: false,
        }
    }

    /// The redirect target of a 3xx response, resolved against the current
    /// URL. Unresolvable locations are passed through unchanged.
    fn redirect_location(&self, response: &reqwest::Response) -> Option<String> {
        if !is_redirect_status(response.status().as_u16()) {
            return None;
        }
        let location = response.headers().get(LOCATION)?.to_str().ok()?;
        Some(match self.url.join(location) {
            Ok(url) => url.to_string(),
            Err(_) => location.to_string(),
        })
    }

    async fn await_follow(&mut self, info: &Arc<UrlResponseInfo>) -> std::result::Result<(), Terminal> {
        loop {
            match self.commands.recv().await {
                Some(Command::FollowRedirect) => return Ok(()),
                Some(Command::Cancel) => return Err(Terminal::Canceled(Some(info.clone()))),
                None => return Err(Terminal::Closed),
                Some(command) => tracing::debug!(?command, "ignoring command while awaiting redirect decision"),
            }
        }
    }

    /// Move to the redirect target, rewriting the method and body the way
    /// browsers do.
    async fn follow(
        &mut self,
        status: u16,
        location: &str,
        info: &Arc<UrlResponseInfo>,
    ) -> std::result::Result<(), Terminal> {
        let target = Url::parse(location).map_err(|err| {
            Terminal::Failed(
                Some(info.clone()),
                RequestError::new(RequestErrorKind::Redirect, format!("invalid location {location}: {err}")),
            )
        })?;

        let to_get = (status == 303 && self.method != Method::HEAD)
            || (matches!(status, 301 | 302) && self.method == Method::POST);
        if to_get {
            self.method = Method::GET;
            self.upload = None;
            for name in [CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING] {
                self.headers.remove(name);
            }
        } else if let Some(upload) = self.upload.clone() {
            self.interruptible(async move { upload.rewind().await })
                .await
                .map_err(|terminal| terminal.with_info(info))?
                .map_err(|err| Terminal::Failed(Some(info.clone()), err))?;
        }

        tracing::debug!(method = %self.method, url = %target, "following redirect");
        self.url_chain.push(target.clone());
        self.url = target;
        Ok(())
    }

    /// Answer `read` commands from the response body until it ends.
    async fn stream_body(
        &mut self,
        response: reqwest::Response,
        info: Arc<UrlResponseInfo>,
    ) -> std::result::Result<Arc<UrlResponseInfo>, Terminal> {
        let mut body = Box::pin(response.bytes_stream());
        let mut leftover = Bytes::new();
        loop {
            let max_bytes = match self.commands.recv().await {
                Some(Command::Read(max_bytes)) => max_bytes.max(1),
                Some(Command::Cancel) => return Err(Terminal::Canceled(Some(info))),
                None => return Err(Terminal::Closed),
                Some(command) => {
                    tracing::debug!(?command, "ignoring command while reading body");
                    continue;
                }
            };
            while leftover.is_empty() {
                match self
                    .interruptible(body.next())
                    .await
                    .map_err(|terminal| terminal.with_info(&info))?
                {
                    Some(Ok(chunk)) => leftover = chunk,
                    Some(Err(err)) => return Err(Terminal::Failed(Some(info), err.into())),
                    None => return Ok(info),
                }
            }
            let data = leftover.split_to(max_bytes.min(leftover.len()));
            let current = info.clone();
            self.post(move |callback, request| callback.on_read_completed(request, current, data));
        }
    }

    /// Await `future` while staying responsive to `cancel`.
    async fn interruptible<F: Future>(&mut self, future: F) -> std::result::Result<F::Output, Terminal> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Ok(output),
                command = self.commands.recv() => match command {
                    Some(Command::Cancel) => return Err(Terminal::Canceled(None)),
                    None => return Err(Terminal::Closed),
                    Some(command) => tracing::debug!(?command, "ignoring command while busy"),
                },
            }
        }
    }

    /// Post a callback invocation to the request's executor.
    fn post<F>(&self, event: F)
    where
        F: FnOnce(&dyn UrlRequestCallback, &dyn UrlRequest) + Send + 'static,
    {
        let Some(commands) = self.handle.upgrade() else {
            tracing::trace!(url = %self.url, "no request handle left; dropping callback");
            return;
        };
        let callback = self.callback.clone();
        let request = ReqwestRequest { commands };
        self.executor
            .execute(Box::new(move || event(callback.as_ref(), &request)));
    }
}

/// Answer to a provider call, relayed from the executor thread.
#[derive(Debug)]
enum SinkReply {
    Read(Bytes, bool),
    ReadError(ConnectionError),
    Rewound,
    RewindError(ConnectionError),
}

struct ChannelSink {
    reply: Mutex<Option<oneshot::Sender<SinkReply>>>,
}

impl ChannelSink {
    fn answer(&self, reply: SinkReply) {
        if let Some(sender) = self.reply.lock().take() {
            let _ = sender.send(reply);
        }
    }
}

impl UploadDataSink for ChannelSink {
    fn on_read_succeeded(&self, data: Bytes, final_chunk: bool) {
        self.answer(SinkReply::Read(data, final_chunk));
    }

    fn on_read_error(&self, error: ConnectionError) {
        self.answer(SinkReply::ReadError(error));
    }

    fn on_rewind_succeeded(&self) {
        self.answer(SinkReply::Rewound);
    }

    fn on_rewind_error(&self, error: ConnectionError) {
        self.answer(SinkReply::RewindError(error));
    }
}

enum ProviderCall {
    Read(usize),
    Rewind,
}

/// The request body as seen from the engine: provider calls are posted to
/// the executor and answered through a one-shot channel.
#[derive(Clone)]
struct UploadSource {
    provider: Arc<Mutex<Box<dyn UploadDataProvider>>>,
    executor: Arc<dyn Executor>,
    length: Option<u64>,
}

impl UploadSource {
    fn new(attachment: UploadAttachment) -> Self {
        UploadSource {
            length: attachment.provider.length(),
            provider: Arc::new(Mutex::new(attachment.provider)),
            executor: attachment.executor,
        }
    }

    async fn call(&self, call: ProviderCall) -> std::result::Result<SinkReply, RequestError> {
        let (sender, receiver) = oneshot::channel();
        let provider = self.provider.clone();
        self.executor.execute(Box::new(move || {
            let sink = ChannelSink {
                reply: Mutex::new(Some(sender)),
            };
            let mut provider = provider.lock();
            match call {
                ProviderCall::Read(max_bytes) => provider.read(&sink, max_bytes),
                ProviderCall::Rewind => provider.rewind(&sink),
            }
        }));
        receiver.await.map_err(|_| {
            RequestError::new(RequestErrorKind::Body, "upload data provider did not answer")
        })
    }

    async fn rewind(&self) -> std::result::Result<(), RequestError> {
        match self.call(ProviderCall::Rewind).await? {
            SinkReply::Rewound => Ok(()),
            SinkReply::RewindError(err) => Err(RequestError::new(RequestErrorKind::Body, err.to_string())),
            other => Err(RequestError::new(
                RequestErrorKind::Body,
                format!("unexpected answer to rewind: {other:?}"),
            )),
        }
    }

    /// A streaming body that pulls from the provider as hyper polls it.
    fn body(&self) -> reqwest::Body {
        struct State {
            source: UploadSource,
            remaining: Option<u64>,
            finished: bool,
        }

        let state = State {
            source: self.clone(),
            remaining: self.length,
            finished: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            if state.finished || state.remaining == Some(0) {
                return None;
            }
            let max_bytes = state
                .remaining
                .map_or(UPLOAD_READ_SIZE, |remaining| remaining.min(UPLOAD_READ_SIZE as u64) as usize);
            let item = match state.source.call(ProviderCall::Read(max_bytes)).await {
                Ok(SinkReply::Read(data, final_chunk)) => {
                    if let Some(remaining) = state.remaining.as_mut() {
                        *remaining = remaining.saturating_sub(data.len() as u64);
                    }
                    state.finished = final_chunk;
                    Ok(data)
                }
                Ok(SinkReply::ReadError(err)) => {
                    state.finished = true;
                    Err(io::Error::from(err))
                }
                Ok(other) => {
                    state.finished = true;
                    Err(io::Error::other(format!("unexpected answer to read: {other:?}")))
                }
                Err(err) => {
                    state.finished = true;
                    Err(io::Error::other(err))
                }
            };
            Some((item, state))
        });
        reqwest::Body::wrap_stream(stream)
    }
}
