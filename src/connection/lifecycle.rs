//! Request lifecycle state machine.
//!
//! All cross-context state of a connection lives here. The caller thread
//! starts the request; the callback adapter (running inside the message loop)
//! records responses and terminal outcomes. Transition guards are centralized
//! in [`Lifecycle`] instead of being re-checked ad hoc at each call site.
//!
//! ```text
//!  NotConnected ──start──▶ Started ──response──▶ ResponseStarted
//!                             │                        │
//!                             └──────terminal──────────┴──▶ Completed(Outcome)
//! ```

use super::bridge::MessageLoop;
use crate::engine::{UrlRequest, UrlResponseInfo};
use crate::error::{ConnectionError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use url::Url;

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The response body was fully received.
    Succeeded,
    /// A redirect was not followed; the redirect itself is the response.
    RedirectStopped,
    /// The engine reported a failure.
    Failed(ConnectionError),
    /// The request was canceled.
    Canceled,
}

impl Outcome {
    /// The failure every later accessor should see, if any.
    pub fn failure(&self) -> Option<ConnectionError> {
        match self {
            Outcome::Succeeded | Outcome::RedirectStopped => None,
            Outcome::Failed(err) => Some(err.clone()),
            Outcome::Canceled => Some(ConnectionError::StreamClosed),
        }
    }
}

/// Position in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Configuration and headers are still mutable.
    NotConnected,
    /// The request was built and started.
    Started,
    /// Status and headers have arrived.
    ResponseStarted,
    /// A terminal event was received.
    Completed(Outcome),
}

/// Cross-context connection state.
#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
    url: Url,
    response: Option<Arc<UrlResponseInfo>>,
    redirect_observed: bool,
    read_data: Option<Bytes>,
    read_outstanding: bool,
}

impl Lifecycle {
    /// A lifecycle for a connection to `url`.
    pub fn new(url: Url) -> Self {
        Lifecycle {
            phase: Phase::NotConnected,
            url,
            response: None,
            redirect_observed: false,
            read_data: None,
            read_outstanding: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// `NotConnected → Started`. Returns `false` when already started.
    pub fn begin(&mut self) -> bool {
        if self.phase != Phase::NotConnected {
            return false;
        }
        self.phase = Phase::Started;
        true
    }

    /// Whether the request has been started.
    pub fn is_connected(&self) -> bool {
        self.phase != Phase::NotConnected
    }

    /// Whether headers or a terminal event have arrived.
    pub fn has_response(&self) -> bool {
        matches!(self.phase, Phase::ResponseStarted | Phase::Completed(_))
    }

    /// Whether a terminal event has arrived.
    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Completed(_))
    }

    /// The connection's current URL; redirects may have changed it.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replace the current URL after a redirect.
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Whether any redirect was reported.
    pub fn redirect_observed(&self) -> bool {
        self.redirect_observed
    }

    /// Note that a redirect was reported.
    pub fn observe_redirect(&mut self) {
        self.redirect_observed = true;
    }

    /// Most recent response metadata.
    pub fn response(&self) -> Option<&Arc<UrlResponseInfo>> {
        self.response.as_ref()
    }

    /// Store response metadata, unless the lifecycle already completed.
    pub fn record_response(&mut self, info: Option<Arc<UrlResponseInfo>>) {
        if self.is_complete() {
            return;
        }
        if let Some(info) = info {
            self.response = Some(info);
        }
    }

    /// `Started → ResponseStarted`.
    pub fn response_started(&mut self, info: Arc<UrlResponseInfo>) {
        self.record_response(Some(info));
        if self.phase == Phase::Started {
            self.phase = Phase::ResponseStarted;
        }
    }

    /// Store bytes delivered by a read and clear the outstanding read.
    pub fn read_completed(&mut self, info: Arc<UrlResponseInfo>, data: Bytes) {
        self.record_response(Some(info));
        self.read_outstanding = false;
        self.read_data = Some(data);
    }

    /// Enter the terminal phase. The first terminal outcome wins; returns
    /// whether this call applied.
    pub fn complete(&mut self, outcome: Outcome) -> bool {
        if self.is_complete() {
            return false;
        }
        self.read_outstanding = false;
        self.phase = Phase::Completed(outcome);
        true
    }

    /// The recorded failure, if the lifecycle completed with one.
    pub fn failure(&self) -> Option<ConnectionError> {
        match &self.phase {
            Phase::Completed(outcome) => outcome.failure(),
            _ => None,
        }
    }

    /// Validate that the response can be handed to the caller.
    pub fn check_response(&self) -> Result<Arc<UrlResponseInfo>> {
        if !self.has_response() {
            return Err(ConnectionError::illegal_state("no response"));
        }
        if let Some(failure) = self.failure() {
            return Err(failure);
        }
        self.response.clone().ok_or(ConnectionError::Invariant(
            "response info is missing while no failure was recorded",
        ))
    }

    fn take_read_data(&mut self) -> Option<Bytes> {
        self.read_data.take()
    }
}

/// Completion notification shared with the body reader and upload stream.
///
/// Set once by the callback adapter on a terminal event.
#[derive(Debug, Clone, Default)]
pub struct RequestCompletion {
    state: Arc<Mutex<Option<Option<ConnectionError>>>>,
}

impl RequestCompletion {
    /// A pending completion.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the request complete with an optional failure. Only the first
    /// call has an effect.
    pub fn complete(&self, failure: Option<ConnectionError>) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(failure);
        true
    }

    /// Whether the request completed.
    pub fn is_complete(&self) -> bool {
        self.state.lock().is_some()
    }

    /// The failure the request completed with.
    pub fn failure(&self) -> Option<ConnectionError> {
        self.state.lock().clone().flatten()
    }

    /// `None` while pending, otherwise the completion result.
    pub fn outcome(&self) -> Option<Result<()>> {
        self.state
            .lock()
            .as_ref()
            .map(|failure| failure.clone().map_or(Ok(()), Err))
    }
}

/// State shared by a connection, its callback adapter and its body reader.
pub(crate) struct Exchange {
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) message_loop: Arc<MessageLoop>,
    request: OnceLock<Arc<dyn UrlRequest>>,
}

impl Exchange {
    pub(crate) fn new(url: Url) -> Self {
        Exchange {
            lifecycle: Mutex::new(Lifecycle::new(url)),
            message_loop: Arc::new(MessageLoop::new()),
            request: OnceLock::new(),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lifecycle.lock().is_connected()
    }

    pub(crate) fn has_response(&self) -> bool {
        self.lifecycle.lock().has_response()
    }

    pub(crate) fn url(&self) -> Url {
        self.lifecycle.lock().url().clone()
    }

    /// Record the built request and leave `NotConnected`. Returns `false`
    /// when the request had already been started.
    pub(crate) fn attach(&self, request: Arc<dyn UrlRequest>) -> bool {
        if !self.lifecycle.lock().begin() {
            return false;
        }
        self.request.set(request).is_ok()
    }

    pub(crate) fn request(&self) -> Option<&Arc<dyn UrlRequest>> {
        self.request.get()
    }

    /// Pull more body bytes: issue an engine read unless one is already
    /// outstanding, then wait until it completes or the request ends.
    pub(crate) fn get_more_data(&self, max_bytes: usize, timeout: Option<Duration>) -> Result<()> {
        let request = self
            .request()
            .ok_or_else(|| ConnectionError::illegal_state("request has not been started"))?;
        let issue = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.is_complete() || lifecycle.read_outstanding {
                false
            } else {
                lifecycle.read_outstanding = true;
                true
            }
        };
        if issue {
            request.read(max_bytes);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            {
                let lifecycle = self.lifecycle.lock();
                if !lifecycle.read_outstanding || lifecycle.is_complete() {
                    return Ok(());
                }
            }
            match deadline {
                Some(deadline) => self.message_loop.run_until(deadline)?,
                None => self.message_loop.run()?,
            }
        }
    }

    pub(crate) fn take_read_data(&self) -> Option<Bytes> {
        self.lifecycle.lock().take_read_data()
    }
}
