//! Scripted in-memory engine for connection tests.
//!
//! A script is a list of [`Step`]s. Starting a request first drains the
//! upload provider (if any), then plays steps until one needs an answer from
//! the connection: a redirect waits for `follow_redirect`/`cancel`, body
//! steps wait for `read`. Every callback is posted to the request's executor,
//! exactly like a real engine.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use url::Url;
use url_connection::connection::upload::UploadStream;
use url_connection::engine::{
    Engine, Executor, RequestParams, UploadDataProvider, UploadDataSink, UrlRequest,
    UrlRequestCallback, UrlResponseInfo,
};
use url_connection::error::{ConnectionError, RequestError, RequestErrorKind, Result};

const UPLOAD_READ_SIZE: usize = 8;

/// One scripted engine event.
#[derive(Debug, Clone)]
pub enum Step {
    /// `redirect-received`, then wait for the adapter's decision.
    Redirect {
        status: u16,
        location: String,
    },
    /// `response-started`.
    Response {
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// Answer one read with these bytes (split if the read is smaller).
    Data(Bytes),
    /// Answer the next read with `succeeded`.
    Succeed,
    /// `failed` with the given error.
    Fail(RequestError),
    /// `failed` without an error.
    FailWithoutError,
    /// Never answer the next read.
    Stall,
    /// `response-started` then `succeeded` right away, without pulling the
    /// upload or waiting for a read. Only meaningful as the first step.
    AnswerEarly { status: u16 },
}

impl Step {
    pub fn response(status: u16, headers: &[(&str, &str)]) -> Step {
        Step::Response {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn redirect(status: u16, location: &str) -> Step {
        Step::Redirect {
            status,
            location: location.to_string(),
        }
    }

    pub fn data(body: &str) -> Step {
        Step::Data(Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn fail(kind: RequestErrorKind, message: &str) -> Step {
        Step::Fail(RequestError::new(kind, message))
    }
}

/// What the engine observed about one request.
#[derive(Debug, Clone, Default)]
pub struct RequestLog {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub disable_cache: bool,
    pub upload_length: Option<u64>,
    pub uploaded: Vec<u8>,
    pub has_upload: bool,
    pub starts: usize,
    pub reads: usize,
    pub follows: usize,
    pub cancels: usize,
}

impl RequestLog {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Engine replaying the same script for every request it creates.
pub struct ScriptedEngine {
    script: Vec<Step>,
    logs: Mutex<Vec<Arc<Mutex<RequestLog>>>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedEngine {
            script,
            logs: Mutex::new(Vec::new()),
        })
    }

    /// A plain `200 OK` carrying `body`.
    pub fn ok(body: &str) -> Arc<Self> {
        Self::new(vec![
            Step::response(200, &[("Content-Type", "text/plain")]),
            Step::data(body),
            Step::Succeed,
        ])
    }

    pub fn requests(&self) -> Vec<RequestLog> {
        self.logs.lock().iter().map(|log| log.lock().clone()).collect()
    }

    pub fn request(&self, index: usize) -> RequestLog {
        self.requests()
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("no request #{index} was created"))
    }
}

impl Engine for ScriptedEngine {
    fn create_request(
        &self,
        params: RequestParams,
        callback: Arc<dyn UrlRequestCallback>,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<dyn UrlRequest>> {
        for (name, value) in &params.headers {
            if http::HeaderValue::from_str(value).is_err() {
                return Err(ConnectionError::InvalidHeader(format!(
                    "invalid value for header {name}"
                )));
            }
        }
        let log = Arc::new(Mutex::new(RequestLog {
            method: params.method.to_string(),
            url: params.url.to_string(),
            headers: params.headers.clone(),
            disable_cache: params.disable_cache,
            upload_length: params.upload.as_ref().and_then(|upload| upload.provider.length()),
            has_upload: params.upload.is_some(),
            ..Default::default()
        }));
        self.logs.lock().push(log.clone());

        let upload = params.upload.map(|upload| UploadPump {
            remaining: upload.provider.length(),
            provider: Arc::new(Mutex::new(upload.provider)),
            executor: upload.executor,
        });
        let request = Arc::new_cyclic(|me| ScriptedRequest {
            me: me.clone(),
            state: Mutex::new(ScriptState {
                steps: self.script.iter().cloned().collect(),
                url_chain: vec![params.url],
                info: None,
                done: false,
                upload,
            }),
            log,
            callback,
            executor,
        });
        Ok(request)
    }
}

struct UploadPump {
    provider: Arc<Mutex<Box<dyn UploadDataProvider>>>,
    executor: Arc<dyn Executor>,
    remaining: Option<u64>,
}

struct ScriptState {
    steps: VecDeque<Step>,
    url_chain: Vec<Url>,
    info: Option<Arc<UrlResponseInfo>>,
    done: bool,
    upload: Option<UploadPump>,
}

pub struct ScriptedRequest {
    me: Weak<ScriptedRequest>,
    state: Mutex<ScriptState>,
    log: Arc<Mutex<RequestLog>>,
    callback: Arc<dyn UrlRequestCallback>,
    executor: Arc<dyn Executor>,
}

impl ScriptedRequest {
    fn post<F>(&self, event: F)
    where
        F: FnOnce(&dyn UrlRequestCallback, &dyn UrlRequest) + Send + 'static,
    {
        let Some(request) = self.me.upgrade() else {
            return;
        };
        let callback = self.callback.clone();
        self.executor
            .execute(Box::new(move || event(callback.as_ref(), request.as_ref())));
    }

    fn info(state: &ScriptState, status: u16, headers: Vec<(String, String)>) -> Arc<UrlResponseInfo> {
        Arc::new(UrlResponseInfo {
            url_chain: state.url_chain.clone(),
            status,
            status_text: reason(status).to_string(),
            headers,
            negotiated_protocol: "HTTP/1.1".to_string(),
            was_cached: false,
        })
    }

    /// Play the next step if it does not wait for a read.
    fn advance(&self, state: &mut ScriptState) {
        let Some(step) = state.steps.pop_front() else {
            return;
        };
        match step {
            Step::Redirect { status, location } => {
                let info = Self::info(
                    state,
                    status,
                    vec![("Location".to_string(), location.clone())],
                );
                state.info = Some(info.clone());
                self.post(move |callback, request| {
                    callback.on_redirect_received(request, info, &location)
                });
            }
            Step::Response { status, headers } => {
                let info = Self::info(state, status, headers);
                state.info = Some(info.clone());
                self.post(move |callback, request| callback.on_response_started(request, info));
            }
            Step::AnswerEarly { status } => {
                let info = Self::info(state, status, Vec::new());
                state.info = Some(info.clone());
                state.done = true;
                let started = info.clone();
                self.post(move |callback, request| callback.on_response_started(request, started));
                self.post(move |callback, request| callback.on_succeeded(request, info));
            }
            Step::Fail(error) => self.fail(state, Some(error)),
            Step::FailWithoutError => self.fail(state, None),
            // Body steps wait for a read.
            other => state.steps.push_front(other),
        }
    }

    fn fail(&self, state: &mut ScriptState, error: Option<RequestError>) {
        state.done = true;
        let info = state.info.clone();
        self.post(move |callback, request| callback.on_failed(request, info, error));
    }

    fn pump_upload(&self, state: &ScriptState) {
        let Some(upload) = &state.upload else {
            return;
        };
        let Some(request) = self.me.upgrade() else {
            return;
        };
        let provider = upload.provider.clone();
        upload.executor.execute(Box::new(move || {
            let sink = PumpSink { request };
            provider.lock().read(&sink, UPLOAD_READ_SIZE);
        }));
    }

    fn upload_received(&self, data: Bytes, final_chunk: bool) {
        self.log.lock().uploaded.extend_from_slice(&data);
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let finished = match state.upload.as_mut() {
            Some(upload) => match upload.remaining.as_mut() {
                Some(remaining) => {
                    *remaining = remaining.saturating_sub(data.len() as u64);
                    *remaining == 0
                }
                None => final_chunk,
            },
            None => true,
        };
        if finished {
            state.upload = None;
            self.advance(&mut state);
        } else {
            self.pump_upload(&state);
        }
    }
}

impl UrlRequest for ScriptedRequest {
    fn start(&self) {
        self.log.lock().starts += 1;
        let mut state = self.state.lock();
        let empty_upload = state
            .upload
            .as_ref()
            .is_some_and(|upload| upload.remaining == Some(0));
        let answers_early = matches!(state.steps.front(), Some(Step::AnswerEarly { .. }));
        if empty_upload || answers_early {
            state.upload = None;
        }
        if state.upload.is_some() {
            self.pump_upload(&state);
        } else {
            self.advance(&mut state);
        }
    }

    fn read(&self, max_bytes: usize) {
        self.log.lock().reads += 1;
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let Some(info) = state.info.clone() else {
            panic!("read before response started");
        };
        match state.steps.pop_front() {
            Some(Step::Data(mut data)) => {
                if data.len() > max_bytes {
                    let rest = data.split_off(max_bytes);
                    state.steps.push_front(Step::Data(rest));
                }
                self.post(move |callback, request| callback.on_read_completed(request, info, data));
            }
            Some(Step::Fail(error)) => self.fail(&mut state, Some(error)),
            Some(Step::FailWithoutError) => self.fail(&mut state, None),
            Some(Step::Stall) => state.steps.push_front(Step::Stall),
            _ => {
                state.done = true;
                self.post(move |callback, request| callback.on_succeeded(request, info));
            }
        }
    }

    fn follow_redirect(&self) {
        self.log.lock().follows += 1;
        let mut state = self.state.lock();
        let location = state
            .info
            .as_ref()
            .and_then(|info| info.headers.first().map(|(_, value)| value.clone()))
            .unwrap_or_default();
        if let Ok(target) = Url::parse(&location) {
            state.url_chain.push(target);
        }
        self.advance(&mut state);
    }

    fn cancel(&self) {
        self.log.lock().cancels += 1;
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.done = true;
        let info = state.info.clone();
        self.post(move |callback, request| callback.on_canceled(request, info));
    }
}

struct PumpSink {
    request: Arc<ScriptedRequest>,
}

impl UploadDataSink for PumpSink {
    fn on_read_succeeded(&self, data: Bytes, final_chunk: bool) {
        self.request.upload_received(data, final_chunk);
    }

    fn on_read_error(&self, error: ConnectionError) {
        let mut state = self.request.state.lock();
        self.request.fail(
            &mut state,
            Some(RequestError::new(RequestErrorKind::Body, error.to_string())),
        );
    }

    fn on_rewind_succeeded(&self) {}

    fn on_rewind_error(&self, _error: ConnectionError) {}
}

fn reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}

pub fn url(path: &str) -> Url {
    Url::parse("http://example.test/")
        .and_then(|base| base.join(path))
        .unwrap()
}

/// Write through the connection's upload stream trait object.
pub fn write_body(stream: &mut dyn UploadStream, body: &[u8]) -> std::io::Result<()> {
    std::io::Write::write_all(stream, body)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
