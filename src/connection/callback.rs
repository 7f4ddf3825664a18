//! Callback adapter: engine events → lifecycle transitions.
//!
//! Every event ends by recording response metadata and, unless a redirect is
//! being followed, releasing the message loop so the blocked caller resumes.
//! Terminal events also notify the body reader and the upload stream so that
//! blocked reads and writes on either side see the same outcome.

use super::lifecycle::{Exchange, Outcome, RequestCompletion};
use crate::engine::{UrlRequest, UrlRequestCallback, UrlResponseInfo};
use crate::error::{ConnectionError, RequestError};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use url::Url;

pub(crate) struct ConnectionCallback {
    // Weak: queued tasks hold the callback, and the exchange owns the queue.
    exchange: Weak<Exchange>,
    follow_redirects: bool,
    body: RequestCompletion,
    upload: Option<RequestCompletion>,
}

impl ConnectionCallback {
    pub(crate) fn new(
        exchange: &Arc<Exchange>,
        follow_redirects: bool,
        body: RequestCompletion,
        upload: Option<RequestCompletion>,
    ) -> Self {
        ConnectionCallback {
            exchange: Arc::downgrade(exchange),
            follow_redirects,
            body,
            upload,
        }
    }

    fn finish(&self, exchange: &Exchange, info: Option<Arc<UrlResponseInfo>>, outcome: Outcome) {
        let failure = outcome.failure();
        let applied = {
            let mut lifecycle = exchange.lifecycle.lock();
            lifecycle.record_response(info);
            lifecycle.complete(outcome)
        };
        if applied {
            self.body.complete(failure.clone());
            if let Some(upload) = &self.upload {
                upload.complete(failure);
            }
        }
        exchange.message_loop.quit();
    }
}

impl UrlRequestCallback for ConnectionCallback {
    fn on_redirect_received(
        &self,
        request: &dyn UrlRequest,
        info: Arc<UrlResponseInfo>,
        new_location: &str,
    ) {
        let Some(exchange) = self.exchange.upgrade() else {
            request.cancel();
            return;
        };
        let follow = {
            let mut lifecycle = exchange.lifecycle.lock();
            lifecycle.observe_redirect();
            match Url::parse(new_location) {
                Ok(target) => {
                    let same_protocol = target.scheme() == lifecycle.url().scheme();
                    if self.follow_redirects {
                        // Updated even when the protocol change stops the redirect.
                        lifecycle.set_url(target);
                    }
                    self.follow_redirects && same_protocol
                }
                Err(err) => {
                    tracing::debug!(location = new_location, error = %err, "unparsable redirect location");
                    false
                }
            }
        };

        if follow {
            tracing::debug!(location = new_location, status = info.status, "following redirect");
            request.follow_redirect();
            return;
        }

        tracing::debug!(
            location = new_location,
            status = info.status,
            follow_redirects = self.follow_redirects,
            "redirect not followed, treating it as the response"
        );
        request.cancel();
        self.finish(&exchange, Some(info), Outcome::RedirectStopped);
    }

    fn on_response_started(&self, _request: &dyn UrlRequest, info: Arc<UrlResponseInfo>) {
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        tracing::debug!(status = info.status, "response started");
        exchange.lifecycle.lock().response_started(info);
        exchange.message_loop.quit();
    }

    fn on_read_completed(&self, _request: &dyn UrlRequest, info: Arc<UrlResponseInfo>, data: Bytes) {
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        exchange.lifecycle.lock().read_completed(info, data);
        exchange.message_loop.quit();
    }

    fn on_succeeded(&self, _request: &dyn UrlRequest, info: Arc<UrlResponseInfo>) {
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        tracing::debug!(status = info.status, "request succeeded");
        self.finish(&exchange, Some(info), Outcome::Succeeded);
    }

    fn on_failed(
        &self,
        _request: &dyn UrlRequest,
        info: Option<Arc<UrlResponseInfo>>,
        error: Option<RequestError>,
    ) {
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        let failure = match error {
            Some(error) => {
                tracing::warn!(error = %error, "request failed");
                ConnectionError::Request(error)
            }
            None => {
                tracing::error!("engine reported a failure without an error");
                ConnectionError::illegal_state("failure cannot be absent in a failed event")
            }
        };
        self.finish(&exchange, info, Outcome::Failed(failure));
    }

    fn on_canceled(&self, _request: &dyn UrlRequest, info: Option<Arc<UrlResponseInfo>>) {
        let Some(exchange) = self.exchange.upgrade() else {
            return;
        };
        tracing::debug!("request canceled");
        self.finish(&exchange, info, Outcome::Canceled);
    }
}
