//! Connection and engine configuration.
//!
//! Both configuration types are plain structs with public fields and a
//! [`Default`] implementation, so they can be built with struct-update syntax:
//!
//! ```
//! use url_connection::{ConnectionConfig, EngineConfig};
//!
//! let connection = ConnectionConfig {
//!     do_output: true,
//!     chunk_length: 8192,
//!     ..Default::default()
//! };
//! assert!(connection.is_chunked());
//!
//! let engine = EngineConfig {
//!     request_timeout_ms: 10_000,
//!     ..Default::default()
//! };
//! assert_eq!(engine.worker_threads, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-connection settings mirroring the classic blocking-connection flags.
///
/// These may only be changed before the connection starts its request; the
/// setters on [`HttpUrlConnection`](crate::HttpUrlConnection) enforce that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// The connection will be used to read a response body.
    pub do_input: bool,

    /// The connection will be used to write a request body.
    pub do_output: bool,

    /// Responses may be served from the engine's cache.
    pub use_caches: bool,

    /// Redirects to the same protocol are followed automatically.
    pub instance_follow_redirects: bool,

    /// Chunk size for chunked streaming uploads; `0` disables chunked mode.
    pub chunk_length: usize,

    /// Exact body length for fixed-length streaming uploads.
    pub fixed_content_length: Option<u64>,

    /// Upper bound for a single body read in milliseconds; `0` waits forever.
    pub read_timeout_ms: u64,
}

impl ConnectionConfig {
    /// Whether chunked streaming mode is configured.
    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.chunk_length > 0
    }

    /// The read timeout, or `None` when reads may block indefinitely.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            do_input: true,
            do_output: false,
            use_caches: true,
            instance_follow_redirects: true,
            chunk_length: 0,
            fixed_content_length: None,
            read_timeout_ms: 0,
        }
    }
}

/// Settings for [`ReqwestEngine`](crate::engine::ReqwestEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Whole-request timeout in milliseconds; `0` disables it.
    pub request_timeout_ms: u64,

    /// Connect timeout in milliseconds, applied engine-wide; `0` disables it.
    pub connect_timeout_ms: u64,

    /// How long idle pooled connections are kept, in seconds.
    pub pool_idle_timeout_secs: u64,

    /// Maximum idle pooled connections per host.
    pub max_idle_per_host: usize,

    /// `User-Agent` sent when the caller does not set one.
    pub user_agent: Option<String>,

    /// Worker threads of the engine's runtime.
    pub worker_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            request_timeout_ms: 0,
            connect_timeout_ms: 30_000,
            pool_idle_timeout_secs: 90,
            max_idle_per_host: 32,
            user_agent: None,
            worker_threads: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert!(config.do_input);
        assert!(!config.do_output);
        assert!(config.use_caches);
        assert!(config.instance_follow_redirects);
        assert!(!config.is_chunked());
        assert_eq!(config.fixed_content_length, None);
        assert_eq!(config.read_timeout(), None);
    }

    #[test]
    fn test_read_timeout() {
        let config = ConnectionConfig {
            read_timeout_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"do_output": true, "chunk_length": 1024}"#).unwrap();
        assert!(config.do_output);
        assert!(config.is_chunked());
        assert!(config.instance_follow_redirects);

        let engine: EngineConfig = serde_json::from_str(r#"{"user_agent": "fetcher/1"}"#).unwrap();
        assert_eq!(engine.user_agent.as_deref(), Some("fetcher/1"));
        assert_eq!(engine.max_idle_per_host, 32);
    }
}
