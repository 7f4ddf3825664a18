//! HTTP vocabulary shared by the connection and the engines.
//!
//! - **[constants]** - header names, default values and buffer sizes
//! - **[headers]** - the request header store and the response header views

pub mod headers;

pub use headers::{HeaderFields, HeaderKey, RequestHeaders, ResponseHeaders};

/// Protocol constants.
pub mod constants {
    /// Header names used by the connection.
    pub mod headers {
        pub use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
    }

    /// `Content-Type` sent with a request body when the caller sets none.
    pub const DEFAULT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

    /// Chunk size used when chunked streaming is requested with length 0.
    pub const DEFAULT_CHUNK_LENGTH: usize = 4096;

    /// Largest number of bytes requested from the engine per body read.
    pub const READ_BUFFER_SIZE: usize = 32 * 1024;

    /// Staging buffer size of the fixed-length upload stream.
    pub const FIXED_MODE_BUFFER_SIZE: usize = 16 * 1024;

    /// Responses at or above this status have no readable input stream.
    pub const HTTP_BAD_REQUEST: u16 = 400;
}

/// Whether a status code is a redirect the engine reports to the adapter.
#[inline]
pub fn is_redirect_status(status: u16) -> bool {
    matches!(status, 300 | 301 | 302 | 303 | 307 | 308)
}
