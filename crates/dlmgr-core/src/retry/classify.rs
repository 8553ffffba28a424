//! Error classification (§7 "preparation vs. transient-fetch vs. other").
//!
//! The engine does not retry segment downloads itself (§4.1 "Failure
//! semantics"): a failed segment simply returns unfinished and the item goes
//! to `Stopped` for manual or scheduled resume. This module only names *why*
//! it failed, for `last_error`/status reporting.

use super::error::SegmentError;

/// Coarse classification of a segment failure, surfaced to the caller so it
/// can pick a `last_error` message and, eventually, a user-facing hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operation timed out (connect/read).
    Timeout,
    /// Server asked us to slow down (e.g. 429, 503).
    Throttled,
    /// Network-level failure (connection reset, DNS, etc.).
    Connection,
    /// HTTP status in the 5xx range.
    Http5xx(u16),
    /// Anything else (4xx, partial transfer, local storage failure).
    Other,
}

/// Classify an HTTP status code.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

/// Classify a segment error (curl, HTTP, partial transfer, or storage).
pub fn classify(e: &SegmentError) -> ErrorKind {
    match e {
        SegmentError::Curl(ce) => classify_curl_error(ce),
        SegmentError::Http(code) => classify_http_status(*code),
        SegmentError::PartialTransfer { .. } => ErrorKind::Other,
        SegmentError::Storage(_) => ErrorKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_and_503_throttled() {
        assert_eq!(classify_http_status(429), ErrorKind::Throttled);
        assert_eq!(classify_http_status(503), ErrorKind::Throttled);
    }

    #[test]
    fn http_5xx_classified_distinctly() {
        assert!(matches!(classify_http_status(500), ErrorKind::Http5xx(500)));
        assert!(matches!(classify_http_status(502), ErrorKind::Http5xx(502)));
    }

    #[test]
    fn http_4xx_other() {
        assert_eq!(classify_http_status(404), ErrorKind::Other);
        assert_eq!(classify_http_status(403), ErrorKind::Other);
    }

    #[test]
    fn partial_transfer_and_storage_are_other() {
        assert_eq!(
            classify(&SegmentError::PartialTransfer { expected: 10, received: 5 }),
            ErrorKind::Other
        );
        assert_eq!(
            classify(&SegmentError::Storage(std::io::Error::new(std::io::ErrorKind::Other, "x"))),
            ErrorKind::Other
        );
    }
}
