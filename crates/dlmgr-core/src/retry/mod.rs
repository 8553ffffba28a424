//! Error classification for segment and preparation failures.
//!
//! Segment downloads are not retried inside the engine (§4.1 "Failure
//! semantics"): a failed segment is left unfinished and the item becomes
//! eligible for resume. What remains here is classification only, used to
//! populate `last_error` and to distinguish preparation failures from
//! transient-fetch failures per §7.

mod classify;
mod error;

pub use classify::{classify, classify_curl_error, classify_http_status, ErrorKind};
pub use error::SegmentError;
