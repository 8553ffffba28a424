//! Metadata probe: a ranged GET that stands in for HEAD (§4.1 step 1).
//!
//! Many servers misreport `Content-Length` or omit `Accept-Ranges` on HEAD
//! while answering a real `Range: bytes=0-0` GET correctly, so the probe
//! issues that GET and discards the single byte of body it gets back.

mod parse;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::str;
use std::time::Duration;

/// Probe timeout (§5 "Metadata probe 10 s").
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of the metadata probe: key headers needed for segmented download and resume.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// Total size in bytes, from `Content-Range` (preferred) or `Content-Length`.
    pub total_size: Option<u64>,
    /// True if the server answered the ranged GET with a byte range (206, or
    /// an explicit `Accept-Ranges: bytes`).
    pub accept_ranges: bool,
    /// `ETag` value if present (used for resume validation).
    pub etag: Option<String>,
    /// `Last-Modified` value if present (used for resume validation).
    pub last_modified: Option<String>,
    /// `Content-Disposition` value if present (filename hint).
    pub content_disposition: Option<String>,
}

/// Issues `GET` with `Range: bytes=0-0`, following redirects, and returns
/// parsed metadata. Runs in the current thread; call from `spawn_blocking`
/// when invoked from async code.
pub fn probe(
    url: &str,
    custom_headers: &HashMap<String, String>,
    proxy_url: Option<&str>,
) -> Result<ProbeResult> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.connect_timeout(PROBE_TIMEOUT)?;
    easy.timeout(PROBE_TIMEOUT)?;
    if let Some(proxy) = proxy_url {
        easy.proxy(proxy)?;
    }

    let mut list = curl::easy::List::new();
    list.append("Range: bytes=0-0")?;
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))?;
    }
    easy.http_headers(list)?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                headers.push(s.trim_end().to_string());
            }
            true
        })?;
        // Discard the single body byte the server sends back.
        transfer.write_function(|data| Ok(data.len()))?;
        transfer.perform().context("probe request failed")?;
    }

    let code = easy.response_code().context("no response code")?;
    if code < 200 || code >= 300 {
        anyhow::bail!("probe {} returned HTTP {}", url, code);
    }

    parse::parse_headers(&headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_rejects_non_2xx_via_error_path_shape() {
        // No network access in unit tests; this exercises only that an
        // invalid URL surfaces as an error rather than panicking.
        let result = probe("not a url", &HashMap::new(), None);
        assert!(result.is_err());
    }
}
