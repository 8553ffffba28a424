//! Parse HTTP response header lines into ProbeResult.

use anyhow::Result;

use super::ProbeResult;

/// Parse collected header lines into a ProbeResult. `Content-Range` (form
/// `bytes 0-0/N`) is preferred over `Content-Length` for total size since the
/// probe is a ranged GET and a transparent proxy may report a truncated
/// `Content-Length` for the single byte actually returned.
pub(crate) fn parse_headers(lines: &[String]) -> Result<ProbeResult> {
    let mut content_length = None;
    let mut content_range_total = None;
    let mut accept_ranges = false;
    let mut etag = None;
    let mut last_modified = None;
    let mut content_disposition = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.parse::<u64>() {
                    content_length = Some(n);
                }
            }
            if name.eq_ignore_ascii_case("content-range") {
                content_range_total = parse_content_range_total(value);
            }
            if name.eq_ignore_ascii_case("accept-ranges") {
                accept_ranges = value.eq_ignore_ascii_case("bytes");
            }
            if name.eq_ignore_ascii_case("etag") {
                etag = Some(value.trim_matches('"').to_string());
            }
            if name.eq_ignore_ascii_case("last-modified") {
                last_modified = Some(value.to_string());
            }
            if name.eq_ignore_ascii_case("content-disposition") {
                content_disposition = Some(value.to_string());
            }
        }
    }

    // A 206 response to our `Range: bytes=0-0` probe is itself proof the
    // server honors ranges, even absent an explicit `Accept-Ranges` header.
    if content_range_total.is_some() {
        accept_ranges = true;
    }

    Ok(ProbeResult {
        total_size: content_range_total.or(content_length),
        accept_ranges,
        etag,
        last_modified,
        content_disposition,
    })
}

/// Parses `bytes 0-0/12345` -> `Some(12345)`. Returns `None` for `bytes */...`
/// (unknown total) or malformed values.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes ")?;
    let (_, total) = rest.split_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_headers_content_range_preferred_over_content_length() {
        let lines = [
            "HTTP/1.1 206 Partial Content".to_string(),
            "Content-Length: 1".to_string(),
            "Content-Range: bytes 0-0/12345".to_string(),
        ];
        let r = parse_headers(&lines).unwrap();
        assert_eq!(r.total_size, Some(12345));
        assert!(r.accept_ranges);
    }

    #[test]
    fn parse_headers_falls_back_to_content_length_without_range() {
        let lines = ["Content-Length: 999".to_string()];
        let r = parse_headers(&lines).unwrap();
        assert_eq!(r.total_size, Some(999));
        assert!(!r.accept_ranges);
    }

    #[test]
    fn parse_headers_unknown_total_in_content_range() {
        let lines = [
            "Content-Length: 1".to_string(),
            "Content-Range: bytes 0-0/*".to_string(),
        ];
        let r = parse_headers(&lines).unwrap();
        assert_eq!(r.total_size, Some(1));
        assert!(r.accept_ranges);
    }

    #[test]
    fn parse_headers_etag_and_last_modified() {
        let lines = [
            "ETag: \"abc-123\"".to_string(),
            "Last-Modified: Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
        ];
        let r = parse_headers(&lines).unwrap();
        assert_eq!(r.etag.as_deref(), Some("abc-123"));
        assert_eq!(
            r.last_modified.as_deref(),
            Some("Wed, 21 Oct 2015 07:28:00 GMT")
        );
    }

    #[test]
    fn parse_headers_content_disposition() {
        let lines = ["Content-Disposition: attachment; filename=\"report.pdf\"".to_string()];
        let r = parse_headers(&lines).unwrap();
        assert!(r.content_disposition.is_some());
        assert!(r
            .content_disposition
            .as_deref()
            .unwrap()
            .contains("report.pdf"));
    }
}
