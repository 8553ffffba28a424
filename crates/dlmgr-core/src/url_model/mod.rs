//! URL modeling and filename derivation.
//!
//! Derives safe local filenames from URL path or Content-Disposition header,
//! sanitized for Linux filesystems.

mod content_disposition;
mod path;
mod sanitize;

pub use content_disposition::parse_content_disposition_filename;
pub use path::filename_from_url_path;
pub use sanitize::sanitize_filename_for_linux;

/// Default filename when URL path and Content-Disposition yield nothing usable.
const DEFAULT_FILENAME: &str = "download.bin";

/// Appended when neither the URL path nor Content-Disposition yields an
/// extension, so downstream category detection (by extension) stays
/// deterministic (§4.1 step 1).
const NEUTRAL_SUFFIX: &str = ".bin";

/// Derives a safe filename for saving a download.
///
/// Prefers the filename from `content_disposition` (if present and parseable),
/// otherwise uses the last path segment of `url`. The result is sanitized for
/// Linux (no `/`, NUL, or control chars; no leading/trailing dots or spaces;
/// reserved names like "." or ".." replaced) and, if it has no derivable
/// extension, gets a neutral `.bin` suffix appended.
///
/// # Examples
///
/// - `derive_filename("https://example.com/archive.zip", None)` → `"archive.zip"`
/// - `derive_filename("https://example.com/", Some("attachment; filename=\"report.pdf\""))` → `"report.pdf"`
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(parse_content_disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };

    let sanitized = sanitize_filename_for_linux(&raw);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return DEFAULT_FILENAME.to_string();
    }

    if has_extension(&sanitized) {
        sanitized
    } else {
        format!("{sanitized}{NEUTRAL_SUFFIX}")
    }
}

fn has_extension(name: &str) -> bool {
    match name.rfind('.') {
        Some(0) => false, // leading dot (hidden file), not an extension
        Some(dot) => dot < name.len() - 1,
        None => false,
    }
}

/// Validates and normalizes a download URL (§4.1 "URL sanitization").
///
/// Refuses any scheme other than `http`/`https`. If the input clearly has no
/// scheme at all (no `://`), `https://` is prefixed; a malformed or
/// non-http(s) scheme is rejected rather than guessed at.
pub fn sanitize_url(input: &str) -> Result<String, UrlSanitizeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlSanitizeError::Empty);
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = url::Url::parse(&candidate).map_err(|_| UrlSanitizeError::Malformed)?;
    match parsed.scheme() {
        "http" | "https" => Ok(candidate),
        other => Err(UrlSanitizeError::UnsupportedScheme(other.to_string())),
    }
}

/// Error returned by `sanitize_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSanitizeError {
    Empty,
    Malformed,
    UnsupportedScheme(String),
}

impl std::fmt::Display for UrlSanitizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UrlSanitizeError::Empty => write!(f, "URL is empty"),
            UrlSanitizeError::Malformed => write!(f, "URL could not be parsed"),
            UrlSanitizeError::UnsupportedScheme(s) => {
                write!(f, "unsupported URL scheme: {s}")
            }
        }
    }
}

impl std::error::Error for UrlSanitizeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_filename_from_url_path() {
        assert_eq!(
            derive_filename("https://example.com/archive.zip", None),
            "archive.zip"
        );
        assert_eq!(
            derive_filename("https://cdn.example.com/path/to/debian-12.iso", None),
            "debian-12.iso"
        );
    }

    #[test]
    fn derive_filename_from_content_disposition() {
        assert_eq!(
            derive_filename(
                "https://example.com/",
                Some("attachment; filename=\"report.pdf\"")
            ),
            "report.pdf"
        );
        assert_eq!(
            derive_filename(
                "https://example.com/x",
                Some("attachment; filename=simple.bin")
            ),
            "simple.bin"
        );
    }

    #[test]
    fn derive_filename_content_disposition_overrides_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/archive.zip",
                Some("attachment; filename=\"real-name.tar.gz\"")
            ),
            "real-name.tar.gz"
        );
    }

    #[test]
    fn derive_filename_empty_url_path_fallback() {
        assert_eq!(
            derive_filename("https://example.com/", None),
            "download.bin"
        );
        assert_eq!(
            derive_filename("https://example.com", None),
            "download.bin"
        );
    }

    #[test]
    fn derive_filename_reserved_names_fallback() {
        assert_eq!(derive_filename("https://example.com/.", None), "download.bin");
        assert_eq!(derive_filename("https://example.com/..", None), "download.bin");
    }

    #[test]
    fn derive_filename_appends_neutral_suffix_when_no_extension() {
        assert_eq!(
            derive_filename("https://example.com/download", None),
            "download.bin"
        );
        assert_eq!(
            derive_filename("https://example.com/x", Some("attachment; filename=noext")),
            "noext.bin"
        );
    }

    #[test]
    fn derive_filename_keeps_dotfile_without_extension_neutral() {
        // A leading dot alone (hidden-file style) doesn't count as an extension.
        assert_eq!(
            derive_filename("https://example.com/x", Some("attachment; filename=.profile")),
            ".profile.bin"
        );
    }

    #[test]
    fn sanitize_url_accepts_http_and_https() {
        assert_eq!(sanitize_url("https://example.com/a").unwrap(), "https://example.com/a");
        assert_eq!(sanitize_url("http://example.com/a").unwrap(), "http://example.com/a");
    }

    #[test]
    fn sanitize_url_adds_scheme_when_clearly_absent() {
        assert_eq!(
            sanitize_url("example.com/file.zip").unwrap(),
            "https://example.com/file.zip"
        );
    }

    #[test]
    fn sanitize_url_rejects_other_schemes() {
        assert!(matches!(
            sanitize_url("ftp://example.com/a"),
            Err(UrlSanitizeError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(sanitize_url("magnet:?xt=urn:btih:abc").is_err());
    }

    #[test]
    fn sanitize_url_rejects_empty() {
        assert_eq!(sanitize_url("   "), Err(UrlSanitizeError::Empty));
    }
}
