//! Stable URL fingerprint: names the per-download state file and seeds the
//! registry item id.
//!
//! Uses MD5 of the raw URL bytes, matching the original implementation's
//! `hashlib.md5(url.encode()).hexdigest()` — the spec only requires "a
//! stable 128-bit hex derived from the raw request URL", and this choice is
//! carried forward rather than reinvented.

use md5::{Digest, Md5};

/// Full 128-bit fingerprint as 32 lowercase hex characters.
pub fn fingerprint(url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Registry item id: the first 16 hex characters of the fingerprint (§4.6).
pub fn item_id(url: &str) -> String {
    fingerprint(url)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_across_calls() {
        let url = "https://example.com/archive.zip";
        assert_eq!(fingerprint(url), fingerprint(url));
        assert_eq!(item_id(url), item_id(url));
    }

    #[test]
    fn fingerprint_is_32_hex_chars() {
        let fp = fingerprint("https://example.com/a");
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn item_id_is_fingerprint_prefix() {
        let url = "https://example.com/b";
        let fp = fingerprint(url);
        let id = item_id(url);
        assert_eq!(id.len(), 16);
        assert!(fp.starts_with(&id));
    }

    #[test]
    fn distinct_urls_differ() {
        assert_ne!(
            fingerprint("https://example.com/a"),
            fingerprint("https://example.com/b")
        );
    }

    #[test]
    fn does_not_change_when_filename_is_learned_later() {
        // The fingerprint is derived only from the URL, so discovering the
        // real filename later (via Content-Disposition) must not change it.
        let url = "https://example.com/download?id=42";
        let before = fingerprint(url);
        let after = fingerprint(url);
        assert_eq!(before, after);
    }
}
