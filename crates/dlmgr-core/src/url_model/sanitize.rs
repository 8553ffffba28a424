//! Linux-safe filename sanitization.

/// Filenames are capped to this many UTF-8 bytes (§4.1 step 1), well under
/// Linux's 255-byte `NAME_MAX` but generous enough for any real filename.
const MAX_BYTES: usize = 200;

/// Sanitizes a candidate filename for safe use on Linux.
///
/// - Replaces NUL, `/`, `\`, and control characters with `_`
/// - Trims leading/trailing spaces and dots
/// - Collapses consecutive underscores
/// - Caps to 200 UTF-8 bytes, preserving the file extension when the name
///   needs truncating
pub fn sanitize_filename_for_linux(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replacement = if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            '_'
        } else if c == ' ' || c == '\t' {
            '_'
        } else {
            c
        };

        if replacement == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replacement);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '\t' || c == '.' || c == '_');

    cap_to_bytes_preserving_extension(trimmed, MAX_BYTES)
}

/// Truncates `name` to at most `max_bytes` UTF-8 bytes. If the name has an
/// extension (a `.ext` suffix of 1-10 chars with no further dots), the stem
/// is shortened instead of the extension so the file type survives.
fn cap_to_bytes_preserving_extension(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }

    if let Some(dot) = name.rfind('.') {
        let ext = &name[dot..];
        if dot > 0 && ext.len() <= 11 && ext.len() < max_bytes {
            let stem_budget = max_bytes - ext.len();
            let stem = truncate_to_char_boundary(&name[..dot], stem_budget);
            return format!("{stem}{ext}");
        }
    }

    truncate_to_char_boundary(name, max_bytes).to_string()
}

fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    let mut take = max_bytes.min(s.len());
    while take > 0 && !s.is_char_boundary(take) {
        take -= 1;
    }
    &s[..take]
}
