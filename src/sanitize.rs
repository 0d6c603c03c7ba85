#![forbid(unsafe_code)]

//! Filename helpers for the saved artifact.

const MAX_STEM_CHARS: usize = 150;
const FALLBACK_STEM: &str = "video";
pub const DEFAULT_EXTENSION: &str = "mp4";

/// Replaces every character that is not a word character (Unicode
/// alphanumerics and `_`) or `-` with `_`. Whitespace counts as unsafe.
///
/// The result is stable under repeated application.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_CHARS)
        .collect();
    if cleaned.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        cleaned
    }
}

/// `<sanitized title>.<ext>`; the extension itself is sanitized and defaults
/// to mp4 when empty.
pub fn artifact_filename(title: &str, ext: Option<&str>) -> String {
    let ext = ext
        .map(|ext| ext.trim_start_matches('.'))
        .filter(|ext| !ext.is_empty())
        .map(sanitize_filename)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    format!("{}.{}", sanitize_filename(title), ext)
}
