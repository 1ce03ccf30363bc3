//! Content-Type lookup by file extension

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

static MIME_TYPES: Lazy<FxHashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("html", "text/html; charset=utf-8"),
        ("htm", "text/html; charset=utf-8"),
        ("css", "text/css; charset=utf-8"),
        ("js", "text/javascript; charset=utf-8"),
        ("mjs", "text/javascript; charset=utf-8"),
        ("json", "application/json; charset=utf-8"),
        ("xml", "application/xml; charset=utf-8"),
        ("txt", "text/plain; charset=utf-8"),
        ("md", "text/markdown; charset=utf-8"),
        ("csv", "text/csv; charset=utf-8"),
        ("ico", "image/x-icon"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("webp", "image/webp"),
        ("svg", "image/svg+xml"),
        ("pdf", "application/pdf"),
        ("wasm", "application/wasm"),
        ("woff", "font/woff"),
        ("woff2", "font/woff2"),
        ("ttf", "font/ttf"),
        ("eot", "application/vnd.ms-fontobject"),
        ("mp4", "video/mp4"),
        ("webm", "video/webm"),
        ("mp3", "audio/mpeg"),
    ]
    .into_iter()
    .collect()
});

/// Content-Type for a file, by extension (case-insensitive).
pub fn content_type(path: &Path) -> &'static str {
    path.extension()
        .and_then(|s| s.to_str())
        .and_then(|ext| MIME_TYPES.get(ext.to_lowercase().as_str()).copied())
        .unwrap_or(OCTET_STREAM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types() {
        assert_eq!(content_type(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("STYLE.CSS")), "text/css; charset=utf-8");
        assert_eq!(content_type(Path::new("a/b/logo.svg")), "image/svg+xml");
    }

    #[test]
    fn test_unknown_and_missing_extension() {
        assert_eq!(content_type(Path::new("archive.xyz")), OCTET_STREAM);
        assert_eq!(content_type(Path::new("Makefile")), OCTET_STREAM);
    }
}
