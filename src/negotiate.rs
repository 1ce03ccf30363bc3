//! Content fingerprints and conditional-GET decisions

use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::SystemTime;
use tokio::io::AsyncReadExt;

const HASH_CHUNK: usize = 64 * 1024;

/// Validators a client sent with its request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestValidators {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

/// Response class chosen for a conditional request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// 304 carrying only the ETag header
    EtagMatch,
    /// 304 carrying only the Last-Modified header
    LastModifiedMatch,
    /// 200 with the full body
    Full,
}

/// Hex SHA-256 of the uncompressed bytes.
pub fn fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash a file on disk without loading it whole.
pub async fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Strong ETag header value for a fingerprint.
pub fn etag(fingerprint: &str) -> String {
    format!("\"{}\"", fingerprint)
}

/// IMF-fixdate used for Last-Modified.
pub fn http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

fn opaque_tag(tag: &str) -> &str {
    tag.trim().trim_start_matches("W/").trim_matches('"')
}

fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let ours = opaque_tag(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque_tag(candidate) == ours)
}

/// Decide between 200 and 304. If-None-Match wins over If-Modified-Since,
/// and If-Modified-Since only matches the exact Last-Modified string.
pub fn negotiate(validators: &RequestValidators, etag: &str, last_modified: &str) -> Decision {
    if let Some(if_none_match) = validators.if_none_match.as_deref() {
        if etag_matches(if_none_match, etag) {
            return Decision::EtagMatch;
        }
    }
    if let Some(since) = validators.if_modified_since.as_deref() {
        if since.trim() == last_modified {
            return Decision::LastModifiedMatch;
        }
    }
    Decision::Full
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: &str = "\"abc123\"";
    const DATE: &str = "Sun, 06 Nov 1994 08:49:37 GMT";

    fn validators(inm: Option<&str>, ims: Option<&str>) -> RequestValidators {
        RequestValidators {
            if_none_match: inm.map(String::from),
            if_modified_since: ims.map(String::from),
        }
    }

    #[test]
    fn test_no_validators_is_full() {
        assert_eq!(negotiate(&RequestValidators::default(), TAG, DATE), Decision::Full);
    }

    #[test]
    fn test_etag_match() {
        assert_eq!(negotiate(&validators(Some(TAG), None), TAG, DATE), Decision::EtagMatch);
        assert_eq!(
            negotiate(&validators(Some("W/\"abc123\""), None), TAG, DATE),
            Decision::EtagMatch
        );
        assert_eq!(
            negotiate(&validators(Some("\"zzz\", \"abc123\""), None), TAG, DATE),
            Decision::EtagMatch
        );
        assert_eq!(negotiate(&validators(Some("*"), None), TAG, DATE), Decision::EtagMatch);
    }

    #[test]
    fn test_etag_takes_precedence() {
        assert_eq!(
            negotiate(&validators(Some(TAG), Some(DATE)), TAG, DATE),
            Decision::EtagMatch
        );
    }

    #[test]
    fn test_etag_mismatch_falls_through_to_date() {
        assert_eq!(
            negotiate(&validators(Some("\"other\""), Some(DATE)), TAG, DATE),
            Decision::LastModifiedMatch
        );
        assert_eq!(
            negotiate(&validators(Some("\"other\""), None), TAG, DATE),
            Decision::Full
        );
    }

    #[test]
    fn test_last_modified_is_exact_match() {
        assert_eq!(
            negotiate(&validators(None, Some(DATE)), TAG, DATE),
            Decision::LastModifiedMatch
        );
        // A later date is not honoured; only string equality counts.
        assert_eq!(
            negotiate(&validators(None, Some("Mon, 07 Nov 1994 08:49:37 GMT")), TAG, DATE),
            Decision::Full
        );
    }

    #[test]
    fn test_fingerprint_is_stable_sha256() {
        assert_eq!(
            fingerprint(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(etag("ab"), "\"ab\"");
    }

    #[tokio::test]
    async fn test_fingerprint_file_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        let data = vec![7u8; HASH_CHUNK * 2 + 13];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(fingerprint_file(&path).await.unwrap(), fingerprint(&data));
    }
}
