//! Minimal HTTP/1.1 request parsing and response serialization

use crate::config::MAX_REQUEST_SIZE;
use crate::error::{Error, Result};
use crate::negotiate::RequestValidators;
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CACHE_CONTROL: &str = "public, max-age=3600";

pub const SECURITY_HEADERS: [(&str, &str); 3] = [
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("X-XSS-Protection", "1; mode=block"),
];

const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Other(String),
}

impl Method {
    fn parse(raw: &[u8]) -> Self {
        match raw {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            other => Method::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Request target as sent, including any query string
    pub target: String,
    /// Percent-decoded path without query or fragment
    pub path: String,
    pub version: String,
    pub validators: RequestValidators,
    pub keep_alive: bool,
}

impl Request {
    /// Build a GET request directly; used by tests and internal callers.
    pub fn get(target: &str) -> Result<Self> {
        Ok(Self {
            method: Method::Get,
            target: target.to_string(),
            path: decode_path(target)?,
            version: "HTTP/1.1".to_string(),
            validators: RequestValidators::default(),
            keep_alive: true,
        })
    }

    pub fn with_validators(mut self, validators: RequestValidators) -> Self {
        self.validators = validators;
        self
    }
}

// Fast case-insensitive ASCII comparison without allocation
fn header_starts_with(header_line: &[u8], prefix: &str) -> bool {
    header_line.len() >= prefix.len()
        && header_line[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Header value after the colon. Bytes outside UTF-8 (obs-text) are
/// replaced rather than rejected.
fn header_value(line: &[u8]) -> Option<String> {
    let colon = line.iter().position(|&b| b == b':')?;
    Some(String::from_utf8_lossy(&line[colon + 1..]).trim().to_string())
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

fn parse_request_line(request: &[u8]) -> Option<(&[u8], &str, &str)> {
    let mut parts = request.split(|&b| b == b' ').filter(|part| !part.is_empty());

    let method = parts.next()?;
    let path = std::str::from_utf8(parts.next()?).ok()?;
    let version = std::str::from_utf8(parts.next()?).ok()?;

    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }
    Some((method, path, version))
}

/// Strip query and fragment, then percent-decode.
pub fn decode_path(target: &str) -> Result<String> {
    let path = target.split(|c: char| c == '?' || c == '#').next().unwrap_or(target);
    urlencoding::decode(path)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::BadRequest(format!("invalid percent-encoding in {}", target)))
}

/// Read one request head. `Ok(None)` means the peer closed the connection
/// before sending anything. No line is buffered past `MAX_REQUEST_SIZE`.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut request_line = Vec::new();
    loop {
        request_line.clear();
        let n = read_line_limited(reader, &mut request_line).await?;
        if n == 0 {
            return Ok(None);
        }
        if n > MAX_REQUEST_SIZE {
            return Err(Error::RequestTooLarge);
        }
        // Tolerate stray CRLFs between keep-alive requests.
        if !trim_bytes(&request_line).is_empty() {
            break;
        }
    }

    let trimmed = trim_bytes(&request_line);
    let (method, target, version) = parse_request_line(trimmed)
        .ok_or_else(|| Error::BadRequest(String::from_utf8_lossy(trimmed).into_owned()))?;
    let method = Method::parse(method);
    let path = decode_path(target)?;
    let target = target.to_string();
    let version = version.to_string();

    let mut keep_alive = version == "HTTP/1.1";
    let mut validators = RequestValidators::default();

    let mut line = Vec::new();
    let mut total = request_line.len();
    for _ in 0..=MAX_HEADERS {
        line.clear();
        let n = read_line_limited(reader, &mut line).await?;
        total += n;
        if total > MAX_REQUEST_SIZE {
            return Err(Error::RequestTooLarge);
        }
        let header = trim_bytes(&line);
        if n == 0 || header.is_empty() {
            return Ok(Some(Request {
                method,
                target,
                path,
                version,
                validators,
                keep_alive,
            }));
        }

        if header_starts_with(header, "connection:") {
            let value = header_value(header).unwrap_or_default().to_ascii_lowercase();
            keep_alive =
                !value.contains("close") && (version == "HTTP/1.1" || value.contains("keep-alive"));
        } else if header_starts_with(header, "if-none-match:") {
            validators.if_none_match = header_value(header);
        } else if header_starts_with(header, "if-modified-since:") {
            validators.if_modified_since = header_value(header);
        }
    }

    Err(Error::RequestTooLarge)
}

/// One raw line, never buffering more than `MAX_REQUEST_SIZE + 1` bytes.
async fn read_line_limited<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_REQUEST_SIZE as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    Ok(n)
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Plain-text error or message response.
    pub fn plain(status: u16, message: impl Into<String>) -> Self {
        Self::new(
            status,
            vec![("Content-Type".to_string(), "text/plain".to_string())],
            Bytes::from(message.into()),
        )
    }

    pub fn from_error(err: &Error) -> Self {
        Self::plain(err.status(), err.to_string())
    }

    /// 304 carrying a single validator header and no body.
    pub fn not_modified(name: &str, value: &str) -> Self {
        Self::new(
            304,
            vec![(name.to_string(), value.to_string())],
            Bytes::new(),
        )
    }

    pub fn html(body: String) -> Self {
        let mut headers = vec![
            (
                "Content-Type".to_string(),
                "text/html; charset=utf-8".to_string(),
            ),
            ("Cache-Control".to_string(), "no-cache".to_string()),
        ];
        headers.extend(
            SECURITY_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        Self::new(200, headers, Bytes::from(body))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Status line and headers, with framing headers appended.
    pub fn head_bytes(&self, keep_alive: bool) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if self.status != 304 {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        head.push_str(if keep_alive {
            "Connection: keep-alive\r\n\r\n"
        } else {
            "Connection: close\r\n\r\n"
        });
        head.into_bytes()
    }

    pub async fn write_to<W>(&self, writer: &mut W, include_body: bool, keep_alive: bool) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.head_bytes(keep_alive)).await?;
        if include_body && !self.body.is_empty() {
            writer.write_all(&self.body).await?;
        }
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &str) -> Result<Option<Request>> {
        let mut reader = BufReader::new(raw.as_bytes());
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_get_with_validators() {
        let request = parse(
            "GET /css/style.css?v=2 HTTP/1.1\r\nHost: x\r\nIf-None-Match: \"abc\"\r\nif-modified-since: Sun, 06 Nov 1994 08:49:37 GMT\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.target, "/css/style.css?v=2");
        assert_eq!(request.path, "/css/style.css");
        assert!(request.keep_alive);
        assert_eq!(request.validators.if_none_match.as_deref(), Some("\"abc\""));
        assert_eq!(
            request.validators.if_modified_since.as_deref(),
            Some("Sun, 06 Nov 1994 08:49:37 GMT")
        );
    }

    #[tokio::test]
    async fn test_percent_decoding() {
        let request = parse("GET /my%20file.txt HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.path, "/my file.txt");

        let request = parse("GET /..%2F..%2Fetc%2Fpasswd HTTP/1.1\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.path, "/../../etc/passwd");
    }

    #[tokio::test]
    async fn test_connection_close_and_http10() {
        let request = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(!request.keep_alive);

        let request = parse("GET / HTTP/1.0\r\n\r\n").await.unwrap().unwrap();
        assert!(!request.keep_alive);

        let request = parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(request.keep_alive);
    }

    #[tokio::test]
    async fn test_malformed_and_oversized() {
        assert!(matches!(parse("GARBAGE\r\n\r\n").await, Err(Error::BadRequest(_))));
        assert!(matches!(
            parse("GET / HTTP/1.1 extra\r\n\r\n").await,
            Err(Error::BadRequest(_))
        ));

        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(MAX_REQUEST_SIZE));
        assert!(matches!(parse(&long).await, Err(Error::RequestTooLarge)));
    }

    #[tokio::test]
    async fn test_non_utf8_header_value_is_tolerated() {
        let raw: &[u8] = b"GET /a.txt HTTP/1.1\r\nX-Name: \xff\xfe\r\nIf-None-Match: \"t\"\r\n\r\n";
        let mut reader = BufReader::new(raw);
        let request = read_request(&mut reader).await.unwrap().unwrap();
        assert_eq!(request.path, "/a.txt");
        assert_eq!(request.validators.if_none_match.as_deref(), Some("\"t\""));
    }

    #[tokio::test]
    async fn test_non_utf8_request_line_is_bad_request() {
        let raw: &[u8] = b"GET /\xff\xfe HTTP/1.1\r\n\r\n";
        let mut reader = BufReader::new(raw);
        assert!(matches!(read_request(&mut reader).await, Err(Error::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_eof_is_none() {
        assert!(parse("").await.unwrap().is_none());
    }

    #[test]
    fn test_head_bytes() {
        let response = Response::plain(404, "File not found");
        let head = String::from_utf8(response.head_bytes(false)).unwrap();
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("Content-Length: 14\r\n"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));

        let head = String::from_utf8(Response::not_modified("ETag", "\"x\"").head_bytes(true)).unwrap();
        assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n"));
        assert!(!head.contains("Content-Length"));
    }
}
