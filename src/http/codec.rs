//! HTTP/1.x message framing
//!
//! Just enough of RFC 9112 for a forward proxy: request/response heads,
//! body framing, chunked decoding, and relaying a body to a client while
//! capturing a decoded copy.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::headers::Headers;

/// Upper bound on a request or response head
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const COPY_BUF_SIZE: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("connection closed mid-message")]
    UnexpectedEof,

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("write to client failed: {0}")]
    Write(#[source] std::io::Error),
}

/// Parsed request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

/// Parsed status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Encode the head for the client
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} {}\r\n", self.version, self.status, self.reason).as_bytes());
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    /// Framing of a request body
    pub fn for_request(headers: &Headers) -> Result<Self, CodecError> {
        if headers.contains("transfer-encoding") {
            if headers.is_chunked() {
                return Ok(BodyFraming::Chunked);
            }
            return Err(CodecError::Malformed("unsupported transfer-encoding".into()));
        }
        match headers.get("content-length") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(|n| if n == 0 { BodyFraming::Empty } else { BodyFraming::Length(n) })
                .map_err(|_| CodecError::Malformed(format!("invalid content-length {:?}", value))),
            None => Ok(BodyFraming::Empty),
        }
    }

    /// Framing of a response body to a request with `method`
    pub fn for_response(method: &str, head: &ResponseHead) -> Self {
        if method.eq_ignore_ascii_case("HEAD")
            || head.is_informational()
            || head.status == 204
            || head.status == 304
        {
            return BodyFraming::Empty;
        }
        if head.headers.is_chunked() {
            return BodyFraming::Chunked;
        }
        match head.headers.content_length() {
            Some(0) => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n as u64),
            None => BodyFraming::UntilClose,
        }
    }
}

/// What to do when a body outgrows the capture limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Keep relaying, stop capturing
    Truncate,
    /// Fail with `BodyTooLarge`
    Reject,
}

/// Result of moving a body
#[derive(Debug, Default)]
pub struct Transfer {
    /// Decoded body bytes (up to the capture limit)
    pub body: Vec<u8>,
    /// Raw bytes written to the destination
    pub relayed: u64,
    /// Whether the capture stopped at the limit
    pub truncated: bool,
}

/// Read one raw line including its terminator. Empty on clean EOF.
async fn read_raw_line<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', &mut line)
        .await
        .map_err(CodecError::Read)?;

    if n > 0 && !line.ends_with(b"\n") {
        if n >= limit {
            return Err(CodecError::HeadTooLarge(MAX_HEAD_BYTES));
        }
        return Err(CodecError::UnexpectedEof);
    }
    Ok(line)
}

fn trim_line(line: &[u8]) -> String {
    let end = line
        .iter()
        .rposition(|b| *b != b'\n' && *b != b'\r')
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&line[..end]).into_owned()
}

/// Read header lines until the blank line, charging against `budget`
async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> Result<Headers, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        if *budget == 0 {
            return Err(CodecError::HeadTooLarge(MAX_HEAD_BYTES));
        }
        let raw = read_raw_line(reader, *budget).await?;
        if raw.is_empty() {
            return Err(CodecError::UnexpectedEof);
        }
        *budget = budget.saturating_sub(raw.len());

        let line = trim_line(&raw);
        if line.is_empty() {
            break;
        }

        // obs-fold continuation
        if line.starts_with(' ') || line.starts_with('\t') {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                    continue;
                }
                None => return Err(CodecError::Malformed("continuation before first header".into())),
            }
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::Malformed(format!("header without colon: {:?}", line)))?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(CodecError::Malformed(format!("invalid header name {:?}", name)));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers.into_iter().collect())
}

/// Read a request head. `None` if the peer closed before sending anything.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Option<RequestHead>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;

    let request_line = loop {
        let raw = read_raw_line(reader, budget).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        budget = budget.saturating_sub(raw.len());
        let line = trim_line(&raw);
        // Tolerate stray CRLFs between messages
        if !line.is_empty() {
            break line;
        }
        if budget == 0 {
            return Err(CodecError::HeadTooLarge(MAX_HEAD_BYTES));
        }
    };

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(CodecError::Malformed(format!("invalid request line {:?}", request_line)));
    }

    let headers = read_headers(reader, &mut budget).await?;

    Ok(Some(RequestHead {
        method: parts[0].to_string(),
        target: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
    }))
}

/// Read a response head
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEAD_BYTES;
    let raw = read_raw_line(reader, budget).await?;
    if raw.is_empty() {
        return Err(CodecError::UnexpectedEof);
    }
    budget = budget.saturating_sub(raw.len());

    let status_line = trim_line(&raw);
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(CodecError::Malformed(format!("invalid status line {:?}", status_line)));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or_else(|| CodecError::Malformed(format!("invalid status line {:?}", status_line)))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let headers = read_headers(reader, &mut budget).await?;

    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers,
    })
}

struct Capture {
    body: Vec<u8>,
    limit: usize,
    overflow: Overflow,
    truncated: bool,
}

impl Capture {
    fn push(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if self.truncated {
            return Ok(());
        }
        let room = self.limit.saturating_sub(self.body.len());
        if bytes.len() > room {
            if self.overflow == Overflow::Reject {
                return Err(CodecError::BodyTooLarge(self.limit));
            }
            self.body.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        } else {
            self.body.extend_from_slice(bytes);
        }
        Ok(())
    }
}

async fn relay<W>(writer: &mut W, bytes: &[u8], relayed: &mut u64) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await.map_err(CodecError::Write)?;
    *relayed += bytes.len() as u64;
    Ok(())
}

/// Copy exactly `remaining` bytes (or until EOF when `None`)
async fn copy_bytes<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut remaining: Option<u64>,
    capture: &mut Capture,
    relayed: &mut u64,
) -> Result<(), CodecError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let want = match remaining {
            Some(0) => return Ok(()),
            Some(n) => (n as usize).min(buf.len()),
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want]).await.map_err(CodecError::Read)?;
        if n == 0 {
            return match remaining {
                None => Ok(()),
                Some(_) => Err(CodecError::UnexpectedEof),
            };
        }
        capture.push(&buf[..n])?;
        relay(writer, &buf[..n], relayed).await?;
        if let Some(left) = remaining.as_mut() {
            *left -= n as u64;
        }
    }
}

/// Move a body from `reader` to `writer`, capturing the decoded bytes.
///
/// Chunked bodies are relayed with their framing intact; only the capture
/// is de-chunked.
pub async fn transfer_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    capture_limit: usize,
    overflow: Overflow,
) -> Result<Transfer, CodecError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut capture = Capture {
        body: Vec::new(),
        limit: capture_limit,
        overflow,
        truncated: false,
    };
    let mut relayed = 0u64;

    match framing {
        BodyFraming::Empty => {}
        BodyFraming::Length(n) => {
            if overflow == Overflow::Reject && n > capture_limit as u64 {
                return Err(CodecError::BodyTooLarge(capture_limit));
            }
            copy_bytes(reader, writer, Some(n), &mut capture, &mut relayed).await?;
        }
        BodyFraming::UntilClose => {
            copy_bytes(reader, writer, None, &mut capture, &mut relayed).await?;
        }
        BodyFraming::Chunked => loop {
            let size_line = read_raw_line(reader, MAX_HEAD_BYTES).await?;
            if size_line.is_empty() {
                return Err(CodecError::UnexpectedEof);
            }
            relay(writer, &size_line, &mut relayed).await?;

            let text = trim_line(&size_line);
            let size_hex = text.split(';').next().unwrap_or_default().trim();
            let size = u64::from_str_radix(size_hex, 16)
                .map_err(|_| CodecError::Malformed(format!("invalid chunk size {:?}", text)))?;

            if size == 0 {
                // Trailer section ends with an empty line
                loop {
                    let trailer = read_raw_line(reader, MAX_HEAD_BYTES).await?;
                    if trailer.is_empty() {
                        return Err(CodecError::UnexpectedEof);
                    }
                    relay(writer, &trailer, &mut relayed).await?;
                    if trim_line(&trailer).is_empty() {
                        break;
                    }
                }
                break;
            }

            copy_bytes(reader, writer, Some(size), &mut capture, &mut relayed).await?;

            let crlf = read_raw_line(reader, 2).await?;
            if crlf.is_empty() || !trim_line(&crlf).is_empty() {
                return Err(CodecError::Malformed("missing CRLF after chunk".into()));
            }
            relay(writer, &crlf, &mut relayed).await?;
        },
    }

    writer.flush().await.map_err(CodecError::Write)?;

    Ok(Transfer {
        body: capture.body,
        relayed,
        truncated: capture.truncated,
    })
}

/// Read a request body fully, rejecting anything over `limit`
pub async fn read_body<R>(reader: &mut R, framing: BodyFraming, limit: usize) -> Result<Vec<u8>, CodecError>
where
    R: AsyncBufRead + Unpin,
{
    let mut sink = tokio::io::sink();
    let transfer = transfer_body(reader, &mut sink, framing, limit, Overflow::Reject).await?;
    Ok(transfer.body)
}

/// A complete, connection-closing plain-text response
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn reader(bytes: &'static [u8]) -> BufReader<&'static [u8]> {
        BufReader::new(bytes)
    }

    #[tokio::test]
    async fn test_read_request_head() {
        let mut r = reader(b"\r\nGET http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nX-Long: one\r\n  two\r\n\r\nleftover");
        let head = read_request_head(&mut r).await.unwrap().unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://example.com/a?b=1");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.headers.get("host"), Some("example.com"));
        assert_eq!(head.headers.get("x-long"), Some("one two"));

        let mut rest = String::new();
        r.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "leftover");
    }

    #[tokio::test]
    async fn test_request_head_eof_and_garbage() {
        assert!(read_request_head(&mut reader(b"")).await.unwrap().is_none());
        assert!(matches!(
            read_request_head(&mut reader(b"NONSENSE\r\n\r\n")).await,
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            read_request_head(&mut reader(b"GET / HTTP/1.1\r\nHost: x\r\n")).await,
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_head_size_limit() {
        let mut big = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES));
        big.extend_from_slice(b"\r\n\r\n");
        let mut r = BufReader::new(big.as_slice());
        assert!(matches!(
            read_request_head(&mut r).await,
            Err(CodecError::HeadTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_read_response_head() {
        let mut r = reader(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        let head = read_response_head(&mut r).await.unwrap();
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "Not Found");
        assert_eq!(BodyFraming::for_response("GET", &head), BodyFraming::Empty);

        let mut r = reader(b"HTTP/1.1 200\r\n\r\n");
        let head = read_response_head(&mut r).await.unwrap();
        assert_eq!(head.reason, "");
        assert_eq!(BodyFraming::for_response("GET", &head), BodyFraming::UntilClose);
        assert_eq!(BodyFraming::for_response("HEAD", &head), BodyFraming::Empty);
    }

    #[tokio::test]
    async fn test_chunked_relay_keeps_framing() {
        let raw: &'static [u8] = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        let mut r = reader(raw);
        let mut out = Vec::new();

        let transfer = transfer_body(&mut r, &mut out, BodyFraming::Chunked, 1024, Overflow::Truncate)
            .await
            .unwrap();

        assert_eq!(transfer.body, b"Wikipedia");
        assert_eq!(out, raw);
        assert_eq!(transfer.relayed, raw.len() as u64);
    }

    #[tokio::test]
    async fn test_capture_truncates_but_relays_everything() {
        let mut r = reader(b"0123456789");
        let mut out = Vec::new();
        let transfer = transfer_body(&mut r, &mut out, BodyFraming::UntilClose, 4, Overflow::Truncate)
            .await
            .unwrap();

        assert_eq!(transfer.body, b"0123");
        assert!(transfer.truncated);
        assert_eq!(out, b"0123456789");
    }

    #[tokio::test]
    async fn test_read_body_limits() {
        let body = read_body(&mut reader(b"hello"), BodyFraming::Length(5), 16).await.unwrap();
        assert_eq!(body, b"hello");

        assert!(matches!(
            read_body(&mut reader(b"hello"), BodyFraming::Length(5), 4).await,
            Err(CodecError::BodyTooLarge(4))
        ));
        assert!(matches!(
            read_body(&mut reader(b"hel"), BodyFraming::Length(5), 16).await,
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_request_framing() {
        let mut headers = Headers::new();
        assert_eq!(BodyFraming::for_request(&headers).unwrap(), BodyFraming::Empty);

        headers.set("Content-Length", "12");
        assert_eq!(BodyFraming::for_request(&headers).unwrap(), BodyFraming::Length(12));

        headers.set("Transfer-Encoding", "chunked");
        assert_eq!(BodyFraming::for_request(&headers).unwrap(), BodyFraming::Chunked);

        headers.set("Transfer-Encoding", "gzip");
        assert!(BodyFraming::for_request(&headers).is_err());
    }

    #[test]
    fn test_simple_response() {
        let bytes = simple_response(444, "Dropped", "Request dropped by user");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 444 Dropped\r\n"));
        assert!(text.contains("Content-Length: 23\r\n"));
        assert!(text.ends_with("\r\n\r\nRequest dropped by user"));
    }
}
