//! HTTP/1.1 message plumbing for the reverse proxy
//!
//! Heads are parsed with httparse into editable structures so rewrite
//! templates can be applied before the head is re-serialized toward the
//! backend. Bodies are never buffered whole: they stream through with
//! Content-Length, raw chunked passthrough, or read-to-EOF framing.

use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum number of header fields accepted in one message head
const MAX_HEADERS: usize = 100;

/// Cap for a single chunk-size or trailer line
const MAX_LINE: usize = 16 * 1024;

/// Parsed, editable request head
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// HTTP minor version (0 or 1)
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

/// Parsed response head
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn connection_has_token(headers: &[(String, String)], token: &str) -> bool {
    find_header(headers, "connection")
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

impl RequestHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace the first occurrence of a header or append it
    pub fn set_header(&mut self, name: &str, value: String) {
        if let Some(entry) = self
            .headers
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.headers.push((name.to_string(), value));
        }
    }

    /// Host header with any port suffix stripped
    pub fn host(&self) -> Option<String> {
        let raw = self.header("host")?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix('[') {
            // Bracketed IPv6 literal, optionally with a port
            let end = rest.find(']')?;
            return Some(rest[..end].to_string());
        }
        match raw.rfind(':') {
            Some(pos) => Some(raw[..pos].to_string()),
            None => Some(raw.to_string()),
        }
    }

    /// Whether the connection survives this exchange
    pub fn keep_alive(&self) -> bool {
        if connection_has_token(&self.headers, "close") {
            return false;
        }
        if self.version == 0 {
            return connection_has_token(&self.headers, "keep-alive");
        }
        true
    }

    /// Whether this request asks for a protocol upgrade (e.g. WebSocket)
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade").is_some()
    }

    /// Serialize the head, terminating blank line included
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(b" HTTP/1.");
        out.push(b'0' + self.version);
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(b"HTTP/1.");
        out.push(b'0' + self.version);
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::with_capacity(raw.len());
    for h in raw {
        let value = std::str::from_utf8(h.value)
            .map_err(|_| anyhow!("non-utf8 header value for '{}'", h.name))?;
        headers.push((h.name.to_string(), value.to_string()));
    }
    Ok(headers)
}

/// Read a request head from the stream, accumulating into `buf`.
///
/// Bytes past the head (the body start) are left in `buf`. Returns
/// `Ok(None)` on a clean close before the first byte.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut temp = vec![0u8; 8 * 1024];
    loop {
        if !buf.is_empty() {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut req = httparse::Request::new(&mut slots);
            match req.parse(buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let head = RequestHead {
                        method: req.method.unwrap_or("").to_string(),
                        target: req.path.unwrap_or("").to_string(),
                        version: req.version.unwrap_or(1) as u8,
                        headers: collect_headers(req.headers)?,
                    };
                    buf.advance(head_len);
                    return Ok(Some(head));
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => bail!("malformed request head: {}", e),
            }
            if buf.len() > max_size {
                bail!("request head too large");
            }
        }

        let n = stream.read(&mut temp).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("connection closed with incomplete request head");
        }
        buf.extend_from_slice(&temp[..n]);
    }
}

/// Read a response head from the backend, accumulating into `buf`
pub async fn read_response_head<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut temp = vec![0u8; 8 * 1024];
    loop {
        if !buf.is_empty() {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut slots);
            match resp.parse(buf) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let head = ResponseHead {
                        status: resp.code.ok_or_else(|| anyhow!("missing status code"))?,
                        reason: resp.reason.unwrap_or("").to_string(),
                        version: resp.version.unwrap_or(1) as u8,
                        headers: collect_headers(resp.headers)?,
                    };
                    buf.advance(head_len);
                    return Ok(head);
                }
                Ok(httparse::Status::Partial) => {}
                Err(e) => bail!("malformed response head: {}", e),
            }
            if buf.len() > max_size {
                bail!("response head too large");
            }
        }

        let n = stream.read(&mut temp).await?;
        if n == 0 {
            bail!("connection closed with incomplete response head");
        }
        buf.extend_from_slice(&temp[..n]);
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body
    None,
    /// Exactly this many bytes
    ContentLength(u64),
    /// Chunked transfer coding, forwarded raw
    Chunked,
    /// Body runs to connection close
    ReadToEof,
}

fn framing_from_headers(headers: &[(String, String)]) -> Option<BodyFraming> {
    if let Some(te) = find_header(headers, "transfer-encoding") {
        if te
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case("chunked"))
        {
            return Some(BodyFraming::Chunked);
        }
    }
    if let Some(cl) = find_header(headers, "content-length") {
        if let Ok(n) = cl.trim().parse::<u64>() {
            return Some(BodyFraming::ContentLength(n));
        }
    }
    None
}

/// Body framing of a request
pub fn request_body_framing(head: &RequestHead) -> BodyFraming {
    framing_from_headers(&head.headers).unwrap_or(BodyFraming::None)
}

/// Body framing of a response to `request_method`.
///
/// `suppress_head_body` reflects the site's skip-body-on-HEAD flag.
pub fn response_body_framing(
    head: &ResponseHead,
    request_method: &str,
    suppress_head_body: bool,
) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD") && suppress_head_body {
        return BodyFraming::None;
    }
    if head.status < 200 || head.status == 204 || head.status == 304 {
        return BodyFraming::None;
    }
    framing_from_headers(&head.headers).unwrap_or(BodyFraming::ReadToEof)
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut temp = [0u8; 8 * 1024];
    let n = stream.read(&mut temp).await?;
    buf.extend_from_slice(&temp[..n]);
    Ok(n)
}

/// Read one CRLF-terminated line (returned including its terminator)
async fn read_line<S>(stream: &mut S, buf: &mut BytesMut) -> Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            return Ok(buf.split_to(pos + 1));
        }
        if buf.len() > MAX_LINE {
            bail!("chunk line too long");
        }
        if fill(stream, buf).await? == 0 {
            bail!("connection closed inside chunked body");
        }
    }
}

/// Forward exactly `count` bytes from `src` (honoring `buf` first) to `dst`
async fn forward_exact<S, D>(
    src: &mut S,
    dst: &mut D,
    buf: &mut BytesMut,
    mut count: u64,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let total = count;
    while count > 0 {
        if buf.is_empty() && fill(src, buf).await? == 0 {
            bail!("connection closed inside message body");
        }
        let take = (buf.len() as u64).min(count) as usize;
        let piece = buf.split_to(take);
        dst.write_all(&piece).await?;
        count -= take as u64;
    }
    Ok(total)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| anyhow!("non-utf8 chunk size line"))?
        .trim_end_matches(['\r', '\n']);
    // Chunk extensions follow a ';'
    let digits = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(digits, 16).map_err(|_| anyhow!("invalid chunk size: '{}'", digits))
}

/// Stream a message body from `src` to `dst` according to `framing`.
/// `buf` carries bytes already read past the head. Returns body bytes
/// forwarded.
pub async fn relay_body<S, D>(
    src: &mut S,
    dst: &mut D,
    buf: &mut BytesMut,
    framing: BodyFraming,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let mut forwarded: u64 = 0;
    match framing {
        BodyFraming::None => {}
        BodyFraming::ContentLength(n) => {
            forwarded = forward_exact(src, dst, buf, n).await?;
        }
        BodyFraming::ReadToEof => {
            loop {
                if buf.is_empty() && fill(src, buf).await? == 0 {
                    break;
                }
                let piece = buf.split();
                forwarded += piece.len() as u64;
                dst.write_all(&piece).await?;
            }
        }
        BodyFraming::Chunked => {
            // Forward the chunked coding verbatim, scanning only enough
            // to find where the body ends
            loop {
                let line = read_line(src, buf).await?;
                let size = parse_chunk_size(&line)?;
                dst.write_all(&line).await?;
                forwarded += line.len() as u64;
                if size == 0 {
                    // Trailer section runs to an empty line
                    loop {
                        let trailer = read_line(src, buf).await?;
                        dst.write_all(&trailer).await?;
                        forwarded += trailer.len() as u64;
                        if trailer.as_ref() == b"\r\n" || trailer.as_ref() == b"\n" {
                            break;
                        }
                    }
                    break;
                }
                // Chunk data plus its trailing CRLF
                let span = size
                    .checked_add(2)
                    .ok_or_else(|| anyhow!("chunk size overflow"))?;
                forwarded += forward_exact(src, dst, buf, span).await?;
            }
        }
    }
    dst.flush().await?;
    Ok(forwarded)
}

/// Minimal error response used when the backend is unreachable
pub fn simple_response(status: u16, reason: &str) -> Vec<u8> {
    let body = format!("{} {}\r\n", status, reason);
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}
