//! HTTP-shaped framing for the join handshake.
//!
//! The joining peer sends a CONNECT-style request to a fixed path with the
//! sealed identity as body; the acceptor answers with an HTTP-status-shaped
//! reply whose body is either the sealed credential (202) or a problem
//! payload (anything else). After a 202 the very same connection is
//! promoted to a multiplexed session — nothing HTTP remains on the wire.
//!
//! Parsing is deliberately minimal and bounded: request line, a handful of
//! headers, Content-Length, body. Anything else fails fast.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use muster_core::wire::JOIN_PATH;

/// Bound on any single head line.
const MAX_LINE: u64 = 1024;
/// Bound on the number of header lines.
const MAX_HEADERS: usize = 32;
/// Bound on a response body (problem payload or sealed credential).
const MAX_RESPONSE_BODY: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum JoinWireError {
    #[error("malformed request line: {0:?}")]
    BadRequestLine(String),
    #[error("malformed status line: {0:?}")]
    BadStatusLine(String),
    #[error("head line exceeds {MAX_LINE} bytes")]
    LineTooLong,
    #[error("too many header lines")]
    TooManyHeaders,
    #[error("missing content-length")]
    MissingLength,
    #[error("body of {got} bytes exceeds limit {limit}")]
    BodyTooLarge { got: usize, limit: usize },
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer side: send the join request carrying the sealed identity.
pub async fn write_join_request<W: AsyncWrite + Unpin>(
    w: &mut W,
    body: &[u8],
) -> Result<(), JoinWireError> {
    let head = format!(
        "CONNECT {JOIN_PATH} HTTP/1.1\r\nHost: muster\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Acceptor side: read and validate the join request, returning the sealed
/// identity body. The body size bound is enforced before the body is read.
pub async fn read_join_request<R: AsyncBufRead + Unpin>(
    r: &mut R,
    max_body: usize,
) -> Result<Vec<u8>, JoinWireError> {
    let line = read_line(r).await?;
    let mut parts = line.split_whitespace();
    let (method, path, version) = (parts.next(), parts.next(), parts.next());
    if method != Some("CONNECT") || path != Some(JOIN_PATH) || version != Some("HTTP/1.1") {
        return Err(JoinWireError::BadRequestLine(line));
    }

    let content_length = read_headers(r).await?.ok_or(JoinWireError::MissingLength)?;
    if content_length > max_body {
        return Err(JoinWireError::BodyTooLarge {
            got: content_length,
            limit: max_body,
        });
    }

    let mut body = vec![0u8; content_length];
    r.read_exact(&mut body).await?;
    Ok(body)
}

/// Acceptor side: write the join reply. 202 carries the sealed credential;
/// every other status carries a problem payload.
pub async fn write_join_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    status: u16,
    body: &[u8],
) -> Result<(), JoinWireError> {
    let content_type = if status == muster_core::wire::status::ACCEPTED {
        "application/octet-stream"
    } else {
        "application/problem+json"
    };
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n\r\n",
        reason(status),
        body.len()
    );
    w.write_all(head.as_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

/// Peer side: read the join reply, returning status code and body.
pub async fn read_join_response<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<(u16, Vec<u8>), JoinWireError> {
    let line = read_line(r).await?;
    let mut parts = line.split_whitespace();
    let status = match (parts.next(), parts.next()) {
        (Some("HTTP/1.1"), Some(code)) => code
            .parse::<u16>()
            .map_err(|_| JoinWireError::BadStatusLine(line.clone()))?,
        _ => return Err(JoinWireError::BadStatusLine(line)),
    };

    let content_length = read_headers(r).await?.unwrap_or(0);
    if content_length > MAX_RESPONSE_BODY {
        return Err(JoinWireError::BodyTooLarge {
            got: content_length,
            limit: MAX_RESPONSE_BODY,
        });
    }

    let mut body = vec![0u8; content_length];
    r.read_exact(&mut body).await?;
    Ok((status, body))
}

// ── Internals ─────────────────────────────────────────────────────────────────

/// Read one CRLF-terminated line, bounded by `MAX_LINE`.
async fn read_line<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<String, JoinWireError> {
    let mut buf = Vec::new();
    let n = r.take(MAX_LINE).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(JoinWireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed mid-head",
        )));
    }
    if !buf.ends_with(b"\n") {
        return Err(JoinWireError::LineTooLong);
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Consume header lines up to the blank separator, extracting
/// Content-Length if present.
async fn read_headers<R: AsyncBufRead + Unpin>(
    r: &mut R,
) -> Result<Option<usize>, JoinWireError> {
    let mut content_length = None;
    for _ in 0..MAX_HEADERS {
        let line = read_line(r).await?;
        if line.is_empty() {
            return Ok(content_length);
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }
    Err(JoinWireError::TooManyHeaders)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        406 => "Not Acceptable",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
