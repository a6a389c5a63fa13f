//! The sliver of HTTP/1.1 a bulk-transport endpoint needs: one request head,
//! chunked body decoding and a fixed response head.

use exaconn_core::error::{ExaError, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Longest chunk-size or trailer line accepted.
const MAX_LINE_BYTES: usize = 8 * 1024;
const MAX_CHUNK_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// The server pushes data (SQL EXPORT).
    Put,
    /// The server pulls data (SQL IMPORT).
    Get,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Reads one `\n`-terminated line of at most `limit` bytes. `None` at end of
/// stream.
async fn read_limited_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .take(limit as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n == limit && buf.last() != Some(&b'\n') {
        return Err(ExaError::transport(format!(
            "HTTP line longer than {limit} bytes"
        )));
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ExaError::transport("HTTP line is not valid UTF-8"))
}

async fn read_head_lines<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut total = 0usize;
    loop {
        let Some(line) = read_limited_line(reader, MAX_HEAD_BYTES + 1 - total).await? else {
            return Err(ExaError::transport("connection closed inside HTTP head"));
        };
        let n = line.len();
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(ExaError::transport("HTTP head too large"));
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            return Ok(lines);
        }
        lines.push(line);
    }
}

fn parse_headers(lines: &[String]) -> Vec<(String, String)> {
    lines
        .iter()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

pub async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<RequestHead> {
    let lines = read_head_lines(reader).await?;
    let mut parts = lines[0].split_whitespace();
    let method = match parts.next() {
        Some("PUT") => Method::Put,
        Some("GET") => Method::Get,
        Some(other) => {
            return Err(ExaError::transport(format!("unsupported HTTP method: {other}")))
        }
        None => return Err(ExaError::transport("empty HTTP request line")),
    };
    let path = parts.next().unwrap_or("/").to_string();
    Ok(RequestHead {
        method,
        path,
        headers: parse_headers(&lines[1..]),
    })
}

/// Returns the status code of a response head and its headers.
pub async fn read_response_head<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<(u16, Vec<(String, String)>)> {
    let lines = read_head_lines(reader).await?;
    let status = lines[0]
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ExaError::transport(format!("bad HTTP status line: {}", lines[0])))?;
    Ok((status, parse_headers(&lines[1..])))
}

pub async fn write_ok_response<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer
        .write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: application/octet-stream\r\n\
              Content-Disposition: attachment; filename=data.csv\r\n\
              Connection: close\r\n\r\n",
        )
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Decoder for a `Transfer-Encoding: chunked` body.
pub struct ChunkedReader<R> {
    inner: R,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Next chunk payload, or `None` after the terminating zero-length chunk.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let Some(line) = read_limited_line(&mut self.inner, MAX_LINE_BYTES).await? else {
            return Err(ExaError::transport(
                "connection closed before the final chunk",
            ));
        };
        let size_field = line
            .trim_end_matches(['\r', '\n'])
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ExaError::transport(format!("invalid chunk length: {size_field:?}")))?;
        if size > MAX_CHUNK_BYTES {
            return Err(ExaError::transport(format!("chunk too large: {size}")));
        }
        if size == 0 {
            self.skip_trailers().await?;
            self.done = true;
            return Ok(None);
        }
        let mut data = vec![0u8; size];
        self.inner
            .read_exact(&mut data)
            .await
            .map_err(|e| ExaError::transport(format!("truncated chunk: {e}")))?;
        let mut delimiter = [0u8; 2];
        self.inner
            .read_exact(&mut delimiter)
            .await
            .map_err(|_| ExaError::transport("missing chunk delimiter"))?;
        if &delimiter != b"\r\n" {
            return Err(ExaError::transport(format!(
                "invalid chunk delimiter: {delimiter:?}"
            )));
        }
        Ok(Some(data))
    }

    async fn skip_trailers(&mut self) -> Result<()> {
        loop {
            match read_limited_line(&mut self.inner, MAX_LINE_BYTES).await? {
                Some(line) if !line.trim_end_matches(['\r', '\n']).is_empty() => continue,
                _ => return Ok(()),
            }
        }
    }
}

pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    writer
        .write_all(format!("{:X}\r\n", data.len()).as_bytes())
        .await?;
    writer.write_all(data).await?;
    writer.write_all(b"\r\n").await?;
    Ok(())
}

pub async fn write_final_chunk<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(b"0\r\n\r\n").await?;
    writer.flush().await?;
    Ok(())
}
