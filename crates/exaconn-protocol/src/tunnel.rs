//! Proxy handshake spoken on a bulk-transport connection before any HTTP.
//!
//! The client sends three 32-bit integers `(magic, 1, 1)` and the server
//! answers with `(unused, port, host[16])`. The address in the answer is what
//! the server dials back into when the EXPORT/IMPORT statement runs.
//!
//! Both packets use little-endian packing, which matches every server
//! platform seen so far. The byte order lives only in this module.

use bytes::{Buf, BufMut, BytesMut};
use exaconn_core::error::{ExaError, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const TUNNEL_MAGIC: i32 = 0x0221_2102;
pub const HANDSHAKE_LEN: usize = 12;
pub const HANDSHAKE_REPLY_LEN: usize = 24;
const HOST_FIELD_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse the `host:port` form written by [`fmt::Display`].
    pub fn parse(raw: &str) -> Result<Self> {
        let (host, port) = raw
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| ExaError::transport(format!("invalid proxy address: {raw}")))?;
        let port = port
            .parse()
            .map_err(|_| ExaError::transport(format!("invalid proxy port: {raw}")))?;
        if host.is_empty() {
            return Err(ExaError::transport(format!("invalid proxy host: {raw}")));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub fn encode_handshake() -> [u8; HANDSHAKE_LEN] {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    buf.put_i32_le(TUNNEL_MAGIC);
    buf.put_i32_le(1);
    buf.put_i32_le(1);
    let mut out = [0u8; HANDSHAKE_LEN];
    out.copy_from_slice(&buf);
    out
}

pub fn decode_handshake_reply(reply: &[u8; HANDSHAKE_REPLY_LEN]) -> Result<ProxyAddress> {
    let mut buf = &reply[..];
    let _unused = buf.get_i32_le();
    let port = buf.get_i32_le();
    let port = u16::try_from(port)
        .map_err(|_| ExaError::transport(format!("proxy port out of range: {port}")))?;
    let host_field = &buf[..HOST_FIELD_LEN];
    let end = host_field
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(HOST_FIELD_LEN);
    let host = std::str::from_utf8(&host_field[..end])
        .map_err(|_| ExaError::transport("proxy host is not ASCII"))?
        .trim_matches('\0')
        .to_string();
    if host.is_empty() {
        return Err(ExaError::transport("proxy handshake returned an empty host"));
    }
    Ok(ProxyAddress { host, port })
}

pub fn encode_handshake_reply(address: &ProxyAddress) -> Result<[u8; HANDSHAKE_REPLY_LEN]> {
    let host = address.host.as_bytes();
    if host.len() > HOST_FIELD_LEN {
        return Err(ExaError::transport(format!(
            "proxy host longer than {HOST_FIELD_LEN} bytes: {}",
            address.host
        )));
    }
    let mut buf = BytesMut::with_capacity(HANDSHAKE_REPLY_LEN);
    buf.put_i32_le(0);
    buf.put_i32_le(address.port as i32);
    buf.extend_from_slice(host);
    buf.put_bytes(0, HOST_FIELD_LEN - host.len());
    let mut out = [0u8; HANDSHAKE_REPLY_LEN];
    out.copy_from_slice(&buf);
    Ok(out)
}

/// Client side: send the magic packet and read back the proxy address.
pub async fn open_proxy<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<ProxyAddress> {
    stream.write_all(&encode_handshake()).await?;
    stream.flush().await?;
    let mut reply = [0u8; HANDSHAKE_REPLY_LEN];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| ExaError::transport(format!("proxy handshake failed: {e}")))?;
    decode_handshake_reply(&reply)
}

/// Server side, used by tools that emulate the database proxy.
pub async fn accept_proxy<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    address: &ProxyAddress,
) -> Result<()> {
    let mut packet = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut packet).await?;
    if packet != encode_handshake() {
        return Err(ExaError::transport("unexpected proxy handshake packet"));
    }
    stream.write_all(&encode_handshake_reply(address)?).await?;
    stream.flush().await?;
    Ok(())
}
