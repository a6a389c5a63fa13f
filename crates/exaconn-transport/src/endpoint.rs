use crate::compression::{Deflater, Inflater};
use crate::tls::self_signed_acceptor;
use exaconn_core::error::{ExaError, Result};
use exaconn_protocol::http::{read_request_head, write_ok_response, ChunkedReader, Method};
use exaconn_protocol::tunnel::{open_proxy, ProxyAddress};
use metrics::counter;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Direction of a bulk transfer, named after the SQL statement that drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// `EXPORT`: the database pushes data with `PUT`.
    Export,
    /// `IMPORT`: the database pulls data with `GET`.
    Import,
}

impl TunnelMode {
    fn expected_method(self) -> Method {
        match self {
            TunnelMode::Export => Method::Put,
            TunnelMode::Import => Method::Get,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelMode::Export => "export",
            TunnelMode::Import => "import",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Database node the tunnel dials.
    pub address: SocketAddr,
    pub compression: bool,
    pub encryption: bool,
    pub connect_timeout: Duration,
}

impl TunnelOptions {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            compression: false,
            encryption: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Bytes on the HTTP connection, after compression.
    pub wire_bytes: u64,
    /// Bytes delivered to the sink or taken from the source.
    pub data_bytes: u64,
}

/// One bulk-transport endpoint.
///
/// The endpoint dials the database, performs the proxy handshake and then
/// acts as an HTTP server on the very same socket for exactly one request.
/// It is consumed by [`TunnelEndpoint::export_to`] or
/// [`TunnelEndpoint::import_from`]; there is no second request.
#[derive(Debug)]
pub struct TunnelEndpoint {
    stream: TcpStream,
    proxy: ProxyAddress,
    options: TunnelOptions,
}

impl TunnelEndpoint {
    pub async fn connect(options: TunnelOptions) -> Result<Self> {
        let mut stream = timeout(options.connect_timeout, TcpStream::connect(options.address))
            .await
            .map_err(|_| {
                ExaError::transport(format!("timed out connecting to {}", options.address))
            })?
            .map_err(|e| ExaError::transport(format!("could not connect to {}: {e}", options.address)))?;
        stream.set_nodelay(true)?;
        let proxy = open_proxy(&mut stream).await?;
        info!(node = %options.address, proxy = %proxy, "tunnel opened");
        Ok(Self {
            stream,
            proxy,
            options,
        })
    }

    pub fn proxy(&self) -> &ProxyAddress {
        &self.proxy
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.options
    }

    /// Serve the database's `PUT` and write the decoded body into `sink`.
    pub async fn export_to<W: AsyncWrite + Unpin>(self, sink: &mut W) -> Result<TransferStats> {
        let compression = self.options.compression;
        let stats = if self.options.encryption {
            let stream = self_signed_acceptor()?
                .accept(self.stream)
                .await
                .map_err(|e| ExaError::transport(format!("tls accept failed: {e}")))?;
            serve_export(stream, sink, compression).await?
        } else {
            serve_export(self.stream, sink, compression).await?
        };
        counter!("tunnel_bytes_total", "mode" => "export").increment(stats.data_bytes);
        debug!(proxy = %self.proxy, ?stats, "export finished");
        Ok(stats)
    }

    /// Serve the database's `GET` with everything readable from `source`.
    pub async fn import_from<R: AsyncRead + Unpin>(self, source: &mut R) -> Result<TransferStats> {
        let compression = self.options.compression;
        let stats = if self.options.encryption {
            let stream = self_signed_acceptor()?
                .accept(self.stream)
                .await
                .map_err(|e| ExaError::transport(format!("tls accept failed: {e}")))?;
            serve_import(stream, source, compression).await?
        } else {
            serve_import(self.stream, source, compression).await?
        };
        counter!("tunnel_bytes_total", "mode" => "import").increment(stats.data_bytes);
        debug!(proxy = %self.proxy, ?stats, "import finished");
        Ok(stats)
    }
}

fn callback_error(err: std::io::Error) -> ExaError {
    ExaError::Callback(err.to_string())
}

async fn expect_request<S: AsyncRead + Unpin>(
    reader: &mut BufReader<S>,
    mode: TunnelMode,
) -> Result<()> {
    let head = read_request_head(reader).await?;
    if head.method != mode.expected_method() {
        return Err(ExaError::transport(format!(
            "unexpected {:?} request on an {} tunnel",
            head.method,
            mode.as_str()
        )));
    }
    if mode == TunnelMode::Export && !head.is_chunked() {
        return Err(ExaError::transport(
            "export request is not using chunked transfer encoding",
        ));
    }
    debug!(path = %head.path, mode = mode.as_str(), "tunnel request");
    Ok(())
}

pub async fn serve_export<S, W>(stream: S, sink: &mut W, compression: bool) -> Result<TransferStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    expect_request(&mut reader, TunnelMode::Export).await?;

    let mut stats = TransferStats::default();
    let mut inflater = compression.then(Inflater::new);
    let mut chunks = ChunkedReader::new(reader);
    while let Some(chunk) = chunks.next_chunk().await? {
        stats.wire_bytes += chunk.len() as u64;
        let data = match inflater.as_mut() {
            Some(inflater) => inflater.feed(&chunk)?,
            None => chunk,
        };
        sink.write_all(&data).await.map_err(callback_error)?;
        stats.data_bytes += data.len() as u64;
    }
    if let Some(inflater) = inflater {
        let tail = inflater.finish()?;
        sink.write_all(&tail).await.map_err(callback_error)?;
        stats.data_bytes += tail.len() as u64;
    }
    sink.flush().await.map_err(callback_error)?;

    let mut stream = chunks.into_inner();
    write_ok_response(&mut stream).await?;
    let _ = stream.shutdown().await;
    Ok(stats)
}

pub async fn serve_import<S, R>(stream: S, source: &mut R, compression: bool) -> Result<TransferStats>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut stream = BufReader::new(stream);
    expect_request(&mut stream, TunnelMode::Import).await?;
    write_ok_response(&mut stream).await?;

    let mut stats = TransferStats::default();
    let mut deflater = compression.then(Deflater::new);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = source.read(&mut buf).await.map_err(callback_error)?;
        if n == 0 {
            break;
        }
        stats.data_bytes += n as u64;
        let data = match deflater.as_mut() {
            Some(deflater) => deflater.feed(&buf[..n])?,
            None => buf[..n].to_vec(),
        };
        if !data.is_empty() {
            stream.write_all(&data).await?;
            stats.wire_bytes += data.len() as u64;
        }
    }
    if let Some(deflater) = deflater {
        let tail = deflater.finish()?;
        stream.write_all(&tail).await?;
        stats.wire_bytes += tail.len() as u64;
    }
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(stats)
}
