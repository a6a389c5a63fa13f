use crate::endpoint::{TransferStats, TunnelMode};
use exaconn_core::error::{ExaError, Result};
use exaconn_protocol::tunnel::ProxyAddress;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::debug;

pub const DEFAULT_PROGRAM: &str = "exaconn-tunnel";

/// Launch parameters for a tunnel running in its own OS process.
#[derive(Debug, Clone)]
pub struct ProcessWorkerConfig {
    pub program: PathBuf,
    pub address: SocketAddr,
    pub mode: TunnelMode,
    /// File the child writes (export) or reads (import).
    pub file: PathBuf,
    pub compression: bool,
    pub encryption: bool,
    pub startup_timeout: Duration,
}

impl ProcessWorkerConfig {
    pub fn new(address: SocketAddr, mode: TunnelMode, file: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            address,
            mode,
            file: file.into(),
            compression: false,
            encryption: false,
            startup_timeout: Duration::from_secs(30),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--host")
            .arg(self.address.ip().to_string())
            .arg("--port")
            .arg(self.address.port().to_string())
            .arg("--mode")
            .arg(self.mode.as_str())
            .arg("--file")
            .arg(&self.file)
            .arg("--ppid")
            .arg(std::process::id().to_string());
        if self.compression {
            command.arg("--compression");
        }
        if self.encryption {
            command.arg("--encryption");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

/// Second stdout line of a child that finished its transfer.
pub fn stats_line(stats: &TransferStats) -> String {
    format!("{} {}\n", stats.wire_bytes, stats.data_bytes)
}

pub fn parse_stats_line(line: &str) -> Result<TransferStats> {
    let mut fields = line.split_whitespace().map(str::parse::<u64>);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(Ok(wire_bytes)), Some(Ok(data_bytes)), None) => Ok(TransferStats {
            wire_bytes,
            data_bytes,
        }),
        _ => Err(ExaError::transport(format!(
            "malformed transfer stats {:?}",
            line.trim_end()
        ))),
    }
}

/// A tunnel living in a child process. The child prints its proxy address as
/// the first stdout line and its transfer stats as the second; its exit
/// status is the terminal outcome.
#[derive(Debug)]
pub struct ProcessWorker {
    index: usize,
    child: Child,
    stdout: BufReader<ChildStdout>,
    proxy: ProxyAddress,
}

impl ProcessWorker {
    pub async fn spawn(index: usize, config: &ProcessWorkerConfig) -> Result<Self> {
        let mut child = config.command().spawn().map_err(|e| ExaError::Worker {
            index,
            message: format!("could not start {}: {e}", config.program.display()),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ExaError::Worker {
            index,
            message: "child stdout is not captured".into(),
        })?;
        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        let read = timeout(config.startup_timeout, stdout.read_line(&mut line)).await;
        let proxy = match read {
            Ok(Ok(n)) if n > 0 => ProxyAddress::parse(&line),
            Ok(Ok(_)) => Err(ExaError::transport("child exited before reporting its proxy")),
            Ok(Err(e)) => Err(ExaError::Io(e)),
            Err(_) => Err(ExaError::transport("timed out waiting for the child proxy address")),
        };
        let proxy = match proxy {
            Ok(proxy) => proxy,
            Err(err) => {
                let _ = child.kill().await;
                return Err(ExaError::Worker {
                    index,
                    message: err.to_string(),
                });
            }
        };
        debug!(index, proxy = %proxy, pid = ?child.id(), "tunnel process started");
        Ok(Self {
            index,
            child,
            stdout,
            proxy,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn proxy(&self) -> &ProxyAddress {
        &self.proxy
    }

    /// Waits for the child to exit and returns the stats it reported.
    pub async fn wait(&mut self) -> Result<TransferStats> {
        let mut line = String::new();
        let read = self.stdout.read_line(&mut line).await;
        let status = self.child.wait().await?;
        if !status.success() {
            return Err(ExaError::Worker {
                index: self.index,
                message: format!("tunnel process exited with {status}"),
            });
        }
        read?;
        parse_stats_line(&line).map_err(|err| ExaError::Worker {
            index: self.index,
            message: err.to_string(),
        })
    }
}
