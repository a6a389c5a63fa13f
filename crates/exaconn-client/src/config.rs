use crate::decode::ColumnNamePolicy;
use crate::dsn;
use anyhow::Context;
use exaconn_core::error::{ExaError, Result};
use exaconn_core::host::Fingerprint;
use serde::Deserialize;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_client_name() -> String {
    "exaconn".to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Everything needed to open a [`Session`](crate::session::Session).
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectOptions {
    pub dsn: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_true")]
    pub autocommit: bool,
    #[serde(default)]
    pub snapshot_transactions: Option<bool>,
    /// Per host attempt, covers TCP and the WebSocket handshake.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Upper bound for waiting on a single reply. Unset means no bound.
    #[serde(default)]
    pub socket_timeout_secs: Option<u64>,
    /// Server side query timeout, 0 disables it.
    #[serde(default)]
    pub query_timeout_secs: u64,
    #[serde(default)]
    pub compression: bool,
    #[serde(default = "default_true")]
    pub encryption: bool,
    /// Bytes requested per `fetch`. Unset adopts the server's maximum message size.
    #[serde(default)]
    pub fetch_size_bytes: Option<u64>,
    #[serde(default)]
    pub column_name_policy: ColumnNamePolicy,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

impl ConnectOptions {
    pub fn new(dsn: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            user: user.into(),
            password: password.into(),
            schema: None,
            autocommit: true,
            snapshot_transactions: None,
            connection_timeout_secs: default_connection_timeout(),
            socket_timeout_secs: None,
            query_timeout_secs: 0,
            compression: false,
            encryption: true,
            fetch_size_bytes: None,
            column_name_policy: ColumnNamePolicy::Exact,
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }

    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("invalid connection options in {path}"))
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let options: Self = toml::from_str(contents).context("could not parse connection options")?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(ExaError::Runtime("user must not be empty".into()));
        }
        if self.connection_timeout_secs == 0 {
            return Err(ExaError::Runtime(
                "connection_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.socket_timeout_secs == Some(0) {
            return Err(ExaError::Runtime(
                "socket_timeout_secs must be greater than zero when set".into(),
            ));
        }
        if self.fetch_size_bytes == Some(0) {
            return Err(ExaError::Runtime(
                "fetch_size_bytes must be greater than zero when set".into(),
            ));
        }
        let hosts = dsn::parse(&self.dsn)?;
        if !self.encryption {
            if let Some(host) = hosts.iter().find(|h| h.fingerprint.is_some()) {
                let what = match host.fingerprint {
                    Some(Fingerprint::NoCertCheck) => "nocertcheck",
                    _ => "a certificate fingerprint",
                };
                return Err(ExaError::Dsn(format!(
                    "host '{}' specifies {what} but encryption is disabled",
                    host.name
                )));
            }
        }
        Ok(())
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    pub fn snapshot_transactions(mut self, enabled: bool) -> Self {
        self.snapshot_transactions = Some(enabled);
        self
    }

    pub fn compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn fetch_size_bytes(mut self, bytes: u64) -> Self {
        self.fetch_size_bytes = Some(bytes);
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_secs = timeout.as_secs();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn column_name_policy(mut self, policy: ColumnNamePolicy) -> Self {
        self.column_name_policy = policy;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn connection_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn socket_timeout_duration(&self) -> Option<Duration> {
        self.socket_timeout_secs.map(Duration::from_secs)
    }
}
