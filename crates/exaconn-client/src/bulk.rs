use crate::session::Session;
use exaconn_core::error::{ExaError, Result};
use exaconn_protocol::tunnel::ProxyAddress;
use exaconn_transport::endpoint::{TransferStats, TunnelEndpoint, TunnelOptions};
use std::future::Future;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Tunnel settings shared by every endpoint of one bulk job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub compression: bool,
    pub encryption: bool,
}

impl TransferOptions {
    pub fn compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    /// Same compression and encryption as the control connection.
    pub fn from_session(session: &Session) -> Self {
        Self {
            compression: session.options().compression,
            encryption: session.options().encryption,
        }
    }

    pub(crate) fn tunnel(&self, address: std::net::SocketAddr) -> TunnelOptions {
        TunnelOptions::new(address)
            .with_compression(self.compression)
            .with_encryption(self.encryption)
    }
}

/// Outcome of a finished bulk job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Row count reported by the EXPORT or IMPORT statement.
    pub row_count: u64,
    /// Per endpoint, in `FILE` order.
    pub stats: Vec<TransferStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimit {
    Auto,
    Always,
    Never,
}

impl Delimit {
    fn as_sql(self) -> &'static str {
        match self {
            Delimit::Auto => "AUTO",
            Delimit::Always => "ALWAYS",
            Delimit::Never => "NEVER",
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// CSV options common to EXPORT and IMPORT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CsvFormat {
    columns: Vec<String>,
    encoding: Option<String>,
    null: Option<String>,
    row_separator: Option<String>,
    column_separator: Option<String>,
    column_delimiter: Option<String>,
    file_format: Option<String>,
}

impl CsvFormat {
    fn column_list(&self) -> String {
        if self.columns.is_empty() {
            String::new()
        } else {
            format!("({})", self.columns.join(", "))
        }
    }

    fn extension(&self, options: &TransferOptions) -> &str {
        match &self.file_format {
            Some(format) => format.as_str(),
            None if options.compression => "gz",
            None => "csv",
        }
    }

    fn file_clauses(&self, proxies: &[ProxyAddress], options: &TransferOptions) -> Vec<String> {
        let scheme = if options.encryption { "https" } else { "http" };
        let ext = self.extension(options);
        proxies
            .iter()
            .enumerate()
            .map(|(index, proxy)| format!("AT '{scheme}://{proxy}' FILE '{index:03}.{ext}'"))
            .collect()
    }

    fn option_clauses(&self) -> Vec<String> {
        let mut clauses = Vec::new();
        if let Some(encoding) = &self.encoding {
            clauses.push(format!("ENCODING = {}", quote_literal(encoding)));
        }
        if let Some(null) = &self.null {
            clauses.push(format!("NULL = {}", quote_literal(null)));
        }
        if let Some(row_separator) = &self.row_separator {
            clauses.push(format!("ROW SEPARATOR = {}", quote_literal(row_separator)));
        }
        if let Some(column_separator) = &self.column_separator {
            clauses.push(format!("COLUMN SEPARATOR = {}", quote_literal(column_separator)));
        }
        if let Some(column_delimiter) = &self.column_delimiter {
            clauses.push(format!("COLUMN DELIMITER = {}", quote_literal(column_delimiter)));
        }
        clauses
    }
}

macro_rules! csv_setters {
    () => {
        pub fn columns<I, S>(mut self, columns: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            self.format.columns = columns.into_iter().map(Into::into).collect();
            self
        }

        pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
            self.format.encoding = Some(encoding.into());
            self
        }

        pub fn null(mut self, null: impl Into<String>) -> Self {
            self.format.null = Some(null.into());
            self
        }

        pub fn row_separator(mut self, separator: impl Into<String>) -> Self {
            self.format.row_separator = Some(separator.into());
            self
        }

        pub fn column_separator(mut self, separator: impl Into<String>) -> Self {
            self.format.column_separator = Some(separator.into());
            self
        }

        pub fn column_delimiter(mut self, delimiter: impl Into<String>) -> Self {
            self.format.column_delimiter = Some(delimiter.into());
            self
        }

        /// Overrides the file extension used in `FILE` clauses.
        pub fn file_format(mut self, format: impl Into<String>) -> Self {
            self.format.file_format = Some(format.into());
            self
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExportSource {
    Table(String),
    Query(String),
}

/// Builder for `EXPORT ... INTO CSV AT ...`.
///
/// Identifiers are used as given; quoting them is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportQuery {
    source: ExportSource,
    format: CsvFormat,
    delimit: Option<Delimit>,
    with_column_names: bool,
}

impl ExportQuery {
    pub fn table(name: impl Into<String>) -> Self {
        Self::from_source(ExportSource::Table(name.into()))
    }

    pub fn query(sql: impl Into<String>) -> Self {
        Self::from_source(ExportSource::Query(sql.into()))
    }

    fn from_source(source: ExportSource) -> Self {
        Self {
            source,
            format: CsvFormat::default(),
            delimit: None,
            with_column_names: false,
        }
    }

    csv_setters!();

    pub fn delimit(mut self, delimit: Delimit) -> Self {
        self.delimit = Some(delimit);
        self
    }

    pub fn with_column_names(mut self, with_column_names: bool) -> Self {
        self.with_column_names = with_column_names;
        self
    }

    /// Extension the `FILE` clauses use with these options.
    pub fn file_extension(&self, options: &TransferOptions) -> &str {
        self.format.extension(options)
    }

    pub fn build(&self, proxies: &[ProxyAddress], options: &TransferOptions) -> String {
        let mut lines = vec![match &self.source {
            ExportSource::Table(name) => format!("EXPORT {name}{}", self.format.column_list()),
            ExportSource::Query(sql) => format!("EXPORT (\n{sql}\n)"),
        }];
        lines.push("INTO CSV".to_string());
        lines.extend(self.format.file_clauses(proxies, options));
        lines.extend(self.format.option_clauses());
        if let Some(delimit) = self.delimit {
            lines.push(format!("DELIMIT = {}", delimit.as_sql()));
        }
        if self.with_column_names {
            lines.push("WITH COLUMN NAMES".to_string());
        }
        lines.join("\n")
    }
}

/// Builder for `IMPORT INTO ... FROM CSV AT ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportQuery {
    table: String,
    format: CsvFormat,
    skip: Option<u64>,
    trim: Option<String>,
    reject_limit: Option<u64>,
}

impl ImportQuery {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            format: CsvFormat::default(),
            skip: None,
            trim: None,
            reject_limit: None,
        }
    }

    csv_setters!();

    pub fn skip(mut self, rows: u64) -> Self {
        self.skip = Some(rows);
        self
    }

    /// `TRIM`, `LTRIM` or `RTRIM`.
    pub fn trim(mut self, mode: impl Into<String>) -> Self {
        self.trim = Some(mode.into().to_uppercase());
        self
    }

    pub fn reject_limit(mut self, limit: u64) -> Self {
        self.reject_limit = Some(limit);
        self
    }

    pub fn build(&self, proxies: &[ProxyAddress], options: &TransferOptions) -> String {
        let mut lines = vec![format!(
            "IMPORT INTO {}{}",
            self.table,
            self.format.column_list()
        )];
        lines.push("FROM CSV".to_string());
        lines.extend(self.format.file_clauses(proxies, options));
        lines.extend(self.format.option_clauses());
        if let Some(skip) = self.skip {
            lines.push(format!("SKIP = {skip}"));
        }
        if let Some(trim) = &self.trim {
            lines.push(trim.clone());
        }
        if let Some(limit) = self.reject_limit {
            lines.push(format!("REJECT LIMIT {limit}"));
        }
        lines.join("\n")
    }
}

/// Picks the error a bulk job reports once both sides have settled.
///
/// A callback error comes first since it is where the failure started. Next
/// comes the statement's own error, and a tunnel error is reported only when
/// the statement succeeded.
pub(crate) fn settle<S, W>(sql: Result<S>, workers: Result<W>) -> Result<(S, W)> {
    match (sql, workers) {
        (Ok(sql), Ok(workers)) => Ok((sql, workers)),
        (_, Err(err @ ExaError::Callback(_))) => Err(err),
        (Err(err), _) => Err(err),
        (Ok(_), Err(err)) => Err(err),
    }
}

/// Runs the SQL side and the tunnel side of a single-endpoint job together.
///
/// A failed tunnel aborts the statement; the statement is still awaited so
/// the session is left with no reply outstanding.
async fn run_with_endpoint<F>(session: &Session, sql: String, transfer: F) -> Result<TransferReport>
where
    F: Future<Output = Result<TransferStats>>,
{
    let execute = session.execute(sql);
    tokio::pin!(execute);
    tokio::pin!(transfer);
    let (statement, stats) = tokio::select! {
        biased;
        stats = &mut transfer => {
            if let Err(err) = &stats {
                warn!("tunnel failed, aborting statement: {err}");
                if let Err(err) = session.abort_query().await {
                    warn!("abort failed: {err}");
                }
            }
            (execute.await, stats)
        }
        statement = &mut execute => match statement {
            Ok(statement) => (Ok(statement), transfer.await),
            Err(err) => return Err(err),
        },
    };
    let (statement, stats) = settle(statement, stats)?;
    Ok(TransferReport {
        row_count: statement.rowcount(),
        stats: vec![stats],
    })
}

/// Streams the result of `query` into `sink` over one tunnel.
pub async fn export_to_sink<W>(
    session: &Session,
    query: &ExportQuery,
    sink: &mut W,
    options: &TransferOptions,
) -> Result<TransferReport>
where
    W: AsyncWrite + Unpin,
{
    let endpoint = TunnelEndpoint::connect(options.tunnel(session.host().socket_addr())).await?;
    let sql = query.build(&[endpoint.proxy().clone()], options);
    let report = run_with_endpoint(session, sql, endpoint.export_to(sink)).await?;
    info!(rows = report.row_count, "export finished");
    Ok(report)
}

/// Feeds everything readable from `source` into the table of `query`.
pub async fn import_from_source<R>(
    session: &Session,
    query: &ImportQuery,
    source: &mut R,
    options: &TransferOptions,
) -> Result<TransferReport>
where
    R: AsyncRead + Unpin,
{
    let endpoint = TunnelEndpoint::connect(options.tunnel(session.host().socket_addr())).await?;
    let sql = query.build(&[endpoint.proxy().clone()], options);
    let report = run_with_endpoint(session, sql, endpoint.import_from(source)).await?;
    info!(rows = report.row_count, "import finished");
    Ok(report)
}

pub async fn export_to_file(
    session: &Session,
    query: &ExportQuery,
    path: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<TransferReport> {
    let mut file = tokio::fs::File::create(path.as_ref()).await?;
    export_to_sink(session, query, &mut file, options).await
}

pub async fn import_from_file(
    session: &Session,
    query: &ImportQuery,
    path: impl AsRef<Path>,
    options: &TransferOptions,
) -> Result<TransferReport> {
    let mut file = tokio::fs::File::open(path.as_ref()).await?;
    import_from_source(session, query, &mut file, options).await
}
