use crate::config::ConnectOptions;
use crate::decode::{RowDecoder, TupleDecoder};
use crate::dsn;
use crate::statement::Statement;
use crate::websocket::{self, WsStream};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use exaconn_core::error::{ExaError, Result};
use exaconn_core::host::Host;
use exaconn_protocol::codec::{Frame, WireCodec};
use exaconn_protocol::messages::{
    Attributes, Credentials, HostsData, LoginInfo, PublicKeyData, Request, Response,
    ServerException, Status, PROTOCOL_VERSION,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use rand::seq::SliceRandom;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Longest SQL text carried inside a query error.
pub const SQL_DISPLAY_LIMIT: usize = 2000;
const SQL_TRUNCATED_MARKER: &str = "\n------ TRUNCATED TOO LONG QUERY ------\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Closed,
    Failed,
}

struct Writer {
    sink: SplitSink<WsStream, Message>,
    codec: WireCodec,
}

impl Writer {
    async fn send(&mut self, payload: &Value) -> Result<()> {
        let message = match self.codec.encode(payload)? {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| ExaError::WebSocket(e.to_string()))
    }
}

struct SessionInner {
    writer: Mutex<Option<Writer>>,
    reader: Mutex<SplitStream<WsStream>>,
    compressed: AtomicBool,
    in_flight: AtomicBool,
    request_count: AtomicU64,
    fetch_size_bytes: AtomicU64,
    state: StdMutex<SessionState>,
    attributes: StdMutex<Attributes>,
    login_info: StdMutex<LoginInfo>,
    last_elapsed: StdMutex<Duration>,
    /// Server handles whose owners were dropped; released before the next request.
    pending_releases: StdMutex<Vec<Request>>,
    host: Host,
    options: ConnectOptions,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = *lock(&self.state);
        if matches!(state, SessionState::Closed | SessionState::Failed) {
            return;
        }
        let Some(mut writer) = self.writer.get_mut().take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session_id = lock(&self.login_info).session_id;
        handle.spawn(async move {
            let disconnect = match Request::Disconnect.into_payload() {
                Ok(payload) => payload,
                Err(_) => return,
            };
            if let Err(err) = writer.send(&disconnect).await {
                debug!(session_id, "disconnect on drop failed: {err}");
            }
            let _ = writer.sink.close().await;
        });
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds the one-request slot. A guard dropped between sending a request and
/// reading its reply leaves that reply unread on the socket, so the session
/// can no longer pair requests with replies and is marked failed.
struct InFlightGuard<'a> {
    inner: &'a SessionInner,
    awaiting_reply: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.awaiting_reply {
            *lock(&self.inner.state) = SessionState::Failed;
            warn!(
                session_id = lock(&self.inner.login_info).session_id,
                "request abandoned before its reply, session is unusable"
            );
        }
        self.inner.in_flight.store(false, Ordering::Release);
    }
}

/// One authenticated control connection.
///
/// Handles are cheap to clone and share the connection, which is how
/// [`Session::abort_query`] reaches a request blocked in another task. The
/// connection still serves a single request at a time; a second concurrent
/// request fails with [`ExaError::Concurrency`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.host)
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Resolves the DSN and tries every host in turn until one accepts
    /// both the connection and the credentials.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        options.validate()?;
        let hosts = dsn::resolve(&options.dsn).await?;
        let mut attempts = Vec::new();
        for host in hosts {
            let addr = host.socket_addr().to_string();
            debug!(host = %host, "connecting");
            let connected = timeout(
                options.connection_timeout_duration(),
                websocket::connect(&host, options.encryption),
            )
            .await;
            let ws = match connected {
                Ok(Ok(ws)) => ws,
                Ok(Err(err)) => {
                    warn!(%addr, "connection attempt failed: {err}");
                    attempts.push((addr, err.to_string()));
                    continue;
                }
                Err(_) => {
                    warn!(%addr, "connection attempt timed out");
                    attempts.push((addr, "connection timed out".to_string()));
                    continue;
                }
            };
            let session = Self::from_stream(ws, host, options);
            session.login().await?;
            return Ok(session);
        }
        counter!("exaconn_connection_failures_total").increment(1);
        Err(ExaError::Connection { attempts })
    }

    fn from_stream(ws: WsStream, host: Host, options: ConnectOptions) -> Self {
        let (sink, stream) = ws.split();
        let fetch_size = options.fetch_size_bytes.unwrap_or(0);
        Self {
            inner: Arc::new(SessionInner {
                writer: Mutex::new(Some(Writer {
                    sink,
                    codec: WireCodec::new(false),
                })),
                reader: Mutex::new(stream),
                compressed: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                request_count: AtomicU64::new(0),
                fetch_size_bytes: AtomicU64::new(fetch_size),
                state: StdMutex::new(SessionState::Connecting),
                attributes: StdMutex::new(Attributes::default()),
                login_info: StdMutex::new(LoginInfo::default()),
                last_elapsed: StdMutex::new(Duration::ZERO),
                pending_releases: StdMutex::new(Vec::new()),
                host,
                options,
            }),
        }
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.inner.state) = state;
    }

    async fn login(&self) -> Result<()> {
        self.set_state(SessionState::Authenticating);
        match self.authenticate().await {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Failed);
                if let Some(mut writer) = self.inner.writer.lock().await.take() {
                    let _ = writer.sink.close().await;
                }
                Err(err)
            }
        }
    }

    async fn authenticate(&self) -> Result<()> {
        let options = &self.inner.options;
        let key_reply = self
            .request(Request::Login {
                protocol_version: PROTOCOL_VERSION,
            })
            .await
            .map_err(auth_error)?;
        let key: PublicKeyData = key_reply.data()?;
        let password = encrypt_password(&key.public_key_pem, &options.password)?;

        let credentials = Credentials {
            username: options.user.clone(),
            password,
            driver_name: format!("exaconn {}", env!("CARGO_PKG_VERSION")),
            client_name: options.client_name.clone(),
            client_version: options.client_version.clone(),
            client_os: std::env::consts::OS.to_string(),
            client_os_username: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            client_runtime: "Rust".to_string(),
            use_compression: options.compression,
            attributes: Attributes {
                autocommit: Some(options.autocommit),
                current_schema: options.schema.clone(),
                query_timeout: Some(options.query_timeout_secs),
                snapshot_transactions_enabled: options.snapshot_transactions,
                ..Default::default()
            },
        };
        let reply = self
            .round_trip_guarded("login", serde_json::to_value(credentials)?, None)
            .await
            .map_err(auth_error)?;
        let info: LoginInfo = reply.data()?;
        if options.fetch_size_bytes.is_none() {
            self.inner
                .fetch_size_bytes
                .store(info.max_data_message_size, Ordering::Relaxed);
        }
        info!(
            session_id = info.session_id,
            host = %self.inner.host,
            release = %info.release_version,
            "session established"
        );
        *lock(&self.inner.login_info) = info;

        if options.compression {
            let mut writer = self.inner.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                writer.codec = WireCodec::new(true);
                self.inner.compressed.store(true, Ordering::Release);
            }
        }
        self.request(Request::GetAttributes).await?;
        Ok(())
    }

    /// Sends one command and waits for its reply.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let payload = request.into_payload()?;
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.round_trip_guarded(&command, payload, None).await
    }

    /// Like [`Session::request`], with the SQL text attached to query errors.
    pub(crate) async fn request_with_sql(&self, request: Request, sql: &str) -> Result<Response> {
        let payload = request.into_payload()?;
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.round_trip_guarded(&command, payload, Some(sql)).await
    }

    async fn round_trip_guarded(
        &self,
        command: &str,
        payload: Value,
        sql: Option<&str>,
    ) -> Result<Response> {
        if matches!(self.state(), SessionState::Closed | SessionState::Failed) {
            return Err(ExaError::SessionClosed);
        }
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            counter!("exaconn_concurrency_rejections_total").increment(1);
            return Err(ExaError::Concurrency);
        }
        let mut guard = InFlightGuard {
            inner: &self.inner,
            awaiting_reply: false,
        };

        let pending: Vec<Request> = std::mem::take(&mut *lock(&self.inner.pending_releases));
        for release in pending {
            let payload = release.into_payload()?;
            let name = payload
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            if let Err(err) = self.round_trip(&mut guard, &name, payload, None).await {
                warn!(command = %name, "releasing dropped handle failed: {err}");
                if self.is_closed() {
                    return Err(err);
                }
            }
        }
        self.round_trip(&mut guard, command, payload, sql).await
    }

    async fn round_trip(
        &self,
        guard: &mut InFlightGuard<'_>,
        command: &str,
        payload: Value,
        sql: Option<&str>,
    ) -> Result<Response> {
        let started = Instant::now();
        self.inner.request_count.fetch_add(1, Ordering::Relaxed);
        counter!("exaconn_requests_total", "command" => command.to_string()).increment(1);
        let sent = match self.inner.writer.lock().await.as_mut() {
            Some(writer) => {
                guard.awaiting_reply = true;
                writer.send(&payload).await
            }
            None => return Err(ExaError::SessionClosed),
        };
        let frame = match sent {
            Ok(()) => self.read_frame().await,
            Err(err) => Err(err),
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                self.fail_connection(command, &err).await;
                guard.awaiting_reply = false;
                return Err(err);
            }
        };
        guard.awaiting_reply = false;
        *lock(&self.inner.last_elapsed) = started.elapsed();

        let codec = WireCodec::new(self.inner.compressed.load(Ordering::Acquire));
        let response = codec.decode(frame)?;
        if let Some(delta) = &response.attributes {
            lock(&self.inner.attributes).merge(delta);
        }
        match response.status {
            Status::Ok => Ok(response),
            Status::Error => {
                counter!("exaconn_request_errors_total", "command" => command.to_string())
                    .increment(1);
                let exception = response.exception.unwrap_or(ServerException {
                    text: "server reported an error without details".to_string(),
                    sql_code: String::new(),
                });
                Err(map_exception(command, exception, sql))
            }
        }
    }

    async fn read_frame(&self) -> Result<Frame> {
        let mut reader = self.inner.reader.lock().await;
        loop {
            let next = match self.inner.options.socket_timeout_duration() {
                Some(limit) => timeout(limit, reader.next())
                    .await
                    .map_err(|_| ExaError::WebSocket("timed out waiting for a reply".into()))?,
                None => reader.next().await,
            };
            match next {
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Binary(bytes))) => return Ok(Frame::Binary(bytes)),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ExaError::WebSocket("connection closed by server".into()));
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(ExaError::WebSocket(err.to_string())),
            }
        }
    }

    /// A send or receive failed mid request: the reply stream is out of step
    /// with the requests, so the connection is given up.
    async fn fail_connection(&self, command: &str, err: &ExaError) {
        self.set_state(SessionState::Failed);
        counter!("exaconn_connection_failures_total").increment(1);
        warn!(
            session_id = self.session_id(),
            command,
            "connection failed, closing session: {err}"
        );
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.sink.close().await;
        }
    }

    /// Asks the server to abort whatever this session is running.
    ///
    /// Goes through the writer only and reads no reply, so it can be called
    /// while another task is blocked in [`Session::request`].
    pub async fn abort_query(&self) -> Result<()> {
        let payload = Request::AbortQuery.into_payload()?;
        let mut writer = self.inner.writer.lock().await;
        let writer = writer.as_mut().ok_or(ExaError::SessionClosed)?;
        writer.send(&payload).await?;
        counter!("exaconn_aborts_total").increment(1);
        info!(session_id = self.session_id(), "abort requested");
        Ok(())
    }

    /// Disconnects. Safe to call more than once; the session ends up closed
    /// even when the server does not answer.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return Ok(());
            }
            if *state != SessionState::Failed {
                *state = SessionState::Closing;
            }
        }
        if self.state() == SessionState::Closing {
            if let Err(err) = self.request(Request::Disconnect).await {
                debug!(session_id = self.session_id(), "disconnect failed: {err}");
            }
        }
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.sink.close().await;
        }
        self.set_state(SessionState::Closed);
        info!(session_id = self.session_id(), "session closed");
        Ok(())
    }

    pub async fn execute(&self, sql: impl Into<String>) -> Result<Statement<TupleDecoder>> {
        self.execute_with(sql, TupleDecoder).await
    }

    pub async fn execute_with<D: RowDecoder>(
        &self,
        sql: impl Into<String>,
        decoder: D,
    ) -> Result<Statement<D>> {
        let mut statement = Statement::new(self.clone(), sql.into(), decoder);
        statement.execute().await?;
        Ok(statement)
    }

    /// Runs a metadata command (`getSchemas`, `getTables`, ...) and reads
    /// its reply like an `execute` result.
    pub async fn execute_meta(
        &self,
        command: &str,
        fields: Map<String, Value>,
    ) -> Result<Statement<TupleDecoder>> {
        let mut payload = fields;
        payload.insert("command".to_string(), Value::String(command.to_string()));
        let response = self
            .round_trip_guarded(command, Value::Object(payload), None)
            .await?;
        let mut statement = Statement::new(self.clone(), command.to_string(), TupleDecoder);
        statement.apply_execute(response)?;
        Ok(statement)
    }

    pub async fn prepare(&self, sql: impl Into<String>) -> Result<Statement<TupleDecoder>> {
        let mut statement = Statement::new(self.clone(), sql.into(), TupleDecoder);
        statement.prepare().await?;
        Ok(statement)
    }

    pub async fn set_attributes(&self, attributes: Attributes) -> Result<()> {
        self.request(Request::SetAttributes {
            attributes: attributes.clone(),
        })
        .await?;
        lock(&self.inner.attributes).merge(&attributes);
        Ok(())
    }

    pub async fn set_autocommit(&self, autocommit: bool) -> Result<()> {
        self.set_attributes(Attributes {
            autocommit: Some(autocommit),
            ..Default::default()
        })
        .await
    }

    pub async fn set_query_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_attributes(Attributes {
            query_timeout: Some(timeout.as_secs()),
            ..Default::default()
        })
        .await
    }

    pub async fn open_schema(&self, schema: &str) -> Result<()> {
        self.set_attributes(Attributes {
            current_schema: Some(schema.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn commit(&self) -> Result<()> {
        self.execute("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.execute("ROLLBACK").await.map(|_| ())
    }

    /// Node addresses for spreading tunnel workers, cycled or cut to `pool_size`.
    pub async fn get_nodes(&self, pool_size: usize) -> Result<Vec<SocketAddr>> {
        let response = self
            .request(Request::GetHosts {
                host_ip: self.inner.host.resolved_ip.to_string(),
            })
            .await?;
        let hosts: HostsData = response.data()?;
        let port = self.inner.host.port;
        let mut nodes: Vec<SocketAddr> = hosts
            .nodes
            .iter()
            .filter_map(|ip| ip.parse().ok())
            .map(|ip| SocketAddr::new(ip, port))
            .collect();
        if nodes.is_empty() {
            nodes.push(self.inner.host.socket_addr());
        }
        nodes.shuffle(&mut rand::thread_rng());
        Ok(nodes.iter().cycle().take(pool_size).copied().collect())
    }

    pub(crate) fn defer_release(&self, request: Request) {
        lock(&self.inner.pending_releases).push(request);
    }

    pub fn attributes(&self) -> Attributes {
        lock(&self.inner.attributes).clone()
    }

    pub fn current_schema(&self) -> Option<String> {
        lock(&self.inner.attributes)
            .current_schema
            .clone()
            .filter(|s| !s.is_empty())
    }

    pub fn session_id(&self) -> i64 {
        lock(&self.inner.login_info).session_id
    }

    pub fn login_info(&self) -> LoginInfo {
        lock(&self.inner.login_info).clone()
    }

    pub fn protocol_version(&self) -> u32 {
        lock(&self.inner.login_info).protocol_version
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closed | SessionState::Failed)
    }

    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    pub fn fetch_size_bytes(&self) -> u64 {
        self.inner.fetch_size_bytes.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::Relaxed)
    }

    pub fn last_request_elapsed(&self) -> Duration {
        *lock(&self.inner.last_elapsed)
    }

    pub fn is_compressed(&self) -> bool {
        self.inner.compressed.load(Ordering::Acquire)
    }
}

fn encrypt_password(pem: &str, password: &str) -> Result<String> {
    let key = RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| ExaError::Auth {
        code: String::new(),
        message: format!("invalid server public key: {e}"),
    })?;
    let encrypted = key
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, password.as_bytes())
        .map_err(|e| ExaError::Auth {
            code: String::new(),
            message: format!("password encryption failed: {e}"),
        })?;
    Ok(BASE64.encode(encrypted))
}

fn auth_error(err: ExaError) -> ExaError {
    match err {
        ExaError::Request { code, message, .. } => ExaError::Auth { code, message },
        other => other,
    }
}

pub(crate) fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(SQL_DISPLAY_LIMIT) {
        Some((cut, _)) => format!("{}{SQL_TRUNCATED_MARKER}", &sql[..cut]),
        None => sql.to_string(),
    }
}

fn map_exception(command: &str, exception: ServerException, sql: Option<&str>) -> ExaError {
    let ServerException { text, sql_code } = exception;
    match command {
        "execute" | "executePreparedStatement" => {
            let sql = truncate_sql(sql.unwrap_or_default());
            match sql_code.as_str() {
                "R0001" => ExaError::QueryTimeout {
                    code: sql_code,
                    message: text,
                    sql,
                },
                "R0003" => ExaError::QueryAborted {
                    code: sql_code,
                    message: text,
                    sql,
                },
                _ => ExaError::Query {
                    code: sql_code,
                    message: text,
                    sql,
                },
            }
        }
        _ => ExaError::Request {
            command: command.to_string(),
            code: sql_code,
            message: text,
        },
    }
}
