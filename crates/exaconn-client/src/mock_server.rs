//! Stand-in database for tests: a WebSocket control endpoint and the tunnel
//! proxy on one port, as the real server has them.

use crate::config::ConnectOptions;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use exaconn_protocol::http::{read_response_head, write_chunk, write_final_chunk};
use exaconn_protocol::tunnel::{accept_proxy, ProxyAddress, TUNNEL_MAGIC};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;

pub const USER: &str = "sys";
pub const PASSWORD: &str = "exasol";
pub const SESSION_ID: i64 = 4242;
/// Rows sent with `execute` and per `fetch`.
const CHUNK_ROWS: usize = 3;
/// Rows every exported table has.
pub const EXPORT_ROWS: usize = 5;

fn private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("rsa key"))
}

#[derive(Default)]
struct MockState {
    tunnels: Mutex<HashMap<String, TcpStream>>,
    next_proxy_port: AtomicU16,
    fetches: AtomicUsize,
    closed_result_sets: Mutex<Vec<i64>>,
    closed_statements: Mutex<Vec<i64>>,
    imported: Mutex<Vec<u8>>,
    commands: Mutex<Vec<String>>,
}

pub struct MockDatabase {
    pub addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockDatabase {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(MockState::default());
        state.next_proxy_port.store(31000, Ordering::SeqCst);
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(route(socket, accept_state.clone()));
            }
        });
        Self { addr, state }
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::new(self.addr.to_string(), USER, PASSWORD).encryption(false)
    }

    pub fn fetch_count(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn closed_result_sets(&self) -> Vec<i64> {
        self.state.closed_result_sets.lock().expect("lock").clone()
    }

    pub fn closed_statements(&self) -> Vec<i64> {
        self.state.closed_statements.lock().expect("lock").clone()
    }

    pub fn imported(&self) -> Vec<u8> {
        self.state.imported.lock().expect("lock").clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().expect("lock").clone()
    }
}

async fn route(socket: TcpStream, state: Arc<MockState>) {
    let mut head = [0u8; 4];
    loop {
        match socket.peek(&mut head).await {
            Ok(n) if n >= 4 => break,
            Ok(0) | Err(_) => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    }
    if head == TUNNEL_MAGIC.to_le_bytes() {
        register_tunnel(socket, state).await;
    } else {
        serve_control(socket, state).await;
    }
}

async fn register_tunnel(mut socket: TcpStream, state: Arc<MockState>) {
    let port = state.next_proxy_port.fetch_add(1, Ordering::SeqCst);
    let proxy = ProxyAddress::new("127.0.0.1", port);
    if accept_proxy(&mut socket, &proxy).await.is_ok() {
        state
            .tunnels
            .lock()
            .expect("lock")
            .insert(proxy.to_string(), socket);
    }
}

fn decode_message(message: Message) -> Option<Value> {
    match message {
        Message::Text(text) => serde_json::from_str(&text).ok(),
        Message::Binary(bytes) => {
            let mut text = Vec::new();
            ZlibDecoder::new(bytes.as_slice()).read_to_end(&mut text).ok()?;
            serde_json::from_slice(&text).ok()
        }
        _ => None,
    }
}

fn encode_message(value: &Value, compressed: bool) -> Message {
    let text = value.to_string();
    if compressed {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(text.as_bytes()).expect("zlib");
        Message::Binary(encoder.finish().expect("zlib"))
    } else {
        Message::Text(text)
    }
}

fn error_reply(code: &str, text: &str) -> Value {
    json!({"status": "error", "exception": {"sqlCode": code, "text": text}})
}

fn row_count_reply(rows: usize) -> Value {
    json!({"status": "ok", "responseData": {"numResults": 1, "results": [
        {"resultType": "rowCount", "rowCount": rows}
    ]}})
}

async fn serve_control(socket: TcpStream, state: Arc<MockState>) {
    let Ok(ws) = tokio_tungstenite::accept_async(socket).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let abort = Arc::new(Notify::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let reader_abort = abort.clone();
    let reader_state = state.clone();
    tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let Some(request) = decode_message(message) else {
                continue;
            };
            if request["command"] == "abortQuery" {
                reader_state
                    .commands
                    .lock()
                    .expect("lock")
                    .push("abortQuery".into());
                reader_abort.notify_one();
                continue;
            }
            if tx.send(request).is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        state,
        abort,
        compressed: AtomicBool::new(false),
        attributes: json!({"autocommit": true, "currentSchema": "", "queryTimeout": 0}),
        result_sets: HashMap::new(),
        next_handle: 1,
    };
    while let Some(request) = rx.recv().await {
        let command = request["command"].as_str().unwrap_or("credentials").to_string();
        conn.state.commands.lock().expect("lock").push(command.clone());
        let reply = conn.handle(&command, &request).await;
        let compressed = conn.compressed.load(Ordering::SeqCst);
        if sink.send(encode_message(&reply, compressed)).await.is_err() {
            break;
        }
        if command == "credentials" && reply["status"] == "ok" {
            let wants = request["useCompression"].as_bool().unwrap_or(false);
            conn.compressed.store(wants, Ordering::SeqCst);
        }
        if command == "disconnect" {
            let _ = sink.close().await;
            break;
        }
    }
}

struct Connection {
    state: Arc<MockState>,
    abort: Arc<Notify>,
    compressed: AtomicBool,
    attributes: Value,
    result_sets: HashMap<i64, Vec<(i64, String)>>,
    next_handle: i64,
}

fn numbers_columns() -> Value {
    json!([
        {"name": "ID", "dataType": {"type": "DECIMAL", "precision": 18, "scale": 0}},
        {"name": "NAME", "dataType": {"type": "VARCHAR", "size": 100, "characterSet": "UTF8"}}
    ])
}

fn column_major(rows: &[(i64, String)]) -> Value {
    let ids: Vec<Value> = rows.iter().map(|(id, _)| json!(id)).collect();
    let names: Vec<Value> = rows.iter().map(|(_, name)| json!(name)).collect();
    json!([ids, names])
}

fn result_set_reply(columns: Value, data: Value, rows: usize, in_message: usize, handle: Option<i64>) -> Value {
    let mut result_set = json!({
        "numColumns": columns.as_array().map(Vec::len).unwrap_or(0),
        "numRows": rows,
        "numRowsInMessage": in_message,
        "columns": columns,
        "data": data,
    });
    if let Some(handle) = handle {
        result_set["resultSetHandle"] = json!(handle);
    }
    json!({"status": "ok", "responseData": {"numResults": 1, "results": [
        {"resultType": "resultSet", "resultSet": result_set}
    ]}})
}

/// `(proxy, file)` pairs of every `AT ... FILE ...` line.
fn file_targets(sql: &str) -> Vec<(String, String)> {
    sql.lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("AT '")?;
            let (url, rest) = rest.split_once('\'')?;
            let proxy = url.split_once("://").map(|(_, p)| p).unwrap_or(url);
            let file = rest.split_once("FILE '")?.1.split_once('\'')?.0;
            Some((proxy.to_string(), file.to_string()))
        })
        .collect()
}

impl Connection {
    async fn handle(&mut self, command: &str, request: &Value) -> Value {
        match command {
            "login" => {
                let pem = private_key()
                    .to_public_key()
                    .to_pkcs1_pem(LineEnding::LF)
                    .expect("pem");
                json!({"status": "ok", "responseData": {"publicKeyPem": pem}})
            }
            "credentials" => self.credentials(request),
            "getAttributes" => json!({"status": "ok", "attributes": self.attributes}),
            "setAttributes" => {
                if let (Some(target), Some(delta)) = (
                    self.attributes.as_object_mut(),
                    request["attributes"].as_object(),
                ) {
                    for (key, value) in delta {
                        target.insert(key.clone(), value.clone());
                    }
                }
                json!({"status": "ok", "attributes": self.attributes})
            }
            "getHosts" => json!({"status": "ok", "responseData": {"numNodes": 1, "nodes": ["127.0.0.1"]}}),
            "execute" => {
                let sql = request["sqlText"].as_str().unwrap_or_default().to_string();
                self.execute(&sql).await
            }
            "fetch" => self.fetch(request),
            "closeResultSet" => {
                if let Some(handles) = request["resultSetHandles"].as_array() {
                    let mut closed = self.state.closed_result_sets.lock().expect("lock");
                    closed.extend(handles.iter().filter_map(Value::as_i64));
                }
                json!({"status": "ok"})
            }
            "createPreparedStatement" => {
                let sql = request["sqlText"].as_str().unwrap_or_default();
                let params = sql.matches('?').count();
                let columns: Vec<Value> = (1..=params)
                    .map(|i| json!({"name": format!("C{i}"), "dataType": {"type": "DECIMAL", "precision": 18, "scale": 0}}))
                    .collect();
                json!({"status": "ok", "responseData": {
                    "statementHandle": 900,
                    "parameterData": {"numColumns": params, "columns": columns}
                }})
            }
            "executePreparedStatement" => {
                let num_columns = request["numColumns"].as_u64().unwrap_or(0) as usize;
                let num_rows = request["numRows"].as_u64().unwrap_or(0) as usize;
                let data = request["data"].as_array().cloned().unwrap_or_default();
                let shaped = data.len() == num_columns
                    && data
                        .iter()
                        .all(|column| column.as_array().map(Vec::len) == Some(num_rows));
                if shaped {
                    row_count_reply(num_rows)
                } else {
                    error_reply("22000", "data is not column-major")
                }
            }
            "closePreparedStatement" => {
                if let Some(handle) = request["statementHandle"].as_i64() {
                    self.state.closed_statements.lock().expect("lock").push(handle);
                }
                json!({"status": "ok"})
            }
            "getSchemas" => result_set_reply(
                json!([{"name": "SCHEMA_NAME", "dataType": {"type": "VARCHAR", "size": 128}}]),
                json!([["SYS", "TEST"]]),
                2,
                2,
                None,
            ),
            "disconnect" => json!({"status": "ok"}),
            other => error_reply("00000", &format!("unknown command {other}")),
        }
    }

    fn credentials(&mut self, request: &Value) -> Value {
        let password = request["password"]
            .as_str()
            .and_then(|p| BASE64.decode(p).ok())
            .and_then(|bytes| private_key().decrypt(Pkcs1v15Encrypt, &bytes).ok());
        if request["username"] != USER || password.as_deref() != Some(PASSWORD.as_bytes()) {
            return error_reply("08004", "Connection exception - authentication failed.");
        }
        if let (Some(target), Some(initial)) = (
            self.attributes.as_object_mut(),
            request["attributes"].as_object(),
        ) {
            for (key, value) in initial {
                if !value.is_null() {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        json!({"status": "ok", "responseData": {
            "sessionId": SESSION_ID,
            "protocolVersion": 3,
            "releaseVersion": "8.0.0-mock",
            "databaseName": "MOCK",
            "productName": "Exasol DB",
            "maxDataMessageSize": 1048576,
            "maxIdentifierLength": 128,
            "maxVarcharLength": 2000000,
            "identifierQuoteString": "\"",
            "timeZone": "UTC",
            "timeZoneBehavior": "INVALID SHIFT AMBIGUOUS ST"
        }})
    }

    async fn execute(&mut self, sql: &str) -> Value {
        if sql.starts_with("SELECT fail") {
            return error_reply("42000", "syntax error, unexpected IDENTIFIER_");
        }
        if sql == "SELECT timeout" {
            return error_reply("R0001", "Query terminated because timeout has been reached.");
        }
        if sql == "SELECT sleep" {
            tokio::time::sleep(Duration::from_millis(300)).await;
            return row_count_reply(1);
        }
        if sql == "SELECT sleep_long" {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            return row_count_reply(1);
        }
        if sql == "SELECT wait_abort" {
            return match tokio::time::timeout(Duration::from_secs(5), self.abort.notified()).await {
                Ok(()) => error_reply("R0003", "Client requested execution abort."),
                Err(_) => row_count_reply(0),
            };
        }
        if sql == "SELECT dup" {
            return result_set_reply(
                json!([
                    {"name": "X", "dataType": {"type": "DECIMAL", "precision": 18, "scale": 0}},
                    {"name": "X", "dataType": {"type": "DECIMAL", "precision": 18, "scale": 0}}
                ]),
                json!([[1], [2]]),
                1,
                1,
                None,
            );
        }
        if sql == "SELECT mixed_case" {
            return result_set_reply(
                json!([
                    {"name": "a", "dataType": {"type": "VARCHAR", "size": 10}},
                    {"name": "A", "dataType": {"type": "VARCHAR", "size": 10}}
                ]),
                json!([["x"], ["y"]]),
                1,
                1,
                None,
            );
        }
        if let Some(count) = sql.strip_prefix("SELECT numbers ") {
            let count: usize = count.trim().parse().unwrap_or(0);
            let rows: Vec<(i64, String)> = (1..=count as i64).map(|i| (i, format!("name{i}"))).collect();
            let inline = rows.len().min(CHUNK_ROWS);
            let handle = if rows.len() > inline {
                let handle = self.next_handle;
                self.next_handle += 1;
                Some(handle)
            } else {
                None
            };
            let reply = result_set_reply(numbers_columns(), column_major(&rows[..inline]), rows.len(), inline, handle);
            if let Some(handle) = handle {
                self.result_sets.insert(handle, rows);
            }
            return reply;
        }
        if sql.starts_with("EXPORT") {
            return self.export(sql).await;
        }
        if sql.starts_with("IMPORT") {
            return self.import(sql).await;
        }
        row_count_reply(0)
    }

    fn fetch(&mut self, request: &Value) -> Value {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        let handle = request["resultSetHandle"].as_i64().unwrap_or(-1);
        let start = request["startPosition"].as_u64().unwrap_or(0) as usize;
        let Some(rows) = self.result_sets.get(&handle) else {
            return error_reply("00000", "invalid result set handle");
        };
        let end = (start + CHUNK_ROWS).min(rows.len());
        let chunk = if start < end { &rows[start..end] } else { &[][..] };
        json!({"status": "ok", "responseData": {"numRows": chunk.len(), "data": column_major(chunk)}})
    }

    async fn take_tunnel(&self, proxy: &str) -> Option<TcpStream> {
        for _ in 0..500 {
            let taken = self.state.tunnels.lock().expect("lock").remove(proxy);
            if taken.is_some() {
                return taken;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    async fn export(&mut self, sql: &str) -> Value {
        let targets = file_targets(sql);
        if targets.is_empty() {
            return error_reply("42000", "EXPORT without AT clause");
        }
        if sql.contains("fail_early") {
            return error_reply("42000", "object FAIL_EARLY not found");
        }
        if sql.contains("wait_abort") {
            return self.export_until_abort(&targets[0]).await;
        }
        for (index, (proxy, file)) in targets.iter().enumerate() {
            let Some(mut socket) = self.take_tunnel(proxy).await else {
                return error_reply("42636", &format!("ETL-5106: could not reach {proxy}"));
            };
            let body: String = (1..=EXPORT_ROWS)
                .filter(|row| (row - 1) % targets.len() == index)
                .map(|row| format!("{row},name{row}\n"))
                .collect();
            let body = if file.ends_with(".gz") {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
                encoder.write_all(body.as_bytes()).expect("gzip");
                encoder.finish().expect("gzip")
            } else {
                body.into_bytes()
            };
            let head = format!("PUT /{file} HTTP/1.1\r\nHost: {proxy}\r\nTransfer-Encoding: chunked\r\n\r\n");
            let sent = async {
                socket.write_all(head.as_bytes()).await.ok()?;
                for chunk in body.chunks(7) {
                    write_chunk(&mut socket, chunk).await.ok()?;
                }
                write_final_chunk(&mut socket).await.ok()?;
                let mut reader = BufReader::new(&mut socket);
                read_response_head(&mut reader).await.ok().map(|(status, _)| status)
            }
            .await;
            if sent != Some(200) {
                return error_reply("42636", &format!("ETL-5106: transfer to {proxy} failed"));
            }
        }
        row_count_reply(EXPORT_ROWS)
    }

    async fn export_until_abort(&mut self, target: &(String, String)) -> Value {
        let (proxy, file) = target;
        let Some(mut socket) = self.take_tunnel(proxy).await else {
            return error_reply("42636", "ETL-5106: tunnel missing");
        };
        let head = format!("PUT /{file} HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = write_chunk(&mut socket, b"1,first\n").await;
        let _ = socket.flush().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.abort.notified()).await;
        drop(socket);
        error_reply("R0003", "Client requested execution abort.")
    }

    async fn import(&mut self, sql: &str) -> Value {
        let targets = file_targets(sql);
        if targets.is_empty() {
            return error_reply("42000", "IMPORT without AT clause");
        }
        let mut received = Vec::new();
        for (proxy, file) in &targets {
            let Some(mut socket) = self.take_tunnel(proxy).await else {
                return error_reply("42636", &format!("ETL-5106: could not reach {proxy}"));
            };
            let head = format!("GET /{file} HTTP/1.1\r\nHost: {proxy}\r\n\r\n");
            if socket.write_all(head.as_bytes()).await.is_err() {
                return error_reply("42636", "ETL-5106: connection lost");
            }
            let mut reader = BufReader::new(socket);
            if !matches!(read_response_head(&mut reader).await, Ok((200, _))) {
                return error_reply("42636", "ETL-5106: bad response");
            }
            let mut body = Vec::new();
            let _ = reader.read_to_end(&mut body).await;
            if file.ends_with(".gz") {
                let mut plain = Vec::new();
                if GzDecoder::new(body.as_slice()).read_to_end(&mut plain).is_err() {
                    return error_reply("42636", "ETL-5105: corrupt gzip input");
                }
                body = plain;
            }
            if sql.contains("strict") && body.is_empty() {
                return error_reply("42636", "ETL-5105: empty input");
            }
            received.extend(body);
        }
        let rows = received.iter().filter(|b| **b == b'\n').count();
        self.state.imported.lock().expect("lock").extend(received);
        row_count_reply(rows)
    }
}
