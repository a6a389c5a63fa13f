use exaconn_core::types::Column;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 3;

/// Commands sent over the control connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Login {
        protocol_version: u32,
    },
    Execute {
        sql_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    Fetch {
        result_set_handle: i64,
        start_position: u64,
        num_bytes: u64,
    },
    CloseResultSet {
        result_set_handles: Vec<i64>,
    },
    CreatePreparedStatement {
        sql_text: String,
    },
    ExecutePreparedStatement {
        statement_handle: i64,
        num_columns: usize,
        num_rows: usize,
        columns: Vec<Column>,
        data: Vec<Vec<Value>>,
    },
    ClosePreparedStatement {
        statement_handle: i64,
    },
    GetAttributes,
    SetAttributes {
        attributes: Attributes,
    },
    GetHosts {
        host_ip: String,
    },
    AbortQuery,
    Disconnect,
}

impl Request {
    pub fn into_payload(self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Second login step. Sent without a `command` key.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub driver_name: String,
    pub client_name: String,
    pub client_version: String,
    pub client_os: String,
    pub client_os_username: String,
    pub client_runtime: String,
    pub use_compression: bool,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerException {
    pub text: String,
    #[serde(default)]
    pub sql_code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub response_data: Option<Value>,
    #[serde(default)]
    pub exception: Option<ServerException>,
    #[serde(default)]
    pub attributes: Option<Attributes>,
}

impl Response {
    /// Deserialize `responseData` into a typed body.
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.response_data.clone().unwrap_or(Value::Null))
    }
}

/// Session attributes. Every field is optional because the server only sends
/// the ones that changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autocommit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_transactions_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compression_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_transaction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_set_max_rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datetime_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numeric_characters: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_zone_behavior: Option<String>,
}

impl Attributes {
    /// Overlay every field present in `delta`.
    pub fn merge(&mut self, delta: &Attributes) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if delta.$field.is_some() {
                    self.$field = delta.$field.clone();
                })*
            };
        }
        take!(
            autocommit,
            current_schema,
            query_timeout,
            snapshot_transactions_enabled,
            compression_enabled,
            open_transaction,
            result_set_max_rows,
            date_format,
            datetime_format,
            numeric_characters,
            timezone,
            time_zone_behavior
        );
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyData {
    pub public_key_pem: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInfo {
    pub session_id: i64,
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub release_version: String,
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub max_data_message_size: u64,
    #[serde(default)]
    pub max_identifier_length: u32,
    #[serde(default)]
    pub max_varchar_length: u32,
    #[serde(default)]
    pub identifier_quote_string: String,
    #[serde(default)]
    pub time_zone: String,
    #[serde(default)]
    pub time_zone_behavior: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteData {
    #[serde(default)]
    pub num_results: usize,
    #[serde(default)]
    pub results: Vec<ResultEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub result_type: String,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub result_set: Option<ResultSetData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSetData {
    #[serde(default)]
    pub result_set_handle: Option<i64>,
    #[serde(default)]
    pub num_columns: usize,
    #[serde(default)]
    pub num_rows: u64,
    #[serde(default)]
    pub num_rows_in_message: u64,
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Column-major values of the first chunk.
    #[serde(default)]
    pub data: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchData {
    #[serde(default)]
    pub num_rows: u64,
    #[serde(default)]
    pub data: Option<Vec<Vec<Value>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterData {
    #[serde(default)]
    pub num_columns: usize,
    #[serde(default)]
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedData {
    pub statement_handle: i64,
    #[serde(default)]
    pub parameter_data: Option<ParameterData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostsData {
    #[serde(default)]
    pub num_nodes: usize,
    #[serde(default)]
    pub nodes: Vec<String>,
}
