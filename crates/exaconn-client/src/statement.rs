use crate::decode::{check_unique_columns, default_mapper, FetchMapper, RowDecoder};
use crate::session::Session;
use exaconn_core::error::{ExaError, Result};
use exaconn_core::types::{Column, DataValue, ResultKind};
use exaconn_protocol::messages::{
    ExecuteData, FetchData, PreparedData, Request, Response, ResultSetData,
};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One SQL statement and, once executed, its result.
///
/// Rows are pulled lazily: the first chunk arrives with `execute`, further
/// chunks are fetched by absolute position until `rows_total` is reached.
pub struct Statement<D: RowDecoder> {
    session: Session,
    sql: String,
    decoder: D,
    mapper: FetchMapper,
    kind: Option<ResultKind>,
    row_count: u64,
    columns: Vec<Column>,
    result_set_handle: Option<i64>,
    statement_handle: Option<i64>,
    parameter_columns: Vec<Column>,
    /// Column-major values of the current chunk.
    chunk: Vec<Vec<Value>>,
    position_total: u64,
    position_in_chunk: usize,
    rows_in_chunk: usize,
    rows_total: u64,
    elapsed: Duration,
    closed: bool,
}

impl<D: RowDecoder> std::fmt::Debug for Statement<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("kind", &self.kind)
            .field("rows_total", &self.rows_total)
            .field("position_total", &self.position_total)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<D: RowDecoder> Statement<D> {
    pub(crate) fn new(session: Session, sql: String, decoder: D) -> Self {
        Self {
            session,
            sql,
            decoder,
            mapper: default_mapper,
            kind: None,
            row_count: 0,
            columns: Vec::new(),
            result_set_handle: None,
            statement_handle: None,
            parameter_columns: Vec::new(),
            chunk: Vec::new(),
            position_total: 0,
            position_in_chunk: 0,
            rows_in_chunk: 0,
            rows_total: 0,
            elapsed: Duration::ZERO,
            closed: false,
        }
    }

    /// Replace the value mapper. Applies to every row not yet fetched.
    pub fn with_mapper(mut self, mapper: FetchMapper) -> Self {
        self.mapper = mapper;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(ExaError::StatementClosed)
        } else {
            Ok(())
        }
    }

    /// Runs the SQL text, dropping any previous result first.
    pub async fn execute(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.release_result_set().await?;
        let started = Instant::now();
        let response = self
            .session
            .request_with_sql(
                Request::Execute {
                    sql_text: self.sql.clone(),
                    attributes: None,
                },
                &self.sql,
            )
            .await?;
        self.elapsed = started.elapsed();
        self.apply_execute(response)
    }

    pub(crate) fn apply_execute(&mut self, response: Response) -> Result<()> {
        let data: ExecuteData = response.data()?;
        self.reset_result();
        let Some(first) = data.results.into_iter().next() else {
            self.kind = Some(ResultKind::RowCount);
            return Ok(());
        };
        match first.result_type.as_str() {
            "rowCount" => {
                self.kind = Some(ResultKind::RowCount);
                self.row_count = first.row_count.unwrap_or(0);
            }
            "resultSet" => {
                let result_set = first.result_set.ok_or_else(|| {
                    ExaError::Runtime("resultSet reply without result set data".into())
                })?;
                self.load_result_set(result_set)?;
            }
            other => {
                return Err(ExaError::Runtime(format!("unknown result type '{other}'")));
            }
        }
        debug!(
            sql = %self.sql,
            kind = ?self.kind,
            rows = self.rowcount(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "statement executed"
        );
        Ok(())
    }

    fn load_result_set(&mut self, result_set: ResultSetData) -> Result<()> {
        self.kind = Some(ResultKind::ResultSet);
        self.result_set_handle = result_set.result_set_handle;
        check_unique_columns(
            &result_set.columns,
            self.session.options().column_name_policy,
        )?;
        self.columns = result_set.columns;
        self.rows_total = result_set.num_rows;
        self.chunk = result_set.data.unwrap_or_default();
        self.rows_in_chunk = result_set.num_rows_in_message as usize;
        Ok(())
    }

    fn reset_result(&mut self) {
        self.kind = None;
        self.row_count = 0;
        self.columns.clear();
        self.result_set_handle = None;
        self.chunk.clear();
        self.position_total = 0;
        self.position_in_chunk = 0;
        self.rows_in_chunk = 0;
        self.rows_total = 0;
    }

    /// Pulls the next chunk. Returns `false` at the end of the result.
    pub async fn fetch_next_chunk(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let Some(handle) = self.result_set_handle else {
            return Ok(false);
        };
        if self.position_total >= self.rows_total {
            return Ok(false);
        }
        let response = self
            .session
            .request(Request::Fetch {
                result_set_handle: handle,
                start_position: self.position_total,
                num_bytes: self.session.fetch_size_bytes(),
            })
            .await?;
        let fetched: FetchData = response.data()?;
        if fetched.num_rows == 0 {
            return Ok(false);
        }
        self.chunk = fetched.data.unwrap_or_default();
        self.rows_in_chunk = fetched.num_rows as usize;
        self.position_in_chunk = 0;
        Ok(true)
    }

    async fn next_values(&mut self) -> Result<Option<Vec<DataValue>>> {
        self.ensure_open()?;
        if self.kind != Some(ResultKind::ResultSet) {
            return Err(ExaError::NoResultSet);
        }
        if self.position_in_chunk >= self.rows_in_chunk {
            if self.position_total >= self.rows_total || !self.fetch_next_chunk().await? {
                return Ok(None);
            }
        }
        let row = self.position_in_chunk;
        let mut values = Vec::with_capacity(self.columns.len());
        for (index, column) in self.columns.iter().enumerate() {
            let raw = self
                .chunk
                .get_mut(index)
                .and_then(|values| values.get_mut(row))
                .map(Value::take)
                .unwrap_or(Value::Null);
            values.push((self.mapper)(raw, &column.data_type));
        }
        self.position_in_chunk += 1;
        self.position_total += 1;
        Ok(Some(values))
    }

    pub async fn next_row(&mut self) -> Result<Option<D::Row>> {
        Ok(self
            .next_values()
            .await?
            .map(|values| self.decoder.decode(&self.columns, values)))
    }

    pub async fn fetch_one(&mut self) -> Result<Option<D::Row>> {
        self.next_row().await
    }

    pub async fn fetch_many(&mut self, count: usize) -> Result<Vec<D::Row>> {
        let mut rows = Vec::with_capacity(count);
        while rows.len() < count {
            match self.next_row().await? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub async fn fetch_all(&mut self) -> Result<Vec<D::Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Remaining values of the first column.
    pub async fn fetch_column(&mut self) -> Result<Vec<DataValue>> {
        let mut column = Vec::new();
        while let Some(values) = self.next_values().await? {
            column.extend(values.into_iter().next());
        }
        Ok(column)
    }

    /// First value of the next row.
    pub async fn fetch_val(&mut self) -> Result<Option<DataValue>> {
        Ok(self
            .next_values()
            .await?
            .and_then(|values| values.into_iter().next()))
    }

    pub(crate) async fn prepare(&mut self) -> Result<()> {
        self.ensure_open()?;
        let response = self
            .session
            .request(Request::CreatePreparedStatement {
                sql_text: self.sql.clone(),
            })
            .await?;
        let prepared: PreparedData = response.data()?;
        self.statement_handle = Some(prepared.statement_handle);
        self.parameter_columns = prepared
            .parameter_data
            .map(|p| p.columns)
            .unwrap_or_default();
        debug!(
            sql = %self.sql,
            handle = prepared.statement_handle,
            parameters = self.parameter_columns.len(),
            "statement prepared"
        );
        Ok(())
    }

    /// Runs a prepared statement once per input row.
    pub async fn execute_prepared(&mut self, rows: Vec<Vec<Value>>) -> Result<()> {
        self.ensure_open()?;
        let handle = self
            .statement_handle
            .ok_or_else(|| ExaError::Runtime("statement is not prepared".into()))?;
        let num_columns = self.parameter_columns.len();
        let num_rows = rows.len();
        let mut data: Vec<Vec<Value>> = vec![Vec::with_capacity(num_rows); num_columns];
        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != num_columns {
                return Err(ExaError::Runtime(format!(
                    "row {index} has {} values, statement expects {num_columns}",
                    row.len()
                )));
            }
            for (column, value) in data.iter_mut().zip(row) {
                column.push(value);
            }
        }
        self.release_result_set().await?;
        let started = Instant::now();
        let response = self
            .session
            .request_with_sql(
                Request::ExecutePreparedStatement {
                    statement_handle: handle,
                    num_columns,
                    num_rows,
                    columns: self.parameter_columns.clone(),
                    data,
                },
                &self.sql,
            )
            .await?;
        self.elapsed = started.elapsed();
        self.apply_execute(response)
    }

    async fn release_result_set(&mut self) -> Result<()> {
        if let Some(handle) = self.result_set_handle.take() {
            self.session
                .request(Request::CloseResultSet {
                    result_set_handles: vec![handle],
                })
                .await?;
        }
        Ok(())
    }

    /// Releases server handles. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        if let Err(err) = self.release_result_set().await {
            first_error.get_or_insert(err);
        }
        if let Some(handle) = self.statement_handle.take() {
            if let Err(err) = self
                .session
                .request(Request::ClosePreparedStatement {
                    statement_handle: handle,
                })
                .await
            {
                first_error.get_or_insert(err);
            }
        }
        self.chunk.clear();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn result_kind(&self) -> Option<ResultKind> {
        self.kind
    }

    /// Affected rows for DML, total rows for a result set.
    pub fn rowcount(&self) -> u64 {
        match self.kind {
            Some(ResultKind::ResultSet) => self.rows_total,
            _ => self.row_count,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn parameter_columns(&self) -> &[Column] {
        &self.parameter_columns
    }

    pub fn position(&self) -> u64 {
        self.position_total
    }

    pub fn result_set_handle(&self) -> Option<i64> {
        self.result_set_handle
    }

    pub fn statement_handle(&self) -> Option<i64> {
        self.statement_handle
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl<D: RowDecoder> Drop for Statement<D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if self.session.is_closed() {
            if self.result_set_handle.is_some() || self.statement_handle.is_some() {
                warn!(sql = %self.sql, "statement handles dropped after the session closed");
            }
            return;
        }
        if let Some(handle) = self.result_set_handle.take() {
            self.session.defer_release(Request::CloseResultSet {
                result_set_handles: vec![handle],
            });
        }
        if let Some(handle) = self.statement_handle.take() {
            self.session
                .defer_release(Request::ClosePreparedStatement { statement_handle: handle });
        }
    }
}
