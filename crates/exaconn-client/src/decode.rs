use exaconn_core::error::{ExaError, Result};
use exaconn_core::types::{Column, DataType, DataValue};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Turns one raw wire value into a [`DataValue`]. Applied to every cell,
/// whether it arrived inline with `execute` or through `fetch`.
pub type FetchMapper = fn(Value, &DataType) -> DataValue;

pub fn default_mapper(value: Value, data_type: &DataType) -> DataValue {
    match value {
        Value::Null => DataValue::Null,
        Value::Bool(b) => DataValue::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                DataValue::Int64(i)
            } else if data_type.type_name == "DECIMAL" {
                DataValue::Decimal(n.to_string())
            } else {
                n.as_f64()
                    .map(DataValue::Float64)
                    .unwrap_or_else(|| DataValue::Decimal(n.to_string()))
            }
        }
        Value::String(s) => match data_type.type_name.as_str() {
            "DECIMAL" if data_type.is_integral_decimal() => match s.parse::<i64>() {
                Ok(i) => DataValue::Int64(i),
                Err(_) => DataValue::Decimal(s),
            },
            "DECIMAL" => DataValue::Decimal(s),
            "DOUBLE" => match s.parse::<f64>() {
                Ok(f) => DataValue::Float64(f),
                Err(_) => DataValue::String(s),
            },
            _ => DataValue::String(s),
        },
        other => DataValue::String(other.to_string()),
    }
}

/// Mapper that keeps every value as text, the way the server formats it.
pub fn string_mapper(value: Value, _data_type: &DataType) -> DataValue {
    match value {
        Value::Null => DataValue::Null,
        Value::String(s) => DataValue::String(s),
        other => DataValue::String(other.to_string()),
    }
}

/// Shapes one decoded row. Chosen once per statement.
pub trait RowDecoder: Send {
    type Row: Send;

    fn decode(&self, columns: &[Column], values: Vec<DataValue>) -> Self::Row;
}

/// Rows as positional value lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleDecoder;

impl RowDecoder for TupleDecoder {
    type Row = Vec<DataValue>;

    fn decode(&self, _columns: &[Column], values: Vec<DataValue>) -> Self::Row {
        values
    }
}

/// Rows as column-name keyed maps that keep result-set column order.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapDecoder;

impl RowDecoder for MapDecoder {
    type Row = NamedRow;

    fn decode(&self, columns: &[Column], values: Vec<DataValue>) -> Self::Row {
        NamedRow {
            entries: columns
                .iter()
                .map(|c| c.name.clone())
                .zip(values)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedRow {
    entries: Vec<(String, DataValue)>,
}

impl NamedRow {
    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.entries
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<(String, DataValue)> {
        self.entries
    }
}

/// How result-set column names are compared when looking for duplicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNamePolicy {
    #[default]
    Exact,
    CaseInsensitive,
}

impl ColumnNamePolicy {
    fn key(self, name: &str) -> String {
        match self {
            ColumnNamePolicy::Exact => name.to_string(),
            ColumnNamePolicy::CaseInsensitive => name.to_lowercase(),
        }
    }
}

pub fn check_unique_columns(columns: &[Column], policy: ColumnNamePolicy) -> Result<()> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for column in columns {
        let count = seen.entry(policy.key(&column.name)).or_insert(0);
        *count += 1;
        if *count == 2 {
            duplicates.push(column.name.clone());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ExaError::DuplicateColumns(duplicates))
    }
}
