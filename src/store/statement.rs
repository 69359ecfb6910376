//! Prepared and bound statements, and the rows they return

use crate::schema::Bucket;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queries the migration and query paths issue against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTemplate {
    /// All legacy rows of one schedule in a bucket table, ordered by
    /// (timestamp, kind). Binds: schedule id.
    /// Returns: timestamp, kind code, value, remaining ttl (nullable).
    FindLegacyRows(Bucket),
    /// Page through the legacy index for a bucket. No binds.
    /// Returns: schedule id (one row per indexed time slice).
    ScanLegacyIndex(Bucket),
    /// Binds: schedule id, bucket name, timestamp, avg, max, min, ttl (nullable).
    InsertAggregate,
    /// Binds: schedule id, start (inclusive), end (exclusive).
    /// Returns: timestamp, avg, max, min.
    FindAggregateRange(Bucket),
    /// Binds: schedule id, start (inclusive), end (exclusive).
    /// Returns: timestamp, value.
    FindRawRange,
}

impl QueryTemplate {
    /// Number of values a statement for this template must be bound with
    pub fn parameter_count(&self) -> usize {
        match self {
            QueryTemplate::FindLegacyRows(_) => 1,
            QueryTemplate::ScanLegacyIndex(_) => 0,
            QueryTemplate::InsertAggregate => 7,
            QueryTemplate::FindAggregateRange(_) | QueryTemplate::FindRawRange => 3,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, QueryTemplate::InsertAggregate)
    }
}

/// A bound column or parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    /// Epoch milliseconds
    Timestamp(i64),
}

impl From<Option<i32>> for Value {
    fn from(v: Option<i32>) -> Self {
        v.map(Value::Int).unwrap_or(Value::Null)
    }
}

/// Opaque position of a paged query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingState(Vec<u8>);

impl PagingState {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Statement prepared by a session
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Uuid,
    template: QueryTemplate,
}

impl PreparedStatement {
    pub fn new(template: QueryTemplate) -> Self {
        Self {
            id: Uuid::new_v4(),
            template,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn template(&self) -> QueryTemplate {
        self.template
    }

    /// Bind parameter values, checking the arity against the template
    pub fn bind(&self, values: Vec<Value>) -> Result<BoundStatement> {
        let expected = self.template.parameter_count();
        if values.len() != expected {
            return Err(Error::InvalidStatement(format!(
                "{:?} expects {} values, got {}",
                self.template,
                expected,
                values.len()
            )));
        }
        Ok(BoundStatement {
            prepared_id: self.id,
            template: self.template,
            values,
            fetch_size: None,
            paging_state: None,
        })
    }
}

/// Statement ready to execute
#[derive(Debug, Clone)]
pub struct BoundStatement {
    prepared_id: Uuid,
    template: QueryTemplate,
    values: Vec<Value>,
    fetch_size: Option<usize>,
    paging_state: Option<PagingState>,
}

impl BoundStatement {
    pub fn template(&self) -> QueryTemplate {
        self.template
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn prepared_id(&self) -> Uuid {
        self.prepared_id
    }

    pub fn fetch_size(&self) -> Option<usize> {
        self.fetch_size
    }

    pub fn paging_state(&self) -> Option<&PagingState> {
        self.paging_state.as_ref()
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    pub fn with_paging_state(mut self, paging_state: Option<PagingState>) -> Self {
        self.paging_state = paging_state;
        self
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    fn column(&self, idx: usize) -> Result<&Value> {
        self.values
            .get(idx)
            .ok_or_else(|| Error::Serialization(format!("row has no column {}", idx)))
    }

    pub fn get_int(&self, idx: usize) -> Result<i32> {
        match self.column(idx)? {
            Value::Int(v) => Ok(*v),
            other => Err(type_mismatch(idx, "int", other)),
        }
    }

    pub fn get_opt_int(&self, idx: usize) -> Result<Option<i32>> {
        match self.column(idx)? {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            other => Err(type_mismatch(idx, "int", other)),
        }
    }

    pub fn get_timestamp(&self, idx: usize) -> Result<i64> {
        match self.column(idx)? {
            Value::Timestamp(v) | Value::BigInt(v) => Ok(*v),
            other => Err(type_mismatch(idx, "timestamp", other)),
        }
    }

    pub fn get_double(&self, idx: usize) -> Result<f64> {
        match self.column(idx)? {
            Value::Double(v) => Ok(*v),
            Value::Null => Ok(f64::NAN),
            other => Err(type_mismatch(idx, "double", other)),
        }
    }

    pub fn get_text(&self, idx: usize) -> Result<&str> {
        match self.column(idx)? {
            Value::Text(v) => Ok(v),
            other => Err(type_mismatch(idx, "text", other)),
        }
    }
}

fn type_mismatch(idx: usize, expected: &str, found: &Value) -> Error {
    Error::Serialization(format!(
        "column {} is not {}: found {:?}",
        idx, expected, found
    ))
}

/// Rows of one page plus the position of the next page, if any
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub rows: Vec<Row>,
    pub paging_state: Option<PagingState>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            paging_state: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.paging_state.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_checks_arity() {
        let prepared = PreparedStatement::new(QueryTemplate::FindLegacyRows(Bucket::OneHour));
        assert!(prepared.bind(vec![Value::Int(1)]).is_ok());
        let err = prepared.bind(vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidStatement(_)));
    }

    #[test]
    fn row_getters_check_types() {
        let row = Row::new(vec![
            Value::Timestamp(1_000),
            Value::Int(2),
            Value::Double(3.5),
            Value::Null,
        ]);
        assert_eq!(row.get_timestamp(0).unwrap(), 1_000);
        assert_eq!(row.get_int(1).unwrap(), 2);
        assert_eq!(row.get_double(2).unwrap(), 3.5);
        assert_eq!(row.get_opt_int(3).unwrap(), None);
        assert!(row.get_int(2).is_err());
        assert!(row.get_int(9).is_err());
    }
}
