//! Capabilities the broker borrows from an external pooled client.
//!
//! The broker never opens physical connections. It asks a [`Pool`] for one
//! connection per request and hands it back when the request ends. Drivers
//! implement these two traits; statements travel as an opaque
//! [`Statement`] (text plus positional parameters).

use std::fmt;
use std::ops::{Deref, DerefMut};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Scalar statement parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Query text plus positional parameters, as produced by a query builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params<S: Into<String>>(text: S, params: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            params,
        }
    }

    /// Append one positional parameter.
    pub fn bind<V: Into<Value>>(mut self, value: V) -> Self {
        self.params.push(value.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Result of a statement that does not return rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// One result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What the server reported for a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepared {
    pub text: String,
    /// `None` when the driver cannot tell.
    pub param_count: Option<usize>,
    pub columns: Vec<String>,
}

/// One leased connection from a pool.
///
/// Dropping a connection must hand it back to its pool (the way sqlx's
/// `PoolConnection` does); the broker relies on that for release during
/// cancellation, where it cannot await [`Connection::close`].
#[async_trait]
pub trait Connection: Send + 'static {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecOutcome>;

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>>;

    async fn prepare(&mut self, text: &str) -> Result<Prepared>;

    async fn ping(&mut self) -> Result<()>;

    /// Whether a transaction started with [`Connection::begin_transaction`]
    /// has not been committed or rolled back yet.
    fn in_transaction(&self) -> bool;

    /// Record the transaction state; only [`Transaction`] calls this.
    fn set_in_transaction(&mut self, open: bool);

    /// Start a transaction on this connection.
    ///
    /// A transaction still open when the request ends is rolled back before
    /// the connection goes back to the pool.
    async fn begin_transaction<'c>(&'c mut self) -> Result<Transaction<'c, Self>>
    where
        Self: Sized,
    {
        self.execute(&Statement::new("BEGIN")).await?;
        self.set_in_transaction(true);
        Ok(Transaction::new(self))
    }

    /// Return the connection to its pool for reuse.
    async fn close(self) -> Result<()>
    where
        Self: Sized;

    /// Return the connection to its pool without reusing its session.
    ///
    /// Used when the session state may be inconsistent, e.g. after a failed
    /// schema switch. Defaults to [`Connection::close`] for pools that
    /// validate connections themselves.
    async fn discard(self) -> Result<()>
    where
        Self: Sized,
    {
        self.close().await
    }
}

/// Source of connections.
#[async_trait]
pub trait Pool: Send + Sync + 'static {
    type Conn: Connection;

    async fn acquire(&self) -> Result<Self::Conn>;
}

/// A transaction borrowed from a bound connection.
///
/// Statements run through `Deref` to the connection. Finish it with
/// [`Transaction::commit`] or [`Transaction::rollback`]; if it is dropped
/// instead, the connection stays marked and the broker rolls it back on
/// release.
pub struct Transaction<'c, C: Connection> {
    conn: &'c mut C,
}

impl<'c, C: Connection> Transaction<'c, C> {
    pub fn new(conn: &'c mut C) -> Self {
        Self { conn }
    }

    /// A failed `COMMIT` leaves the connection marked.
    pub async fn commit(self) -> Result<()> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(self) -> Result<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(self, text: &str) -> Result<()> {
        self.conn.execute(&Statement::new(text)).await?;
        self.conn.set_in_transaction(false);
        Ok(())
    }
}

impl<C: Connection> Deref for Transaction<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
    }
}

impl<C: Connection> DerefMut for Transaction<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
    }
}

impl<C: Connection> Drop for Transaction<'_, C> {
    fn drop(&mut self) {
        if self.conn.in_transaction() {
            tracing::warn!("transaction dropped without commit or rollback");
        }
    }
}
