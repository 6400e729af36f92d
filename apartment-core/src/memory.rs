//! In-memory pool for tests and development
//!
//! Implements [`Pool`] and [`Connection`] without a database. Every
//! statement is recorded together with the session state (schema and open
//! transaction) at that moment, so isolation can be asserted after the fact.
//! Connections handed back with `close` keep their session and are reused by
//! later acquisitions, like a real pool; discarded ones are not. Faults can
//! be injected into acquisition, the schema switch and `ROLLBACK`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::conn::{Connection, ExecOutcome, Pool, Prepared, Row, Statement, Value};

/// A statement as seen by a memory connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub connection_id: u64,
    /// Schema the session pointed at when the statement ran.
    pub schema: Option<String>,
    pub in_transaction: bool,
    pub text: String,
    pub params: Vec<Value>,
}

/// Counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical connections created; lower than `acquired` once idle
    /// connections get reused.
    pub opened: usize,
    pub acquired: usize,
    /// Connections handed back, whichever way (close, discard or drop).
    pub released: usize,
    /// Of `released`, those handed back through [`Connection::discard`].
    pub discarded: usize,
    pub in_use: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_acquire: Option<String>,
    switch_delay: Option<Duration>,
    fail_switch: Option<String>,
    fail_rollback: Option<String>,
}

/// Session state that survives a round trip through the idle list.
#[derive(Debug)]
struct Session {
    id: u64,
    schema: Option<String>,
    in_transaction: bool,
}

struct PoolInner {
    capacity: usize,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    acquired: AtomicUsize,
    released: AtomicUsize,
    discarded: AtomicUsize,
    idle: Mutex<Vec<Session>>,
    log: Mutex<Vec<ExecutedStatement>>,
    faults: Mutex<Faults>,
}

/// Bounded pool of fake connections. Clones share the same state.
#[derive(Clone)]
pub struct MemoryPool {
    inner: Arc<PoolInner>,
}

impl MemoryPool {
    /// `capacity` connections; acquisition waits while all are leased.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                next_id: AtomicU64::new(1),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                idle: Mutex::new(Vec::new()),
                log: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
            }),
        }
    }

    /// Make every acquisition fail with `message`.
    pub fn fail_acquire(&self, message: impl Into<String>) {
        self.inner.faults.lock().fail_acquire = Some(message.into());
    }

    /// Make every schema switch take `delay` before it completes.
    pub fn delay_switch(&self, delay: Duration) {
        self.inner.faults.lock().switch_delay = Some(delay);
    }

    /// Make every schema switch fail with `message`.
    pub fn fail_switch(&self, message: impl Into<String>) {
        self.inner.faults.lock().fail_switch = Some(message.into());
    }

    /// Make every `ROLLBACK` fail with `message`.
    pub fn fail_rollback(&self, message: impl Into<String>) {
        self.inner.faults.lock().fail_rollback = Some(message.into());
    }

    pub fn clear_faults(&self) {
        *self.inner.faults.lock() = Faults::default();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: (self.inner.next_id.load(Ordering::SeqCst) - 1) as usize,
            acquired: self.inner.acquired.load(Ordering::SeqCst),
            released: self.inner.released.load(Ordering::SeqCst),
            discarded: self.inner.discarded.load(Ordering::SeqCst),
            in_use: self.inner.capacity - self.inner.permits.available_permits(),
        }
    }

    /// Every statement executed or queried so far, in order.
    pub fn statements(&self) -> Vec<ExecutedStatement> {
        self.inner.log.lock().clone()
    }
}

#[async_trait]
impl Pool for MemoryPool {
    type Conn = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection> {
        if let Some(message) = self.inner.faults.lock().fail_acquire.clone() {
            return Err(anyhow!(message));
        }
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("pool closed"))?;
        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.idle.lock().pop().unwrap_or_else(|| Session {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            schema: None,
            in_transaction: false,
        });
        Ok(MemoryConnection {
            id: session.id,
            schema: session.schema,
            in_transaction: session.in_transaction,
            discarded: false,
            lease: Lease {
                pool: Arc::clone(&self.inner),
                _permit: permit,
            },
        })
    }
}

/// Returns the connection to the pool when dropped.
struct Lease {
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MemoryConnection {
    id: u64,
    schema: Option<String>,
    in_transaction: bool,
    discarded: bool,
    lease: Lease,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        // Runs before the lease gives the permit back.
        self.lease.pool.idle.lock().push(Session {
            id: self.id,
            schema: self.schema.take(),
            in_transaction: self.in_transaction,
        });
    }
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn record(&self, stmt: &Statement) {
        self.lease.pool.log.lock().push(ExecutedStatement {
            connection_id: self.id,
            schema: self.schema.clone(),
            in_transaction: self.in_transaction,
            text: stmt.text.clone(),
            params: stmt.params.clone(),
        });
    }

    async fn switch_to(&mut self, target: String) -> Result<()> {
        let (delay, failure) = {
            let faults = self.lease.pool.faults.lock();
            (faults.switch_delay, faults.fail_switch.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = failure {
            return Err(anyhow!(message));
        }
        self.schema = Some(target);
        Ok(())
    }
}

/// Target of a `USE` or `SET search_path` statement, unquoted.
fn switch_target(text: &str) -> Option<String> {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();
    if upper.starts_with("USE ") {
        let name = text[4..].trim();
        return Some(unquote(name, '`'));
    }
    if upper.starts_with("SET SEARCH_PATH TO ") {
        let name = text["SET search_path TO ".len()..].trim();
        return Some(unquote(name, '"'));
    }
    None
}

fn unquote(name: &str, quote: char) -> String {
    match name
        .strip_prefix(quote)
        .and_then(|n| n.strip_suffix(quote))
    {
        Some(inner) => {
            let doubled: String = [quote, quote].iter().collect();
            inner.replace(&doubled, &quote.to_string())
        }
        None => name.to_string(),
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecOutcome> {
        self.record(stmt);
        if let Some(target) = switch_target(&stmt.text) {
            self.switch_to(target).await?;
        }
        if stmt.text.trim().eq_ignore_ascii_case("ROLLBACK") {
            if let Some(message) = self.lease.pool.faults.lock().fail_rollback.clone() {
                return Err(anyhow!(message));
            }
        }
        Ok(ExecOutcome::default())
    }

    /// Answers `SELECT DATABASE()` with the current schema; any other query
    /// returns no rows.
    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        self.record(stmt);
        if stmt.text.trim().eq_ignore_ascii_case("SELECT DATABASE()") {
            return Ok(vec![Row {
                columns: vec!["DATABASE()".to_string()],
                values: vec![self.schema.clone().into()],
            }]);
        }
        Ok(Vec::new())
    }

    async fn prepare(&mut self, text: &str) -> Result<Prepared> {
        Ok(Prepared {
            text: text.to_string(),
            param_count: Some(text.matches('?').count()),
            columns: Vec::new(),
        })
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    async fn close(self) -> Result<()> {
        drop(self);
        Ok(())
    }

    async fn discard(mut self) -> Result<()> {
        self.discarded = true;
        self.lease.pool.discarded.fetch_add(1, Ordering::SeqCst);
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_schema_and_releases_on_drop() {
        let pool = MemoryPool::new(2);
        let mut conn = pool.acquire().await.unwrap();
        conn.execute(&Statement::new("USE `acme`")).await.unwrap();
        assert_eq!(conn.schema(), Some("acme"));
        conn.execute(&Statement::new("INSERT INTO t VALUES (?)").bind(1))
            .await
            .unwrap();
        assert_eq!(pool.stats().in_use, 1);
        drop(conn);

        let stats = pool.stats();
        assert_eq!((stats.acquired, stats.released, stats.in_use), (1, 1, 0));
        let log = pool.statements();
        assert_eq!(log[0].schema, None);
        assert_eq!(log[1].schema.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn discard_counts_once() {
        let pool = MemoryPool::new(1);
        let conn = pool.acquire().await.unwrap();
        conn.discard().await.unwrap();
        let stats = pool.stats();
        assert_eq!((stats.released, stats.discarded), (1, 1));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(pool.stats().opened, 2);
    }

    #[tokio::test]
    async fn closed_connections_are_reused_with_their_session() {
        let pool = MemoryPool::new(1);
        let mut conn = pool.acquire().await.unwrap();
        conn.execute(&Statement::new("USE `acme`")).await.unwrap();
        let tx = conn.begin_transaction().await.unwrap();
        drop(tx);
        let first = conn.id();
        conn.close().await.unwrap();

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first);
        assert_eq!(conn.schema(), Some("acme"));
        assert!(conn.is_in_transaction());
        let stats = pool.stats();
        assert_eq!((stats.opened, stats.acquired, stats.released), (1, 2, 1));
    }

    #[tokio::test]
    async fn injected_faults() {
        let pool = MemoryPool::new(1);
        pool.fail_acquire("too many connections");
        assert_eq!(
            pool.acquire().await.err().unwrap().to_string(),
            "too many connections"
        );
        pool.clear_faults();

        pool.fail_switch("Unknown database 'ghost'");
        let mut conn = pool.acquire().await.unwrap();
        assert!(conn.execute(&Statement::new("USE `ghost`")).await.is_err());
        assert_eq!(conn.schema(), None);
    }

    #[test]
    fn parses_switch_targets() {
        assert_eq!(switch_target("USE `acme`").as_deref(), Some("acme"));
        assert_eq!(switch_target("use a``b").as_deref(), Some("a``b"));
        assert_eq!(switch_target("USE `a``b`").as_deref(), Some("a`b"));
        assert_eq!(
            switch_target("SET search_path TO \"globex\"").as_deref(),
            Some("globex")
        );
        assert_eq!(switch_target("SELECT 1"), None);
    }

    #[tokio::test]
    async fn answers_current_database() {
        let pool = MemoryPool::new(1);
        let mut conn = pool.acquire().await.unwrap();
        conn.execute(&Statement::new("USE `acme`")).await.unwrap();
        let rows = conn.query(&Statement::new("SELECT DATABASE()")).await.unwrap();
        assert_eq!(rows[0].get("DATABASE()").and_then(Value::as_str), Some("acme"));
    }
}
