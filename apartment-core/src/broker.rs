//! The connection broker: one schema-switched connection per in-flight
//! request, reachable from anywhere in that request's call graph.
//!
//! Lifecycle of a request going through [`ConnectionBroker::bind_and_run`]:
//!
//! 1. resolve and validate the tenant (no pool access on failure)
//! 2. acquire a connection, bounded by the request deadline
//! 3. switch the session to the tenant, bounded by the switch timeout
//! 4. register `token -> connection`
//! 5. run the downstream future with a context carrying the token
//! 6. unregister the token, roll back a transaction left open, then hand the
//!    connection back to the pool
//!
//! Step 6 runs exactly once on every exit path. Errors and panics from the
//! downstream future go through the async release; if the whole request
//! future is dropped (cancellation, server shutdown), a drop guard
//! unregisters the token and revokes the slot. An idle connection is then
//! dropped straight back to the pool; one that is busy in a sub-task or has
//! an open transaction is released by a spawned task once it is free.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{MappedMutexGuard, Mutex as AsyncMutex, MutexGuard};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use crate::config::BrokerConfig;
use crate::conn::{Connection, ExecOutcome, Pool, Row, Statement};
use crate::context::{RequestContext, RequestScope};
use crate::errors::{BrokerError, BrokerResult};
use crate::tenant::{HeaderTenantResolver, RequestMetadata, Tenant, TenantResolver};
use crate::token::RequestToken;

/// A bound connection's home while its request is in flight. Emptied on
/// release, so stale handles cannot reach a recycled connection.
struct Slot<C> {
    conn: AsyncMutex<Option<C>>,
    /// Set once the request is over; no handle may use the connection after.
    revoked: AtomicBool,
    /// Bound on the rollback issued for an abandoned transaction.
    cleanup_timeout: Duration,
}

impl<C: Connection> Slot<C> {
    fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    /// Take the connection out and hand it back to the pool.
    async fn release(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            return_to_pool(conn, self.cleanup_timeout).await;
        }
    }
}

type Registry<C> = Mutex<HashMap<RequestToken, Arc<Slot<C>>>>;

pub struct ConnectionBroker<P: Pool> {
    pool: P,
    resolver: Arc<dyn TenantResolver>,
    config: BrokerConfig,
    conns: Registry<P::Conn>,
}

impl<P: Pool> ConnectionBroker<P> {
    pub fn new(pool: P) -> Self {
        Self::with_config(pool, BrokerConfig::default())
    }

    /// The default resolver reads `config.tenant_header`.
    pub fn with_config(pool: P, config: BrokerConfig) -> Self {
        Self {
            pool,
            resolver: Arc::new(HeaderTenantResolver::new(config.tenant_header.clone())),
            config,
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resolver<R>(mut self, resolver: R) -> Self
    where
        R: TenantResolver + 'static,
    {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Number of requests that currently hold a bound connection.
    pub fn bound_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Resolve the tenant for a request and run it through the tenant policy.
    pub fn resolve_tenant(&self, metadata: &dyn RequestMetadata) -> BrokerResult<Tenant> {
        let Some(tenant) = self.resolver.resolve(metadata) else {
            warn!("no tenant found");
            return Err(BrokerError::TenantMissing);
        };
        self.check_tenant(tenant)
    }

    fn check_tenant(&self, tenant: Tenant) -> BrokerResult<Tenant> {
        if let Err(reason) = self.config.policy.check(&tenant) {
            warn!(tenant = %tenant, %reason, "tenant rejected");
            return Err(BrokerError::TenantRejected { tenant, reason });
        }
        Ok(tenant)
    }

    /// Resolve the tenant from `metadata`, then [`run_for_tenant`].
    ///
    /// The metadata is only read before the returned future is created, so
    /// it does not need to outlive the call.
    ///
    /// [`run_for_tenant`]: ConnectionBroker::run_for_tenant
    pub fn bind_and_run<'a, F, Fut, T>(
        &'a self,
        ctx: &'a RequestContext,
        metadata: &dyn RequestMetadata,
        next: F,
    ) -> impl Future<Output = BrokerResult<T>> + 'a
    where
        F: FnOnce(RequestContext) -> Fut + 'a,
        Fut: Future<Output = T> + 'a,
        T: 'a,
    {
        let resolved = self.resolve_tenant(metadata);
        async move {
            let tenant = resolved?;
            self.run_bound(ctx, tenant, next).await
        }
    }

    /// Bind a connection for `tenant` and run `next` with a context that
    /// carries the binding.
    ///
    /// `next` gets a context derived from `ctx`; [`extract_connection`] with
    /// that context (or a clone of it) yields the bound connection until
    /// `next` completes. A panic in `next` is resumed after the connection
    /// has been released.
    ///
    /// The tenant goes through the configured [`TenantPolicy`] first; a
    /// rejected tenant never reaches the pool.
    ///
    /// [`extract_connection`]: ConnectionBroker::extract_connection
    /// [`TenantPolicy`]: crate::TenantPolicy
    pub async fn run_for_tenant<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        tenant: Tenant,
        next: F,
    ) -> BrokerResult<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let tenant = self.check_tenant(tenant)?;
        self.run_bound(ctx, tenant, next).await
    }

    async fn run_bound<F, Fut, T>(
        &self,
        ctx: &RequestContext,
        tenant: Tenant,
        next: F,
    ) -> BrokerResult<T>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let span = info_span!("tenant_binding", tenant = %tenant, request_token = field::Empty);
        async move {
            let conn = self.acquire(ctx, &tenant).await?;
            let conn = self.switch(ctx, &tenant, conn).await?;

            let token = RequestToken::new();
            Span::current().record("request_token", field::display(token));
            let binding = self.bind(token, conn);

            let scoped = ctx.bound(RequestScope { token, tenant });
            let outcome = AssertUnwindSafe(async move { next(scoped).await })
                .catch_unwind()
                .await;

            binding.release().await;

            match outcome {
                Ok(value) => Ok(value),
                Err(panic) => {
                    warn!("request handler panicked; connection released");
                    std::panic::resume_unwind(panic)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Look up the connection bound to the request `ctx` belongs to.
    ///
    /// Fails with [`BrokerError::NoRequestBound`] for contexts that never went
    /// through the broker and with [`BrokerError::NoConnectionBound`] when the
    /// request's connection is not (or no longer) registered.
    pub fn extract_connection(
        &self,
        ctx: &RequestContext,
    ) -> BrokerResult<BoundConnection<P::Conn>> {
        let scope = ctx.scope().ok_or(BrokerError::NoRequestBound)?;
        let slot = self
            .conns
            .lock()
            .get(&scope.token)
            .cloned()
            .ok_or(BrokerError::NoConnectionBound(scope.token))?;
        Ok(BoundConnection {
            token: scope.token,
            tenant: scope.tenant.clone(),
            slot,
        })
    }

    async fn acquire(&self, ctx: &RequestContext, tenant: &Tenant) -> BrokerResult<P::Conn> {
        info!("open new connection");
        let acquired = match ctx.deadline() {
            Some(deadline) => match timeout_at(deadline, self.pool.acquire()).await {
                Ok(acquired) => acquired,
                Err(_) => Err(anyhow!("request deadline exceeded while waiting for a connection")),
            },
            None => self.pool.acquire().await,
        };
        acquired.map_err(|source| {
            warn!(error = %source, "failed to open connection");
            BrokerError::ConnectionAcquisitionFailed {
                tenant: tenant.clone(),
                source,
            }
        })
    }

    async fn switch(
        &self,
        ctx: &RequestContext,
        tenant: &Tenant,
        mut conn: P::Conn,
    ) -> BrokerResult<P::Conn> {
        info!("change the tenant");
        let stmt = self.config.schema_switch.statement(tenant);
        let switch_deadline = Instant::now() + self.config.switch_timeout;
        let (deadline, request_bound) = match ctx.deadline() {
            Some(request) if request < switch_deadline => (request, true),
            _ => (switch_deadline, false),
        };

        let switched = timeout_at(deadline, conn.execute(&stmt)).await;
        let source = match switched {
            Ok(Ok(_)) => return Ok(conn),
            Ok(Err(err)) => err,
            Err(_) if request_bound => anyhow!("request deadline exceeded during the tenant switch"),
            Err(_) => anyhow!(
                "tenant switch did not finish within {:?}",
                self.config.switch_timeout
            ),
        };
        warn!(error = %source, "failed to change the tenant");

        // The session may be half-switched: never let it be reused as is.
        match timeout(self.config.switch_timeout, conn.discard()).await {
            Ok(Ok(())) => debug!("discarded the connection"),
            Ok(Err(err)) => warn!(error = %err, "failed to properly discard the connection"),
            Err(_) => warn!("discarding the connection timed out; dropped it"),
        }
        Err(BrokerError::TenantSwitchFailed {
            tenant: tenant.clone(),
            source,
        })
    }

    fn bind(&self, token: RequestToken, conn: P::Conn) -> Binding<'_, P::Conn> {
        debug!("bind the connection");
        let slot = Arc::new(Slot {
            conn: AsyncMutex::new(Some(conn)),
            revoked: AtomicBool::new(false),
            cleanup_timeout: self.config.switch_timeout,
        });
        let previous = self.conns.lock().insert(token, Arc::clone(&slot));
        debug_assert!(previous.is_none(), "request token reused");
        Binding {
            registry: &self.conns,
            token,
            slot: Some(slot),
        }
    }
}

impl<P: Pool> fmt::Debug for ConnectionBroker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionBroker")
            .field("config", &self.config)
            .field("bound", &self.bound_count())
            .finish()
    }
}

/// Owns a registry entry for the duration of one request.
struct Binding<'b, C: Connection> {
    registry: &'b Registry<C>,
    token: RequestToken,
    slot: Option<Arc<Slot<C>>>,
}

impl<C: Connection> Binding<'_, C> {
    async fn release(mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        self.unbind(&slot);
        // Waits for a sub-task that is mid-statement on the connection.
        slot.release().await;
    }

    fn unbind(&self, slot: &Slot<C>) {
        debug!(request_token = %self.token, "unbind the request token");
        self.registry.lock().remove(&self.token);
        slot.revoke();
    }
}

impl<C: Connection> Drop for Binding<'_, C> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        self.unbind(&slot);
        warn!("request dropped before completion; returning the connection to the pool");

        let idle = slot.conn.try_lock().ok().and_then(|mut guard| {
            if guard.as_ref().is_some_and(|conn| conn.in_transaction()) {
                None
            } else {
                Some(guard.take())
            }
        });
        if let Some(conn) = idle {
            drop(conn);
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { slot.release().await });
            }
            // Without a runtime the last handle drops the connection.
            Err(_) => warn!("no runtime to release the connection on"),
        }
    }
}

/// Roll back a transaction the request left open, then close. A connection
/// whose rollback fails is discarded instead.
async fn return_to_pool<C: Connection>(mut conn: C, cleanup_timeout: Duration) {
    if conn.in_transaction() {
        warn!("rolling back a transaction left open by the request");
        let rolled_back = timeout(cleanup_timeout, conn.execute(&Statement::new("ROLLBACK"))).await;
        match rolled_back {
            Ok(Ok(_)) => conn.set_in_transaction(false),
            Ok(Err(err)) => warn!(error = %err, "rollback failed"),
            Err(_) => warn!("rollback timed out"),
        }
        if conn.in_transaction() {
            debug!("discard the connection");
            if let Err(err) = conn.discard().await {
                warn!(error = %err, "failed to properly discard the connection");
            }
            return;
        }
    }
    info!("close the connection");
    if let Err(err) = conn.close().await {
        warn!(error = %err, "failed to properly close the connection");
    }
}

/// Handle to the connection bound to one request.
///
/// Cheap to clone and safe to share between tasks of the same request.
/// [`BoundConnection::lock`] serializes access to the single physical
/// connection. Once the request is released, every handle fails with
/// [`BrokerError::NoConnectionBound`].
pub struct BoundConnection<C> {
    token: RequestToken,
    tenant: Tenant,
    slot: Arc<Slot<C>>,
}

impl<C: Connection> BoundConnection<C> {
    pub fn token(&self) -> RequestToken {
        self.token
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    /// Exclusive access to the connection until the guard is dropped.
    ///
    /// Fails once the request is over, including a request that was
    /// cancelled while this handle was still around.
    pub async fn lock(&self) -> BrokerResult<MappedMutexGuard<'_, C>> {
        let mut guard = self.slot.conn.lock().await;
        if self.slot.is_revoked() {
            if let Some(conn) = guard.take() {
                drop(guard);
                return_to_pool(conn, self.slot.cleanup_timeout).await;
            }
            return Err(BrokerError::NoConnectionBound(self.token));
        }
        MutexGuard::try_map(guard, Option::as_mut)
            .map_err(|_| BrokerError::NoConnectionBound(self.token))
    }

    pub async fn execute(&self, stmt: &Statement) -> anyhow::Result<ExecOutcome> {
        let mut conn = self.lock().await?;
        conn.execute(stmt).await
    }

    pub async fn query(&self, stmt: &Statement) -> anyhow::Result<Vec<Row>> {
        let mut conn = self.lock().await?;
        conn.query(stmt).await
    }
}

impl<C> Clone for BoundConnection<C> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            tenant: self.tenant.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<C> fmt::Debug for BoundConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundConnection")
            .field("token", &self.token)
            .field("tenant", &self.tenant)
            .finish()
    }
}
