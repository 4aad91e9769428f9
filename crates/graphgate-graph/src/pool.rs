//! Bounded pool of backend sessions with lifetime limits and endpoint failover.
//!
//! All bookkeeping lives in one `parking_lot` mutex that is never held across
//! an await. Opening, pinging, and closing sessions happen outside it; only
//! the resulting state transition is applied under the lock, re-checking the
//! state at that moment. Waiters park on a [`Notify`] until a slot frees up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use graphgate_core::{AccessConfig, AccessError, Result};

use crate::session::{DetachedSession, GraphSession, SessionFactory};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    pub acquisition_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    /// Ordered: earlier endpoints are preferred, later ones are failover targets.
    pub endpoints: Vec<String>,
}

impl PoolConfig {
    pub fn from_access_config(config: &AccessConfig) -> Self {
        Self {
            max_size: config.max_pool_size,
            acquisition_timeout: config.acquisition_timeout,
            max_lifetime: config.max_connection_lifetime,
            idle_timeout: config.idle_timeout,
            endpoints: config.endpoints.clone(),
        }
    }
}

// ── Connections ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InUse,
    Retiring,
    Closed,
}

/// A live session plus the metadata the pool needs to manage it.
struct Connection {
    id: Uuid,
    endpoint: String,
    created_at: Instant,
    last_used_at: Instant,
    state: ConnectionState,
    use_count: u64,
    session: Box<dyn GraphSession>,
}

impl Connection {
    fn new(endpoint: String, session: Box<dyn GraphSession>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            endpoint,
            created_at: now,
            last_used_at: now,
            state: ConnectionState::Idle,
            use_count: 0,
            session,
        }
    }

    fn checkout(&mut self) {
        self.state = ConnectionState::InUse;
        self.last_used_at = Instant::now();
        self.use_count += 1;
    }

    /// Why an idle connection must not be handed out again, if it must not.
    fn expiry(&self, config: &PoolConfig, now: Instant) -> Option<&'static str> {
        if now.duration_since(self.created_at) > config.max_lifetime {
            Some("max_lifetime")
        } else if now.duration_since(self.last_used_at) > config.idle_timeout {
            Some("idle_timeout")
        } else {
            None
        }
    }

    fn close(mut self, reason: &str) {
        let from = std::mem::replace(&mut self.state, ConnectionState::Closed);
        tracing::debug!(
            connection = %self.id,
            endpoint = %self.endpoint,
            from = ?from,
            uses = self.use_count,
            reason,
            "Closed connection"
        );
    }
}

/// A connection checked out of the pool. Dropping it releases the connection
/// exactly once: back to idle, or closed if it was retired or has expired.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    id: Uuid,
    endpoint: String,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u64,
    retire: bool,
    /// Checked out by the health probe rather than a caller.
    probing: bool,
    session: Box<dyn GraphSession>,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, conn: Connection) -> Self {
        Self {
            pool,
            id: conn.id,
            endpoint: conn.endpoint,
            created_at: conn.created_at,
            last_used_at: conn.last_used_at,
            use_count: conn.use_count,
            retire: false,
            probing: false,
            session: conn.session,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn state(&self) -> ConnectionState {
        if self.retire {
            ConnectionState::Retiring
        } else {
            ConnectionState::InUse
        }
    }

    pub fn session(&mut self) -> &mut dyn GraphSession {
        self.session.as_mut()
    }

    /// Discard instead of returning to idle on release. Used when the
    /// session's server-side state can no longer be trusted.
    pub fn retire(&mut self) {
        self.retire = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let session = std::mem::replace(&mut self.session, Box::new(DetachedSession));
        let conn = Connection {
            id: self.id,
            endpoint: std::mem::take(&mut self.endpoint),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            state: ConnectionState::InUse,
            use_count: self.use_count,
            session,
        };
        self.pool.release(conn, self.retire, !self.probing);
    }
}

// ── Pool State ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct EndpointHealth {
    uri: String,
    healthy: bool,
    failures: u64,
}

struct PoolState {
    idle: VecDeque<Connection>,
    in_use: usize,
    /// Slots reserved by acquirers that are opening a new session.
    opening: usize,
    endpoints: Vec<EndpointHealth>,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use + self.opening
    }

    fn is_healthy(&self, endpoint: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.uri == endpoint && e.healthy)
    }

    /// Healthy endpoints in preference order, `hint` first when healthy.
    fn candidates(&self, hint: Option<&str>) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.endpoints.len());
        if let Some(h) = hint.filter(|h| self.is_healthy(h)) {
            out.push(h.to_string());
        }
        for e in &self.endpoints {
            if e.healthy && Some(e.uri.as_str()) != hint {
                out.push(e.uri.clone());
            }
        }
        out
    }

    fn take_idle(&mut self, hint: Option<&str>) -> Option<Connection> {
        let pos = hint
            .and_then(|h| self.idle.iter().position(|c| c.endpoint == h))
            .or_else(|| {
                self.idle
                    .iter()
                    .position(|c| self.endpoints.iter().any(|e| e.uri == c.endpoint && e.healthy))
            })?;
        self.idle.remove(pos)
    }

    /// Remove idle connections matching `pred`.
    fn drain_idle(&mut self, mut pred: impl FnMut(&Connection) -> bool) -> Vec<Connection> {
        let mut drained = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for conn in self.idle.drain(..) {
            if pred(&conn) {
                drained.push(conn);
            } else {
                kept.push_back(conn);
            }
        }
        self.idle = kept;
        drained
    }

    fn unhealthy(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|e| !e.healthy)
            .map(|e| e.uri.clone())
            .collect()
    }
}

// ── Statistics ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    retired: AtomicU64,
    acquire_timeouts: AtomicU64,
    failovers: AtomicU64,
    endpoint_restores: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub closed: u64,
    pub retired: u64,
    pub acquire_timeouts: u64,
    pub failovers: u64,
    pub endpoint_restores: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolHealth {
    pub idle_count: usize,
    pub in_use_count: usize,
    pub max_size: usize,
    pub unhealthy_endpoints: Vec<String>,
    pub closed: bool,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub endpoints_restored: usize,
    pub pings_failed: usize,
    pub reaped: usize,
}

// ── Pool ─────────────────────────────────────────────────────────

enum Step {
    Reuse(Connection),
    Open(Vec<String>),
    Wait,
}

/// Releases a reserved opening slot unless the new connection was handed out.
struct OpeningSlot<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl Drop for OpeningSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().opening -= 1;
            self.pool.available.notify_waiters();
        }
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    available: Notify,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Arc<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(|uri| EndpointHealth {
                uri: uri.clone(),
                healthy: true,
                failures: 0,
            })
            .collect();
        tracing::info!(
            max_size = config.max_size,
            endpoints = ?config.endpoints,
            "Connection pool created"
        );
        Arc::new(Self {
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                in_use: 0,
                opening: 0,
                endpoints,
                closed: false,
            }),
            available: Notify::new(),
            counters: PoolCounters::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out a connection, preferring `endpoint_hint` when it is healthy.
    ///
    /// Waits up to `acquisition_timeout` for an idle connection or free
    /// capacity. Connection failures while opening fail over to the next
    /// healthy endpoint; when none remains the result is `BackendUnavailable`.
    pub async fn acquire(self: &Arc<Self>, endpoint_hint: Option<&str>) -> Result<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.config.acquisition_timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, expired) = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(AccessError::ShuttingDown);
                }
                let now = Instant::now();
                let expired = state.drain_idle(|c| c.expiry(&self.config, now).is_some());

                let step = if let Some(mut conn) = state.take_idle(endpoint_hint) {
                    conn.checkout();
                    state.in_use += 1;
                    Step::Reuse(conn)
                } else if state.total() < self.config.max_size {
                    let candidates = state.candidates(endpoint_hint);
                    if candidates.is_empty() {
                        return Err(AccessError::BackendUnavailable {
                            endpoints: state.unhealthy(),
                        });
                    }
                    state.opening += 1;
                    Step::Open(candidates)
                } else {
                    Step::Wait
                };
                (step, expired)
            };

            for conn in expired {
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
                conn.close("expired");
            }

            match step {
                Step::Reuse(conn) => {
                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledConnection::new(self.clone(), conn));
                }
                Step::Open(candidates) => return self.open(candidates, deadline).await,
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                        let waited_ms = started.elapsed().as_millis() as u64;
                        tracing::warn!(waited_ms, "Connection pool exhausted");
                        return Err(AccessError::PoolExhausted { waited_ms });
                    }
                }
            }
        }
    }

    async fn open(
        self: &Arc<Self>,
        candidates: Vec<String>,
        deadline: Instant,
    ) -> Result<PooledConnection> {
        let mut slot = OpeningSlot {
            pool: self,
            armed: true,
        };

        for endpoint in candidates {
            match tokio::time::timeout_at(deadline, self.factory.connect(&endpoint)).await {
                Ok(Ok(session)) => {
                    let mut conn = Connection::new(endpoint, session);
                    conn.checkout();
                    {
                        let mut state = self.state.lock();
                        state.opening -= 1;
                        slot.armed = false;
                        if state.closed {
                            drop(state);
                            self.available.notify_waiters();
                            conn.close("shutdown");
                            return Err(AccessError::ShuttingDown);
                        }
                        state.in_use += 1;
                    }
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(connection = %conn.id, endpoint = %conn.endpoint, "Opened connection");
                    return Ok(PooledConnection::new(self.clone(), conn));
                }
                Ok(Err(e)) => {
                    self.mark_unhealthy(&endpoint, &e.to_string());
                }
                Err(_) => {
                    self.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(AccessError::PoolExhausted {
                        waited_ms: self.config.acquisition_timeout.as_millis() as u64,
                    });
                }
            }
        }

        let endpoints = self.state.lock().unhealthy();
        Err(AccessError::BackendUnavailable { endpoints })
    }

    /// Return a connection. Never blocks on I/O. `touch` restarts the idle
    /// clock; health probes leave it running.
    fn release(&self, mut conn: Connection, retire: bool, touch: bool) {
        let now = Instant::now();
        let discard = {
            let mut state = self.state.lock();
            state.in_use -= 1;
            let reason = if state.closed {
                Some("shutdown")
            } else if retire {
                Some("retired")
            } else if !state.is_healthy(&conn.endpoint) {
                Some("endpoint_unhealthy")
            } else {
                conn.expiry(&self.config, now)
            };
            match reason {
                None => {
                    conn.state = ConnectionState::Idle;
                    if touch {
                        conn.last_used_at = now;
                    }
                    state.idle.push_back(conn);
                    None
                }
                Some(reason) => Some((conn, reason)),
            }
        };
        self.available.notify_waiters();

        if let Some((mut conn, reason)) = discard {
            if retire {
                conn.state = ConnectionState::Retiring;
                self.counters.retired.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            conn.close(reason);
        }
    }

    /// Route new acquisitions away from `endpoint` and drop its idle sessions.
    pub fn mark_unhealthy(&self, endpoint: &str, reason: &str) {
        let (dropped, newly_unhealthy) = {
            let mut state = self.state.lock();
            let mut newly_unhealthy = false;
            if let Some(e) = state.endpoints.iter_mut().find(|e| e.uri == endpoint) {
                newly_unhealthy = e.healthy;
                e.healthy = false;
                e.failures += 1;
            }
            (state.drain_idle(|c| c.endpoint == endpoint), newly_unhealthy)
        };
        if newly_unhealthy {
            self.counters.failovers.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(endpoint, reason, "Endpoint marked unhealthy, failing over");
        }
        for conn in dropped {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            conn.close("endpoint_unhealthy");
        }
    }

    /// Try every unhealthy endpoint and restore the reachable ones. A probe
    /// session that answers is kept as an idle connection when there is room.
    pub async fn probe_unhealthy(&self) -> usize {
        let targets = self.state.lock().unhealthy();
        let mut restored = 0;

        for endpoint in targets {
            let probe = async {
                let mut session = self.factory.connect(&endpoint).await?;
                session.ping().await?;
                Ok::<_, crate::session::BackendError>(session)
            };
            let session = match tokio::time::timeout(self.config.acquisition_timeout, probe).await {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "Endpoint still unreachable");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(endpoint = %endpoint, "Endpoint probe timed out");
                    continue;
                }
            };

            let leftover = {
                let mut state = self.state.lock();
                if let Some(e) = state.endpoints.iter_mut().find(|e| e.uri == endpoint) {
                    e.healthy = true;
                }
                let conn = Connection::new(endpoint.clone(), session);
                if !state.closed && state.total() < self.config.max_size {
                    state.idle.push_back(conn);
                    None
                } else {
                    Some(conn)
                }
            };
            self.available.notify_waiters();

            match leftover {
                Some(conn) => conn.close("pool_full"),
                None => {
                    self.counters.created.fetch_add(1, Ordering::Relaxed);
                }
            }
            restored += 1;
            self.counters.endpoint_restores.fetch_add(1, Ordering::Relaxed);
            tracing::info!(endpoint = %endpoint, "Endpoint restored");
        }
        restored
    }

    /// Ping every idle connection. Each is checked out under the lock, pinged
    /// outside it, and handed back through the normal release path.
    pub async fn ping_idle(self: &Arc<Self>) -> usize {
        let checked_out: Vec<PooledConnection> = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            let conns: Vec<Connection> = state.idle.drain(..).collect();
            state.in_use += conns.len();
            conns
        }
        .into_iter()
        .map(|mut conn| {
            conn.state = ConnectionState::InUse;
            let mut pooled = PooledConnection::new(self.clone(), conn);
            pooled.probing = true;
            pooled
        })
        .collect();

        let mut failed = 0;
        for mut conn in checked_out {
            let outcome =
                tokio::time::timeout(self.config.acquisition_timeout, conn.session().ping()).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    conn.retire();
                    if e.is_connection() {
                        self.mark_unhealthy(conn.endpoint(), &e.to_string());
                    }
                }
                Err(_) => {
                    failed += 1;
                    conn.retire();
                }
            }
        }
        failed
    }

    /// Close idle connections past their lifetime or idle timeout.
    pub fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let expired = self
            .state
            .lock()
            .drain_idle(|c| c.expiry(&self.config, now).is_some());
        let n = expired.len();
        for conn in expired {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            conn.close("expired");
        }
        if n > 0 {
            tracing::debug!(reaped = n, "Reaped idle connections");
        }
        n
    }

    /// One background pass: restore endpoints, ping idle sessions, reap.
    pub async fn maintain(self: &Arc<Self>) -> MaintenanceReport {
        let endpoints_restored = self.probe_unhealthy().await;
        let pings_failed = self.ping_idle().await;
        let reaped = self.reap_idle();
        MaintenanceReport {
            endpoints_restored,
            pings_failed,
            reaped,
        }
    }

    /// Refuse new acquisitions and close every idle connection. Checked-out
    /// connections are closed as they are released.
    pub fn close(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.available.notify_waiters();
        let n = idle.len();
        for conn in idle {
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            conn.close("shutdown");
        }
        tracing::info!(closed_idle = n, "Connection pool closed");
    }

    pub fn health(&self) -> PoolHealth {
        let state = self.state.lock();
        PoolHealth {
            idle_count: state.idle.len(),
            in_use_count: state.in_use,
            max_size: self.config.max_size,
            unhealthy_endpoints: state.unhealthy(),
            closed: state.closed,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            created: c.created.load(Ordering::Relaxed),
            reused: c.reused.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            retired: c.retired.load(Ordering::Relaxed),
            acquire_timeouts: c.acquire_timeouts.load(Ordering::Relaxed),
            failovers: c.failovers.load(Ordering::Relaxed),
            endpoint_restores: c.endpoint_restores.load(Ordering::Relaxed),
        }
    }

    /// Failure count per endpoint, in configured order.
    pub fn endpoint_failures(&self) -> Vec<(String, u64)> {
        self.state
            .lock()
            .endpoints
            .iter()
            .map(|e| (e.uri.clone(), e.failures))
            .collect()
    }
}
