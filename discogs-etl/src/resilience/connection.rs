use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use discogs_config::shared::{HealthCheckConfig, ResilienceConfig};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{
    DEPENDENCY_LABEL, DISCOGS_CONNECTION_HEALTHY, DISCOGS_CONNECTIONS_ESTABLISHED_TOTAL,
};
use crate::resilience::{CircuitBreaker, CircuitBreakerSnapshot, RetryPolicy, retry_with_backoff};

/// Utilization of a connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: u32,
    pub max_connections: u32,
}

impl PoolStatus {
    /// Connections checked out, in use by an operation.
    pub fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle)
    }
}

/// Establishes and probes connections to one dependency.
pub trait Connector: Send + Sync + 'static {
    /// Handle used by operations. Cloning must be cheap, typically a pool or a shared client.
    type Connection: Clone + Send + Sync + 'static;

    /// Name of the dependency, used in logs, metrics and health reports.
    fn name(&self) -> &str;

    fn connect(&self) -> impl Future<Output = EtlResult<Self::Connection>> + Send;

    /// Runs a cheap no-op round trip, such as a ping or `SELECT 1`.
    fn probe(&self, connection: &Self::Connection) -> impl Future<Output = EtlResult<()>> + Send;

    /// Releases a connection that is being replaced.
    fn close(&self, _connection: Self::Connection) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn pool_status(&self, _connection: &Self::Connection) -> Option<PoolStatus> {
        None
    }
}

/// Health of a managed connection, rendered by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub name: String,
    pub healthy: bool,
    pub connected: bool,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub pool: Option<PoolStatus>,
    pub connections_established: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct HealthState {
    healthy: bool,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Inner<C: Connector> {
    connector: C,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    connect_timeout: Duration,
    operation_timeout: Duration,
    health_check: HealthCheckConfig,
    connection: RwLock<Option<C::Connection>>,
    connections_established: AtomicU64,
    health: Mutex<HealthState>,
}

/// A connection guarded by a circuit breaker, retried with backoff and re-established on
/// failure.
///
/// Every operation runs through [`ResilientConnection::execute`]: the breaker is consulted,
/// the connection is established lazily, the call is bounded by the operation timeout and
/// transient failures drop the connection so the next attempt reconnects.
pub struct ResilientConnection<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ResilientConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ResilientConnection<C> {
    pub fn new(connector: C, config: &ResilienceConfig) -> Self {
        let breaker = CircuitBreaker::new(connector.name(), config.circuit_breaker.clone());

        Self {
            inner: Arc::new(Inner {
                connector,
                breaker,
                retry: RetryPolicy::from_config(&config.retry),
                connect_timeout: config.connect_timeout(),
                operation_timeout: config.operation_timeout(),
                health_check: config.health_check.clone(),
                connection: RwLock::new(None),
                connections_established: AtomicU64::new(0),
                health: Mutex::new(HealthState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.connector.name()
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Runs `operation` with retries on transient failures.
    ///
    /// An open breaker fails fast with [`ErrorKind::CircuitOpen`] instead of waiting.
    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> EtlResult<T>
    where
        F: Fn(C::Connection) -> Fut,
        Fut: Future<Output = EtlResult<T>>,
    {
        retry_with_backoff(
            &self.inner.retry,
            operation_name,
            EtlError::is_transient,
            |_| self.execute_once(&operation),
        )
        .await
    }

    /// Runs `operation` once through the breaker.
    pub async fn execute_once<T, F, Fut>(&self, operation: &F) -> EtlResult<T>
    where
        F: Fn(C::Connection) -> Fut,
        Fut: Future<Output = EtlResult<T>>,
    {
        let permit = self.inner.breaker.try_acquire()?;

        let result = match self.connection().await {
            Ok(connection) => {
                match tokio::time::timeout(self.inner.operation_timeout, operation(connection)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(etl_error!(
                        ErrorKind::OperationTimedOut,
                        "Operation exceeded its deadline",
                        format!(
                            "{} did not answer within {}ms",
                            self.name(),
                            self.inner.operation_timeout.as_millis()
                        )
                    )),
                }
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => {
                permit.success();
                self.mark_healthy();
            }
            Err(err) if err.is_transient() => {
                permit.failure();
                self.mark_unhealthy(err);
                self.invalidate().await;
            }
            // The dependency answered, the request itself was rejected.
            Err(_) => permit.success(),
        }

        result
    }

    /// Returns the current connection, establishing it if needed.
    pub async fn connection(&self) -> EtlResult<C::Connection> {
        if let Some(connection) = self.inner.connection.read().await.as_ref() {
            return Ok(connection.clone());
        }

        let mut slot = self.inner.connection.write().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection =
            match tokio::time::timeout(self.inner.connect_timeout, self.inner.connector.connect())
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(etl_error!(
                        ErrorKind::OperationTimedOut,
                        "Connection attempt exceeded its deadline",
                        format!(
                            "{} did not accept a connection within {}ms",
                            self.name(),
                            self.inner.connect_timeout.as_millis()
                        )
                    ));
                }
            };

        let established = self.inner.connections_established.fetch_add(1, Ordering::Relaxed) + 1;
        counter!(DISCOGS_CONNECTIONS_ESTABLISHED_TOTAL, DEPENDENCY_LABEL => self.name().to_string())
            .increment(1);
        if established > 1 {
            info!(dependency = %self.name(), reconnects = established - 1, "reconnected");
        } else {
            info!(dependency = %self.name(), "connected");
        }

        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Drops the current connection. The next operation reconnects.
    pub async fn invalidate(&self) {
        let connection = self.inner.connection.write().await.take();
        if let Some(connection) = connection {
            debug!(dependency = %self.name(), "dropping connection");
            self.inner.connector.close(connection).await;
        }
    }

    /// Probes the dependency once, reconnecting when needed.
    ///
    /// The probe goes through the breaker, so an open breaker is retried by the probe once its
    /// recovery window elapsed.
    pub async fn check_health(&self) -> bool {
        let probe_timeout = self.inner.health_check.timeout();

        let result = match self.inner.breaker.try_acquire() {
            Ok(permit) => {
                let result = match self.connection().await {
                    Ok(connection) => match tokio::time::timeout(
                        probe_timeout,
                        self.inner.connector.probe(&connection),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(etl_error!(
                            ErrorKind::OperationTimedOut,
                            "Health probe exceeded its deadline",
                            self.name().to_string()
                        )),
                    },
                    Err(err) => Err(err),
                };

                match &result {
                    Ok(()) => permit.success(),
                    Err(_) => permit.failure(),
                }

                result
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.mark_healthy();
                true
            }
            Err(err) => {
                warn!(dependency = %self.name(), error = %err.description(), detail = ?err.detail(), "health probe failed");
                self.mark_unhealthy(&err);
                if err.kind() != ErrorKind::CircuitOpen {
                    self.invalidate().await;
                }
                false
            }
        }
    }

    /// Spawns the periodic health probe. Stops on shutdown.
    pub fn spawn_health_monitor(&self, mut shutdown_rx: ShutdownRx) -> JoinHandle<()> {
        let this = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.inner.health_check.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately, the connection was just established.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        debug!(dependency = %this.name(), "health monitor stopped due to shutdown");
                        return;
                    }

                    _ = ticker.tick() => {
                        this.check_health().await;
                    }
                }
            }
        })
    }

    pub fn health(&self) -> ConnectionHealth {
        let state = self.lock_health();
        let connection = self.inner.connection.try_read().ok();
        let connected = connection
            .as_ref()
            .map(|slot| slot.is_some())
            .unwrap_or(true);
        let pool = connection.as_ref().and_then(|slot| {
            slot.as_ref()
                .and_then(|connection| self.inner.connector.pool_status(connection))
        });

        ConnectionHealth {
            name: self.name().to_string(),
            healthy: state.healthy,
            connected,
            circuit_breaker: self.inner.breaker.snapshot(),
            pool,
            connections_established: self.inner.connections_established.load(Ordering::Relaxed),
            last_check: state.last_check,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn close(&self) {
        self.invalidate().await;
        info!(dependency = %self.name(), "connection closed");
    }

    fn mark_healthy(&self) {
        let mut state = self.lock_health();
        state.healthy = true;
        state.last_check = Some(Utc::now());
        state.last_error = None;
        gauge!(DISCOGS_CONNECTION_HEALTHY, DEPENDENCY_LABEL => self.name().to_string()).set(1.0);
    }

    fn mark_unhealthy(&self, err: &EtlError) {
        let mut state = self.lock_health();
        state.healthy = false;
        state.last_check = Some(Utc::now());
        state.last_error = Some(format!(
            "{}: {}",
            err.description(),
            err.detail().unwrap_or_default()
        ));
        gauge!(DISCOGS_CONNECTION_HEALTHY, DEPENDENCY_LABEL => self.name().to_string()).set(0.0);
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthState> {
        self.inner
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use discogs_config::shared::{CircuitBreakerConfig, RetryConfig};

    use super::*;
    use crate::resilience::CircuitState;

    /// Connector whose connections fail while `down` is set.
    #[derive(Clone, Default)]
    struct FlakyConnector {
        down: Arc<std::sync::atomic::AtomicBool>,
        connects: Arc<AtomicU32>,
    }

    impl Connector for FlakyConnector {
        type Connection = u32;

        fn name(&self) -> &str {
            "flaky"
        }

        async fn connect(&self) -> EtlResult<u32> {
            if self.down.load(Ordering::SeqCst) {
                return Err(etl_error!(ErrorKind::SinkConnectionFailed, "Refused"));
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn probe(&self, _connection: &u32) -> EtlResult<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(etl_error!(ErrorKind::SinkConnectionFailed, "Ping failed"));
            }
            Ok(())
        }
    }

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 500,
                backoff_base: 2.0,
                max_delay_ms: 30_000,
                jitter_percent: 0,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout_ms: 30_000,
                recovery_jitter_percent: 0,
                recovery_backoff_multiplier: 1.0,
                max_recovery_timeout_ms: 30_000,
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_reconnects() {
        let connector = FlakyConnector::default();
        let connection = ResilientConnection::new(connector.clone(), &config());
        let calls = Arc::new(AtomicU32::new(0));

        let seen = connection
            .execute("write", |conn| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(etl_error!(ErrorKind::SinkConnectionFailed, "Connection reset"))
                    } else {
                        Ok(conn)
                    }
                }
            })
            .await
            .unwrap();

        // The failed attempt dropped connection 1, the retry used a fresh one.
        assert_eq!(seen, 2);
        assert_eq!(connection.health().connections_established, 2);
        assert!(connection.health().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried_and_keeps_breaker_closed() {
        let connection = ResilientConnection::new(FlakyConnector::default(), &config());
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let calls = calls.clone();
            let err = connection
                .execute("write", move |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(etl_error!(ErrorKind::SinkQueryFailed, "Syntax error"))
                    }
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::SinkQueryFailed);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(connection.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_opens_breaker_and_probe_recovers() {
        let connector = FlakyConnector::default();
        connector.down.store(true, Ordering::SeqCst);
        let connection = ResilientConnection::new(connector.clone(), &config());

        // Two operations of three attempts each exceed the threshold of five.
        for _ in 0..2 {
            let _ = connection.execute("write", |_| async { Ok(()) }).await;
        }
        assert_eq!(connection.breaker().state(), CircuitState::Open);

        let err = connection
            .execute("write", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(!connection.check_health().await);

        connector.down.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert!(connection.check_health().await);
        assert_eq!(connection.breaker().state(), CircuitState::Closed);
        assert!(connection.health().healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_times_out() {
        let mut config = config();
        config.operation_timeout_ms = 1_000;
        config.retry.max_attempts = 1;
        let connection = ResilientConnection::new(FlakyConnector::default(), &config);

        let err = connection
            .execute("write", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        let source = std::error::Error::source(&err)
            .and_then(|source| source.downcast_ref::<EtlError>())
            .unwrap();
        assert_eq!(source.kind(), ErrorKind::OperationTimedOut);
    }
}
