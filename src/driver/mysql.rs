//! sqlx-backed MySQL driver.
//!
//! sqlx has no server-pushed error event stream, so the error channel the
//! reconnect supervisor listens on is synthesized from a periodic ping probe:
//! a failed ping surfaces as a protocol-lost event and triggers reconnection.
//! Pooled sessions skip the probe - the pool tests connections before each
//! checkout instead.

use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{ConnectOptions, Connection as _, MySql};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;

use crate::driver::{Connection, Driver, Pool, PooledConnection};
use crate::error::DriverError;

/// Default interval between liveness pings on a shared connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// MySQL [`Driver`] backed by sqlx.
#[derive(Debug, Clone)]
pub struct MySqlDriver {
    ping_interval: Duration,
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlDriver {
    pub fn new() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// Override the liveness-ping interval for dedicated connections.
    pub fn with_ping_interval(ping_interval: Duration) -> Self {
        Self { ping_interval }
    }
}

impl Driver for MySqlDriver {
    type Config = MySqlConnectOptions;
    type Connection = MySqlSession;
    type Pool = MySqlDbPool;

    async fn connect(&self, config: &MySqlConnectOptions) -> Result<MySqlSession, DriverError> {
        let conn = config.connect().await?;
        Ok(MySqlSession {
            conn: Mutex::new(Some(conn)),
            ping_interval: self.ping_interval,
        })
    }

    fn create_pool(&self, config: &MySqlConnectOptions) -> Result<MySqlDbPool, DriverError> {
        // connect_lazy_with performs no I/O; the first checkout connects.
        let pool = MySqlPoolOptions::new()
            .test_before_acquire(true)
            .connect_lazy_with(config.clone());
        Ok(MySqlDbPool { pool })
    }
}

/// A dedicated MySQL session.
///
/// The inner connection is `None` once the session has ended.
pub struct MySqlSession {
    conn: Mutex<Option<MySqlConnection>>,
    ping_interval: Duration,
}

impl MySqlSession {
    /// Exclusive access to the underlying connection for running queries.
    pub async fn lock(&self) -> MutexGuard<'_, Option<MySqlConnection>> {
        self.conn.lock().await
    }
}

impl Connection for MySqlSession {
    async fn end(&self) -> Result<(), DriverError> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.close().await?;
        }
        Ok(())
    }

    async fn recv_error(&self) -> Option<DriverError> {
        let mut ticker = tokio::time::interval(self.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let mut guard = self.conn.lock().await;
            match guard.as_mut() {
                // Session ended; no further events can arrive.
                None => return None,
                Some(conn) => {
                    if let Err(err) = conn.ping().await {
                        return Some(DriverError::from(err));
                    }
                }
            }
        }
    }
}

/// MySQL connection pool.
#[derive(Debug, Clone)]
pub struct MySqlDbPool {
    pool: MySqlPool,
}

impl MySqlDbPool {
    /// The underlying sqlx pool.
    pub fn inner(&self) -> &MySqlPool {
        &self.pool
    }
}

impl Pool for MySqlDbPool {
    type Pooled = MySqlPooledSession;

    async fn acquire(&self) -> Result<MySqlPooledSession, DriverError> {
        let conn = self.pool.acquire().await?;
        Ok(MySqlPooledSession {
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// A MySQL connection checked out of the pool.
pub struct MySqlPooledSession {
    conn: Mutex<Option<PoolConnection<MySql>>>,
}

impl MySqlPooledSession {
    /// Exclusive access to the underlying connection for running queries.
    pub async fn lock(&self) -> MutexGuard<'_, Option<PoolConnection<MySql>>> {
        self.conn.lock().await
    }
}

impl Connection for MySqlPooledSession {
    async fn end(&self) -> Result<(), DriverError> {
        // Dropping the handle returns it to the pool.
        self.conn.lock().await.take();
        Ok(())
    }

    async fn recv_error(&self) -> Option<DriverError> {
        // Pooled sessions are health-checked by the pool at checkout.
        std::future::pending().await
    }
}

impl PooledConnection for MySqlPooledSession {
    async fn release(&self) {
        self.conn.lock().await.take();
    }
}
