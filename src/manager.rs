//! Process-scoped strategy state.
//!
//! A `ConnectionManager` owns everything one middleware instance needs:
//! driver, driver config, the chosen strategy, and the strategy's long-lived
//! state. Managers are self-contained, so several with different strategies
//! can coexist in one process without cross-talk.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{BindOptions, ConnectionStrategy};
use crate::driver::{Connection, Driver, Pool};
use crate::error::ConfigError;
use crate::reconnect::{
    ReconnectStats, Reconnector, SharedConnection, SupervisionChannel, handle_channel,
};
use crate::source::ConnectionSource;

enum StrategyState<D: Driver> {
    Single {
        shared: SharedConnection<D>,
        stats: Arc<ReconnectStats>,
        /// Taken on shutdown; `None` afterwards.
        task: std::sync::Mutex<Option<JoinHandle<()>>>,
    },
    Pool(Arc<D::Pool>),
    Request,
}

/// Process-scoped holder of the driver, its config, and the active strategy.
///
/// Construction performs the strategy's eager side effects: the single
/// strategy spawns the reconnect supervisor (which opens the first
/// connection), the pool strategy creates the pool, the request strategy does
/// nothing. Construct inside a tokio runtime.
pub struct ConnectionManager<D: Driver> {
    driver: Arc<D>,
    config: D::Config,
    options: BindOptions,
    state: StrategyState<D>,
    supervision: SupervisionChannel,
}

impl<D: Driver> std::fmt::Debug for ConnectionManager<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("strategy", &self.options.strategy)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> ConnectionManager<D> {
    /// Create a manager for the given driver, driver config, and options.
    ///
    /// Fails synchronously with a [`ConfigError`] on invalid options or a
    /// rejected pool configuration, before any request is processed.
    pub fn new(
        driver: D,
        config: D::Config,
        options: BindOptions,
    ) -> Result<Arc<Self>, ConfigError> {
        options.validate()?;

        let driver = Arc::new(driver);
        let (supervision_tx, supervision) = SupervisionChannel::pair();

        let state = match options.strategy {
            ConnectionStrategy::Single => {
                let (handle_tx, shared) = handle_channel::<D>();
                let stats = Arc::new(ReconnectStats::default());
                let task = Reconnector {
                    driver: Arc::clone(&driver),
                    config: config.clone(),
                    retry_delay: options.retry_delay(),
                    handle_tx,
                    supervision_tx,
                    stats: Arc::clone(&stats),
                }
                .spawn();
                StrategyState::Single {
                    shared,
                    stats,
                    task: std::sync::Mutex::new(Some(task)),
                }
            }
            ConnectionStrategy::Pool => {
                let pool = driver
                    .create_pool(&config)
                    .map_err(ConfigError::PoolCreation)?;
                StrategyState::Pool(Arc::new(pool))
            }
            ConnectionStrategy::Request => StrategyState::Request,
        };

        info!(strategy = %options.strategy, "Connection manager initialized");

        Ok(Arc::new(Self {
            driver,
            config,
            options,
            state,
            supervision,
        }))
    }

    /// The active strategy.
    pub fn strategy(&self) -> ConnectionStrategy {
        self.options.strategy
    }

    /// The bind options this manager was constructed with.
    pub fn options(&self) -> &BindOptions {
        &self.options
    }

    /// Channel on which the reconnect supervisor reports a fatal error.
    ///
    /// Never delivers anything under the pool and request strategies.
    pub fn supervision(&self) -> SupervisionChannel {
        self.supervision.clone()
    }

    /// A snapshot of the manager's connection state.
    pub fn status(&self) -> ManagerStatus {
        match &self.state {
            StrategyState::Single { stats, .. } => ManagerStatus {
                strategy: ConnectionStrategy::Single,
                connected: stats.connected(),
                reconnects: stats.reconnects(),
                connected_since: stats.connected_since(),
            },
            StrategyState::Pool(_) => ManagerStatus {
                strategy: ConnectionStrategy::Pool,
                // Pool creation is lazy; "connected" here means the pool is
                // open for checkouts.
                connected: true,
                reconnects: 0,
                connected_since: None,
            },
            StrategyState::Request => ManagerStatus {
                strategy: ConnectionStrategy::Request,
                connected: false,
                reconnects: 0,
                connected_since: None,
            },
        }
    }

    /// The per-request acquisition source for this manager's strategy.
    pub(crate) fn source(&self) -> ConnectionSource<D> {
        match &self.state {
            StrategyState::Single { shared, .. } => ConnectionSource::Single(shared.clone()),
            StrategyState::Pool(pool) => ConnectionSource::Pool(Arc::clone(pool)),
            StrategyState::Request => ConnectionSource::Request {
                driver: Arc::clone(&self.driver),
                config: self.config.clone(),
            },
        }
    }

    /// Tear down the manager's long-lived state. Idempotent.
    ///
    /// Single: aborts the supervisor task and ends the current shared handle.
    /// Pool: closes the pool. Request: nothing to do. In-flight requests keep
    /// whatever handles they already hold.
    pub async fn shutdown(&self) {
        match &self.state {
            StrategyState::Single {
                shared,
                stats,
                task,
            } => {
                let task = task.lock().expect("task lock poisoned").take();
                if let Some(task) = task {
                    task.abort();
                    if let Some(conn) = shared.try_current() {
                        if let Err(err) = conn.end().await {
                            warn!(error = %err, "Failed to end shared connection at shutdown");
                        }
                    }
                    stats.mark_disconnected();
                    info!("Connection manager shut down");
                }
            }
            StrategyState::Pool(pool) => {
                pool.close().await;
                info!("Connection pool closed");
            }
            StrategyState::Request => {}
        }
    }
}

/// Serializable snapshot returned by [`ConnectionManager::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStatus {
    /// The manager's fixed strategy.
    pub strategy: ConnectionStrategy,
    /// Whether a shared connection (single) or open pool (pool) is available.
    pub connected: bool,
    /// Number of times the shared connection has been replaced.
    pub reconnects: u64,
    /// When the current shared connection was established.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
}
