//! Reconnect supervision for the single-connection strategy.
//!
//! One background task owns the shared connection's lifecycle:
//! `Connecting -> Connected -> Connecting (on protocol-lost) -> ...` with no
//! terminal state under normal operation. Connect failures retry on a fixed
//! delay, indefinitely. Any non-protocol-lost error event is unrecoverable:
//! it is published once on the supervision channel and the task exits, so the
//! embedding process can apply its crash-and-restart policy deliberately.
//!
//! Handle replacement is a `watch` channel publication: concurrent readers
//! observe either the fully connected old handle or the fully connected new
//! one, never an in-construction value.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{Connection, Driver};
use crate::error::DriverError;

/// Counters kept by the supervisor, surfaced through
/// [`ManagerStatus`](crate::manager::ManagerStatus).
#[derive(Debug, Default)]
pub(crate) struct ReconnectStats {
    reconnects: AtomicU64,
    connected: AtomicBool,
    connected_since: std::sync::RwLock<Option<DateTime<Utc>>>,
}

impl ReconnectStats {
    pub(crate) fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Acquire)
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn connected_since(&self) -> Option<DateTime<Utc>> {
        *self.connected_since.read().expect("stats lock poisoned")
    }

    fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
        *self.connected_since.write().expect("stats lock poisoned") = Some(Utc::now());
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
    }
}

/// Reader side of the shared connection handle.
///
/// Readers before the first successful connection wait for publication; after
/// that, reads never wait. A read issued between a disconnect and the next
/// successful reconnect returns the stale handle immediately - callers retry
/// queries at the driver level.
pub struct SharedConnection<D: Driver> {
    rx: watch::Receiver<Option<Arc<D::Connection>>>,
    // Keeps the channel open while any reader exists, even after the
    // supervisor task has exited on a fatal error.
    _tx: Arc<watch::Sender<Option<Arc<D::Connection>>>>,
}

impl<D: Driver> Clone for SharedConnection<D> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            _tx: Arc::clone(&self._tx),
        }
    }
}

impl<D: Driver> std::fmt::Debug for SharedConnection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("connected", &self.rx.borrow().is_some())
            .finish()
    }
}

impl<D: Driver> SharedConnection<D> {
    /// The current shared handle, waiting only for the first publication.
    pub async fn current(&self) -> Arc<D::Connection> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(conn) = rx.borrow_and_update().as_ref().map(Arc::clone) {
                return conn;
            }
            if rx.changed().await.is_err() {
                // Every reader holds the sender alive, so closure means the
                // whole middleware is being torn down mid-request.
                std::future::pending::<()>().await;
            }
        }
    }

    /// The current shared handle without waiting.
    pub fn try_current(&self) -> Option<Arc<D::Connection>> {
        self.rx.borrow().as_ref().map(Arc::clone)
    }
}

/// Receiver for the one fatal error a supervisor may report.
///
/// Empty until a non-protocol-lost error event occurs on the shared
/// connection. The embedding process is expected to consume it and terminate;
/// requests keep receiving the stale handle in the meantime.
#[derive(Debug)]
pub struct SupervisionChannel {
    rx: watch::Receiver<Option<DriverError>>,
    _tx: Arc<watch::Sender<Option<DriverError>>>,
}

impl Clone for SupervisionChannel {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            _tx: Arc::clone(&self._tx),
        }
    }
}

impl SupervisionChannel {
    pub(crate) fn pair() -> (Arc<watch::Sender<Option<DriverError>>>, Self) {
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        (
            Arc::clone(&tx),
            Self {
                rx,
                _tx: tx,
            },
        )
    }

    /// Wait for a fatal error report.
    pub async fn recv(&self) -> DriverError {
        let mut rx = self.rx.clone();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// The fatal error, if one has been reported.
    pub fn fatal_error(&self) -> Option<DriverError> {
        self.rx.borrow().clone()
    }
}

/// The supervisor task body. Owned by the manager under the single strategy.
pub(crate) struct Reconnector<D: Driver> {
    pub(crate) driver: Arc<D>,
    pub(crate) config: D::Config,
    pub(crate) retry_delay: Duration,
    pub(crate) handle_tx: Arc<watch::Sender<Option<Arc<D::Connection>>>>,
    pub(crate) supervision_tx: Arc<watch::Sender<Option<DriverError>>>,
    pub(crate) stats: Arc<ReconnectStats>,
}

impl<D: Driver> Reconnector<D> {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut first = true;
        loop {
            match self.driver.connect(&self.config).await {
                Ok(conn) => {
                    let conn = Arc::new(conn);
                    self.handle_tx.send_replace(Some(Arc::clone(&conn)));
                    self.stats.mark_connected();
                    if first {
                        first = false;
                        info!("Shared connection established");
                    } else {
                        self.stats.record_reconnect();
                        info!(
                            reconnects = self.stats.reconnects(),
                            "Shared connection re-established"
                        );
                    }

                    match conn.recv_error().await {
                        Some(err) if err.is_protocol_lost() => {
                            self.stats.mark_disconnected();
                            warn!(error = %err, "Shared connection lost, reconnecting");
                            // Re-enters Connecting immediately; the retry
                            // delay applies only to failed connect attempts.
                        }
                        Some(err) => {
                            self.stats.mark_disconnected();
                            error!(
                                error = %err,
                                "Unrecoverable error on shared connection, supervisor exiting"
                            );
                            self.supervision_tx.send_replace(Some(err));
                            return;
                        }
                        None => {
                            debug!("Shared connection ended, supervisor exiting");
                            return;
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}

/// Create the handle channel and a reader for it.
pub(crate) fn handle_channel<D: Driver>() -> (
    Arc<watch::Sender<Option<Arc<D::Connection>>>>,
    SharedConnection<D>,
) {
    let (tx, rx) = watch::channel(None);
    let tx = Arc::new(tx);
    (
        Arc::clone(&tx),
        SharedConnection {
            rx,
            _tx: tx,
        },
    )
}
