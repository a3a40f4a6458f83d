//! Per-strategy acquisition logic.
//!
//! One `ConnectionSource` is derived from the manager at setup time and shared
//! by every request; each request brings its own slot. The slot lock is held
//! across the checkout/connect, so concurrent acquires within one request are
//! single-flighted and at most one connection is ever obtained per request.

use std::sync::Arc;

use tracing::debug;

use crate::config::ConnectionStrategy;
use crate::driver::{Driver, Pool, PooledConnection};
use crate::error::AcquireError;
use crate::reconnect::SharedConnection;
use crate::request::{CachedConn, ConnectionHandle, RequestSlot, SlotState};

pub(crate) enum ConnectionSource<D: Driver> {
    /// Read the supervisor's shared handle; never fails.
    Single(SharedConnection<D>),
    /// Check out of the driver's pool on first acquire.
    Pool(Arc<D::Pool>),
    /// Open a dedicated connection on first acquire.
    Request {
        driver: Arc<D>,
        config: D::Config,
    },
}

impl<D: Driver> Clone for ConnectionSource<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Single(shared) => Self::Single(shared.clone()),
            Self::Pool(pool) => Self::Pool(Arc::clone(pool)),
            Self::Request { driver, config } => Self::Request {
                driver: Arc::clone(driver),
                config: config.clone(),
            },
        }
    }
}

impl<D: Driver> ConnectionSource<D> {
    pub(crate) fn strategy(&self) -> ConnectionStrategy {
        match self {
            Self::Single(_) => ConnectionStrategy::Single,
            Self::Pool(_) => ConnectionStrategy::Pool,
            Self::Request { .. } => ConnectionStrategy::Request,
        }
    }

    pub(crate) async fn acquire(
        &self,
        slot: &RequestSlot<D>,
    ) -> Result<ConnectionHandle<D>, AcquireError> {
        match self {
            Self::Single(shared) => {
                // The shared handle is not cached in the slot: it is owned by
                // the manager and completion cleanup must not touch it. The
                // slot state still gates acquisition, so a completed request
                // cannot obtain a handle under any strategy.
                if matches!(&*slot.state.lock().await, SlotState::Cleaned) {
                    return Err(AcquireError::RequestCompleted);
                }
                Ok(ConnectionHandle::Shared(shared.current().await))
            }

            Self::Pool(pool) => {
                let mut state = slot.state.lock().await;
                match &*state {
                    SlotState::Cached(cached) => {
                        debug!(
                            binding_id = %slot.binding_id(),
                            "Returning cached pooled connection"
                        );
                        Ok(cached.handle())
                    }
                    SlotState::Cleaned => Err(AcquireError::RequestCompleted),
                    SlotState::Empty => {
                        let conn = pool.acquire().await.map_err(AcquireError::Checkout)?;
                        let conn = Arc::new(conn);
                        *state = SlotState::Cached(CachedConn::Pooled(Arc::clone(&conn)));
                        debug!(
                            binding_id = %slot.binding_id(),
                            "Checked out pooled connection"
                        );
                        Ok(ConnectionHandle::Pooled(conn))
                    }
                }
            }

            Self::Request { driver, config } => {
                let mut state = slot.state.lock().await;
                match &*state {
                    SlotState::Cached(cached) => {
                        debug!(
                            binding_id = %slot.binding_id(),
                            "Returning cached dedicated connection"
                        );
                        Ok(cached.handle())
                    }
                    SlotState::Cleaned => Err(AcquireError::RequestCompleted),
                    SlotState::Empty => {
                        let conn = driver
                            .connect(config)
                            .await
                            .map_err(AcquireError::Connect)?;
                        let conn = Arc::new(conn);
                        *state = SlotState::Cached(CachedConn::Dedicated(Arc::clone(&conn)));
                        debug!(
                            binding_id = %slot.binding_id(),
                            "Opened dedicated connection"
                        );
                        Ok(ConnectionHandle::Dedicated(conn))
                    }
                }
            }
        }
    }

    /// Explicit early release, pool strategy only.
    pub(crate) async fn release(&self, slot: &RequestSlot<D>) {
        if !matches!(self, Self::Pool(_)) {
            debug!(
                strategy = %self.strategy(),
                "Explicit release is a no-op outside the pool strategy"
            );
            return;
        }

        let mut state = slot.state.lock().await;
        match std::mem::replace(&mut *state, SlotState::Empty) {
            SlotState::Cached(CachedConn::Pooled(conn)) => {
                conn.release().await;
                debug!(
                    binding_id = %slot.binding_id(),
                    "Pooled connection released early"
                );
            }
            // Nothing pooled is cached; put the state back (a `Cleaned` slot
            // must stay cleaned).
            other => *state = other,
        }
    }
}
