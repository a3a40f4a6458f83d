//! Per-request state: the connection slot, the handle type, and the
//! `RequestDb` surface installed into request extensions.
//!
//! The slot is the request's released-flag generalized to an explicit state
//! machine. Completion signals may fire more than once for a request; cleanup
//! transitions the slot to `Cleaned` exactly once, so a connection is never
//! double-ended or double-released no matter how many signals arrive.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ConnectionStrategy;
use crate::driver::{Connection, Driver, PooledConnection, PooledOf};
use crate::error::AcquireError;
use crate::source::ConnectionSource;

/// A connection cached in a request slot.
pub(crate) enum CachedConn<D: Driver> {
    Pooled(Arc<PooledOf<D>>),
    Dedicated(Arc<D::Connection>),
}

impl<D: Driver> CachedConn<D> {
    pub(crate) fn handle(&self) -> ConnectionHandle<D> {
        match self {
            Self::Pooled(conn) => ConnectionHandle::Pooled(Arc::clone(conn)),
            Self::Dedicated(conn) => ConnectionHandle::Dedicated(Arc::clone(conn)),
        }
    }
}

/// Slot lifecycle. `Empty` both before the first acquire and after an explicit
/// early release; a fresh acquire from either performs a new checkout.
pub(crate) enum SlotState<D: Driver> {
    Empty,
    Cached(CachedConn<D>),
    Cleaned,
}

/// Request-scoped connection cache, created when a request enters the
/// middleware and cleaned when its completion signals fire.
pub(crate) struct RequestSlot<D: Driver> {
    pub(crate) state: Mutex<SlotState<D>>,
    binding_id: String,
}

impl<D: Driver> RequestSlot<D> {
    pub(crate) fn new() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            state: Mutex::new(SlotState::Empty),
            binding_id: id[..8].to_string(),
        }
    }

    pub(crate) fn binding_id(&self) -> &str {
        &self.binding_id
    }

    /// Run completion cleanup. Idempotent: only the first call finds anything
    /// cached, every later call sees `Cleaned` and returns.
    pub(crate) async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SlotState::Cleaned) {
            SlotState::Cached(CachedConn::Pooled(conn)) => {
                conn.release().await;
                debug!(
                    binding_id = %self.binding_id,
                    "Pooled connection released at request completion"
                );
            }
            SlotState::Cached(CachedConn::Dedicated(conn)) => {
                if let Err(err) = conn.end().await {
                    warn!(
                        binding_id = %self.binding_id,
                        error = %err,
                        "Failed to end dedicated connection at request completion"
                    );
                } else {
                    debug!(
                        binding_id = %self.binding_id,
                        "Dedicated connection ended at request completion"
                    );
                }
            }
            SlotState::Empty | SlotState::Cleaned => {}
        }
    }

    /// Spawn cleanup onto the runtime. Used by completion guards, which fire
    /// from `Drop` and cannot await.
    pub(crate) fn spawn_cleanup(self: &Arc<Self>) {
        let slot = Arc::clone(self);
        tokio::spawn(async move {
            slot.cleanup().await;
        });
    }
}

/// An acquired connection handle.
///
/// Shared handles stay owned by the manager; pooled and dedicated handles are
/// owned by the request slot and returned/ended at completion.
pub enum ConnectionHandle<D: Driver> {
    /// The manager's long-lived shared connection.
    Shared(Arc<D::Connection>),
    /// A connection dedicated to this request.
    Dedicated(Arc<D::Connection>),
    /// A connection checked out of the driver's pool for this request.
    Pooled(Arc<PooledOf<D>>),
}

impl<D: Driver> Clone for ConnectionHandle<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Shared(conn) => Self::Shared(Arc::clone(conn)),
            Self::Dedicated(conn) => Self::Dedicated(Arc::clone(conn)),
            Self::Pooled(conn) => Self::Pooled(Arc::clone(conn)),
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Self::Shared(_) => "Shared",
            Self::Dedicated(_) => "Dedicated",
            Self::Pooled(_) => "Pooled",
        };
        f.debug_tuple("ConnectionHandle").field(&variant).finish()
    }
}

impl<D: Driver> ConnectionHandle<D> {
    /// The strategy this handle was acquired under.
    pub fn strategy(&self) -> ConnectionStrategy {
        match self {
            Self::Shared(_) => ConnectionStrategy::Single,
            Self::Dedicated(_) => ConnectionStrategy::Request,
            Self::Pooled(_) => ConnectionStrategy::Pool,
        }
    }

    /// Whether two handles refer to the same driver connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Shared(a), Self::Shared(b)) => Arc::ptr_eq(a, b),
            (Self::Dedicated(a), Self::Dedicated(b)) => Arc::ptr_eq(a, b),
            (Self::Pooled(a), Self::Pooled(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The underlying dedicated or shared connection, if this is one.
    pub fn connection(&self) -> Option<&Arc<D::Connection>> {
        match self {
            Self::Shared(conn) | Self::Dedicated(conn) => Some(conn),
            Self::Pooled(_) => None,
        }
    }

    /// The underlying pooled connection, if this is one.
    pub fn pooled(&self) -> Option<&Arc<PooledOf<D>>> {
        match self {
            Self::Pooled(conn) => Some(conn),
            _ => None,
        }
    }
}

/// The request-surface extension installed by
/// [`DbConnLayer`](crate::layer::DbConnLayer).
///
/// Handlers call [`acquire`](Self::acquire) to obtain a connection under the
/// active strategy; repeated calls within one request return the cached
/// handle. [`release`](Self::release) returns a pooled connection early; it is
/// a no-op under the other strategies.
pub struct RequestDb<D: Driver> {
    source: ConnectionSource<D>,
    slot: Arc<RequestSlot<D>>,
}

impl<D: Driver> Clone for RequestDb<D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<D: Driver> std::fmt::Debug for RequestDb<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDb")
            .field("strategy", &self.source.strategy())
            .field("binding_id", &self.slot.binding_id())
            .finish()
    }
}

impl<D: Driver> RequestDb<D> {
    pub(crate) fn new(source: ConnectionSource<D>, slot: Arc<RequestSlot<D>>) -> Self {
        Self { source, slot }
    }

    /// Acquire a connection under the active strategy.
    ///
    /// Idempotent within one request: the first call obtains a connection,
    /// later calls return the cached handle. Passing through the middleware
    /// does not imply a connection is ready - this call is where acquisition
    /// happens and where it can fail.
    pub async fn acquire(&self) -> Result<ConnectionHandle<D>, AcquireError> {
        self.source.acquire(&self.slot).await
    }

    /// Release a pooled connection back to the pool before request completion.
    ///
    /// A connection released this way is not released again at completion, and
    /// a later [`acquire`](Self::acquire) performs a fresh checkout. No-op for
    /// the single and request strategies.
    pub async fn release(&self) {
        self.source.release(&self.slot).await;
    }

    /// The active acquisition strategy.
    pub fn strategy(&self) -> ConnectionStrategy {
        self.source.strategy()
    }

    /// Short identifier of this request's binding, used in log events.
    pub fn binding_id(&self) -> &str {
        self.slot.binding_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::driver::Pool;

    async fn pooled_slot(driver: &MockDriver) -> Arc<RequestSlot<MockDriver>> {
        let pool = driver.create_pool(&"mock://db".to_string()).unwrap();
        let conn = Arc::new(pool.acquire().await.unwrap());
        let slot = Arc::new(RequestSlot::<MockDriver>::new());
        *slot.state.lock().await = SlotState::Cached(CachedConn::Pooled(conn));
        slot
    }

    #[tokio::test]
    async fn test_cleanup_releases_cached_pooled_connection() {
        let driver = MockDriver::new();
        let slot = pooled_slot(&driver).await;
        slot.cleanup().await;
        assert_eq!(driver.counters().releases(), 1);
        assert_eq!(driver.counters().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let driver = MockDriver::new();
        let slot = pooled_slot(&driver).await;
        slot.cleanup().await;
        slot.cleanup().await;
        slot.cleanup().await;
        assert_eq!(driver.counters().releases(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_ends_dedicated_connection() {
        let driver = MockDriver::new();
        let conn = Arc::new(
            crate::driver::Driver::connect(&driver, &"mock://db".to_string())
                .await
                .unwrap(),
        );
        let slot = Arc::new(RequestSlot::<MockDriver>::new());
        *slot.state.lock().await = SlotState::Cached(CachedConn::Dedicated(conn));
        slot.cleanup().await;
        slot.cleanup().await;
        assert_eq!(driver.counters().ends(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_on_empty_slot_is_a_no_op() {
        let driver = MockDriver::new();
        let slot = Arc::new(RequestSlot::<MockDriver>::new());
        slot.cleanup().await;
        assert_eq!(driver.counters().releases(), 0);
        assert_eq!(driver.counters().ends(), 0);
    }

    #[tokio::test]
    async fn test_spawn_cleanup_runs_on_runtime() {
        let driver = MockDriver::new();
        let slot = pooled_slot(&driver).await;
        slot.spawn_cleanup();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(driver.counters().releases(), 1);
    }

    #[test]
    fn test_binding_ids_are_short_and_distinct() {
        let a = RequestSlot::<MockDriver>::new();
        let b = RequestSlot::<MockDriver>::new();
        assert_eq!(a.binding_id().len(), 8);
        assert_ne!(a.binding_id(), b.binding_id());
    }
}
