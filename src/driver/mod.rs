//! The driver abstraction: the external collaborator that owns the wire
//! protocol, query execution, and transport-level pooling.
//!
//! The middleware never inspects the driver's configuration and never runs
//! queries; it only opens, shares, checks out, releases, and ends handles.
//! Exactly-once release/end is enforced by the request slot's state machine,
//! not by the type system, so drivers are free to hand out cheap `Arc`-shared
//! handles.

use std::future::Future;

use crate::error::DriverError;

pub mod mock;

#[cfg(feature = "mysql")]
pub mod mysql;

/// A database driver, the factory for connections and pools.
pub trait Driver: Send + Sync + 'static {
    /// Opaque configuration blob passed verbatim to the driver.
    type Config: Clone + Send + Sync + 'static;
    /// Dedicated (non-pooled) connection handle.
    type Connection: Connection;
    /// Transport-level connection pool.
    type Pool: Pool;

    /// Open a new dedicated connection.
    fn connect(
        &self,
        config: &Self::Config,
    ) -> impl Future<Output = Result<Self::Connection, DriverError>> + Send;

    /// Create a connection pool. Declared lazy: no I/O is performed here, so
    /// failure means the configuration itself was rejected.
    fn create_pool(&self, config: &Self::Config) -> Result<Self::Pool, DriverError>;
}

/// One database session.
pub trait Connection: Send + Sync + 'static {
    /// Gracefully end the session. Ending an already-ended session is a no-op.
    fn end(&self) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Receive the next error event raised by the session.
    ///
    /// Resolves to `None` when the session has ended and no further events can
    /// arrive. The reconnect supervisor listens here for the protocol-lost
    /// condition.
    fn recv_error(&self) -> impl Future<Output = Option<DriverError>> + Send;
}

/// A driver-owned pool with checkout/release semantics.
pub trait Pool: Send + Sync + 'static {
    /// Handle checked out of the pool.
    type Pooled: PooledConnection;

    /// Check a connection out of the pool.
    fn acquire(&self) -> impl Future<Output = Result<Self::Pooled, DriverError>> + Send;

    /// Close the pool. Outstanding handles stay valid until returned.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// A connection checked out of a [`Pool`].
pub trait PooledConnection: Connection {
    /// Return the connection to its pool. Releasing twice is a driver-level
    /// no-op, but the middleware never does it.
    fn release(&self) -> impl Future<Output = ()> + Send;
}

/// Shorthand for the pooled-handle type of a driver.
pub type PooledOf<D> = <<D as Driver>::Pool as Pool>::Pooled;
