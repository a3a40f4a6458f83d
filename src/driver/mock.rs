//! In-crate mock driver.
//!
//! Counts every driver call with atomics so tests can verify the middleware's
//! exactly-once invariants (no double release, no leaked checkout, no
//! double-ended session), and exposes an injectable error channel to simulate
//! disconnects. Always compiled: it is the reference driver for the crate's
//! own tests and for applications testing their handlers without a database.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use crate::driver::{Connection, Driver, Pool, PooledConnection};
use crate::error::DriverError;

/// Driver-call counters shared by a [`MockDriver`] and everything it creates.
#[derive(Debug, Default)]
pub struct MockCounters {
    connects: AtomicUsize,
    ends: AtomicUsize,
    checkouts: AtomicUsize,
    releases: AtomicUsize,
    outstanding: AtomicIsize,
}

impl MockCounters {
    /// Number of dedicated connections opened.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    /// Number of sessions gracefully ended.
    pub fn ends(&self) -> usize {
        self.ends.load(Ordering::Acquire)
    }

    /// Number of pool checkouts performed.
    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::Acquire)
    }

    /// Number of pooled connections returned to the pool.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Acquire)
    }

    /// Current outstanding-checkout gauge (checkouts minus releases).
    pub fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct DriverInner {
    counters: Arc<MockCounters>,
    connect_failures: AtomicUsize,
    next_id: Arc<AtomicUsize>,
    pool: std::sync::Mutex<Option<MockPool>>,
}

/// Mock [`Driver`]. Cheap to clone; clones share counters and controls.
#[derive(Debug, Clone)]
pub struct MockDriver {
    inner: Arc<DriverInner>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DriverInner {
                counters: Arc::new(MockCounters::default()),
                connect_failures: AtomicUsize::new(0),
                next_id: Arc::new(AtomicUsize::new(1)),
                pool: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Shared counters for assertions.
    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.inner.counters)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&self, n: usize) {
        self.inner.connect_failures.store(n, Ordering::Release);
    }

    /// The pool created by [`Driver::create_pool`], if any.
    pub fn pool(&self) -> Option<MockPool> {
        self.inner.pool.lock().expect("pool lock poisoned").clone()
    }
}

impl Driver for MockDriver {
    type Config = String;
    type Connection = MockConnection;
    type Pool = MockPool;

    async fn connect(&self, _config: &String) -> Result<MockConnection, DriverError> {
        let failures = &self.inner.connect_failures;
        let should_fail = failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DriverError::connect("mock connect refused"));
        }

        self.inner.counters.connects.fetch_add(1, Ordering::AcqRel);
        Ok(MockConnection::new(
            self.inner.next_id.fetch_add(1, Ordering::AcqRel),
            Arc::clone(&self.inner.counters),
        ))
    }

    fn create_pool(&self, _config: &String) -> Result<MockPool, DriverError> {
        let pool = MockPool::new(
            Arc::clone(&self.inner.counters),
            Arc::clone(&self.inner.next_id),
        );
        *self.inner.pool.lock().expect("pool lock poisoned") = Some(pool.clone());
        Ok(pool)
    }
}

/// Mock dedicated connection with an injectable error-event channel.
#[derive(Debug)]
pub struct MockConnection {
    id: usize,
    counters: Arc<MockCounters>,
    ended: AtomicBool,
    // Sender is dropped on end() so recv_error observes channel closure.
    errors_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<DriverError>>>,
    errors_rx: Mutex<mpsc::UnboundedReceiver<DriverError>>,
}

impl MockConnection {
    fn new(id: usize, counters: Arc<MockCounters>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            counters,
            ended: AtomicBool::new(false),
            errors_tx: std::sync::Mutex::new(Some(tx)),
            errors_rx: Mutex::new(rx),
        }
    }

    /// Identifier, unique per driver instance.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Inject an error event, as the server would on a broken session.
    pub fn emit_error(&self, err: DriverError) {
        if let Some(tx) = self.errors_tx.lock().expect("errors lock poisoned").as_ref() {
            let _ = tx.send(err);
        }
    }
}

impl Connection for MockConnection {
    async fn end(&self) -> Result<(), DriverError> {
        if !self.ended.swap(true, Ordering::AcqRel) {
            self.counters.ends.fetch_add(1, Ordering::AcqRel);
            self.errors_tx.lock().expect("errors lock poisoned").take();
        }
        Ok(())
    }

    async fn recv_error(&self) -> Option<DriverError> {
        self.errors_rx.lock().await.recv().await
    }
}

#[derive(Debug)]
struct PoolInner {
    counters: Arc<MockCounters>,
    next_id: Arc<AtomicUsize>,
    closed: AtomicBool,
    checkout_failures: AtomicUsize,
}

/// Mock [`Pool`]. Cheap to clone; clones share the gauge and controls.
#[derive(Debug, Clone)]
pub struct MockPool {
    inner: Arc<PoolInner>,
}

impl MockPool {
    fn new(counters: Arc<MockCounters>, next_id: Arc<AtomicUsize>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                counters,
                next_id,
                closed: AtomicBool::new(false),
                checkout_failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `n` checkouts fail.
    pub fn fail_checkouts(&self, n: usize) {
        self.inner.checkout_failures.store(n, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Pool for MockPool {
    type Pooled = MockPooledConnection;

    async fn acquire(&self) -> Result<MockPooledConnection, DriverError> {
        if self.is_closed() {
            return Err(DriverError::PoolClosed);
        }
        let failures = &self.inner.checkout_failures;
        let should_fail = failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(DriverError::checkout("mock checkout refused"));
        }

        self.inner.counters.checkouts.fetch_add(1, Ordering::AcqRel);
        self.inner
            .counters
            .outstanding
            .fetch_add(1, Ordering::AcqRel);
        Ok(MockPooledConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::AcqRel),
            counters: Arc::clone(&self.inner.counters),
            released: AtomicBool::new(false),
        })
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

/// Mock pooled connection.
#[derive(Debug)]
pub struct MockPooledConnection {
    id: usize,
    counters: Arc<MockCounters>,
    released: AtomicBool,
}

impl MockPooledConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Connection for MockPooledConnection {
    async fn end(&self) -> Result<(), DriverError> {
        // Pooled handles are released, not ended; counted anyway so a
        // misrouted end shows up in tests.
        self.counters.ends.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn recv_error(&self) -> Option<DriverError> {
        // Pool health is the driver's concern; no events are surfaced here.
        std::future::pending().await
    }
}

impl PooledConnection for MockPooledConnection {
    async fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.counters.releases.fetch_add(1, Ordering::AcqRel);
            self.counters.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
