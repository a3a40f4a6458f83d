//! The alternative, simpler binder: eager pool checkout.
//!
//! Checks a connection out of a pool before passing control downstream and
//! exposes it as a plain request extension - no acquire call, no strategy
//! selection. The checkout is released exactly once, on the first completion
//! of the response. Unlike a terminal-write-only hook, the release guard also
//! fires when the response is dropped before any write, so a client that
//! disconnects early does not leak the checkout.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::driver::{Pool, PooledConnection};
use crate::layer::SignalBody;

/// Layer that eagerly binds a pooled connection to every request.
pub struct EagerPoolLayer<P: Pool> {
    pool: Arc<P>,
}

impl<P: Pool> EagerPoolLayer<P> {
    pub fn new(pool: P) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

impl<P: Pool> Clone for EagerPoolLayer<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<P: Pool, S> Layer<S> for EagerPoolLayer<P> {
    type Service = EagerPoolService<P, S>;

    fn layer(&self, inner: S) -> Self::Service {
        EagerPoolService {
            pool: Arc::clone(&self.pool),
            inner,
        }
    }
}

/// Service produced by [`EagerPoolLayer`].
pub struct EagerPoolService<P: Pool, S> {
    pool: Arc<P>,
    inner: S,
}

impl<P: Pool, S: Clone> Clone for EagerPoolService<P, S> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            inner: self.inner.clone(),
        }
    }
}

impl<P, S, ReqBody> Service<Request<ReqBody>> for EagerPoolService<P, S>
where
    P: Pool,
    S: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let pool = Arc::clone(&self.pool);
        // Use the service that was driven to readiness; keep the fresh clone
        // for later calls (standard tower buffering concern).
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let conn = match pool.acquire().await {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    warn!(error = %err, "Eager pool checkout failed, failing request");
                    let mut res = Response::new(Body::from("database checkout failed"));
                    *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    return Ok(res);
                }
            };
            debug!("Eagerly checked out pooled connection for request");

            let guard = ReleaseGuard::<P> {
                conn: Some(Arc::clone(&conn)),
            };
            req.extensions_mut().insert(EagerConnection::<P>(conn));

            let res = inner.call(req).await?;
            Ok(res.map(|body| Body::new(SignalBody::new(body, guard))))
        })
    }
}

/// Request extension installed by [`EagerPoolLayer`]: the checked-out handle,
/// available without any acquire call.
pub struct EagerConnection<P: Pool>(Arc<P::Pooled>);

impl<P: Pool> Clone for EagerConnection<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Pool> std::fmt::Debug for EagerConnection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EagerConnection").finish()
    }
}

impl<P: Pool> EagerConnection<P> {
    /// The checked-out pooled connection.
    pub fn connection(&self) -> &Arc<P::Pooled> {
        &self.0
    }
}

/// Releases the eager checkout exactly once, on drop.
struct ReleaseGuard<P: Pool> {
    conn: Option<Arc<P::Pooled>>,
}

impl<P: Pool> Drop for ReleaseGuard<P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tokio::spawn(async move {
                conn.release().await;
                debug!("Eagerly checked out connection returned to pool");
            });
        }
    }
}
