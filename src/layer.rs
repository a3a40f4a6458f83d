//! The primary request binder: a tower layer that installs the
//! [`RequestDb`] surface on each request and arms completion cleanup.
//!
//! Control passes downstream immediately - handlers call
//! [`RequestDb::acquire`] themselves. Cleanup is armed on both completion
//! signals: normal completion (the response body polls to end of stream) and
//! early/abnormal termination (the response future or body is dropped before
//! completion, e.g. client disconnect or handler error). The two signals can
//! both fire for one request; the slot state machine makes cleanup idempotent.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use http::{Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use tower::{Layer, Service};
use tracing::debug;

use crate::driver::Driver;
use crate::manager::ConnectionManager;
use crate::request::{RequestDb, RequestSlot};

/// Layer that binds a database connection surface to every request.
pub struct DbConnLayer<D: Driver> {
    manager: Arc<ConnectionManager<D>>,
}

impl<D: Driver> DbConnLayer<D> {
    pub fn new(manager: Arc<ConnectionManager<D>>) -> Self {
        Self { manager }
    }
}

impl<D: Driver> Clone for DbConnLayer<D> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<D: Driver, S> Layer<S> for DbConnLayer<D> {
    type Service = DbConnService<D, S>;

    fn layer(&self, inner: S) -> Self::Service {
        DbConnService {
            manager: Arc::clone(&self.manager),
            inner,
        }
    }
}

/// Service produced by [`DbConnLayer`].
pub struct DbConnService<D: Driver, S> {
    manager: Arc<ConnectionManager<D>>,
    inner: S,
}

impl<D: Driver, S: Clone> Clone for DbConnService<D, S> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            inner: self.inner.clone(),
        }
    }
}

impl<D, S, ReqBody> Service<Request<ReqBody>> for DbConnService<D, S>
where
    D: Driver,
    S: Service<Request<ReqBody>, Response = Response<Body>>,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = ResponseFuture<D, S::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let slot = Arc::new(RequestSlot::new());
        debug!(
            binding_id = %slot.binding_id(),
            strategy = %self.manager.strategy(),
            "Binding connection surface to request"
        );
        req.extensions_mut()
            .insert(RequestDb::new(self.manager.source(), Arc::clone(&slot)));

        ResponseFuture {
            inner: Box::pin(self.inner.call(req)),
            guard: Some(CompletionGuard { slot: Some(slot) }),
        }
    }
}

/// Fires the request slot's cleanup exactly once, on drop.
///
/// Travels from the response future into the response body, so cleanup runs
/// whichever ends the request first: end of body, body drop, or future drop.
pub(crate) struct CompletionGuard<D: Driver> {
    slot: Option<Arc<RequestSlot<D>>>,
}

impl<D: Driver> Drop for CompletionGuard<D> {
    fn drop(&mut self) {
        // Cleanup is async; spawn it, as Drop cannot await.
        if let Some(slot) = self.slot.take() {
            slot.spawn_cleanup();
        }
    }
}

/// Response future of [`DbConnService`].
pub struct ResponseFuture<D: Driver, E> {
    inner: Pin<Box<dyn Future<Output = Result<Response<Body>, E>> + Send>>,
    guard: Option<CompletionGuard<D>>,
}

impl<D: Driver, E> Future for ResponseFuture<D, E> {
    type Output = Result<Response<Body>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner.as_mut().poll(cx) {
            Poll::Ready(Ok(res)) => {
                // Hand the guard to the body; from here the completion
                // signals are end-of-stream and body drop.
                let guard = this.guard.take();
                Poll::Ready(Ok(
                    res.map(|body| Body::new(SignalBody { inner: body, guard }))
                ))
            }
            Poll::Ready(Err(err)) => {
                this.guard.take();
                Poll::Ready(Err(err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Body wrapper that drops its guard on the first completion: end of stream,
/// a body error, or drop of the body itself.
pub(crate) struct SignalBody<G> {
    inner: Body,
    guard: Option<G>,
}

impl<G> SignalBody<G> {
    pub(crate) fn new(inner: Body, guard: G) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<G: Unpin + Send + 'static> HttpBody for SignalBody<G> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(None) => {
                this.guard.take();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.guard.take();
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        HttpBody::is_end_stream(&self.inner)
    }

    fn size_hint(&self) -> SizeHint {
        HttpBody::size_hint(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_test::assert_ok;

    struct FlagGuard(Arc<AtomicBool>);

    impl Drop for FlagGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    fn flagged_body(content: &'static str) -> (SignalBody<FlagGuard>, Arc<AtomicBool>) {
        let fired = Arc::new(AtomicBool::new(false));
        let body = SignalBody::new(Body::from(content), FlagGuard(Arc::clone(&fired)));
        (body, fired)
    }

    #[tokio::test]
    async fn test_signal_body_fires_guard_at_end_of_stream() {
        let (body, fired) = flagged_body("payload");
        assert_ok!(http_body_util::BodyExt::collect(body).await);
        assert!(fired.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_signal_body_fires_guard_on_drop_before_completion() {
        let (body, fired) = flagged_body("never read");
        assert!(!fired.load(Ordering::Acquire));
        drop(body);
        assert!(fired.load(Ordering::Acquire));
    }
}
