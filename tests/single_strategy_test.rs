//! Integration tests for the single strategy: a supervised shared connection,
//! stable between reconnects, replaced on protocol-lost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::routing::get;
use axum_dbconn::driver::mock::MockDriver;
use axum_dbconn::{
    BindOptions, ConnectionHandle, ConnectionManager, DbConnLayer, DriverError, RequestDb,
};
use http::Request;
use http_body_util::BodyExt;
use tower::ServiceExt;

type Seen = Arc<Mutex<Vec<ConnectionHandle<MockDriver>>>>;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn single_app(
    driver: &MockDriver,
) -> (Router, std::sync::Arc<ConnectionManager<MockDriver>>, Seen) {
    init_logging();
    let manager = ConnectionManager::new(
        driver.clone(),
        "mock://db".to_string(),
        BindOptions::default(),
    )
    .unwrap();

    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/",
            get({
                let seen = Arc::clone(&seen);
                move |db: RequestDb<MockDriver>| {
                    let seen = Arc::clone(&seen);
                    async move {
                        let handle = db.acquire().await.unwrap();
                        seen.lock().unwrap().push(handle);
                        "ok"
                    }
                }
            }),
        )
        .layer(DbConnLayer::new(Arc::clone(&manager)));

    (app, manager, seen)
}

async fn hit(app: &Router) {
    let res = app
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    res.into_body().collect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_requests_between_reconnects_see_the_same_handle() {
    let driver = MockDriver::new();
    let (app, manager, seen) = single_app(&driver);

    hit(&app).await;
    hit(&app).await;
    hit(&app).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].ptr_eq(&seen[1]));
    assert!(seen[1].ptr_eq(&seen[2]));
    assert_eq!(driver.counters().connects(), 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_protocol_lost_yields_a_fresh_handle() {
    let driver = MockDriver::new();
    let (app, manager, seen) = single_app(&driver);

    hit(&app).await;
    let old = seen.lock().unwrap()[0].clone();

    old.connection()
        .unwrap()
        .emit_error(DriverError::protocol_lost("transport dropped"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    hit(&app).await;
    let new = seen.lock().unwrap()[1].clone();
    assert!(!old.ptr_eq(&new));
    assert_eq!(manager.status().reconnects, 1);
    assert_eq!(driver.counters().connects(), 2);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_completion_cleanup_never_ends_the_shared_handle() {
    let driver = MockDriver::new();
    let (app, manager, _seen) = single_app(&driver);

    hit(&app).await;
    hit(&app).await;

    // Requests came and went; the shared connection is untouched.
    assert_eq!(driver.counters().ends(), 0);
    assert!(manager.status().connected);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_acquire_waits_for_the_first_connection() {
    let driver = MockDriver::new();
    driver.fail_connects(2);
    let (app, manager, seen) = single_app(&driver);

    // Two connect failures mean two fixed 2 s retry delays before the first
    // publication; the request's acquire waits them out.
    let start = tokio::time::Instant::now();
    hit(&app).await;
    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(seen.lock().unwrap().len(), 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_reported_while_requests_get_stale_handle() {
    let driver = MockDriver::new();
    let (app, manager, seen) = single_app(&driver);

    hit(&app).await;
    let old = seen.lock().unwrap()[0].clone();

    old.connection()
        .unwrap()
        .emit_error(DriverError::event("ER_ACCESS_DENIED_ERROR", "bad credentials"));

    let fatal = manager.supervision().recv().await;
    assert_eq!(fatal.code(), Some("ER_ACCESS_DENIED_ERROR"));

    // No reconnect happens; a late request still observes the stale handle.
    hit(&app).await;
    let late = seen.lock().unwrap()[1].clone();
    assert!(old.ptr_eq(&late));
    assert_eq!(driver.counters().connects(), 1);
    manager.shutdown().await;
}
