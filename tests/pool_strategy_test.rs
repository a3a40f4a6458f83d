//! Integration tests for the pool strategy: per-request checkout caching,
//! explicit early release, and exactly-once release at completion.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::routing::get;
use axum_dbconn::driver::mock::MockDriver;
use axum_dbconn::{BindOptions, ConnectionManager, ConnectionStrategy, DbConnLayer, RequestDb};
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

fn pool_manager(driver: &MockDriver) -> std::sync::Arc<ConnectionManager<MockDriver>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ConnectionManager::new(
        driver.clone(),
        "mock://db".to_string(),
        BindOptions::for_strategy(ConnectionStrategy::Pool),
    )
    .unwrap()
}

async fn settle() {
    // Completion cleanup is spawned; give it a beat to run.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_two_acquires_share_one_checkout() {
    let driver = MockDriver::new();
    let manager = pool_manager(&driver);

    let app = Router::new()
        .route(
            "/",
            get(|db: RequestDb<MockDriver>| async move {
                let first = db.acquire().await.unwrap();
                let second = db.acquire().await.unwrap();
                assert!(first.ptr_eq(&second));
                "ok"
            }),
        )
        .layer(DbConnLayer::new(manager));

    let res = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    res.into_body().collect().await.unwrap();
    settle().await;

    assert_eq!(driver.counters().checkouts(), 1);
    assert_eq!(driver.counters().releases(), 1);
    assert_eq!(driver.counters().outstanding(), 0);
}

#[tokio::test]
async fn test_explicit_release_is_not_repeated_at_completion() {
    let driver = MockDriver::new();
    let manager = pool_manager(&driver);

    let app = Router::new()
        .route(
            "/",
            get(|db: RequestDb<MockDriver>| async move {
                db.acquire().await.unwrap();
                db.release().await;
                "released early"
            }),
        )
        .layer(DbConnLayer::new(manager));

    let res = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    res.into_body().collect().await.unwrap();
    settle().await;

    // One checkout, one release - the completion signal found nothing cached.
    assert_eq!(driver.counters().checkouts(), 1);
    assert_eq!(driver.counters().releases(), 1);
    assert_eq!(driver.counters().outstanding(), 0);
}

#[tokio::test]
async fn test_release_then_reacquire_checks_out_fresh() {
    let driver = MockDriver::new();
    let manager = pool_manager(&driver);

    let app = Router::new()
        .route(
            "/",
            get(|db: RequestDb<MockDriver>| async move {
                let first = db.acquire().await.unwrap();
                db.release().await;
                let second = db.acquire().await.unwrap();
                assert!(!first.ptr_eq(&second));
                "ok"
            }),
        )
        .layer(DbConnLayer::new(manager));

    let res = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    res.into_body().collect().await.unwrap();
    settle().await;

    assert_eq!(driver.counters().checkouts(), 2);
    assert_eq!(driver.counters().releases(), 2);
    assert_eq!(driver.counters().outstanding(), 0);
}

#[tokio::test]
async fn test_sequential_requests_return_gauge_to_baseline() {
    let driver = MockDriver::new();
    let manager = pool_manager(&driver);

    let app = Router::new()
        .route(
            "/",
            get(|db: RequestDb<MockDriver>| async move {
                db.acquire().await.unwrap();
                "ok"
            }),
        )
        .layer(DbConnLayer::new(manager));

    for expected_checkouts in 1..=2 {
        let res = app
            .clone()
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        res.into_body().collect().await.unwrap();
        settle().await;

        assert_eq!(driver.counters().checkouts(), expected_checkouts);
        assert_eq!(driver.counters().outstanding(), 0);
    }
}

#[tokio::test]
async fn test_checkout_failure_reaches_the_handler() {
    let driver = MockDriver::new();
    let manager = pool_manager(&driver);
    driver.pool().unwrap().fail_checkouts(1);

    let app = Router::new()
        .route(
            "/",
            get(|db: RequestDb<MockDriver>| async move {
                match db.acquire().await {
                    Ok(_) => (StatusCode::OK, "connected"),
                    Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database unavailable"),
                }
            }),
        )
        .layer(DbConnLayer::new(manager));

    let res = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    res.into_body().collect().await.unwrap();
    settle().await;

    // Nothing was cached, nothing is released.
    assert_eq!(driver.counters().checkouts(), 0);
    assert_eq!(driver.counters().releases(), 0);
    assert_eq!(driver.counters().outstanding(), 0);
}

#[tokio::test]
async fn test_request_without_any_acquire_releases_nothing() {
    let driver = MockDriver::new();
    let manager = pool_manager(&driver);

    let app = Router::new()
        .route("/", get(|| async { "no database needed" }))
        .layer(DbConnLayer::new(manager));

    let res = app
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    res.into_body().collect().await.unwrap();
    settle().await;

    assert_eq!(driver.counters().checkouts(), 0);
    assert_eq!(driver.counters().releases(), 0);
}
