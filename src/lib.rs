//! axum-dbconn
//!
//! Request-scoped database connection middleware for axum/tower. Binds a
//! connection to each inbound request under one of three acquisition
//! strategies - a supervised shared connection, a driver pool, or a dedicated
//! per-request connection - and guarantees the connection is released exactly
//! once when the request completes, whether normally or by client disconnect.
//!
//! The database itself is behind the [`driver::Driver`] trait family; this
//! crate ships an always-available mock driver for tests and an optional
//! sqlx-backed MySQL driver (feature `mysql`).
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{Router, routing::get};
//! use axum_dbconn::{BindOptions, ConnectionManager, DbConnLayer, RequestDb};
//! use axum_dbconn::driver::mock::MockDriver;
//!
//! # async fn run() {
//! let manager = ConnectionManager::new(
//!     MockDriver::new(),
//!     "mock://db".to_string(),
//!     BindOptions::default(),
//! )
//! .unwrap();
//!
//! let app: Router = Router::new()
//!     .route("/", get(|db: RequestDb<MockDriver>| async move {
//!         let _conn = db.acquire().await.unwrap();
//!         "ok"
//!     }))
//!     .layer(DbConnLayer::new(Arc::clone(&manager)));
//! # let _ = app;
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod extract;
pub mod layer;
pub mod manager;
pub mod pool_layer;
pub mod reconnect;
pub mod request;

mod source;

pub use config::{BindOptions, ConnectionStrategy, DEFAULT_RETRY_DELAY_MS};
pub use error::{AcquireError, ConfigError, DriverError, PROTOCOL_CONNECTION_LOST};
pub use extract::MissingDbConnLayer;
pub use layer::DbConnLayer;
pub use manager::{ConnectionManager, ManagerStatus};
pub use pool_layer::{EagerConnection, EagerPoolLayer};
pub use reconnect::{SharedConnection, SupervisionChannel};
pub use request::{ConnectionHandle, RequestDb};
