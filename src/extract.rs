//! axum extractors for the request-surface extensions.

use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use http::request::Parts;

use crate::driver::{Driver, Pool};
use crate::pool_layer::EagerConnection;
use crate::request::RequestDb;

/// Rejection returned when the binding layer is not installed on the route.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("database binding layer is not installed on this route")]
pub struct MissingDbConnLayer;

impl IntoResponse for MissingDbConnLayer {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

impl<D: Driver, S: Send + Sync> FromRequestParts<S> for RequestDb<D> {
    type Rejection = MissingDbConnLayer;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestDb<D>>()
            .cloned()
            .ok_or(MissingDbConnLayer)
    }
}

impl<P: Pool, S: Send + Sync> FromRequestParts<S> for EagerConnection<P> {
    type Rejection = MissingDbConnLayer;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<EagerConnection<P>>()
            .cloned()
            .ok_or(MissingDbConnLayer)
    }
}
