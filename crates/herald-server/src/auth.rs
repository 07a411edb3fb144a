//! Identity propagation.
//!
//! Authentication happens upstream. The gateway in front of Herald sets a
//! trusted header with the authenticated user ID; this middleware lifts it
//! into an [`AuthenticatedUser`] request extension for the handlers.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use herald_protocol::UserId;
use std::sync::Arc;
use tracing::trace;

use crate::handlers::AppState;

/// The authenticated caller, attached by [`identify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub UserId);

/// Attach the caller's identity from the configured header, if present.
pub async fn identify(State(state): State<Arc<AppState>>, mut request: Request, next: Next) -> Response {
    let identity = request
        .headers()
        .get(state.config.auth.user_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(UserId::new);

    if let Some(user_id) = identity {
        trace!(user = %user_id, "Request identified");
        request.extensions_mut().insert(AuthenticatedUser(user_id));
    }

    next.run(request).await
}
