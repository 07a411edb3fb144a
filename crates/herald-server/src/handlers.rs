//! HTTP and WebSocket handlers for the Herald server.
//!
//! Public listener (`host:port`):
//! - `GET  /ws` (configurable) - WebSocket upgrade, identity from [`AuthenticatedUser`]
//! - `GET  /health` - liveness and accepting flag
//!
//! Internal listener (`internal.host:internal.port`, loopback by default).
//! These routes carry no identity check, so the listener must stay
//! unreachable from clients:
//! - `GET  /health` - liveness and accepting flag
//! - `GET  /admin/stats` - hub statistics
//! - `GET  /admin/users` - connected user IDs
//! - `GET  /admin/users/:user_id/connections` - per-connection details
//! - `DELETE /admin/users/:user_id/connections` - force disconnect
//! - `POST /internal/notifications` - producer entry point

use crate::auth::{self, AuthenticatedUser};
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use herald_core::{DeliveryReport, Hub, HubError};
use herald_protocol::{codec, Encoding, Notification, UserId, Version, PROTOCOL_VERSION};
use herald_transport::WebSocketTransport;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared server state.
pub struct AppState {
    /// The notification hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state around a hub.
    #[must_use]
    pub fn new(config: Config, hub: Arc<Hub>) -> Self {
        Self { hub, config }
    }
}

/// Build the client-facing router.
pub fn public_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::identify,
        ))
        .with_state(state)
}

/// Build the admin and producer router.
pub fn internal_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/admin/stats", get(stats_handler))
        .route("/admin/users", get(users_handler))
        .route(
            "/admin/users/:user_id/connections",
            get(user_connections_handler).delete(disconnect_user_handler),
        )
        .route("/internal/notifications", post(publish_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal, then drain the hub.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let hub = Arc::new(Hub::new(config.hub_config()));
    let maintenance = hub.spawn_maintenance();
    let state = Arc::new(AppState::new(config.clone(), Arc::clone(&hub)));

    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => metrics::init_metrics(),
            Err(e) => error!(error = %e, "Failed to start metrics server"),
        }
    }

    let app = public_router(Arc::clone(&state));
    let internal_app = internal_router(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let internal_addr = config.internal_addr()?;
    let internal_listener = TcpListener::bind(internal_addr)
        .await
        .with_context(|| format!("Failed to bind {internal_addr}"))?;

    info!("Herald server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    info!("Internal API listening on {}", internal_addr);

    // The internal listener outlives the drain so admin routes stay usable.
    let (stopped_tx, mut stopped_rx) = watch::channel(false);
    let internal = tokio::spawn(async move {
        axum::serve(internal_listener, internal_app)
            .with_graceful_shutdown(async move {
                let _ = stopped_rx.changed().await;
            })
            .await
    });

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub, config.shutdown_timeout()))
    .await;
    let _ = stopped_tx.send(true);
    served?;

    match internal.await {
        Ok(result) => result.context("Internal listener failed")?,
        Err(e) => warn!(error = %e, "Internal listener ended abnormally"),
    }

    if let Err(e) = maintenance.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }
    info!("Herald server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM, then drain the hub before the listener closes.
async fn shutdown_signal(hub: Arc<Hub>, timeout: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    let report = hub.shutdown(timeout).await;
    info!(
        connections = report.connections,
        forced = report.forced,
        "Connections drained"
    );
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let accepting = state.hub.is_accepting();
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(serde_json::json!({
        "status": if accepting { "ok" } else { "draining" },
        "accepting": accepting,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
    }));
    (status, body).into_response()
}

/// Upgrade query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// `json` (default) or `msgpack`.
    pub format: Option<String>,
    /// Protocol version the client speaks, e.g. `1` or `1.0`.
    pub protocol: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    user: Option<Extension<AuthenticatedUser>>,
    remote: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<WsQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let identity = user.map(|Extension(AuthenticatedUser(user_id))| user_id);
    state.hub.check_admission(identity.as_ref())?;

    let encoding = match query.format.as_deref() {
        None => Encoding::default(),
        Some(format) => format
            .parse::<Encoding>()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?,
    };

    if let Some(protocol) = query.protocol.as_deref() {
        let version = protocol
            .parse::<Version>()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        if !version.is_compatible_with(&PROTOCOL_VERSION) {
            return Err(ApiError::UnsupportedVersion(version.to_string()));
        }
    }

    let ws = ws.map_err(|rejection| HubError::UpgradeFailed(rejection.body_text()))?;
    let remote_addr = remote.map(|ConnectInfo(addr)| addr);
    let hub = Arc::clone(&state.hub);

    debug!(remote = ?remote_addr, encoding = encoding.as_str(), "Upgrading connection");
    Ok(ws
        .max_message_size(codec::MAX_FRAME_SIZE)
        .on_failed_upgrade(|e| {
            herald_core::metrics::record_upgrade_failure();
            warn!(error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let transport = WebSocketTransport::new(socket, remote_addr);
            if let Err(e) = hub.accept(identity, Box::new(transport), encoding).await {
                warn!(error = %e, "Connection not accepted");
            }
        }))
}

/// Statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.stats())
}

#[derive(Debug, Serialize)]
struct UsersResponse {
    count: usize,
    users: Vec<UserId>,
}

/// Connected users handler.
async fn users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let users = state.hub.connected_users();
    Json(UsersResponse {
        count: users.len(),
        users,
    })
}

/// Per-user connection listing.
async fn user_connections_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let user_id = UserId::new(user_id);
    let connections = state.hub.connections_for(&user_id);
    Json(serde_json::json!({
        "user_id": user_id,
        "connections": connections,
    }))
}

/// Force-disconnect every connection of a user.
async fn disconnect_user_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let user_id = UserId::new(user_id);
    let disconnected = state.hub.disconnect_user(&user_id);
    Json(serde_json::json!({
        "user_id": user_id,
        "disconnected": disconnected,
    }))
}

#[derive(Debug, Serialize)]
struct PublishResponse {
    notification_id: Uuid,
    broadcast: bool,
    report: DeliveryReport,
}

/// Producer entry point: route a notification to its target or broadcast it.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Notification>, JsonRejection>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let Json(notification) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let notification_id = notification.id;
    let broadcast = notification.is_broadcast();

    let report = state.hub.send(notification);
    debug!(
        notification = %notification_id,
        broadcast,
        delivered = report.delivered,
        "Notification published"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            notification_id,
            broadcast,
            report,
        }),
    ))
}
