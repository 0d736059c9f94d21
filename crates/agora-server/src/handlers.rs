//! HTTP and WebSocket handlers for the Agora server.
//!
//! The handlers are thin: they resolve the caller's session, validate the
//! request before any upgrade happens and hand the socket to the hub.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, MeteredConnection};
use crate::sqlite::SqliteStore;
use agora_core::{private_participants, Hub, HubError, Identity, StoreError};
use agora_transport::{AxumConnection, Connection};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

const SESSION_COOKIE: &str = "session_token";

/// Shared server state.
pub struct AppState {
    /// The chat hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: Arc<Hub>, config: Config) -> Self {
        Self { hub, config }
    }

    /// User id behind the request's session cookie, if any.
    async fn session_user(&self, headers: &HeaderMap) -> Result<Option<i64>, StoreError> {
        match session_token(headers) {
            Some(token) => self.hub.store().resolve_session(token).await,
            None => Ok(None),
        }
    }

    /// User id for a WebSocket join; unresolvable sessions join as 0.
    async fn session_user_or_anonymous(&self, headers: &HeaderMap) -> i64 {
        match self.session_user(headers).await {
            Ok(id) => id.unwrap_or(0),
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                0
            }
        }
    }

    async fn require_user(&self, headers: &HeaderMap) -> Result<i64, ApiError> {
        self.session_user(headers)
            .await?
            .ok_or(ApiError::Unauthorized)
    }
}

/// Errors returned by the HTTP surface.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No valid session.
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed request.
    #[error("{0}")]
    BadRequest(&'static str),

    /// Rejected by the hub before the upgrade.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Hub(HubError::NotParticipant) => StatusCode::FORBIDDEN,
            ApiError::Hub(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Store(e) => {
                error!(error = %e, "Store error");
                metrics::record_error("store");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Extract the session token from the request cookies.
fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value)
}

/// Query string of a room connection.
#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    room: Option<String>,
    user1: Option<String>,
    user2: Option<String>,
    username: Option<String>,
}

/// Where a room connection is headed, decided before the upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RoomTarget {
    Public(String),
    Private { user1: String, user2: String },
}

impl RoomTarget {
    fn resolve(hub: &Hub, query: &RoomQuery, current: &str) -> Result<Self, HubError> {
        if let Some(room) = query.room.as_deref().filter(|r| !r.is_empty()) {
            hub.validate_room_name(room)?;
            // A private room reached by name still needs its participants' consent.
            if let Some((user1, user2)) = private_participants(room) {
                Hub::authorize_private(&user1, &user2, current)?;
                return Ok(RoomTarget::Private { user1, user2 });
            }
            return Ok(RoomTarget::Public(room.to_string()));
        }

        let user1 = query.user1.as_deref().unwrap_or_default();
        let user2 = query.user2.as_deref().unwrap_or_default();
        Hub::authorize_private(user1, user2, current)?;
        Ok(RoomTarget::Private {
            user1: user1.to_string(),
            user2: user2.to_string(),
        })
    }
}

/// History page query.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    other_user_id: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

fn parse_or<T: std::str::FromStr>(value: Option<&str>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let transport = &state.config.transport;
    Router::new()
        .route(&transport.room_path, get(room_handler))
        .route(&transport.notifications_path, get(notifications_handler))
        .route("/api/online-users", get(online_users))
        .route("/api/chat-messages", get(chat_messages))
        .route("/api/unread-count", get(unread_count))
        .route("/api/recent-chats", get(recent_chats))
        .route("/api/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, presence cannot be
/// restored or the listener cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let store = SqliteStore::connect(&config.database).await?;
    let hub = Arc::new(Hub::with_config(Arc::new(store), config.hub_config()));

    let restored = hub.load_presence().await?;
    info!(online = restored, "Presence restored");

    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => {
                tokio::spawn(refresh_gauges(Arc::clone(&hub)));
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }

    let state = Arc::new(AppState::new(hub, config.clone()));
    let app = router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Agora server listening on {}", addr);
    info!(
        "Room endpoint: ws://{}{}",
        addr, config.transport.room_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Agora server stopped");
    Ok(())
}

async fn refresh_gauges(hub: Arc<Hub>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let stats = hub.stats();
        metrics::set_hub_gauges(stats.rooms, stats.online_users);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    metrics::set_hub_gauges(stats.rooms, stats.online_users);
    Json(stats)
}

/// Room connection: a public room by name, or a private chat by its two
/// participants.
async fn room_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = state.session_user_or_anonymous(&headers).await;
    let identity = Identity::new(query.username.clone().unwrap_or_default(), user_id);
    let target = RoomTarget::resolve(&state.hub, &query, identity.name())?;

    let max_message_size = state.config.limits.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = AxumConnection::new(socket)
                .with_remote_addr(addr.to_string())
                .with_max_message_size(max_message_size);
            serve_room(state, target, Box::new(MeteredConnection::new(conn)), identity).await;
        }))
}

async fn serve_room(
    state: Arc<AppState>,
    target: RoomTarget,
    conn: Box<dyn Connection>,
    identity: Identity,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(connection = %conn.id(), user = %identity.name(), ?target, "Room connection upgraded");

    let result = match target {
        RoomTarget::Public(name) => state.hub.join_room(&name, conn, identity).await,
        RoomTarget::Private { user1, user2 } => {
            state.hub.join_private(&user1, &user2, conn, identity).await
        }
    };
    if let Err(e) = result {
        warn!(error = %e, "Room connection rejected");
        metrics::record_error("hub");
    }
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsQuery {
    username: Option<String>,
}

/// Notification-only connection for a signed-in user.
async fn notifications_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    Query(query): Query<NotificationsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = state.session_user_or_anonymous(&headers).await;
    let identity = Identity::listener(query.username.unwrap_or_default(), user_id)?;

    let max_message_size = state.config.limits.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let _metrics_guard = ConnectionMetricsGuard::new();
            let conn = AxumConnection::new(socket)
                .with_remote_addr(addr.to_string())
                .with_max_message_size(max_message_size);
            if let Err(e) = state
                .hub
                .join_notifications(Box::new(MeteredConnection::new(conn)), identity)
                .await
            {
                warn!(error = %e, "Notification listener rejected");
                metrics::record_error("hub");
            }
        }))
}

/// Online users other than the caller.
async fn online_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let users = match state.session_user(&headers).await? {
        Some(user_id) => match state.hub.store().resolve_username(user_id).await {
            Ok(name) => state.hub.online_users_except(&name),
            Err(StoreError::NotFound) => state.hub.online_users(),
            Err(e) => return Err(e.into()),
        },
        None => state.hub.online_users(),
    };
    Ok(Json(json!({ "users": users })))
}

/// A page of the caller's conversation with another user.
///
/// Fetching a page marks the other user's messages to the caller as read.
async fn chat_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let current = state.require_user(&headers).await?;
    let other: i64 = query
        .other_user_id
        .as_deref()
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::BadRequest("other_user_id is required"))?;

    let limit = parse_or(query.limit.as_deref(), state.config.chat.history_page_size);
    let limit = if limit == 0 {
        state.config.chat.history_page_size
    } else {
        limit
    };
    let offset = parse_or(query.offset.as_deref(), 0u32);

    let store = state.hub.store();
    let messages = store.fetch_messages(current, other, limit, offset).await?;
    if let Err(e) = store.mark_read(other, current).await {
        warn!(user = current, other, error = %e, "Failed to mark messages read");
    }

    let has_more = messages.len() == limit as usize;
    Ok(Json(json!({ "messages": messages, "hasMore": has_more })))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let current = state.require_user(&headers).await?;
    let count = state.hub.store().unread_count(current).await?;
    Ok(Json(json!({ "unread_count": count })))
}

async fn recent_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let current = state.require_user(&headers).await?;
    let chats = match state
        .hub
        .store()
        .recent_chats(current, state.config.chat.recent_chats_limit)
        .await
    {
        Ok(chats) => chats,
        Err(e) => {
            warn!(user = current, error = %e, "Failed to load recent chats");
            Vec::new()
        }
    };
    Ok(Json(json!({ "recent_chats": chats })))
}
