//! HTTP API for Relay.
//!
//! Read-only views of channel state plus event triggering. Member counts
//! are cluster-wide when replication is enabled; every other view is the
//! local node's.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tenvis_relay_core::{ChannelKind, ConnectionId, ManagerError, Message};
use thiserror::Error;
use tracing::debug;

/// API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The app is not configured.
    #[error("Unknown app: {0}")]
    UnknownApp(String),

    /// The request is malformed.
    #[error("{0}")]
    BadRequest(String),

    /// The channel manager refused the request.
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::UnknownApp(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::Manager(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Query string of the channel listing.
#[derive(Debug, Default, Deserialize)]
pub struct ChannelsQuery {
    /// Only list channels whose name starts with this.
    pub filter_by_prefix: Option<String>,
}

/// Body of an event trigger.
#[derive(Debug, Deserialize)]
pub struct TriggerEvent {
    /// Event name.
    pub name: String,
    /// Target channels.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Single target channel, merged into `channels`.
    #[serde(default)]
    pub channel: Option<String>,
    /// Event data. Strings are sent as is, anything else as JSON.
    pub data: Value,
    /// Connection to exclude from delivery.
    #[serde(default)]
    pub socket_id: Option<String>,
}

/// API routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/apps/:app_id/channels", get(channels))
        .route("/apps/:app_id/channels/:channel", get(channel))
        .route("/apps/:app_id/channels/:channel/users", get(users))
        .route("/apps/:app_id/events", post(trigger))
}

fn ensure_app(state: &AppState, app_id: &str) -> Result<(), ApiError> {
    if state.config.allows_app(app_id) {
        Ok(())
    } else {
        Err(ApiError::UnknownApp(app_id.to_string()))
    }
}

fn parse_kind(channel: &str) -> Result<ChannelKind, ApiError> {
    ChannelKind::parse(channel).map_err(|e| ApiError::Manager(e.into()))
}

/// `GET /apps/{app_id}/channels`: user counts of presence channels.
pub async fn channels(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Query(query): Query<ChannelsQuery>,
) -> Result<Json<Value>, ApiError> {
    ensure_app(&state, &app_id)?;

    let counts = state
        .manager
        .member_counts(&app_id, query.filter_by_prefix.as_deref())
        .await;
    metrics::record_member_query(state.manager.coordinator().is_some());
    debug!(app = %app_id, channels = counts.len(), "Listed channels");

    let channels: Map<String, Value> = counts
        .into_iter()
        .map(|(name, count)| (name, json!({ "user_count": count })))
        .collect();
    Ok(Json(json!({ "channels": channels })))
}

/// `GET /apps/{app_id}/channels/{channel}`: local state of one channel.
pub async fn channel(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    ensure_app(&state, &app_id)?;
    let kind = parse_kind(&channel)?;

    let body = match state.manager.channel_info(&app_id, &channel) {
        Some(info) => {
            let mut body = json!({
                "occupied": info.occupied(),
                "subscription_count": info.subscription_count,
            });
            if let Some(users) = info.user_count {
                body["user_count"] = json!(users);
            }
            body
        }
        None if kind == ChannelKind::Presence => {
            json!({ "occupied": false, "subscription_count": 0, "user_count": 0 })
        }
        None => json!({ "occupied": false, "subscription_count": 0 }),
    };
    Ok(Json(body))
}

/// `GET /apps/{app_id}/channels/{channel}/users`: local presence members.
pub async fn users(
    State(state): State<Arc<AppState>>,
    Path((app_id, channel)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    ensure_app(&state, &app_id)?;
    if parse_kind(&channel)? != ChannelKind::Presence {
        return Err(ApiError::BadRequest(format!(
            "{channel} is not a presence channel"
        )));
    }

    let users: Vec<Value> = state
        .manager
        .members(&app_id, &channel)
        .into_iter()
        .map(|member| json!({ "id": member.user_id }))
        .collect();
    Ok(Json(json!({ "users": users })))
}

/// `POST /apps/{app_id}/events`: publish an event to one or more channels.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(app_id): Path<String>,
    Json(event): Json<TriggerEvent>,
) -> Result<Json<Value>, ApiError> {
    ensure_app(&state, &app_id)?;

    let mut targets = event.channels;
    targets.extend(event.channel);
    if targets.is_empty() {
        return Err(ApiError::BadRequest("No channels given".to_string()));
    }
    for target in &targets {
        parse_kind(target)?;
    }

    let payload = match event.data {
        Value::String(text) => text.into_bytes(),
        other => other.to_string().into_bytes(),
    };
    let except = event.socket_id.map(ConnectionId::from);

    for target in &targets {
        let message = Message::new(target.clone(), payload.clone()).with_event(event.name.clone());
        let delivered = state.manager.publish(&app_id, message, except.as_ref());
        metrics::record_message(metrics::Flow::Api, payload.len());
        debug!(app = %app_id, channel = %target, event = %event.name, delivered, "Triggered event");
    }

    Ok(Json(json!({})))
}
