//! Quick-session lifecycle endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::guacamole::Protocol;
use crate::sessions::codes;
use crate::AppState;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CreateRequest {
    pub protocol: String,
}

/// `POST /quick` — allocate a session id and describe what the client can do
/// with it. The id's `{protocol}_` prefix later routes file-management calls.
pub async fn create(
    State(_state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let protocol_name = if req.protocol.is_empty() {
        "ssh".to_owned()
    } else {
        req.protocol
    };
    let protocol: Protocol = protocol_name.parse().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": format!("unsupported protocol {protocol_name:?}")})),
        )
    })?;

    let id = format!("{}_{}", protocol.as_str(), uuid::Uuid::new_v4());
    let file_system = matches!(protocol, Protocol::Ssh | Protocol::Rdp);
    Ok(Json(json!({
        "id": id,
        "protocol": protocol.as_str(),
        "capabilities": {
            "fileSystem": file_system,
            "monitor": true,
        },
    })))
}

/// `POST /quick/{id}/disconnect` — force-close a live session.
pub async fn disconnect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let closed = state
        .registry
        .close_session(&session_id, codes::FORCED_DISCONNECT, "Forced disconnect")
        .await;
    if closed {
        (StatusCode::OK, Json(json!({"closed": true})))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "closed": false,
                "code": codes::NOT_FOUND_SESSION,
                "message": "session not found",
            })),
        )
    }
}
