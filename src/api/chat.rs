use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ok, ApiResult, AppState};
use crate::auth::AuthUser;
use crate::chat::{validate_session_id, ChatResponse, ChatTurn};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ClearedHistory {
    pub session_id: String,
    pub cleared: bool,
}

pub async fn chat(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let session_id = request
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ok(state
        .rag
        .chat
        .respond(&user.user_id, &session_id, &request.message, user.role)
        .await?)
}

pub async fn history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<Vec<ChatTurn>> {
    ok(state.rag.chat.history(&user.user_id, &session_id).await?)
}

pub async fn clear_history(
    State(state): State<AppState>,
    user: AuthUser,
    Path(session_id): Path<String>,
) -> ApiResult<ClearedHistory> {
    let cleared = state.rag.chat.clear_history(&user.user_id, &session_id).await?;
    ok(ClearedHistory { session_id, cleared })
}

pub async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>, user: AuthUser) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

/// Frames are either `{"session_id": ..., "message": ...}` or plain text.
fn parse_frame(text: &str, default_session: &str) -> (String, String) {
    match serde_json::from_str::<ChatRequest>(text) {
        Ok(request) => (
            request.session_id.unwrap_or_else(|| default_session.to_string()),
            request.message,
        ),
        Err(_) => (default_session.to_string(), text.to_string()),
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, user: AuthUser) {
    let session_id = Uuid::new_v4().to_string();
    info!(user_id = %user.user_id, session_id = %session_id, "chat websocket connected");

    let welcome = json!({
        "type": "welcome",
        "session_id": session_id,
        "timestamp": chrono::Utc::now(),
    });
    if let Err(e) = socket.send(Message::Text(welcome.to_string())).await {
        error!("Failed to send welcome message: {}", e);
        return;
    }

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                let (session, message) = parse_frame(&text, &session_id);
                let reply = if let Err(e) = validate_session_id(&session) {
                    json!({ "type": "error", "error": e.to_string() })
                } else {
                    match state.rag.chat.respond(&user.user_id, &session, &message, user.role).await {
                        Ok(response) => json!({ "type": "response", "data": response }),
                        Err(e) => {
                            warn!(session_id = %session, "websocket chat turn failed: {}", e);
                            json!({ "type": "error", "error": e.to_string() })
                        }
                    }
                };
                if let Err(e) = socket.send(Message::Text(reply.to_string())).await {
                    error!("Failed to send WebSocket response: {}", e);
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket connection closed by client");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    info!(session_id = %session_id, "chat websocket terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_accept_json_or_plain_text() {
        let (session, message) = parse_frame(r#"{"session_id":"s-1","message":"hi"}"#, "default");
        assert_eq!((session.as_str(), message.as_str()), ("s-1", "hi"));

        let (session, message) = parse_frame(r#"{"message":"hello"}"#, "default");
        assert_eq!((session.as_str(), message.as_str()), ("default", "hello"));

        let (session, message) = parse_frame("villas in arabian ranches", "default");
        assert_eq!(session, "default");
        assert_eq!(message, "villas in arabian ranches");
    }
}
