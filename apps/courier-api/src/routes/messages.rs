//! Message endpoints.
//!
//! Sending goes through the same persist+broadcast path as the socket
//! intent, so HTTP-sent messages reach live subscribers identically.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::handler::{self, PostMessageError, HISTORY_REPLAY_LIMIT};
use crate::gateway::envelope::MessagePayload;
use crate::models::message::Message;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/chats/{chat_id}/messages",
        post(send_message).get(list_messages),
    )
}

// ---------------------------------------------------------------------------
// POST /api/v1/chats/:chat_id/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
}

#[utoipa::path(
    post,
    path = "/api/v1/chats/{chat_id}/messages",
    tag = "Messages",
    security(("bearer" = [])),
    params(
        ("chat_id" = Uuid, Path, description = "Chat ID"),
    ),
    request_body = SendMessageRequest,
    responses(
        (status = 201, description = "Message sent", body = MessagePayload),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Not a member", body = ApiErrorBody),
    ),
)]
pub async fn send_message(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), ApiError> {
    let message = handler::post_message(
        &state,
        user_id,
        chat_id,
        &body.content,
        body.message_type,
        body.media_url,
        body.reply_to_id,
    )
    .await
    .map_err(|err| match err {
        PostMessageError::NotMember => ApiError::forbidden("You are not a member of this chat"),
        PostMessageError::EmptyContent => ApiError::validation(vec![FieldError {
            field: "content".into(),
            message: "Message content is required".into(),
        }]),
        PostMessageError::Store(err) => ApiError::from(err),
    })?;

    Ok((StatusCode::CREATED, Json(message)))
}

// ---------------------------------------------------------------------------
// GET /api/v1/chats/:chat_id/messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListMessagesParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListMessagesResponse {
    pub data: Vec<Message>,
}

#[utoipa::path(
    get,
    path = "/api/v1/chats/{chat_id}/messages",
    tag = "Messages",
    security(("bearer" = [])),
    params(
        ("chat_id" = Uuid, Path, description = "Chat ID"),
        ("limit" = Option<i64>, Query, description = "Window size (1-100, default 50)"),
        ("offset" = Option<i64>, Query, description = "How many newest messages to skip"),
    ),
    responses(
        (status = 200, description = "Messages, oldest first", body = ListMessagesResponse),
        (status = 403, description = "Not a member", body = ApiErrorBody),
    ),
)]
pub async fn list_messages(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<ListMessagesResponse>, ApiError> {
    if !state.store.is_member(chat_id, user_id).await? {
        return Err(ApiError::forbidden("You are not a member of this chat"));
    }

    let limit = params.limit.unwrap_or(HISTORY_REPLAY_LIMIT).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);

    let data = state.store.recent_messages(chat_id, limit, offset).await?;

    Ok(Json(ListMessagesResponse { data }))
}
