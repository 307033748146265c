//! Chat creation and membership endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::envelope::{ChatUpdatedPayload, Envelope, EventName};
use crate::models::chat::{kind, role, Chat, ChatMember};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chats", post(create_chat))
        .route("/chats/{chat_id}", axum::routing::patch(update_chat))
        .route("/chats/{chat_id}/members", axum::routing::get(list_members))
}

// ---------------------------------------------------------------------------
// POST /api/v1/chats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateChatRequest {
    /// "private" or "group". Defaults by participant count: two → private.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// Other participants; the creator is always included.
    pub member_ids: Vec<Uuid>,
}

#[utoipa::path(
    post,
    path = "/api/v1/chats",
    tag = "Chats",
    security(("bearer" = [])),
    request_body = CreateChatRequest,
    responses(
        (status = 201, description = "Chat created", body = Chat),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn create_chat(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<Chat>), ApiError> {
    // Participants: the creator plus the listed members, deduplicated.
    let mut member_ids = vec![user_id];
    for id in body.member_ids {
        if !member_ids.contains(&id) {
            member_ids.push(id);
        }
    }

    let chat_kind = match body.kind.as_deref() {
        Some(kind::PRIVATE) => kind::PRIVATE,
        Some(kind::GROUP) => kind::GROUP,
        Some(_) => return Err(ApiError::bad_request("Chat type must be private or group")),
        None if member_ids.len() == 2 => kind::PRIVATE,
        None => kind::GROUP,
    };

    if chat_kind == kind::PRIVATE && member_ids.len() != 2 {
        return Err(ApiError::bad_request(
            "A private chat must have exactly two participants",
        ));
    }

    let name = body.name.as_deref().map(str::trim).unwrap_or("");
    if chat_kind == kind::GROUP && (name.is_empty() || name.len() > 100) {
        return Err(ApiError::validation(vec![FieldError {
            field: "name".into(),
            message: "Group name must be 1–100 characters".into(),
        }]));
    }

    // Every participant must exist before anything is created.
    for id in &member_ids {
        if state.store.get_user(*id).await?.is_none() {
            return Err(ApiError::bad_request(format!("Unknown user: {id}")));
        }
    }

    let chat = state.store.create_chat(chat_kind, name, user_id).await?;
    for id in &member_ids {
        let member_role = if *id == user_id {
            role::OWNER
        } else {
            role::MEMBER
        };
        state.store.create_membership(chat.id, *id, member_role).await?;
    }

    tracing::info!(chat_id = %chat.id, kind = chat_kind, members = member_ids.len(), "chat created");

    // Members with a live session learn about the chat right away.
    let envelope = Envelope::event(EventName::NEW_CHAT, &chat);
    for id in &member_ids {
        state.hub.send_to_user(*id, &envelope).await;
    }

    Ok((StatusCode::CREATED, Json(chat)))
}

// ---------------------------------------------------------------------------
// PATCH /api/v1/chats/:chat_id
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateChatRequest {
    pub name: String,
}

#[utoipa::path(
    patch,
    path = "/api/v1/chats/{chat_id}",
    tag = "Chats",
    security(("bearer" = [])),
    params(
        ("chat_id" = Uuid, Path, description = "Chat ID"),
    ),
    request_body = UpdateChatRequest,
    responses(
        (status = 200, description = "Chat updated", body = Chat),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 403, description = "Not the owner", body = ApiErrorBody),
        (status = 404, description = "Chat not found", body = ApiErrorBody),
    ),
)]
pub async fn update_chat(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Json(body): Json<UpdateChatRequest>,
) -> Result<Json<Chat>, ApiError> {
    let chat = state
        .store
        .get_chat(chat_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Chat not found"))?;

    if chat.owner_id != user_id {
        return Err(ApiError::forbidden("Only the owner can rename a chat"));
    }

    let name = body.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::validation(vec![FieldError {
            field: "name".into(),
            message: "Name must be 1–100 characters".into(),
        }]));
    }

    let updated = state.store.update_chat_name(chat_id, name).await?;

    let envelope = Envelope::event(
        EventName::CHAT_UPDATED,
        ChatUpdatedPayload {
            chat_id: updated.id,
            kind: updated.kind.clone(),
            name: updated.name.clone(),
        },
    );
    state.hub.broadcast_to_chat(chat_id, &envelope, None).await;

    Ok(Json(updated))
}

// ---------------------------------------------------------------------------
// GET /api/v1/chats/:chat_id/members
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/chats/{chat_id}/members",
    tag = "Chats",
    security(("bearer" = [])),
    params(
        ("chat_id" = Uuid, Path, description = "Chat ID"),
    ),
    responses(
        (status = 200, description = "Active members", body = [ChatMember]),
        (status = 403, description = "Not a member", body = ApiErrorBody),
    ),
)]
pub async fn list_members(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
) -> Result<Json<Vec<ChatMember>>, ApiError> {
    if !state.store.is_member(chat_id, user_id).await? {
        return Err(ApiError::forbidden("You are not a member of this chat"));
    }

    Ok(Json(state.store.members_of(chat_id).await?))
}
