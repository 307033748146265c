pub mod auth;
pub mod chats;
pub mod health;
pub mod messages;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().merge(health::router()).nest(
        "/api/v1",
        auth::router()
            .merge(chats::router())
            .merge(messages::router())
            .merge(crate::gateway::server::router()),
    )
}

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::register,
        auth::login,
        chats::create_chat,
        chats::update_chat,
        chats::list_members,
        messages::send_message,
        messages::list_messages,
    ),
    components(schemas(
        crate::error::ApiErrorBody,
        crate::error::ApiErrorDetail,
        crate::error::FieldError,
        crate::models::user::UserResponse,
        crate::models::chat::Chat,
        crate::models::chat::ChatMember,
        crate::models::message::Message,
        crate::gateway::envelope::MessagePayload,
        auth::RegisterRequest,
        auth::LoginRequest,
        auth::AuthResponse,
        chats::CreateChatRequest,
        chats::UpdateChatRequest,
        messages::SendMessageRequest,
        messages::ListMessagesResponse,
    )),
    tags(
        (name = "Auth", description = "Registration, login, and token issuance"),
        (name = "Chats", description = "Chat creation and membership"),
        (name = "Messages", description = "Message history and sending"),
    )
)]
pub struct ApiDoc;
