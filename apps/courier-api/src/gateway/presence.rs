//! Presence policy.
//!
//! Not a separate loop: a user is online iff a live session exists for them
//! in the hub's map. The hub emits the transition envelopes on register and
//! deregister and informs persistence best-effort; the broadcast is
//! authoritative for real-time consumers.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::store::ChatStore;

use super::envelope::{Envelope, EventName, UserStatusPayload};

/// Build the `user_online` envelope for a user who just registered.
pub fn online_envelope(user_id: Uuid, username: &str) -> Envelope {
    Envelope::event(
        EventName::USER_ONLINE,
        UserStatusPayload {
            user_id,
            username: username.to_string(),
            is_online: true,
            last_seen: None,
        },
    )
}

/// Build the `user_offline` envelope for a user whose last session left.
pub fn offline_envelope(user_id: Uuid, username: &str) -> Envelope {
    Envelope::event(
        EventName::USER_OFFLINE,
        UserStatusPayload {
            user_id,
            username: username.to_string(),
            is_online: false,
            last_seen: Some(Utc::now()),
        },
    )
}

/// Record the online flag in persistence. Fire-and-forget: the hub loop must
/// not block on store I/O, and a failure only degrades the `last_seen` shown
/// to REST consumers.
pub fn mark(store: Arc<dyn ChatStore>, user_id: Uuid, online: bool) {
    tokio::spawn(async move {
        if let Err(err) = store.set_online(user_id, online).await {
            tracing::warn!(%user_id, online, %err, "failed to persist presence");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_envelope_shape() {
        let user_id = Uuid::new_v4();
        let env = online_envelope(user_id, "alice");
        let value: serde_json::Value = serde_json::from_str(&env.to_frame()).unwrap();

        assert_eq!(value["type"], "user_online");
        assert_eq!(value["payload"]["user_id"], user_id.to_string());
        assert_eq!(value["payload"]["username"], "alice");
        assert_eq!(value["payload"]["is_online"], true);
        assert!(value["payload"].get("last_seen").is_none());
    }

    #[test]
    fn offline_envelope_carries_last_seen() {
        let env = offline_envelope(Uuid::new_v4(), "alice");
        let value: serde_json::Value = serde_json::from_str(&env.to_frame()).unwrap();

        assert_eq!(value["type"], "user_offline");
        assert_eq!(value["payload"]["is_online"], false);
        assert!(value["payload"]["last_seen"].is_string());
    }
}
