//! Opaque bearer access tokens, stored in the key-value store.
//!
//! Tokens are random, carry no claims, and resolve to a cached
//! `(user_id, username)` identity on lookup.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

/// Access token TTL in seconds (7 days).
pub const ACCESS_TOKEN_TTL_SECS: u64 = 7 * 24 * 3600;

/// Identity stored alongside an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenData {
    pub user_id: Uuid,
    pub username: String,
}

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

/// Mint an access token for the given identity and store it.
pub async fn issue_access_token(
    kv: &dyn KeyValueStore,
    user_id: Uuid,
    username: &str,
) -> Result<String, ApiError> {
    let token = generate_opaque_token(courier_common::id::prefix::ACCESS_TOKEN, 32);
    let data = AccessTokenData {
        user_id,
        username: username.to_string(),
    };
    store_access_token(kv, &token, &data).await?;
    Ok(token)
}

pub async fn store_access_token(
    kv: &dyn KeyValueStore,
    token: &str,
    data: &AccessTokenData,
) -> Result<(), ApiError> {
    let key = format!("courier:act:{}", token);
    let value = serde_json::to_string(data).map_err(|_| ApiError::internal("serialization"))?;
    kv.set_ex(&key, &value, ACCESS_TOKEN_TTL_SECS).await
}

pub async fn lookup_access_token(
    kv: &dyn KeyValueStore,
    token: &str,
) -> Result<Option<AccessTokenData>, ApiError> {
    let key = format!("courier:act:{}", token);
    match kv.get(&key).await? {
        Some(v) => {
            let data: AccessTokenData =
                serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt token data"))?;
            Ok(Some(data))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv::MemoryKv;

    #[tokio::test]
    async fn issue_and_lookup_round_trip() {
        let kv = MemoryKv::new();
        let user_id = Uuid::new_v4();

        let token = issue_access_token(&kv, user_id, "alice").await.unwrap();
        assert!(token.starts_with("act_"));

        let data = lookup_access_token(&kv, &token).await.unwrap().unwrap();
        assert_eq!(data.user_id, user_id);
        assert_eq!(data.username, "alice");
    }

    #[tokio::test]
    async fn unknown_token_resolves_to_none() {
        let kv = MemoryKv::new();
        assert!(lookup_access_token(&kv, "act_bogus")
            .await
            .unwrap()
            .is_none());
    }
}
