//! Room registry: creation, lookup, deletion, and token authentication.
//!
//! Rooms are the unit of authentication — one token covers every document
//! under the room plus its control channel. The registry is an in-memory map
//! hydrated from the store at startup; mutations write through.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::Persistence;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_HOST_ID_LEN: usize = 128;

/// Effective rights of a control-channel participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[default]
    #[serde(rename = "read-write")]
    ReadWrite,
    #[serde(rename = "read-only")]
    ReadOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub token: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_user_id: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_permission: Option<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<String>>,
}

impl Room {
    /// Mint a room with a fresh identifier and token.
    pub fn generate(name: String, host_user_id: Option<String>) -> Self {
        Self {
            id: generate_room_id(),
            token: generate_room_token(),
            name,
            created_at: Utc::now(),
            host_user_id,
            require_approval: false,
            default_permission: None,
            participants: None,
        }
    }
}

/// 32 hex chars, comfortably above the 12-char floor.
pub fn generate_room_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 32 random bytes, base64url — 43 chars against the 24-char floor.
pub fn generate_room_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare two byte strings without an early exit. Unequal lengths still
/// fold over the shorter input so the timing depends on length alone, which
/// is public.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn has_control_bytes(s: &str) -> bool {
    s.bytes().any(|b| b < 0x20 || b == 0x7F)
}

pub fn validate_room_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::BadRequest("room name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "room name exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if has_control_bytes(name) {
        return Err(ApiError::BadRequest(
            "room name contains control characters".into(),
        ));
    }
    Ok(())
}

pub fn validate_host_user_id(host_user_id: &str) -> Result<(), ApiError> {
    if host_user_id.len() > MAX_HOST_ID_LEN {
        return Err(ApiError::BadRequest(format!(
            "host user id exceeds {MAX_HOST_ID_LEN} characters"
        )));
    }
    if has_control_bytes(host_user_id) {
        return Err(ApiError::BadRequest(
            "host user id contains control characters".into(),
        ));
    }
    Ok(())
}

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    store: Arc<dyn Persistence>,
}

impl RoomRegistry {
    /// Hydrate the registry from the store.
    pub fn load(store: Arc<dyn Persistence>) -> Result<Self, crate::store::StoreError> {
        let rooms: HashMap<String, Room> = store
            .load_all_rooms()?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();
        if !rooms.is_empty() {
            info!(count = rooms.len(), "restored rooms from store");
        }
        Ok(Self {
            rooms: RwLock::new(rooms),
            store,
        })
    }

    /// Create and persist a room. Input validation happens here so every
    /// caller gets the same 400 behavior.
    pub async fn create(
        &self,
        name: String,
        host_user_id: Option<String>,
        require_approval: bool,
        default_permission: Option<Permission>,
    ) -> Result<Room, ApiError> {
        validate_room_name(&name)?;
        if let Some(host) = &host_user_id {
            validate_host_user_id(host)?;
        }

        let mut room = Room::generate(name, host_user_id);
        room.require_approval = require_approval;
        room.default_permission = default_permission;

        if let Err(e) = self.store.save_room(&room) {
            // The room still exists for this process lifetime.
            error!(room = %room.id, error = %e, "failed to persist room");
        }
        self.rooms
            .write()
            .await
            .insert(room.id.clone(), room.clone());
        info!(room = %room.id, "room created");
        Ok(room)
    }

    pub async fn get(&self, id: &str) -> Option<Room> {
        self.rooms.read().await.get(id).cloned()
    }

    /// Verify `token` against the room's token in constant time.
    pub async fn authenticate(&self, id: &str, token: &str) -> Result<Room, ApiError> {
        let room = self.get(id).await.ok_or(ApiError::NotFound)?;
        if !constant_time_eq(room.token.as_bytes(), token.as_bytes()) {
            return Err(ApiError::Forbidden);
        }
        Ok(room)
    }

    /// Delete a room, authorized by its bearer token.
    pub async fn delete(&self, id: &str, token: &str) -> Result<(), ApiError> {
        let room = self.get(id).await.ok_or(ApiError::NotFound)?;
        if !constant_time_eq(room.token.as_bytes(), token.as_bytes()) {
            return Err(ApiError::Forbidden);
        }
        self.rooms.write().await.remove(id);
        if let Err(e) = self.store.delete_room(id) {
            error!(room = %id, error = %e, "failed to delete room from store");
        }
        info!(room = %id, "room deleted");
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
