//! Invite string encoding, reproduced here for interoperability.
//!
//! Clients exchange invites out of band; the relay never sees one. The format
//! is the literal prefix `obsliveshare:` followed by base64 of a JSON object
//! `{s: serverUrl, r: roomId, t: roomToken}`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INVITE_PREFIX: &str = "obsliveshare:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    /// Server base URL, `http:` or `https:` only.
    #[serde(rename = "s")]
    pub server_url: String,
    #[serde(rename = "r")]
    pub room_id: String,
    #[serde(rename = "t")]
    pub room_token: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InviteError {
    #[error("missing invite prefix")]
    MissingPrefix,
    #[error("invalid invite encoding")]
    InvalidEncoding,
    #[error("server url must be http or https")]
    InvalidServerUrl,
}

impl Invite {
    pub fn new(server_url: String, room_id: String, room_token: String) -> Self {
        Self {
            server_url,
            room_id,
            room_token,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("invite serialization");
        format!("{INVITE_PREFIX}{}", STANDARD.encode(json))
    }

    pub fn decode(s: &str) -> Result<Self, InviteError> {
        let encoded = s
            .trim()
            .strip_prefix(INVITE_PREFIX)
            .ok_or(InviteError::MissingPrefix)?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| InviteError::InvalidEncoding)?;
        let invite: Invite =
            serde_json::from_slice(&bytes).map_err(|_| InviteError::InvalidEncoding)?;
        if !invite.server_url.starts_with("http://") && !invite.server_url.starts_with("https://") {
            return Err(InviteError::InvalidServerUrl);
        }
        Ok(invite)
    }
}
