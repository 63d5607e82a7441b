//! Identity token verification and the GitHub OAuth exchange.
//!
//! Identity tokens are HS256 JWTs signed with a process-wide shared secret.
//! The relay never issues sessions of its own — it only verifies that the
//! bearer came through the configured OAuth dance. Expired and wrong-secret
//! tokens are rejected identically so a probe learns nothing.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Stable subject, e.g. the provider's numeric user id.
    pub sub: String,
    pub username: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(
        rename = "avatarUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar_url: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

pub struct IdentityVerifier {
    key: DecodingKey,
}

impl IdentityVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// `None` for anything unacceptable — bad signature, bad shape, expired.
    pub fn verify(&self, token: &str) -> Option<IdentityClaims> {
        let validation = Validation::new(Algorithm::HS256);
        match decode::<IdentityClaims>(token, &self.key, &validation) {
            Ok(data) => Some(data.claims),
            Err(_) => {
                debug!("rejected identity token");
                None
            }
        }
    }
}

/// Sign an identity token. Used by the OAuth callback and by tests.
pub fn sign_identity(
    secret: &str,
    claims: &IdentityClaims,
) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

const IDENTITY_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

/// GitHub OAuth client state shared by the two `/auth/github` handlers.
#[derive(Clone)]
pub struct GithubOauth {
    client_id: String,
    client_secret: String,
    jwt_secret: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    name: Option<String>,
    avatar_url: Option<String>,
}

impl GithubOauth {
    pub fn new(client_id: String, client_secret: String, jwt_secret: String) -> Self {
        Self {
            client_id,
            client_secret,
            jwt_secret,
            http: reqwest::Client::new(),
        }
    }

    pub fn authorize_url(&self) -> String {
        format!(
            "https://github.com/login/oauth/authorize?client_id={}&scope=read:user",
            self.client_id
        )
    }

    /// Trade the callback `code` for a signed identity token.
    pub async fn exchange_code(&self, code: &str) -> Result<(String, IdentityClaims), ApiError> {
        let token_resp: AccessTokenResponse = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .header("accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| ApiError::BadRequest(format!("oauth exchange failed: {e}")))?
            .json()
            .await
            .map_err(|e| ApiError::BadRequest(format!("oauth exchange failed: {e}")))?;

        let access_token = token_resp
            .access_token
            .ok_or_else(|| ApiError::BadRequest("oauth code rejected".into()))?;

        let user: GithubUser = self
            .http
            .get("https://api.github.com/user")
            .header("authorization", format!("Bearer {access_token}"))
            .header("user-agent", "liveshare-relay")
            .header("accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ApiError::BadRequest(format!("profile fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| ApiError::BadRequest(format!("profile fetch failed: {e}")))?;

        let now = chrono::Utc::now().timestamp();
        let claims = IdentityClaims {
            sub: user.id.to_string(),
            username: user.login.clone(),
            display_name: user.name.unwrap_or(user.login),
            avatar_url: user.avatar_url,
            iat: now,
            exp: now + IDENTITY_TOKEN_TTL_SECS,
        };

        let token = sign_identity(&self.jwt_secret, &claims)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok((token, claims))
    }
}
