//! Role secret authentication
//!
//! 1. `auth/handshake` with the role name; the service answers with a nonce.
//! 2. `auth/authenticate` with `base64(HMAC-MD5(secret, nonce))`.

use super::{async_trait, AuthProvider};
use crate::connection::Connection;
use crate::error::{Result, RtmError};
use crate::pdu::{Outcome, Pdu, ACTION_AUTHENTICATE, ACTION_HANDSHAKE};

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use md5::Md5;
use serde_json::json;
use std::fmt;
use tracing::{debug, info};

type HmacMd5 = Hmac<Md5>;

/// Base64-encoded HMAC-MD5 of `message` keyed with `secret`
pub fn hmac_md5(message: &str, secret: &str) -> Result<String> {
    let mut mac = HmacMd5::new_from_slice(secret.as_bytes())
        .map_err(|e| RtmError::Authentication(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// `role_secret` credentials
#[derive(Clone)]
pub struct RoleSecretAuth {
    role: String,
    secret: String,
}

impl RoleSecretAuth {
    pub fn new(role: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            secret: secret.into(),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }
}

impl fmt::Debug for RoleSecretAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleSecretAuth")
            .field("role", &self.role)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Send one request and require an OK answer
async fn round_trip(conn: &Connection, action: &str, body: serde_json::Value) -> Result<Pdu> {
    let waiter = conn
        .send_ack(action, body)
        .await
        .map_err(|e| RtmError::Authentication(e.to_string()))?;

    let response = waiter
        .response()
        .await
        .map_err(|_| RtmError::Authentication("Broken connection".to_string()))?;

    match response.outcome() {
        Outcome::Ok => Ok(response),
        _ => Err(RtmError::Authentication(response.body.to_string())),
    }
}

#[async_trait]
impl AuthProvider for RoleSecretAuth {
    async fn authenticate(&self, conn: &Connection) -> Result<()> {
        info!(role = %self.role, "Starting authentication");

        let handshake = round_trip(
            conn,
            ACTION_HANDSHAKE,
            json!({"method": "role_secret", "data": {"role": self.role}}),
        )
        .await?;

        let nonce = handshake
            .body
            .pointer("/data/nonce")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RtmError::Authentication("Handshake response has no nonce".into()))?;
        debug!("Got nonce");

        let hash = hmac_md5(nonce, &self.secret)?;
        round_trip(
            conn,
            ACTION_AUTHENTICATE,
            json!({"method": "role_secret", "credentials": {"hash": hash}}),
        )
        .await?;

        info!(role = %self.role, "Authenticated");
        Ok(())
    }
}
