//! Authentication against the RTM service
//!
//! Authentication runs on a freshly opened connection, before the client
//! reports itself connected. The only built-in method is `role_secret`: a
//! two-step HMAC-MD5 challenge/response keyed with the role secret.

mod role_secret;

pub use role_secret::{hmac_md5, RoleSecretAuth};

use crate::connection::Connection;
use crate::error::Result;
pub use async_trait::async_trait;

/// Authenticates a connection
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Run the authentication exchange. A response reader must already be
    /// draining `conn`.
    async fn authenticate(&self, conn: &Connection) -> Result<()>;
}
