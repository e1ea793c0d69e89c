//! Configuration for the RTM client

use crate::auth::{AuthProvider, RoleSecretAuth};
use crate::error::{Result, RtmError};
use crate::observer::DEFAULT_QUEUE_CAPACITY;
use crate::transport::Dialer;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound of the reconnect backoff
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);

/// Configuration for connecting to an RTM endpoint
#[derive(Clone)]
pub struct RtmConfig {
    /// Service endpoint (e.g., "wss://xxx.api.satori.com")
    pub endpoint: String,

    /// Application key, sent as the `appkey` query parameter
    pub app_key: String,

    /// Authentication run on every new connection
    pub auth: Option<Arc<dyn AuthProvider>>,

    /// HTTP proxy to tunnel WebSocket connections through
    pub proxy: Option<String>,

    /// Maximum delay between reconnection attempts
    pub max_reconnect_delay: Duration,

    /// Bound of each event queue (client and subscriptions)
    pub event_queue_capacity: usize,

    /// Transport to dial with; WebSocket when unset
    pub dialer: Option<Arc<dyn Dialer>>,
}

impl RtmConfig {
    /// Create a new configuration with the given endpoint and app key
    pub fn new(endpoint: impl Into<String>, app_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_key: app_key.into(),
            auth: None,
            proxy: None,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dialer: None,
        }
    }

    /// Authenticate with a role and its secret
    pub fn auth(self, auth: RoleSecretAuth) -> Self {
        self.auth_provider(Arc::new(auth))
    }

    /// Authenticate with a custom provider
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Tunnel connections through an HTTP proxy
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Cap the reconnect backoff
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    /// Set the event queue bound
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Use a custom transport
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Reject configurations the client cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(RtmError::EmptyEndpoint);
        }
        if self.app_key.is_empty() {
            return Err(RtmError::EmptyAppKey);
        }
        Ok(())
    }
}

impl fmt::Debug for RtmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtmConfig")
            .field("endpoint", &self.endpoint)
            .field("app_key", &"[REDACTED]")
            .field("auth", &self.auth.is_some())
            .field("proxy", &self.proxy)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("event_queue_capacity", &self.event_queue_capacity)
            .field("dialer", &self.dialer.is_some())
            .finish()
    }
}
