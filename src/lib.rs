//! RTM client - publish/subscribe over WebSocket
//!
//! A client for the RTM real-time messaging service. It keeps a single
//! WebSocket connection open, reconnects with backoff when it drops,
//! re-establishes every subscription after a reconnect and correlates
//! request/response PDUs by id.
//!
//! ```no_run
//! use rtm_client::{RoleSecretAuth, RtmClient, RtmConfig, SubscribeOptions, SubscriptionMode};
//!
//! # async fn run() -> rtm_client::Result<()> {
//! let config = RtmConfig::new("wss://rtm.example.com", "app-key")
//!     .auth(RoleSecretAuth::new("role", "secret"));
//! let client = RtmClient::new(config)?;
//! client.start();
//!
//! let sub = client
//!     .subscribe("animals", SubscriptionMode::RELIABLE, SubscribeOptions::default())
//!     .await?;
//! sub.on_data(|message| println!("{message}"));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod fsm;
pub mod observer;
pub mod pdu;
pub mod subscription;
pub mod transport;

pub use auth::{AuthProvider, RoleSecretAuth};
pub use client::{ClientEvent, ClientEventKind, ClientState, RtmClient};
pub use config::RtmConfig;
pub use error::{ErrorKind, Result, RtmError};
pub use observer::{EventBus, HandlerId};
pub use pdu::{History, Pdu, SubscribeOptions};
pub use subscription::{
    Subscription, SubscriptionEvent, SubscriptionEventKind, SubscriptionMode, SubscriptionState,
};
