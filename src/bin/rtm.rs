//! rtm - command line client for the RTM service

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rtm_client::{
    ClientState, RoleSecretAuth, RtmClient, RtmConfig, SubscribeOptions, SubscriptionMode,
};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rtm")]
#[command(about = "RTM publish/subscribe client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Service endpoint
    #[arg(long, env = "RTM_ENDPOINT", global = true)]
    endpoint: Option<String>,

    /// Application key
    #[arg(long, env = "RTM_APP_KEY", global = true)]
    app_key: Option<String>,

    /// Role to authenticate as
    #[arg(long, env = "RTM_ROLE", global = true)]
    role: Option<String>,

    /// Secret of the role
    #[arg(long, env = "RTM_ROLE_SECRET", global = true, hide_env_values = true)]
    role_secret: Option<String>,

    /// HTTP proxy to tunnel through
    #[arg(long, env = "RTM_PROXY", global = true)]
    proxy: Option<String>,

    /// Seconds to wait for the connection
    #[arg(long, default_value_t = 10, global = true)]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a message to a channel
    ///
    /// The message is parsed as JSON, falling back to a plain string.
    Publish {
        channel: String,
        message: String,

        /// Wait for the service to acknowledge
        #[arg(long)]
        ack: bool,
    },

    /// Print messages from a channel until interrupted
    Subscribe {
        channel: String,

        /// Streamview filter, e.g. "select * from animals"
        #[arg(long)]
        filter: Option<String>,

        #[arg(long, value_enum, default_value_t = Mode::Reliable)]
        mode: Mode,

        /// Replay this many messages of history
        #[arg(long)]
        history: Option<u64>,
    },

    /// Read the latest value of a channel
    Read {
        channel: String,

        /// Read at this stream position instead
        #[arg(long)]
        position: Option<String>,
    },

    /// Write a value to a channel
    Write { channel: String, message: String },

    /// Delete the value of a channel
    Delete { channel: String },

    /// List channels starting with a prefix
    Search { prefix: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Reliable,
    Simple,
    Advanced,
}

impl From<Mode> for SubscriptionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Reliable => SubscriptionMode::RELIABLE,
            Mode::Simple => SubscriptionMode::SIMPLE,
            Mode::Advanced => SubscriptionMode::ADVANCED,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let client = connect(&cli).await?;

    let result = match cli.command {
        Commands::Publish { channel, message, ack } => {
            let message = parse_message(&message);
            if ack {
                let ok = client.publish_ack(&channel, &message).await?;
                println!("{}", ok.position);
            } else {
                client.publish(&channel, &message).await?;
            }
            Ok(())
        }
        Commands::Subscribe {
            channel,
            filter,
            mode,
            history,
        } => subscribe(&client, channel, filter, mode.into(), history).await,
        Commands::Read { channel, position } => {
            let ok = match position {
                Some(position) => client.read_at(&channel, &position).await?,
                None => client.read(&channel).await?,
            };
            println!("{}", ok.message);
            Ok(())
        }
        Commands::Write { channel, message } => {
            let ok = client.write(&channel, &parse_message(&message)).await?;
            println!("{}", ok.position);
            Ok(())
        }
        Commands::Delete { channel } => {
            client.delete(&channel).await?;
            Ok(())
        }
        Commands::Search { prefix } => {
            for channel in client.search(&prefix).await? {
                println!("{channel}");
            }
            Ok(())
        }
    };

    client.stop();
    result
}

/// Start a client and wait until it is connected
async fn connect(cli: &Cli) -> Result<RtmClient> {
    let endpoint = cli.endpoint.clone().context("RTM_ENDPOINT not set")?;
    let app_key = cli.app_key.clone().context("RTM_APP_KEY not set")?;

    let mut config = RtmConfig::new(endpoint, app_key);
    match (&cli.role, &cli.role_secret) {
        (Some(role), Some(secret)) => config = config.auth(RoleSecretAuth::new(role, secret)),
        (None, None) => {}
        _ => bail!("RTM_ROLE and RTM_ROLE_SECRET must be set together"),
    }
    if let Some(proxy) = &cli.proxy {
        config = config.proxy(proxy);
    }

    let client = RtmClient::new(config).context("Invalid client configuration")?;

    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    client.once_enter(ClientState::Connected, move || {
        if let Some(tx) = tx.take() {
            let _ = tx.send(());
        }
    });
    client.on_error(|e| warn!(error = %e, "Client error"));
    client.start();

    tokio::time::timeout(Duration::from_secs(cli.timeout), rx)
        .await
        .context("Timed out connecting")?
        .context("Client dropped before connecting")?;

    Ok(client)
}

async fn subscribe(
    client: &RtmClient,
    channel: String,
    filter: Option<String>,
    mode: SubscriptionMode,
    history: Option<u64>,
) -> Result<()> {
    let opts = SubscribeOptions {
        filter,
        history: history.map(|count| rtm_client::History {
            count: Some(count),
            age: None,
        }),
        ..Default::default()
    };

    client
        .subscribe_with(&channel, mode, opts, |sub| {
            sub.on_data(|message| println!("{message}"));
            sub.on_subscribed(|ok| info!(position = %ok.position, "Subscribed"));
            sub.on_info(|info| warn!(info = %info.info, reason = %info.reason, "Subscription info"));
            sub.on_subscription_error(|err| {
                warn!(error = %err.error, reason = %err.reason, "Subscription error")
            });
        })
        .await
        .context("Subscribe failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Interrupted, unsubscribing");

    if let Err(e) = client.unsubscribe(&channel).await {
        warn!(error = %e, "Unsubscribe failed");
    }
    Ok(())
}

fn parse_message(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
