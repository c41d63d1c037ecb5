//! `docsync-watch`: log in, join rooms, and log every push event until Ctrl-C.

use clap::Parser;
use docsync::events::{Event, EventKind};
use docsync::{ClientConfig, ClientError, SyncContext};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const WATCHED: [EventKind; 15] = [
    EventKind::Connected,
    EventKind::Disconnected,
    EventKind::ConnectionError,
    EventKind::Reconnecting,
    EventKind::MaxReconnectAttempts,
    EventKind::SessionInvalidated,
    EventKind::DocumentProcessingStarted,
    EventKind::DocumentProcessingCompleted,
    EventKind::DocumentProcessingFailed,
    EventKind::DocumentUpdated,
    EventKind::NewChatMessage,
    EventKind::SystemAlert,
    EventKind::SystemMaintenance,
    EventKind::ServerError,
    EventKind::RoomAck,
];

#[derive(Parser, Debug)]
#[command(name = "docsync-watch", about = "Watch push events from the document/chat service")]
struct Cli {
    #[arg(long, env = "DOCSYNC_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "DOCSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Access token to use instead of logging in.
    #[arg(long, env = "DOCSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Rooms to join, e.g. `chat:42` or `document:abc`.
    #[arg(long = "room")]
    rooms: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
enum WatchError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no credentials; pass --token, or --email and --password, or set DOCSYNC_CREDENTIALS_PATH")]
    MissingCredentials,
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

fn log_event(event: &Event) {
    match event {
        Event::ConnectionError { .. } | Event::MaxReconnectAttempts { .. } | Event::ServerError { .. } => {
            warn!(kind = %event.kind(), ?event, "push event");
        }
        Event::SessionInvalidated => warn!("session invalidated; log in again"),
        _ => info!(kind = %event.kind(), ?event, "push event"),
    }
}

async fn run(cli: Cli) -> Result<(), WatchError> {
    let ctx = SyncContext::from_env()?;
    for kind in WATCHED {
        ctx.bus().on(kind, log_event);
    }

    let restored = ctx.init()?;
    match (cli.token, cli.email, cli.password) {
        (Some(token), _, _) => ctx.use_token(&token),
        (None, Some(email), Some(password)) => {
            let user = ctx.login(&email, &password).await?;
            info!(email = %user.email, "logged in");
        }
        _ if restored => info!("using stored credentials"),
        _ => return Err(WatchError::MissingCredentials),
    }

    let config: &ClientConfig = ctx.config();
    info!(api = %config.api_url, ws = %config.ws_url, "watching");
    for room in &cli.rooms {
        ctx.registry().join(room);
    }

    tokio::signal::ctrl_c().await?;
    for room in &cli.rooms {
        ctx.registry().leave(room);
    }
    ctx.dispose();
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!(error = %e, "docsync-watch failed");
        std::process::exit(1);
    }
}
