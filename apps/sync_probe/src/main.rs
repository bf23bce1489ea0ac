use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    config::{load_settings, load_settings_from},
    ClientEvent, Session, SessionStore, SyncEngine,
};
use shared::domain::{MessageKind, UserId};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs in, opens one conversation and prints what the sync engine reports.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    user_id: i64,
    #[arg(long, env = "SYNC_TOKEN")]
    token: String,
    /// Conversation to open.
    #[arg(long)]
    peer_id: i64,
    /// Sent once the conversation is loaded.
    #[arg(long)]
    send: Option<String>,
    /// Settings file; defaults to ./sync.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }

    let auth = Arc::new(SessionStore::new());
    let engine = SyncEngine::with_network(settings, auth.clone())
        .context("failed to build sync engine")?;
    let mut events = BroadcastStream::new(engine.subscribe_events());
    engine.start().await;

    auth.login(Session::new(UserId(args.user_id), args.token));
    let peer_id = UserId(args.peer_id);
    let loaded = engine.open_conversation(peer_id).await?;
    info!(peer_id = peer_id.0, loaded, "probe: conversation opened");

    if let Some(body) = args.send {
        match engine.send_message(peer_id, MessageKind::Text, body).await {
            Ok(message) => info!(message_id = ?message.server_id(), "probe: message sent"),
            Err(err) => warn!("probe: send failed: {err}"),
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = events.next() => match next {
                Some(Ok(event)) => print_event(&engine, event).await,
                Some(Err(lagged)) => warn!("probe: {lagged}"),
                None => break,
            },
        }
    }

    auth.logout();
    engine.shutdown().await;
    Ok(())
}

async fn print_event(engine: &SyncEngine, event: ClientEvent) {
    match event {
        ClientEvent::ConversationUpdated { peer_id } => {
            let count = engine
                .messages(peer_id)
                .await
                .map(|messages| messages.len())
                .unwrap_or(0);
            println!("conversation {peer_id}: {count} messages");
        }
        ClientEvent::CountersChanged(counters) => println!(
            "unread: {} messages, {} likes",
            counters.unread_messages, counters.unread_likes
        ),
        other => println!("{other:?}"),
    }
}
