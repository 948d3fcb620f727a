use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use memstore::{MemoryBlobStore, MemoryStore};
use shared::domain::{TypingStatus, UserId};
use sqlstore::SqlDocumentStore;
use store::DocumentStore;
use sync_core::{
    AttachOptions, CreateMode, EngineConfig, MessageDraft, SendOptions, SessionRequest,
    SyncEngine, SyncEvent,
};

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// User id to act as.
    #[arg(long)]
    user: String,
    /// Peer to open a direct conversation with.
    #[arg(long, conflicts_with = "group")]
    peer: Option<String>,
    /// Group participant; repeat the flag once per member.
    #[arg(long)]
    group: Vec<String>,
    /// Name for a newly created group.
    #[arg(long)]
    name: Option<String>,
    /// Message to send once attached.
    #[arg(long)]
    send: Option<String>,
    /// "memory" or a sqlite url / file path. Overrides the settings file.
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// How long to keep the live subscriptions open, in seconds.
    #[arg(long, default_value_t = 2)]
    watch_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let settings = config::load_settings(args.config.as_deref());
    let database_url = args
        .database_url
        .clone()
        .unwrap_or_else(|| settings.database_url.clone());

    let store = open_store(&database_url).await?;
    let blobs = Arc::new(MemoryBlobStore::new());

    let mut engine_config = EngineConfig::new(args.user.as_str());
    engine_config.store = settings.store_config();
    let engine = SyncEngine::new(engine_config, store, blobs)?;

    let request = if !args.group.is_empty() {
        SessionRequest::Group {
            participants: args.group.iter().map(|user| UserId::new(user.as_str())).collect(),
            name: args.name.clone(),
            photo_url: None,
        }
    } else if let Some(peer) = &args.peer {
        SessionRequest::Direct {
            peer: UserId::new(peer),
        }
    } else {
        anyhow::bail!("pass --peer <user> or --group <user> (repeatable)");
    };

    let handle = engine.resolve_session(request, CreateMode::Lazy).await?;
    println!("session {} [{:?}]", handle.session_id, handle.state);

    let mut events = engine.events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    let subscription = engine.attach(&handle, AttachOptions::default()).await?;

    if let Some(text) = &args.send {
        engine.set_typing(TypingStatus::Typing).await?;
        engine
            .send(MessageDraft::text(text), SendOptions::default())
            .await?;
    }

    tokio::time::sleep(Duration::from_secs(args.watch_seconds)).await;

    if let Some(view) = engine.session_view().await {
        println!("-- {} message(s) --", view.messages.len());
        for message in &view.messages {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M:%S"),
                message.sender,
                message.content
            );
        }
        if !view.undelivered.is_empty() {
            println!("-- {} undelivered --", view.undelivered.len());
        }
    }

    engine.detach(&subscription).await;
    printer.abort();
    Ok(())
}

async fn open_store(database_url: &str) -> Result<Arc<dyn DocumentStore>> {
    if database_url == "memory" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let url = config::prepare_database_url(database_url)?;
    Ok(Arc::new(SqlDocumentStore::new(&url).await?))
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::SessionMaterialized { session_id } => {
            println!("* session {session_id} created");
        }
        SyncEvent::MessagesReplaced { messages, .. } => {
            println!("* view now holds {} message(s)", messages.len());
        }
        SyncEvent::MessagesChanged { changes, .. } => {
            for change in changes {
                println!("* {:?} {}", change.kind, change.message.id);
            }
        }
        SyncEvent::ActivityUpdated { activity, .. } => {
            println!("* activity for {} participant(s)", activity.len());
        }
        SyncEvent::CounterpartTyping { typing, .. } => {
            println!("* counterpart typing: {typing}");
        }
        SyncEvent::MetadataUpdated { metadata, .. } => {
            println!(
                "* room is now '{}'",
                metadata.display_name.clone().unwrap_or_default()
            );
        }
        SyncEvent::CounterpartProfile { profile, .. } => {
            println!(
                "* talking to {}",
                profile
                    .display_name
                    .clone()
                    .unwrap_or_else(|| profile.user_id.to_string())
            );
        }
        SyncEvent::SendFailed { message_id, .. } => {
            println!("* send failed for {message_id}; kept as undelivered");
        }
        SyncEvent::Error { detail } => {
            eprintln!("! {detail}");
        }
    }
}
