use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::prelude::*;

use gym_chat::config::default_config_dir;
use gym_chat::{
    ChatConfig, ConnectionManager, Conversation, ConversationStore, Message, SendStatus,
};

#[derive(Parser)]
#[command(name = "gym-chat")]
#[command(about = "Chat client for the gym dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.toml (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Chat server host[:port], overrides the configured one
    #[arg(long, global = true)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a room: print incoming messages, send each stdin line
    Join(JoinArgs),

    /// List your conversations
    Conversations,

    /// Search conversations
    Search(SearchArgs),

    /// Persist a message through the history API
    Post(PostArgs),
}

#[derive(Parser)]
struct JoinArgs {
    /// Room to join
    room: String,

    /// Your participant id
    #[arg(short, long)]
    sender: String,
}

#[derive(Parser)]
struct SearchArgs {
    /// Free-text query (may be empty)
    #[arg(default_value = "")]
    query: String,
}

#[derive(Parser)]
struct PostArgs {
    /// Room the message belongs to
    room: String,

    /// Message body
    content: String,

    /// Your participant id
    #[arg(short, long)]
    sender: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose {
        "gym_chat=debug,warn"
    } else {
        "gym_chat=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let mut config = ChatConfig::load(&config_dir)?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    info!(host = %config.host, "gym chat client");

    match cli.command {
        Commands::Join(args) => {
            let manager = Arc::new(ConnectionManager::new(config));
            join_command(manager, args).await
        }
        Commands::Conversations => {
            let store = ConversationStore::new(config);
            print_conversations(&store.list().await);
            Ok(())
        }
        Commands::Search(args) => {
            let store = ConversationStore::new(config);
            print_conversations(&store.search(&args.query).await);
            Ok(())
        }
        Commands::Post(args) => post_command(ConversationStore::new(config), args).await,
    }
}

async fn join_command(manager: Arc<ConnectionManager>, args: JoinArgs) -> Result<()> {
    let me = args.sender.clone();
    manager
        .join(&args.room, move |msg: Message| {
            let who = if msg.sender_id == me {
                "you"
            } else {
                msg.sender_id.as_str()
            };
            let at = msg
                .created_at
                .map(|t| t.format("%H:%M").to_string())
                .unwrap_or_default();
            println!("[{}] {}: {}", at, who, msg.content);
        })
        .with_context(|| format!("Failed to join room {}", args.room))?;

    let mut state = manager.subscribe_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            eprintln!("  ({})", current);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match manager.send(&Message::draft(&args.sender, line)) {
                    Ok(SendStatus::Sent) => {}
                    Ok(SendStatus::Queued) => eprintln!("  (queued until connected)"),
                    Err(e) => eprintln!("  not delivered: {}", e),
                },
                None => break,
            },
        }
    }

    manager.leave().await;
    Ok(())
}

async fn post_command(store: ConversationStore, args: PostArgs) -> Result<()> {
    let draft = Message::draft(args.sender, args.content).in_room(&args.room);
    let stored = store
        .persist(&draft)
        .await
        .with_context(|| format!("Failed to persist message to room {}", args.room))?;

    println!(
        "{}\t{}",
        stored.id.unwrap_or_default(),
        stored
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
    );
    Ok(())
}

fn print_conversations(conversations: &[Conversation]) {
    if conversations.is_empty() {
        println!("No conversations.");
        return;
    }
    for conversation in conversations {
        println!(
            "{:<24} {}",
            conversation.room_id().unwrap_or_else(|| "???".to_string()),
            conversation.as_json()
        );
    }
}
