use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, ChatSession, ClientEvent, HttpChatApi};
use shared::domain::{ChatId, Message, UserId};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ECHO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(about = "Command-line client for the chat server")]
struct Args {
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Register a new account with this display name instead of logging in.
    #[arg(long)]
    full_name: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List chats with their unread counts.
    Chats,
    /// Print a chat's history.
    History { chat_id: String },
    /// Send a message and wait for the server to confirm it.
    Send { chat_id: String, text: String },
    /// Search the user directory.
    Search { query: String },
    /// Open the private chat with a user, creating it if needed.
    Open { user_id: String },
    /// Print live events until interrupted.
    Tail,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = ws_url;
    }

    let api = Arc::new(HttpChatApi::new(settings.api_url.clone()));
    let session = match args.full_name.as_deref() {
        Some(full_name) => {
            ChatSession::register(api, &settings, full_name, &args.username, &args.password)
                .await
                .context("registration failed")?
        }
        None => ChatSession::login(api, &settings, &args.username, &args.password)
            .await
            .context("login failed")?,
    };
    println!(
        "Logged in as {} ({})",
        session.local_user().name,
        session.local_user().id
    );

    let outcome = run(&session, args.command).await;
    session.logout().await;
    outcome
}

async fn run(session: &Arc<ChatSession>, command: Command) -> Result<()> {
    match command {
        Command::Chats => {
            for chat in session.chats().await {
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| m.text.as_str())
                    .unwrap_or("");
                println!("{}  {}  [{} unread]  {}", chat.id, chat.name, chat.unread_count, preview);
            }
        }
        Command::History { chat_id } => {
            let chat_id = ChatId::from(chat_id);
            session.select_chat(&chat_id).await?;
            for message in session.messages(&chat_id).await {
                print_message(&message);
            }
        }
        Command::Send { chat_id, text } => {
            let chat_id = ChatId::from(chat_id);
            if !session.wait_connected(CONNECT_TIMEOUT).await {
                bail!("could not reach the chat server; nothing sent");
            }
            let mut events = session.subscribe_events();
            let pending = session.send_message(&chat_id, &text).await?;
            tokio::time::timeout(ECHO_TIMEOUT, async {
                loop {
                    let still_pending = session
                        .messages(&chat_id)
                        .await
                        .iter()
                        .any(|m| m.id == pending.id);
                    if !still_pending {
                        return;
                    }
                    if let Err(RecvError::Closed) = events.recv().await {
                        return;
                    }
                }
            })
            .await
            .map_err(|_| anyhow!("no confirmation from server; message left pending"))?;
            println!("sent");
        }
        Command::Search { query } => {
            let mut events = BroadcastStream::new(session.subscribe_events());
            session.update_search(&query).await;
            while let Some(event) = events.next().await {
                if let Ok(ClientEvent::SearchResults { query: q, users }) = event {
                    if q == query {
                        for user in users {
                            println!("{}  {} (@{})", user.id, user.name, user.username);
                        }
                        break;
                    }
                }
            }
        }
        Command::Open { user_id } => {
            let chat_id = session.open_private_chat(&UserId::from(user_id)).await?;
            println!("{chat_id}");
        }
        Command::Tail => {
            let mut events = BroadcastStream::new(session.subscribe_events());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.next() => match event {
                        Some(Ok(event)) => print_event(session, event).await,
                        Some(Err(err)) => warn!(%err, "event stream lagged"),
                        None => break,
                    },
                }
            }
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    println!(
        "[{}] {}: {} ({:?})",
        message.timestamp, message.sender_id, message.text, message.status
    );
}

async fn print_event(session: &ChatSession, event: ClientEvent) {
    match event {
        ClientEvent::MessagesUpdated { chat_id } => {
            if let Some(message) = session.messages(&chat_id).await.last() {
                print_message(message);
            }
        }
        ClientEvent::ConnectionStateChanged(state) => println!("connection: {state:?}"),
        ClientEvent::Typing {
            chat_id,
            user_id: Some(user_id),
        } => println!("{user_id} is typing in {chat_id}"),
        ClientEvent::ServerError(message) | ClientEvent::Error(message) => {
            println!("error: {message}")
        }
        _ => {}
    }
}
