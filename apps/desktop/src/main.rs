use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, normalize_database_url, ClientContext, ConversationViewModel, Navigator,
    NoticeSeverity, Route, SendOutcome, TungsteniteSocket, ViewUpdate,
};
use shared::domain::Message;
use storage::SqliteCredentialStore;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the REST gateway base url.
    #[arg(long)]
    api_url: Option<String>,
    /// Overrides the real-time websocket url.
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    credentials_db: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stores the credentials carried by the identity provider redirect.
    Login {
        /// Full callback url, or just its `#id_token=..&access_token=..` fragment.
        #[arg(long)]
        callback: String,
    },
    Whoami,
    Chat,
    Logout,
}

struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, route: Route) {
        match route {
            Route::Login => println!("-- signed out; run `desktop login --callback <url>`"),
            Route::Chat => println!("-- signed in; run `desktop chat`"),
        }
    }
}

enum Input {
    Line(Option<String>),
    Channel(bool),
    Interrupt,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings.api_base_url = api_url;
    }
    if let Some(ws_url) = cli.ws_url {
        settings.ws_url = ws_url;
    }
    if let Some(credentials_db) = cli.credentials_db {
        settings.credentials_db_url = credentials_db;
    }

    let database_url = normalize_database_url(&settings.credentials_db_url);
    let credentials = SqliteCredentialStore::new(&database_url)
        .await
        .with_context(|| format!("cannot open credential store at {database_url}"))?;
    let context = ClientContext::new(settings, Arc::new(credentials), Arc::new(TungsteniteSocket))?;

    match cli.command {
        Command::Login { callback } => {
            context.complete_login(&callback, &TerminalNavigator).await?;
        }
        Command::Whoami => match context.session().resolve_current_user().await {
            Some(user) => println!(
                "{} (id={}, email={})",
                user.username,
                user.id,
                user.email.as_deref().unwrap_or("-")
            ),
            None => println!("not signed in"),
        },
        Command::Chat => run_chat(&context).await?,
        Command::Logout => {
            context.channel().disconnect().await;
            context.session().clear().await?;
            TerminalNavigator.navigate(Route::Login);
        }
    }
    Ok(())
}

async fn run_chat(context: &ClientContext) -> Result<()> {
    let mut conversation = context.conversation(Arc::new(TerminalNavigator));
    let mut updates = conversation.subscribe();
    if conversation.open().await? == Route::Login {
        return Ok(());
    }
    println!("-- /users lists who is online, /logout signs out, /quit leaves");

    let mut shown = 0;
    render(&mut updates, &conversation, &mut shown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            alive = conversation.process_next() => Input::Channel(alive),
            _ = tokio::signal::ctrl_c() => Input::Interrupt,
        };

        match input {
            Input::Line(None) | Input::Interrupt | Input::Channel(false) => break,
            Input::Channel(true) => {}
            Input::Line(Some(line)) => match line.trim() {
                "/quit" => break,
                "/logout" => {
                    conversation.logout().await?;
                    return Ok(());
                }
                "/users" => match conversation.refresh_online_users().await {
                    Ok(()) => {
                        for user in conversation.online_users() {
                            println!("  * {} ({})", user.username, user.id);
                        }
                    }
                    Err(err) => warn!(error = %err, "online users unavailable"),
                },
                _ => {
                    conversation.set_draft(line);
                    if conversation.send_draft().await == SendOutcome::Failed {
                        info!("message kept with error flag");
                    }
                }
            },
        }
        render(&mut updates, &conversation, &mut shown);
    }

    conversation.close().await;
    Ok(())
}

fn render(
    updates: &mut broadcast::Receiver<ViewUpdate>,
    conversation: &ConversationViewModel,
    shown: &mut usize,
) {
    let mut messages_changed = false;
    while let Ok(update) = updates.try_recv() {
        match update {
            ViewUpdate::MessagesChanged => messages_changed = true,
            ViewUpdate::UsersChanged => {}
            ViewUpdate::ConnectionChanged(connected) => {
                println!("-- {}", if connected { "live" } else { "offline" });
            }
            ViewUpdate::Notice { severity, text } => {
                let tag = match severity {
                    NoticeSeverity::Success => "ok",
                    NoticeSeverity::Warning => "warn",
                    NoticeSeverity::Error => "error",
                };
                println!("[{tag}] {text}");
            }
        }
    }

    if messages_changed {
        let messages = conversation.messages();
        if messages.len() > *shown {
            for message in &messages[*shown..] {
                println!("{}", format_message(message));
            }
        }
        *shown = messages.len();
    }
}

fn format_message(message: &Message) -> String {
    let author = message
        .sender
        .as_ref()
        .map(|sender| sender.username.as_str())
        .unwrap_or("?");
    let time = message
        .timestamp
        .map(|timestamp| timestamp.format("%H:%M").to_string())
        .unwrap_or_default();
    let marker = if message.error {
        " (failed)"
    } else if message.is_temp {
        " (sending)"
    } else {
        ""
    };
    format!("{time} {author}: {}{marker}", message.content)
}
