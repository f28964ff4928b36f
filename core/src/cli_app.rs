use crate::api::{ChatApi, HttpChatApi};
use crate::config::Config;
use crate::switchboard::{OpenOutcome, Switchboard};
use crate::transport::websocket::WebSocketConnector;
use crate::transport::{Credential, SessionState, TransportSession};
use crate::types::{ChatEvent, ConversationSummary, Message};
use chrono::{Local, TimeZone};
use colored::*;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// Terminal client. `args` are the positionals left after config flags.
pub async fn run(config: Config, bin: &str, args: Vec<String>) -> anyhow::Result<()> {
    let Some(command) = args.first() else {
        print_usage(bin);
        return Ok(());
    };

    match command.as_str() {
        "conversations" => {
            let (api, _) = authenticate(&config).await?;
            list_conversations(&api).await?;
        }
        "chat" => {
            let Some(conversation_id) = args.get(1).and_then(|s| s.parse::<i64>().ok()) else {
                eprintln!("{}", format!("Usage: {} chat <conversation_id>", bin).yellow());
                return Ok(());
            };
            let (api, user_id) = authenticate(&config).await?;
            chat(config, api, user_id, conversation_id).await?;
        }
        "read" => {
            let Some(notification_id) = args.get(1).and_then(|s| s.parse::<i64>().ok()) else {
                eprintln!("{}", format!("Usage: {} read <notification_id>", bin).yellow());
                return Ok(());
            };
            let (api, _) = authenticate(&config).await?;
            api.mark_notification_read(notification_id).await?;
            println!("{} Notification {} marked as read", "✓".green(), notification_id);
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "💬 SwipeChat".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--api-url URL] [--ws-url URL] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                 List your conversations", "conversations".cyan());
    println!("  {} <conversation_id>        Open a conversation and chat", "chat".cyan());
    println!("  {} <notification_id>        Mark a notification as read", "read".cyan());
    println!();
    println!("{}", "Credentials:".bright_white().bold());
    println!("  SWIPECHAT_TOKEN + SWIPECHAT_USER_ID, or SWIPECHAT_LOGIN + SWIPECHAT_PASSWORD");
}

/// Bearer token and user id from the environment, logging in if needed
async fn authenticate(config: &Config) -> anyhow::Result<(Arc<HttpChatApi>, String)> {
    let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

    if let (Some(token), Some(user_id)) = (env("SWIPECHAT_TOKEN"), env("SWIPECHAT_USER_ID")) {
        return Ok((Arc::new(HttpChatApi::with_token(config, token)), user_id));
    }

    match (env("SWIPECHAT_LOGIN"), env("SWIPECHAT_PASSWORD")) {
        (Some(login), Some(password)) => {
            let api = HttpChatApi::new(config);
            let response = api.login(&login, &password).await?;
            eprintln!(
                "{} Logged in as {}",
                "✓".green(),
                response.username.bright_white().bold()
            );
            Ok((Arc::new(api), response.id.to_string()))
        }
        _ => anyhow::bail!(
            "no credentials: set SWIPECHAT_TOKEN and SWIPECHAT_USER_ID, or SWIPECHAT_LOGIN and SWIPECHAT_PASSWORD"
        ),
    }
}

async fn list_conversations(api: &HttpChatApi) -> anyhow::Result<()> {
    let conversations = api.list_conversations().await?;
    if conversations.is_empty() {
        println!("{}", "No conversations yet".dimmed());
        return Ok(());
    }
    println!("{}", "Conversations:".bright_white().bold());
    for conversation in &conversations {
        print_summary(conversation);
    }
    Ok(())
}

fn print_summary(conversation: &ConversationSummary) {
    let preview = conversation
        .last_message_content
        .as_deref()
        .unwrap_or("(no messages)");
    let when = conversation
        .last_message_timestamp
        .map(format_time)
        .unwrap_or_default();
    println!(
        "  {} {}  {}  {}",
        format!("[{}]", conversation.match_id).cyan(),
        conversation.other_user_name.bright_white().bold(),
        preview.dimmed(),
        when.dimmed()
    );
}

async fn chat(
    config: Config,
    api: Arc<HttpChatApi>,
    user_id: String,
    conversation_id: i64,
) -> anyhow::Result<()> {
    let token = api
        .token()
        .await
        .ok_or_else(|| anyhow::anyhow!("no bearer token after login"))?;
    let connector = Arc::new(WebSocketConnector::new(config.ws_url.clone()));
    let session = TransportSession::new(config, connector);
    let switchboard = Switchboard::new(session.clone(), api, user_id.clone());

    eprintln!("{} Connecting...", "⏳".yellow());
    session.connect(Credential::bearer(token)).await?;

    // Best effort; only used for the header line
    if let Err(e) = switchboard.refresh_conversations().await {
        eprintln!("{} Could not load conversations: {}", "!".yellow(), e);
    }

    let events = switchboard.subscribe_events();
    let messages = match switchboard.open_conversation(conversation_id).await? {
        OpenOutcome::Active {
            summary, messages, ..
        } => {
            let title = summary
                .map(|s| s.other_user_name)
                .unwrap_or_else(|| format!("conversation {}", conversation_id));
            println!("{} {}", "💬".cyan(), title.bright_white().bold());
            messages
        }
        OpenOutcome::Superseded => anyhow::bail!("conversation open was superseded"),
    };
    // Events were subscribed before the open, so the snapshot and the
    // stream can overlap
    let mut printed = Printed::default();
    for message in &messages {
        if printed.first_sighting(message) {
            print_message(message, &user_id);
        }
    }
    println!("{}", "Type a message and press enter, /quit to leave".dimmed());

    let printer = tokio::spawn(print_events(events, user_id, printed));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = switchboard.send(line).await {
            eprintln!("{} {}", "✗ Not sent:".red(), e);
        }
    }

    printer.abort();
    switchboard.close().await;
    session.disconnect().await;
    Ok(())
}

/// Message ids already shown on screen
#[derive(Default)]
struct Printed {
    seen: HashSet<i64>,
}

impl Printed {
    fn first_sighting(&mut self, message: &Message) -> bool {
        self.seen.insert(message.message_id)
    }
}

async fn print_events(
    mut events: broadcast::Receiver<ChatEvent>,
    user_id: String,
    mut printed: Printed,
) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::MessageAppended { message, .. }) => {
                if printed.first_sighting(&message) {
                    print_message(&message, &user_id);
                }
            }
            Ok(ChatEvent::Session { state }) => match state {
                SessionState::Connecting => {
                    eprintln!("{}", "Connection lost, reconnecting...".yellow())
                }
                SessionState::Connected => eprintln!("{}", "Connected".green()),
                SessionState::Failed(reason) => {
                    eprintln!("{} {}", "✗ Connection failed:".red().bold(), reason)
                }
                SessionState::Disconnected => {}
            },
            Ok(ChatEvent::Conversation { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                eprintln!("{}", format!("({} events skipped)", n).dimmed())
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_message(message: &Message, user_id: &str) {
    let time = format_time(message.timestamp);
    if message.written_by == user_id {
        println!("{} {} {}", time.dimmed(), "me:".green().bold(), message.content);
    } else {
        println!("{} {} {}", time.dimmed(), "them:".cyan().bold(), message.content);
    }
}

fn format_time(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_default()
}
