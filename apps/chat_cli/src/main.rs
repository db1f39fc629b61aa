use std::{
    collections::{HashSet, VecDeque},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use client_core::{
    load_settings_from, ChatFilter, ConnectionState, RestChatApi, RoomSession, SessionEvent,
    StoredMessage,
};
use shared::{
    domain::{FileId, MessageId, RoomId, TaskId},
    protocol::AuthorProjection,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;

/// Terminal chat client for one project room.
#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `devsync.toml` in the working directory by default.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    /// Session credential; falls back to DEVSYNC_TOKEN.
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    project: i64,
    #[arg(long)]
    user_id: i64,
    #[arg(long, default_value = "")]
    username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    Filter(Option<ChatFilter>),
    Reload,
    Retry,
    Ping,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    let id = |arg: Option<&str>| -> Result<i64> {
        arg.ok_or_else(|| anyhow!("/{name} needs an id"))?
            .parse::<i64>()
            .with_context(|| format!("/{name} id must be a number"))
    };
    Ok(match name {
        "file" => Command::Filter(Some(ChatFilter::File(FileId(id(arg)?)))),
        "task" => Command::Filter(Some(ChatFilter::Task(TaskId(id(arg)?)))),
        "all" => Command::Filter(None),
        "reload" => Command::Reload,
        "retry" => Command::Retry,
        "ping" => Command::Ping,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command /{other}"),
    })
}

fn render(entry: &StoredMessage) -> String {
    let message = &entry.message;
    let marker = if entry.is_pending() { " (sending)" } else { "" };
    format!(
        "[{}] {}: {}{marker}",
        message.created_at.format("%H:%M"),
        message.author.display_name(),
        message.content
    )
}

/// Ids already shown, remembering only the most recent `capacity`.
struct PrintedIds {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl PrintedIds {
    const CAPACITY: usize = 1024;

    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time `id` is seen.
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Prints confirmed messages once each and connection changes as they happen.
async fn print_events(session: Arc<RoomSession>, mut events: broadcast::Receiver<SessionEvent>) {
    let mut printed = PrintedIds::new(PrintedIds::CAPACITY);
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessagesChanged) => {
                for entry in session.visible_entries().await {
                    if !entry.is_pending() && printed.insert(entry.message.id) {
                        println!("{}", render(&entry));
                    }
                }
            }
            Ok(SessionEvent::ConnectionChanged(state)) => match state {
                ConnectionState::Connected => println!("-- connected"),
                ConnectionState::Reconnecting { attempt } => {
                    println!("-- connection lost, reconnect attempt {attempt}")
                }
                _ => {}
            },
            Ok(SessionEvent::RealtimeUnavailable) => {
                println!("-- real-time updates unavailable, type /retry to reconnect")
            }
            Ok(SessionEvent::HistoryLoaded { added }) => println!("-- loaded {added} messages"),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings_from(
        args.config
            .as_deref()
            .unwrap_or(std::path::Path::new(client_core::config::DEFAULT_SETTINGS_FILE)),
    );
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url.trim_end_matches('/').to_string();
    }
    if let Some(ws_url) = args.ws_url {
        settings.ws_url = ws_url;
    }
    let token = args.token.or_else(|| std::env::var("DEVSYNC_TOKEN").ok());

    let api = Arc::new(RestChatApi::new(
        settings.api_url.clone(),
        token.clone(),
        settings.request_timeout,
    ));
    let session = Arc::new(RoomSession::new(
        &settings,
        api,
        token,
        RoomId(args.project),
        AuthorProjection {
            id: args.user_id,
            username: args.username.clone(),
            name: args.username,
            ..AuthorProjection::default()
        },
    ));
    let printer = tokio::spawn(print_events(Arc::clone(&session), session.subscribe()));

    if let Err(err) = session.start().await {
        warn!("chat: session start incomplete: {err}");
        println!("-- {err}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("-- {err}");
                continue;
            }
        };
        match command {
            Command::Send(content) => {
                if let Err(err) = session.send_message(&content).await {
                    println!("-- {}", err.user_message());
                }
            }
            Command::Filter(filter) => match session.set_filter(filter).await {
                Ok(visible) => {
                    println!("-- showing {} messages", visible.len());
                    for entry in session.visible_entries().await {
                        println!("{}", render(&entry));
                    }
                }
                Err(err) => println!("-- {}", err.user_message()),
            },
            Command::Reload => {
                if let Err(err) = session.load_history().await {
                    println!("-- {}", err.user_message());
                }
            }
            Command::Retry => {
                if let Err(err) = session.retry_connection().await {
                    println!("-- {err}");
                }
            }
            Command::Ping => {
                if let Err(err) = session.ping().await {
                    println!("-- {err}");
                }
            }
            Command::Quit => break,
        }
    }

    session.close().await;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_sends() {
        assert_eq!(
            parse_command("  hello there ").expect("parse"),
            Command::Send("hello there".into())
        );
    }

    #[test]
    fn slash_commands_select_scope() {
        assert_eq!(
            parse_command("/file 4").expect("parse"),
            Command::Filter(Some(ChatFilter::File(FileId(4))))
        );
        assert_eq!(
            parse_command("/task 9").expect("parse"),
            Command::Filter(Some(ChatFilter::Task(TaskId(9))))
        );
        assert_eq!(parse_command("/all").expect("parse"), Command::Filter(None));
        assert_eq!(parse_command("/exit").expect("parse"), Command::Quit);
    }

    #[test]
    fn printed_ids_forget_the_oldest_past_capacity() {
        let mut printed = PrintedIds::new(2);
        assert!(printed.insert(MessageId(1)));
        assert!(!printed.insert(MessageId(1)));
        assert!(printed.insert(MessageId(2)));
        assert!(printed.insert(MessageId(3)));

        assert_eq!(printed.seen.len(), 2);
        assert!(!printed.insert(MessageId(3)));
        assert!(printed.insert(MessageId(1)));
    }

    #[test]
    fn bad_commands_are_reported() {
        assert!(parse_command("/file").is_err());
        assert!(parse_command("/file abc").is_err());
        assert!(parse_command("/dance").is_err());
    }
}
