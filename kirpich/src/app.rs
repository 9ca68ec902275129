//! Line-oriented front end: command parsing, transcript rendering, and the
//! small amount of UI state the commands need.

use std::path::{Path, PathBuf};

use kirpich_proto::ids::{ChatId, ClientTempId};
use kirpich_proto::message::ChatSummary;

use crate::backend::Backend;
use crate::engine::SyncEngine;
use crate::event::SyncEvent;
use crate::outbound::SendError;
use crate::state::{DeliveryState, MessageEntry};
use crate::transport::Connector;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List chats with unread counts.
    Chats,
    /// Switch to a chat and print its messages.
    Open(ChatId),
    /// Mark the open chat as read.
    Read,
    /// Retry the most recent failed send in the open chat.
    Retry,
    /// Upload a file to the open chat.
    Upload(PathBuf),
    Logout,
    Help,
    /// Plain text, sent to the open chat.
    Send(String),
}

/// Errors a command can report back to the user.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("no chat open, use /open <chat>")]
    NoOpenChat,

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("nothing to retry")]
    NothingToRetry,

    #[error("cannot read {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Send(#[from] SendError),
}

/// Parses one input line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns [`CommandError::Usage`] for a known command with missing
/// arguments.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_owned())));
    };
    let (name, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(n, a)| (n, a.trim()));
    let command = match name {
        "chats" => Command::Chats,
        "open" if arg.is_empty() => return Err(CommandError::Usage("/open <chat>")),
        "open" => Command::Open(ChatId::new(arg)),
        "read" => Command::Read,
        "retry" => Command::Retry,
        "upload" if arg.is_empty() => return Err(CommandError::Usage("/upload <path>")),
        "upload" => Command::Upload(PathBuf::from(arg)),
        "logout" | "quit" => Command::Logout,
        "help" => Command::Help,
        // Unknown slash commands are sent as text.
        _ => Command::Send(line.to_owned()),
    };
    Ok(Some(command))
}

/// Result of running a command.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Lines to print.
    pub lines: Vec<String>,
    /// The session ended and the front end should exit.
    pub quit: bool,
}

impl Outcome {
    fn lines(lines: Vec<String>) -> Self {
        Self { lines, quit: false }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// UI state for the line front end.
#[derive(Debug, Default)]
pub struct App {
    open: Option<ChatId>,
    /// Failed sends, most recent last.
    failed: Vec<(ChatId, ClientTempId)>,
}

impl App {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn open_chat(&self) -> Option<&ChatId> {
        self.open.as_ref()
    }

    /// Runs a command against the engine.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] to show to the user; the engine is left
    /// usable.
    pub async fn execute<C: Connector, B: Backend>(
        &mut self,
        engine: &SyncEngine<C, B>,
        command: Command,
    ) -> Result<Outcome, CommandError> {
        match command {
            Command::Chats => Ok(Outcome::lines(render_chats(&engine.chats().snapshot()))),
            Command::Open(chat_id) => {
                let lines = engine
                    .messages()
                    .entries(&chat_id)
                    .iter()
                    .map(render_entry)
                    .collect();
                engine.mark_read(&chat_id);
                self.open = Some(chat_id);
                Ok(Outcome::lines(lines))
            }
            Command::Read => {
                engine.mark_read(self.require_open()?);
                Ok(Outcome::none())
            }
            Command::Retry => {
                let chat_id = self.require_open()?.clone();
                let index = self
                    .failed
                    .iter()
                    .rposition(|(chat, _)| *chat == chat_id)
                    .ok_or(CommandError::NothingToRetry)?;
                let (_, temp) = self.failed.remove(index);
                engine.retry(&temp)?;
                Ok(Outcome::none())
            }
            Command::Upload(path) => {
                let chat_id = self.require_open()?.clone();
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|source| CommandError::ReadFile {
                        path: path.clone(),
                        source,
                    })?;
                engine
                    .upload_media(chat_id, file_name(&path), bytes)
                    .await?;
                Ok(Outcome::none())
            }
            Command::Send(text) => {
                let chat_id = self.require_open()?.clone();
                engine.send_message(chat_id, text)?;
                Ok(Outcome::none())
            }
            Command::Logout => {
                engine.logout().await;
                self.open = None;
                self.failed.clear();
                Ok(Outcome {
                    lines: vec!["logged out".to_owned()],
                    quit: true,
                })
            }
            Command::Help => Ok(Outcome::lines(vec![HELP.to_owned()])),
        }
    }

    /// Updates UI state from an engine event and renders it.
    pub fn observe(&mut self, event: &SyncEvent) -> Option<String> {
        match event {
            SyncEvent::MessageFailed {
                chat_id,
                client_temp_id,
                ..
            } => {
                self.failed.push((chat_id.clone(), client_temp_id.clone()));
            }
            SyncEvent::MessageConfirmed { client_temp_id, .. }
            | SyncEvent::MessageRetrying { client_temp_id, .. } => {
                self.failed.retain(|(_, temp)| temp != client_temp_id);
            }
            _ => {}
        }
        render_event(event, self.open.as_ref())
    }

    fn require_open(&self) -> Result<&ChatId, CommandError> {
        self.open.as_ref().ok_or(CommandError::NoOpenChat)
    }
}

const HELP: &str = "commands: /chats, /open <chat>, /read, /retry, /upload <path>, /logout; \
anything else is sent to the open chat";

fn file_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "upload".to_owned(), |n| n.to_string_lossy().into_owned())
}

/// Renders the chat list, one line per chat.
#[must_use]
pub fn render_chats(chats: &[ChatSummary]) -> Vec<String> {
    if chats.is_empty() {
        return vec!["no chats".to_owned()];
    }
    chats
        .iter()
        .map(|chat| {
            let title = if chat.title.is_empty() {
                chat.id.as_str()
            } else {
                chat.title.as_str()
            };
            let unread = if chat.unread_count > 0 {
                format!(" ({} unread)", chat.unread_count)
            } else {
                String::new()
            };
            let last = chat
                .last_message
                .as_ref()
                .map(|m| format!(": {}: {}", m.sender_id, m.content))
                .unwrap_or_default();
            format!("[{}] {title}{unread}{last}", chat.id)
        })
        .collect()
}

/// Renders one message row.
#[must_use]
pub fn render_entry(entry: &MessageEntry) -> String {
    let status = match &entry.delivery {
        DeliveryState::Pending => " \u{22ef}".to_owned(),
        DeliveryState::Sent => String::new(),
        DeliveryState::Failed(reason) => format!(" \u{2717} {reason}"),
    };
    format!(
        "{} {}: {}{status}",
        format_timestamp_ms(entry.timestamp.as_millis()),
        entry.sender_id,
        entry.content
    )
}

/// Renders an event as a transcript line. Messages for chats other than
/// `open` are summarized.
#[must_use]
pub fn render_event(event: &SyncEvent, open: Option<&ChatId>) -> Option<String> {
    let line = match event {
        SyncEvent::ConnectionChanged { to, .. } => format!("* connection {to}"),
        SyncEvent::ReconnectScheduled { attempt, delay } => {
            format!("* reconnecting in {}ms (attempt {attempt})", delay.as_millis())
        }
        SyncEvent::ConnectionLost { attempts } => {
            format!("* connection lost after {attempts} attempts, still retrying")
        }
        SyncEvent::AuthExpired { reason } => format!("* session expired: {reason}"),
        SyncEvent::MessageReceived { message } if Some(&message.chat_id) == open => format!(
            "{} {}: {}",
            format_timestamp_ms(message.timestamp.as_millis()),
            message.sender_id,
            message.content
        ),
        SyncEvent::MessageReceived { message } => {
            format!("* new message in {} from {}", message.chat_id, message.sender_id)
        }
        SyncEvent::MessageFailed {
            chat_id, reason, ..
        } => format!("* send to {chat_id} failed: {reason} (/retry)"),
        SyncEvent::ChatsReplaced { count } => format!("* {count} chats loaded"),
        SyncEvent::ResyncFailed { reason } => format!("* could not load chats: {reason}"),
        SyncEvent::Typing {
            chat_id,
            user_id,
            is_typing: true,
        } if Some(chat_id) == open => format!("* {user_id} is typing"),
        SyncEvent::BackpressureDrop { frame } => {
            format!("* outbox full, dropped a {} frame", frame.kind())
        }
        SyncEvent::ProtocolError { reason } => format!("* server sent bad data: {reason}"),
        _ => return None,
    };
    Some(line)
}

/// Format an epoch-millisecond timestamp as "HH:MM".
fn format_timestamp_ms(ms: u64) -> String {
    use chrono::{Local, TimeZone};
    let secs = i64::try_from(ms / 1000).unwrap_or(i64::MAX);
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M").to_string(),
        _ => "??:??".to_owned(),
    }
}
