//! Per-chat message sequences with optimistic entries.
//!
//! Each chat holds an ordered list of [`MessageEntry`] values. Confirmed
//! entries (those with a server id) are kept sorted by server timestamp
//! and appear at most once per id. Optimistic entries are appended at the
//! tail when created and are replaced in place when the server confirms
//! them, either by an acknowledgement or by the echoed `new_message`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use kirpich_proto::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};
use kirpich_proto::message::Message;

/// Delivery state of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    /// Sent optimistically, awaiting confirmation.
    Pending,
    /// Confirmed by the server.
    Sent,
    /// The last attempt failed; the entry stays visible for retry.
    Failed(FailureReason),
}

/// Why an optimistic send failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No confirmation arrived within the send timeout.
    Timeout,
    /// The server refused the message.
    Rejected(String),
    /// The frame was evicted from a full outbox before it was sent.
    Backpressure,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => f.write_str("timed out waiting for confirmation"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Backpressure => f.write_str("dropped before sending (outbox full)"),
        }
    }
}

/// One row in a chat's message sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    /// Server id; `None` until confirmed.
    pub id: Option<MessageId>,
    /// Correlation id for entries that started as optimistic sends.
    pub client_temp_id: Option<ClientTempId>,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    /// Local creation time while pending, server time once confirmed.
    pub timestamp: Timestamp,
    pub delivery: DeliveryState,
}

impl MessageEntry {
    /// Builds an optimistic entry for a send that has not been confirmed.
    #[must_use]
    pub fn pending(
        chat_id: ChatId,
        sender_id: UserId,
        content: impl Into<String>,
        client_temp_id: ClientTempId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: None,
            client_temp_id: Some(client_temp_id),
            chat_id,
            sender_id,
            content: content.into(),
            timestamp,
            delivery: DeliveryState::Pending,
        }
    }

    /// Builds a confirmed entry from a server message.
    #[must_use]
    pub fn confirmed(message: Message) -> Self {
        Self {
            id: Some(message.id),
            client_temp_id: message.client_temp_id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            content: message.content,
            timestamp: message.timestamp,
            delivery: DeliveryState::Sent,
        }
    }

    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }
}

/// Result of [`MessageState::apply_confirmed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entry was inserted at `index`.
    Inserted { index: usize },
    /// The optimistic entry for `client_temp_id` was replaced in place.
    ReplacedPending {
        client_temp_id: ClientTempId,
        index: usize,
    },
    /// The id was already present; nothing changed.
    Duplicate,
}

/// Result of [`MessageState::confirm_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The entry took the server id and is now `Sent`.
    Confirmed { chat_id: ChatId, index: usize },
    /// The server id was already present (the echo won the race), so the
    /// optimistic entry was removed.
    Merged { chat_id: ChatId },
    /// No unresolved entry has this temp id.
    NotPending,
}

/// Errors from optimistic-entry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageStateError {
    /// An unresolved entry with this temp id already exists.
    #[error("an unresolved entry with temp id {0} already exists")]
    DuplicatePending(ClientTempId),

    /// The entry passed to `append_pending` is not an unconfirmed pending entry.
    #[error("entry is not an unconfirmed pending entry")]
    NotPending,

    /// No unresolved entry has this temp id.
    #[error("no unresolved entry with temp id {0}")]
    UnknownTempId(ClientTempId),

    /// The entry is still pending, so it cannot be retried.
    #[error("entry {0} has not failed")]
    NotFailed(ClientTempId),
}

/// Shared per-chat message sequences.
#[derive(Debug, Clone, Default)]
pub struct MessageState {
    inner: Arc<Mutex<MessagesInner>>,
}

#[derive(Debug, Default)]
struct MessagesInner {
    chats: HashMap<ChatId, ChatLog>,
    /// Unresolved (pending or failed) optimistic entries, by temp id.
    unresolved: HashMap<ClientTempId, ChatId>,
}

#[derive(Debug, Default)]
struct ChatLog {
    entries: Vec<MessageEntry>,
    ids: HashSet<MessageId>,
}

impl MessageState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an optimistic entry at the tail of its chat.
    ///
    /// # Errors
    ///
    /// Returns [`MessageStateError::NotPending`] if `entry` is confirmed or
    /// has no temp id, and [`MessageStateError::DuplicatePending`] if an
    /// unresolved entry already uses its temp id.
    pub fn append_pending(&self, entry: MessageEntry) -> Result<usize, MessageStateError> {
        let Some(temp) = entry.client_temp_id.clone() else {
            return Err(MessageStateError::NotPending);
        };
        if entry.is_confirmed() || entry.delivery != DeliveryState::Pending {
            return Err(MessageStateError::NotPending);
        }
        let mut inner = self.inner.lock();
        if inner.unresolved.contains_key(&temp) {
            return Err(MessageStateError::DuplicatePending(temp));
        }
        inner.unresolved.insert(temp, entry.chat_id.clone());
        let log = inner.chats.entry(entry.chat_id.clone()).or_default();
        log.entries.push(entry);
        Ok(log.entries.len() - 1)
    }

    /// Applies a server-confirmed message.
    ///
    /// A message whose id is already present is ignored. A message
    /// carrying the temp id of an unresolved entry in the same chat
    /// replaces that entry in place. Otherwise the message is inserted
    /// after the last confirmed entry with a timestamp at or before its own.
    pub fn apply_confirmed(&self, chat_id: &ChatId, message: Message) -> ApplyOutcome {
        let mut inner = self.inner.lock();
        let MessagesInner { chats, unresolved } = &mut *inner;
        let log = chats.entry(chat_id.clone()).or_default();
        if log.ids.contains(&message.id) {
            return ApplyOutcome::Duplicate;
        }

        if let Some(temp) = message.client_temp_id.clone()
            && unresolved.get(&temp) == Some(chat_id)
            && let Some(index) = log.position_of(&temp)
        {
            unresolved.remove(&temp);
            log.ids.insert(message.id.clone());
            let entry = &mut log.entries[index];
            entry.id = Some(message.id);
            entry.sender_id = message.sender_id;
            entry.content = message.content;
            entry.timestamp = message.timestamp;
            entry.delivery = DeliveryState::Sent;
            let index = log.reposition(index);
            return ApplyOutcome::ReplacedPending {
                client_temp_id: temp,
                index,
            };
        }

        log.ids.insert(message.id.clone());
        let index = log.insertion_index(message.timestamp);
        log.entries.insert(index, MessageEntry::confirmed(message));
        ApplyOutcome::Inserted { index }
    }

    /// Confirms the unresolved entry for `temp` with its server id.
    ///
    /// `timestamp` replaces the local creation time when given. A failed
    /// entry is confirmed too, since the server did store it.
    pub fn confirm_pending(
        &self,
        temp: &ClientTempId,
        message_id: MessageId,
        timestamp: Option<Timestamp>,
    ) -> ConfirmOutcome {
        let mut inner = self.inner.lock();
        let MessagesInner { chats, unresolved } = &mut *inner;
        let Some(chat_id) = unresolved.remove(temp) else {
            return ConfirmOutcome::NotPending;
        };
        let Some(log) = chats.get_mut(&chat_id) else {
            return ConfirmOutcome::NotPending;
        };
        let Some(index) = log.position_of(temp) else {
            return ConfirmOutcome::NotPending;
        };

        if log.ids.contains(&message_id) {
            log.entries.remove(index);
            return ConfirmOutcome::Merged { chat_id };
        }

        log.ids.insert(message_id.clone());
        let entry = &mut log.entries[index];
        entry.id = Some(message_id);
        if let Some(ts) = timestamp {
            entry.timestamp = ts;
        }
        entry.delivery = DeliveryState::Sent;
        let index = log.reposition(index);
        ConfirmOutcome::Confirmed { chat_id, index }
    }

    /// Marks a pending entry as failed.
    ///
    /// Returns the entry's chat, or `None` if there is no entry for
    /// `temp` or it is not currently pending.
    pub fn mark_failed(&self, temp: &ClientTempId, reason: FailureReason) -> Option<ChatId> {
        let mut inner = self.inner.lock();
        let chat_id = inner.unresolved.get(temp)?.clone();
        let entry = inner.chats.get_mut(&chat_id)?.entry_mut(temp)?;
        if entry.delivery != DeliveryState::Pending {
            return None;
        }
        entry.delivery = DeliveryState::Failed(reason);
        Some(chat_id)
    }

    /// Moves a failed entry back to pending for another attempt.
    ///
    /// # Errors
    ///
    /// Returns [`MessageStateError::UnknownTempId`] if no unresolved entry
    /// has `temp`, or [`MessageStateError::NotFailed`] if it is still pending.
    pub fn begin_retry(&self, temp: &ClientTempId) -> Result<MessageEntry, MessageStateError> {
        let mut inner = self.inner.lock();
        let unknown = || MessageStateError::UnknownTempId(temp.clone());
        let chat_id = inner.unresolved.get(temp).cloned().ok_or_else(unknown)?;
        let entry = inner
            .chats
            .get_mut(&chat_id)
            .and_then(|log| log.entry_mut(temp))
            .ok_or_else(unknown)?;
        if !matches!(entry.delivery, DeliveryState::Failed(_)) {
            return Err(MessageStateError::NotFailed(temp.clone()));
        }
        entry.delivery = DeliveryState::Pending;
        Ok(entry.clone())
    }

    /// The unresolved entry for `temp`, if any.
    #[must_use]
    pub fn find_unresolved(&self, temp: &ClientTempId) -> Option<MessageEntry> {
        let inner = self.inner.lock();
        let chat_id = inner.unresolved.get(temp)?;
        inner
            .chats
            .get(chat_id)?
            .entries
            .iter()
            .find(|e| e.client_temp_id.as_ref() == Some(temp))
            .cloned()
    }

    /// Snapshot of one chat's sequence.
    #[must_use]
    pub fn entries(&self, chat_id: &ChatId) -> Vec<MessageEntry> {
        self.inner
            .lock()
            .chats
            .get(chat_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, chat_id: &ChatId) -> usize {
        self.inner
            .lock()
            .chats
            .get(chat_id)
            .map_or(0, |log| log.entries.len())
    }

    /// Id of the newest confirmed entry in `chat_id`.
    #[must_use]
    pub fn last_confirmed_id(&self, chat_id: &ChatId) -> Option<MessageId> {
        self.inner
            .lock()
            .chats
            .get(chat_id)?
            .entries
            .iter()
            .rev()
            .find_map(|e| e.id.clone())
    }

    /// Number of entries still awaiting confirmation, across all chats.
    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.inner.lock().unresolved.len()
    }

    /// Drops every chat, for logout.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.chats.clear();
        inner.unresolved.clear();
    }
}

impl ChatLog {
    fn position_of(&self, temp: &ClientTempId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.is_confirmed() && e.client_temp_id.as_ref() == Some(temp))
    }

    fn entry_mut(&mut self, temp: &ClientTempId) -> Option<&mut MessageEntry> {
        let index = self.position_of(temp)?;
        self.entries.get_mut(index)
    }

    /// Where a confirmed entry with timestamp `ts` belongs: just after the
    /// last confirmed entry at or before `ts`, else just before the first
    /// confirmed entry, else the head.
    fn insertion_index(&self, ts: Timestamp) -> usize {
        let mut first_confirmed = None;
        let mut after = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.is_confirmed() {
                continue;
            }
            if first_confirmed.is_none() {
                first_confirmed = Some(i);
            }
            if entry.timestamp <= ts {
                after = Some(i + 1);
            }
        }
        after.or(first_confirmed).unwrap_or(0)
    }

    /// Moves a just-confirmed entry if it now breaks timestamp order among
    /// confirmed entries. Returns its final index.
    fn reposition(&mut self, index: usize) -> usize {
        let ts = self.entries[index].timestamp;
        let before_ok = self.entries[..index]
            .iter()
            .rev()
            .find(|e| e.is_confirmed())
            .is_none_or(|e| e.timestamp <= ts);
        let after_ok = self.entries[index + 1..]
            .iter()
            .find(|e| e.is_confirmed())
            .is_none_or(|e| e.timestamp >= ts);
        if before_ok && after_ok {
            return index;
        }
        let entry = self.entries.remove(index);
        let target = self.insertion_index(ts);
        self.entries.insert(target, entry);
        target
    }
}
