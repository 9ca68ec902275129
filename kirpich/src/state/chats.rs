//! Chat list state: summaries, unread counters, last messages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use kirpich_proto::ids::{ChatId, MessageId};
use kirpich_proto::message::{ChatSummary, Message};

/// Shared chat list.
///
/// Unread increments are idempotent per message id: the same message
/// delivered twice (echo plus resync, or a replayed frame) counts once.
/// Read receipts naming a message id that was already applied are ignored.
#[derive(Debug, Clone)]
pub struct ChatState {
    inner: Arc<Mutex<ChatsInner>>,
    snapshot: Arc<watch::Sender<Arc<[ChatSummary]>>>,
}

#[derive(Debug)]
struct ChatsInner {
    chats: Vec<ChatSummary>,
    counted: HashMap<ChatId, HashSet<MessageId>>,
    last_receipt: HashMap<ChatId, MessageId>,
    max_tracked_ids: usize,
}

impl ChatState {
    /// Creates an empty chat list remembering up to `max_tracked_ids`
    /// counted message ids per chat.
    #[must_use]
    pub fn new(max_tracked_ids: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChatsInner {
                chats: Vec::new(),
                counted: HashMap::new(),
                last_receipt: HashMap::new(),
                max_tracked_ids: max_tracked_ids.max(1),
            })),
            snapshot: Arc::new(watch::Sender::new(Arc::from(Vec::new()))),
        }
    }

    /// Replaces the whole list with a server snapshot.
    ///
    /// Duplicate ids in `chats` keep their first occurrence. Counted ids
    /// and receipts survive, so a message already counted before the
    /// snapshot is not counted again if it is redelivered.
    pub fn replace_all(&self, chats: Vec<ChatSummary>) {
        let mut seen = HashSet::new();
        let deduped: Vec<ChatSummary> = chats
            .into_iter()
            .filter(|chat| seen.insert(chat.id.clone()))
            .collect();
        let mut inner = self.inner.lock();
        inner.chats = deduped;
        self.publish(&inner);
    }

    /// Records `message` as the chat's last message if it is at least as
    /// recent as the current one. Creates a placeholder summary for an
    /// unknown chat.
    ///
    /// Returns `true` if the last message changed.
    pub fn record_last_message(&self, message: &Message) -> bool {
        let mut inner = self.inner.lock();
        let chat = inner.chat_mut(&message.chat_id);
        let newer = chat
            .last_message
            .as_ref()
            .is_none_or(|current| message.timestamp >= current.timestamp);
        if newer {
            chat.last_message = Some(message.clone());
            self.publish(&inner);
        }
        newer
    }

    /// Counts `message_id` as unread in `chat_id`.
    ///
    /// Returns the new unread count, or `None` if this id was already
    /// counted.
    pub fn bump_unread(&self, chat_id: &ChatId, message_id: &MessageId) -> Option<u32> {
        let mut inner = self.inner.lock();
        let limit = inner.max_tracked_ids;
        let counted = inner.counted.entry(chat_id.clone()).or_default();
        if counted.contains(message_id) {
            return None;
        }
        if counted.len() >= limit {
            tracing::debug!(chat = %chat_id, limit, "clearing unread dedup set");
            counted.clear();
        }
        counted.insert(message_id.clone());

        let chat = inner.chat_mut(chat_id);
        chat.unread_count = chat.unread_count.saturating_add(1);
        let unread = chat.unread_count;
        self.publish(&inner);
        Some(unread)
    }

    /// Resets the unread count for `chat_id` to zero.
    ///
    /// With `receipt` set, a receipt for the same message id as the last
    /// applied one is a no-op. Returns `true` if anything was applied.
    pub fn clear_unread(&self, chat_id: &ChatId, receipt: Option<&MessageId>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(message_id) = receipt {
            if inner.last_receipt.get(chat_id) == Some(message_id) {
                return false;
            }
            inner.last_receipt.insert(chat_id.clone(), message_id.clone());
        }
        let Some(chat) = inner.chats.iter_mut().find(|c| &c.id == chat_id) else {
            return receipt.is_some();
        };
        if chat.unread_count == 0 {
            return receipt.is_some();
        }
        chat.unread_count = 0;
        self.publish(&inner);
        true
    }

    #[must_use]
    pub fn get(&self, chat_id: &ChatId) -> Option<ChatSummary> {
        self.inner
            .lock()
            .chats
            .iter()
            .find(|c| &c.id == chat_id)
            .cloned()
    }

    /// Unread count for `chat_id`, zero for unknown chats.
    #[must_use]
    pub fn unread(&self, chat_id: &ChatId) -> u32 {
        self.get(chat_id).map_or(0, |c| c.unread_count)
    }

    /// Current list, in server order with new chats appended.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[ChatSummary]> {
        self.snapshot.borrow().clone()
    }

    /// Observes every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<[ChatSummary]>> {
        self.snapshot.subscribe()
    }

    /// Drops all chats and bookkeeping, for logout.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.chats.clear();
        inner.counted.clear();
        inner.last_receipt.clear();
        self.publish(&inner);
    }

    fn publish(&self, inner: &ChatsInner) {
        self.snapshot.send_replace(Arc::from(inner.chats.clone()));
    }
}

impl ChatsInner {
    fn chat_mut(&mut self, chat_id: &ChatId) -> &mut ChatSummary {
        let index = match self.chats.iter().position(|c| &c.id == chat_id) {
            Some(index) => index,
            None => {
                tracing::debug!(chat = %chat_id, "creating placeholder for unknown chat");
                self.chats.push(ChatSummary::new(chat_id.clone(), chat_id.as_str()));
                self.chats.len() - 1
            }
        };
        &mut self.chats[index]
    }
}
