//! Client-side state stores fed by the router and the outbound path.
//!
//! - [`chats::ChatState`]: chat list with unread counters and last messages
//! - [`messages::MessageState`]: per-chat ordered message sequences,
//!   including optimistic entries awaiting confirmation
//!
//! Both are cheap-to-clone handles over shared, lock-protected state. All
//! mutations are synchronous and take the lock for the duration of one
//! operation only, so concurrent callers observe each operation atomically.

pub mod chats;
pub mod messages;

pub use chats::ChatState;
pub use messages::{
    ApplyOutcome, ConfirmOutcome, DeliveryState, FailureReason, MessageEntry, MessageState,
    MessageStateError,
};
