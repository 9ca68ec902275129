// Test-specific lint overrides: property tests use unwrap freely and cast
// small generated indexes.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::cast_possible_truncation,
    clippy::doc_markdown
)]

//! Property-based tests for the client state stores.
//!
//! Uses proptest to verify:
//! 1. Redelivered messages never duplicate entries, and confirmed entries
//!    stay ordered by timestamp whatever the arrival order.
//! 2. Every optimistic send ends as exactly one confirmed entry, whether
//!    the ack or the echoed message arrives first.
//! 3. Unread counters count each message id once.

use std::collections::HashSet;

use kirpich::state::{ChatState, DeliveryState, MessageEntry, MessageState};
use kirpich_proto::ids::{ChatId, ClientTempId, MessageId, Timestamp, UserId};
use kirpich_proto::message::Message;
use proptest::prelude::*;

fn chat() -> ChatId {
    ChatId::new("c1")
}

fn message(n: u16, at: u64) -> Message {
    Message {
        id: MessageId::new(format!("m{n}")),
        chat_id: chat(),
        sender_id: UserId::new("alice"),
        content: format!("message {n}"),
        timestamp: Timestamp::from_millis(at),
        client_temp_id: None,
    }
}

/// Server messages with distinct ids and small timestamps so ties occur.
fn arb_batch() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(0u64..50, 1..24).prop_map(|stamps| {
        stamps
            .into_iter()
            .enumerate()
            .map(|(i, at)| message(u16::try_from(i).unwrap(), at))
            .collect()
    })
}

/// A delivery schedule: indexes into the batch, each at least once.
fn arb_schedule(len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(0..len, 0..len * 2).prop_flat_map(move |extra| {
        let mut all: Vec<usize> = (0..len).collect();
        all.extend(extra);
        Just(all).prop_shuffle()
    })
}

proptest! {
    #[test]
    fn redelivery_is_idempotent_and_ordered(
        (batch, schedule) in arb_batch().prop_flat_map(|batch| {
            let len = batch.len();
            (Just(batch), arb_schedule(len))
        })
    ) {
        let state = MessageState::new();
        for &i in &schedule {
            state.apply_confirmed(&chat(), batch[i].clone());
        }

        let entries = state.entries(&chat());
        prop_assert_eq!(entries.len(), batch.len());

        let ids: HashSet<_> = entries.iter().filter_map(|e| e.id.clone()).collect();
        prop_assert_eq!(ids.len(), batch.len());

        for pair in entries.windows(2) {
            prop_assert!(pair[0].timestamp.as_millis() <= pair[1].timestamp.as_millis());
        }
    }

    #[test]
    fn each_send_confirms_exactly_once(ack_first in prop::collection::vec(any::<bool>(), 1..16)) {
        let state = MessageState::new();
        let mut sends = Vec::new();
        for (i, _) in ack_first.iter().enumerate() {
            let temp = ClientTempId::new();
            let entry = MessageEntry::pending(
                chat(),
                UserId::new("me"),
                format!("draft {i}"),
                temp.clone(),
                Timestamp::from_millis(1_000 + i as u64),
            );
            state.append_pending(entry).unwrap();
            sends.push(temp);
        }

        for (i, (temp, &ack_first)) in sends.iter().zip(&ack_first).enumerate() {
            let id = MessageId::new(format!("s{i}"));
            let at = Timestamp::from_millis(2_000 + i as u64);
            let echo = Message {
                id: id.clone(),
                chat_id: chat(),
                sender_id: UserId::new("me"),
                content: format!("draft {i}"),
                timestamp: at,
                client_temp_id: Some(temp.clone()),
            };
            if ack_first {
                state.confirm_pending(temp, id, Some(at));
                state.apply_confirmed(&chat(), echo);
            } else {
                state.apply_confirmed(&chat(), echo);
                state.confirm_pending(temp, id, Some(at));
            }
        }

        let entries = state.entries(&chat());
        prop_assert_eq!(entries.len(), sends.len());
        prop_assert!(entries.iter().all(|e| e.delivery == DeliveryState::Sent));
        prop_assert_eq!(state.unresolved_count(), 0);
        let contents: Vec<_> = entries.iter().map(|e| e.content.clone()).collect();
        let expected: Vec<_> = (0..sends.len()).map(|i| format!("draft {i}")).collect();
        prop_assert_eq!(contents, expected);
    }

    #[test]
    fn unread_counts_each_id_once(ids in prop::collection::vec(0u8..20, 0..64)) {
        let chats = ChatState::new(1_000);
        for id in &ids {
            chats.bump_unread(&chat(), &MessageId::new(format!("m{id}")));
        }
        let distinct: HashSet<_> = ids.iter().collect();
        prop_assert_eq!(chats.unread(&chat()) as usize, distinct.len());
    }

    #[test]
    fn clearing_unread_always_reaches_zero(
        ids in prop::collection::vec(0u8..20, 1..32),
        receipt in prop::option::of(0u8..20),
    ) {
        let chats = ChatState::new(1_000);
        for id in &ids {
            chats.bump_unread(&chat(), &MessageId::new(format!("m{id}")));
        }
        let receipt = receipt.map(|n| MessageId::new(format!("m{n}")));
        chats.clear_unread(&chat(), receipt.as_ref());
        prop_assert_eq!(chats.unread(&chat()), 0);

        // A repeated delivery after the clear does not resurrect the count.
        chats.bump_unread(&chat(), &MessageId::new(format!("m{}", ids[0])));
        prop_assert_eq!(chats.unread(&chat()), 0);
    }
}
