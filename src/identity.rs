// Canonical message identity.
//
// Push events and pull responses frequently re-deliver the same message, and
// an optimistic placeholder has no server id at all until the REST round-trip
// completes. The canonical identity is therefore the server id when one is
// assigned, and otherwise a composite of (chat, direction, text, second
// bucket). Once a server id is assigned it always wins; the composite entry
// is retired by the in-place replacement in the coordinator.

use crate::models::{Direction, Message};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageIdentity {
    Server(String),
    Composite {
        chat_id: String,
        direction: Direction,
        text: String,
        /// Message timestamp rounded down to whole seconds.
        time_bucket: i64,
    },
}

pub fn identity_of(message: &Message) -> MessageIdentity {
    match &message.server_id {
        Some(id) => MessageIdentity::Server(id.clone()),
        None => composite_of(message),
    }
}

fn composite_of(message: &Message) -> MessageIdentity {
    MessageIdentity::Composite {
        chat_id: message.chat_id.clone(),
        direction: message.direction,
        text: message.text.clone(),
        time_bucket: message.timestamp.div_euclid(1000),
    }
}

/// Locate the existing entry the candidate resolves to, if any.
///
/// Server-id equality is checked first. The composite fallback then catches
/// re-deliveries without a stable id, and in particular the server echo of an
/// optimistic placeholder: a candidate that carries a server id still matches
/// a placeholder with the same composite key. Two entries that carry
/// *different* server ids are never the same message, whatever their content.
pub fn find_match(candidate: &Message, existing: &[Message]) -> Option<usize> {
    if let Some(server_id) = candidate.server_id.as_deref() {
        if let Some(index) = existing
            .iter()
            .position(|m| m.server_id.as_deref() == Some(server_id))
        {
            return Some(index);
        }
    }

    let key = composite_of(candidate);
    existing.iter().position(|m| {
        let ids_conflict = candidate.server_id.is_some() && m.server_id.is_some();
        !ids_conflict && composite_of(m) == key
    })
}

pub fn is_duplicate(candidate: &Message, existing: &[Message]) -> bool {
    find_match(candidate, existing).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    fn received(server_id: Option<&str>, text: &str, ts: i64) -> Message {
        Message::received(server_id.map(String::from), "chat1", text, ts)
    }

    #[test]
    fn server_id_is_preferred_identity() {
        let msg = received(Some("srv-1"), "hello", 1_700_000_000_123);
        assert_eq!(identity_of(&msg), MessageIdentity::Server("srv-1".into()));
    }

    #[test]
    fn composite_fallback_buckets_to_one_second() {
        let a = received(None, "hello", 1_700_000_000_100);
        let b = received(None, "hello", 1_700_000_000_900);
        let c = received(None, "hello", 1_700_000_001_100);
        assert_eq!(identity_of(&a), identity_of(&b));
        assert_ne!(identity_of(&a), identity_of(&c));
    }

    #[test]
    fn redelivery_without_id_matches_confirmed_entry() {
        let existing = vec![received(Some("srv-1"), "hello", 1_700_000_000_100)];
        let redelivery = received(None, "hello", 1_700_000_000_400);
        assert_eq!(find_match(&redelivery, &existing), Some(0));
    }

    #[test]
    fn server_echo_matches_optimistic_placeholder() {
        let placeholder = Message::placeholder("chat1", "hello", 1_700_000_000_200);
        let existing = vec![placeholder];

        let mut echo = Message::placeholder("chat1", "hello", 1_700_000_000_700);
        echo.server_id = Some("srv-9".into());
        echo.is_optimistic = false;

        assert_eq!(find_match(&echo, &existing), Some(0));
    }

    #[test]
    fn distinct_server_ids_never_collapse() {
        let existing = vec![received(Some("srv-1"), "hello", 1_700_000_000_100)];
        let other = received(Some("srv-2"), "hello", 1_700_000_000_100);
        assert_eq!(find_match(&other, &existing), None);
    }

    #[test]
    fn direction_distinguishes_identical_text() {
        let incoming = received(None, "ok", 1_700_000_000_000);
        let mut outgoing = Message::placeholder("chat1", "ok", 1_700_000_000_000);
        outgoing.is_optimistic = false;
        assert!(!is_duplicate(&outgoing, std::slice::from_ref(&incoming)));
    }

    #[test]
    fn different_chats_are_distinct() {
        let a = received(None, "hello", 1_700_000_000_000);
        let mut b = a.clone();
        b.chat_id = "chat2".into();
        assert!(!is_duplicate(&b, std::slice::from_ref(&a)));
    }
}
