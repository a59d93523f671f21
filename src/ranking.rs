// Deterministic chat ordering.
//
// The rank of a chat is a pure function of (unread > 0, last_activity, name,
// id). It is recomputed in full after every mutation that touches unread
// counts or activity; it is never patched incrementally, which is how rank
// drift bugs start.

use std::cmp::Ordering;

use crate::models::Chat;

/// Two activity timestamps closer than this count as simultaneous, and the
/// unread count breaks the tie instead.
const ACTIVITY_TIE_WINDOW_MS: i64 = 1000;

/// Total order over chats. Unread chats first, then most recent activity,
/// with near-simultaneous activity broken by unread count, then name, then
/// id so the order is fully deterministic.
pub fn compare_chats(a: &Chat, b: &Chat) -> Ordering {
    let a_has_unread = a.unread_count > 0;
    let b_has_unread = b.unread_count > 0;

    b_has_unread
        .cmp(&a_has_unread)
        .then_with(|| {
            if (a.last_activity - b.last_activity).abs() < ACTIVITY_TIE_WINDOW_MS {
                b.unread_count.cmp(&a.unread_count)
            } else {
                b.last_activity.cmp(&a.last_activity)
            }
        })
        .then_with(|| {
            a.contact
                .name
                .to_lowercase()
                .cmp(&b.contact.name.to_lowercase())
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Order a chat collection. Pure and idempotent; the sort is stable, so
/// re-ranking an already ranked collection is a no-op.
pub fn rank(mut chats: Vec<Chat>) -> Vec<Chat> {
    chats.sort_by(compare_chats);
    chats
}
