// Real-time event normalization.
//
// The push channel delivers loosely-shaped JSON payloads tagged by kind.
// Everything downstream works on the closed CanonicalEvent enum instead, so
// the coordinator can match exhaustively. Message events are forwarded with
// zero buffering; every other kind runs through a small per-kind debounce
// window so bursts do not trigger redundant recomputation.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::{DeliveryStatus, Direction, Message, MessageKind};
use crate::util::now_ms;

/// A raw payload as delivered by the push channel.
#[derive(Debug, Clone)]
pub struct RawPushEvent {
    pub kind: String,
    pub payload: Value,
}

impl RawPushEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        RawPushEvent {
            kind: kind.into(),
            payload,
        }
    }
}

/// Partial contact-summary update carried by a `chat_update` event. Only the
/// present fields are merged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactPatch {
    pub name: Option<String>,
    pub number: Option<String>,
    pub is_group: Option<bool>,
    pub is_online: Option<bool>,
}

#[derive(Debug, Clone)]
pub enum CanonicalEvent {
    Message(Message),
    Status {
        message_id: String,
        status: DeliveryStatus,
    },
    Typing {
        chat_id: String,
        typing: bool,
    },
    ChatUpdate {
        chat_id: String,
        patch: ContactPatch,
    },
    SyncUpdate {
        chat_ids: Vec<String>,
        immediate: bool,
    },
}

impl CanonicalEvent {
    pub fn kind_key(&self) -> &'static str {
        match self {
            CanonicalEvent::Message(_) => "message",
            CanonicalEvent::Status { .. } => "status",
            CanonicalEvent::Typing { .. } => "typing",
            CanonicalEvent::ChatUpdate { .. } => "chat_update",
            CanonicalEvent::SyncUpdate { .. } => "sync_update",
        }
    }

    /// Key under which back-to-back events supersede each other while
    /// waiting in the coalescer.
    fn coalesce_key(&self) -> String {
        match self {
            CanonicalEvent::Message(m) => format!("message:{}", m.id()),
            CanonicalEvent::Status { message_id, .. } => format!("status:{}", message_id),
            CanonicalEvent::Typing { chat_id, .. } => format!("typing:{}", chat_id),
            CanonicalEvent::ChatUpdate { chat_id, .. } => format!("chat_update:{}", chat_id),
            CanonicalEvent::SyncUpdate { .. } => "sync_update".to_string(),
        }
    }
}

/// Convert a raw push payload into a canonical event. Unknown kinds and
/// structurally broken payloads are dropped with a warning; they must never
/// take the engine down.
pub fn normalize(raw: &RawPushEvent) -> Option<CanonicalEvent> {
    match raw.kind.as_str() {
        "message" => normalize_message(&raw.payload).map(CanonicalEvent::Message),
        "status" => normalize_status(&raw.payload),
        "state" | "typing" => normalize_typing(&raw.payload),
        "chat_update" => normalize_chat_update(&raw.payload),
        "sync_update" => normalize_sync_update(&raw.payload),
        other => {
            warn!("dropping push event with unknown kind '{}'", other);
            None
        }
    }
}

fn normalize_message(payload: &Value) -> Option<Message> {
    let chat_id = field_str(payload, &["chat_id", "chatId"])?;
    let text = field_str(payload, &["text", "body"]).unwrap_or_default();
    let server_id = field_str(payload, &["id", "message_id", "messageId"]);

    let timestamp = field(payload, &["timestamp", "time", "t"])
        .and_then(coerce_timestamp)
        .unwrap_or_else(now_ms);

    let direction = if field(payload, &["from_me", "fromMe"])
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || field_str(payload, &["direction"]).as_deref() == Some("sent")
    {
        Direction::Sent
    } else {
        Direction::Received
    };

    let kind = field_str(payload, &["type", "kind"])
        .map(|t| MessageKind::from_wire(&t))
        .unwrap_or(MessageKind::Text);

    let status = match direction {
        // A sent message showing up on the push channel is the server echo.
        Direction::Sent => DeliveryStatus::Sent,
        Direction::Received => DeliveryStatus::Delivered,
    };

    Some(Message {
        local_id: Uuid::new_v4().to_string(),
        server_id,
        chat_id,
        text,
        timestamp,
        direction,
        status,
        kind,
        is_optimistic: false,
    })
}

fn normalize_status(payload: &Value) -> Option<CanonicalEvent> {
    let message_id = field_str(payload, &["message_id", "messageId", "id"])?;
    let status = field_str(payload, &["status"]).and_then(|s| parse_delivery_status(&s));
    match status {
        Some(status) => Some(CanonicalEvent::Status { message_id, status }),
        None => {
            warn!("status event for {} carries no parsable status", message_id);
            None
        }
    }
}

fn normalize_typing(payload: &Value) -> Option<CanonicalEvent> {
    let chat_id = field_str(payload, &["chat_id", "chatId"])?;
    let typing = field(payload, &["typing", "is_typing", "isTyping"])
        .and_then(Value::as_bool)
        .unwrap_or_else(|| {
            // `state` events carry the chat-state name instead of a flag.
            field_str(payload, &["state"]).as_deref() == Some("composing")
        });
    Some(CanonicalEvent::Typing { chat_id, typing })
}

fn normalize_chat_update(payload: &Value) -> Option<CanonicalEvent> {
    let chat_id = field_str(payload, &["chat_id", "chatId"])?;
    let patch = ContactPatch {
        name: field_str(payload, &["name", "contact_name", "contactName"]),
        number: field_str(payload, &["number", "phone"]),
        is_group: field(payload, &["is_group", "isGroup"]).and_then(Value::as_bool),
        is_online: field(payload, &["is_online", "isOnline"]).and_then(Value::as_bool),
    };
    if patch == ContactPatch::default() {
        debug!("chat_update for {} carries no recognized fields", chat_id);
        return None;
    }
    Some(CanonicalEvent::ChatUpdate { chat_id, patch })
}

fn normalize_sync_update(payload: &Value) -> Option<CanonicalEvent> {
    let chat_ids: Vec<String> = match field(payload, &["chat_ids", "chatIds"]) {
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => field_str(payload, &["chat_id", "chatId"])
            .map(|id| vec![id])
            .unwrap_or_default(),
    };
    if chat_ids.is_empty() {
        debug!("sync_update names no chats, dropping");
        return None;
    }
    let immediate = field(payload, &["immediate"])
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Some(CanonicalEvent::SyncUpdate { chat_ids, immediate })
}

fn field<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| payload.get(*name))
}

fn field_str(payload: &Value, names: &[&str]) -> Option<String> {
    field(payload, names)
        .and_then(Value::as_str)
        .map(String::from)
}

fn parse_delivery_status(raw: &str) -> Option<DeliveryStatus> {
    match raw {
        "pending" => Some(DeliveryStatus::Pending),
        "sent" => Some(DeliveryStatus::Sent),
        "delivered" => Some(DeliveryStatus::Delivered),
        "read" => Some(DeliveryStatus::Read),
        "failed" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

/// Coerce the timestamp shapes seen on the wire (seconds or milliseconds,
/// numeric strings, RFC 3339 strings) into Unix milliseconds.
fn coerce_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(normalize_epoch(v))
            } else {
                n.as_f64().map(|f| {
                    if f < EPOCH_MS_THRESHOLD as f64 {
                        (f * 1000.0) as i64
                    } else {
                        f as i64
                    }
                })
            }
        }
        Value::String(s) => {
            if let Ok(v) = s.parse::<i64>() {
                return Some(normalize_epoch(v));
            }
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }
        _ => None,
    }
}

/// Epoch values below this are seconds, above it milliseconds. The cutover
/// (~5138 AD in seconds, ~1973 in milliseconds) is far outside any timestamp
/// this system can see.
const EPOCH_MS_THRESHOLD: i64 = 100_000_000_000;

fn normalize_epoch(v: i64) -> i64 {
    if v.abs() < EPOCH_MS_THRESHOLD {
        v * 1000
    } else {
        v
    }
}

/// Collapse a newer event onto a pending one with the same coalesce key.
///
/// For most kinds the newest event is the current truth and wins outright.
/// Sync advisories are cumulative instead: every chat named by a pending
/// advisory keeps its pull, and an already-applied (`immediate`) advisory
/// only covers the chats it names itself.
fn supersede(pending: CanonicalEvent, newer: CanonicalEvent) -> CanonicalEvent {
    match (pending, newer) {
        (
            CanonicalEvent::SyncUpdate {
                chat_ids: pending_ids,
                immediate: pending_immediate,
            },
            CanonicalEvent::SyncUpdate {
                chat_ids: newer_ids,
                immediate: newer_immediate,
            },
        ) => {
            let mut needs_pull = if pending_immediate {
                Vec::new()
            } else {
                pending_ids
            };
            if newer_immediate {
                needs_pull.retain(|id| !newer_ids.contains(id));
            } else {
                for id in newer_ids {
                    if !needs_pull.contains(&id) {
                        needs_pull.push(id);
                    }
                }
            }
            let immediate = needs_pull.is_empty();
            CanonicalEvent::SyncUpdate {
                chat_ids: needs_pull,
                immediate,
            }
        }
        (_, newer) => newer,
    }
}

/// Per-kind debounce buffer for non-message events.
///
/// The first event of a kind opens a window; later events of the same kind
/// land in the same window, and events with the same coalesce key supersede
/// each other. `drain_due` hands back everything whose window has elapsed.
/// Message events never pass through here.
pub struct EventCoalescer {
    window: Duration,
    pending: Vec<(String, CanonicalEvent)>,
    deadlines: HashMap<&'static str, Instant>,
}

impl EventCoalescer {
    pub fn new(window: Duration) -> Self {
        EventCoalescer {
            window,
            pending: Vec::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Buffer an event. Returns true when this kind had no open window, in
    /// which case the caller is responsible for scheduling a flush.
    pub fn push(&mut self, event: CanonicalEvent, now: Instant) -> bool {
        debug_assert!(
            !matches!(event, CanonicalEvent::Message(_)),
            "message events are applied synchronously, never coalesced"
        );

        let key = event.coalesce_key();
        let kind = event.kind_key();
        if let Some(slot) = self.pending.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = supersede(slot.1.clone(), event);
        } else {
            self.pending.push((key, event));
        }

        if self.deadlines.contains_key(kind) {
            false
        } else {
            self.deadlines.insert(kind, now + self.window);
            true
        }
    }

    /// Remove and return all buffered events whose window has elapsed, in
    /// arrival order.
    pub fn drain_due(&mut self, now: Instant) -> Vec<CanonicalEvent> {
        let due: Vec<&'static str> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, _)| *kind)
            .collect();
        if due.is_empty() {
            return Vec::new();
        }
        for kind in &due {
            self.deadlines.remove(kind);
        }

        let mut drained = Vec::new();
        self.pending.retain(|(_, event)| {
            if due.contains(&event.kind_key()) {
                drained.push(event.clone());
                false
            } else {
                true
            }
        });
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_message_with_second_timestamps() {
        let raw = RawPushEvent::new(
            "message",
            json!({"id": "srv-1", "chatId": "chat1", "body": "hello", "timestamp": 1_700_000_000}),
        );
        match normalize(&raw) {
            Some(CanonicalEvent::Message(msg)) => {
                assert_eq!(msg.server_id.as_deref(), Some("srv-1"));
                assert_eq!(msg.chat_id, "chat1");
                assert_eq!(msg.text, "hello");
                assert_eq!(msg.timestamp, 1_700_000_000_000);
                assert_eq!(msg.direction, Direction::Received);
            }
            other => panic!("unexpected normalization result: {:?}", other),
        }
    }

    #[test]
    fn accepts_millis_numeric_strings_and_rfc3339() {
        for (value, expected) in [
            (json!(1_700_000_000_123i64), 1_700_000_000_123),
            (json!("1700000000"), 1_700_000_000_000),
            (json!("2023-11-14T22:13:20Z"), 1_700_000_000_000),
        ] {
            assert_eq!(coerce_timestamp(&value), Some(expected), "for {}", value);
        }
        assert_eq!(coerce_timestamp(&json!(null)), None);
        assert_eq!(coerce_timestamp(&json!("not a time")), None);
    }

    #[test]
    fn from_me_flag_marks_direction_sent() {
        let raw = RawPushEvent::new(
            "message",
            json!({"chat_id": "chat1", "text": "mine", "fromMe": true, "timestamp": 1_700_000_000}),
        );
        match normalize(&raw) {
            Some(CanonicalEvent::Message(msg)) => {
                assert_eq!(msg.direction, Direction::Sent);
                assert_eq!(msg.status, DeliveryStatus::Sent);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn message_without_chat_id_is_dropped() {
        let raw = RawPushEvent::new("message", json!({"text": "orphan"}));
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn unknown_kind_is_dropped() {
        let raw = RawPushEvent::new("presence", json!({"chat_id": "chat1"}));
        assert!(normalize(&raw).is_none());
    }

    #[test]
    fn status_event_parses_delivery_status() {
        let raw = RawPushEvent::new("status", json!({"message_id": "srv-1", "status": "read"}));
        match normalize(&raw) {
            Some(CanonicalEvent::Status { message_id, status }) => {
                assert_eq!(message_id, "srv-1");
                assert_eq!(status, DeliveryStatus::Read);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn state_event_maps_composing_to_typing() {
        let raw = RawPushEvent::new("state", json!({"chat_id": "chat1", "state": "composing"}));
        match normalize(&raw) {
            Some(CanonicalEvent::Typing { chat_id, typing }) => {
                assert_eq!(chat_id, "chat1");
                assert!(typing);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let stopped = RawPushEvent::new("state", json!({"chat_id": "chat1", "state": "paused"}));
        match normalize(&stopped) {
            Some(CanonicalEvent::Typing { typing, .. }) => assert!(!typing),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn sync_update_accepts_single_or_many_chats() {
        let single = RawPushEvent::new("sync_update", json!({"chat_id": "chat1"}));
        match normalize(&single) {
            Some(CanonicalEvent::SyncUpdate { chat_ids, immediate }) => {
                assert_eq!(chat_ids, vec!["chat1"]);
                assert!(!immediate);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let many = RawPushEvent::new(
            "sync_update",
            json!({"chatIds": ["chat1", "chat2"], "immediate": true}),
        );
        match normalize(&many) {
            Some(CanonicalEvent::SyncUpdate { chat_ids, immediate }) => {
                assert_eq!(chat_ids, vec!["chat1", "chat2"]);
                assert!(immediate);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalescer_collapses_same_key_bursts() {
        let mut coalescer = EventCoalescer::new(Duration::from_millis(10));
        let now = Instant::now();

        let opened = coalescer.push(
            CanonicalEvent::Typing {
                chat_id: "chat1".into(),
                typing: true,
            },
            now,
        );
        assert!(opened);
        let opened_again = coalescer.push(
            CanonicalEvent::Typing {
                chat_id: "chat1".into(),
                typing: false,
            },
            now,
        );
        assert!(!opened_again);

        // Not due yet.
        assert!(coalescer.drain_due(now + Duration::from_millis(5)).is_empty());

        let drained = coalescer.drain_due(now + Duration::from_millis(10));
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            CanonicalEvent::Typing { typing, .. } => assert!(!typing, "latest event wins"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(coalescer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn coalescer_keeps_kind_windows_independent() {
        let mut coalescer = EventCoalescer::new(Duration::from_millis(10));
        let now = Instant::now();

        coalescer.push(
            CanonicalEvent::Typing {
                chat_id: "chat1".into(),
                typing: true,
            },
            now,
        );
        coalescer.push(
            CanonicalEvent::Status {
                message_id: "srv-1".into(),
                status: DeliveryStatus::Delivered,
            },
            now + Duration::from_millis(8),
        );

        let first = coalescer.drain_due(now + Duration::from_millis(10));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind_key(), "typing");

        let second = coalescer.drain_due(now + Duration::from_millis(18));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind_key(), "status");
    }

    #[tokio::test(start_paused = true)]
    async fn sync_advisories_merge_their_chat_ids() {
        let mut coalescer = EventCoalescer::new(Duration::from_millis(10));
        let now = Instant::now();

        coalescer.push(
            CanonicalEvent::SyncUpdate {
                chat_ids: vec!["chatA".into()],
                immediate: false,
            },
            now,
        );
        coalescer.push(
            CanonicalEvent::SyncUpdate {
                chat_ids: vec!["chatB".into()],
                immediate: false,
            },
            now,
        );

        let drained = coalescer.drain_due(now + Duration::from_millis(10));
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            CanonicalEvent::SyncUpdate { chat_ids, immediate } => {
                assert_eq!(chat_ids, &vec!["chatA".to_string(), "chatB".to_string()]);
                assert!(!immediate, "a pending pull survives the merge");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_advisory_only_covers_its_own_chats() {
        let mut coalescer = EventCoalescer::new(Duration::from_millis(10));
        let now = Instant::now();

        coalescer.push(
            CanonicalEvent::SyncUpdate {
                chat_ids: vec!["chatA".into()],
                immediate: false,
            },
            now,
        );
        // Already applied upstream, but for a different chat.
        coalescer.push(
            CanonicalEvent::SyncUpdate {
                chat_ids: vec!["chatB".into()],
                immediate: true,
            },
            now,
        );

        let drained = coalescer.drain_due(now + Duration::from_millis(10));
        match &drained[0] {
            CanonicalEvent::SyncUpdate { chat_ids, immediate } => {
                assert_eq!(chat_ids, &vec!["chatA".to_string()]);
                assert!(!immediate, "chatA still needs its pull");
            }
            other => panic!("unexpected: {:?}", other),
        }

        // When the immediate advisory names the pending chat, the pull is
        // genuinely covered and gets cancelled.
        let later = now + Duration::from_millis(20);
        coalescer.push(
            CanonicalEvent::SyncUpdate {
                chat_ids: vec!["chatC".into()],
                immediate: false,
            },
            later,
        );
        coalescer.push(
            CanonicalEvent::SyncUpdate {
                chat_ids: vec!["chatC".into()],
                immediate: true,
            },
            later,
        );
        let drained = coalescer.drain_due(later + Duration::from_millis(10));
        match &drained[0] {
            CanonicalEvent::SyncUpdate { chat_ids, immediate } => {
                assert!(chat_ids.is_empty());
                assert!(immediate);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coalescer_preserves_distinct_entities() {
        let mut coalescer = EventCoalescer::new(Duration::from_millis(10));
        let now = Instant::now();

        coalescer.push(
            CanonicalEvent::Typing {
                chat_id: "chat1".into(),
                typing: true,
            },
            now,
        );
        coalescer.push(
            CanonicalEvent::Typing {
                chat_id: "chat2".into(),
                typing: true,
            },
            now,
        );

        let drained = coalescer.drain_due(now + Duration::from_millis(10));
        assert_eq!(drained.len(), 2);
    }
}
