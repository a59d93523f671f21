use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// One connected chat account. Profiles are created by the backend; the
/// engine only reads them to scope chats and messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSummary {
    pub name: String,
    pub number: String,
    pub is_group: bool,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub contact: ContactSummary,
    pub unread_count: u32,
    /// Unix milliseconds of the most recent message or chat event.
    pub last_activity: i64,
    pub pinned: bool,
    pub archived: bool,
    /// Set by `typing` push events, cleared by the next one.
    pub typing: bool,
    /// Non-fatal warning state surfaced when reconciliation fails.
    pub warning: Option<ErrorCategory>,
}

impl Chat {
    pub fn new(id: impl Into<String>, contact: ContactSummary) -> Self {
        Chat {
            id: id.into(),
            contact,
            unread_count: 0,
            last_activity: 0,
            pinned: false,
            archived: false,
            typing: false,
            warning: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// Delivery lifecycle of a message. The ordering matters: a status update is
/// only applied when it moves forward, except `Failed` which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending = 0,
    Sent = 1,
    Delivered = 2,
    Read = 3,
    Failed = 4,
}

impl DeliveryStatus {
    /// Whether moving from `self` to `next` is a legal forward transition.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        if self == DeliveryStatus::Failed {
            return false;
        }
        if next == DeliveryStatus::Failed {
            return true;
        }
        next > self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Other,
}

impl MessageKind {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "chat" | "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "audio" | "ptt" => MessageKind::Audio,
            "video" => MessageKind::Video,
            "document" => MessageKind::Document,
            _ => MessageKind::Other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Locally generated id, stable for the lifetime of the entry. This is
    /// the only id an optimistic placeholder has until the server confirms.
    pub local_id: String,
    /// Server-assigned id, `None` while the message is only known locally.
    pub server_id: Option<String>,
    pub chat_id: String,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub direction: Direction,
    pub status: DeliveryStatus,
    pub kind: MessageKind,
    pub is_optimistic: bool,
}

impl Message {
    /// The id to show or key on: the server id once assigned, the local
    /// placeholder id before that.
    pub fn id(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.local_id)
    }

    /// Build a received message as observed from a pull or push payload.
    pub fn received(
        server_id: Option<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Message {
            local_id: Uuid::new_v4().to_string(),
            server_id,
            chat_id: chat_id.into(),
            text: text.into(),
            timestamp,
            direction: Direction::Received,
            status: DeliveryStatus::Delivered,
            kind: MessageKind::Text,
            is_optimistic: false,
        }
    }

    /// Build the local placeholder for an outgoing message.
    pub fn placeholder(chat_id: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        Message {
            local_id: Uuid::new_v4().to_string(),
            server_id: None,
            chat_id: chat_id.into(),
            text: text.into(),
            timestamp,
            direction: Direction::Sent,
            status: DeliveryStatus::Pending,
            kind: MessageKind::Text,
            is_optimistic: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_has_no_server_id() {
        let msg = Message::placeholder("chat1", "hello", 1_700_000_000_000);
        assert!(msg.server_id.is_none());
        assert!(msg.is_optimistic);
        assert_eq!(msg.status, DeliveryStatus::Pending);
        assert_eq!(msg.id(), msg.local_id);
    }

    #[test]
    fn server_id_wins_for_display_id() {
        let mut msg = Message::received(Some("srv-1".into()), "chat1", "hi", 0);
        assert_eq!(msg.id(), "srv-1");
        msg.server_id = None;
        assert_eq!(msg.id(), msg.local_id);
    }

    #[test]
    fn delivery_status_only_advances_forward() {
        assert!(DeliveryStatus::Pending.can_advance_to(DeliveryStatus::Sent));
        assert!(DeliveryStatus::Sent.can_advance_to(DeliveryStatus::Read));
        assert!(!DeliveryStatus::Read.can_advance_to(DeliveryStatus::Delivered));
        assert!(DeliveryStatus::Sent.can_advance_to(DeliveryStatus::Failed));
        assert!(!DeliveryStatus::Failed.can_advance_to(DeliveryStatus::Sent));
    }

    #[test]
    fn message_kind_maps_wire_names() {
        assert_eq!(MessageKind::from_wire("chat"), MessageKind::Text);
        assert_eq!(MessageKind::from_wire("ptt"), MessageKind::Audio);
        assert_eq!(MessageKind::from_wire("sticker"), MessageKind::Other);
    }
}
