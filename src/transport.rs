// REST boundary of the engine.
//
// The actual backend (and the browser automation behind it) is an external
// collaborator; the engine only depends on this trait. Integration tests
// implement it with an in-memory mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::models::{Chat, Message, Profile};

/// One page of a chat listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPage {
    pub chats: Vec<Chat>,
    /// Total chats known to the backend for this profile.
    pub total: usize,
}

/// One page of message history, newest-last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Total messages the backend holds for this chat, when it reports one.
    pub total: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    /// Server-assigned id for the delivered message.
    pub message_id: String,
}

/// Backend's answer to a sync-check probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCheck {
    pub needs_sync: bool,
    /// Message count the backend holds, when it reports one.
    pub server_count: Option<usize>,
}

#[async_trait]
pub trait RestClient: Send + Sync {
    async fn list_profiles(&self) -> Result<Vec<Profile>, SyncError>;

    async fn list_chats(
        &self,
        profile_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<ChatPage, SyncError>;

    /// Message history for a chat, newest-last. `before` is an exclusive
    /// cursor: only messages older than that server id are returned.
    async fn list_messages(
        &self,
        profile_id: &str,
        chat_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, SyncError>;

    async fn send_message(
        &self,
        profile_id: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<SendAck, SyncError>;

    async fn mark_read(
        &self,
        profile_id: &str,
        chat_id: &str,
        message_ids: &[String],
    ) -> Result<(), SyncError>;

    /// Ask the backend whether the client's view of a chat looks stale.
    async fn sync_check(
        &self,
        profile_id: &str,
        chat_id: &str,
        last_message_id: Option<&str>,
        last_timestamp: Option<i64>,
        known_count: usize,
    ) -> Result<SyncCheck, SyncError>;
}
