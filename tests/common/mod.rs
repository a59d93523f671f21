// Shared test harness: an in-memory REST backend plus fixture builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use waveline::sync::SendOutcome;
use waveline::transport::{ChatPage, MessagePage, SendAck, SyncCheck};
use waveline::{
    Chat, ContactSummary, EngineUpdate, Message, Profile, RestClient, SyncConfig, SyncCoordinator,
    SyncError,
};

pub fn setup_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-memory stand-in for the REST backend. Message stores are kept
/// oldest-first; pages are served newest-last like the real API.
pub struct MockRestClient {
    chats: Mutex<Vec<Chat>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    calls: Mutex<Vec<String>>,
    fail_message_pulls: AtomicBool,
    fail_sends: AtomicBool,
    report_totals: AtomicBool,
    needs_sync: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    pull_delay: Mutex<Option<Duration>>,
    send_seq: AtomicUsize,
}

impl MockRestClient {
    pub fn new() -> Arc<Self> {
        Arc::new(MockRestClient {
            chats: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_message_pulls: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            report_totals: AtomicBool::new(false),
            needs_sync: AtomicBool::new(false),
            send_delay: Mutex::new(None),
            pull_delay: Mutex::new(None),
            send_seq: AtomicUsize::new(0),
        })
    }

    pub fn put_chat(&self, chat: Chat) {
        self.chats.lock().unwrap().push(chat);
    }

    pub fn put_messages(&self, chat_id: &str, messages: Vec<Message>) {
        self.messages
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), messages);
    }

    pub fn set_fail_message_pulls(&self, fail: bool) {
        self.fail_message_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_report_totals(&self, report: bool) {
        self.report_totals.store(report, Ordering::SeqCst);
    }

    pub fn set_needs_sync(&self, needs: bool) {
        self.needs_sync.store(needs, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn set_pull_delay(&self, delay: Option<Duration>) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RestClient for MockRestClient {
    async fn list_profiles(&self) -> Result<Vec<Profile>, SyncError> {
        self.record("list_profiles".to_string());
        Ok(Vec::new())
    }

    async fn list_chats(
        &self,
        _profile_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<ChatPage, SyncError> {
        self.record(format!("list_chats(page={})", page));
        let chats = self.chats.lock().unwrap();
        let start = (page * page_size).min(chats.len());
        let end = (start + page_size).min(chats.len());
        Ok(ChatPage {
            chats: chats[start..end].to_vec(),
            total: chats.len(),
        })
    }

    async fn list_messages(
        &self,
        _profile_id: &str,
        chat_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, SyncError> {
        self.record(format!("list_messages({},before={:?})", chat_id, before));
        let delay = *self.pull_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_message_pulls.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("mock pull failure".to_string()));
        }

        let all = self
            .messages
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default();
        let upto: Vec<Message> = match before {
            Some(cursor) => {
                let cut = all
                    .iter()
                    .position(|m| m.server_id.as_deref() == Some(cursor))
                    .unwrap_or(0);
                all[..cut].to_vec()
            }
            None => all.clone(),
        };
        let start = upto.len().saturating_sub(limit);
        Ok(MessagePage {
            messages: upto[start..].to_vec(),
            total: self
                .report_totals
                .load(Ordering::SeqCst)
                .then_some(all.len()),
        })
    }

    async fn send_message(
        &self,
        _profile_id: &str,
        chat_id: &str,
        _text: &str,
    ) -> Result<SendAck, SyncError> {
        self.record(format!("send_message({})", chat_id));
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("mock send failure".to_string()));
        }
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SendAck {
            message_id: format!("srv-send-{}", seq),
        })
    }

    async fn mark_read(
        &self,
        _profile_id: &str,
        chat_id: &str,
        message_ids: &[String],
    ) -> Result<(), SyncError> {
        self.record(format!("mark_read({},{})", chat_id, message_ids.len()));
        Ok(())
    }

    async fn sync_check(
        &self,
        _profile_id: &str,
        chat_id: &str,
        _last_message_id: Option<&str>,
        _last_timestamp: Option<i64>,
        _known_count: usize,
    ) -> Result<SyncCheck, SyncError> {
        self.record(format!("sync_check({})", chat_id));
        Ok(SyncCheck {
            needs_sync: self.needs_sync.load(Ordering::SeqCst),
            server_count: None,
        })
    }
}

pub fn fixture_chat(id: &str, name: &str, unread: u32, last_activity: i64) -> Chat {
    let mut chat = Chat::new(
        id,
        ContactSummary {
            name: name.to_string(),
            number: format!("+000{}", id),
            ..ContactSummary::default()
        },
    );
    chat.unread_count = unread;
    chat.last_activity = last_activity;
    chat
}

pub fn fixture_received(chat_id: &str, server_id: &str, text: &str, timestamp: i64) -> Message {
    Message::received(Some(server_id.to_string()), chat_id, text, timestamp)
}

/// An ascending run of received messages srv-1..=srv-n, one second apart.
pub fn fixture_history(chat_id: &str, count: usize, start_ts: i64) -> Vec<Message> {
    (1..=count)
        .map(|i| {
            fixture_received(
                chat_id,
                &format!("srv-{}", i),
                &format!("message {}", i),
                start_ts + (i as i64) * 1000,
            )
        })
        .collect()
}

pub fn engine_with(
    mock: Arc<MockRestClient>,
    config: SyncConfig,
) -> (SyncCoordinator, mpsc::Receiver<EngineUpdate>) {
    SyncCoordinator::new("profile-1", mock, config)
}

/// Wait for the next SendResult on the boundary channel, skipping other
/// update kinds.
pub async fn wait_for_send_result(
    rx: &mut mpsc::Receiver<EngineUpdate>,
    timeout: Duration,
) -> Option<(String, SendOutcome)> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(EngineUpdate::SendResult {
                placeholder_id,
                outcome,
            })) => return Some((placeholder_id, outcome)),
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}

/// Wait for a SyncWarning on the boundary channel.
pub async fn wait_for_sync_warning(
    rx: &mut mpsc::Receiver<EngineUpdate>,
    timeout: Duration,
) -> Option<(String, waveline::ErrorCategory)> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(EngineUpdate::SyncWarning { chat_id, category })) => {
                return Some((chat_id, category))
            }
            Ok(Some(_)) => continue,
            _ => return None,
        }
    }
}
