// Pull-based reconciliation.
//
// Reconciliation repairs missed or reordered push events with a corrective
// pull: results are merged additively by canonical identity and never remove
// or reorder what is already applied. A pull that keeps failing is retried
// with capped exponential backoff and then surfaced as a non-fatal per-chat
// warning; known state survives every failure mode.

use std::time::Duration;

use log::{debug, info, warn};

use crate::error::SyncError;
use crate::identity;
use crate::models::Direction;
use crate::transport::MessagePage;

use super::{EngineUpdate, RequestGate, SyncCoordinator, SyncState};

impl SyncCoordinator {
    /// Reconcile one chat against the backend. Concurrent calls for the
    /// same chat are absorbed by the in-flight pull and resolve once that
    /// pull has merged.
    pub async fn reconcile(&self, chat_id: &str) -> Result<(), SyncError> {
        let request_key = self.request_key("reconcile", chat_id);
        {
            let mut state = self.state.lock().await;
            match Self::try_begin_request(&mut state, &request_key, self.config.min_request_interval)
            {
                RequestGate::Begun => {}
                RequestGate::Absorbed(mut done) => {
                    drop(state);
                    let _ = done.changed().await;
                    return Ok(());
                }
                RequestGate::Throttled => return Ok(()),
            }
        }

        let result = self.pull_with_retry(chat_id).await;

        let mut state = self.state.lock().await;
        Self::finish_request(&mut state, &request_key);
        match result {
            Ok(page) => {
                self.merge_corrective_locked(&mut state, chat_id, &page);
                Ok(())
            }
            Err(e) => {
                let category = e.category();
                warn!("reconcile for {} gave up: {}", chat_id, e);
                if let Some(chat) = state.chats.get_mut(chat_id) {
                    chat.warning = Some(category);
                }
                state.chat_cache.invalidate(&self.chat_cache_key());
                self.emit(EngineUpdate::SyncWarning {
                    chat_id: chat_id.to_string(),
                    category,
                });
                self.emit_chats_locked(&mut state);
                Err(e)
            }
        }
    }

    /// One bounded-time pull attempt per retry slot, with jittered capped
    /// exponential backoff between transient failures. Non-transient
    /// failures (disconnected, not-found) are surfaced immediately.
    async fn pull_with_retry(&self, chat_id: &str) -> Result<MessagePage, SyncError> {
        let mut attempt = 1;
        loop {
            let pull = self
                .rest
                .list_messages(&self.profile_id, chat_id, None, self.config.page_size);
            let result = match tokio::time::timeout(self.config.reconcile_timeout, pull).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(format!("reconcile pull for {}", chat_id))),
            };

            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.config.retry_attempts => {
                    let delay =
                        Self::backoff_delay(self.config.retry_base, self.config.retry_cap, attempt);
                    warn!(
                        "reconcile pull for {} failed (attempt {}/{}): {}; retrying in {:?}",
                        chat_id, attempt, self.config.retry_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
        let exponential = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exponential.min(cap);
        // Jitter to keep a burst of failing chats from retrying in step.
        let jitter = Duration::from_millis(rand::random::<u64>() % 250);
        capped + jitter
    }

    /// Merge a reconcile pull into the chat. Additive and corrective only:
    /// entries the pull does not mention stay untouched, matched entries may
    /// gain a server id or a forward status, and unseen entries are inserted
    /// by timestamp without moving anything already applied.
    pub(crate) fn merge_corrective_locked(
        &self,
        state: &mut SyncState,
        chat_id: &str,
        page: &MessagePage,
    ) {
        let is_active = state.active_chat_id.as_deref() == Some(chat_id);
        let mut added_received = 0u32;
        let mut changed = false;

        {
            let list = state.messages.entry(chat_id.to_string()).or_default();
            for message in &page.messages {
                match identity::find_match(message, list) {
                    Some(index) => {
                        let slot = &mut list[index];
                        if slot.server_id.is_none() && message.server_id.is_some() {
                            slot.server_id = message.server_id.clone();
                            slot.is_optimistic = false;
                            changed = true;
                        }
                        if slot.status.can_advance_to(message.status) {
                            slot.status = message.status;
                            changed = true;
                        }
                    }
                    None => {
                        let position = list
                            .iter()
                            .position(|m| m.timestamp > message.timestamp)
                            .unwrap_or(list.len());
                        list.insert(position, message.clone());
                        if message.direction == Direction::Received {
                            added_received += 1;
                        }
                        changed = true;
                    }
                }
            }
        }

        let local_total = state.messages.get(chat_id).map_or(0, |l| l.len());
        debug!(
            "reconcile merged {} pulled messages into {} ({} held locally)",
            page.messages.len(),
            chat_id,
            local_total
        );

        // A backend count beyond our window means older history we have not
        // paged in yet; reopen the older edge.
        if let Some(server_total) = page.total {
            if server_total > local_total {
                info!(
                    "{} holds {} locally but backend reports {}, reopening older edge",
                    chat_id, local_total, server_total
                );
                state.pagination.note_more_older(chat_id);
            }
        }

        let last_timestamp = state
            .messages
            .get(chat_id)
            .and_then(|l| l.last())
            .map(|m| m.timestamp);
        {
            let chat = state.chats.get_mut(chat_id);
            if let Some(chat) = chat {
                if let Some(ts) = last_timestamp {
                    chat.last_activity = chat.last_activity.max(ts);
                }
                if !is_active && added_received > 0 {
                    chat.unread_count += added_received;
                }
                // A successful pull clears any earlier sync warning.
                chat.warning = None;
            }
        }

        if changed {
            self.write_message_cache_locked(state, chat_id);
            state.chat_cache.invalidate(&self.chat_cache_key());
            self.emit_chats_locked(state);
            if is_active {
                self.emit_active_messages_locked(state);
            }
        }
    }

    /// Opportunistic single-shot refresh of the active chat, issued by
    /// snapshot reads. Bounded by the per-endpoint minimum interval; any
    /// failure is silent because reconciliation covers the repair path.
    pub(crate) async fn refresh_active(&self, chat_id: &str) {
        let request_key = self.request_key("refresh", chat_id);
        {
            let mut state = self.state.lock().await;
            // Opportunistic: nothing waits on a refresh, so an absorbed or
            // throttled caller just drops out.
            match Self::try_begin_request(&mut state, &request_key, self.config.min_request_interval)
            {
                RequestGate::Begun => {}
                _ => return,
            }
        }

        let result = self
            .rest
            .list_messages(&self.profile_id, chat_id, None, self.config.page_size)
            .await;

        let mut state = self.state.lock().await;
        Self::finish_request(&mut state, &request_key);
        match result {
            Ok(page) => self.merge_corrective_locked(&mut state, chat_id, &page),
            Err(e) => debug!("active-chat refresh for {} failed: {}", chat_id, e),
        }
    }
}
