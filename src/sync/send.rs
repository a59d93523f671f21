// Optimistic send pipeline.
//
// A send inserts a local placeholder immediately so the message shows up
// with zero perceived latency, then confirms or fails it in the background.
// The placeholder lives through Pending -> Confirmed (replaced in place with
// the server id) or Pending -> Failed (retained so the user can see it and
// retry explicitly). Failed is terminal.

use log::{debug, error, info, warn};

use crate::error::SyncError;
use crate::models::{DeliveryStatus, Direction, Message};
use crate::util::now_ms;

use super::{EngineUpdate, SendOutcome, SyncCoordinator};

impl SyncCoordinator {
    /// Submit a message. Returns the placeholder's local id, which the
    /// matching `SendResult` update will carry.
    pub async fn send(&self, chat_id: &str, text: &str) -> Result<String, SyncError> {
        let placeholder = {
            let mut state = self.state.lock().await;

            // Double-submission guard: an identical send already pending
            // within the window is the same user action delivered twice.
            let window_ms = self.config.send_dedup_window.as_millis() as i64;
            let now = now_ms();
            let already_pending = state.messages.get(chat_id).is_some_and(|list| {
                list.iter().any(|m| {
                    m.direction == Direction::Sent
                        && m.status == DeliveryStatus::Pending
                        && m.text == text
                        && now - m.timestamp < window_ms
                })
            });
            if already_pending {
                info!("rejecting duplicate send to {} within dedup window", chat_id);
                return Err(SyncError::RejectedSend(
                    "identical send already pending".to_string(),
                ));
            }

            let placeholder = Message::placeholder(chat_id, text, now);
            self.apply_message_locked(&mut state, placeholder.clone());
            placeholder
        };

        let this = self.clone();
        let chat = chat_id.to_string();
        let body = text.to_string();
        let placeholder_id = placeholder.local_id.clone();
        tokio::spawn(async move {
            this.confirm_send(&chat, &body, &placeholder_id).await;
        });

        Ok(placeholder.local_id)
    }

    /// Drive the REST confirmation for a placeholder and settle its final
    /// state.
    pub(crate) async fn confirm_send(&self, chat_id: &str, text: &str, placeholder_id: &str) {
        match self.rest.send_message(&self.profile_id, chat_id, text).await {
            Ok(ack) => {
                debug!(
                    "send to {} confirmed, placeholder {} -> server id {}",
                    chat_id, placeholder_id, ack.message_id
                );
                let mut state = self.state.lock().await;
                {
                    let list = state.messages.entry(chat_id.to_string()).or_default();
                    let echo_landed = list.iter().any(|m| {
                        m.server_id.as_deref() == Some(ack.message_id.as_str())
                            && m.local_id != placeholder_id
                    });
                    if echo_landed {
                        // The push echo beat the REST response; the echo
                        // entry is canonical, so the placeholder goes.
                        list.retain(|m| m.local_id != placeholder_id);
                    } else if let Some(slot) =
                        list.iter_mut().find(|m| m.local_id == placeholder_id)
                    {
                        slot.server_id = Some(ack.message_id.clone());
                        if slot.status.can_advance_to(DeliveryStatus::Sent) {
                            slot.status = DeliveryStatus::Sent;
                        }
                        slot.is_optimistic = false;
                    } else {
                        warn!(
                            "placeholder {} vanished before confirmation",
                            placeholder_id
                        );
                    }
                }
                state
                    .pagination
                    .advance_newest(chat_id, ack.message_id.clone());
                let message_key = self.message_cache_key(chat_id);
                state.message_cache.invalidate(&message_key);
                if state.active_chat_id.as_deref() == Some(chat_id) {
                    self.emit_active_messages_locked(&mut state);
                }
                self.emit(EngineUpdate::SendResult {
                    placeholder_id: placeholder_id.to_string(),
                    outcome: SendOutcome::Confirmed {
                        server_id: ack.message_id,
                    },
                });
            }
            Err(e) => {
                let category = e.category();
                error!("send to {} failed: {}", chat_id, e);
                let mut state = self.state.lock().await;
                if let Some(slot) = state
                    .messages
                    .get_mut(chat_id)
                    .and_then(|list| list.iter_mut().find(|m| m.local_id == placeholder_id))
                {
                    // Failed placeholders are kept visible; retry is a new
                    // explicit send, never automatic.
                    slot.status = DeliveryStatus::Failed;
                }
                let message_key = self.message_cache_key(chat_id);
                state.message_cache.invalidate(&message_key);
                if state.active_chat_id.as_deref() == Some(chat_id) {
                    self.emit_active_messages_locked(&mut state);
                }
                self.emit(EngineUpdate::SendResult {
                    placeholder_id: placeholder_id.to_string(),
                    outcome: SendOutcome::Failed { category },
                });
            }
        }
    }
}
