// Sync coordinator module.
//
// This is the entry point for all chat/message state synchronization: it
// owns the canonical chat map and per-chat message lists, merges normalized
// push events, pagination results and reconciliation pulls, and notifies the
// UI boundary through an update channel. Submodules hold the collaborators:
// event normalization, pagination, the optimistic send pipeline, and
// reconciliation.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::Instant;

pub mod events;
pub mod pagination;
pub mod reconcile;
pub mod send;

pub use events::{CanonicalEvent, ContactPatch, EventCoalescer, RawPushEvent};
pub use pagination::{PageState, PaginationManager};

use crate::cache::CacheStore;
use crate::config::SyncConfig;
use crate::error::{ErrorCategory, SyncError};
use crate::identity;
use crate::models::{Chat, ContactSummary, DeliveryStatus, Direction, Message};
use crate::ranking;
use crate::transport::RestClient;

/// Capacity of the boundary update channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Outcome of an optimistic send, reported through `EngineUpdate::SendResult`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed { server_id: String },
    Failed { category: ErrorCategory },
}

/// Boundary events emitted to the UI layer. The UI is a pure consumer; it
/// never mutates canonical state, only invokes coordinator operations.
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    ChatsChanged(Vec<Chat>),
    ActiveChatMessagesChanged {
        chat_id: String,
        messages: Vec<Message>,
    },
    SendResult {
        placeholder_id: String,
        outcome: SendOutcome,
    },
    SyncWarning {
        chat_id: String,
        category: ErrorCategory,
    },
}

/// Immutable view handed to the UI boundary.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub chats: Vec<Chat>,
    pub active_chat_id: Option<String>,
    pub active_messages: Vec<Message>,
}

/// Canonical state, owned exclusively by the coordinator. Everything in here
/// is mutated only under the coordinator's lock, which is what makes handler
/// execution effectively serial.
pub(crate) struct SyncState {
    pub(crate) chats: HashMap<String, Chat>,
    /// Per-chat message lists, oldest-first.
    pub(crate) messages: HashMap<String, Vec<Message>>,
    pub(crate) active_chat_id: Option<String>,
    pub(crate) pagination: PaginationManager,
    pub(crate) chat_cache: CacheStore<Vec<Chat>>,
    pub(crate) message_cache: CacheStore<Vec<Message>>,
    pub(crate) coalescer: EventCoalescer,
    /// Endpoint keys with a request currently in flight. Dropping the
    /// sender wakes callers parked on the request.
    pub(crate) in_flight: HashMap<String, watch::Sender<()>>,
    /// Last issue time per endpoint key, for the minimum-interval throttle.
    pub(crate) last_request_at: HashMap<String, Instant>,
    /// Newest message timestamp already reported read to the backend, per
    /// chat. Survives window resets; read state does not come back.
    pub(crate) read_watermarks: HashMap<String, i64>,
}

/// Outcome of the request gate for one endpoint key.
pub(crate) enum RequestGate {
    /// The caller owns the request and must call `finish_request`.
    Begun,
    /// The same request is already in flight; the receiver resolves when
    /// that request finishes.
    Absorbed(watch::Receiver<()>),
    /// Issued too recently; nothing in flight to wait for.
    Throttled,
}

/// Central state owner and orchestrator, one instance per connected profile.
///
/// Cheap to clone: clones share the same canonical state and REST handle, so
/// background tasks spawned by one handle report into the same engine.
#[derive(Clone)]
pub struct SyncCoordinator {
    pub(crate) profile_id: String,
    pub(crate) state: Arc<TokioMutex<SyncState>>,
    pub(crate) rest: Arc<dyn RestClient>,
    pub(crate) update_tx: mpsc::Sender<EngineUpdate>,
    pub(crate) config: SyncConfig,
}

impl SyncCoordinator {
    pub fn new(
        profile_id: impl Into<String>,
        rest: Arc<dyn RestClient>,
        config: SyncConfig,
    ) -> (Self, mpsc::Receiver<EngineUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let state = SyncState {
            chats: HashMap::new(),
            messages: HashMap::new(),
            active_chat_id: None,
            pagination: PaginationManager::new(config.page_size),
            chat_cache: CacheStore::new(),
            message_cache: CacheStore::new(),
            coalescer: EventCoalescer::new(config.coalesce_window),
            in_flight: HashMap::new(),
            last_request_at: HashMap::new(),
            read_watermarks: HashMap::new(),
        };
        (
            SyncCoordinator {
                profile_id: profile_id.into(),
                state: Arc::new(TokioMutex::new(state)),
                rest,
                update_tx,
                config,
            },
            update_rx,
        )
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Initial hydrate: pull the full chat list for the profile, merge it
    /// into the canonical map and publish the first ranked snapshot.
    pub async fn hydrate(&self) -> Result<(), SyncError> {
        let mut page = 0;
        let mut pulled: Vec<Chat> = Vec::new();
        loop {
            let chat_page = self
                .rest
                .list_chats(&self.profile_id, page, self.config.page_size)
                .await?;
            let fetched = chat_page.chats.len();
            pulled.extend(chat_page.chats);
            if fetched < self.config.page_size || pulled.len() >= chat_page.total {
                break;
            }
            page += 1;
        }
        info!(
            "hydrated {} chats for profile {}",
            pulled.len(),
            self.profile_id
        );

        let mut state = self.state.lock().await;
        for chat in pulled {
            match state.chats.get_mut(&chat.id) {
                // Pulls are corrective, never authoritative: merge into what
                // push events may already have built up.
                Some(existing) => {
                    existing.contact = chat.contact;
                    existing.pinned = chat.pinned;
                    existing.archived = chat.archived;
                    existing.last_activity = existing.last_activity.max(chat.last_activity);
                    existing.unread_count = existing.unread_count.max(chat.unread_count);
                }
                None => {
                    state.chats.insert(chat.id.clone(), chat);
                }
            }
        }
        state.chat_cache.invalidate(&self.chat_cache_key());
        self.emit_chats_locked(&mut state);
        Ok(())
    }

    /// Push-channel intake. Message events are normalized and applied
    /// synchronously in the same tick; all other kinds pass through the
    /// per-kind coalescer first.
    pub async fn handle_raw_event(&self, raw: RawPushEvent) {
        let Some(event) = events::normalize(&raw) else {
            return;
        };
        match event {
            CanonicalEvent::Message(message) => {
                let mut state = self.state.lock().await;
                if Self::is_pure_redelivery(&state, &message) {
                    debug!(
                        "dropping duplicate message event for chat {}",
                        message.chat_id
                    );
                    return;
                }
                self.apply_message_locked(&mut state, message);
            }
            other => {
                let schedule = {
                    let mut state = self.state.lock().await;
                    state.coalescer.push(other, Instant::now())
                };
                if schedule {
                    let this = self.clone();
                    let window = self.config.coalesce_window;
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        this.flush_coalesced().await;
                    });
                }
            }
        }
    }

    /// A redelivery that adds nothing is dropped at the door. The one
    /// duplicate-by-identity that must still be applied is the server echo
    /// confirming an optimistic placeholder.
    fn is_pure_redelivery(state: &SyncState, message: &Message) -> bool {
        let Some(list) = state.messages.get(&message.chat_id) else {
            return false;
        };
        match identity::find_match(message, list) {
            Some(index) => !(list[index].server_id.is_none() && message.server_id.is_some()),
            None => false,
        }
    }

    /// Apply a canonical event to the engine state.
    pub async fn apply_event(&self, event: CanonicalEvent) {
        match event {
            CanonicalEvent::SyncUpdate { chat_ids, immediate } => {
                if immediate {
                    // Already applied upstream; nothing to pull.
                    debug!("sync_update marked immediate, skipping pull");
                    return;
                }
                let this = self.clone();
                tokio::spawn(async move {
                    // Scoped reconciliation pulls; failures surface per chat.
                    let pulls = chat_ids.iter().map(|id| this.reconcile(id));
                    let _ = futures::future::join_all(pulls).await;
                });
            }
            other => {
                let mut state = self.state.lock().await;
                self.apply_event_locked(&mut state, other);
            }
        }
    }

    pub(crate) fn apply_event_locked(&self, state: &mut SyncState, event: CanonicalEvent) {
        match event {
            CanonicalEvent::Message(message) => self.apply_message_locked(state, message),
            CanonicalEvent::Status { message_id, status } => {
                self.apply_status_locked(state, &message_id, status)
            }
            CanonicalEvent::Typing { chat_id, typing } => {
                let changed = {
                    let chat = Self::chat_entry(state, &chat_id);
                    let changed = chat.typing != typing;
                    chat.typing = typing;
                    changed
                };
                if changed {
                    state.chat_cache.invalidate(&self.chat_cache_key());
                    self.emit_chats_locked(state);
                }
            }
            CanonicalEvent::ChatUpdate { chat_id, patch } => {
                {
                    let chat = Self::chat_entry(state, &chat_id);
                    if let Some(name) = patch.name {
                        chat.contact.name = name;
                    }
                    if let Some(number) = patch.number {
                        chat.contact.number = number;
                    }
                    if let Some(is_group) = patch.is_group {
                        chat.contact.is_group = is_group;
                    }
                    if let Some(is_online) = patch.is_online {
                        chat.contact.is_online = is_online;
                    }
                }
                state.chat_cache.invalidate(&self.chat_cache_key());
                self.emit_chats_locked(state);
            }
            CanonicalEvent::SyncUpdate { .. } => {
                // Handled by apply_event; reaching here means a caller
                // bypassed it, which is harmless but worth noting.
                warn!("sync_update reached the locked apply path, ignoring");
            }
        }
    }

    /// Insert-or-replace a message by canonical identity, with all the chat
    /// bookkeeping that hangs off it: unread count, activity bump, cache
    /// invalidation, re-rank, boundary notifications.
    pub(crate) fn apply_message_locked(&self, state: &mut SyncState, message: Message) {
        let chat_id = message.chat_id.clone();
        let is_active = state.active_chat_id.as_deref() == Some(chat_id.as_str());

        let mut bump_unread = false;
        {
            let list = state.messages.entry(chat_id.clone()).or_default();
            match identity::find_match(&message, list) {
                Some(index) => {
                    // In-place replacement: the entry keeps its local id so
                    // the UI row stays stable, and a server id, once
                    // assigned, is never dropped.
                    let slot = &mut list[index];
                    let kept_local_id = slot.local_id.clone();
                    let kept_server_id = slot.server_id.clone();
                    let previous_status = slot.status;

                    *slot = message.clone();
                    slot.local_id = kept_local_id;
                    if slot.server_id.is_none() {
                        slot.server_id = kept_server_id;
                    }
                    if !previous_status.can_advance_to(slot.status) {
                        slot.status = previous_status;
                    }
                    slot.is_optimistic = false;
                    debug!("replaced message in chat {} by identity", chat_id);
                }
                None => {
                    // Push delivery order is authoritative for live messages.
                    list.push(message.clone());
                    bump_unread = message.direction == Direction::Received && !is_active;
                }
            }
        }
        if bump_unread {
            Self::chat_entry(state, &chat_id).unread_count += 1;
        }

        if let Some(server_id) = &message.server_id {
            state.pagination.advance_newest(&chat_id, server_id.clone());
        }

        let chat = Self::chat_entry(state, &chat_id);
        chat.last_activity = chat.last_activity.max(message.timestamp);
        if message.direction == Direction::Received {
            // A delivered message ends any typing indicator.
            chat.typing = false;
        }

        let message_key = self.message_cache_key(&chat_id);
        state.message_cache.invalidate(&message_key);
        state.chat_cache.invalidate(&self.chat_cache_key());

        self.emit_chats_locked(state);
        if is_active {
            self.emit_active_messages_locked(state);
        }
    }

    fn apply_status_locked(&self, state: &mut SyncState, message_id: &str, status: DeliveryStatus) {
        let mut touched_chat: Option<String> = None;
        for (chat_id, list) in state.messages.iter_mut() {
            if let Some(slot) = list
                .iter_mut()
                .find(|m| m.server_id.as_deref() == Some(message_id))
            {
                if slot.status.can_advance_to(status) {
                    info!(
                        "message {} status {:?} -> {:?}",
                        message_id, slot.status, status
                    );
                    slot.status = status;
                    touched_chat = Some(chat_id.clone());
                } else {
                    debug!(
                        "ignoring status regression {:?} -> {:?} for {}",
                        slot.status, status, message_id
                    );
                }
                break;
            }
        }
        if let Some(chat_id) = touched_chat {
            let message_key = self.message_cache_key(&chat_id);
            state.message_cache.invalidate(&message_key);
            if state.active_chat_id.as_deref() == Some(chat_id.as_str()) {
                self.emit_active_messages_locked(state);
            }
        }
    }

    /// Open a chat: it becomes the active chat, the previously active chat's
    /// window is cleared (the only operation allowed to reset one), the
    /// initial page is loaded, and the backend is probed for staleness.
    pub async fn select_chat(&self, chat_id: &str) -> Result<(), SyncError> {
        {
            let mut state = self.state.lock().await;
            let previous = state.active_chat_id.replace(chat_id.to_string());
            match previous {
                Some(prev) if prev != chat_id => {
                    state.pagination.reset(&prev);
                    state.messages.remove(&prev);
                    let prev_key = self.message_cache_key(&prev);
                    state.message_cache.invalidate(&prev_key);
                    debug!("cleared window for {} on switch to {}", prev, chat_id);
                }
                _ => {}
            }
        }

        self.load_initial(chat_id).await?;

        let this = self.clone();
        let chat = chat_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.mark_read(&chat).await {
                warn!("mark_read for {} failed: {}", chat, e);
            }
            this.sync_check_and_reconcile(&chat).await;
        });
        Ok(())
    }

    /// Load the first page of a chat's history. A no-op when a window
    /// already exists or a load is in flight.
    pub async fn load_initial(&self, chat_id: &str) -> Result<(), SyncError> {
        let request_key = self.request_key("messages", chat_id);
        {
            let mut state = self.state.lock().await;
            if !state.pagination.begin_initial(chat_id) {
                return Ok(());
            }
            match Self::try_begin_request(&mut state, &request_key, self.config.min_request_interval)
            {
                RequestGate::Begun => {}
                RequestGate::Absorbed(mut done) => {
                    state.pagination.fail(chat_id);
                    drop(state);
                    let _ = done.changed().await;
                    return Ok(());
                }
                RequestGate::Throttled => {
                    state.pagination.fail(chat_id);
                    return Ok(());
                }
            }
        }

        let result = self
            .rest
            .list_messages(&self.profile_id, chat_id, None, self.config.page_size)
            .await;

        let mut state = self.state.lock().await;
        Self::finish_request(&mut state, &request_key);
        match result {
            Ok(page) => {
                self.merge_page_locked(&mut state, chat_id, &page.messages, true);
                Ok(())
            }
            Err(e) => {
                state.pagination.fail(chat_id);
                warn!("initial load for {} failed: {}", chat_id, e);
                Err(e)
            }
        }
    }

    /// Extend a chat's window backwards by one page. No-op while a load is
    /// in flight or once the history is exhausted.
    pub async fn load_older(&self, chat_id: &str) -> Result<bool, SyncError> {
        let before = {
            let mut state = self.state.lock().await;
            match state.pagination.begin_older(chat_id) {
                Some(before) => before,
                None => return Ok(false),
            }
        };

        let result = self
            .rest
            .list_messages(
                &self.profile_id,
                chat_id,
                before.as_deref(),
                self.config.page_size,
            )
            .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(page) => {
                self.merge_page_locked(&mut state, chat_id, &page.messages, false);
                Ok(true)
            }
            Err(e) => {
                state.pagination.fail(chat_id);
                warn!("load_older for {} failed: {}", chat_id, e);
                Err(e)
            }
        }
    }

    /// Merge a fetched page (tagged by the chat it was requested for, not by
    /// whatever chat is active now) and refresh pagination bookkeeping.
    fn merge_page_locked(
        &self,
        state: &mut SyncState,
        chat_id: &str,
        fetched: &[Message],
        record_newest: bool,
    ) {
        let list = state.messages.entry(chat_id.to_string()).or_default();
        let added = pagination::prepend_unseen(list, fetched);
        debug!(
            "merged page for {}: {} fetched, {} new",
            chat_id,
            fetched.len(),
            added
        );

        let oldest = fetched.first().and_then(|m| m.server_id.clone());
        let newest = if record_newest {
            fetched.last().and_then(|m| m.server_id.clone())
        } else {
            None
        };
        state
            .pagination
            .complete(chat_id, fetched.len(), oldest, newest);

        let last_timestamp = state
            .messages
            .get(chat_id)
            .and_then(|l| l.last())
            .map(|m| m.timestamp);
        if let Some(ts) = last_timestamp {
            let chat = Self::chat_entry(state, chat_id);
            chat.last_activity = chat.last_activity.max(ts);
        }

        self.write_message_cache_locked(state, chat_id);
        state.chat_cache.invalidate(&self.chat_cache_key());
        self.emit_chats_locked(state);
        if state.active_chat_id.as_deref() == Some(chat_id) {
            self.emit_active_messages_locked(state);
        }
    }

    /// Clear a chat's unread counter and report newly read messages to the
    /// backend. A per-chat timestamp watermark keeps repeat selections from
    /// resending ids the backend has already acknowledged.
    pub async fn mark_read(&self, chat_id: &str) -> Result<(), SyncError> {
        let (message_ids, newest_ts) = {
            let mut state = self.state.lock().await;
            if let Some(chat) = state.chats.get_mut(chat_id) {
                if chat.unread_count != 0 {
                    chat.unread_count = 0;
                    state.chat_cache.invalidate(&self.chat_cache_key());
                    self.emit_chats_locked(&mut state);
                }
            }
            let watermark = state
                .read_watermarks
                .get(chat_id)
                .copied()
                .unwrap_or(i64::MIN);
            let mut newest_ts = watermark;
            let message_ids: Vec<String> = state
                .messages
                .get(chat_id)
                .map(|list| {
                    list.iter()
                        .filter(|m| {
                            m.direction == Direction::Received && m.timestamp > watermark
                        })
                        .filter_map(|m| {
                            let id = m.server_id.clone()?;
                            newest_ts = newest_ts.max(m.timestamp);
                            Some(id)
                        })
                        .collect()
                })
                .unwrap_or_default();
            (message_ids, newest_ts)
        };
        if message_ids.is_empty() {
            return Ok(());
        }
        self.rest
            .mark_read(&self.profile_id, chat_id, &message_ids)
            .await?;

        // Advance the watermark only once the backend accepted the report.
        let mut state = self.state.lock().await;
        let entry = state
            .read_watermarks
            .entry(chat_id.to_string())
            .or_insert(i64::MIN);
        *entry = (*entry).max(newest_ts);
        Ok(())
    }

    /// Probe the backend's sync-check endpoint and force a reconcile when it
    /// reports the local view stale.
    pub(crate) async fn sync_check_and_reconcile(&self, chat_id: &str) {
        let (last_id, last_timestamp, known_count) = {
            let state = self.state.lock().await;
            let list = state.messages.get(chat_id);
            let last_confirmed =
                list.and_then(|l| l.iter().rev().find(|m| m.server_id.is_some()));
            (
                last_confirmed.and_then(|m| m.server_id.clone()),
                last_confirmed.map(|m| m.timestamp),
                list.map_or(0, |l| l.len()),
            )
        };

        match self
            .rest
            .sync_check(
                &self.profile_id,
                chat_id,
                last_id.as_deref(),
                last_timestamp,
                known_count,
            )
            .await
        {
            Ok(check) if check.needs_sync => {
                info!("sync-check flagged {} as stale, reconciling", chat_id);
                let _ = self.reconcile(chat_id).await;
            }
            Ok(_) => debug!("sync-check: {} is current", chat_id),
            Err(e) => warn!("sync-check for {} failed: {}", chat_id, e),
        }
    }

    /// Immutable view for rendering. The ranked chat list is served from
    /// cache within its TTL; the active chat bypasses TTL entirely and gets
    /// a bounded-rate fresh pull kicked off in the background.
    pub async fn snapshot(&self) -> EngineSnapshot {
        let (chats, active_chat_id, active_messages) = {
            let mut state = self.state.lock().await;
            let chats = self.ranked_chats_locked(&mut state);
            let active_chat_id = state.active_chat_id.clone();
            let active_messages = active_chat_id
                .as_ref()
                .and_then(|id| state.messages.get(id).cloned())
                .unwrap_or_default();
            (chats, active_chat_id, active_messages)
        };

        if let Some(chat_id) = active_chat_id.clone() {
            let this = self.clone();
            tokio::spawn(async move {
                this.refresh_active(&chat_id).await;
            });
        }

        EngineSnapshot {
            chats,
            active_chat_id,
            active_messages,
        }
    }

    /// Read one chat's message window. The active chat is always served
    /// fresh from canonical state; background chats go through the TTL
    /// cache.
    pub async fn chat_messages(&self, chat_id: &str) -> Vec<Message> {
        let mut state = self.state.lock().await;
        if state.active_chat_id.as_deref() == Some(chat_id) {
            return state.messages.get(chat_id).cloned().unwrap_or_default();
        }
        let key = self.message_cache_key(chat_id);
        if let Some(cached) = state.message_cache.get(&key) {
            return cached;
        }
        let messages = state.messages.get(chat_id).cloned().unwrap_or_default();
        state
            .message_cache
            .set(key, messages.clone(), self.config.background_ttl);
        messages
    }

    /// Ranked chat list, cached under the background TTL and recomputed in
    /// full whenever a mutation invalidated it.
    pub(crate) fn ranked_chats_locked(&self, state: &mut SyncState) -> Vec<Chat> {
        let key = self.chat_cache_key();
        if let Some(cached) = state.chat_cache.get(&key) {
            return cached;
        }
        let ranked = ranking::rank(state.chats.values().cloned().collect());
        state
            .chat_cache
            .set(key, ranked.clone(), self.config.background_ttl);
        ranked
    }

    /// Write the chat's message list through to the cache, with the TTL
    /// class picked by whether the chat is active.
    pub(crate) fn write_message_cache_locked(&self, state: &mut SyncState, chat_id: &str) {
        let ttl = if state.active_chat_id.as_deref() == Some(chat_id) {
            self.config.active_chat_ttl
        } else {
            self.config.background_ttl
        };
        if let Some(list) = state.messages.get(chat_id) {
            let key = self.message_cache_key(chat_id);
            state.message_cache.set(key, list.clone(), ttl);
        }
    }

    pub(crate) async fn flush_coalesced(&self) {
        let due = {
            let mut state = self.state.lock().await;
            state.coalescer.drain_due(Instant::now())
        };
        for event in due {
            self.apply_event(event).await;
        }
    }

    fn chat_entry<'a>(state: &'a mut SyncState, chat_id: &str) -> &'a mut Chat {
        state.chats.entry(chat_id.to_string()).or_insert_with(|| {
            // First observation of this chat; the contact summary fills in
            // when a pull or chat_update delivers it.
            Chat::new(
                chat_id,
                ContactSummary {
                    name: chat_id.to_string(),
                    ..ContactSummary::default()
                },
            )
        })
    }

    pub(crate) fn chat_cache_key(&self) -> String {
        format!("chats:{}", self.profile_id)
    }

    pub(crate) fn message_cache_key(&self, chat_id: &str) -> String {
        format!("msgs:{}:{}", self.profile_id, chat_id)
    }

    pub(crate) fn request_key(&self, operation: &str, chat_id: &str) -> String {
        format!("{}:{}:{}", operation, self.profile_id, chat_id)
    }

    /// Gate a network request: a caller whose endpoint key is already in
    /// flight is absorbed by that request and parks on it; one issued within
    /// the minimum interval is throttled outright.
    pub(crate) fn try_begin_request(
        state: &mut SyncState,
        key: &str,
        min_interval: std::time::Duration,
    ) -> RequestGate {
        let now = Instant::now();
        if let Some(active) = state.in_flight.get(key) {
            debug!("request {} already in flight, absorbing caller", key);
            return RequestGate::Absorbed(active.subscribe());
        }
        if let Some(last) = state.last_request_at.get(key) {
            if now.duration_since(*last) < min_interval {
                debug!("request {} throttled", key);
                return RequestGate::Throttled;
            }
        }
        let (done, _) = watch::channel(());
        state.in_flight.insert(key.to_string(), done);
        state.last_request_at.insert(key.to_string(), now);
        RequestGate::Begun
    }

    /// Mark a request finished. Dropping the sender resolves every caller
    /// absorbed by it.
    pub(crate) fn finish_request(state: &mut SyncState, key: &str) {
        state.in_flight.remove(key);
    }

    pub(crate) fn emit_chats_locked(&self, state: &mut SyncState) {
        let ranked = self.ranked_chats_locked(state);
        self.emit(EngineUpdate::ChatsChanged(ranked));
    }

    pub(crate) fn emit_active_messages_locked(&self, state: &mut SyncState) {
        if let Some(chat_id) = state.active_chat_id.clone() {
            let messages = state.messages.get(&chat_id).cloned().unwrap_or_default();
            self.emit(EngineUpdate::ActiveChatMessagesChanged { chat_id, messages });
        }
    }

    /// Non-blocking boundary emission; dropping an update under backpressure
    /// is preferable to stalling an event handler.
    pub(crate) fn emit(&self, update: EngineUpdate) {
        if let Err(e) = self.update_tx.try_send(update) {
            error!("failed to deliver UI update: {}", e);
        }
    }
}
