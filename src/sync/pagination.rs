// Per-chat pagination over message history.
//
// Each chat carries a bidirectional window cursor: older pages are pulled on
// demand, newer messages arrive through the push channel and are merged by
// the coordinator. Windows only grow; switching away from a chat is the one
// operation that resets its cursor.

use std::collections::HashMap;

use log::debug;

use crate::identity;
use crate::models::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Nothing loaded yet.
    Empty,
    /// Initial page in flight.
    Loading,
    /// At least one page held.
    Loaded { has_more_older: bool },
    /// An older page in flight on top of a loaded window.
    LoadingMore,
    /// The backend returned a short page; there is nothing older. Terminal
    /// until the cursor is reset.
    Exhausted,
}

#[derive(Debug, Clone)]
struct PaginationCursor {
    state: PageState,
    /// Server id of the oldest loaded message, the `before` token for the
    /// next older page.
    oldest_server_id: Option<String>,
    /// Server id of the newest loaded message, used for sync-check probes.
    newest_server_id: Option<String>,
}

impl PaginationCursor {
    fn new() -> Self {
        PaginationCursor {
            state: PageState::Empty,
            oldest_server_id: None,
            newest_server_id: None,
        }
    }
}

pub struct PaginationManager {
    page_size: usize,
    cursors: HashMap<String, PaginationCursor>,
}

impl PaginationManager {
    pub fn new(page_size: usize) -> Self {
        PaginationManager {
            page_size: page_size.max(1),
            cursors: HashMap::new(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn state(&self, chat_id: &str) -> PageState {
        self.cursors
            .get(chat_id)
            .map(|c| c.state)
            .unwrap_or(PageState::Empty)
    }

    pub fn newest_server_id(&self, chat_id: &str) -> Option<String> {
        self.cursors
            .get(chat_id)
            .and_then(|c| c.newest_server_id.clone())
    }

    /// Start the initial load for a chat. Returns false when a load is
    /// already in flight or a window already exists, making duplicate calls
    /// no-ops.
    pub fn begin_initial(&mut self, chat_id: &str) -> bool {
        let cursor = self
            .cursors
            .entry(chat_id.to_string())
            .or_insert_with(PaginationCursor::new);
        match cursor.state {
            PageState::Empty => {
                cursor.state = PageState::Loading;
                true
            }
            _ => {
                debug!(
                    "ignoring initial load for {} in state {:?}",
                    chat_id, cursor.state
                );
                false
            }
        }
    }

    /// Start an older-page load. Returns the `before` cursor to fetch with,
    /// or `None` when the request must be a no-op: a load is in flight, the
    /// history is exhausted, or no window exists yet.
    pub fn begin_older(&mut self, chat_id: &str) -> Option<Option<String>> {
        let cursor = self.cursors.get_mut(chat_id)?;
        match cursor.state {
            PageState::Loaded {
                has_more_older: true,
            } => {
                cursor.state = PageState::LoadingMore;
                Some(cursor.oldest_server_id.clone())
            }
            other => {
                debug!("ignoring load_older for {} in state {:?}", chat_id, other);
                None
            }
        }
    }

    /// Record a successful fetch. A page shorter than `page_size` means the
    /// backend has nothing older, which is terminal until a reset.
    pub fn complete(
        &mut self,
        chat_id: &str,
        fetched: usize,
        oldest_server_id: Option<String>,
        newest_server_id: Option<String>,
    ) {
        let cursor = self
            .cursors
            .entry(chat_id.to_string())
            .or_insert_with(PaginationCursor::new);

        if oldest_server_id.is_some() {
            cursor.oldest_server_id = oldest_server_id;
        }
        if newest_server_id.is_some() && cursor.newest_server_id.is_none() {
            cursor.newest_server_id = newest_server_id;
        }

        cursor.state = if fetched < self.page_size {
            PageState::Exhausted
        } else {
            PageState::Loaded {
                has_more_older: true,
            }
        };
    }

    /// Record the newest loaded server id, advanced by push merges.
    pub fn advance_newest(&mut self, chat_id: &str, newest_server_id: String) {
        if let Some(cursor) = self.cursors.get_mut(chat_id) {
            cursor.newest_server_id = Some(newest_server_id);
        }
    }

    /// Roll back an in-flight marker after a failed fetch so a retry can
    /// start cleanly. The window itself is untouched.
    pub fn fail(&mut self, chat_id: &str) {
        if let Some(cursor) = self.cursors.get_mut(chat_id) {
            cursor.state = match cursor.state {
                PageState::Loading => PageState::Empty,
                PageState::LoadingMore => PageState::Loaded {
                    has_more_older: true,
                },
                other => other,
            };
        }
    }

    /// A reconcile pull revealed more server-side history than the window
    /// holds; reopen the older edge even if it looked exhausted.
    pub fn note_more_older(&mut self, chat_id: &str) {
        if let Some(cursor) = self.cursors.get_mut(chat_id) {
            match cursor.state {
                PageState::Exhausted | PageState::Loaded { .. } => {
                    cursor.state = PageState::Loaded {
                        has_more_older: true,
                    };
                }
                _ => {}
            }
        }
    }

    /// Drop the cursor entirely. Only called when the chat is switched away.
    pub fn reset(&mut self, chat_id: &str) {
        self.cursors.remove(chat_id);
    }
}

/// Merge a fetched page into a chat's message list by strictly prepending
/// previously-unseen entries. Already-displayed messages are never
/// overwritten or reordered. Returns how many messages were added.
pub fn prepend_unseen(existing: &mut Vec<Message>, fetched: &[Message]) -> usize {
    let mut block: Vec<Message> = Vec::new();
    for message in fetched {
        if !identity::is_duplicate(message, existing) && !identity::is_duplicate(message, &block) {
            block.push(message.clone());
        }
    }
    let added = block.len();
    existing.splice(0..0, block);
    added
}
