use std::time::Duration;

/// Tunable windows and budgets for the sync engine.
///
/// Defaults match production behavior; tests shrink the windows through the
/// builder-style setters.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages fetched per pagination page.
    pub page_size: usize,
    /// Cache TTL for the currently active chat's message reads. Sub-second
    /// so the open conversation always feels live.
    pub active_chat_ttl: Duration,
    /// Cache TTL for background chat lists and inactive chats.
    pub background_ttl: Duration,
    /// Debounce window for non-message push events, keyed by event kind.
    /// Message events are never debounced.
    pub coalesce_window: Duration,
    /// Minimum interval between requests for the same endpoint key.
    pub min_request_interval: Duration,
    /// A reconcile pull that has not resolved within this window counts as
    /// a failure for retry purposes.
    pub reconcile_timeout: Duration,
    /// Base delay of the reconcile retry backoff.
    pub retry_base: Duration,
    /// Cap on the reconcile retry backoff.
    pub retry_cap: Duration,
    /// Reconcile attempts before surfacing a sync warning.
    pub retry_attempts: u32,
    /// Window in which a second send of identical text to the same chat is
    /// rejected as a double-submission.
    pub send_dedup_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            page_size: 50,
            active_chat_ttl: Duration::from_millis(500),
            background_ttl: Duration::from_secs(30),
            coalesce_window: Duration::from_millis(10),
            min_request_interval: Duration::from_millis(50),
            reconcile_timeout: Duration::from_secs(15),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(5),
            retry_attempts: 3,
            send_dedup_window: Duration::from_secs(1),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_active_chat_ttl(mut self, ttl: Duration) -> Self {
        self.active_chat_ttl = ttl;
        self
    }

    pub fn with_background_ttl(mut self, ttl: Duration) -> Self {
        self.background_ttl = ttl;
        self
    }

    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, base: Duration, cap: Duration, attempts: u32) -> Self {
        self.retry_base = base;
        self.retry_cap = cap;
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn with_send_dedup_window(mut self, window: Duration) -> Self {
        self.send_dedup_window = window;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_budgets() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 50);
        assert!(config.active_chat_ttl < Duration::from_secs(1));
        assert_eq!(config.retry_base, Duration::from_secs(1));
        assert_eq!(config.retry_cap, Duration::from_secs(5));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.send_dedup_window, Duration::from_secs(1));
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let config = SyncConfig::new()
            .with_page_size(0)
            .with_retry(Duration::from_millis(10), Duration::from_millis(50), 0);
        assert_eq!(config.page_size, 1);
        assert_eq!(config.retry_attempts, 1);
    }
}
