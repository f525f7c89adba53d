use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Recently confirmed transfer ids, used to suppress re-sending content the
/// receiver already saved.
#[derive(Debug, Clone)]
pub struct DedupLedger {
    window: Duration,
    entries: HashMap<String, Instant>,
}

impl DedupLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether `id` was confirmed within the window. Expired entries are
    /// evicted first.
    pub fn suppresses(&mut self, id: &str, now: Instant) -> bool {
        self.prune(now);
        self.entries.contains_key(id)
    }

    /// Record a confirmed save.
    pub fn record(&mut self, id: impl Into<String>, now: Instant) {
        self.prune(now);
        self.entries.insert(id.into(), now);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_expire_after_window() {
        let start = Instant::now();
        let mut ledger = DedupLedger::new(Duration::from_secs(60));
        ledger.record("a", start);
        assert!(ledger.suppresses("a", start + Duration::from_secs(59)));
        assert!(!ledger.suppresses("a", start + Duration::from_secs(60)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn record_prunes_old_entries() {
        let start = Instant::now();
        let mut ledger = DedupLedger::new(Duration::from_secs(10));
        ledger.record("old", start);
        ledger.record("new", start + Duration::from_secs(11));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains("new"));
    }
}
