//! Connect-time and per-stream policy decisions.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use parking_lot::RwLock;
use std::collections::HashMap;

/// Whether a CONNECT may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Block,
}

#[derive(Debug)]
struct PolicyState {
    enabled: bool,
    thresholds: HashMap<String, i64>,
}

/// Domain policy shared between the proxy and an external editor.
///
/// Threshold semantics: `-1` no limit, `0` block on sight, `n > 0` block the
/// stream once cumulative download bytes exceed `n`. Keys match as
/// case-insensitive substrings of the queried host; when several keys match,
/// whichever the map yields first wins. Queries re-read the map every time,
/// so edits apply to in-flight relays.
#[derive(Debug)]
pub struct PolicyStore {
    state: RwLock<PolicyState>,
}

impl PolicyStore {
    /// An enabled store with no rules (which allows everything).
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PolicyState {
                enabled: true,
                thresholds: HashMap::new(),
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.write().enabled = enabled;
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn set_threshold(&self, domain: impl Into<String>, threshold: i64) {
        self.state.write().thresholds.insert(domain.into(), threshold);
    }

    pub fn remove_threshold(&self, domain: &str) {
        self.state.write().thresholds.remove(domain);
    }

    /// Swap in a whole new rule set.
    pub fn replace_thresholds(&self, thresholds: HashMap<String, i64>) {
        self.state.write().thresholds = thresholds;
    }

    /// Connect-time gate: blocks only hosts matching a zero threshold.
    /// Byte budgets are enforced later, inside the relay.
    #[must_use]
    pub fn should_allow(&self, host: &str, _port: u16) -> FilterDecision {
        let state = self.state.read();
        if !state.enabled {
            return FilterDecision::Allow;
        }
        let host = host.to_ascii_lowercase();
        for (domain, &threshold) in &state.thresholds {
            if threshold == 0 && host.contains(&domain.to_ascii_lowercase()) {
                return FilterDecision::Block;
            }
        }
        FilterDecision::Allow
    }

    /// Download budget for a stream with the given SNI, `None` when
    /// unlimited.
    #[must_use]
    pub fn stream_block_threshold(&self, sni: &str) -> Option<u64> {
        let state = self.state.read();
        if !state.enabled {
            return None;
        }
        let sni = sni.to_ascii_lowercase();
        for (domain, &threshold) in &state.thresholds {
            if sni.contains(&domain.to_ascii_lowercase()) {
                return match threshold {
                    t if t < 0 => None,
                    t => Some(t as u64),
                };
            }
        }
        None
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_allows_everything() {
        let store = PolicyStore::new();
        assert_eq!(store.should_allow("example.com", 443), FilterDecision::Allow);
        assert_eq!(store.stream_block_threshold("example.com"), None);
    }

    #[test]
    fn zero_threshold_blocks_connects() {
        let store = PolicyStore::new();
        store.set_threshold("evil.test", 0);
        assert_eq!(store.should_allow("api.evil.test", 443), FilterDecision::Block);
        assert_eq!(store.should_allow("good.test", 443), FilterDecision::Allow);
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        let store = PolicyStore::new();
        store.set_threshold("cdninstagram.com", 0);
        assert_eq!(
            store.should_allow("scontent-sjc6-1.CDNINSTAGRAM.com", 443),
            FilterDecision::Block
        );
        store.set_threshold("Streamy.Test", 1024);
        assert_eq!(
            store.stream_block_threshold("www.STREAMY.test"),
            Some(1024)
        );
    }

    #[test]
    fn positive_threshold_does_not_block_connects() {
        let store = PolicyStore::new();
        store.set_threshold("streamy.test", 1024);
        assert_eq!(
            store.should_allow("www.streamy.test", 443),
            FilterDecision::Allow
        );
        assert_eq!(store.stream_block_threshold("www.streamy.test"), Some(1024));
    }

    #[test]
    fn negative_threshold_means_no_limit() {
        let store = PolicyStore::new();
        store.set_threshold("bulk.test", -1);
        assert_eq!(store.should_allow("www.bulk.test", 443), FilterDecision::Allow);
        assert_eq!(store.stream_block_threshold("www.bulk.test"), None);
    }

    #[test]
    fn zero_threshold_on_sni_blocks_at_first_byte() {
        let store = PolicyStore::new();
        store.set_threshold("evil.test", 0);
        assert_eq!(store.stream_block_threshold("cdn.evil.test"), Some(0));
    }

    #[test]
    fn disabling_bypasses_the_filter() {
        let store = PolicyStore::new();
        store.set_threshold("evil.test", 0);
        store.set_enabled(false);
        assert_eq!(store.should_allow("api.evil.test", 443), FilterDecision::Allow);
        assert_eq!(store.stream_block_threshold("api.evil.test"), None);
        store.set_enabled(true);
        assert_eq!(store.should_allow("api.evil.test", 443), FilterDecision::Block);
    }

    #[test]
    fn edits_apply_to_later_queries() {
        let store = PolicyStore::new();
        store.set_threshold("streamy.test", 1024);
        assert_eq!(store.stream_block_threshold("www.streamy.test"), Some(1024));
        store.set_threshold("streamy.test", -1);
        assert_eq!(store.stream_block_threshold("www.streamy.test"), None);
        store.remove_threshold("streamy.test");
        store.replace_thresholds(HashMap::from([("other.test".to_string(), 0)]));
        assert_eq!(store.should_allow("other.test", 80), FilterDecision::Block);
    }
}
