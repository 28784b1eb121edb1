//! Failure classification policies feeding the pipeline ban lists.

use hashbrown::HashMap;
use std::hash::Hash;

/// Decides whether a misbehaving key (peer id, transport address) should be
/// filtered. Consulted on every classified failure.
pub trait FilterPolicy<K> {
    /// Record a failure for `key`. Returns true once the key should be
    /// banned.
    fn register_failure(&mut self, key: &K) -> bool;

    /// Clear the record for `key`.
    fn forget(&mut self, key: &K);
}

/// Counts failures per key and requests a filter once the configured limit
/// is reached. A limit of 1 bans on the first failure; a limit of 0 never
/// bans.
pub struct ThresholdPolicy<K> {
    limit: u32,
    failures: HashMap<K, u32>,
}

impl<K> ThresholdPolicy<K> {
    #[inline]
    pub fn new(limit: u32) -> ThresholdPolicy<K> {
        ThresholdPolicy {
            limit,
            failures: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone> FilterPolicy<K> for ThresholdPolicy<K> {
    fn register_failure(&mut self, key: &K) -> bool {
        if self.limit == 0 {
            return false;
        }

        let count = self.failures.entry(key.clone()).or_insert(0);
        *count += 1;

        *count >= self.limit
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_triggers_at_limit() {
        let mut policy = ThresholdPolicy::new(3);

        assert!(!policy.register_failure(&"a"));
        assert!(!policy.register_failure(&"a"));
        assert!(policy.register_failure(&"a"));

        // Keys are counted independently.
        assert!(!policy.register_failure(&"b"));
    }

    #[test]
    fn test_limit_of_one_bans_immediately() {
        let mut policy = ThresholdPolicy::new(1);

        assert!(policy.register_failure(&1u64));
    }

    #[test]
    fn test_zero_limit_never_bans() {
        let mut policy = ThresholdPolicy::new(0);

        for _ in 0..100 {
            assert!(!policy.register_failure(&1u64));
        }
    }

    #[test]
    fn test_forget_resets_count() {
        let mut policy = ThresholdPolicy::new(2);

        assert!(!policy.register_failure(&"a"));
        policy.forget(&"a");
        assert!(!policy.register_failure(&"a"));
        assert!(policy.register_failure(&"a"));
    }
}
