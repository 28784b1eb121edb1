//! Timeout bookkeeping over a host-supplied sleep primitive.
//!
//! The service never owns a clock. `wait` invokes the host's sleep once,
//! takes whatever elapsed time it reports (an interrupted sleep returning
//! less than requested is fine) and advances every pending deadline by it.

use crate::identity::ChannelId;
use crate::logging::{self, Logger};
use indexmap::IndexMap;
use std::fmt;
use std::time::Duration;

/// What a timeout guards.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimeoutTag {
    /// An initiator waiting for CHANNEL_ACKNOWLEDGE.
    New,
    /// An established channel's idle deadline.
    Channel,
}

/// A timeout identity: the channel it is scoped to plus the tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ScopedTag {
    pub scope: ChannelId,
    pub tag: TimeoutTag,
}

impl ScopedTag {
    #[inline]
    pub fn new(scope: ChannelId, tag: TimeoutTag) -> ScopedTag {
        ScopedTag { scope, tag }
    }
}

impl fmt::Display for ScopedTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}@{}", self.tag, self.scope)
    }
}

/// Host sleep primitive: sleep up to the requested duration, return how much
/// time actually elapsed.
pub type SleepFn = Box<dyn FnMut(Duration) -> Duration>;

/// Pending timeouts keyed by scoped tag, expired in insertion order.
pub struct TimeoutService {
    sleep: SleepFn,
    pending: IndexMap<ScopedTag, Duration>,
    log: Logger,
}

impl TimeoutService {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a Logger>>>(sleep: SleepFn, log: L) -> TimeoutService {
        TimeoutService {
            sleep,
            pending: IndexMap::new(),
            log: logging::child(log),
        }
    }

    /// Arm a timeout. Duplicate tags are ignored; the original deadline
    /// stands.
    pub fn add(&mut self, tag: ScopedTag, duration: Duration) {
        if self.pending.contains_key(&tag) {
            return;
        }

        logging::trace!(self.log, "timeout armed";
                        "context" => "add",
                        "tag" => %tag,
                        "duration" => ?duration);

        self.pending.insert(tag, duration);
    }

    /// Cancel a timeout. Returns whether it was armed.
    pub fn remove(&mut self, tag: &ScopedTag) -> bool {
        let removed = self.pending.shift_remove(tag).is_some();

        if removed {
            logging::trace!(self.log, "timeout cancelled"; "context" => "remove", "tag" => %tag);
        }

        removed
    }

    /// Cancel every timeout scoped to the supplied channel.
    pub fn cancel_scope(&mut self, scope: ChannelId) {
        self.pending.retain(|tag, _| tag.scope != scope);
    }

    #[inline]
    pub fn is_armed(&self, tag: &ScopedTag) -> bool {
        self.pending.contains_key(tag)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Sleep once via the host primitive and collect the tags whose remaining
    /// duration elapsed. The rest are decremented. Not re-entrant.
    pub fn wait(&mut self, duration: Duration) -> Vec<ScopedTag> {
        let elapsed = (self.sleep)(duration);
        let mut expired = Vec::new();

        self.pending.retain(|tag, remaining| {
            if *remaining <= elapsed {
                expired.push(*tag);
                false
            } else {
                *remaining -= elapsed;
                true
            }
        });

        for tag in &expired {
            logging::debug!(self.log, "timeout expired"; "context" => "wait", "tag" => %tag);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TimeoutService {
        // Sleeps always elapse in full.
        TimeoutService::new(Box::new(|duration| duration), None)
    }

    fn tag(scope: u16, tag: TimeoutTag) -> ScopedTag {
        ScopedTag::new(ChannelId::new(scope, 0), tag)
    }

    #[test]
    fn test_expiry_batch() {
        let mut timeouts = service();

        timeouts.add(tag(1, TimeoutTag::New), Duration::from_millis(200));
        timeouts.add(tag(2, TimeoutTag::New), Duration::from_millis(500));

        let expired = timeouts.wait(Duration::from_millis(200));

        assert_eq!(expired, vec![tag(1, TimeoutTag::New)]);
        assert_eq!(timeouts.len(), 1);

        // The survivor was decremented and fires on the next wait.
        let expired = timeouts.wait(Duration::from_millis(300));

        assert_eq!(expired, vec![tag(2, TimeoutTag::New)]);
        assert_eq!(timeouts.len(), 0);
    }

    #[test]
    fn test_duplicate_add_keeps_original_deadline() {
        let mut timeouts = service();

        timeouts.add(tag(1, TimeoutTag::New), Duration::from_millis(100));
        timeouts.add(tag(1, TimeoutTag::New), Duration::from_millis(10_000));

        let expired = timeouts.wait(Duration::from_millis(100));

        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_remove_cancels() {
        let mut timeouts = service();
        let armed = tag(1, TimeoutTag::Channel);

        timeouts.add(armed, Duration::from_millis(100));

        assert!(timeouts.is_armed(&armed));
        assert!(timeouts.remove(&armed));
        assert!(!timeouts.remove(&armed));

        assert!(timeouts.wait(Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_cancel_scope_drops_all_tags() {
        let mut timeouts = service();
        let scope = ChannelId::new(1, 2);

        timeouts.add(ScopedTag::new(scope, TimeoutTag::New), Duration::from_millis(1));
        timeouts.add(
            ScopedTag::new(scope, TimeoutTag::Channel),
            Duration::from_millis(1),
        );
        timeouts.add(tag(9, TimeoutTag::New), Duration::from_millis(1));

        timeouts.cancel_scope(scope);

        assert_eq!(timeouts.len(), 1);
    }

    #[test]
    fn test_interrupted_sleep_advances_partially() {
        // The host reports half of the requested time elapsed.
        let mut timeouts = TimeoutService::new(Box::new(|duration| duration / 2), None);

        timeouts.add(tag(1, TimeoutTag::New), Duration::from_millis(100));

        assert!(timeouts.wait(Duration::from_millis(100)).is_empty());
        assert_eq!(timeouts.wait(Duration::from_millis(100)).len(), 1);
    }

    #[test]
    fn test_scope_distinguishes_tags() {
        let mut timeouts = service();
        let scope = ChannelId::new(1, 0);

        timeouts.add(ScopedTag::new(scope, TimeoutTag::New), Duration::from_millis(1));
        timeouts.add(
            ScopedTag::new(scope, TimeoutTag::Channel),
            Duration::from_millis(1),
        );

        assert_eq!(timeouts.len(), 2);
    }
}
