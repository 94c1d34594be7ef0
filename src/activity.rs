//! Newest message id seen per channel, fed from the gateway.
//!
//! Discord message ids are snowflakes and grow with time, so "a message
//! newer than X exists" is `latest > X`.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct ChannelActivity {
    latest: Arc<Mutex<LruCache<u64, u64>>>,
}

impl ChannelActivity {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            latest: Arc::new(Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn record(&self, channel_id: u64, message_id: u64) {
        let mut latest = self.latest.lock().unwrap();
        match latest.get_mut(&channel_id) {
            Some(current) if *current >= message_id => {}
            Some(current) => *current = message_id,
            None => {
                latest.put(channel_id, message_id);
            }
        }
    }

    /// `None` when the channel is not tracked and the answer is unknown.
    pub fn has_activity_since(&self, channel_id: u64, message_id: u64) -> Option<bool> {
        let mut latest = self.latest.lock().unwrap();
        latest.get(&channel_id).map(|newest| *newest > message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_tracking() {
        let activity = ChannelActivity::new(10);
        assert_eq!(activity.has_activity_since(1, 100), None);

        activity.record(1, 100);
        assert_eq!(activity.has_activity_since(1, 100), Some(false));

        activity.record(1, 150);
        activity.record(1, 120); // late delivery does not move it back
        assert_eq!(activity.has_activity_since(1, 100), Some(true));
        assert_eq!(activity.has_activity_since(1, 150), Some(false));
    }

    #[test]
    fn test_least_recent_channel_is_evicted() {
        let activity = ChannelActivity::new(2);
        activity.record(1, 10);
        activity.record(2, 20);
        activity.record(3, 30);

        assert_eq!(activity.has_activity_since(1, 0), None);
        assert_eq!(activity.has_activity_since(3, 0), Some(true));
    }
}
