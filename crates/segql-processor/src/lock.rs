//! Per-topic mutual exclusion.
//!
//! A [`TopicLocker`] hands out at most one [`TopicGuard`] per topic at a time.
//! Callers for the same topic wait until the holder drops or releases its
//! guard; callers for different topics never wait on each other. Per-topic
//! mutexes are created lazily and live as long as the locker.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct TopicLocker {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TopicLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, topic: &str) -> Arc<Mutex<()>> {
        // The shard lock is held only for this lookup.
        self.locks
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `topic`.
    pub async fn lock(&self, topic: &str) -> TopicGuard {
        let guard = self.handle(topic).lock_owned().await;
        TopicGuard {
            topic: topic.to_string(),
            _guard: guard,
        }
    }

    /// Take the lock for `topic` if nobody holds it.
    pub fn try_lock(&self, topic: &str) -> Option<TopicGuard> {
        let guard = self.handle(topic).try_lock_owned().ok()?;
        Some(TopicGuard {
            topic: topic.to_string(),
            _guard: guard,
        })
    }

    /// Number of topics that have been locked at least once.
    pub fn topic_count(&self) -> usize {
        self.locks.len()
    }
}

/// Exclusive hold on one topic. Dropping it releases the topic.
#[derive(Debug)]
pub struct TopicGuard {
    topic: String,
    _guard: OwnedMutexGuard<()>,
}

impl TopicGuard {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Release the topic now.
    pub fn release(self) {}
}
