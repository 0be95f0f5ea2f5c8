//! In-process broker implementation.
//!
//! Backs the test suite, and is a reasonable choice for single-process
//! deployments where an external broker is overkill. All state lives behind
//! one mutex; pub/sub is a set of broadcast channels. Nothing survives a
//! restart, matching the durability promises of the queue layer (none).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;

use super::{Broker, Error, Subscription};

const CHANNEL_CAPACITY: usize = 256;

/// A broker held entirely in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    queued: Arc<Notify>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
}

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    indexes: HashMap<String, Vec<(f64, String)>>,
    queues: HashMap<String, VecDeque<String>>,
    expiries: HashMap<String, Instant>,
}

impl State {
    /// Lazy expiry: a key past its deadline is dropped the next time
    /// anything looks at it.
    fn purge(&mut self, key: &str) {
        let expired = self
            .expiries
            .get(key)
            .map_or(false, |deadline| *deadline <= Instant::now());
        if expired {
            self.expiries.remove(key);
            self.strings.remove(key);
            self.hashes.remove(key);
            self.indexes.remove(key);
            self.queues.remove(key);
        }
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        if state.strings.contains_key(key) {
            return Ok(false);
        }
        state.strings.insert(String::from(key), String::from(value));
        state
            .expiries
            .insert(String::from(key), Instant::now() + ttl);
        Ok(true)
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), Report<Error>> {
        let mut state = self.state.lock().await;
        state.strings.insert(String::from(key), String::from(value));
        state.expiries.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn remove_if_equal(&self, key: &str, expect: &str) -> Result<bool, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        if state.strings.get(key).map(String::as_str) == Some(expect) {
            state.strings.remove(key);
            state.expiries.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn extend_if_equal(
        &self,
        key: &str,
        expect: &str,
        ttl: Duration,
    ) -> Result<bool, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        if state.strings.get(key).map(String::as_str) == Some(expect) {
            state
                .expiries
                .insert(String::from(key), Instant::now() + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        let hash = state.hashes.entry(String::from(key)).or_default();
        hash.extend(fields);
        Ok(())
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_fields_if_equal(
        &self,
        key: &str,
        guard: (&str, &str),
        fields: Vec<(String, String)>,
    ) -> Result<bool, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        let Some(hash) = state.hashes.get_mut(key) else { return Ok(false) };
        if hash.get(guard.0).map(String::as_str) != Some(guard.1) {
            return Ok(false);
        }
        hash.extend(fields);
        Ok(true)
    }

    async fn incr_fields(
        &self,
        key: &str,
        deltas: Vec<(String, i64)>,
    ) -> Result<HashMap<String, String>, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        let hash = state.hashes.entry(String::from(key)).or_default();
        for (field, delta) in deltas {
            let current = hash
                .get(&field)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0);
            hash.insert(field, (current + delta).to_string());
        }
        Ok(hash.clone())
    }

    async fn index_put(&self, key: &str, member: &str, score: f64) -> Result<(), Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        let index = state.indexes.entry(String::from(key)).or_default();
        index.retain(|(_, existing)| existing != member);
        index.push((score, String::from(member)));
        index.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        Ok(())
    }

    async fn index_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        Ok(state
            .indexes
            .get(key)
            .map(|index| {
                index
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn index_trim(&self, key: &str, keep: usize) -> Result<(), Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(key);
        if let Some(index) = state.indexes.get_mut(key) {
            let excess = index.len().saturating_sub(keep);
            index.drain(..excess);
        }
        Ok(())
    }

    async fn push_back(&self, queue: &str, payload: &str) -> Result<(), Report<Error>> {
        let mut state = self.state.lock().await;
        state.purge(queue);
        state
            .queues
            .entry(String::from(queue))
            .or_default()
            .push_back(String::from(payload));
        drop(state);
        self.queued.notify_waiters();
        Ok(())
    }

    async fn pop_front(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<String>, Report<Error>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.queued.notified();
            {
                let mut state = self.state.lock().await;
                state.purge(queue);
                if let Some(payload) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                    return Ok(Some(payload));
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Report<Error>> {
        let mut state = self.state.lock().await;
        state
            .expiries
            .insert(String::from(key), Instant::now() + ttl);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Report<Error>> {
        let channels = self.channels.lock().await;
        if let Some(sender) = channels.get(channel) {
            // A send error just means nobody is listening right now.
            let _ = sender.send(String::from(payload));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, Report<Error>> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(String::from(channel))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(Box::new(MemorySubscription {
            receiver: sender.subscribe(),
        }))
    }

    async fn healthcheck(&self) -> Result<(), Report<Error>> {
        Ok(())
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<String>, Report<Error>> {
        loop {
            match self.receiver.recv().await {
                Ok(payload) => return Ok(Some(payload)),
                // Dropped messages are fine; subscribers re-sync from snapshots.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
