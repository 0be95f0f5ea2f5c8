//! Interface for the shared key-value broker, abstracted over implementation.
//!
//! Correctness across worker processes relies solely on the atomicity of
//! these primitives; everything the queue layer does is composed from them.
//! The production implementation speaks Redis ([`redis::RedisBroker`]);
//! [`memory::MemoryBroker`] backs the test suite and single-process use.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;

pub mod memory;
pub mod redis;

/// Errors interacting with the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encountered when establishing the connection.
    #[error("connect to broker")]
    Connect,

    /// Encountered at runtime interacting with the broker.
    ///
    /// Transient failures are retried inside the implementation;
    /// this surfaces only once the retry budget is spent.
    #[error("communicate with broker")]
    Communication,

    /// The broker answered with something the client could not interpret.
    #[error("interpret broker reply")]
    Decode,
}

/// A live subscription to one pub/sub channel.
///
/// Delivery is best-effort: messages published while a subscriber is
/// disconnected are gone. Subscribers re-sync from a snapshot instead.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. `None` means the channel is gone.
    async fn next_message(&mut self) -> Result<Option<String>, Report<Error>>;
}

/// The primitive set the queue layer is built on.
///
/// Implementations must make each method atomic with respect to concurrent
/// callers, including callers in other processes. Methods taking a guard
/// (`*_if_equal`) compare-and-act server-side.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// `SET key value NX PX ttl`: store the value only if the key is absent.
    /// Returns whether the value was stored.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Report<Error>>;

    /// Store a plain value unconditionally, clearing any TTL.
    async fn put(&self, key: &str, value: &str) -> Result<(), Report<Error>>;

    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>, Report<Error>>;

    /// Delete the key only if its current value equals `expect`.
    /// Returns whether a deletion happened.
    async fn remove_if_equal(&self, key: &str, expect: &str) -> Result<bool, Report<Error>>;

    /// Extend the key's TTL only if its current value equals `expect`.
    /// Returns whether the extension happened.
    async fn extend_if_equal(
        &self,
        key: &str,
        expect: &str,
        ttl: Duration,
    ) -> Result<bool, Report<Error>>;

    /// Write several fields of a hash.
    async fn set_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), Report<Error>>;

    /// Read all fields of a hash. An absent key reads as an empty map.
    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, Report<Error>>;

    /// Write several fields of a hash only if `guard.0`'s current value
    /// equals `guard.1`. Returns whether the write happened.
    async fn set_fields_if_equal(
        &self,
        key: &str,
        guard: (&str, &str),
        fields: Vec<(String, String)>,
    ) -> Result<bool, Report<Error>>;

    /// Atomically apply several integer deltas to hash fields and return the
    /// hash as it stands after the increments.
    async fn incr_fields(
        &self,
        key: &str,
        deltas: Vec<(String, i64)>,
    ) -> Result<HashMap<String, String>, Report<Error>>;

    /// Add a member to a sorted index with the given score.
    async fn index_put(&self, key: &str, member: &str, score: f64) -> Result<(), Report<Error>>;

    /// Read up to `limit` members of a sorted index, highest score first.
    async fn index_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, Report<Error>>;

    /// Drop the lowest-scored members so at most `keep` remain.
    async fn index_trim(&self, key: &str, keep: usize) -> Result<(), Report<Error>>;

    /// Append a payload to a FIFO work queue.
    async fn push_back(&self, queue: &str, payload: &str) -> Result<(), Report<Error>>;

    /// Pop the oldest payload from a FIFO work queue, waiting up to `wait`.
    async fn pop_front(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<String>, Report<Error>>;

    /// Stamp a TTL on any key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Report<Error>>;

    /// Publish a payload to a channel. Fire-and-forget.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Report<Error>>;

    /// Open a subscription to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, Report<Error>>;

    /// Verify the broker is reachable.
    async fn healthcheck(&self) -> Result<(), Report<Error>>;
}
