//! Broker implementation speaking the Redis protocol.
//!
//! Commands run over a multiplexed [`ConnectionManager`], which transparently
//! reconnects after connection loss. The compound operations the queue layer
//! depends on for correctness (`incr_fields`, `set_fields_if_equal`,
//! `remove_if_equal`, `extend_if_equal`) are server-side Lua scripts, so they
//! are atomic against every other client of the broker, not just this process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use futures::{Future, Stream, StreamExt};
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{Client, Msg, Script};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use super::{Broker, Error, Subscription};
use crate::ext::error_stack::{DescribeContext, ErrorHelper, IntoContext};

/// Atomically apply HINCRBY deltas, then return the whole hash.
static INCR_FIELDS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        for i = 1, #ARGV, 2 do
            redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i + 1])
        end
        return redis.call('HGETALL', KEYS[1])
        "#,
    )
});

/// HSET a set of fields only when a guard field currently holds the expected value.
static SET_FIELDS_IF_EQUAL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
            return 0
        end
        for i = 3, #ARGV, 2 do
            redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
        end
        return 1
        "#,
    )
});

/// DEL a key only when it currently holds the expected value.
static REMOVE_IF_EQUAL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
});

/// PEXPIRE a key only when it currently holds the expected value.
static EXTEND_IF_EQUAL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('PEXPIRE', KEYS[1], ARGV[2])
        end
        return 0
        "#,
    )
});

/// A broker backed by a Redis-compatible server.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RedisBroker([OPAQUE redis::aio::ConnectionManager])")
    }
}

impl RedisBroker {
    /// Connect to the broker at the provided URL (e.g. `redis://127.0.0.1:6379/0`).
    #[tracing::instrument]
    pub async fn connect(url: &str) -> Result<Self, Report<Error>> {
        let client = Client::open(url)
            .context(Error::Connect)
            .describe_lazy(|| format!("parse broker url '{url}'"))?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .context(Error::Connect)
            .describe_lazy(|| format!("connect to broker at '{url}'"))
            .help("ensure the broker is running and reachable from this host")?;
        Ok(Self { client, conn })
    }

    /// Run a command with bounded retries on transient failures.
    ///
    /// The backoff starts at 100ms and runs three attempts with jitter;
    /// failures that outlive that budget surface to the caller, which for
    /// queue operations means the scan-level failure paths take over.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, Report<Error>>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        Retry::spawn(strategy, || op(self.conn.clone()))
            .await
            .context(Error::Communication)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, Report<Error>> {
        let reply: Option<String> = self
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn remove_if_equal(&self, key: &str, expect: &str) -> Result<bool, Report<Error>> {
        let removed: i64 = self
            .run(|mut conn| async move {
                REMOVE_IF_EQUAL
                    .key(key)
                    .arg(expect)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn extend_if_equal(
        &self,
        key: &str,
        expect: &str,
        ttl: Duration,
    ) -> Result<bool, Report<Error>> {
        let extended: i64 = self
            .run(|mut conn| async move {
                EXTEND_IF_EQUAL
                    .key(key)
                    .arg(expect)
                    .arg(ttl.as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(extended > 0)
    }

    async fn set_fields(
        &self,
        key: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), Report<Error>> {
        if fields.is_empty() {
            return Ok(());
        }
        self.run(|mut conn| {
            let fields = fields.clone();
            async move {
                let mut cmd = redis::cmd("HSET");
                cmd.arg(key);
                for (field, value) in &fields {
                    cmd.arg(field).arg(value);
                }
                cmd.query_async::<_, ()>(&mut conn).await
            }
        })
        .await
    }

    async fn fields(&self, key: &str) -> Result<HashMap<String, String>, Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn set_fields_if_equal(
        &self,
        key: &str,
        guard: (&str, &str),
        fields: Vec<(String, String)>,
    ) -> Result<bool, Report<Error>> {
        let written: i64 = self
            .run(|mut conn| {
                let fields = fields.clone();
                async move {
                    let mut invocation = SET_FIELDS_IF_EQUAL.key(key);
                    invocation.arg(guard.0).arg(guard.1);
                    for (field, value) in &fields {
                        invocation.arg(field).arg(value);
                    }
                    invocation.invoke_async(&mut conn).await
                }
            })
            .await?;
        Ok(written > 0)
    }

    async fn incr_fields(
        &self,
        key: &str,
        deltas: Vec<(String, i64)>,
    ) -> Result<HashMap<String, String>, Report<Error>> {
        self.run(|mut conn| {
            let deltas = deltas.clone();
            async move {
                let mut invocation = INCR_FIELDS.key(key);
                for (field, delta) in &deltas {
                    invocation.arg(field).arg(*delta);
                }
                invocation.invoke_async(&mut conn).await
            }
        })
        .await
    }

    async fn index_put(&self, key: &str, member: &str, score: f64) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn index_desc(&self, key: &str, limit: usize) -> Result<Vec<String>, Report<Error>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.run(|mut conn| async move {
            redis::cmd("ZREVRANGE")
                .arg(key)
                .arg(0)
                .arg(limit as i64 - 1)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn index_trim(&self, key: &str, keep: usize) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("ZREMRANGEBYRANK")
                .arg(key)
                .arg(0)
                .arg(-(keep as i64) - 1)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn push_back(&self, queue: &str, payload: &str) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("RPUSH")
                .arg(queue)
                .arg(payload)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn pop_front(
        &self,
        queue: &str,
        wait: Duration,
    ) -> Result<Option<String>, Report<Error>> {
        // BLPOP parks the whole connection, and the manager connection is
        // multiplexed across every caller in the process; blocking pops get
        // their own short-lived connection instead.
        let mut conn = self
            .client
            .get_async_connection()
            .await
            .context(Error::Communication)
            .describe("open dedicated connection for blocking pop")?;
        let reply: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(queue)
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await
            .context(Error::Communication)?;
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl.as_millis() as u64)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, Report<Error>> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context(Error::Communication)
            .describe("open dedicated connection for subscription")?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(channel)
            .await
            .context(Error::Communication)
            .describe_lazy(|| format!("subscribe to channel '{channel}'"))?;
        Ok(Box::new(RedisSubscription {
            stream: pubsub.into_on_message().boxed(),
        }))
    }

    async fn healthcheck(&self) -> Result<(), Report<Error>> {
        self.run(|mut conn| async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }
}

struct RedisSubscription {
    stream: std::pin::Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<String>, Report<Error>> {
        match self.stream.next().await {
            Some(msg) => msg
                .get_payload::<String>()
                .context(Error::Decode)
                .map(Some),
            None => Ok(None),
        }
    }
}
