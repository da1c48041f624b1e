//! Valkey/Redis adapters for the KV store and the bus.
//!
//! The bus maps every route to a stream. All sidecars read through one
//! consumer group, so a stream with several subscribers (a replicated
//! service) hands each entry to exactly one of them, and entries stay
//! pending until marked.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tether_proto::{Message, Route};
use tokio::sync::mpsc;

use crate::error::{BusError, KvError};
use crate::traits::{Acknowledge, Bus, KvBackend};
use crate::types::{Inbound, Membership, MessageId, Subscription};

const CONSUMER_GROUP: &str = "tether";
const SUBSCRIPTION_CAPACITY: usize = 256;
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

fn create_pool(url: &str, pool_size: usize) -> Result<Pool, String> {
    Config::from_url(url)
        .builder()
        .map_err(|e| e.to_string())?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| e.to_string())
}

async fn ping(pool: &Pool) -> Result<(), String> {
    let mut conn = pool.get().await.map_err(|e| e.to_string())?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Valkey/Redis KV backend.
#[derive(Clone)]
pub struct ValkeyKv {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyKv {
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, KvError> {
        let pool = create_pool(url, pool_size).map_err(KvError::Connection)?;
        ping(&pool).await.map_err(KvError::Connection)?;
        Ok(Self { pool, namespace })
    }

    fn prefixed_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, KvError> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))
    }
}

#[async_trait]
impl KvBackend for ValkeyKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn().await?;
        conn.get::<_, Option<Vec<u8>>>(self.prefixed_key(key))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.prefixed_key(key), value)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = conn
            .del(self.prefixed_key(key))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;

        let script = redis::Script::new(
            r#"
            local current = redis.call('GET', KEYS[1])
            if ARGV[1] == '0' then
                if current then return 0 end
            elseif current ~= ARGV[2] then
                return 0
            end
            redis.call('SET', KEYS[1], ARGV[3])
            return 1
            "#,
        );

        let (has_expected, expected): (&str, &[u8]) = match expected {
            Some(value) => ("1", value),
            None => ("0", b""),
        };

        let swapped: i32 = script
            .key(self.prefixed_key(key))
            .arg(has_expected)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;

        Ok(swapped == 1)
    }
}

/// Valkey/Redis stream backed bus.
#[derive(Clone)]
pub struct ValkeyBus {
    pool: Pool,
    prefix: String,
    block: Duration,
    batch: usize,
}

impl ValkeyBus {
    pub async fn new(
        url: &str,
        prefix: impl Into<String>,
        pool_size: usize,
        block: Duration,
        batch: usize,
    ) -> Result<Self, BusError> {
        let pool = create_pool(url, pool_size).map_err(BusError::Connection)?;
        ping(&pool).await.map_err(BusError::Connection)?;
        Ok(Self {
            pool,
            prefix: prefix.into(),
            block,
            batch,
        })
    }

    fn stream_key(&self, route: &Route) -> String {
        format!("{}:{}", self.prefix, route.key())
    }

    async fn ensure_group(&self, stream: &str) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let created = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<()>(&mut *conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Backend(e.to_string())),
        }
    }
}

#[async_trait]
impl Bus for ValkeyBus {
    async fn publish(&self, route: &Route, message: &Message) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let fields: Vec<(&str, &str)> = message
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        conn.xadd::<_, _, _, _, String>(self.stream_key(route), "*", fields.as_slice())
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, membership: &Membership) -> Result<Subscription, BusError> {
        let streams: Vec<String> = membership
            .routes()
            .iter()
            .map(|route| self.stream_key(route))
            .collect();

        for stream in &streams {
            self.ensure_group(stream).await?;
        }

        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let reader = StreamReader {
            pool: self.pool.clone(),
            consumer: membership.sidecar.clone(),
            streams,
            options: StreamReadOptions::default()
                .group(CONSUMER_GROUP, membership.sidecar.clone())
                .block(usize::try_from(self.block.as_millis()).unwrap_or(usize::MAX))
                .count(self.batch),
        };
        tokio::spawn(reader.run(sender));

        Ok(Subscription::new(receiver))
    }
}

struct StreamReader {
    pool: Pool,
    consumer: String,
    streams: Vec<String>,
    options: StreamReadOptions,
}

impl StreamReader {
    async fn read(&self, ids: &[&str]) -> Result<StreamReadReply, String> {
        let mut conn = self.pool.get().await.map_err(|e| e.to_string())?;
        conn.xread_options(self.streams.as_slice(), ids, &self.options)
            .await
            .map_err(|e| e.to_string())
    }

    /// Reads until the subscription is dropped.
    async fn run(self, sender: mpsc::Sender<Inbound>) {
        let ids = vec![">"; self.streams.len()];

        while !sender.is_closed() {
            let reply = match self.read(&ids).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!(consumer = %self.consumer, error = %e, "Bus read failed");
                    tokio::time::sleep(READ_RETRY_DELAY).await;
                    continue;
                }
            };

            for stream in reply.keys {
                for entry in stream.ids {
                    let mut message = Message::new();
                    for (key, value) in &entry.map {
                        match redis::from_redis_value::<String>(value) {
                            Ok(value) => {
                                message.insert(key.clone(), value);
                            }
                            Err(e) => {
                                tracing::warn!(stream = %stream.key, id = %entry.id, field = %key, error = %e, "Dropping undecodable field");
                            }
                        }
                    }

                    let ack = StreamAck {
                        pool: self.pool.clone(),
                        stream: stream.key.clone(),
                        id: entry.id.clone(),
                    };
                    let inbound = Inbound::new(MessageId::new(entry.id), message, Box::new(ack));
                    if sender.send(inbound).await.is_err() {
                        return;
                    }
                }
            }
        }

        tracing::debug!(consumer = %self.consumer, "Bus subscription closed");
    }
}

struct StreamAck {
    pool: Pool,
    stream: String,
    id: String,
}

#[async_trait]
impl Acknowledge for StreamAck {
    /// Entries read with `>` are already owned by this consumer.
    async fn confirm(&self) -> bool {
        true
    }

    async fn mark(&self) -> Result<(), BusError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        conn.xack::<_, _, _, i64>(&self.stream, CONSUMER_GROUP, &[&self.id])
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        conn.xdel::<_, _, i64>(&self.stream, &[&self.id])
            .await
            .map_err(|e| BusError::Backend(e.to_string()))?;
        Ok(())
    }
}
