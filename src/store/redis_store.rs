//! Redis-backed shared store
//!
//! Conditional writes run as Lua scripts so the compare and the write happen
//! in one server-side step. Blocking stream reads use a dedicated multiplexed
//! connection per stream so they never stall the shared command connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Script};
use std::collections::HashMap;
use std::time::Duration;

use super::{AutoClaim, CompanionWrite, SharedStore, StreamEntry};
use crate::common::{Error, Result};

const COMPARE_AND_SWAP: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
"#;

const COMPARE_AND_REFRESH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
  if #KEYS > 1 then
    redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[4])
  end
  return 1
end
return 0
"#;

const DELETE_IF_PREFIX: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and string.sub(current, 1, string.len(ARGV[1])) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  if #KEYS > 1 then
    redis.call('SET', KEYS[2], ARGV[2], 'EX', ARGV[3])
  end
  return 1
end
return 0
"#;

fn secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Map connectivity failures to `TransportUnavailable` so callers fail fast
fn store_error(err: RedisError) -> Error {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        Error::TransportUnavailable(err.to_string())
    } else {
        Error::Redis(err)
    }
}

fn to_entry(id: String, raw: HashMap<String, redis::Value>) -> Result<StreamEntry> {
    let mut fields = HashMap::with_capacity(raw.len());
    for (name, value) in raw {
        let value: String = redis::from_redis_value(&value)
            .map_err(|e| Error::MalformedEntry(format!("{} field {}: {}", id, name, e)))?;
        fields.insert(name, value);
    }
    Ok(StreamEntry { id, fields })
}

pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    compare_and_swap: Script,
    compare_and_refresh: Script,
    delete_if_prefix: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_error)?;
        tracing::info!(url = %url, "Connected to shared store");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            compare_and_refresh: Script::new(COMPARE_AND_REFRESH),
            delete_if_prefix: Script::new(DELETE_IF_PREFIX),
        })
    }

    async fn blocking_conn(&self, stream: &str) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().get(stream).cloned() {
            return Ok(conn);
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_error)?;
        self.blocking
            .lock()
            .insert(stream.to_string(), conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_error)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(swapped == 1)
    }

    async fn compare_and_refresh(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.compare_and_refresh.key(key);
        invocation.arg(expected).arg(secs(ttl));
        if let Some(write) = companion {
            invocation
                .key(&write.key)
                .arg(&write.value)
                .arg(secs(write.ttl));
        }
        let refreshed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(refreshed == 1)
    }

    async fn delete_if_prefix(
        &self,
        key: &str,
        prefix: &str,
        companion: Option<&CompanionWrite>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.delete_if_prefix.key(key);
        invocation.arg(prefix);
        if let Some(write) = companion {
            invocation
                .key(&write.key)
                .arg(&write.value)
                .arg(secs(write.ttl));
        }
        let deleted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(deleted == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(store_error)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        if let Err(err) = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await
        {
            if err.code() != Some("BUSYGROUP") {
                return Err(store_error(err));
            }
        }
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: usize,
    ) -> Result<String> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(*value);
        }
        cmd.query_async(&mut conn).await.map_err(store_error)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut conn = self.blocking_conn(stream).await?;
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> =
            match conn.xread_options(&[stream], &[">"], &opts).await {
                Ok(reply) => reply,
                Err(err) => {
                    self.blocking.lock().remove(stream);
                    return Err(store_error(err));
                }
            };

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                entries.push(to_entry(id.id, id.map)?);
            }
        }
        Ok(entries)
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        // ID 0 walks this consumer's pending list instead of new entries; never blocks
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default().group(group, consumer).count(count);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &["0"], &opts)
            .await
            .map_err(store_error)?;

        let mut entries = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                entries.push(to_entry(id.id, id.map)?);
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await.map_err(store_error)?;
        Ok(())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &str,
        count: usize,
    ) -> Result<AutoClaim> {
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;

        let next_start: String = match reply.first() {
            Some(value) => redis::from_redis_value(value)?,
            None => "0-0".to_string(),
        };
        let raw: Vec<(String, HashMap<String, redis::Value>)> = match reply.get(1) {
            Some(value) => redis::from_redis_value(value)?,
            None => Vec::new(),
        };

        let entries = raw
            .into_iter()
            .map(|(id, fields)| to_entry(id, fields))
            .collect::<Result<Vec<_>>>()?;
        Ok(AutoClaim {
            next_start,
            entries,
        })
    }

    async fn release_stream(&self, stream: &str) {
        // An in-flight XREADGROUP keeps its own clone until it returns
        if self.blocking.lock().remove(stream).is_some() {
            tracing::debug!(stream = %stream, "Released blocking connection");
        }
    }
}
