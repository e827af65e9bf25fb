use super::store::CoordinationStore;
use crate::error::ConsumerResult;
use crate::retry::{BackoffConfig, retry_with_backoff};
use async_trait::async_trait;
use redis::Client;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::info;

const REFRESH_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const SCAN_BATCH: usize = 200;

/// Coordination store backed by Redis.
///
/// Ephemeral keys use `PX` expiry, leadership uses `SET NX PX`, and
/// owner-checked refresh/delete run as Lua scripts so the check and the
/// write are atomic.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    conn: ConnectionManager,
    refresh_script: Script,
    delete_script: Script,
}

impl RedisCoordinationStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            refresh_script: Script::new(REFRESH_IF_OWNER),
            delete_script: Script::new(DELETE_IF_OWNER),
        }
    }

    /// Connect and verify with `PING`.
    pub async fn connect(url: &str) -> ConsumerResult<Self> {
        info!(url = %url, "Connecting to coordination store");

        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("Connected to coordination store");
        Ok(Self::new(manager))
    }

    /// Connect with exponential backoff, for startup against a store that
    /// may not be reachable yet.
    pub async fn connect_with_retry(url: &str, backoff: BackoffConfig) -> ConsumerResult<Self> {
        let url = url.to_string();
        retry_with_backoff(|| Self::connect(&url), backoff).await
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Escape glob metacharacters so a literal prefix can be used with `MATCH`.
fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> ConsumerResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn put(&self, key: &str, value: &str) -> ConsumerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ConsumerResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn put_ephemeral(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn try_acquire(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn refresh_if_owner(&self, key: &str, value: &str, ttl: Duration) -> ConsumerResult<bool> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = self
            .refresh_script
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn delete_if_owner(&self, key: &str, value: &str) -> ConsumerResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_script
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn list(&self, prefix: &str) -> ConsumerResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;

        // Keys may expire between SCAN and MGET
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    async fn ping(&self) -> ConsumerResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
