//! Distributed sliding-window counter backed by Redis.
//!
//! Every process in the fleet increments the same keys. Each key is a sorted
//! set holding one member per admission, scored by the admission time in
//! milliseconds. A single Lua script trims members older than the window,
//! admits the attempt if capacity remains, and refreshes the key's TTL, so the
//! whole check is one atomic step on the server. Time comes from the Redis
//! server's `TIME`, which keeps the window consistent across hosts whose
//! clocks disagree.
//!
//! Requires Redis 3.2 or newer, the first release with script effect
//! replication.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

use super::backend::{CountingBackend, WindowTally};
use crate::error::{QuotaguardError, Result};

/// Default prefix for every key written to the store.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:";

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local member = ARGV[3]

-- Required before TIME on Redis 3.2 to 4.x; a no-op from 5 onwards.
redis.replicate_commands()
local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local count = redis.call('ZCARD', key)

local allowed = 0
if count < limit then
    redis.call('ZADD', key, now_ms, member)
    allowed = 1
end
count = count + 1

redis.call('PEXPIRE', key, window_ms)

local reset_ms = now_ms + window_ms
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    reset_ms = tonumber(oldest[2]) + window_ms
end

return {allowed, count, reset_ms}
"#;

/// Connection settings for the shared store.
#[derive(Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://cache.internal:6379/0` or `rediss://...`
    pub url: String,
    /// Access token sent as the AUTH password
    pub token: Option<String>,
    /// Prefix for every key
    pub key_prefix: String,
}

impl fmt::Debug for RedisStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStoreConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Redis-backed sliding-window store.
///
/// The connection is opened on first use and replaced after a failure, so a
/// store that is down at startup is picked up once it comes back.
pub struct RedisWindowStore {
    client: Client,
    connection: Mutex<Option<ConnectionManager>>,
    script: Script,
    key_prefix: String,
}

impl fmt::Debug for RedisWindowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWindowStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisWindowStore {
    /// Build a store client. No connection is made until the first check.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be parsed.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        let mut info = config.url.as_str().into_connection_info()?;
        if let Some(token) = config.token {
            info.redis.password = Some(token);
        }
        let client = Client::open(info)?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            key_prefix: config.key_prefix,
        })
    }

    /// Build a store client and verify connectivity with a round trip.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        let mut conn = store.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        info!(prefix = %store.key_prefix, "Connected to rate limit store");
        Ok(store)
    }

    /// Full store key for a partition key.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        debug!("Opening rate limit store connection");
        let conn = ConnectionManager::new(self.client.clone()).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        self.connection.lock().await.take();
    }
}

#[async_trait]
impl CountingBackend for RedisWindowStore {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<WindowTally> {
        let store_key = self.store_key(key);
        let window_ms = u64::try_from(window.as_millis()).map_err(|_| {
            QuotaguardError::Config(format!("window of {:?} is too long", window))
        })?;
        let member = uuid::Uuid::new_v4().to_string();

        let mut conn = self.connection().await?;
        let result: redis::RedisResult<(u64, u64, i64)> = self
            .script
            .key(&store_key)
            .arg(limit)
            .arg(window_ms)
            .arg(member)
            .invoke_async(&mut conn)
            .await;

        let (allowed, count, reset_ms) = match result {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    self.reset_connection().await;
                }
                return Err(e.into());
            }
        };

        trace!(
            key = %store_key,
            allowed,
            count,
            limit,
            "Sliding window checked"
        );

        let reset_at = DateTime::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now);
        Ok(WindowTally {
            success: allowed == 1,
            count,
            remaining: limit.saturating_sub(count),
            reset_at,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
