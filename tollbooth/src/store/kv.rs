//! The key-value store contract and its adapters.
//!
//! The contract is deliberately narrow: conditional set, plain set, get,
//! delete, and two server-side atomic counter updates. Higher layers use
//! only this trait.
//!
//! [`RedisKv`] is the production adapter; the counter operations run as Lua
//! scripts so they stay atomic under contention across gateway replicas.
//! [`MemoryKv`] implements the same contract in-process.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::{AsyncCommands, IntoConnectionInfo, Script};

use crate::provider::BoxFuture;

/// Errors surfaced by a key-value adapter.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Transport or protocol failure talking to the store.
    #[error("key-value store error: {0}")]
    Transport(#[from] redis::RedisError),
}

/// The store contract all stateful policies are built on.
pub trait Kv: Send + Sync {
    /// Sets `key` only if absent, with a TTL. Returns whether the caller
    /// acquired the key.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>>;

    /// Sets `key` unconditionally with a TTL.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), KvError>>;

    /// Reads `key`.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>>;

    /// Deletes `key`.
    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), KvError>>;

    /// Atomically decrements `key` by one if its current value is positive.
    /// Returns whether a decrement happened.
    fn decr_if_positive<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, KvError>>;

    /// Atomically increments `key` by one unless it already reached `cap`,
    /// and refreshes the TTL either way. Returns the resulting count.
    fn incr_capped<'a>(
        &'a self,
        key: &'a str,
        cap: i64,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<i64, KvError>>;
}

/// Decrement-if-positive as a server-side script so concurrent consumers
/// cannot drive the counter negative.
const DECR_IF_POSITIVE: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
  redis.call('DECR', KEYS[1])
  return 1
end
return 0
";

/// Capped increment that refreshes the TTL even when the cap is reached,
/// so outstanding credits survive a long backend outage.
const INCR_CAPPED: &str = r"
local cap = tonumber(ARGV[1])
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current < cap then
  current = redis.call('INCR', KEYS[1])
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return current
";

/// Redis-backed adapter over a multiplexed async connection.
pub struct RedisKv {
    client: redis::Client,
    decr_if_positive: Script,
    incr_capped: Script,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

impl RedisKv {
    /// Connects to the store at `url`, applying `token` as the connection
    /// password when given.
    ///
    /// # Errors
    ///
    /// Returns [`KvError`] if the URL is invalid.
    pub fn connect(url: &str, token: Option<&str>) -> Result<Self, KvError> {
        let mut info = url.into_connection_info()?;
        if let Some(token) = token {
            info.redis.password = Some(token.to_owned());
        }
        let client = redis::Client::open(info)?;
        Ok(Self {
            client,
            decr_if_positive: Script::new(DECR_IF_POSITIVE),
            incr_capped: Script::new(INCR_CAPPED),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

impl Kv for RedisKv {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            Ok(conn.get(key).await?)
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            conn.del::<_, ()>(key).await?;
            Ok(())
        })
    }

    fn decr_if_positive<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let consumed: i64 = self
                .decr_if_positive
                .key(key)
                .invoke_async(&mut conn)
                .await?;
            Ok(consumed == 1)
        })
    }

    fn incr_capped<'a>(
        &'a self,
        key: &'a str,
        cap: i64,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<i64, KvError>> {
        Box::pin(async move {
            let mut conn = self.conn().await?;
            let count: i64 = self
                .incr_capped
                .key(key)
                .arg(cap)
                .arg(ttl.as_secs())
                .invoke_async(&mut conn)
                .await?;
            Ok(count)
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// In-process adapter with the same atomicity guarantees, used in tests and
/// single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryKv {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(value: &str, ttl: Duration) -> MemoryEntry {
        MemoryEntry {
            value: value.to_owned(),
            expires_at: Instant::now().checked_add(ttl),
        }
    }
}

impl Kv for MemoryKv {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            // The entry guard holds the shard lock, making check-and-set
            // atomic within the process.
            match self.entries.entry(key.to_owned()) {
                Entry::Occupied(mut occupied) if !occupied.get().live() => {
                    occupied.insert(Self::entry(value, ttl));
                    Ok(true)
                }
                Entry::Occupied(_) => Ok(false),
                Entry::Vacant(vacant) => {
                    vacant.insert(Self::entry(value, ttl));
                    Ok(true)
                }
            }
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            self.entries.insert(key.to_owned(), Self::entry(value, ttl));
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>> {
        Box::pin(async move {
            Ok(self
                .entries
                .get(key)
                .filter(|e| e.live())
                .map(|e| e.value.clone()))
        })
    }

    fn del<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), KvError>> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }

    fn decr_if_positive<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let mut consumed = false;
            self.entries.entry(key.to_owned()).and_modify(|existing| {
                let current: i64 = existing
                    .live()
                    .then(|| existing.value.parse().ok())
                    .flatten()
                    .unwrap_or(0);
                if current > 0 {
                    existing.value = (current - 1).to_string();
                    consumed = true;
                }
            });
            Ok(consumed)
        })
    }

    fn incr_capped<'a>(
        &'a self,
        key: &'a str,
        cap: i64,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<i64, KvError>> {
        Box::pin(async move {
            match self.entries.entry(key.to_owned()) {
                Entry::Occupied(mut occupied) => {
                    let current: i64 = occupied
                        .get()
                        .live()
                        .then(|| occupied.get().value.parse().ok())
                        .flatten()
                        .unwrap_or(0);
                    let count = if current < cap { current + 1 } else { current };
                    occupied.insert(Self::entry(&count.to_string(), ttl));
                    Ok(count)
                }
                Entry::Vacant(vacant) => {
                    let count = 1i64.min(cap);
                    vacant.insert(Self::entry(&count.to_string(), ttl));
                    Ok(count)
                }
            }
        })
    }
}
