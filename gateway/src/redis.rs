use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

/// The counter store: a key-value service holding live engagement counters.
///
/// Only the handful of commands the engagement service needs are exposed, which keeps the seam
/// narrow enough to swap in the in-memory mock below and inject failures in tests.
#[async_trait]
pub trait CounterStore {
    /// Atomically add one to `key`, creating it at zero first. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64>;
    /// Read a single counter. An absent key reads as 0.
    async fn get(&self, key: &str) -> Result<i64>;
    /// Read many counters in one round trip, positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>>;
    /// Overwrite a counter, without expiry.
    async fn set(&self, key: &str, value: i64) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}

pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    /// Does not connect: every command opens its own connection, so a redis outage at startup
    /// only degrades engagement numbers instead of stopping the gateway.
    pub fn new(addr: String) -> Result<RedisCounterStore> {
        let client = redis::Client::open(addr)?;

        Ok(RedisCounterStore { client })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.client.get_async_connection().await?;
        let value: i64 = conn.incr(key, 1).await?;

        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let mut conn = self.client.get_async_connection().await?;
        let value: Option<i64> = conn.get(key).await?;

        Ok(value.unwrap_or(0))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.client.get_async_connection().await?;
        // Explicit MGET: AsyncCommands::get degrades to GET for a single key and would not return
        // a list.
        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        Ok(values)
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        conn.set::<_, _, ()>(key, value).await?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.client.get_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(())
    }
}

// mockall gets awkward with async traits returning slices of options, so this one is hand-rolled
/// In-memory counter store. Values are kept as raw strings, like redis does, so tests can plant
/// malformed values.
#[derive(Clone, Default)]
pub struct MockCounterStore {
    values: Arc<Mutex<HashMap<String, String>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MockCounterStore {
    pub fn new() -> MockCounterStore {
        MockCounterStore::default()
    }

    pub fn fail_reads(self, fail: bool) -> Self {
        self.fail_reads.store(fail, Ordering::SeqCst);
        self
    }

    pub fn fail_writes(self, fail: bool) -> Self {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self
    }

    pub async fn set_raw(&self, key: &str, raw: &str) {
        self.values
            .lock()
            .await
            .insert(key.to_string(), raw.to_string());
    }

    pub async fn raw(&self, key: &str) -> Option<String> {
        self.values.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.values.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.lock().await.is_empty()
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(anyhow!("mock counter store refused {op}"));
        }

        Ok(())
    }

    fn parse(key: &str, raw: &str) -> Result<i64> {
        raw.parse()
            .map_err(|_| anyhow!("value at {key} is not an integer: {raw:?}"))
    }
}

#[async_trait]
impl CounterStore for MockCounterStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        Self::check(&self.fail_writes, "incr")?;

        // Held across the read-modify-write, which is what makes this atomic.
        let mut values = self.values.lock().await;
        let current = match values.get(key) {
            Some(raw) => Self::parse(key, raw)?,
            None => 0,
        };
        let next = current + 1;
        values.insert(key.to_string(), next.to_string());

        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        Self::check(&self.fail_reads, "get")?;

        match self.values.lock().await.get(key) {
            Some(raw) => Self::parse(key, raw),
            None => Ok(0),
        }
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        Self::check(&self.fail_reads, "mget")?;

        let values = self.values.lock().await;
        keys.iter()
            .map(|key| {
                values
                    .get(key)
                    .map(|raw| Self::parse(key, raw))
                    .transpose()
            })
            .collect()
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        Self::check(&self.fail_writes, "set")?;

        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Self::check(&self.fail_reads, "ping")
    }
}

#[cfg(test)]
mod tests {
    use crate::redis::{CounterStore, MockCounterStore};

    #[tokio::test]
    async fn absent_keys_read_as_zero() {
        let store = MockCounterStore::new();

        assert_eq!(store.get("video:1:likes").await.unwrap(), 0);
        assert_eq!(
            store
                .mget(&[String::from("video:1:likes"), String::from("video:1:comments")])
                .await
                .unwrap(),
            vec![None, None]
        );
    }

    #[tokio::test]
    async fn mget_is_positionally_aligned() {
        let store = MockCounterStore::new();
        store.set("b", 2).await.unwrap();
        store.incr("c").await.unwrap();

        let values = store
            .mget(&[String::from("a"), String::from("b"), String::from("c")])
            .await
            .unwrap();

        assert_eq!(values, vec![None, Some(2), Some(1)]);
    }

    #[tokio::test]
    async fn malformed_values_fail_reads() {
        let store = MockCounterStore::new();
        store.set_raw("video:1:likes", "lots").await;

        assert!(store.get("video:1:likes").await.is_err());
        assert!(store.mget(&[String::from("video:1:likes")]).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_split_by_direction() {
        let store = MockCounterStore::new().fail_reads(true);

        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
        assert_eq!(store.incr("k").await.unwrap(), 1);

        let store = store.fail_reads(false).fail_writes(true);
        assert!(store.incr("k").await.is_err());
        assert_eq!(store.get("k").await.unwrap(), 1);
    }
}
