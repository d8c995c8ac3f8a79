use crate::types::KernelError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// The shared store as the kernel sees it: string, hash and atomic counter
/// primitives. Both registry scopes bind to one of these each.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KernelError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), KernelError>;
    async fn del(&self, key: &str) -> Result<(), KernelError>;
    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, KernelError>;
    async fn hmget(&self, key: &str, fields: &[String])
        -> Result<Vec<Option<String>>, KernelError>;
    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KernelError>;
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), KernelError>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KernelError>;
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, KernelError>;
}

fn kv_err(e: redis::RedisError) -> KernelError {
    KernelError::Kv(e.to_string())
}

/// Redis-backed store. Holds one multiplexed connection; a request that
/// fails on a dropped connection gets exactly one reconnect-and-retry
/// before the error surfaces.
pub struct RedisKv {
    client: redis::Client,
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisKv {
    pub async fn connect(
        host: &str,
        port: u16,
        db: i64,
        password: Option<String>,
    ) -> Result<Self, KernelError> {
        let client = redis::Client::open(redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host.to_string(), port),
            redis: redis::RedisConnectionInfo {
                db,
                username: None,
                password,
            },
        })
        .map_err(kv_err)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(kv_err)?;
        Ok(RedisKv {
            client,
            conn: Mutex::new(Some(conn)),
        })
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, KernelError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(
                self.client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(kv_err)?,
            );
        }
        let conn = guard.as_mut().expect("kv: connection just installed");
        match cmd.query_async::<_, T>(conn).await {
            Ok(v) => Ok(v),
            Err(e) if e.is_connection_dropped() || e.kind() == redis::ErrorKind::IoError => {
                log::warn!("kv: connection lost, reconnecting once: {e}");
                *guard = None;
                let mut fresh = self
                    .client
                    .get_multiplexed_tokio_connection()
                    .await
                    .map_err(kv_err)?;
                let out = cmd.query_async::<_, T>(&mut fresh).await.map_err(kv_err)?;
                *guard = Some(fresh);
                Ok(out)
            }
            Err(e) => Err(kv_err(e)),
        }
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KernelError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(&cmd).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KernelError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.run::<()>(&cmd).await
    }

    async fn del(&self, key: &str) -> Result<(), KernelError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run::<()>(&cmd).await
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, KernelError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(&cmd).await
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, KernelError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        self.run(&cmd).await
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KernelError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in entries {
            cmd.arg(field).arg(value);
        }
        self.run::<()>(&cmd).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), KernelError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }
        self.run::<()>(&cmd).await
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KernelError> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.run(&cmd).await
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, KernelError> {
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        self.run(&cmd).await
    }
}

/// In-memory store with the same semantics, used by tests and simulations
/// in place of a live redis. Counter updates are atomic per hash.
#[derive(Default)]
pub struct MemKv {
    strings: DashMap<String, String>,
    hashes: DashMap<String, BTreeMap<String, String>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KernelError> {
        Ok(self.strings.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KernelError> {
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), KernelError> {
        self.strings.remove(key);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, KernelError> {
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, KernelError> {
        let hash = self.hashes.get(key);
        Ok(fields
            .iter()
            .map(|f| hash.as_ref().and_then(|h| h.get(f).cloned()))
            .collect())
    }

    async fn hmset(&self, key: &str, entries: &[(String, String)]) -> Result<(), KernelError> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<(), KernelError> {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
        }
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, KernelError> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, KernelError> {
        Ok(self
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_string_ops() {
        let kv = MemKv::new();
        assert_eq!(kv.get("k").await.unwrap(), None);
        kv.set("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mem_hash_ops() {
        let kv = MemKv::new();
        kv.hmset(
            "h",
            &[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
        )
        .await
        .unwrap();
        assert_eq!(
            kv.hmget("h", &["a".to_string(), "c".to_string()])
                .await
                .unwrap(),
            vec![Some("1".to_string()), None]
        );
        assert_eq!(kv.hkeys("h").await.unwrap().len(), 2);
        kv.hdel("h", &["a".to_string()]).await.unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mem_counter_is_atomic() {
        let kv = std::sync::Arc::new(MemKv::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let kv = kv.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..100 {
                    kv.hincrby("h", "id", 1).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(kv.hincrby("h", "id", 0).await.unwrap(), 1600);
    }
}
