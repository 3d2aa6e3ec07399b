// src/storage/redis.rs

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;

use super::{JsonMutator, Storage, StorageError};

const MAX_TXN_RETRIES: usize = 16;

/// 远端键值缓存后端。
/// update 走 WATCH/MULTI/EXEC 乐观事务：EXEC 返回 nil 说明键在事务间被改过，
/// 重读重算。WATCH 绑定单个连接，所以读-改-写每次都申请独立连接，
/// 不能复用多路复用连接。
pub struct RedisStorage {
    client: redis::Client,
    prefix: String,
}

impl RedisStorage {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        // 连接探测，失败让启动失败
        let mut conn = client
            .get_async_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            prefix: prefix.trim_end_matches(':').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StorageError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    fn decode(key: &str, raw: Option<String>) -> Result<Option<Value>, StorageError> {
        match raw {
            None => Ok(None),
            Some(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", key, e))),
        }
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        conn.set(self.full_key(key), value.to_string())
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.full_key(key))
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Self::decode(key, raw)
    }

    async fn update(&self, key: &str, mutator: JsonMutator) -> Result<Value, StorageError> {
        let full_key = self.full_key(key);
        let mut conn = self.connection().await?;
        for _ in 0..MAX_TXN_RETRIES {
            redis::cmd("WATCH")
                .arg(&full_key)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            let raw: Option<String> = conn
                .get(&full_key)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            let current = Self::decode(key, raw)?;
            let next = match mutator(current) {
                Ok(next) => next,
                Err(err) => {
                    // 放弃事务，把领域错误原样抛出
                    let _: Result<(), _> =
                        redis::cmd("UNWATCH").query_async(&mut conn).await;
                    return Err(err);
                }
            };
            let committed: Option<()> = redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&full_key)
                .arg(next.to_string())
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            if committed.is_some() {
                return Ok(next);
            }
            // EXEC 返回 nil：键被并发修改，重试
        }
        Err(StorageError::Unavailable(format!(
            "optimistic transaction on {} kept conflicting",
            key
        )))
    }
}
