// src/storage/mod.rs

pub mod firestore;
pub mod in_memory;
pub mod postgres;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::{LedgerBackend, ServerConfig};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} already exists")]
    AlreadyExists(String),
    #[error("stored payload is corrupt: {0}")]
    Corrupt(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// 读-改-写闭包。后端在乐观并发冲突时可能重试调用，所以是 `Fn` 而不是 `FnOnce`；
/// 闭包必须只依赖入参，不得有副作用。
pub type JsonMutator = Box<dyn Fn(Option<Value>) -> Result<Value, StorageError> + Send + Sync>;

/// 核心依赖的最小存储能力集。后端类型不允许泄漏到上层。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 无条件写入
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// 读取，键不存在时返回 None
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// 按键原子的读-改-写。同一键上的并发 update 必须串行化。
    async fn update(&self, key: &str, mutator: JsonMutator) -> Result<Value, StorageError>;

    /// 原子地把一个事件追加到记录的 `events` 数组
    async fn append_event(&self, key: &str, event: Value) -> Result<Value, StorageError> {
        let key_owned = key.to_string();
        self.update(
            key,
            Box::new(move |current| {
                let mut record = current.ok_or_else(|| StorageError::NotFound(key_owned.clone()))?;
                let map = record.as_object_mut().ok_or_else(|| {
                    StorageError::Corrupt(format!("record {} is not an object", key_owned))
                })?;
                map.entry("events")
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .ok_or_else(|| {
                        StorageError::Corrupt(format!("record {} events is not an array", key_owned))
                    })?
                    .push(event.clone());
                Ok(record)
            }),
        )
        .await
    }
}

/// 按配置构建账本后端
pub async fn build_storage(config: &ServerConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let ledger = &config.ledger;
    match ledger.backend {
        LedgerBackend::InMemory => Ok(Arc::new(in_memory::InMemoryStorage::new())),
        LedgerBackend::Redis => {
            let url = ledger
                .url
                .as_deref()
                .ok_or_else(|| StorageError::Unavailable("redis url missing".to_string()))?;
            let backend = redis::RedisStorage::connect(url, &ledger.key_prefix).await?;
            Ok(Arc::new(backend))
        }
        LedgerBackend::Postgres => {
            let url = ledger
                .url
                .as_deref()
                .ok_or_else(|| StorageError::Unavailable("postgres url missing".to_string()))?;
            let backend = postgres::PostgresStorage::connect_and_migrate(url).await?;
            Ok(Arc::new(backend))
        }
        LedgerBackend::Firestore => {
            let project = ledger
                .project
                .as_deref()
                .ok_or_else(|| StorageError::Unavailable("firestore project missing".to_string()))?;
            Ok(Arc::new(firestore::FirestoreStorage::new(
                project,
                ledger.endpoint.as_deref(),
                ledger.auth_token.as_deref(),
            )))
        }
    }
}
