// src/storage/in_memory.rs

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::{JsonMutator, Storage, StorageError};

/// 内存后端，仅限开发与测试：进程退出即丢失。
/// 整张表挂在一把异步锁下，update 天然按键串行，不会丢写。
pub struct InMemoryStorage {
    records: Mutex<HashMap<String, Value>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.records.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn update(&self, key: &str, mutator: JsonMutator) -> Result<Value, StorageError> {
        let mut records = self.records.lock().await;
        let next = mutator(records.get(key).cloned())?;
        records.insert(key.to_string(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn put_get_round_trip() {
        let storage = InMemoryStorage::new();
        storage.put("ledger:a", json!({"n": 1})).await.unwrap();
        assert_eq!(
            storage.get("ledger:a").await.unwrap(),
            Some(json!({"n": 1}))
        );
        assert_eq!(storage.get("ledger:b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.put("counter", json!({"n": 0})).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .update(
                        "counter",
                        Box::new(|current| {
                            let mut value = current.unwrap();
                            let n = value["n"].as_i64().unwrap();
                            value["n"] = json!(n + 1);
                            Ok(value)
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(storage.get("counter").await.unwrap().unwrap()["n"], 100);
    }

    #[tokio::test]
    async fn append_event_keeps_order() {
        let storage = InMemoryStorage::new();
        storage.put("ledger:a", json!({"events": []})).await.unwrap();
        storage
            .append_event("ledger:a", json!({"seq": 1}))
            .await
            .unwrap();
        let record = storage
            .append_event("ledger:a", json!({"seq": 2}))
            .await
            .unwrap();
        let events = record["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["seq"], 1);
        assert_eq!(events[1]["seq"], 2);
    }

    #[tokio::test]
    async fn append_to_missing_record_fails() {
        let storage = InMemoryStorage::new();
        let err = storage
            .append_event("ledger:missing", json!({"seq": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
