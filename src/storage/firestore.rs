// src/storage/firestore.rs

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{JsonMutator, Storage, StorageError};

const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com/v1";
const MAX_PRECONDITION_RETRIES: usize = 8;

/// 文档型后端，直接走 Firestore 的 REST 文档接口（不依赖厂商 SDK）。
/// 记录整体以 JSON 字符串存进文档的 `data` 字段；
/// update 的原子性靠 `currentDocument` 前置条件（exists / updateTime）加重试实现。
pub struct FirestoreStorage {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl FirestoreStorage {
    pub fn new(project: &str, endpoint: Option<&str>, auth_token: Option<&str>) -> Self {
        let root = endpoint.unwrap_or(DEFAULT_ENDPOINT).trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            base_url: format!(
                "{}/projects/{}/databases/(default)/documents",
                root, project
            ),
            auth_token: auth_token.map(|t| t.to_string()),
        }
    }

    /// `ledger:{id}` -> ledger_records/{id}
    /// `recommendation:{s}:{m}` -> recommendations/{s}:{m}
    fn document_url(&self, key: &str) -> Result<String, StorageError> {
        if let Some(id) = key.strip_prefix("ledger:") {
            return Ok(format!("{}/ledger_records/{}", self.base_url, id));
        }
        if let Some(id) = key.strip_prefix("recommendation:") {
            return Ok(format!("{}/recommendations/{}", self.base_url, id));
        }
        Err(StorageError::Corrupt(format!(
            "unsupported storage key shape: {}",
            key
        )))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn document_body(value: &Value) -> Value {
        json!({
            "fields": {
                "data": { "stringValue": value.to_string() }
            }
        })
    }

    fn decode(key: &str, document: &Value) -> Result<Value, StorageError> {
        let raw = document
            .pointer("/fields/data/stringValue")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::Corrupt(format!("{}: document missing data field", key)))?;
        serde_json::from_str(raw).map_err(|e| StorageError::Corrupt(format!("{}: {}", key, e)))
    }

    /// 读文档，返回 (记录, updateTime)；404 视为不存在
    async fn fetch(&self, key: &str) -> Result<Option<(Value, String)>, StorageError> {
        let url = self.document_url(key)?;
        let response = self
            .request(self.client.get(&url))
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "firestore get {}: {}",
                key,
                response.status()
            )));
        }
        let document: Value = response
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let update_time = document
            .get("updateTime")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Some((Self::decode(key, &document)?, update_time)))
    }

    /// 带前置条件的写入；返回 false 表示条件冲突，调用方重读重试
    async fn write(
        &self,
        key: &str,
        value: &Value,
        precondition: Option<(&str, &str)>,
    ) -> Result<bool, StorageError> {
        let url = self.document_url(key)?;
        let mut request = self.client.patch(&url).json(&Self::document_body(value));
        if let Some((field, expected)) = precondition {
            request = request.query(&[(field, expected)]);
        }
        let response = self
            .request(request)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(StorageError::Unavailable(format!(
                "firestore write {}: {}",
                key, status
            )));
        }
        Ok(true)
    }
}

#[async_trait]
impl Storage for FirestoreStorage {
    async fn put(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.write(key, &value, None).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.fetch(key).await?.map(|(value, _)| value))
    }

    async fn update(&self, key: &str, mutator: JsonMutator) -> Result<Value, StorageError> {
        for _ in 0..MAX_PRECONDITION_RETRIES {
            match self.fetch(key).await? {
                None => {
                    let next = mutator(None)?;
                    if self
                        .write(key, &next, Some(("currentDocument.exists", "false")))
                        .await?
                    {
                        return Ok(next);
                    }
                }
                Some((current, update_time)) => {
                    let next = mutator(Some(current))?;
                    if self
                        .write(
                            key,
                            &next,
                            Some(("currentDocument.updateTime", update_time.as_str())),
                        )
                        .await?
                    {
                        return Ok(next);
                    }
                }
            }
            // 前置条件冲突：重读重试
        }
        Err(StorageError::Unavailable(format!(
            "firestore precondition on {} kept conflicting",
            key
        )))
    }
}
