// src/weave/service.rs

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{error, info};

use crate::auction::engine::AuctionRunner;
use crate::error::AuctionError;
use crate::model::context::ContextRequest;
use crate::model::result::AuctionResult;
use crate::storage::{Storage, StorageError};

const RETRY_AFTER_MS: u64 = 150;

/// /v1/weave/recommendations 请求体
#[derive(Deserialize, Debug, Clone)]
pub struct WeaveRequest {
    pub session_id: String,
    pub message_id: String,
    pub query: Option<String>,
}

/// 三态轮询响应：completed 直接带创意，in_progress 让调用方稍后再来
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WeaveResponse {
    Completed {
        weave_content: String,
        serve_token: Option<String>,
        creative_metadata: Value,
    },
    InProgress {
        retry_after_ms: u64,
    },
    Failed {
        error: String,
    },
}

/// 缓存优先的推荐协调器。请求本身从不阻塞在竞拍上：
/// 第一跳原子建一条 in_progress 记录并调度后台竞拍，后续轮询读缓存。
/// 后台任务池有界（Semaphore），生命周期归服务所有，与调用方连接无关。
pub struct WeaveService {
    storage: Arc<dyn Storage>,
    runner: Arc<AuctionRunner>,
    window: Duration,
    task_timeout: Duration,
    limiter: Arc<Semaphore>,
    max_concurrency: usize,
}

fn recommendation_key(session_id: &str, message_id: &str) -> String {
    format!("recommendation:{}:{}", session_id, message_id)
}

enum CachePath {
    Created,
    Existing(Value),
}

impl WeaveService {
    pub fn new(
        storage: Arc<dyn Storage>,
        runner: Arc<AuctionRunner>,
        window_ms: u64,
        max_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            runner,
            window: Duration::from_millis(window_ms),
            // 后台任务的硬超时：竞拍窗口之外留出落账与格式化的余量
            task_timeout: Duration::from_millis(window_ms * 2 + 1_000),
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        })
    }

    pub async fn get_or_create(
        self: &Arc<Self>,
        request: WeaveRequest,
    ) -> Result<WeaveResponse, AuctionError> {
        if request.session_id.trim().is_empty() || request.message_id.trim().is_empty() {
            return Err(AuctionError::SchemaInvalid(
                "session_id and message_id must not be empty".to_string(),
            ));
        }

        let key = recommendation_key(&request.session_id, &request.message_id);
        let path: Arc<Mutex<Option<CachePath>>> = Arc::new(Mutex::new(None));
        let path_slot = path.clone();
        let fresh = json!({
            "session_id": request.session_id,
            "message_id": request.message_id,
            "query": request.query,
            "status": "in_progress",
            "created_at": Utc::now().to_rfc3339(),
            "updated_at": Utc::now().to_rfc3339(),
        });

        // create-if-absent 与读取走同一次原子 update；
        // 并发的首次请求里只有一个会拿到 Created，其余落到 Existing
        self.storage
            .update(
                &key,
                Box::new(move |current| match current {
                    None => {
                        *path_slot.lock().unwrap() = Some(CachePath::Created);
                        Ok(fresh.clone())
                    }
                    Some(existing) => {
                        *path_slot.lock().unwrap() = Some(CachePath::Existing(existing.clone()));
                        Ok(existing)
                    }
                }),
            )
            .await
            .map_err(|e| AuctionError::StorageUnavailable(e.to_string()))?;

        let decided = path.lock().unwrap().take();
        match decided {
            Some(CachePath::Existing(record)) => Ok(Self::response_from_record(&record)),
            Some(CachePath::Created) => {
                self.spawn_background_auction(request);
                Ok(WeaveResponse::InProgress {
                    retry_after_ms: RETRY_AFTER_MS,
                })
            }
            None => Err(AuctionError::Internal(
                "recommendation lookup finished without a decision".to_string(),
            )),
        }
    }

    fn response_from_record(record: &Value) -> WeaveResponse {
        match record.get("status").and_then(Value::as_str) {
            Some("completed") => WeaveResponse::Completed {
                weave_content: record
                    .get("weave_content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                serve_token: record
                    .get("serve_token")
                    .and_then(Value::as_str)
                    .map(|t| t.to_string()),
                creative_metadata: record
                    .get("creative_metadata")
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            },
            Some("failed") => WeaveResponse::Failed {
                error: record
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("auction failed")
                    .to_string(),
            },
            _ => WeaveResponse::InProgress {
                retry_after_ms: RETRY_AFTER_MS,
            },
        }
    }

    /// 调度后台竞拍。失败永远不回传给发起调用，只会在后续轮询里看到。
    fn spawn_background_auction(self: &Arc<Self>, request: WeaveRequest) {
        let service = self.clone();
        tokio::spawn(async move {
            let permit = match service.limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // 服务正在停机
            };
            let session_id = request.session_id.clone();
            let message_id = request.message_id.clone();
            info!(session_id = %session_id, message_id = %message_id, "weave auction started");

            let updates = match tokio::time::timeout(
                service.task_timeout,
                service.run_background_auction(&request),
            )
            .await
            {
                Ok(Ok(updates)) => updates,
                Ok(Err(err)) => {
                    error!(
                        session_id = %session_id,
                        message_id = %message_id,
                        error = %err,
                        "weave auction failed"
                    );
                    json!({ "status": "failed", "error": err.to_string() })
                }
                Err(_) => {
                    error!(
                        session_id = %session_id,
                        message_id = %message_id,
                        "weave auction timed out"
                    );
                    json!({ "status": "failed", "error": "background auction timed out" })
                }
            };

            if let Err(err) = service
                .apply_updates(&session_id, &message_id, updates)
                .await
            {
                error!(
                    session_id = %session_id,
                    message_id = %message_id,
                    error = %err,
                    "failed to update recommendation record"
                );
            }
            drop(permit);
        });
    }

    async fn run_background_auction(
        &self,
        request: &WeaveRequest,
    ) -> Result<Value, AuctionError> {
        let context = build_context_request(request);
        let result = self.runner.run_with_window(context, self.window).await?;
        let (weave_content, creative_metadata) = format_weave_creative(&result);
        Ok(json!({
            "status": "completed",
            "weave_content": weave_content,
            "serve_token": result.serve_token,
            "creative_metadata": creative_metadata,
            "auction_result": serde_json::to_value(&result)
                .map_err(|e| AuctionError::Internal(e.to_string()))?,
        }))
    }

    /// 终态记录不可变：只有 in_progress 的记录才接受更新
    async fn apply_updates(
        &self,
        session_id: &str,
        message_id: &str,
        updates: Value,
    ) -> Result<(), StorageError> {
        let key = recommendation_key(session_id, message_id);
        let key_for_mutator = key.clone();
        self.storage
            .update(
                &key,
                Box::new(move |current| {
                    let mut record = current
                        .ok_or_else(|| StorageError::NotFound(key_for_mutator.clone()))?;
                    if record.get("status").and_then(Value::as_str) != Some("in_progress") {
                        return Ok(record);
                    }
                    if let (Some(target), Some(source)) =
                        (record.as_object_mut(), updates.as_object())
                    {
                        for (field, value) in source {
                            target.insert(field.clone(), value.clone());
                        }
                        target.insert(
                            "updated_at".to_string(),
                            json!(Utc::now().to_rfc3339()),
                        );
                    }
                    Ok(record)
                }),
            )
            .await?;
        Ok(())
    }

    /// 停机排空：拿满所有并发额度，等价于等全部在飞任务写完终态
    pub async fn drain(&self) {
        let _ = self
            .limiter
            .acquire_many(self.max_concurrency as u32)
            .await;
    }
}

fn build_context_request(request: &WeaveRequest) -> ContextRequest {
    let query = request
        .query
        .clone()
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| "general recommendation".to_string());
    ContextRequest {
        request_id: format!("ctx_{}", request.message_id),
        session_id: request.session_id.clone(),
        platform_id: "weave".to_string(),
        query_text: query,
        locale: None,
        geo: None,
        timestamp: Utc::now().to_rfc3339(),
        auth: None,
        pools: None,
    }
}

/// 把胜者创意排版成 weave 文本：首行是产品与描述，每个链接单独一行，
/// 所有行都带 [Ad] 标注。no_bid 时内容为空。
fn format_weave_creative(result: &AuctionResult) -> (String, Value) {
    let winner = match &result.winner {
        Some(winner) => winner,
        None => return (String::new(), json!({})),
    };
    let creative = winner.creative.clone().unwrap_or_else(|| json!({}));
    let brand_name = creative
        .get("brand_name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let product_name = creative
        .get("product_name")
        .and_then(Value::as_str)
        .unwrap_or(winner.bidder.as_str());
    let description = creative
        .get("descriptions")
        .and_then(Value::as_array)
        .and_then(|d| d.first())
        .and_then(Value::as_str)
        .unwrap_or_default();
    let urls: Vec<&str> = creative
        .get("resource_urls")
        .and_then(Value::as_array)
        .map(|u| u.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut lines = Vec::new();
    if description.is_empty() {
        lines.push(format!("[Ad] {}", product_name));
    } else {
        lines.push(format!("[Ad] {} - {}", product_name, description));
    }
    for url in &urls {
        lines.push(format!("[Ad] Learn more: {}", url));
    }

    let metadata = json!({
        "brand_name": brand_name,
        "product_name": product_name,
        "description": description,
        "urls": urls,
    });
    (lines.join("\n"), metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::classify::Classifier;
    use crate::auction::fanout::LocalFanout;
    use crate::auction::inbox::BidInbox;
    use crate::config::settings::ClassifierConfig;
    use crate::ledger::service::LedgerService;
    use crate::logging::audit::AuditLogger;
    use crate::model::bid::PricingModel;
    use crate::model::bidder::BidderRegistry;
    use crate::model::result::WinnerSummary;
    use crate::storage::in_memory::InMemoryStorage;

    fn test_service() -> (Arc<WeaveService>, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let ledger = Arc::new(LedgerService::new(storage.clone()));
        let audit_dir = std::env::temp_dir().join("aip-weave-tests");
        let audit = AuditLogger::new(audit_dir.to_str().unwrap(), "audit_test", 64, 16, 1000);
        let runner = Arc::new(AuctionRunner::new(
            Arc::new(BidderRegistry::from_bidders(vec![]).unwrap()),
            Arc::new(LocalFanout),
            ledger,
            Arc::new(BidInbox::new()),
            Classifier::new(&ClassifierConfig::default()),
            50,
            10,
            audit,
        ));
        (WeaveService::new(storage.clone(), runner, 50, 4), storage)
    }

    fn request(session: &str, message: &str) -> WeaveRequest {
        WeaveRequest {
            session_id: session.to_string(),
            message_id: message.to_string(),
            query: Some("running shoes".to_string()),
        }
    }

    #[tokio::test]
    async fn first_call_is_in_progress_then_completes() {
        let (service, _) = test_service();
        let first = service
            .get_or_create(request("sess_1", "msg_1"))
            .await
            .unwrap();
        assert!(matches!(
            first,
            WeaveResponse::InProgress { retry_after_ms: 150 }
        ));

        // 轮询直到后台竞拍（无出价方，秒结 no_bid）写入终态
        let mut completed = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            match service.get_or_create(request("sess_1", "msg_1")).await.unwrap() {
                WeaveResponse::Completed {
                    weave_content,
                    serve_token,
                    ..
                } => {
                    completed = Some((weave_content, serve_token));
                    break;
                }
                WeaveResponse::InProgress { .. } => continue,
                WeaveResponse::Failed { error } => panic!("weave failed: {}", error),
            }
        }
        let (weave_content, serve_token) = completed.expect("auction should complete");
        // no_bid：空创意但 serve_token 照常铸造
        assert_eq!(weave_content, "");
        assert!(serve_token.unwrap().starts_with("stk_"));
    }

    #[tokio::test]
    async fn in_progress_record_does_not_retrigger() {
        let (service, storage) = test_service();
        storage
            .put(
                "recommendation:sess_2:msg_2",
                json!({"session_id": "sess_2", "message_id": "msg_2", "status": "in_progress"}),
            )
            .await
            .unwrap();
        let response = service
            .get_or_create(request("sess_2", "msg_2"))
            .await
            .unwrap();
        assert!(matches!(response, WeaveResponse::InProgress { .. }));
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let (service, storage) = test_service();
        storage
            .put(
                "recommendation:sess_3:msg_3",
                json!({"status": "completed", "weave_content": "[Ad] kept"}),
            )
            .await
            .unwrap();
        service
            .apply_updates(
                "sess_3",
                "msg_3",
                json!({"status": "failed", "error": "late failure"}),
            )
            .await
            .unwrap();
        let record = storage
            .get("recommendation:sess_3:msg_3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["status"], "completed");
        assert_eq!(record["weave_content"], "[Ad] kept");
    }

    #[tokio::test]
    async fn failed_record_is_reported_on_poll() {
        let (service, storage) = test_service();
        storage
            .put(
                "recommendation:sess_4:msg_4",
                json!({"status": "failed", "error": "boom"}),
            )
            .await
            .unwrap();
        let response = service
            .get_or_create(request("sess_4", "msg_4"))
            .await
            .unwrap();
        assert!(matches!(response, WeaveResponse::Failed { error } if error == "boom"));
    }

    #[test]
    fn weave_creative_prefixes_every_link() {
        let result = AuctionResult::won(
            "ctx_1".to_string(),
            "stk_x".to_string(),
            WinnerSummary {
                bidder: "alpha".to_string(),
                price: 1.0,
                clearing_price: 1.0,
                pricing_model: PricingModel::CPC,
                creative: Some(json!({
                    "brand_name": "Acme",
                    "product_name": "Acme Runners",
                    "descriptions": ["Light trail shoes."],
                    "resource_urls": ["https://acme.example/run", "https://acme.example/sale"],
                })),
            },
        );
        let (content, metadata) = format_weave_creative(&result);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|line| line.starts_with("[Ad]")));
        assert_eq!(lines[0], "[Ad] Acme Runners - Light trail shoes.");
        assert_eq!(metadata["brand_name"], "Acme");

        let no_bid = AuctionResult::no_bid("ctx_2".to_string(), "stk_y".to_string());
        let (content, metadata) = format_weave_creative(&no_bid);
        assert_eq!(content, "");
        assert_eq!(metadata, json!({}));
    }
}
