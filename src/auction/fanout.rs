// src/auction/fanout.rs

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::settings::{FanoutBackend, FanoutConfig};
use crate::model::context::ContextRequest;

/// 发布到分类池的信封。出价方从自己的订阅里拿到它，
/// 在 window_deadline 之前把签名出价投回 /aip/bid-response。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    pub auction_id: String,
    pub context_request: ContextRequest,
    pub window_deadline: String, // RFC 3339
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("publish to {pool} failed: {reason}")]
    Publish { pool: String, reason: String },
}

/// 可插拔的发布能力。尽力而为、至多一次；
/// 竞拍的正确性不依赖任何一次发布成功。
#[async_trait]
pub trait Fanout: Send + Sync {
    async fn publish(&self, pool: &str, envelope: &Envelope) -> Result<(), FanoutError>;
}

/// 本地落日志即丢弃的发布端，开发与测试默认
pub struct LocalFanout;

#[async_trait]
impl Fanout for LocalFanout {
    async fn publish(&self, pool: &str, envelope: &Envelope) -> Result<(), FanoutError> {
        info!(
            pool = pool,
            auction_id = %envelope.auction_id,
            deadline = %envelope.window_deadline,
            "fanout (local sink)"
        );
        Ok(())
    }
}

/// pub/sub 推送端：把信封 POST 到 {push_endpoint}/{topic_prefix}{pool}
pub struct PubSubFanout {
    client: reqwest::Client,
    push_endpoint: String,
    topic_prefix: String,
}

impl PubSubFanout {
    pub fn new(push_endpoint: &str, topic_prefix: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            push_endpoint: push_endpoint.trim_end_matches('/').to_string(),
            topic_prefix: topic_prefix.to_string(),
        }
    }
}

#[async_trait]
impl Fanout for PubSubFanout {
    async fn publish(&self, pool: &str, envelope: &Envelope) -> Result<(), FanoutError> {
        let url = format!("{}/{}{}", self.push_endpoint, self.topic_prefix, pool);
        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| FanoutError::Publish {
                pool: pool.to_string(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(FanoutError::Publish {
                pool: pool.to_string(),
                reason: format!("status {}", response.status()),
            });
        }
        Ok(())
    }
}

pub fn build_fanout(config: &FanoutConfig) -> std::sync::Arc<dyn Fanout> {
    match config.backend {
        FanoutBackend::Local => std::sync::Arc::new(LocalFanout),
        FanoutBackend::Pubsub => {
            // validate() 保证 pubsub 模式下 push_endpoint 一定存在
            let endpoint = config.push_endpoint.as_deref().unwrap_or_default();
            std::sync::Arc::new(PubSubFanout::new(endpoint, &config.topic_prefix))
        }
    }
}
