// src/auction/engine.rs

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::time::Duration;
use tracing::{error, warn};

use crate::auction::classify::Classifier;
use crate::auction::fanout::{Envelope, Fanout};
use crate::auction::inbox::BidInbox;
use crate::auction::selection;
use crate::error::AuctionError;
use crate::ledger::service::{mint_serve_token, LedgerService};
use crate::logging::audit::{AuctionLog, AuditLogger};
use crate::model::bid::BidSubmission;
use crate::model::bidder::BidderRegistry;
use crate::model::context::ContextRequest;
use crate::model::result::{AuctionResult, WinnerSummary};
use crate::storage::StorageError;
use crate::transport::canonical::canonical_hash;
use crate::transport::timestamps::parse_timestamp;

const PERSIST_ATTEMPTS: usize = 3;

/// 竞拍执行器：开窗、发布、收单、关窗、选择、落账、返回。
/// 出价不在这里进来，而是经由签名端点落进 BidInbox 的槽位。
pub struct AuctionRunner {
    registry: Arc<BidderRegistry>,
    fanout: Arc<dyn Fanout>,
    ledger: Arc<LedgerService>,
    inbox: Arc<BidInbox>,
    classifier: Classifier,
    window: Duration,
    publish_timeout: Duration,
    audit: Arc<AuditLogger>,
    settled: AtomicU64,
}

impl AuctionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<BidderRegistry>,
        fanout: Arc<dyn Fanout>,
        ledger: Arc<LedgerService>,
        inbox: Arc<BidInbox>,
        classifier: Classifier,
        window_ms: u64,
        publish_timeout_ms: u64,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            registry,
            fanout,
            ledger,
            inbox,
            classifier,
            window: Duration::from_millis(window_ms),
            publish_timeout: Duration::from_millis(publish_timeout_ms),
            audit,
            settled: AtomicU64::new(0),
        }
    }

    pub fn inbox(&self) -> &BidInbox {
        &self.inbox
    }

    pub fn settled_count(&self) -> u64 {
        self.settled.load(Ordering::Relaxed)
    }

    pub async fn run(&self, context: ContextRequest) -> Result<AuctionResult, AuctionError> {
        self.run_with_window(context, self.window).await
    }

    /// 跑完一整场竞拍。weave 协调器会传入自己的（更宽的）窗口。
    pub async fn run_with_window(
        &self,
        context: ContextRequest,
        window: Duration,
    ) -> Result<AuctionResult, AuctionError> {
        validate_context(&context)?;
        let auction_id = context.request_id.clone();

        // 已经结算过的 request_id 不允许重放
        if self
            .ledger
            .get_record(&auction_id)
            .await
            .map_err(|e| AuctionError::StorageUnavailable(e.to_string()))?
            .is_some()
        {
            return Err(AuctionError::Conflict(auction_id));
        }

        // 调用方显式给了池就用调用方的，否则走关键词分类
        let pools = match &context.pools {
            Some(explicit) if !explicit.is_empty() => explicit.clone(),
            _ => self.classifier.classify(&context.query_text),
        };
        let target_bidders: BTreeSet<String> = self
            .registry
            .filter_by_pools(&pools)
            .iter()
            .map(|b| b.name.clone())
            .collect();

        // 进行中的同名竞拍在这里冲突
        let slot = self.inbox.open(&auction_id, target_bidders.clone(), window)?;

        // 没有任何目标出价方时跳过发布，直接走 no_bid 路径
        if !target_bidders.is_empty() {
            self.publish_envelopes(&context, &pools, window);
        }

        slot.wait_window().await;
        let bids = slot.close();

        let serve_token = mint_serve_token();
        let winner = selection::select_winner(&bids).map(|bid| WinnerSummary {
            bidder: bid.bidder.clone(),
            price: bid.price,
            clearing_price: selection::clearing_price(&bids, bid),
            pricing_model: bid.pricing_model,
            creative: bid.creative.clone(),
        });

        let target_list: Vec<String> = target_bidders.iter().cloned().collect();
        let persisted = self
            .persist_outcome(
                &context,
                &pools,
                &target_list,
                &serve_token,
                &bids,
                winner.as_ref(),
            )
            .await;

        slot.settle();
        self.inbox.remove(&auction_id);
        self.settled.fetch_add(1, Ordering::Relaxed);

        let mut entry = AuctionLog::new(&auction_id, &pools, target_list.len());
        entry.context_hash = canonical_hash(&context).unwrap_or_default();
        entry.window_elapsed_ms = slot.opened_at().elapsed().as_millis();
        entry.persisted = persisted;
        for bid in &bids {
            entry.add_bid(&bid.bidder, bid.price, bid.pricing_model.as_str());
        }
        if let Some(winner) = &winner {
            entry.set_winner(&winner.bidder, winner.price, winner.clearing_price);
        }
        self.audit.log(&entry).await;

        let mut result = match winner {
            Some(winner) => AuctionResult::won(auction_id, serve_token, winner),
            None => AuctionResult::no_bid(auction_id, serve_token),
        };
        result.persisted = persisted;
        Ok(result)
    }

    /// 向每个目标池发布信封。发布是尽力而为：任务直接脱钩，
    /// 单次发布被限制在 publish_timeout 内，失败只记日志，绝不拖累竞拍。
    fn publish_envelopes(&self, context: &ContextRequest, pools: &[String], window: Duration) {
        let deadline = (Utc::now()
            + chrono::Duration::milliseconds(window.as_millis() as i64))
        .to_rfc3339();
        for pool in pools {
            let envelope = Envelope {
                auction_id: context.request_id.clone(),
                context_request: context.clone(),
                window_deadline: deadline.clone(),
            };
            let fanout = self.fanout.clone();
            let publish_timeout = self.publish_timeout;
            let pool = pool.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(publish_timeout, fanout.publish(&pool, &envelope)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(pool = %pool, error = %e, "fanout publish failed");
                    }
                    Err(_) => {
                        warn!(pool = %pool, auction_id = %envelope.auction_id, "fanout publish timed out");
                    }
                }
            });
        }
    }

    /// 有界重试的落账。彻底失败时竞拍照样返回计算出的结果，
    /// 但带上 persisted=false 并打一条显眼的错误日志。
    async fn persist_outcome(
        &self,
        context: &ContextRequest,
        pools: &[String],
        target_bidders: &[String],
        serve_token: &str,
        bids: &[BidSubmission],
        winner: Option<&WinnerSummary>,
    ) -> bool {
        for attempt in 1..=PERSIST_ATTEMPTS {
            let result: Result<(), StorageError> = async {
                self.ledger
                    .create_record(context, pools, target_bidders, serve_token)
                    .await?;
                self.ledger
                    .settle(&context.request_id, bids, winner)
                    .await?;
                Ok(())
            }
            .await;
            match result {
                Ok(()) => return true,
                Err(err) if attempt < PERSIST_ATTEMPTS => {
                    let backoff = rand::thread_rng().gen_range(10..40) * attempt as u64;
                    warn!(
                        auction_id = %context.request_id,
                        attempt,
                        error = %err,
                        "ledger write failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    error!(
                        auction_id = %context.request_id,
                        error = %err,
                        "ledger write failed permanently, returning unpersisted result"
                    );
                    return false;
                }
            }
        }
        false
    }
}

fn validate_context(context: &ContextRequest) -> Result<(), AuctionError> {
    for (field, value) in [
        ("request_id", &context.request_id),
        ("session_id", &context.session_id),
        ("platform_id", &context.platform_id),
        ("query_text", &context.query_text),
    ] {
        if value.trim().is_empty() {
            return Err(AuctionError::SchemaInvalid(format!(
                "{} must not be empty",
                field
            )));
        }
    }
    parse_timestamp(&context.timestamp)
        .map_err(|e| AuctionError::SchemaInvalid(format!("timestamp: {}", e)))?;
    Ok(())
}
