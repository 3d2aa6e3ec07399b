use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use crate::error::AuctionError;
use crate::ledger::fsm::EventType;
use crate::model::bid::BidSubmission;
use crate::model::context::ContextRequest;
use crate::model::result::AuctionResult;
use crate::transport::nonces::NonceOutcome;
use crate::transport::signatures::verify_payload;
use crate::transport::timestamps::assert_within_skew;
use crate::weave::service::{WeaveRequest, WeaveResponse};
use crate::AppState;

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, AuctionError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuctionError::SchemaInvalid(format!("{} is required", field)))
}

/// **处理平台上下文请求，跑一整场竞拍**
pub async fn run_auction(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<AuctionResult>, AuctionError> {
    let context: ContextRequest = serde_json::from_value(payload)
        .map_err(|e| AuctionError::SchemaInvalid(e.to_string()))?;

    // 竞拍跑在独立任务里：平台断连不会中止在飞的竞拍，结果照常落账
    let runner = state.runner.clone();
    let outcome = tokio::spawn(async move { runner.run(context).await })
        .await
        .map_err(|e| AuctionError::Internal(e.to_string()))?;
    Ok(Json(outcome?))
}

/// **接收出价方的签名出价**
/// 传输层检查顺序固定：签名 -> 时间戳 -> nonce，三类失败分开上报
pub async fn submit_bid_response(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AuctionError> {
    let bidder_name = required_str(&payload, "bidder")?.to_string();
    let auction_id = required_str(&payload, "auction_id")?.to_string();
    let signature = required_str(&payload, "signature")?.to_string();

    let verifying_key = state
        .registry
        .verifying_key(&bidder_name)
        .ok_or_else(|| AuctionError::SignatureInvalid("bidder is not registered".to_string()))?;
    verify_payload(&payload, &signature, verifying_key)?;

    let timestamp = required_str(&payload, "timestamp")?;
    let ts = assert_within_skew(timestamp, Utc::now(), state.config.transport.max_clock_skew_ms)?;

    let nonce = required_str(&payload, "nonce")?;
    match state.nonces.reserve(&bidder_name, nonce, ts).await {
        NonceOutcome::Reserved => {}
        NonceOutcome::Duplicate => {
            return Err(AuctionError::NonceDuplicate("nonce already seen".to_string()))
        }
        NonceOutcome::Expired => {
            return Err(AuctionError::TimestampOutOfRange(
                "timestamp is older than the nonce ttl horizon".to_string(),
            ))
        }
    }

    let bid: BidSubmission = serde_json::from_value(payload)
        .map_err(|e| AuctionError::SchemaInvalid(e.to_string()))?;
    if !bid.price.is_finite() || bid.price < 0.0 {
        return Err(AuctionError::SchemaInvalid(
            "price must be a non-negative number".to_string(),
        ));
    }

    let slot = state
        .runner
        .inbox()
        .get(&auction_id)
        .ok_or_else(|| AuctionError::UnknownAuction(auction_id.clone()))?;
    slot.submit(bid)?;
    Ok(Json(json!({ "status": "accepted", "auction_id": auction_id })))
}

/// **接收 CPX / CPC / CPA 事件回调**
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Path(event_type): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, AuctionError> {
    let event_type = EventType::from_path(&event_type).ok_or_else(|| {
        AuctionError::SchemaInvalid(format!("unknown event type {}", event_type))
    })?;

    let reporter = required_str(&payload, "reporter")?.to_string();
    let auction_id = required_str(&payload, "auction_id")?.to_string();
    let serve_token = required_str(&payload, "serve_token")?.to_string();
    let signature = required_str(&payload, "signature")?.to_string();

    let verifying_key = state.reporter_key(&reporter).ok_or_else(|| {
        AuctionError::SignatureInvalid(format!("unknown reporter {}", reporter))
    })?;
    verify_payload(&payload, &signature, verifying_key)?;

    let timestamp = required_str(&payload, "timestamp")?.to_string();
    let ts = assert_within_skew(&timestamp, Utc::now(), state.config.transport.max_clock_skew_ms)?;

    let nonce = required_str(&payload, "nonce")?.to_string();
    match state.nonces.reserve(&reporter, &nonce, ts).await {
        NonceOutcome::Reserved => {}
        NonceOutcome::Duplicate => {
            // 事件的幂等重试会带着同一个 nonce 回来。
            // 账本里已有同一 (event_type, nonce) 的就按无操作应答；
            // nonce 被挪用到新内容上才按重放拒绝。
            let record = state
                .ledger
                .get_record(&auction_id)
                .await
                .map_err(|e| AuctionError::StorageUnavailable(e.to_string()))?
                .ok_or_else(|| AuctionError::UnknownAuction(auction_id.clone()))?;
            let replayed_event = record.serve_token == serve_token
                && record.events.iter().any(|event| {
                    event.get("event_type").and_then(Value::as_str)
                        == Some(event_type.as_str())
                        && event.get("nonce").and_then(Value::as_str) == Some(nonce.as_str())
                });
            if replayed_event {
                return Ok(Json(json!({
                    "status": "accepted",
                    "auction_id": auction_id,
                    "event_type": event_type.as_str(),
                    "state": record.status.as_str(),
                    "duplicate": true,
                })));
            }
            return Err(AuctionError::NonceDuplicate("nonce already seen".to_string()));
        }
        NonceOutcome::Expired => {
            return Err(AuctionError::TimestampOutOfRange(
                "timestamp is older than the nonce ttl horizon".to_string(),
            ))
        }
    }

    let outcome = state
        .ledger
        .record_event(
            &auction_id,
            &serve_token,
            event_type,
            &reporter,
            &nonce,
            &timestamp,
        )
        .await?;
    Ok(Json(json!({
        "status": "accepted",
        "auction_id": auction_id,
        "event_type": event_type.as_str(),
        "state": outcome.state().as_str(),
        "duplicate": outcome.is_duplicate(),
    })))
}

/// **推荐入口：缓存优先，后台竞拍**
pub async fn weave_recommendations(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<WeaveResponse>, AuctionError> {
    let request: WeaveRequest = serde_json::from_value(payload)
        .map_err(|e| AuctionError::SchemaInvalid(e.to_string()))?;
    let response = state.weave.get_or_create(request).await?;
    Ok(Json(response))
}

/// 存活探针
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn ping() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// 服务元信息
pub async fn root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "transport": {
            "nonce_ttl_seconds": state.config.transport.nonce_ttl_seconds,
            "max_clock_skew_ms": state.config.transport.max_clock_skew_ms,
        },
        "auction": {
            "window_ms": state.config.auction.window_ms,
            "fanout_backend": format!("{:?}", state.config.auction.fanout.backend).to_lowercase(),
        },
    }))
}

/// 运行统计
pub async fn admin_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "uptime_seconds": uptime_seconds,
        "live_auctions": state.runner.inbox().live_count(),
        "settled_auctions": state.runner.settled_count(),
        "registered_bidders": state.registry.len(),
    }))
}

/// 出价方概览（不含公钥）
pub async fn admin_bidders(State(state): State<Arc<AppState>>) -> Json<Value> {
    let bidders: Vec<Value> = state
        .registry
        .all()
        .iter()
        .map(|b| {
            json!({
                "name": b.name,
                "endpoint": b.endpoint,
                "timeout_ms": b.timeout_ms,
                "pools": b.pools,
            })
        })
        .collect();
    Json(json!({ "bidders": bidders }))
}
