// src/ledger/service.rs

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AuctionError;
use crate::ledger::fsm::{transition, EventType, LedgerInput, LedgerState};
use crate::model::bid::BidSubmission;
use crate::model::context::ContextRequest;
use crate::model::result::WinnerSummary;
use crate::storage::{Storage, StorageError};

/// **按 auction_id 持久化的账本记录**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LedgerRecord {
    pub auction_id: String,
    pub serve_token: String,
    pub status: LedgerState,
    pub context: ContextRequest,
    pub pools: Vec<String>,
    pub target_bidders: Vec<String>,
    #[serde(default)]
    pub bids: Vec<BidSubmission>,
    pub winner: Option<WinnerSummary>,
    #[serde(default)]
    pub no_bid: bool,
    /// 有序事件历史。回调事件与结算事件都会进来，结构保持宽松
    #[serde(default)]
    pub events: Vec<Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// 一次事件回调的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(LedgerState),
    /// 同一 (event_type, nonce) 的重复投递，幂等无操作
    Duplicate(LedgerState),
}

impl EventOutcome {
    pub fn state(self) -> LedgerState {
        match self {
            EventOutcome::Applied(state) | EventOutcome::Duplicate(state) => state,
        }
    }

    pub fn is_duplicate(self) -> bool {
        matches!(self, EventOutcome::Duplicate(_))
    }
}

pub fn ledger_key(auction_id: &str) -> String {
    format!("ledger:{}", auction_id)
}

/// 铸造 serve_token：`stk_` + 128 位系统随机数（hex）。
/// 调用方靠它把后续事件关联回具体的一次投放。
pub fn mint_serve_token() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    format!("stk_{}", hex::encode(buf))
}

pub struct LedgerService {
    storage: Arc<dyn Storage>,
}

impl LedgerService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn get_record(
        &self,
        auction_id: &str,
    ) -> Result<Option<LedgerRecord>, StorageError> {
        match self.storage.get(&ledger_key(auction_id)).await? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(format!("ledger:{}: {}", auction_id, e))),
        }
    }

    /// 写入 created 状态的新记录。重试路径上看到自己已写入的记录
    /// （serve_token 相同）视为成功；token 不同说明撞了别人的竞拍。
    pub async fn create_record(
        &self,
        context: &ContextRequest,
        pools: &[String],
        target_bidders: &[String],
        serve_token: &str,
    ) -> Result<(), StorageError> {
        let auction_id = context.request_id.clone();
        let now = Utc::now().to_rfc3339();
        let fresh = LedgerRecord {
            auction_id: auction_id.clone(),
            serve_token: serve_token.to_string(),
            status: LedgerState::Created,
            context: context.clone(),
            pools: pools.to_vec(),
            target_bidders: target_bidders.to_vec(),
            bids: Vec::new(),
            winner: None,
            no_bid: false,
            events: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };
        let token = serve_token.to_string();
        let key = ledger_key(&auction_id);
        self.storage
            .update(
                &key,
                Box::new(move |current| match current {
                    None => serde_json::to_value(&fresh)
                        .map_err(|e| StorageError::Corrupt(e.to_string())),
                    Some(existing) => {
                        let existing_token = existing
                            .get("serve_token")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if existing_token == token {
                            Ok(existing)
                        } else {
                            Err(StorageError::AlreadyExists(fresh.auction_id.clone()))
                        }
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// 结算：created -> served / no_bid，并把出价快照与胜者写进记录，
    /// 随后追加一条结算事件到历史。
    pub async fn settle(
        &self,
        auction_id: &str,
        bids: &[BidSubmission],
        winner: Option<&WinnerSummary>,
    ) -> Result<LedgerRecord, StorageError> {
        let key = ledger_key(auction_id);
        let key_for_mutator = key.clone();
        let bids_snapshot = bids.to_vec();
        let winner_snapshot = winner.cloned();
        self.storage
            .update(
                &key,
                Box::new(move |current| {
                    let value = current
                        .ok_or_else(|| StorageError::NotFound(key_for_mutator.clone()))?;
                    let mut record: LedgerRecord = serde_json::from_value(value.clone())
                        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                    // 重试路径：已经结算成同一个目标状态，整条记录保持不变
                    let already_settled = matches!(
                        (record.status, winner_snapshot.is_some()),
                        (LedgerState::Served, true) | (LedgerState::NoBid, false)
                    );
                    if already_settled {
                        return Ok(value);
                    }
                    let input = if winner_snapshot.is_some() {
                        LedgerInput::AuctionWon
                    } else {
                        LedgerInput::AuctionNoBid
                    };
                    record.status = transition(record.status, input).map_err(|err| {
                        StorageError::Corrupt(format!("settle {}: {}", record.auction_id, err))
                    })?;
                    record.bids = bids_snapshot.clone();
                    record.winner = winner_snapshot.clone();
                    record.no_bid = winner_snapshot.is_none();
                    record.updated_at = Utc::now().to_rfc3339();
                    serde_json::to_value(&record)
                        .map_err(|e| StorageError::Corrupt(e.to_string()))
                }),
            )
            .await?;

        let settled = self
            .storage
            .append_event(
                &key,
                json!({
                    "event_type": "auction_settled",
                    "no_bid": winner.is_none(),
                    "recorded_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        serde_json::from_value(settled).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    /// 事件回调：单次原子 update 里完成 token 校验、幂等判断、
    /// 状态推进与历史追加，避免两段写之间的竞态。
    pub async fn record_event(
        &self,
        auction_id: &str,
        serve_token: &str,
        event_type: EventType,
        reporter: &str,
        nonce: &str,
        timestamp: &str,
    ) -> Result<EventOutcome, AuctionError> {
        let key = ledger_key(auction_id);
        let key_for_mutator = key.clone();
        let decision: Arc<Mutex<Option<Result<EventOutcome, AuctionError>>>> =
            Arc::new(Mutex::new(None));
        let decision_slot = decision.clone();
        let expected_token = serve_token.to_string();
        let reporter = reporter.to_string();
        let nonce = nonce.to_string();
        let timestamp = timestamp.to_string();

        let result = self
            .storage
            .update(
                &key,
                Box::new(move |current| {
                    let value = current
                        .ok_or_else(|| StorageError::NotFound(key_for_mutator.clone()))?;
                    let mut record: LedgerRecord = serde_json::from_value(value.clone())
                        .map_err(|e| StorageError::Corrupt(e.to_string()))?;

                    if record.serve_token != expected_token {
                        *decision_slot.lock().unwrap() = Some(Err(AuctionError::UnknownAuction(
                            format!("{} (serve_token mismatch)", record.auction_id),
                        )));
                        return Ok(value);
                    }

                    let already_recorded = record.events.iter().any(|event| {
                        event.get("event_type").and_then(Value::as_str)
                            == Some(event_type.as_str())
                            && event.get("nonce").and_then(Value::as_str) == Some(nonce.as_str())
                    });
                    if already_recorded {
                        *decision_slot.lock().unwrap() =
                            Some(Ok(EventOutcome::Duplicate(record.status)));
                        return Ok(value);
                    }

                    match transition(record.status, LedgerInput::Event(event_type)) {
                        Ok(next) => {
                            record.status = next;
                            record.events.push(json!({
                                "event_type": event_type.as_str(),
                                "nonce": nonce.clone(),
                                "reporter": reporter.clone(),
                                "timestamp": timestamp.clone(),
                                "recorded_at": Utc::now().to_rfc3339(),
                            }));
                            record.updated_at = Utc::now().to_rfc3339();
                            *decision_slot.lock().unwrap() =
                                Some(Ok(EventOutcome::Applied(next)));
                            serde_json::to_value(&record)
                                .map_err(|e| StorageError::Corrupt(e.to_string()))
                        }
                        Err(err) => {
                            *decision_slot.lock().unwrap() =
                                Some(Err(AuctionError::TerminalState(err.to_string())));
                            Ok(value)
                        }
                    }
                }),
            )
            .await;

        if let Some(decided) = decision.lock().unwrap().take() {
            return decided;
        }
        match result {
            Ok(_) => Err(AuctionError::Internal(
                "event update finished without a decision".to_string(),
            )),
            Err(StorageError::NotFound(_)) => {
                Err(AuctionError::UnknownAuction(auction_id.to_string()))
            }
            Err(err) => Err(AuctionError::StorageUnavailable(err.to_string())),
        }
    }
}
