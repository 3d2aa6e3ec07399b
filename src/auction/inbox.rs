// src/auction/inbox.rs

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use crate::error::AuctionError;
use crate::model::bid::BidSubmission;

/// 竞拍槽位的阶段，单调推进：open -> closed -> settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionPhase {
    Open,
    Closed,
    Settled,
}

struct SlotState {
    phase: AuctionPhase,
    bids: Vec<BidSubmission>,
}

/// 单场竞拍的会合点。平台请求和出价提交跑在互不相关的 HTTP 请求里，
/// 靠 auction_id 在这里会合。
pub struct AuctionSlot {
    auction_id: String,
    opened_at: Instant,
    deadline: Instant,
    target_bidders: BTreeSet<String>,
    state: Mutex<SlotState>,
    notify: Notify,
}

impl AuctionSlot {
    fn new(auction_id: &str, target_bidders: BTreeSet<String>, window: Duration) -> Self {
        let opened_at = Instant::now();
        Self {
            auction_id: auction_id.to_string(),
            opened_at,
            deadline: opened_at + window,
            target_bidders,
            state: Mutex::new(SlotState {
                phase: AuctionPhase::Open,
                bids: Vec::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn auction_id(&self) -> &str {
        &self.auction_id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// 按到达顺序接收出价。
    /// 截止时间是硬性的：即使槽位还没被拆除，过点的出价一样被拒。
    pub fn submit(&self, bid: BidSubmission) -> Result<(), AuctionError> {
        if Instant::now() >= self.deadline {
            return Err(AuctionError::WindowClosed);
        }
        let mut state = self.state.lock().unwrap();
        if state.phase != AuctionPhase::Open {
            return Err(AuctionError::WindowClosed);
        }
        if !self.target_bidders.contains(&bid.bidder) {
            return Err(AuctionError::NotInvited);
        }
        if state.bids.iter().any(|b| b.bidder == bid.bidder) {
            return Err(AuctionError::DuplicateBid);
        }
        state.bids.push(bid);
        // 所有目标出价方都已提交：提前发出完成信号。
        // notify_one 会存下 permit，先到的信号不会丢。
        if state.bids.len() == self.target_bidders.len() {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// 等到完成信号或窗口截止，先到为准。
    /// 完成信号只是提前关窗的优化，缺失它窗口也绝不会延长。
    pub async fn wait_window(&self) {
        if self.target_bidders.is_empty() {
            return;
        }
        let _ = tokio::time::timeout_at(self.deadline, self.notify.notified()).await;
    }

    /// open -> closed，返回出价快照；之后的提交一律 window_closed
    pub fn close(&self) -> Vec<BidSubmission> {
        let mut state = self.state.lock().unwrap();
        state.phase = AuctionPhase::Closed;
        state.bids.clone()
    }

    pub fn settle(&self) {
        self.state.lock().unwrap().phase = AuctionPhase::Settled;
    }

    pub fn phase(&self) -> AuctionPhase {
        self.state.lock().unwrap().phase
    }

    pub fn bid_count(&self) -> usize {
        self.state.lock().unwrap().bids.len()
    }
}

/// 进程级 auction_id -> 槽位 表。
/// 表锁只护 insert / lookup / remove，槽位内部状态有自己的锁。
/// 未知 auction_id 的出价直接被拒，不做任何预留。
pub struct BidInbox {
    slots: Mutex<HashMap<String, Arc<AuctionSlot>>>,
}

impl BidInbox {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(
        &self,
        auction_id: &str,
        target_bidders: BTreeSet<String>,
        window: Duration,
    ) -> Result<Arc<AuctionSlot>, AuctionError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.contains_key(auction_id) {
            return Err(AuctionError::Conflict(auction_id.to_string()));
        }
        let slot = Arc::new(AuctionSlot::new(auction_id, target_bidders, window));
        slots.insert(auction_id.to_string(), slot.clone());
        Ok(slot)
    }

    pub fn get(&self, auction_id: &str) -> Option<Arc<AuctionSlot>> {
        self.slots.lock().unwrap().get(auction_id).cloned()
    }

    pub fn remove(&self, auction_id: &str) {
        self.slots.lock().unwrap().remove(auction_id);
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl Default for BidInbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::bid::PricingModel;

    fn bid(auction_id: &str, bidder: &str) -> BidSubmission {
        BidSubmission {
            auction_id: auction_id.to_string(),
            bidder: bidder.to_string(),
            price: 1.0,
            pricing_model: PricingModel::CPC,
            creative: None,
            timestamp: "2026-08-02T10:00:00Z".to_string(),
            nonce: format!("n-{}", bidder),
            signature: String::new(),
        }
    }

    fn targets(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn duplicate_auction_id_conflicts() {
        let inbox = BidInbox::new();
        inbox
            .open("ctx_1", targets(&["alpha"]), Duration::from_millis(50))
            .unwrap();
        assert!(matches!(
            inbox.open("ctx_1", targets(&["alpha"]), Duration::from_millis(50)),
            Err(AuctionError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn submit_guards() {
        let inbox = BidInbox::new();
        let slot = inbox
            .open("ctx_1", targets(&["alpha", "beta"]), Duration::from_secs(5))
            .unwrap();

        slot.submit(bid("ctx_1", "alpha")).unwrap();
        assert!(matches!(
            slot.submit(bid("ctx_1", "alpha")),
            Err(AuctionError::DuplicateBid)
        ));
        assert!(matches!(
            slot.submit(bid("ctx_1", "stranger")),
            Err(AuctionError::NotInvited)
        ));
        assert_eq!(slot.bid_count(), 1);
    }

    #[tokio::test]
    async fn closed_slot_rejects_bids() {
        let inbox = BidInbox::new();
        let slot = inbox
            .open("ctx_1", targets(&["alpha"]), Duration::from_secs(5))
            .unwrap();
        let snapshot = slot.close();
        assert!(snapshot.is_empty());
        assert!(matches!(
            slot.submit(bid("ctx_1", "alpha")),
            Err(AuctionError::WindowClosed)
        ));
    }

    #[tokio::test]
    async fn late_bid_is_rejected_even_before_teardown() {
        let inbox = BidInbox::new();
        let slot = inbox
            .open("ctx_1", targets(&["alpha"]), Duration::from_millis(30))
            .unwrap();
        // 截止后 5ms，槽位还在但窗口已过
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(slot.phase(), AuctionPhase::Open);
        assert!(matches!(
            slot.submit(bid("ctx_1", "alpha")),
            Err(AuctionError::WindowClosed)
        ));
    }

    #[tokio::test]
    async fn completion_signal_fires_when_all_bidders_submit() {
        let inbox = BidInbox::new();
        let slot = inbox
            .open("ctx_1", targets(&["alpha", "beta"]), Duration::from_secs(5))
            .unwrap();
        slot.submit(bid("ctx_1", "alpha")).unwrap();
        slot.submit(bid("ctx_1", "beta")).unwrap();
        // 完成信号已经发出，wait_window 立即返回而不是等满 5 秒
        let start = Instant::now();
        slot.wait_window().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(slot.close().len(), 2);
    }

    #[tokio::test]
    async fn empty_target_set_returns_immediately() {
        let inbox = BidInbox::new();
        let slot = inbox
            .open("ctx_1", BTreeSet::new(), Duration::from_secs(5))
            .unwrap();
        let start = Instant::now();
        slot.wait_window().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn remove_makes_auction_unknown() {
        let inbox = BidInbox::new();
        inbox
            .open("ctx_1", targets(&["alpha"]), Duration::from_secs(5))
            .unwrap();
        assert!(inbox.get("ctx_1").is_some());
        inbox.remove("ctx_1");
        assert!(inbox.get("ctx_1").is_none());
        assert_eq!(inbox.live_count(), 0);
    }
}
