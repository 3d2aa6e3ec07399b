use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bid::PricingModel;

/// 胜出出价的摘要，进入竞拍结果与账本记录
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WinnerSummary {
    pub bidder: String,
    pub price: f64,
    pub clearing_price: f64, // 次价结算：按选择顺序排第二的出价，只有一个出价时等于成交价
    pub pricing_model: PricingModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creative: Option<Value>,
}

/// **窗口关闭后返回给平台的规范结果**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuctionResult {
    pub auction_id: String,
    pub serve_token: String, // 服务端铸造的事件关联标识
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_bid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<WinnerSummary>,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub persisted: bool, // 账本落盘失败时为 false，结果仍然返回
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_true(v: &bool) -> bool {
    *v
}

fn default_true() -> bool {
    true
}

impl AuctionResult {
    pub fn no_bid(auction_id: String, serve_token: String) -> Self {
        Self {
            auction_id,
            serve_token,
            no_bid: true,
            winner: None,
            persisted: true,
        }
    }

    pub fn won(auction_id: String, serve_token: String, winner: WinnerSummary) -> Self {
        Self {
            auction_id,
            serve_token,
            no_bid: false,
            winner: Some(winner),
            persisted: true,
        }
    }
}
