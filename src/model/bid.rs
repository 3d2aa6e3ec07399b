use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 计价模型。选择时的优先级为 CPA > CPC > CPX，与单价无关。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PricingModel {
    CPA,
    CPC,
    CPX,
}

impl PricingModel {
    /// 数值越小优先级越高
    pub fn priority(self) -> u8 {
        match self {
            PricingModel::CPA => 0,
            PricingModel::CPC => 1,
            PricingModel::CPX => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PricingModel::CPA => "CPA",
            PricingModel::CPC => "CPC",
            PricingModel::CPX => "CPX",
        }
    }
}

/// **出价方提交的签名出价**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BidSubmission {
    pub auction_id: String,          // 目标竞拍 ID（= 平台请求的 request_id）
    pub bidder: String,              // 出价方名称，必须已注册且在目标集合内
    pub price: f64,                  // 非负出价
    pub pricing_model: PricingModel, // 计价模型
    pub creative: Option<Value>,     // 创意载荷，对服务端不透明
    pub timestamp: String,           // RFC 3339
    pub nonce: String,               // 防重放 nonce
    pub signature: String,           // Ed25519 base64，覆盖除本字段外的规范化字节
}
