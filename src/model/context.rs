// src/model/context.rs

use serde::{Deserialize, Serialize};

/// **平台上报的意图上下文**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ContextRequest {
    pub request_id: String,          // 请求 ID，平台侧全局唯一，同时作为 auction_id
    pub session_id: String,          // 会话 ID
    pub platform_id: String,         // 平台 ID
    pub query_text: String,          // 用户意图文本，分类器的输入
    pub locale: Option<String>,      // 语言地区（如 en-US）
    pub geo: Option<String>,         // 粗粒度地理位置
    pub timestamp: String,           // RFC 3339 UTC
    pub auth: Option<AuthEnvelope>,  // 平台侧鉴权信息（nonce + 签名），核心只透传
    pub pools: Option<Vec<String>>,  // 调用方直接指定的分类池，优先于关键词分类
}

/// 请求上的鉴权信封
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthEnvelope {
    pub nonce: String,
    pub signature: String,
}
