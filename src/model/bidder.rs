// src/model/bidder.rs

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::transport::signatures::{load_verifying_key, SignatureError};

/// **注册的出价方（品牌 agent）**
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Bidder {
    pub name: String,              // 唯一名称
    pub endpoint: String,          // 出价方自己的接收端点
    pub public_key: String,        // Ed25519 公钥（PEM）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,           // 建议的出价超时，仅供出价方参考，服务端只强制全局窗口
    #[serde(default = "default_pools")]
    pub pools: Vec<String>,        // 订阅的分类池
}

fn default_timeout_ms() -> u64 {
    200
}

fn default_pools() -> Vec<String> {
    vec!["default".to_string()]
}

impl Bidder {
    pub fn is_subscribed(&self, pools: &[String]) -> bool {
        self.pools.iter().any(|p| pools.contains(p))
    }
}

/// **出价方注册表**
/// 启动时从配置加载一次，之后只读；公钥在加载时就解析好，
/// 坏密钥直接让启动失败而不是留到第一笔出价。
pub struct BidderRegistry {
    bidders: HashMap<String, Bidder>,
    keys: HashMap<String, VerifyingKey>,
}

impl BidderRegistry {
    pub fn from_bidders(bidders: Vec<Bidder>) -> Result<Self, SignatureError> {
        let mut table = HashMap::new();
        let mut keys = HashMap::new();
        for bidder in bidders {
            let key = load_verifying_key(&bidder.public_key)?;
            keys.insert(bidder.name.clone(), key);
            table.insert(bidder.name.clone(), bidder);
        }
        Ok(Self {
            bidders: table,
            keys,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Bidder> {
        self.bidders.get(name)
    }

    pub fn verifying_key(&self, name: &str) -> Option<&VerifyingKey> {
        self.keys.get(name)
    }

    /// 返回订阅了任一给定池的出价方
    pub fn filter_by_pools(&self, pools: &[String]) -> Vec<&Bidder> {
        let mut matched: Vec<&Bidder> = self
            .bidders
            .values()
            .filter(|b| b.is_subscribed(pools))
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        matched
    }

    pub fn all(&self) -> Vec<&Bidder> {
        let mut all: Vec<&Bidder> = self.bidders.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.bidders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bidders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn test_bidder(name: &str, pools: &[&str]) -> Bidder {
        let key = SigningKey::generate(&mut OsRng);
        Bidder {
            name: name.to_string(),
            endpoint: format!("http://localhost:9001/{}", name),
            public_key: key
                .verifying_key()
                .to_public_key_pem(LineEnding::LF)
                .unwrap(),
            timeout_ms: 200,
            pools: pools.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn filter_by_pools_matches_subscriptions() {
        let registry = BidderRegistry::from_bidders(vec![
            test_bidder("alpha", &["retail"]),
            test_bidder("beta", &["retail", "travel"]),
            test_bidder("gamma", &["finance"]),
        ])
        .unwrap();

        let retail: Vec<&str> = registry
            .filter_by_pools(&["retail".to_string()])
            .iter()
            .map(|b| b.name.as_str())
            .collect();
        assert_eq!(retail, vec!["alpha", "beta"]);
        assert!(registry
            .filter_by_pools(&["gaming".to_string()])
            .is_empty());
    }

    #[test]
    fn keys_are_parsed_at_load() {
        let registry = BidderRegistry::from_bidders(vec![test_bidder("alpha", &["retail"])]).unwrap();
        assert!(registry.verifying_key("alpha").is_some());
        assert!(registry.verifying_key("missing").is_none());

        let mut bad = test_bidder("broken", &["retail"]);
        bad.public_key = "garbage".to_string();
        assert!(BidderRegistry::from_bidders(vec![bad]).is_err());
    }
}
