// src/config/settings.rs

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::model::bidder::Bidder;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(String, serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// 账本后端。未知取值在解析阶段直接报错而不是降级警告。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    InMemory,
    Redis,
    Postgres,
    Firestore,
}

/// 分发后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutBackend {
    Local,
    Pubsub,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_nonce_ttl")]
    pub nonce_ttl_seconds: i64,
    #[serde(default = "default_max_skew")]
    pub max_clock_skew_ms: i64,
}

fn default_nonce_ttl() -> i64 {
    60
}

fn default_max_skew() -> i64 {
    500
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            nonce_ttl_seconds: default_nonce_ttl(),
            max_clock_skew_ms: default_max_skew(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_backend")]
    pub backend: LedgerBackend,
    pub url: Option<String>,       // redis / postgres 连接串
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,        // redis 键前缀
    pub project: Option<String>,   // firestore 项目
    pub endpoint: Option<String>,  // firestore REST 端点覆盖（模拟器）
    pub auth_token: Option<String>,
}

fn default_ledger_backend() -> LedgerBackend {
    LedgerBackend::InMemory
}

fn default_key_prefix() -> String {
    "aip".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: default_ledger_backend(),
            url: None,
            key_prefix: default_key_prefix(),
            project: None,
            endpoint: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanoutConfig {
    #[serde(default = "default_fanout_backend")]
    pub backend: FanoutBackend,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    pub push_endpoint: Option<String>, // pubsub 推送端点
}

fn default_fanout_backend() -> FanoutBackend {
    FanoutBackend::Local
}

fn default_topic_prefix() -> String {
    "aip-".to_string()
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            backend: default_fanout_backend(),
            topic_prefix: default_topic_prefix(),
            push_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuctionConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default)]
    pub fanout: FanoutConfig,
}

fn default_window_ms() -> u64 {
    50
}

fn default_publish_timeout_ms() -> u64 {
    10
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
            fanout: FanoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeaveConfig {
    #[serde(default = "default_weave_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_weave_concurrency")]
    pub max_concurrency: usize,
}

fn default_weave_window_ms() -> u64 {
    500
}

fn default_weave_concurrency() -> usize {
    8
}

impl Default for WeaveConfig {
    fn default() -> Self {
        Self {
            window_ms: default_weave_window_ms(),
            max_concurrency: default_weave_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    /// 池 -> 关键词列表。BTreeMap 保证分类输出顺序稳定。
    #[serde(default)]
    pub keyword_pools: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_pools")]
    pub default_pools: Vec<String>,
}

fn default_pools() -> Vec<String> {
    vec!["default".to_string()]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            keyword_pools: BTreeMap::new(),
            default_pools: default_pools(),
        }
    }
}

/// **服务端配置文档**
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub auction: AuctionConfig,
    #[serde(default)]
    pub weave: WeaveConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// 事件上报方名称 -> Ed25519 公钥（PEM）；查不到时回退到出价方注册表
    #[serde(default)]
    pub reporters: HashMap<String, String>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(30..=70).contains(&self.auction.window_ms) {
            return Err(ConfigError::Invalid(format!(
                "auction.window_ms must be within 30..=70, got {}",
                self.auction.window_ms
            )));
        }
        if self.transport.nonce_ttl_seconds <= 0 {
            return Err(ConfigError::Invalid(
                "transport.nonce_ttl_seconds must be positive".to_string(),
            ));
        }
        if self.transport.max_clock_skew_ms <= 0 {
            return Err(ConfigError::Invalid(
                "transport.max_clock_skew_ms must be positive".to_string(),
            ));
        }
        if self.weave.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "weave.max_concurrency must be at least 1".to_string(),
            ));
        }
        match self.ledger.backend {
            LedgerBackend::Redis | LedgerBackend::Postgres if self.ledger.url.is_none() => {
                return Err(ConfigError::Invalid(format!(
                    "ledger backend {:?} requires ledger.url",
                    self.ledger.backend
                )));
            }
            LedgerBackend::Firestore if self.ledger.project.is_none() => {
                return Err(ConfigError::Invalid(
                    "ledger backend firestore requires ledger.project".to_string(),
                ));
            }
            _ => {}
        }
        if self.auction.fanout.backend == FanoutBackend::Pubsub
            && self.auction.fanout.push_endpoint.is_none()
        {
            return Err(ConfigError::Invalid(
                "fanout backend pubsub requires fanout.push_endpoint".to_string(),
            ));
        }
        Ok(())
    }
}

/// 出价方配置文档（bidders.yaml）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BidderDocument {
    #[serde(default)]
    pub bidders: Vec<Bidder>,
}

pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
    let config: ServerConfig = serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::Parse(path.display().to_string(), e))?;
    config.validate()?;
    Ok(config)
}

pub fn load_bidder_config(path: &Path) -> Result<Vec<Bidder>, ConfigError> {
    let content = fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
    let document: BidderDocument = serde_yaml::from_str(&content)
        .map_err(|e| ConfigError::Parse(path.display().to_string(), e))?;
    Ok(document.bidders)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.auction.window_ms, 50);
        assert_eq!(config.transport.nonce_ttl_seconds, 60);
        assert_eq!(config.transport.max_clock_skew_ms, 500);
        assert_eq!(config.weave.window_ms, 500);
    }

    #[test]
    fn parses_full_document() {
        let yaml = r#"
listen:
  host: 127.0.0.1
  port: 8090
transport:
  nonce_ttl_seconds: 30
  max_clock_skew_ms: 400
ledger:
  backend: redis
  url: redis://localhost:6379
auction:
  window_ms: 60
  fanout:
    backend: pubsub
    topic_prefix: "aip-"
    push_endpoint: http://localhost:9001/topics
classifier:
  keyword_pools:
    retail: [shoes, sneakers]
    travel: [flight, hotel]
  default_pools: [default]
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ledger.backend, LedgerBackend::Redis);
        assert_eq!(config.auction.fanout.backend, FanoutBackend::Pubsub);
        assert_eq!(config.classifier.keyword_pools.len(), 2);
    }

    #[test]
    fn unknown_keys_are_errors() {
        let yaml = "listen:\n  host: 0.0.0.0\n  bogus: 1\n";
        assert!(serde_yaml::from_str::<ServerConfig>(yaml).is_err());
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let yaml = "ledger:\n  backend: cassandra\n";
        assert!(serde_yaml::from_str::<ServerConfig>(yaml).is_err());
    }

    #[test]
    fn window_range_is_enforced() {
        for bad in [10u64, 80] {
            let mut config = ServerConfig::default();
            config.auction.window_ms = bad;
            assert!(config.validate().is_err());
        }
        let mut config = ServerConfig::default();
        config.auction.window_ms = 70;
        config.validate().unwrap();
    }

    #[test]
    fn remote_backends_require_connection_details() {
        let mut config = ServerConfig::default();
        config.ledger.backend = LedgerBackend::Postgres;
        assert!(config.validate().is_err());
        config.ledger.url = Some("postgres://localhost/aip".to_string());
        config.validate().unwrap();
    }
}
