use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{serve, Router};
use chrono::{DateTime, Utc};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

mod api;
mod auction;
mod config;
mod error;
mod ledger;
mod logging;
mod mock_bidder;
mod model;
mod storage;
mod transport;
mod weave;

use auction::classify::Classifier;
use auction::engine::AuctionRunner;
use auction::fanout::build_fanout;
use auction::inbox::BidInbox;
use config::{load_bidder_config, load_server_config, FanoutBackend, ServerConfig};
use ledger::service::LedgerService;
use logging::audit::AuditLogger;
use model::bidder::{Bidder, BidderRegistry};
use transport::nonces::NonceCache;
use transport::signatures::load_verifying_key;
use weave::service::WeaveService;

pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<BidderRegistry>,
    pub runner: Arc<AuctionRunner>,
    pub ledger: Arc<LedgerService>,
    pub weave: Arc<WeaveService>,
    pub nonces: NonceCache,
    pub started_at: DateTime<Utc>,
    reporter_keys: HashMap<String, VerifyingKey>,
}

impl AppState {
    /// 事件上报方公钥：先查 server.yaml 的 reporters，再回退到出价方注册表
    pub fn reporter_key(&self, name: &str) -> Option<&VerifyingKey> {
        self.reporter_keys
            .get(name)
            .or_else(|| self.registry.verifying_key(name))
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "An auction server for the Agentic Intent Protocol (AIP)")]
struct CliArgs {
    /// 服务端配置（默认 config/server.yaml，可用 AIP_CONFIG_PATH 覆盖）
    #[arg(long)]
    config: Option<PathBuf>,
    /// 出价方配置（默认 config/bidders.yaml，可用 AIP_BIDDERS_PATH 覆盖）
    #[arg(long)]
    bidders: Option<PathBuf>,
    /// 覆盖配置里的监听端口
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(long, default_value = "logs")]
    log_dir: String,
    /// 启动内置的模拟出价方（开发模式）
    #[arg(long, default_value_t = false)]
    mock_bidder: bool,
    #[arg(long, default_value_t = 9001)]
    mock_bidder_port: u16,
}

fn resolve_path(cli: Option<PathBuf>, env_var: &str, fallback: &str) -> PathBuf {
    cli.or_else(|| std::env::var(env_var).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(fallback))
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    // 初始化全局 tracing 日志：JSON 格式，按小时滚动
    let log_file = rolling::hourly(&args.log_dir, "aip_server.json");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);
    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().json().with_writer(non_blocking));
    tracing::subscriber::set_global_default(subscriber)
        .expect("Unable to set global tracing subscriber");

    let config_path = resolve_path(args.config.clone(), "AIP_CONFIG_PATH", "config/server.yaml");
    let bidders_path = resolve_path(args.bidders.clone(), "AIP_BIDDERS_PATH", "config/bidders.yaml");
    let mut config = load_server_config(&config_path).expect("server config should load");
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    let mut bidders = load_bidder_config(&bidders_path).expect("bidder config should load");

    // 开发模式：生成一个模拟出价方，注册进所有已配置的池，
    // 并把本地 fanout 切到指向它的 pubsub 推送
    let mock = if args.mock_bidder {
        let server_base = format!("http://127.0.0.1:{}", config.listen.port);
        let mock = Arc::new(mock_bidder::MockBidder::new(&server_base));
        let mut pools: Vec<String> = config.classifier.keyword_pools.keys().cloned().collect();
        for pool in &config.classifier.default_pools {
            if !pools.contains(pool) {
                pools.push(pool.clone());
            }
        }
        bidders.push(Bidder {
            name: mock_bidder::MOCK_BIDDER_NAME.to_string(),
            endpoint: format!("http://127.0.0.1:{}/topics", args.mock_bidder_port),
            public_key: mock.public_key_pem(),
            timeout_ms: 40,
            pools,
        });
        if config.auction.fanout.backend == FanoutBackend::Local {
            config.auction.fanout.backend = FanoutBackend::Pubsub;
            config.auction.fanout.push_endpoint =
                Some(format!("http://127.0.0.1:{}/topics", args.mock_bidder_port));
            info!("Mock bidder enabled, fanout switched to local pubsub push");
        }
        Some(mock)
    } else {
        None
    };

    let registry =
        Arc::new(BidderRegistry::from_bidders(bidders).expect("bidder registry should build"));
    let storage = storage::build_storage(&config)
        .await
        .expect("storage backend should initialize");
    let ledger = Arc::new(LedgerService::new(storage.clone()));
    let fanout = build_fanout(&config.auction.fanout);
    let audit = AuditLogger::new(&args.log_dir, "auction_audit", 1000, 100, 1000);
    let runner = Arc::new(AuctionRunner::new(
        registry.clone(),
        fanout,
        ledger.clone(),
        Arc::new(BidInbox::new()),
        Classifier::new(&config.classifier),
        config.auction.window_ms,
        config.auction.publish_timeout_ms,
        audit.clone(),
    ));
    let weave = WeaveService::new(
        storage.clone(),
        runner.clone(),
        config.weave.window_ms,
        config.weave.max_concurrency,
    );

    let mut reporter_keys = HashMap::new();
    for (name, pem) in &config.reporters {
        let key = load_verifying_key(pem)
            .unwrap_or_else(|e| panic!("reporter {} has an invalid public key: {}", name, e));
        reporter_keys.insert(name.clone(), key);
    }

    let nonces = NonceCache::new(config.transport.nonce_ttl_seconds);
    let state = Arc::new(AppState {
        config,
        registry,
        runner,
        ledger,
        weave,
        nonces,
        started_at: Utc::now(),
        reporter_keys,
    });

    if let Some(mock) = mock {
        let port = args.mock_bidder_port;
        tokio::spawn(async move {
            mock_bidder::start_mock_bidder_server(mock, port).await;
        });
    }

    let app = Router::new()
        .route("/", get(api::handlers::root))
        .route("/health", get(api::handlers::health))
        .route("/aip/ping", get(api::handlers::ping))
        .route("/aip/context", post(api::handlers::run_auction))
        .route("/context", post(api::handlers::run_auction))
        .route("/aip/bid-response", post(api::handlers::submit_bid_response))
        .route("/events/:event_type", post(api::handlers::ingest_event))
        .route(
            "/v1/weave/recommendations",
            post(api::handlers::weave_recommendations),
        )
        .route("/admin/stats", get(api::handlers::admin_stats))
        .route("/admin/bidders", get(api::handlers::admin_bidders))
        .with_state(state.clone());

    let addr = format!("{}:{}", state.config.listen.host, state.config.listen.port);
    info!("AIP server listening at http://{}", addr);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("listen address should bind");
    serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // 优雅停机：等在飞的 weave 任务写完终态，再把审计日志刷盘
    info!("Shutting down, draining background tasks...");
    state.weave.drain().await;
    audit.shutdown().await;
    info!("AIP server stopped.");
}

async fn shutdown_signal() {
    signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
}
