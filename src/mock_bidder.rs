use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{serve, Json, Router};
use chrono::Utc;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePublicKey;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::auction::fanout::Envelope;
use crate::model::bid::PricingModel;
use crate::transport::signatures::sign_payload;

pub const MOCK_BIDDER_NAME: &str = "mock_bidder";

/// 模拟出价方（开发模式）。
/// 以 pub/sub 推送端的身份接收信封，随机延迟后把一笔签名出价
/// 投回本服务的 /aip/bid-response，端到端地走一遍正式链路。
pub struct MockBidder {
    name: String,
    signing_key: SigningKey,
    server_base: String,
    client: reqwest::Client,
}

impl MockBidder {
    pub fn new(server_base: &str) -> Self {
        Self {
            name: MOCK_BIDDER_NAME.to_string(),
            signing_key: SigningKey::generate(&mut OsRng),
            server_base: server_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// 注册进出价方注册表用的公钥
    pub fn public_key_pem(&self) -> String {
        self.signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("ed25519 public key should encode as pem")
    }

    async fn respond_to_envelope(self: Arc<Self>, topic: String, envelope: Envelope) {
        // 模拟出价方的思考时间（5 ~ 30 毫秒）
        let think_ms = rand::thread_rng().gen_range(5..30);
        sleep(Duration::from_millis(think_ms)).await;

        let (price, model) = {
            let mut rng = rand::thread_rng();
            let price = (rng.gen_range(0.5..3.0f64) * 100.0).round() / 100.0;
            let model = match rng.gen_range(0..3) {
                0 => PricingModel::CPA,
                1 => PricingModel::CPC,
                _ => PricingModel::CPX,
            };
            (price, model)
        };
        let mut nonce_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_bytes);

        let query = &envelope.context_request.query_text;
        let mut payload = json!({
            "auction_id": envelope.auction_id,
            "bidder": self.name,
            "price": price,
            "pricing_model": model.as_str(),
            "creative": {
                "brand_name": "Mock Brand",
                "product_name": format!("Mock offer for {}", query),
                "descriptions": ["A simulated creative from the mock bidder."],
                "resource_urls": ["https://mock-bidder.local/offer"],
            },
            "timestamp": Utc::now().to_rfc3339(),
            "nonce": hex::encode(nonce_bytes),
        });
        let signature = match sign_payload(&payload, &self.signing_key) {
            Ok(signature) => signature,
            Err(e) => {
                warn!(error = %e, "mock bidder failed to sign bid");
                return;
            }
        };
        payload["signature"] = json!(signature);

        let url = format!("{}/aip/bid-response", self.server_base);
        match self.client.post(&url).json(&payload).send().await {
            Ok(response) => {
                info!(
                    topic = %topic,
                    auction_id = %envelope.auction_id,
                    price,
                    model = model.as_str(),
                    status = %response.status(),
                    "mock bidder submitted bid"
                );
            }
            Err(e) => {
                warn!(auction_id = %envelope.auction_id, error = %e, "mock bid submission failed");
            }
        }
    }
}

/// 接收 pub/sub 推送的信封。发布端的超时只有几毫秒，
/// 这里立刻应答，出价放到脱钩任务里慢慢做。
async fn handle_envelope(
    State(bidder): State<Arc<MockBidder>>,
    Path(topic): Path<String>,
    Json(envelope): Json<Envelope>,
) -> Json<Value> {
    tokio::spawn(bidder.respond_to_envelope(topic, envelope));
    Json(json!({ "status": "received" }))
}

/// 启动模拟出价方服务，路由为 /topics/{topic}。
/// fanout 的 push_endpoint 指到 http://127.0.0.1:{port}/topics 即可接上。
pub async fn start_mock_bidder_server(bidder: Arc<MockBidder>, port: u16) {
    let app = Router::new()
        .route("/topics/:topic", post(handle_envelope))
        .with_state(bidder);
    let addr = format!("127.0.0.1:{}", port);
    info!("Mock bidder listening at http://{}", addr);
    let listener = TcpListener::bind(&addr)
        .await
        .expect("mock bidder port should be free");
    serve(listener, app)
        .await
        .expect("mock bidder server failed");
}
