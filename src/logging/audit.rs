// src/logging/audit.rs

use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task;
use tokio::time::{self, Duration};
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::fmt::MakeWriter;

/// **单场竞拍的审计记录**，窗口关闭后整条写入审计日志
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuctionLog {
    pub timestamp: String,
    pub log_type: String,
    pub auction_id: String,
    pub context_hash: String, // 上下文请求的规范化 SHA-256
    pub pools: Vec<String>,
    pub target_bidders: usize,
    pub bid_attempts: usize,
    pub status: String, // success / no_bid
    pub winning_bidder: Option<String>,
    pub winning_price: f64,
    pub clearing_price: f64,
    pub window_elapsed_ms: u128,
    pub persisted: bool,
    pub bid_log: Vec<BidLog>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BidLog {
    pub bidder: String,
    pub price: f64,
    pub pricing_model: String,
}

impl AuctionLog {
    pub fn new(auction_id: &str, pools: &[String], target_bidders: usize) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            log_type: "auction_settled".to_string(),
            auction_id: auction_id.to_string(),
            context_hash: String::new(),
            pools: pools.to_vec(),
            target_bidders,
            bid_attempts: 0,
            status: "no_bid".to_string(),
            winning_bidder: None,
            winning_price: 0.0,
            clearing_price: 0.0,
            window_elapsed_ms: 0,
            persisted: true,
            bid_log: Vec::new(),
        }
    }

    pub fn add_bid(&mut self, bidder: &str, price: f64, pricing_model: &str) {
        self.bid_log.push(BidLog {
            bidder: bidder.to_string(),
            price,
            pricing_model: pricing_model.to_string(),
        });
        self.bid_attempts += 1;
    }

    pub fn set_winner(&mut self, bidder: &str, price: f64, clearing_price: f64) {
        self.status = "success".to_string();
        self.winning_bidder = Some(bidder.to_string());
        self.winning_price = price;
        self.clearing_price = clearing_price;
    }
}

enum AuditMessage {
    Entry(String),
    Flush,
}

/// 审计日志写入器：mpsc 进队，后台批量刷到小时滚动文件。
/// 磁盘写放在 spawn_blocking 里，不阻塞竞拍路径。
pub struct AuditLogger {
    sender: Sender<AuditMessage>,
}

impl AuditLogger {
    pub fn new(
        log_dir: &str,
        file_prefix: &str,
        buffer_size: usize,
        batch_size: usize,
        flush_interval_ms: u64,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let appender = Arc::new(rolling::hourly(log_dir, format!("{}.json", file_prefix)));
        tokio::spawn(Self::background_writer(
            appender,
            receiver,
            batch_size,
            flush_interval_ms,
        ));
        Arc::new(Self { sender })
    }

    pub async fn log(&self, entry: &AuctionLog) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("Failed to serialize audit log entry: {}", e);
                return;
            }
        };
        if let Err(e) = self.sender.send(AuditMessage::Entry(line)).await {
            eprintln!("Failed to enqueue audit log entry: {}", e);
        }
    }

    async fn background_writer(
        appender: Arc<RollingFileAppender>,
        mut receiver: Receiver<AuditMessage>,
        batch_size: usize,
        flush_interval_ms: u64,
    ) {
        let mut buffer: Vec<String> = Vec::new();
        let mut interval = time::interval(Duration::from_millis(flush_interval_ms));
        loop {
            tokio::select! {
                message = receiver.recv() => {
                    match message {
                        Some(AuditMessage::Entry(line)) => {
                            buffer.push(line);
                            if buffer.len() >= batch_size {
                                Self::write_to_disk(appender.clone(), &mut buffer).await;
                            }
                        }
                        Some(AuditMessage::Flush) | None => {
                            if !buffer.is_empty() {
                                Self::write_to_disk(appender.clone(), &mut buffer).await;
                            }
                            if receiver.is_closed() {
                                break;
                            }
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        Self::write_to_disk(appender.clone(), &mut buffer).await;
                    }
                }
            }
        }
    }

    async fn write_to_disk(appender: Arc<RollingFileAppender>, buffer: &mut Vec<String>) {
        let content = buffer.join("\n") + "\n";
        buffer.clear();
        let result = task::spawn_blocking(move || {
            let mut writer = appender.make_writer();
            writer.write_all(content.as_bytes())
        })
        .await;
        match result {
            Ok(Err(e)) => eprintln!("Failed to write audit log: {}", e),
            Err(e) => eprintln!("Audit log writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    /// 落盘剩余缓冲后返回，停机前调用
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AuditMessage::Flush).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
