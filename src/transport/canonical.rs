// src/transport/canonical.rs

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("canonical serialization failed: {0}")]
    Serialize(String),
}

/// 规范化 JSON 序列化（RFC 8785 / JCS）。
/// 所有层级的 key 按字典序排序，无多余空白，数字使用最短可逆形式，
/// 字符串只做最小转义。签名与校验两端必须基于这里产生的字节，
/// 保证逐字节一致。本函数是纯函数，不掺入时间戳、随机数或本地化格式。
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    serde_jcs::to_vec(value).map_err(|e| CanonicalError::Serialize(e.to_string()))
}

/// 规范化字节的 SHA-256 十六进制摘要
pub fn canonical_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let bytes = canonical_bytes(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// 待签名字节：移除顶层 `signature` 字段后再做规范化
pub fn signable_bytes(payload: &serde_json::Value) -> Result<Vec<u8>, CanonicalError> {
    let mut stripped = payload.clone();
    if let serde_json::Value::Object(ref mut map) = stripped {
        map.remove("signature");
    }
    canonical_bytes(&stripped)
}
