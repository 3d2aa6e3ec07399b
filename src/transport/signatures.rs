// src/transport/signatures.rs

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;

use super::canonical::{signable_bytes, CanonicalError};

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("public key missing or malformed")]
    BadPublicKey,
    #[error("signature is not valid base64")]
    BadEncoding,
    #[error("signature verification failed")]
    Verification,
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

pub fn load_verifying_key(pem: &str) -> Result<VerifyingKey, SignatureError> {
    if pem.trim().is_empty() {
        return Err(SignatureError::BadPublicKey);
    }
    VerifyingKey::from_public_key_pem(pem).map_err(|_| SignatureError::BadPublicKey)
}

/// 对 payload 签名：先去掉 `signature` 字段做规范化，再做 Ed25519，返回 base64
pub fn sign_payload(
    payload: &serde_json::Value,
    key: &SigningKey,
) -> Result<String, SignatureError> {
    let bytes = signable_bytes(payload)?;
    Ok(BASE64.encode(key.sign(&bytes).to_bytes()))
}

/// 校验 payload 上的 Ed25519 签名。规范化规则与签名端完全一致，
/// payload 任何一个字节的变化都会导致校验失败。
pub fn verify_payload(
    payload: &serde_json::Value,
    signature_b64: &str,
    key: &VerifyingKey,
) -> Result<(), SignatureError> {
    if signature_b64.is_empty() {
        return Err(SignatureError::BadEncoding);
    }
    let raw = BASE64
        .decode(signature_b64)
        .map_err(|_| SignatureError::BadEncoding)?;
    let signature =
        Signature::try_from(raw.as_slice()).map_err(|_| SignatureError::Verification)?;
    let bytes = signable_bytes(payload)?;
    key.verify_strict(&bytes, &signature)
        .map_err(|_| SignatureError::Verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use rand::rngs::OsRng;
    use serde_json::json;

    fn keypair() -> (SigningKey, VerifyingKey) {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        (signing, verifying)
    }

    #[test]
    fn sign_verify_round_trip() {
        let (signing, verifying) = keypair();
        let payload = json!({"auction_id": "ctx_1", "bidder": "alpha", "price": 1.5});
        let signature = sign_payload(&payload, &signing).unwrap();
        verify_payload(&payload, &signature, &verifying).unwrap();
    }

    #[test]
    fn verify_ignores_key_order_and_signature_field() {
        let (signing, verifying) = keypair();
        let payload = json!({"a": 1, "b": "x"});
        let signature = sign_payload(&payload, &signing).unwrap();
        // 接收端看到的是带 signature 字段、key 顺序不同的同一载荷
        let received: serde_json::Value =
            serde_json::from_str(&format!(r#"{{"b":"x","signature":"{}","a":1}}"#, signature))
                .unwrap();
        verify_payload(&received, &signature, &verifying).unwrap();
    }

    #[test]
    fn mutated_payload_fails() {
        let (signing, verifying) = keypair();
        let payload = json!({"price": 1.5});
        let signature = sign_payload(&payload, &signing).unwrap();
        let tampered = json!({"price": 1.6});
        assert!(verify_payload(&tampered, &signature, &verifying).is_err());
    }

    #[test]
    fn mutated_signature_fails() {
        let (signing, verifying) = keypair();
        let payload = json!({"price": 1.5});
        let signature = sign_payload(&payload, &signing).unwrap();
        let mut raw = BASE64.decode(&signature).unwrap();
        raw[0] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(verify_payload(&payload, &tampered, &verifying).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (signing, _) = keypair();
        let (_, other) = keypair();
        let payload = json!({"price": 1.5});
        let signature = sign_payload(&payload, &signing).unwrap();
        assert!(verify_payload(&payload, &signature, &other).is_err());
    }

    #[test]
    fn pem_round_trip() {
        let (_, verifying) = keypair();
        let pem = verifying.to_public_key_pem(LineEnding::LF).unwrap();
        let loaded = load_verifying_key(&pem).unwrap();
        assert_eq!(loaded.as_bytes(), verifying.as_bytes());
        assert!(load_verifying_key("").is_err());
        assert!(load_verifying_key("not a key").is_err());
    }
}
