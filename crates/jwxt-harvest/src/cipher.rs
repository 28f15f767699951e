//! Chunked RSA (PKCS#1 v1.5) transform for secrets and cookie payloads.
//!
//! A PKCS#1 v1.5 block carries at most `modulus_bytes - 11` bytes of
//! plaintext, so larger payloads are cut into blocks that are encrypted one
//! by one and base64-encoded. Decryption concatenates the blocks in order.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::types::{HarvestError, HarvestResult};

/// PKCS#1 v1.5 padding overhead per block.
const PKCS1_V15_OVERHEAD: usize = 11;

/// Largest plaintext block the key can carry.
pub fn max_block_len(key: &RsaPublicKey) -> usize {
    key.size().saturating_sub(PKCS1_V15_OVERHEAD)
}

/// Encrypt `plaintext` into base64 chunks, one per block.
pub fn encrypt_chunks(key: &RsaPublicKey, plaintext: &[u8]) -> HarvestResult<Vec<String>> {
    let block_len = max_block_len(key);
    if block_len == 0 {
        return Err(HarvestError::Crypto("key too small for PKCS#1 v1.5".into()));
    }

    let mut rng = rand::thread_rng();
    plaintext
        .chunks(block_len)
        .map(|block| {
            key.encrypt(&mut rng, Pkcs1v15Encrypt, block)
                .map(|encrypted| BASE64.encode(encrypted))
                .map_err(|e| HarvestError::Crypto(format!("encrypt block: {e}")))
        })
        .collect()
}

/// Decrypt base64 chunks produced by [`encrypt_chunks`].
pub fn decrypt_chunks(key: &RsaPrivateKey, chunks: &[String]) -> HarvestResult<Vec<u8>> {
    let mut out = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let encrypted = BASE64
            .decode(chunk.trim())
            .map_err(|e| HarvestError::Crypto(format!("chunk {i}: malformed base64: {e}")))?;
        let block = key
            .decrypt(Pkcs1v15Encrypt, &encrypted)
            .map_err(|e| HarvestError::Crypto(format!("chunk {i}: {e}")))?;
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Encrypt a login secret for transport: exactly one block, base64.
pub fn encrypt_secret(public_key_pem: &str, secret: &str) -> HarvestResult<String> {
    let key = parse_public_key_pem(public_key_pem)?;
    if secret.len() > max_block_len(&key) {
        return Err(HarvestError::Crypto(
            "secret does not fit in a single RSA block".into(),
        ));
    }
    let mut chunks = encrypt_chunks(&key, secret.as_bytes())?;
    chunks
        .pop()
        .ok_or_else(|| HarvestError::Crypto("empty secret".into()))
}

/// Parse an SPKI (`BEGIN PUBLIC KEY`) PEM.
pub fn parse_public_key_pem(pem: &str) -> HarvestResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| HarvestError::Crypto(format!("invalid public key: {e}")))
}

/// Generate a fresh private key.
pub fn generate_private_key(bits: usize) -> HarvestResult<RsaPrivateKey> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| HarvestError::Crypto(format!("key generation failed: {e}")))
}

/// PKCS#1 PEM encoding of a private key.
pub fn private_key_to_pem(key: &RsaPrivateKey) -> HarvestResult<String> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map(|pem| pem.to_string())
        .map_err(|e| HarvestError::Crypto(format!("encode private key: {e}")))
}

/// Parse a PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM.
pub fn private_key_from_pem(pem: &str) -> HarvestResult<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem.trim())
        .map_err(|e| HarvestError::Crypto(format!("invalid private key: {e}")))
}
