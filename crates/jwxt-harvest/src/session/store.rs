//! Encrypted-at-rest session bundle.
//!
//! ## Layout
//!
//! The bundle is a JSON document with a plaintext header and the cookie set
//! as RSA ciphertext chunks. The private key lives in a separate PEM file
//! and is generated once; regenerating it would orphan every bundle written
//! before.
//!
//! Loading never fails: any defect turns into a cache miss and the run falls
//! back to a fresh login.

use std::io::Write;
use std::path::Path;

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::cipher;
use crate::types::{now_ms, CookieRecord, HarvestError, HarvestResult};

pub const BUNDLE_VERSION: u32 = 1;
pub const BUNDLE_ALGORITHM: &str = "rsa-chunked-pkcs1v15";

/// Size of keys generated for the bundle.
pub const BUNDLE_KEY_BITS: usize = 2048;

/// On-disk bundle document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBundle {
    pub version: u32,
    #[serde(rename = "algo")]
    pub algorithm: String,
    #[serde(rename = "createdAtMs")]
    pub created_at: i64,
    #[serde(rename = "updatedAtMs")]
    pub updated_at: i64,
    #[serde(rename = "username", default)]
    pub owner_hint: String,
    #[serde(default)]
    pub ciphertext_chunks: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundlePayload {
    cookies: Vec<CookieRecord>,
    #[serde(default)]
    saved_at_ms: i64,
}

/// A decrypted bundle.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub owner_hint: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub cookies: Vec<CookieRecord>,
}

/// Load the bundle key, generating and persisting one on first use.
pub fn load_or_create_key_pair(key_path: &Path) -> HarvestResult<RsaPrivateKey> {
    if key_path.exists() {
        let pem = std::fs::read_to_string(key_path)?;
        return cipher::private_key_from_pem(&pem);
    }

    tracing::info!("generating session key at {}", key_path.display());
    let key = cipher::generate_private_key(BUNDLE_KEY_BITS)?;
    let pem = cipher::private_key_to_pem(&key)?;
    write_private(key_path, pem.as_bytes())?;
    Ok(key)
}

/// Load and decrypt the bundle. Every failure is a cache miss.
pub fn load_bundle(bundle_path: &Path, key_path: &Path) -> Option<StoredSession> {
    match try_load_bundle(bundle_path, key_path) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("discarding session bundle {}: {e}", bundle_path.display());
            None
        }
    }
}

fn try_load_bundle(bundle_path: &Path, key_path: &Path) -> HarvestResult<Option<StoredSession>> {
    if !bundle_path.exists() || !key_path.exists() {
        return Ok(None);
    }

    let raw = std::fs::read_to_string(bundle_path)?;
    let bundle: EncryptedBundle = serde_json::from_str(&raw)?;
    if bundle.version != BUNDLE_VERSION {
        tracing::debug!("bundle version {} != {BUNDLE_VERSION}", bundle.version);
        return Ok(None);
    }
    if bundle.algorithm != BUNDLE_ALGORITHM {
        tracing::debug!("bundle algorithm {} unsupported", bundle.algorithm);
        return Ok(None);
    }
    if bundle.ciphertext_chunks.is_empty() {
        return Ok(None);
    }

    let pem = std::fs::read_to_string(key_path)?;
    let key = cipher::private_key_from_pem(&pem)?;
    let plaintext = cipher::decrypt_chunks(&key, &bundle.ciphertext_chunks)?;
    let payload: BundlePayload = serde_json::from_slice(&plaintext)?;

    Ok(Some(StoredSession {
        owner_hint: bundle.owner_hint,
        created_at: bundle.created_at,
        updated_at: bundle.updated_at,
        cookies: payload.cookies,
    }))
}

/// Encrypt the cookie set and atomically replace the bundle file.
pub fn save_bundle(
    bundle_path: &Path,
    key_path: &Path,
    owner_hint: &str,
    cookies: &[CookieRecord],
) -> HarvestResult<()> {
    let key = load_or_create_key_pair(key_path)?;
    let public = RsaPublicKey::from(&key);
    let now = now_ms();

    let payload = serde_json::to_vec(&BundlePayload {
        cookies: cookies.to_vec(),
        saved_at_ms: now,
    })?;
    let chunks = cipher::encrypt_chunks(&public, &payload)?;

    let created_at = existing_created_at(bundle_path).unwrap_or(now);
    let bundle = EncryptedBundle {
        version: BUNDLE_VERSION,
        algorithm: BUNDLE_ALGORITHM.to_string(),
        created_at,
        updated_at: now,
        owner_hint: owner_hint.trim().to_string(),
        ciphertext_chunks: chunks,
    };
    let body = serde_json::to_vec_pretty(&bundle)?;
    write_private(bundle_path, &body)?;

    tracing::info!(
        "saved {} cookies to {}",
        cookies.len(),
        bundle_path.display()
    );
    Ok(())
}

/// Remove the bundle and its key. Missing files are fine.
pub fn clear(bundle_path: &Path, key_path: &Path) -> HarvestResult<()> {
    for path in [bundle_path, key_path] {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HarvestError::Io(e)),
        }
    }
    Ok(())
}

fn existing_created_at(bundle_path: &Path) -> Option<i64> {
    let raw = std::fs::read_to_string(bundle_path).ok()?;
    let bundle: EncryptedBundle = serde_json::from_str(&raw).ok()?;
    (bundle.version == BUNDLE_VERSION && bundle.created_at > 0).then_some(bundle.created_at)
}

/// Write via a temp file in the same directory, restrict it, then rename.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> HarvestResult<()> {
    write_atomic(path, bytes, true)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8], owner_only: bool) -> HarvestResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    {
        let mut file = std::fs::File::create(&tmp_path)?;
        if owner_only {
            restrict_permissions(&tmp_path)?;
        }
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(HarvestError::Io(e));
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> HarvestResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> HarvestResult<()> {
    Ok(())
}
