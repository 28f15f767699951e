//! Configuration loading and resolution.
//!
//! Defaults are tuned against one deployment's undocumented throttling and
//! can be overridden through `JWXT_*` environment variables or the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Credentials;

/// Portal host.
pub const DEFAULT_PORTAL_ORIGIN: &str = "https://jwxt.shu.edu.cn";

/// SSO identity provider host.
pub const DEFAULT_SSO_ORIGIN: &str = "https://newsso.shu.edu.cn";

/// The SSO login page's fixed RSA key for password transport.
pub const SSO_PUBLIC_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQDl/aCgRl9f/4ON9MewoVnV58OL
OU2ALBi2FKc5yIsfSpivKxe7A6FitJjHva3WpM7gvVOinMehp6if2UNIkbaN+plW
f5IwqEVxsNZpeixc4GsbY9dXEk3WtRjwGSyDLySzEESH/kpJVoxO7ijRYqU+2oSR
wTBNePOk1H+LRQokgQIDAQAB
-----END PUBLIC KEY-----";

pub const DEFAULT_WORKERS: usize = 12;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BACKOFF_STEP_MS: u64 = 600;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Browser identity replayed on every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
                              AppleWebKit/537.36 (KHTML, like Gecko) \
                              Chrome/120.0.0.0 Safari/537.36";

/// Everything the engine needs to talk to one portal deployment.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub portal_origin: String,
    pub sso_origin: String,
    pub sso_public_key_pem: String,
    /// Stage B pool size.
    pub workers: usize,
    /// Total attempts per detail request, first one included.
    pub max_attempts: u32,
    /// Linear backoff unit; attempt `n` sleeps `n * backoff_step`.
    pub backoff_step: Duration,
    /// Aggregate minimum spacing between any two requests.
    pub request_interval: Duration,
    pub timeout: Duration,
    /// Skip TLS verification; the portal has served broken chains before.
    pub accept_invalid_certs: bool,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            portal_origin: DEFAULT_PORTAL_ORIGIN.to_string(),
            sso_origin: DEFAULT_SSO_ORIGIN.to_string(),
            sso_public_key_pem: SSO_PUBLIC_KEY_PEM.to_string(),
            workers: DEFAULT_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_step: Duration::from_millis(DEFAULT_BACKOFF_STEP_MS),
            request_interval: Duration::ZERO,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            accept_invalid_certs: false,
        }
    }
}

impl HarvestConfig {
    /// Defaults overlaid with `JWXT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(origin) = std::env::var("JWXT_HOST") {
            config.portal_origin = origin.trim_end_matches('/').to_string();
        }
        if let Ok(origin) = std::env::var("JWXT_SSO_HOST") {
            config.sso_origin = origin.trim_end_matches('/').to_string();
        }
        if let Some(workers) = env_parse::<usize>("JWXT_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(secs) = env_parse::<f64>("JWXT_REQUEST_INTERVAL") {
            config.request_interval = interval_from_secs(secs);
        }
        if let Ok(flag) = std::env::var("JWXT_INSECURE_TLS") {
            config.accept_invalid_certs = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        config
    }

    /// Absolute URL for a portal path.
    pub fn portal_url(&self, path: &str) -> String {
        format!("{}{}", self.portal_origin.trim_end_matches('/'), path)
    }
}

/// Negative or non-finite intervals collapse to zero.
pub fn interval_from_secs(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Base directory for local state (~/.jwxt-harvest).
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".jwxt-harvest")
}

/// Default encrypted session bundle location.
pub fn default_bundle_path() -> PathBuf {
    state_dir().join("session.enc.json")
}

/// Default private key location for the session bundle.
pub fn default_key_path() -> PathBuf {
    state_dir().join("session_rsa.pem")
}

/// Default local secrets file (`{"username": ..., "password": ...}`).
pub fn default_secrets_path() -> PathBuf {
    state_dir().join("secrets.json")
}

/// Cloud snapshot root, if configured.
pub fn cloud_base_url_from_env() -> Option<String> {
    std::env::var("JWXT_CLOUD_BASE_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve credentials without prompting.
///
/// Priority: explicit values, then `JWXT_USERNAME`/`JWXT_PASSWORD`, then the
/// secrets file. Each source only counts when it supplies both halves.
pub fn resolve_credentials(
    identifier: Option<&str>,
    secret: Option<&str>,
    secrets_path: &Path,
) -> Option<Credentials> {
    if let (Some(id), Some(secret)) = (non_empty(identifier), non_empty(secret)) {
        return Some(Credentials::new(id, secret));
    }

    let env_id = std::env::var("JWXT_USERNAME").ok();
    let env_secret = std::env::var("JWXT_PASSWORD").ok();
    if let (Some(id), Some(secret)) = (non_empty(env_id.as_deref()), non_empty(env_secret.as_deref()))
    {
        return Some(Credentials::new(id, secret));
    }

    load_secrets_file(secrets_path)
}

fn load_secrets_file(path: &Path) -> Option<Credentials> {
    let raw = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let id = value.get("username")?.as_str()?;
    let secret = value.get("password")?.as_str()?;
    match (non_empty(Some(id)), non_empty(Some(secret))) {
        (Some(id), Some(secret)) => Some(Credentials::new(id, secret)),
        _ => None,
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_portal_url_joins_without_double_slash() {
        let config = HarvestConfig {
            portal_origin: "http://127.0.0.1:9000/".into(),
            ..Default::default()
        };
        assert_eq!(
            config.portal_url("/sso/shulogin"),
            "http://127.0.0.1:9000/sso/shulogin"
        );
    }

    #[test]
    fn test_interval_from_secs_clamps() {
        assert_eq!(interval_from_secs(-1.0), Duration::ZERO);
        assert_eq!(interval_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(interval_from_secs(0.25), Duration::from_millis(250));
    }

    #[test]
    fn test_explicit_credentials_win() {
        let dir = tempfile::tempdir().unwrap();
        let creds =
            resolve_credentials(Some("alice"), Some("pw"), &dir.path().join("none.json")).unwrap();
        assert_eq!(creds.identifier, "alice");
        assert_eq!(creds.secret, "pw");
    }

    #[test]
    fn test_secrets_file_requires_both_halves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, r#"{"username": "bob", "password": ""}"#).unwrap();
        assert!(load_secrets_file(&path).is_none());

        std::fs::write(&path, r#"{"username": "bob", "password": "pw"}"#).unwrap();
        let creds = load_secrets_file(&path).unwrap();
        assert_eq!(creds.identifier, "bob");
    }
}
