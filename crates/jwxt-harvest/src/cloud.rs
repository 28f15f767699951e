//! Fallback source: a static mirror of previously published catalogs.
//!
//! The mirror has the same layout the catalog writer produces
//! (`current.json` plus `terms/<termId>.json`) and needs no login.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::{is_safe_term_id, INDEX_FILE, TERMS_DIR};
use crate::config::HarvestConfig;
use crate::http_client::{HttpClient, RateLimiter};
use crate::session::store::write_atomic;
use crate::session::SessionJar;
use crate::types::{HarvestError, HarvestResult};

/// Parallel term downloads.
const DOWNLOAD_CONCURRENCY: usize = 4;

/// When to use the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudMode {
    /// Only when no session and no credentials are available.
    #[default]
    Auto,
    /// Instead of harvesting.
    Always,
    Never,
}

impl std::str::FromStr for CloudMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CloudMode::Auto),
            "always" => Ok(CloudMode::Always),
            "never" => Ok(CloudMode::Never),
            other => Err(format!("unknown cloud mode '{other}' (auto, always, never)")),
        }
    }
}

/// Term ids and the normalized index rows of a mirror's `current.json`.
///
/// Ids that could not be used as a file name under `terms/` are dropped.
pub fn parse_cloud_index(raw: &Value) -> (Vec<String>, Vec<Value>) {
    let mut term_ids = Vec::new();
    let mut rows = Vec::new();
    for item in raw.as_array().map(Vec::as_slice).unwrap_or(&[]) {
        let (id, row) = match item {
            Value::String(s) => {
                let id = s.trim();
                (id, serde_json::json!({ "termId": id }))
            }
            Value::Object(obj) => {
                let id = obj
                    .get("termId")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .unwrap_or("");
                (id, item.clone())
            }
            _ => continue,
        };
        if id.is_empty() {
            continue;
        }
        if !is_safe_term_id(id) {
            tracing::warn!("skipping cloud term with unsafe id {id:?}");
            continue;
        }
        term_ids.push(id.to_string());
        rows.push(row);
    }
    (term_ids, rows)
}

/// Download the mirror's latest term (or every term) into `output_dir`.
///
/// Returns the term ids written.
pub async fn download_cloud_snapshot(
    base_url: &str,
    output_dir: &Path,
    all_terms: bool,
    config: &HarvestConfig,
) -> HarvestResult<Vec<String>> {
    let base = base_url.trim_end_matches('/');
    let limiter = Arc::new(RateLimiter::new(config.request_interval));
    let client = HttpClient::new(Arc::new(SessionJar::new()), limiter, config)?;

    tracing::info!("downloading catalog snapshot from {base}");
    let resp = client.get(&format!("{base}/{INDEX_FILE}")).await?;
    resp.require_ok("cloud index")?;
    let (term_ids, rows) = parse_cloud_index(&resp.json("cloud index")?);
    let Some(latest) = term_ids.last() else {
        return Err(HarvestError::Parse(
            "cloud index is empty or has an unsupported schema".into(),
        ));
    };

    let targets: Vec<String> = if all_terms {
        term_ids.clone()
    } else {
        vec![latest.clone()]
    };
    let urls: Vec<String> = targets
        .iter()
        .map(|id| format!("{base}/{TERMS_DIR}/{id}.json"))
        .collect();

    let responses = client.get_many(&urls, DOWNLOAD_CONCURRENCY).await;
    for (term_id, result) in targets.iter().zip(responses) {
        let resp = result?;
        resp.require_ok(&format!("cloud term {term_id}"))?;
        let path = output_dir.join(TERMS_DIR).join(format!("{term_id}.json"));
        write_atomic(&path, resp.body.as_bytes(), false)?;
        tracing::debug!("wrote {}", path.display());
    }

    let index = serde_json::to_vec_pretty(&rows)?;
    write_atomic(&output_dir.join(INDEX_FILE), &index, false)?;
    tracing::info!("cloud snapshot downloaded: {} terms", targets.len());
    Ok(targets)
}
