//! Catalog output: one snapshot file per (term, round) plus the
//! `current.json` index listing every snapshot written so far.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::fields::hidden;
use crate::session::store::write_atomic;
use crate::types::{HarvestError, HarvestResult, TermIndexEntry, TermSnapshot};

pub const TERMS_DIR: &str = "terms";
pub const INDEX_FILE: &str = "current.json";

fn field<'a>(fields: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    fields.get(key).map(|s| s.trim()).unwrap_or("")
}

/// `<year>-<semester>` from the selection page fields.
pub fn term_code(fields: &BTreeMap<String, String>) -> String {
    format!("{}-{}", field(fields, hidden::YEAR), field(fields, hidden::SEMESTER))
}

/// Display name, falling back to codes and finally to `term_code`.
pub fn term_name(fields: &BTreeMap<String, String>, term_code: &str) -> String {
    let name = format!(
        "{} {}",
        name_or_code(fields, hidden::YEAR_NAME, hidden::YEAR),
        name_or_code(fields, hidden::SEMESTER_NAME, hidden::SEMESTER)
    );
    match name.trim() {
        "" => term_code.to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn name_or_code<'a>(fields: &'a BTreeMap<String, String>, name_key: &str, code_key: &str) -> &'a str {
    match field(fields, name_key) {
        "" => field(fields, code_key),
        name => name,
    }
}

/// Snapshot id: the term code, suffixed with the round when there is one.
pub fn term_id(term_code: &str, round_id: &str) -> String {
    let round_id = round_id.trim();
    if round_id.is_empty() {
        term_code.to_string()
    } else {
        format!("{term_code}--xkkz-{round_id}")
    }
}

/// Whether `term_id` can name a file under `terms/` as-is.
pub fn is_safe_term_id(term_id: &str) -> bool {
    !term_id.is_empty()
        && !term_id.contains(['/', '\\'])
        && !term_id.contains("..")
        && !term_id.chars().any(char::is_control)
}

fn snapshot_path(output_dir: &Path, term_id: &str) -> PathBuf {
    let file_name: String = term_id
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    output_dir.join(TERMS_DIR).join(format!("{file_name}.json"))
}

/// Write `terms/<termId>.json`. An empty catalog is refused.
pub fn write_snapshot(output_dir: &Path, snapshot: &TermSnapshot) -> HarvestResult<PathBuf> {
    if snapshot.courses.is_empty() {
        return Err(HarvestError::EmptyCatalog);
    }
    let path = snapshot_path(output_dir, &snapshot.term_id);
    let body = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(&path, &body, false)?;
    tracing::info!(
        "wrote {} teaching classes to {}",
        snapshot.courses.len(),
        path.display()
    );
    Ok(path)
}

/// Index entry describing `snapshot`.
pub fn index_entry(snapshot: &TermSnapshot, term_code: &str) -> TermIndexEntry {
    TermIndexEntry {
        term_id: snapshot.term_id.clone(),
        term_code: term_code.to_string(),
        round: Some(snapshot.round.clone()),
        generated_at: Some(snapshot.generated_at),
    }
}

/// Parse an index document, upgrading the legacy `string[]` form.
pub fn parse_index(raw: &Value) -> Vec<TermIndexEntry> {
    let Some(items) = raw.as_array() else {
        return Vec::new();
    };
    if items.first().is_some_and(Value::is_string) {
        return items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|term_id| TermIndexEntry {
                term_id: term_id.to_string(),
                ..Default::default()
            })
            .collect();
    }
    items
        .iter()
        .filter(|v| v.is_object())
        .filter_map(|v| serde_json::from_value::<TermIndexEntry>(v.clone()).ok())
        .collect()
}

/// Existing index at `path`; unreadable or malformed files count as empty.
pub fn load_index(path: &Path) -> Vec<TermIndexEntry> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => parse_index(&value),
        Err(e) => {
            tracing::warn!("ignoring malformed index {}: {e}", path.display());
            Vec::new()
        }
    }
}

fn entry_key(entry: &TermIndexEntry) -> (String, String) {
    let round_id = entry
        .round
        .as_ref()
        .map(|r| r.round_id.trim().to_string())
        .unwrap_or_default();
    (entry.term_id.trim().to_string(), round_id)
}

fn entry_order(entry: &TermIndexEntry) -> (i64, i64) {
    let ordinal = entry
        .round
        .as_ref()
        .and_then(|r| r.ordinal.trim().parse::<i64>().ok())
        .unwrap_or(0);
    (ordinal, entry.generated_at.unwrap_or(0))
}

/// Replace-or-append `entry`, drop duplicate keys, order by round ordinal
/// then generation time.
pub fn merge_index(existing: Vec<TermIndexEntry>, entry: TermIndexEntry) -> Vec<TermIndexEntry> {
    let entry_key_value = entry_key(&entry);
    let mut seen = HashSet::new();
    let mut merged: Vec<TermIndexEntry> = existing
        .into_iter()
        .filter(|e| {
            let key = entry_key(e);
            key != entry_key_value && seen.insert(key)
        })
        .collect();
    merged.push(entry);
    merged.sort_by_key(entry_order);
    merged
}

/// Merge `entry` into `<output_dir>/current.json`.
pub fn update_index(output_dir: &Path, entry: TermIndexEntry) -> HarvestResult<Vec<TermIndexEntry>> {
    let path = output_dir.join(INDEX_FILE);
    let merged = merge_index(load_index(&path), entry);
    write_index(&path, &merged)?;
    tracing::info!("{} updated: {} entries", path.display(), merged.len());
    Ok(merged)
}

/// Overwrite an index file.
pub fn write_index(path: &Path, entries: &[TermIndexEntry]) -> HarvestResult<()> {
    let body = serde_json::to_vec_pretty(entries)?;
    write_atomic(path, &body, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RoundMeta, TeachingClass};
    use serde_json::json;

    fn page_fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn entry(term_id: &str, round_id: &str, ordinal: &str, at: i64) -> TermIndexEntry {
        TermIndexEntry {
            term_id: term_id.into(),
            term_code: "2024-3".into(),
            round: Some(RoundMeta {
                round_id: round_id.into(),
                ordinal: ordinal.into(),
                ordinal_name: String::new(),
            }),
            generated_at: Some(at),
        }
    }

    fn snapshot(courses: Vec<TeachingClass>) -> TermSnapshot {
        TermSnapshot {
            backend_origin: "https://portal.test".into(),
            term_name: "2024-2025 春".into(),
            term_id: "2024-3--xkkz-R1".into(),
            round: RoundMeta {
                round_id: "R1".into(),
                ordinal: "1".into(),
                ordinal_name: "第一轮".into(),
            },
            campus_options: Vec::new(),
            generated_at: 1_700_000_000_000,
            content_hash: "h".into(),
            courses,
        }
    }

    #[test]
    fn test_term_naming() {
        let fields = page_fields(&[
            ("xkxnm", "2024"),
            ("xkxqm", "3"),
            ("xkxnmc", "2024-2025"),
            ("xkxqmc", ""),
        ]);
        let code = term_code(&fields);
        assert_eq!(code, "2024-3");
        assert_eq!(term_name(&fields, &code), "2024-2025 3");
        assert_eq!(term_name(&page_fields(&[]), "-"), "-");
        assert_eq!(term_id(&code, "R1"), "2024-3--xkkz-R1");
        assert_eq!(term_id(&code, " "), "2024-3");
    }

    #[test]
    fn test_safe_term_ids() {
        assert!(is_safe_term_id("2024-3--xkkz-R1"));
        for bad in ["", "../x", "a/b", "a\\b", "..", "x\n"] {
            assert!(!is_safe_term_id(bad), "{bad:?}");
        }
    }

    #[test]
    fn test_legacy_index_upgrade() {
        let entries = parse_index(&json!(["2023-1", " ", "2023-2"]));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].term_id, "2023-2");
        assert!(entries[1].round.is_none());

        assert!(parse_index(&json!({"termId": "x"})).is_empty());
    }

    #[test]
    fn test_merge_replaces_same_key_and_sorts() {
        let existing = vec![
            entry("T--xkkz-R2", "R2", "2", 50),
            entry("T--xkkz-R1", "R1", "1", 10),
            entry("T--xkkz-R1", "R1", "1", 20),
            TermIndexEntry {
                term_id: "legacy".into(),
                ..Default::default()
            },
        ];
        let merged = merge_index(existing, entry("T--xkkz-R1", "R1", "1", 99));
        let ids: Vec<_> = merged.iter().map(|e| (e.term_id.as_str(), e.generated_at)).collect();
        assert_eq!(
            ids,
            [("legacy", None), ("T--xkkz-R1", Some(99)), ("T--xkkz-R2", Some(50))]
        );
    }

    #[test]
    fn test_empty_catalog_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_snapshot(dir.path(), &snapshot(Vec::new())).unwrap_err();
        assert!(matches!(err, HarvestError::EmptyCatalog));
        assert!(!dir.path().join(TERMS_DIR).exists());
    }

    #[test]
    fn test_write_snapshot_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let snap = snapshot(vec![TeachingClass {
            course_id: "C1".into(),
            teacher_name: "王五".into(),
            ..Default::default()
        }]);
        let path = write_snapshot(dir.path(), &snap).unwrap();
        assert_eq!(path, dir.path().join("terms/2024-3--xkkz-R1.json"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("王五"));
        let doc: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(doc["jwxtRound"]["xkkzId"], "R1");
        assert_eq!(doc["updateTimeMs"], 1_700_000_000_000i64);

        std::fs::write(dir.path().join(INDEX_FILE), r#"["2023-1"]"#).unwrap();
        let merged = update_index(dir.path(), index_entry(&snap, "2024-3")).unwrap();
        assert_eq!(merged.len(), 2);

        let reloaded = load_index(&dir.path().join(INDEX_FILE));
        assert_eq!(reloaded, merged);
        assert_eq!(reloaded[1].term_code, "2024-3");
    }
}
