//! Scope resolution and catalog merging.
//!
//! A run covers one round and one or more campuses. This module picks them,
//! builds the query context the list and detail endpoints expect, and folds
//! the per-scope record lists into one deduplicated, hashed catalog.

use std::collections::{BTreeMap, HashSet};

use sha2::{Digest, Sha256};

use crate::fields::{self, hidden, param};
use crate::pipeline::QueryContext;
use crate::types::{CampusOption, HarvestError, HarvestResult, RoundTab, TeachingClass};

/// Campus selection keyword for every campus.
pub const CAMPUS_ALL: &str = "all";
/// Campus selection keyword for the context's own campus.
pub const CAMPUS_CURRENT: &str = "current";

/// Campuses to harvest for `selector`.
pub fn resolve_campuses(
    options: &[CampusOption],
    selector: &str,
    current_id: &str,
) -> HarvestResult<Vec<CampusOption>> {
    if options.is_empty() {
        return Ok(vec![CampusOption::synthetic(current_id)]);
    }

    let selector = selector.trim();
    if selector.is_empty() || selector.eq_ignore_ascii_case(CAMPUS_ALL) {
        return Ok(options
            .iter()
            .filter(|o| !o.id.trim().is_empty())
            .cloned()
            .collect());
    }
    if selector.eq_ignore_ascii_case(CAMPUS_CURRENT) {
        // The dropdown's own selection wins over the context value.
        let found = options
            .iter()
            .find(|o| o.selected && !o.id.trim().is_empty())
            .or_else(|| options.iter().find(|o| o.id == current_id))
            .cloned();
        return Ok(vec![found.unwrap_or_else(|| CampusOption::synthetic(current_id))]);
    }

    let matched: Vec<CampusOption> = options
        .iter()
        .filter(|o| o.label.contains(selector) || o.id == selector)
        .cloned()
        .collect();
    if matched.is_empty() {
        return Err(HarvestError::NoMatchingCampus {
            selector: selector.to_string(),
            available: describe_campuses(options),
        });
    }
    Ok(matched)
}

fn describe_campuses(options: &[CampusOption]) -> String {
    options
        .iter()
        .map(|o| if o.label.is_empty() { o.id.as_str() } else { o.label.as_str() })
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_tabs(tabs: &[RoundTab]) -> String {
    tabs.iter()
        .map(|t| match &t.ordinal {
            Some(ordinal) => format!("{} (xklc {ordinal})", t.round_id),
            None => t.round_id.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// A tab standing in for `round_id` when the page shows no tabs at all.
pub fn synthetic_tab(round_id: &str, fields: &BTreeMap<String, String>) -> RoundTab {
    let get = |primary: &str, fallback: &str| {
        fields
            .get(primary)
            .filter(|v| !v.is_empty())
            .or_else(|| fields.get(fallback))
            .cloned()
            .unwrap_or_default()
    };
    RoundTab {
        round_id: round_id.to_string(),
        kind_code: get(hidden::FIRST_KIND_CODE, hidden::KIND_CODE),
        cohort_year_id: get(hidden::COHORT_ID, hidden::FIRST_COHORT_ID),
        major_group_id: get(hidden::MAJOR_ID, hidden::FIRST_MAJOR_ID),
        ..Default::default()
    }
}

/// Round pick for an explicit round id or the page default.
///
/// Ordinal-based selection needs each tab's display page and lives in
/// [`select_round_by_ordinal`].
pub fn resolve_round(
    tabs: &[RoundTab],
    round_id: Option<&str>,
    fields: &BTreeMap<String, String>,
) -> HarvestResult<Option<RoundTab>> {
    if let Some(wanted) = round_id.map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(tab) = tabs.iter().find(|t| t.round_id == wanted) {
            return Ok(Some(tab.clone()));
        }
        if !tabs.is_empty() {
            return Err(HarvestError::NoMatchingRound {
                selector: format!("xkkz_id {wanted}"),
                available: describe_tabs(tabs),
            });
        }
        return Ok(Some(synthetic_tab(wanted, fields)));
    }

    if tabs.is_empty() {
        return Ok(None);
    }
    let first_id = fields
        .get(hidden::FIRST_ROUND_ID)
        .map(|s| s.trim())
        .unwrap_or("");
    let chosen = tabs
        .iter()
        .find(|t| !first_id.is_empty() && t.round_id == first_id)
        .or_else(|| tabs.iter().find(|t| t.active))
        .or_else(|| tabs.first());
    Ok(chosen.cloned())
}

/// The enriched tab whose ordinal equals `ordinal`.
pub fn select_round_by_ordinal(enriched: &[RoundTab], ordinal: &str) -> HarvestResult<RoundTab> {
    let ordinal = ordinal.trim();
    enriched
        .iter()
        .find(|t| t.ordinal.as_deref().map(str::trim) == Some(ordinal))
        .cloned()
        .ok_or_else(|| HarvestError::NoMatchingRound {
            selector: format!("xklc {ordinal}"),
            available: describe_tabs(enriched),
        })
}

/// Point the `first*` fields at `tab` so the query context targets it.
pub fn apply_round(fields: &mut BTreeMap<String, String>, tab: &RoundTab) {
    fields.insert(hidden::FIRST_ROUND_ID.to_string(), tab.round_id.clone());
    fields.insert(hidden::FIRST_KIND_CODE.to_string(), tab.kind_code.clone());
    fields.insert(hidden::FIRST_COHORT_ID.to_string(), tab.cohort_year_id.clone());
    fields.insert(hidden::FIRST_MAJOR_ID.to_string(), tab.major_group_id.clone());
    if !tab.label.is_empty() {
        fields.insert(hidden::FIRST_KIND_NAME.to_string(), tab.label.clone());
    }
}

/// Defaults, overlaid with non-empty page fields, keyed to the `first*` round.
pub fn build_query_context(fields: &BTreeMap<String, String>) -> HarvestResult<QueryContext> {
    let mut context: QueryContext = fields::DEFAULT_FIELD_VALUES
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    for key in fields::REQUEST_FIELD_KEYS {
        if let Some(value) = fields.get(*key).filter(|v| !v.is_empty()) {
            context.insert(key.to_string(), value.clone());
        }
    }

    for (target, source) in [
        (param::ROUND_ID, hidden::FIRST_ROUND_ID),
        (param::KIND_CODE, hidden::FIRST_KIND_CODE),
        (param::COHORT_ID, hidden::FIRST_COHORT_ID),
        (param::MAJOR_ID, hidden::FIRST_MAJOR_ID),
    ] {
        let value = fields
            .get(source)
            .filter(|v| !v.is_empty())
            .or_else(|| context.get(target))
            .cloned()
            .unwrap_or_default();
        context.insert(target.to_string(), value);
    }

    if context.get(param::ROUND_ID).map_or(true, |v| v.trim().is_empty()) {
        return Err(HarvestError::MissingSelectionContext(format!(
            "empty {} in query context",
            param::ROUND_ID
        )));
    }
    Ok(context)
}

/// The context with its campus switched to `campus`, if the campus names one.
pub fn campus_context(context: &QueryContext, campus: &CampusOption) -> QueryContext {
    let mut scoped = context.clone();
    let id = campus.id.trim();
    if !id.is_empty() {
        scoped.insert(param::CAMPUS_ID.to_string(), id.to_string());
    }
    scoped
}

/// Fold `incoming` into `merged`, first occurrence of an identity wins.
pub fn merge_records(merged: &mut Vec<TeachingClass>, incoming: Vec<TeachingClass>) -> usize {
    let mut seen: HashSet<(String, String, String)> = merged
        .iter()
        .map(identity_key)
        .collect();
    let before = merged.len();
    for record in incoming {
        if seen.insert(identity_key(&record)) {
            merged.push(record);
        }
    }
    merged.len() - before
}

fn identity_key(record: &TeachingClass) -> (String, String, String) {
    let (course, class, batch) = record.identity();
    (course.to_string(), class.to_string(), batch.to_string())
}

/// Sort by (courseId, teachingClassId); stable, so batches keep merge order.
pub fn sort_records(records: &mut [TeachingClass]) {
    records.sort_by(|a, b| {
        (a.course_id.as_str(), a.teaching_class_id.as_str())
            .cmp(&(b.course_id.as_str(), b.teaching_class_id.as_str()))
    });
}

/// SHA-256 hex over the canonical JSON of the records in canonical order.
pub fn content_hash(records: &[TeachingClass]) -> HarvestResult<String> {
    // serde_json's default map is ordered, so `Value` renders keys sorted.
    let mut canonical = records
        .iter()
        .map(|r| -> HarvestResult<(&str, &str, &str, String)> {
            let text = serde_json::to_value(r).and_then(|v| serde_json::to_string(&v))?;
            Ok((r.course_id.as_str(), r.teaching_class_id.as_str(), r.batch_id.as_str(), text))
        })
        .collect::<HarvestResult<Vec<_>>>()?;
    canonical.sort();

    let mut hasher = Sha256::new();
    hasher.update(b"[");
    for (i, (_, _, _, text)) in canonical.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(text.as_bytes());
    }
    hasher.update(b"]");
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campus(id: &str, label: &str, selected: bool) -> CampusOption {
        CampusOption {
            id: id.into(),
            label: label.into(),
            selected,
        }
    }

    fn campuses() -> Vec<CampusOption> {
        vec![
            campus("1", "宝山校区", false),
            campus("2", "延长校区", true),
            campus("3", "嘉定校区", false),
            campus("", "全部", false),
        ]
    }

    fn tab(id: &str, active: bool) -> RoundTab {
        RoundTab {
            round_id: id.into(),
            kind_code: "01".into(),
            active,
            ..Default::default()
        }
    }

    fn record(course: &str, class: &str, batch: &str) -> TeachingClass {
        TeachingClass {
            course_id: course.into(),
            teaching_class_id: class.into(),
            batch_id: batch.into(),
            ..Default::default()
        }
    }

    fn page_fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_campus_all_skips_blank_ids() {
        let picked = resolve_campuses(&campuses(), "ALL", "2").unwrap();
        let ids: Vec<_> = picked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(resolve_campuses(&campuses(), "", "2").unwrap().len(), 3);
    }

    #[test]
    fn test_campus_current_is_selected_option() {
        let picked = resolve_campuses(&campuses(), "current", "2").unwrap();
        assert_eq!(picked, vec![campus("2", "延长校区", true)]);

        // A stale context id does not override the flagged option.
        let picked = resolve_campuses(&campuses(), "CURRENT", "3").unwrap();
        assert_eq!(picked, vec![campus("2", "延长校区", true)]);
    }

    #[test]
    fn test_campus_current_without_selection() {
        let unflagged: Vec<_> = campuses()
            .into_iter()
            .map(|c| CampusOption { selected: false, ..c })
            .collect();
        let picked = resolve_campuses(&unflagged, "current", "3").unwrap();
        assert_eq!(picked, vec![campus("3", "嘉定校区", false)]);

        let synthetic = resolve_campuses(&unflagged, "Current", "9").unwrap();
        assert_eq!(synthetic, vec![CampusOption::synthetic("9")]);
    }

    #[test]
    fn test_campus_no_options_is_synthetic() {
        for selector in ["all", "current", "宝山"] {
            let picked = resolve_campuses(&[], selector, "7").unwrap();
            assert_eq!(picked, vec![CampusOption::synthetic("7")]);
        }
    }

    #[test]
    fn test_campus_label_or_id_match() {
        let picked = resolve_campuses(&campuses(), "延长", "1").unwrap();
        assert_eq!(picked[0].id, "2");
        let picked = resolve_campuses(&campuses(), "3", "1").unwrap();
        assert_eq!(picked[0].label, "嘉定校区");
        let picked = resolve_campuses(&campuses(), "校区", "1").unwrap();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_campus_no_match_lists_options() {
        let err = resolve_campuses(&campuses(), "Xyz", "1").unwrap_err();
        match err {
            HarvestError::NoMatchingCampus { selector, available } => {
                assert_eq!(selector, "Xyz");
                assert!(available.contains("宝山校区"));
                assert!(available.contains("全部"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_round_default_prefers_first_round_id() {
        let tabs = vec![tab("A", true), tab("B", false)];
        let fields = page_fields(&[("firstXkkzId", "B")]);
        assert_eq!(resolve_round(&tabs, None, &fields).unwrap().unwrap().round_id, "B");

        let fields = page_fields(&[("firstXkkzId", "Z")]);
        assert_eq!(resolve_round(&tabs, None, &fields).unwrap().unwrap().round_id, "A");

        let tabs = vec![tab("A", false), tab("B", false)];
        assert_eq!(resolve_round(&tabs, None, &fields).unwrap().unwrap().round_id, "A");
        assert!(resolve_round(&[], None, &fields).unwrap().is_none());
    }

    #[test]
    fn test_round_explicit_id() {
        let tabs = vec![tab("A", true), tab("B", false)];
        let fields = page_fields(&[]);
        assert_eq!(resolve_round(&tabs, Some("B"), &fields).unwrap().unwrap().round_id, "B");
        assert!(matches!(
            resolve_round(&tabs, Some("C"), &fields),
            Err(HarvestError::NoMatchingRound { .. })
        ));

        let fields = page_fields(&[("firstKklxdm", "10"), ("njdm_id", "2024"), ("firstZyhId", "Z")]);
        let synthetic = resolve_round(&[], Some("C"), &fields).unwrap().unwrap();
        assert_eq!(synthetic.round_id, "C");
        assert_eq!(synthetic.kind_code, "10");
        assert_eq!(synthetic.cohort_year_id, "2024");
        assert_eq!(synthetic.major_group_id, "Z");
    }

    #[test]
    fn test_round_by_ordinal() {
        let mut a = tab("A", true);
        a.ordinal = Some("1".into());
        let mut b = tab("B", false);
        b.ordinal = Some("2".into());
        let tabs = vec![a, b];
        assert_eq!(select_round_by_ordinal(&tabs, "2").unwrap().round_id, "B");
        assert!(matches!(
            select_round_by_ordinal(&tabs, "3"),
            Err(HarvestError::NoMatchingRound { .. })
        ));
    }

    #[test]
    fn test_query_context_overlay() {
        let mut fields = page_fields(&[
            ("xszxzt", ""),
            ("xkxnm", "2024"),
            ("rwlx", "2"),
            ("unrelated", "x"),
        ]);
        let tab = RoundTab {
            round_id: "R1".into(),
            kind_code: "01".into(),
            cohort_year_id: "2024".into(),
            major_group_id: "Z".into(),
            label: "主修".into(),
            ..Default::default()
        };
        apply_round(&mut fields, &tab);

        let context = build_query_context(&fields).unwrap();
        assert_eq!(context["xkkz_id"], "R1");
        assert_eq!(context["kklxdm"], "01");
        assert_eq!(context["njdm_id"], "2024");
        assert_eq!(context["zyh_id"], "Z");
        assert_eq!(context["rwlx"], "2");
        assert_eq!(context["xszxzt"], "1");
        assert_eq!(context["xkxnm"], "2024");
        assert!(!context.contains_key("unrelated"));
    }

    #[test]
    fn test_query_context_requires_round_id() {
        let err = build_query_context(&page_fields(&[("xkxnm", "2024")])).unwrap_err();
        assert!(matches!(err, HarvestError::MissingSelectionContext(_)));
    }

    #[test]
    fn test_campus_context_only_overrides_named_campus() {
        let mut context = QueryContext::new();
        context.insert("xqh_id".into(), "2".into());
        assert_eq!(campus_context(&context, &campus("3", "", false))["xqh_id"], "3");
        assert_eq!(campus_context(&context, &CampusOption::synthetic(""))["xqh_id"], "2");
    }

    #[test]
    fn test_merge_first_wins_and_idempotent() {
        let mut first = record("C1", "T1", "R");
        first.teacher_name = "first".into();
        let mut dup = record("C1", "T1", "R");
        dup.teacher_name = "second".into();

        let mut merged = Vec::new();
        assert_eq!(merge_records(&mut merged, vec![first.clone(), record("C2", "T1", "R")]), 2);
        assert_eq!(merge_records(&mut merged, vec![dup, record("C1", "T1", "R2")]), 1);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].teacher_name, "first");

        let snapshot = merged.clone();
        assert_eq!(merge_records(&mut merged, snapshot), 0);
    }

    #[test]
    fn test_sort_orders_by_course_then_class() {
        let mut records = vec![record("C2", "A", "R"), record("C1", "B", "R"), record("C1", "A", "R")];
        sort_records(&mut records);
        let keys: Vec<_> = records
            .iter()
            .map(|r| (r.course_id.as_str(), r.teaching_class_id.as_str()))
            .collect();
        assert_eq!(keys, [("C1", "A"), ("C1", "B"), ("C2", "A")]);
    }

    #[test]
    fn test_hash_order_invariant_and_content_sensitive() {
        let a = vec![record("C1", "A", "R"), record("C2", "B", "R"), record("C1", "A", "R2")];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());

        let mut c = a.clone();
        c[1].capacity = "31".into();
        assert_ne!(content_hash(&a).unwrap(), content_hash(&c).unwrap());
        assert_eq!(content_hash(&a).unwrap().len(), 64);
    }
}
