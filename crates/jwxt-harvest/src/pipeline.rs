//! Course list and teaching-class detail fetching.
//!
//! ## Stages
//!
//! - **A**: one list POST per scope, reduced to distinct course summaries.
//! - **B**: a fixed pool of worker tasks drains a shared queue of summaries.
//!   Each worker has its own client over a private jar seeded from the shared
//!   session, and re-seeds it before every retry.
//! - **C**: records are gathered in completion order; failures become a
//!   short deduplicated warning list instead of an error.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::config::HarvestConfig;
use crate::fields::{self, detail_row, limitation, list_row, param};
use crate::http_client::{HttpClient, RateLimiter};
use crate::session::SessionJar;
use crate::types::{CourseSummary, HarvestError, HarvestResult, TeachingClass};

/// Distinct failure messages surfaced as warnings.
pub const WARNING_SAMPLE: usize = 5;

/// Query context: form parameters shared by list and detail requests.
pub type QueryContext = BTreeMap<String, String>;

/// A JSON row from the portal.
pub type Row = Map<String, Value>;

/// Result of a Stage B run.
#[derive(Debug, Default)]
pub struct DetailOutcome {
    pub records: Vec<TeachingClass>,
    /// Courses whose detail fetch failed for good.
    pub failed: usize,
    pub warnings: Vec<String>,
}

/// Headers the portal's own XHR calls carry.
pub fn ajax_headers(config: &HarvestConfig) -> Vec<(String, String)> {
    vec![
        ("X-Requested-With".to_string(), "XMLHttpRequest".to_string()),
        (
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=UTF-8".to_string(),
        ),
        ("Referer".to_string(), config.portal_url(fields::SELECTION_PATH)),
    ]
}

/// Render a JSON scalar the way the portal's pages show it.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn field(row: &Row, key: &str) -> String {
    row.get(key).map(value_text).unwrap_or_default()
}

/// Row array of a list or detail response: a bare array, or the first
/// non-empty `tmpList`/`rows` of an object.
pub fn response_rows(value: &Value) -> HarvestResult<Vec<Row>> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => fields::ROW_LIST_KEYS
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_array))
            .find(|a| !a.is_empty())
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        other => {
            return Err(HarvestError::Parse(format!(
                "expected rows, got {}",
                json_kind(other)
            )))
        }
    };
    Ok(items
        .iter()
        .filter_map(|v| v.as_object().cloned())
        .collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Stage A ───

/// POST the course-list endpoint for one scope.
pub async fn fetch_course_rows(
    client: &HttpClient,
    config: &HarvestConfig,
    context: &QueryContext,
) -> HarvestResult<Vec<Row>> {
    let mut form: Vec<(String, String)> = context
        .iter()
        .filter(|(k, _)| k.as_str() != param::PAGE_START && k.as_str() != param::PAGE_END)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    form.push((param::PAGE_START.to_string(), "1".to_string()));
    form.push((param::PAGE_END.to_string(), fields::LIST_PAGE_END.to_string()));

    let resp = client
        .post_form(
            &config.portal_url(fields::COURSE_LIST_PATH),
            &form,
            &ajax_headers(config),
        )
        .await?;
    resp.require_ok("course list")?;
    let rows = response_rows(&resp.json("course list")?)?;
    tracing::debug!("course list returned {} rows", rows.len());
    Ok(rows)
}

/// Distinct summaries keyed by `kch_id` (else `kch`), first row wins.
pub fn summarize_rows(rows: &[Row], max_courses: Option<usize>) -> Vec<CourseSummary> {
    let mut seen = HashSet::new();
    let mut summaries = Vec::new();

    for row in rows {
        let mut lookup_key = field(row, list_row::LOOKUP_KEY);
        if lookup_key.is_empty() {
            lookup_key = field(row, list_row::COURSE_ID);
        }
        if lookup_key.is_empty() || !seen.insert(lookup_key.clone()) {
            continue;
        }

        let course_id = match field(row, list_row::COURSE_ID) {
            id if id.is_empty() => lookup_key.clone(),
            id => id,
        };
        summaries.push(CourseSummary {
            course_id,
            course_name: field(row, list_row::COURSE_NAME),
            credit: field(row, list_row::CREDIT),
            reuse_flag: flag(row, list_row::REUSE_FLAG),
            minor_flag: flag(row, list_row::MINOR_FLAG),
            raw: row.clone(),
            lookup_key,
        });
    }

    if let Some(limit) = max_courses {
        summaries.truncate(limit);
    }
    summaries
}

fn flag(row: &Row, key: &str) -> String {
    match field(row, key) {
        v if v.is_empty() => "0".to_string(),
        v => v,
    }
}

// ─── Stage B ───

/// Detail request form: the context minus paging, plus the course keys.
pub fn detail_form(context: &QueryContext, summary: &CourseSummary) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = context
        .iter()
        .filter(|(k, _)| {
            !matches!(
                k.as_str(),
                param::PAGE_START | param::PAGE_END | param::COURSE_KEY | param::REUSE_FLAG | param::MINOR_FLAG
            )
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    form.push((param::COURSE_KEY.to_string(), summary.lookup_key.clone()));
    form.push((param::REUSE_FLAG.to_string(), summary.reuse_flag.clone()));
    form.push((param::MINOR_FLAG.to_string(), summary.minor_flag.clone()));
    form
}

/// Fetch teaching-class details for every summary with a worker pool.
///
/// Only client construction can fail; per-course failures end up in
/// [`DetailOutcome::warnings`].
pub async fn fetch_details(
    shared: Arc<SessionJar>,
    limiter: Arc<RateLimiter>,
    config: &HarvestConfig,
    context: &QueryContext,
    summaries: Vec<CourseSummary>,
) -> HarvestResult<DetailOutcome> {
    let total = summaries.len();
    if total == 0 {
        return Ok(DetailOutcome::default());
    }

    let worker_count = config.workers.max(1).min(total);
    tracing::info!("fetching details for {total} courses with {worker_count} workers");

    let queue = Arc::new(Mutex::new(VecDeque::from(summaries)));
    let config = Arc::new(config.clone());
    let context = Arc::new(context.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut clients = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let private = Arc::new(SessionJar::from_records(shared.snapshot()));
        clients.push(HttpClient::new(private, Arc::clone(&limiter), &config)?);
    }

    for (id, client) in clients.into_iter().enumerate() {
        let worker = DetailWorker {
            id,
            client,
            shared: Arc::clone(&shared),
            config: Arc::clone(&config),
            context: Arc::clone(&context),
        };
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        tokio::spawn(async move { worker.run(queue, tx).await });
    }
    drop(tx);

    let mut outcome = DetailOutcome::default();
    let mut failures = Vec::new();
    let mut completed = 0usize;
    while let Some(result) = rx.recv().await {
        completed += 1;
        match result {
            Ok(mut records) => outcome.records.append(&mut records),
            Err(message) => failures.push(message),
        }
        if completed % 300 == 0 || completed == total {
            tracing::info!("course details: {completed}/{total}");
        }
    }

    outcome.failed = failures.len();
    outcome.warnings = summarize_failures(&failures);
    for warning in &outcome.warnings {
        tracing::warn!("{warning}");
    }
    Ok(outcome)
}

/// A count line followed by at most [`WARNING_SAMPLE`] distinct messages.
pub fn summarize_failures(failures: &[String]) -> Vec<String> {
    if failures.is_empty() {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    let unique: Vec<&String> = failures.iter().filter(|m| seen.insert(m.as_str())).collect();
    let shown = unique.len().min(WARNING_SAMPLE);

    let mut warnings = vec![format!(
        "{} detail requests failed ({shown} unique shown)",
        failures.len()
    )];
    warnings.extend(unique.into_iter().take(WARNING_SAMPLE).cloned());
    warnings
}

struct DetailWorker {
    id: usize,
    client: HttpClient,
    shared: Arc<SessionJar>,
    config: Arc<HarvestConfig>,
    context: Arc<QueryContext>,
}

type DetailResult = Result<Vec<TeachingClass>, String>;

impl DetailWorker {
    async fn run(
        self,
        queue: Arc<Mutex<VecDeque<CourseSummary>>>,
        tx: mpsc::UnboundedSender<DetailResult>,
    ) {
        loop {
            let next = queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(summary) = next else {
                break;
            };
            let result = self
                .fetch(&summary)
                .await
                .map_err(|e| format!("detail for {}: {e}", summary.lookup_key));
            if tx.send(result).is_err() {
                break;
            }
        }
        tracing::debug!("detail worker {} done", self.id);
    }

    async fn fetch(&self, summary: &CourseSummary) -> HarvestResult<Vec<TeachingClass>> {
        let url = self.config.portal_url(fields::COURSE_DETAIL_PATH);
        let form = detail_form(&self.context, summary);
        let headers = ajax_headers(&self.config);
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 1u32;
        loop {
            let err = match self.client.post_form(&url, &form, &headers).await {
                Ok(resp) if resp.status == 200 => {
                    let rows = response_rows(&resp.json("course detail")?)?;
                    return Ok(rows
                        .iter()
                        .map(|row| merge_course(row, summary, &self.context))
                        .collect());
                }
                Ok(resp) => HarvestError::UnexpectedStatus {
                    context: "course detail".to_string(),
                    status: resp.status,
                    snippet: resp.snippet(),
                },
                Err(e) => e,
            };

            if !err.retryable() || attempt >= max_attempts {
                return Err(err);
            }
            tracing::debug!(
                "detail {} attempt {attempt}/{max_attempts} failed: {err}",
                summary.lookup_key
            );
            self.client.jar().replace(self.shared.snapshot());
            tokio::time::sleep(self.config.backoff_step * attempt).await;
            attempt += 1;
        }
    }
}

// ─── Record enrichment ───

/// Build one teaching-class record from a detail row and its course summary.
pub fn merge_course(detail: &Row, summary: &CourseSummary, context: &QueryContext) -> TeachingClass {
    let (teacher_id, teacher_name, teacher_title) = split_teacher(&field(detail, detail_row::TEACHER));

    TeachingClass {
        course_id: summary.course_id.clone(),
        course_name: summary.course_name.clone(),
        credit: summary.credit.clone(),
        teacher_id,
        teacher_name,
        teacher_title,
        class_time: normalize_breaks(&field(detail, detail_row::CLASS_TIME)),
        campus: first_non_empty(detail, detail_row::CAMPUS),
        position: normalize_breaks(&field(detail, detail_row::POSITION)),
        capacity: field(detail, detail_row::CAPACITY),
        enrolled_count: field(detail, detail_row::ENROLLED),
        limitations: limitations(detail, summary),
        teaching_class_id: field(detail, detail_row::TEACHING_CLASS_ID),
        batch_id: context.get(param::ROUND_ID).cloned().unwrap_or_default(),
        academy: pick(detail, fields::ACADEMY_DETAIL_KEYS, &summary.raw, fields::ACADEMY_SUMMARY_KEYS, |_| true),
        major: pick(detail, fields::MAJOR_KEYS, &summary.raw, fields::MAJOR_KEYS, |_| true),
        teaching_mode: pick(
            detail,
            fields::TEACHING_MODE_DETAIL_KEYS,
            &summary.raw,
            fields::TEACHING_MODE_SUMMARY_KEYS,
            |_| true,
        ),
        language_mode: pick(detail, fields::LANGUAGE_MODE_KEYS, &summary.raw, fields::LANGUAGE_MODE_KEYS, |_| true),
        selection_note: pick(
            detail,
            fields::SELECTION_NOTE_KEYS,
            &summary.raw,
            fields::SELECTION_NOTE_KEYS,
            |v| v != fields::EMPTY_NOTE_MARKER,
        ),
        class_status: pick(
            detail,
            fields::CLASS_STATUS_KEYS,
            &summary.raw,
            fields::CLASS_STATUS_KEYS,
            |v| v.contains(fields::SUSPENDED_MARKER),
        ),
    }
}

/// `id/name/title`, empty segments dropped.
fn split_teacher(raw: &str) -> (String, String, String) {
    let mut parts = raw.split('/').map(str::trim).filter(|s| !s.is_empty());
    let mut next = || parts.next().unwrap_or("").to_string();
    (next(), next(), next())
}

fn normalize_breaks(raw: &str) -> String {
    raw.replace("<br/>", "; ").replace("<br>", "; ").trim().to_string()
}

fn first_non_empty(row: &Row, keys: &[&str]) -> String {
    keys.iter()
        .map(|k| field(row, k))
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

/// First trimmed non-empty candidate accepted by `accept`, detail keys first.
fn pick(
    detail: &Row,
    detail_keys: &[&str],
    summary: &Row,
    summary_keys: &[&str],
    accept: impl Fn(&str) -> bool,
) -> String {
    let candidates = detail_keys
        .iter()
        .map(|k| (detail, *k))
        .chain(summary_keys.iter().map(|k| (summary, *k)));
    for (row, key) in candidates {
        let text = field(row, key);
        let text = text.trim();
        if !text.is_empty() && accept(text) {
            return text.to_string();
        }
    }
    String::new()
}

fn limitations(detail: &Row, summary: &CourseSummary) -> Vec<String> {
    let mut notes = Vec::new();
    if summary.reuse_flag == "1" {
        notes.push(limitation::REUSE_ONLY.to_string());
    }
    if summary.minor_flag == "1" {
        notes.push(limitation::MINOR_CLASS.to_string());
    }
    if field(detail, detail_row::CAPACITY_LOCKED) == "1" {
        notes.push(limitation::CAPACITY_LOCKED.to_string());
    }
    let capacity = field(detail, detail_row::CAPACITY).trim().parse::<i64>().ok();
    let enrolled = field(detail, detail_row::ENROLLED).trim().parse::<i64>().ok();
    if let (Some(cap), Some(num)) = (capacity, enrolled) {
        if cap > 0 && num >= cap {
            notes.push(limitation::FULL.to_string());
        }
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn summary() -> CourseSummary {
        let raw = row(json!({
            "kch_id": "K1", "kch": "0830A001", "kcmc": "线性代数", "xf": "4",
            "kkxymc": "理学院", "bz": "summary note", "zt": "停开"
        }));
        summarize_rows(&[raw], None).remove(0)
    }

    fn context() -> QueryContext {
        let mut ctx = QueryContext::new();
        ctx.insert("xkkz_id".into(), "ROUND-1".into());
        ctx.insert("kspage".into(), "1".into());
        ctx.insert("jspage".into(), "9999".into());
        ctx.insert("xqh_id".into(), "2".into());
        ctx
    }

    #[test]
    fn test_summarize_dedups_and_limits() {
        let rows = vec![
            row(json!({"kch_id": "A", "kch": "CA", "kcmc": "first", "xf": 2})),
            row(json!({"kch_id": "A", "kch": "CA", "kcmc": "second"})),
            row(json!({"kch": "CB", "kcmc": "no lookup key", "cxbj": "1"})),
            row(json!({"kcmc": "no key at all"})),
            row(json!({"kch_id": "C", "kch": "CC"})),
        ];
        let all = summarize_rows(&rows, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].course_name, "first");
        assert_eq!(all[0].credit, "2");
        assert_eq!(all[0].reuse_flag, "0");
        assert_eq!(all[1].lookup_key, "CB");
        assert_eq!(all[1].reuse_flag, "1");

        let limited = summarize_rows(&rows, Some(2));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[1].course_id, "CB");
    }

    #[test]
    fn test_response_rows_shapes() {
        assert_eq!(response_rows(&json!([{"a": 1}, 5])).unwrap().len(), 1);
        assert_eq!(response_rows(&json!({"tmpList": [], "rows": [{"a": 1}]})).unwrap().len(), 1);
        assert!(response_rows(&json!({"other": []})).unwrap().is_empty());
        assert!(matches!(response_rows(&json!("x")), Err(HarvestError::Parse(_))));
    }

    #[test]
    fn test_detail_form_drops_paging() {
        let form = detail_form(&context(), &summary());
        let keys: Vec<&str> = form.iter().map(|(k, _)| k.as_str()).collect();
        assert!(!keys.contains(&"kspage"));
        assert!(!keys.contains(&"jspage"));
        assert!(form.contains(&("kch_id".into(), "K1".into())));
        assert!(form.contains(&("cxbj".into(), "0".into())));
        assert!(form.contains(&("xqh_id".into(), "2".into())));
    }

    #[test]
    fn test_merge_course_fields() {
        let detail = row(json!({
            "jsxx": "T001/张三/教授",
            "sksj": "星期一1-2<br/>星期三3-4",
            "jxdd": "A101<br>B202",
            "yqmc": "宝山",
            "jxbrl": "30",
            "yxzrs": 30,
            "jxb_id": "JXB-9",
            "dsfrl": "1",
            "xkbz": "--",
            "jxbzt": "正常",
        }));
        let record = merge_course(&detail, &summary(), &context());
        assert_eq!(record.course_id, "0830A001");
        assert_eq!(record.teacher_id, "T001");
        assert_eq!(record.teacher_name, "张三");
        assert_eq!(record.teacher_title, "教授");
        assert_eq!(record.class_time, "星期一1-2; 星期三3-4");
        assert_eq!(record.position, "A101; B202");
        assert_eq!(record.campus, "宝山");
        assert_eq!(record.enrolled_count, "30");
        assert_eq!(record.batch_id, "ROUND-1");
        assert_eq!(record.limitations, vec!["容量锁定", "人数已满"]);
        assert_eq!(record.academy, "理学院");
        // "--" skipped, summary note used.
        assert_eq!(record.selection_note, "summary note");
        // Detail status lacks the suspension marker; summary has it.
        assert_eq!(record.class_status, "停开");
    }

    #[test]
    fn test_teacher_split_tolerates_short_strings() {
        assert_eq!(split_teacher(""), (String::new(), String::new(), String::new()));
        assert_eq!(
            split_teacher("T9/李四"),
            ("T9".into(), "李四".into(), String::new())
        );
    }

    #[test]
    fn test_summarize_failures_samples() {
        let failures: Vec<String> = (0..8)
            .map(|i| format!("err {}", i % 7))
            .collect();
        let warnings = summarize_failures(&failures);
        assert_eq!(warnings.len(), 1 + WARNING_SAMPLE);
        assert!(warnings[0].starts_with("8 detail requests failed"));
        assert_eq!(warnings[1], "err 0");
        assert!(summarize_failures(&[]).is_empty());
    }
}
