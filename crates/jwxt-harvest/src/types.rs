//! Core data types for sessions, selection scopes, and harvested courses.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Login credentials. The secret never leaves memory unencrypted.
#[derive(Clone)]
pub struct Credentials {
    pub identifier: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(identifier: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One server-issued cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Expiry as unix seconds; `None` for session cookies.
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub secure: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// One enrollment-window tab on the selection page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTab {
    /// `xkkz_id`
    pub round_id: String,
    /// `kklxdm`
    pub kind_code: String,
    /// `njdm_id`
    pub cohort_year_id: String,
    /// `zyh_id`
    pub major_group_id: String,
    pub label: String,
    pub active: bool,
    /// `xklc`, known only after the round's display page was fetched.
    #[serde(default)]
    pub ordinal: Option<String>,
    /// `xklcmc`
    #[serde(default)]
    pub ordinal_name: Option<String>,
}

/// One `<option>` of the campus dropdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampusOption {
    #[serde(rename = "value")]
    pub id: String,
    pub label: String,
    pub selected: bool,
}

impl CampusOption {
    /// A placeholder option standing for "whatever campus the context names".
    pub fn synthetic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            selected: true,
        }
    }
}

/// A row of the course-list endpoint, reduced to what the detail fetch needs.
#[derive(Debug, Clone, Default)]
pub struct CourseSummary {
    /// `kch_id`, the key the detail endpoint expects.
    pub lookup_key: String,
    pub course_id: String,
    pub course_name: String,
    pub credit: String,
    /// `cxbj`
    pub reuse_flag: String,
    /// `fxbj`
    pub minor_flag: String,
    /// The untouched list row; fallback source for candidate fields.
    pub raw: Map<String, Value>,
}

/// One schedulable section of a course; the unit the catalog is made of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeachingClass {
    pub course_id: String,
    pub course_name: String,
    pub credit: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub teacher_title: String,
    pub class_time: String,
    pub campus: String,
    pub position: String,
    pub capacity: String,
    #[serde(rename = "number")]
    pub enrolled_count: String,
    pub limitations: Vec<String>,
    pub teaching_class_id: String,
    pub batch_id: String,
    pub academy: String,
    pub major: String,
    pub teaching_mode: String,
    pub language_mode: String,
    pub selection_note: String,
    pub class_status: String,
}

impl TeachingClass {
    /// Identity across campus/round fetches.
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.course_id, &self.teaching_class_id, &self.batch_id)
    }
}

/// Round metadata carried by snapshots and index entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundMeta {
    #[serde(rename = "xkkzId", default)]
    pub round_id: String,
    #[serde(rename = "xklc", default)]
    pub ordinal: String,
    #[serde(rename = "xklcmc", default)]
    pub ordinal_name: String,
}

/// The harvested catalog of one (term, round).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermSnapshot {
    pub backend_origin: String,
    pub term_name: String,
    pub term_id: String,
    #[serde(rename = "jwxtRound")]
    pub round: RoundMeta,
    pub campus_options: Vec<CampusOption>,
    #[serde(rename = "updateTimeMs")]
    pub generated_at: i64,
    #[serde(rename = "hash")]
    pub content_hash: String,
    pub courses: Vec<TeachingClass>,
}

/// One line of `current.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermIndexEntry {
    pub term_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub term_code: String,
    #[serde(rename = "jwxtRound", default, skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<i64>,
}

/// Errors raised by the harvest engine.
#[derive(thiserror::Error, Debug)]
pub enum HarvestError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {context}: {snippet}")]
    UnexpectedStatus {
        context: String,
        status: u16,
        snippet: String,
    },

    #[error("Unexpected SSO entry status {0}")]
    UnexpectedSsoEntryStatus(u16),

    #[error("Login failed, last status {0}")]
    LoginFailed(u16),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing selection context: {0}")]
    MissingSelectionContext(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("No campus matches '{selector}' (available: {available})")]
    NoMatchingCampus { selector: String, available: String },

    #[error("No round matches {selector} (available: {available})")]
    NoMatchingRound { selector: String, available: String },

    #[error("No usable session and no credentials provided")]
    CredentialsRequired,

    #[error("Course catalog is empty; the enrollment window may not be open yet")]
    EmptyCatalog,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarvestError {
    /// Whether a detail fetch failing this way is worth another attempt.
    pub fn retryable(&self) -> bool {
        match self {
            HarvestError::Transport(_) => true,
            HarvestError::UnexpectedStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// 429, 5xx, and the portal's non-standard 901 throttling code.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 901)
}

/// Convenience result type.
pub type HarvestResult<T> = Result<T, HarvestError>;

/// Current time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
