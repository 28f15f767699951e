//! The session cookie jar.
//!
//! One `SessionJar` is the authoritative session of a run; it is plugged into
//! the HTTP client as its cookie provider. Detail workers get private jars
//! seeded from [`SessionJar::snapshot`] and re-seed them on retry.

use std::sync::{Mutex, MutexGuard};

use reqwest::header::HeaderValue;
use url::Url;

use crate::types::CookieRecord;

/// Mutex-guarded cookie records.
#[derive(Debug, Default)]
pub struct SessionJar {
    cookies: Mutex<Vec<CookieRecord>>,
}

impl SessionJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// A jar pre-loaded with records, e.g. from a decrypted bundle.
    pub fn from_records(records: Vec<CookieRecord>) -> Self {
        let jar = Self::new();
        jar.replace(records);
        jar
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CookieRecord>> {
        self.cookies.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of every record currently held.
    pub fn snapshot(&self) -> Vec<CookieRecord> {
        self.lock().clone()
    }

    /// Swap the whole jar content. Records without name or domain are dropped.
    pub fn replace(&self, records: Vec<CookieRecord>) {
        let mut cookies = self.lock();
        cookies.clear();
        for record in records {
            if record.name.is_empty() || record.domain.is_empty() {
                continue;
            }
            upsert(&mut cookies, normalize(record));
        }
    }

    /// Insert or overwrite one record keyed by (name, domain, path).
    pub fn insert(&self, record: CookieRecord) {
        if record.name.is_empty() || record.domain.is_empty() {
            return;
        }
        upsert(&mut self.lock(), normalize(record));
    }

    /// Load a raw `Cookie:` header exported from a logged-in browser.
    pub fn apply_cookie_header(&self, header: &str, domain: &str) {
        let records = header
            .split(';')
            .filter_map(|part| {
                let (name, value) = part.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some(CookieRecord {
                    name: name.to_string(),
                    value: value.trim().to_string(),
                    domain: domain.to_string(),
                    path: "/".to_string(),
                    expires: None,
                    secure: false,
                })
            })
            .collect();
        self.replace(records);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `name=value` pairs that would be sent to `url`.
    pub fn matching(&self, url: &Url) -> Vec<(String, String)> {
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return Vec::new(),
        };
        let now = chrono::Utc::now().timestamp();
        let https = url.scheme() == "https";
        self.lock()
            .iter()
            .filter(|c| c.expires.map_or(true, |exp| exp > now))
            .filter(|c| !c.secure || https)
            .filter(|c| domain_matches(&host, &c.domain))
            .filter(|c| path_matches(url.path(), &c.path))
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }

    fn store_set_cookie(&self, raw: &str, url: &Url) {
        let parsed = match cookie::Cookie::parse(raw.to_string()) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("ignoring unparsable Set-Cookie from {}: {e}", url.path());
                return;
            }
        };
        let host = match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return,
        };

        let domain = match parsed.domain() {
            Some(d) => {
                let d = d.trim_start_matches('.').to_ascii_lowercase();
                // A host may only set cookies for itself or a parent domain.
                if !domain_matches(&host, &d) {
                    return;
                }
                d
            }
            None => host,
        };
        let path = match parsed.path() {
            Some(p) if p.starts_with('/') => p.to_string(),
            _ => default_path(url.path()),
        };

        let now = chrono::Utc::now().timestamp();
        let expires = match parsed.max_age() {
            Some(age) => Some(now + age.whole_seconds()),
            None => parsed
                .expires()
                .and_then(|e| e.datetime())
                .map(|dt| dt.unix_timestamp()),
        };

        let record = CookieRecord {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            domain,
            path,
            expires,
            secure: parsed.secure().unwrap_or(false),
        };

        let mut cookies = self.lock();
        if record.expires.is_some_and(|exp| exp <= now) {
            cookies.retain(|c| !same_slot(c, &record));
        } else {
            upsert(&mut cookies, record);
        }
    }
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            if let Ok(raw) = header.to_str() {
                self.store_set_cookie(raw, url);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let pairs = self.matching(url);
        if pairs.is_empty() {
            return None;
        }
        let header = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

fn normalize(mut record: CookieRecord) -> CookieRecord {
    record.domain = record.domain.trim_start_matches('.').to_ascii_lowercase();
    if record.path.is_empty() {
        record.path = "/".to_string();
    }
    record
}

fn same_slot(a: &CookieRecord, b: &CookieRecord) -> bool {
    a.name == b.name && a.domain == b.domain && a.path == b.path
}

fn upsert(cookies: &mut Vec<CookieRecord>, record: CookieRecord) {
    match cookies.iter_mut().find(|c| same_slot(c, &record)) {
        Some(existing) => *existing = record,
        None => cookies.push(record),
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// Directory part of the request path (RFC 6265 §5.1.4).
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => request_path[..idx].to_string(),
    }
}
