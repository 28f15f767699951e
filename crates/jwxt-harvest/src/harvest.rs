//! Harvest orchestrator.
//!
//! Wires the pieces in order: session bootstrap (cookie header, stored
//! bundle, or fresh login), round and campus resolution, the per-campus
//! list/detail pipeline, merging, and finally the catalog files and the
//! refreshed session bundle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog;
use crate::config::HarvestConfig;
use crate::extract::{
    extract_hidden_fields, extract_round_tabs, extract_select_options, require_round_context,
    selected_option_value,
};
use crate::fields::{self, hidden, param};
use crate::http_client::{HttpClient, RateLimiter};
use crate::login::{login, warm_up};
use crate::pipeline::{self, ajax_headers};
use crate::scope::{self, CAMPUS_ALL};
use crate::session::{self, SessionJar};
use crate::types::{
    now_ms, CampusOption, Credentials, HarvestError, HarvestResult, RoundMeta, RoundTab,
    TermSnapshot,
};

/// Where the encrypted session bundle and its key live.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub bundle: PathBuf,
    pub key: PathBuf,
}

impl Default for SessionPaths {
    fn default() -> Self {
        Self {
            bundle: crate::config::default_bundle_path(),
            key: crate::config::default_key_path(),
        }
    }
}

/// Per-run choices.
#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub credentials: Option<Credentials>,
    /// Raw `Cookie:` header from a logged-in browser.
    pub cookie_header: Option<String>,
    /// `None` disables the session cache.
    pub session_store: Option<SessionPaths>,
    /// Stored in the bundle header; defaults to the login identifier.
    pub owner_hint: Option<String>,
    /// Explicit round by `xkkz_id`.
    pub round_id: Option<String>,
    /// Explicit round by ordinal (`xklc`).
    pub round_ordinal: Option<String>,
    /// `all`, `current`, or a campus label fragment / id.
    pub campus_scope: String,
    /// Only fetch details for the first N courses of each campus.
    pub max_courses: Option<usize>,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            credentials: None,
            cookie_header: None,
            session_store: None,
            owner_hint: None,
            round_id: None,
            round_ordinal: None,
            campus_scope: CAMPUS_ALL.to_string(),
            max_courses: None,
        }
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub snapshot: TermSnapshot,
    pub term_code: String,
    /// Courses whose detail fetch failed for good.
    pub failed_details: usize,
    pub warnings: Vec<String>,
}

/// Display fragment of one round.
#[derive(Debug, Clone, Default)]
pub struct DisplayPage {
    pub fields: BTreeMap<String, String>,
    pub campus_options: Vec<CampusOption>,
}

/// Owns the authoritative session of one run.
pub struct Harvester {
    config: HarvestConfig,
    jar: Arc<SessionJar>,
    limiter: Arc<RateLimiter>,
    client: HttpClient,
}

impl Harvester {
    pub fn new(config: HarvestConfig) -> HarvestResult<Self> {
        let jar = Arc::new(SessionJar::new());
        let limiter = Arc::new(RateLimiter::new(config.request_interval));
        let client = HttpClient::new(Arc::clone(&jar), Arc::clone(&limiter), &config)?;
        Ok(Self {
            config,
            jar,
            limiter,
            client,
        })
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn jar(&self) -> &Arc<SessionJar> {
        &self.jar
    }

    /// Harvest, write the catalog under `output_dir`, persist the session.
    pub async fn run_to_dir(
        &self,
        options: &HarvestOptions,
        output_dir: &Path,
    ) -> HarvestResult<HarvestReport> {
        let report = self.run(options).await?;

        catalog::write_snapshot(output_dir, &report.snapshot)?;
        catalog::update_index(
            output_dir,
            catalog::index_entry(&report.snapshot, &report.term_code),
        )?;

        if let Some(paths) = &options.session_store {
            let owner = options
                .owner_hint
                .as_deref()
                .or(options.credentials.as_ref().map(|c| c.identifier.as_str()))
                .unwrap_or("");
            if let Err(e) = session::save_bundle(&paths.bundle, &paths.key, owner, &self.jar.snapshot()) {
                tracing::warn!("could not save session bundle: {e}");
            }
        }
        Ok(report)
    }

    /// Harvest one (term, round) across the selected campuses.
    pub async fn run(&self, options: &HarvestOptions) -> HarvestResult<HarvestReport> {
        let (html, mut page_fields) = self.establish_session(options).await?;

        let (tab, campus_options) = self.select_round(&html, &mut page_fields, options).await?;
        scope::apply_round(&mut page_fields, &tab);
        if let Some(name) = page_fields.get(hidden::ROUND_ORDINAL_NAME).filter(|n| !n.is_empty()) {
            tracing::info!("round: {name}");
        }

        let context = scope::build_query_context(&page_fields)?;
        let current_campus = context.get(param::CAMPUS_ID).cloned().unwrap_or_default();
        let campuses = scope::resolve_campuses(&campus_options, &options.campus_scope, &current_campus)?;

        let mut records = Vec::new();
        let mut warnings = Vec::new();
        let mut failed_details = 0;
        for (i, campus) in campuses.iter().enumerate() {
            let label = if campus.label.is_empty() { &campus.id } else { &campus.label };
            if !label.is_empty() {
                tracing::info!("campus {}/{}: {label}", i + 1, campuses.len());
            }

            let scoped = scope::campus_context(&context, campus);
            let rows = pipeline::fetch_course_rows(&self.client, &self.config, &scoped).await?;
            if rows.is_empty() {
                tracing::info!("empty course list for campus '{label}', skipping");
                continue;
            }
            let summaries = pipeline::summarize_rows(&rows, options.max_courses);
            tracing::info!("{} courses listed", summaries.len());

            let outcome = pipeline::fetch_details(
                Arc::clone(&self.jar),
                Arc::clone(&self.limiter),
                &self.config,
                &scoped,
                summaries,
            )
            .await?;
            failed_details += outcome.failed;
            warnings.extend(outcome.warnings);
            let added = scope::merge_records(&mut records, outcome.records);
            tracing::debug!("merged {added} new teaching classes");
        }

        scope::sort_records(&mut records);
        let content_hash = scope::content_hash(&records)?;
        tracing::info!("harvested {} teaching classes", records.len());

        let term_code = catalog::term_code(&page_fields);
        let round_id = context.get(param::ROUND_ID).cloned().unwrap_or_default();
        let text = |key: &str| page_fields.get(key).map(|s| s.trim().to_string()).unwrap_or_default();
        let snapshot = TermSnapshot {
            backend_origin: self.config.portal_origin.clone(),
            term_name: catalog::term_name(&page_fields, &term_code),
            term_id: catalog::term_id(&term_code, &round_id),
            round: RoundMeta {
                round_id: round_id.trim().to_string(),
                ordinal: text(hidden::ROUND_ORDINAL),
                ordinal_name: text(hidden::ROUND_ORDINAL_NAME),
            },
            campus_options,
            generated_at: now_ms(),
            content_hash,
            courses: records,
        };

        Ok(HarvestReport {
            snapshot,
            term_code,
            failed_details,
            warnings,
        })
    }

    /// Reuse a cookie header or stored bundle if it still opens the
    /// selection page, otherwise log in.
    async fn establish_session(
        &self,
        options: &HarvestOptions,
    ) -> HarvestResult<(String, BTreeMap<String, String>)> {
        if let Some(header) = options.cookie_header.as_deref().filter(|h| !h.trim().is_empty()) {
            self.jar.apply_cookie_header(header, &self.portal_host());
            match self.resume().await {
                Ok(page) => {
                    tracing::info!("session restored from cookie header");
                    return Ok(page);
                }
                Err(e) => tracing::warn!("cookie header rejected: {e}"),
            }
        }

        if let Some(paths) = &options.session_store {
            match session::load_bundle(&paths.bundle, &paths.key) {
                Some(stored) if !stored.cookies.is_empty() => {
                    self.jar.replace(stored.cookies);
                    match self.resume().await {
                        Ok(page) => {
                            tracing::info!("session restored from {}", paths.bundle.display());
                            return Ok(page);
                        }
                        Err(e) => tracing::warn!("stored session rejected: {e}"),
                    }
                }
                _ => tracing::debug!("no usable stored session"),
            }
        }

        let credentials = options
            .credentials
            .as_ref()
            .ok_or(HarvestError::CredentialsRequired)?;
        self.jar.replace(Vec::new());
        login(&self.client, &self.config, credentials).await?;
        self.fetch_selection_page().await
    }

    async fn resume(&self) -> HarvestResult<(String, BTreeMap<String, String>)> {
        warm_up(&self.client, &self.config).await?;
        self.fetch_selection_page().await
    }

    fn portal_host(&self) -> String {
        url::Url::parse(&self.config.portal_origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Selection page markup and its hidden fields.
    pub async fn fetch_selection_page(&self) -> HarvestResult<(String, BTreeMap<String, String>)> {
        let resp = self
            .client
            .get(&self.config.portal_url(fields::SELECTION_PATH))
            .await?;
        resp.require_ok("selection page")?;
        let page_fields = extract_hidden_fields(&resp.body);
        require_round_context(&page_fields)?;
        Ok((resp.body, page_fields))
    }

    /// POST the display fragment of `tab`.
    pub async fn fetch_display(&self, tab: &RoundTab, student_status: &str) -> HarvestResult<DisplayPage> {
        let status = if student_status.is_empty() { "1" } else { student_status };
        let form: Vec<(String, String)> = [
            (param::ROUND_ID, tab.round_id.as_str()),
            (param::STUDENT_STATUS, status),
            (param::KIND_CODE, tab.kind_code.as_str()),
            (param::COHORT_ID, tab.cohort_year_id.as_str()),
            (param::MAJOR_ID, tab.major_group_id.as_str()),
            (param::PAGE_START, "0"),
            (param::PAGE_END, "0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let resp = self
            .client
            .post_form(
                &self.config.portal_url(fields::DISPLAY_PATH),
                &form,
                &ajax_headers(&self.config),
            )
            .await?;
        resp.require_ok("display page")?;

        let mut display_fields = extract_hidden_fields(&resp.body);
        let campus_options = extract_select_options(&resp.body, fields::CAMPUS_SELECT_ID);
        let selected = selected_option_value(&campus_options);
        if !selected.is_empty() {
            display_fields.insert(param::CAMPUS_ID.to_string(), selected);
        }
        Ok(DisplayPage {
            fields: display_fields,
            campus_options,
        })
    }

    /// `tab` with its ordinal and ordinal name filled from its display page.
    async fn enrich_tab(&self, tab: &RoundTab, student_status: &str) -> HarvestResult<RoundTab> {
        let display = self.fetch_display(tab, student_status).await?;
        let mut enriched = tab.clone();
        enriched.ordinal = display.fields.get(hidden::ROUND_ORDINAL).cloned();
        enriched.ordinal_name = display.fields.get(hidden::ROUND_ORDINAL_NAME).cloned();
        Ok(enriched)
    }

    /// Pick the round, merge its display fields into `page_fields`, and
    /// return it with the campus options.
    async fn select_round(
        &self,
        html: &str,
        page_fields: &mut BTreeMap<String, String>,
        options: &HarvestOptions,
    ) -> HarvestResult<(RoundTab, Vec<CampusOption>)> {
        let tabs = extract_round_tabs(html);
        let student_status = page_fields
            .get(hidden::STUDENT_STATUS)
            .cloned()
            .unwrap_or_default();
        let wanted_ordinal = options
            .round_ordinal
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let wanted_id = options
            .round_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let explicit = wanted_id.is_some() || wanted_ordinal.is_some();

        let mut selected = scope::resolve_round(&tabs, wanted_id, page_fields)?
            .filter(|_| wanted_id.is_some() || wanted_ordinal.is_none());

        if selected.is_none() {
            if let Some(ordinal) = wanted_ordinal {
                let mut enriched = Vec::with_capacity(tabs.len());
                for tab in &tabs {
                    enriched.push(self.enrich_tab(tab, &student_status).await?);
                }
                selected = Some(scope::select_round_by_ordinal(&enriched, ordinal)?);
            }
        }

        // No tabs on the page: fall back to the page's own first round.
        let tab = match selected {
            Some(tab) => tab,
            None => {
                let first = page_fields
                    .get(hidden::FIRST_ROUND_ID)
                    .cloned()
                    .unwrap_or_default();
                scope::synthetic_tab(&first, page_fields)
            }
        };
        tracing::debug!("selected round {} ({})", tab.round_id, tab.label);

        match self.fetch_display(&tab, &student_status).await {
            Ok(display) => {
                page_fields.extend(display.fields);
                Ok((tab, display.campus_options))
            }
            Err(e) if !explicit => {
                tracing::warn!("display page unavailable, using selection page defaults: {e}");
                Ok((tab, Vec::new()))
            }
            Err(e) => Err(e),
        }
    }
}
