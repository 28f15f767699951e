//! Field extraction from the portal's server-rendered pages.
//!
//! Hidden inputs, round tabs, select options and login-form actions are
//! pulled out with `scraper`. Round tabs have a second, regex-based strategy
//! for markup the structural selector no longer recognizes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::fields::hidden;
use crate::types::{CampusOption, HarvestError, HarvestResult, RoundTab};

/// Every `<input>` with an `id`, mapped to its value (empty when absent).
pub fn extract_hidden_fields(html: &str) -> BTreeMap<String, String> {
    let document = Html::parse_document(html);
    let mut fields = BTreeMap::new();
    if let Ok(sel) = Selector::parse("input[id]") {
        for input in document.select(&sel) {
            let el = input.value();
            if let Some(id) = el.attr("id").filter(|id| !id.is_empty()) {
                fields.insert(id.to_string(), el.attr("value").unwrap_or("").to_string());
            }
        }
    }
    fields
}

/// Fail unless the selection page carried an enrollment batch id.
pub fn require_round_context(fields: &BTreeMap<String, String>) -> HarvestResult<()> {
    let present = fields
        .get(hidden::FIRST_ROUND_ID)
        .is_some_and(|v| !v.trim().is_empty());
    if present {
        Ok(())
    } else {
        Err(HarvestError::MissingSelectionContext(format!(
            "selection page has no {}",
            hidden::FIRST_ROUND_ID
        )))
    }
}

/// One way of finding round tabs in the selection page.
pub trait TabStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, html: &str) -> Vec<RoundTab>;
}

/// `#nav_tab a[onclick]` anchors, active when the parent `<li>` is.
pub struct StructuralTabs;

/// Permissive pattern over the raw markup.
pub struct RegexTabs;

/// Strategies in precedence order.
pub const TAB_STRATEGIES: &[&dyn TabStrategy] = &[&StructuralTabs, &RegexTabs];

/// Round tabs from the first strategy that finds any.
pub fn extract_round_tabs(html: &str) -> Vec<RoundTab> {
    for strategy in TAB_STRATEGIES {
        let tabs = strategy.extract(html);
        if !tabs.is_empty() {
            tracing::debug!("{} round tabs via {}", tabs.len(), strategy.name());
            return tabs;
        }
    }
    Vec::new()
}

fn query_course_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"queryCourse\(this,'([^']*)','([^']*)','([^']*)','([^']*)'\)")
            .expect("queryCourse regex is valid")
    })
}

fn tab_markup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)<li\b([^>]*)>\s*<a\b[^>]*onclick\s*=\s*["']queryCourse\(this,'([^']*)','([^']*)','([^']*)','([^']*)'\)["'][^>]*>([^<]*)</a>"#,
        )
        .expect("tab markup regex is valid")
    })
}

fn active_class_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bactive\b").expect("active regex is valid"))
}

fn make_tab(
    kind_code: &str,
    round_id: &str,
    cohort: &str,
    major: &str,
    label: &str,
    active: bool,
) -> Option<RoundTab> {
    if kind_code.is_empty() || round_id.is_empty() {
        return None;
    }
    Some(RoundTab {
        round_id: round_id.to_string(),
        kind_code: kind_code.to_string(),
        cohort_year_id: cohort.to_string(),
        major_group_id: major.to_string(),
        label: label.trim().to_string(),
        active,
        ordinal: None,
        ordinal_name: None,
    })
}

impl TabStrategy for StructuralTabs {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn extract(&self, html: &str) -> Vec<RoundTab> {
        let document = Html::parse_document(html);
        let Ok(sel) = Selector::parse("#nav_tab a[onclick]") else {
            return Vec::new();
        };

        document
            .select(&sel)
            .filter_map(|anchor| {
                let onclick = anchor.value().attr("onclick")?;
                let caps = query_course_re().captures(onclick)?;
                let active = anchor
                    .parent()
                    .and_then(ElementRef::wrap)
                    .is_some_and(|li| li.value().classes().any(|c| c.eq_ignore_ascii_case("active")));
                let label: String = anchor.text().collect();
                make_tab(&caps[1], &caps[2], &caps[3], &caps[4], &label, active)
            })
            .collect()
    }
}

impl TabStrategy for RegexTabs {
    fn name(&self) -> &'static str {
        "regex"
    }

    fn extract(&self, html: &str) -> Vec<RoundTab> {
        tab_markup_re()
            .captures_iter(html)
            .filter_map(|caps| {
                let active = active_class_re().is_match(&caps[1]);
                make_tab(&caps[2], &caps[3], &caps[4], &caps[5], &caps[6], active)
            })
            .collect()
    }
}

/// Options of the `<select>` whose id (or, failing that, name) is `select_id`.
pub fn extract_select_options(html: &str, select_id: &str) -> Vec<CampusOption> {
    let document = Html::parse_document(html);
    let (Ok(select_sel), Ok(option_sel)) = (Selector::parse("select"), Selector::parse("option"))
    else {
        return Vec::new();
    };

    let selects: Vec<ElementRef<'_>> = document.select(&select_sel).collect();
    let select = selects
        .iter()
        .find(|s| s.value().attr("id") == Some(select_id))
        .or_else(|| selects.iter().find(|s| s.value().attr("name") == Some(select_id)));
    let Some(select) = select else {
        return Vec::new();
    };

    select
        .select(&option_sel)
        .filter_map(|opt| {
            let id = opt.value().attr("value").unwrap_or("").trim().to_string();
            let label = opt.text().collect::<String>().trim().to_string();
            if id.is_empty() && label.is_empty() {
                return None;
            }
            Some(CampusOption {
                id,
                label,
                selected: opt.value().attr("selected").is_some(),
            })
        })
        .collect()
}

/// The pre-selected option's id, else the first option's, else empty.
pub fn selected_option_value(options: &[CampusOption]) -> String {
    options
        .iter()
        .find(|o| o.selected)
        .or_else(|| options.first())
        .map(|o| o.id.clone())
        .unwrap_or_default()
}

/// First `<form action>` resolved against `base_url`.
pub fn extract_form_action(html: &str, base_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("form[action]").ok()?;
    let action = document
        .select(&sel)
        .filter_map(|f| f.value().attr("action"))
        .map(str::trim)
        .find(|a| !a.is_empty())?;

    match url::Url::parse(base_url) {
        Ok(base) => base.join(action).ok().map(|u| u.to_string()),
        Err(_) => Some(action.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SELECTION_PAGE: &str = r#"
        <html><body>
        <input type="hidden" id="firstXkkzId" value="ROUND-B"/>
        <input type="hidden" id="xkxnm" value="2024"/>
        <input type="hidden" id="xkxqm" value="3"/>
        <input type="hidden" id="empty"/>
        <input type="hidden" name="noid" value="ignored"/>
        <ul id="nav_tab">
          <li><a href="javascript:void(0)" onclick="queryCourse(this,'01','ROUND-A','2024','Z1')">主修课程</a></li>
          <li class="active"><a href="javascript:void(0)" onclick="queryCourse(this,'10','ROUND-B','2024','Z1')"> 通识课 </a></li>
          <li><a onclick="queryCourse(this,'','ROUND-C','2024','Z1')">broken</a></li>
        </ul>
        </body></html>
    "#;

    #[test]
    fn test_hidden_fields() {
        let fields = extract_hidden_fields(SELECTION_PAGE);
        assert_eq!(fields["firstXkkzId"], "ROUND-B");
        assert_eq!(fields["xkxnm"], "2024");
        assert_eq!(fields["empty"], "");
        assert!(!fields.contains_key("noid"));
        assert!(require_round_context(&fields).is_ok());
    }

    #[test]
    fn test_missing_first_round_id_is_fatal() {
        let fields = extract_hidden_fields(r#"<input id="xkxnm" value="2024">"#);
        let err = require_round_context(&fields).unwrap_err();
        assert!(matches!(err, HarvestError::MissingSelectionContext(_)));
    }

    #[test]
    fn test_structural_tabs() {
        let tabs = StructuralTabs.extract(SELECTION_PAGE);
        assert_eq!(tabs.len(), 2);
        assert_eq!(tabs[0].round_id, "ROUND-A");
        assert_eq!(tabs[0].kind_code, "01");
        assert!(!tabs[0].active);
        assert_eq!(tabs[1].round_id, "ROUND-B");
        assert_eq!(tabs[1].label, "通识课");
        assert!(tabs[1].active);
    }

    #[test]
    fn test_regex_fallback_when_structure_changes() {
        // No #nav_tab container, so only the regex strategy sees these.
        let html = r#"
            <ul class="tabs">
              <li class="nav-item Active"><a onclick="queryCourse(this,'01','R1','2023','Z9')">第一轮</a></li>
              <li><a onclick="queryCourse(this,'01','R2','2023','Z9')">第二轮</a></li>
            </ul>
        "#;
        assert!(StructuralTabs.extract(html).is_empty());

        let tabs = extract_round_tabs(html);
        assert_eq!(tabs.len(), 2);
        assert!(tabs[0].active);
        assert_eq!(tabs[1].round_id, "R2");
        assert_eq!(tabs[1].cohort_year_id, "2023");
        assert_eq!(tabs[1].major_group_id, "Z9");
        assert_eq!(tabs[1].label, "第二轮");
    }

    #[test]
    fn test_no_tabs() {
        assert!(extract_round_tabs("<html></html>").is_empty());
    }

    #[test]
    fn test_select_options_by_id_or_name() {
        let html = r#"
            <select name="xqh_id">
              <option value="">   </option>
              <option value="1">宝山</option>
              <option value="2" selected="selected">延长</option>
              <option value="">全部</option>
            </select>
        "#;
        let options = extract_select_options(html, "xqh_id");
        assert_eq!(options.len(), 3);
        assert_eq!(options[0].label, "宝山");
        assert!(options[1].selected);
        assert_eq!(options[2].id, "");
        assert_eq!(selected_option_value(&options), "2");

        assert!(extract_select_options(html, "other").is_empty());
    }

    #[test]
    fn test_selected_option_fallbacks() {
        let first = vec![
            CampusOption { id: "1".into(), label: "A".into(), selected: false },
            CampusOption { id: "2".into(), label: "B".into(), selected: false },
        ];
        assert_eq!(selected_option_value(&first), "1");
        assert_eq!(selected_option_value(&[]), "");
    }

    #[test]
    fn test_form_action_resolution() {
        let html = r#"<form id="fm1" method="post" action="/login?service=x"></form>"#;
        assert_eq!(
            extract_form_action(html, "https://sso.test/oauth/authorize?a=1").unwrap(),
            "https://sso.test/login?service=x"
        );
        assert!(extract_form_action("<form></form>", "https://sso.test/").is_none());
    }
}
