//! Portal schema table: endpoint paths, opaque form-field codes, default
//! values, and candidate-key precedence lists.
//!
//! The portal exposes no documented API. Everything it calls a field is a
//! short pinyin abbreviation, and the same semantic value shows up under
//! different keys depending on the page. Portal-side renames should only
//! ever touch this file.

/// SSO entry point on the portal host.
pub const SSO_ENTRY_PATH: &str = "/sso/shulogin";

/// Menu initialization; used as the post-login warm-up.
pub const WARMUP_PATH: &str = "/jwglxt/xtgl/index_initMenu.html";

/// Selection landing page carrying the hidden context fields and round tabs.
pub const SELECTION_PATH: &str = "/jwglxt/xsxk/zzxkyzb_cxZzxkYzbIndex.html?gnmkdm=N253512";

/// Per-round display fragment carrying round metadata and the campus select.
pub const DISPLAY_PATH: &str = "/jwglxt/xsxk/zzxkyzb_cxZzxkYzbDisplay.html?gnmkdm=N253512";

/// Course list (Stage A).
pub const COURSE_LIST_PATH: &str =
    "/jwglxt/xsxk/zzxkyzb_cxZzxkYzbPartDisplay.html?gnmkdm=N253512";

/// Teaching-class detail per course (Stage B).
pub const COURSE_DETAIL_PATH: &str =
    "/jwglxt/xsxk/zzxkyzbjk_cxJxbWithKchZzxkYzb.html?gnmkdm=N253512";

/// Page size large enough to disable paging on the list endpoint.
pub const LIST_PAGE_END: &str = "9999";

/// Hidden fields on the selection page.
pub mod hidden {
    pub const FIRST_ROUND_ID: &str = "firstXkkzId";
    pub const FIRST_KIND_CODE: &str = "firstKklxdm";
    pub const FIRST_COHORT_ID: &str = "firstNjdmId";
    pub const FIRST_MAJOR_ID: &str = "firstZyhId";
    pub const FIRST_KIND_NAME: &str = "firstKklxmc";
    pub const STUDENT_STATUS: &str = "xszxzt";
    pub const ROUND_ORDINAL: &str = "xklc";
    pub const ROUND_ORDINAL_NAME: &str = "xklcmc";
    pub const YEAR: &str = "xkxnm";
    pub const YEAR_NAME: &str = "xkxnmc";
    pub const SEMESTER: &str = "xkxqm";
    pub const SEMESTER_NAME: &str = "xkxqmc";
    pub const KIND_CODE: &str = "kklxdm";
    pub const COHORT_ID: &str = "njdm_id";
    pub const MAJOR_ID: &str = "zyh_id";
}

/// Query-context parameter names.
pub mod param {
    pub const ROUND_ID: &str = "xkkz_id";
    pub const KIND_CODE: &str = "kklxdm";
    pub const COHORT_ID: &str = "njdm_id";
    pub const MAJOR_ID: &str = "zyh_id";
    pub const CAMPUS_ID: &str = "xqh_id";
    pub const STUDENT_STATUS: &str = "xszxzt";
    pub const PAGE_START: &str = "kspage";
    pub const PAGE_END: &str = "jspage";
    pub const COURSE_KEY: &str = "kch_id";
    pub const REUSE_FLAG: &str = "cxbj";
    pub const MINOR_FLAG: &str = "fxbj";
}

/// Campus dropdown on the display fragment.
pub const CAMPUS_SELECT_ID: &str = "xqh_id";

/// Hidden fields copied verbatim into the query context when non-empty.
pub const REQUEST_FIELD_KEYS: &[&str] = &[
    "rwlx", "xklc", "xkly", "bklx_id", "sfkkjyxdxnxq", "kzkcgs", "xqh_id", "jg_id_1",
    "njdm_id_1", "zyh_id_1", "gnjkxdnj", "zyh_id", "zyfx_id", "njdm_id", "bh_id",
    "bjgkczxbbjwcx", "xbm", "xslbdm", "mzm", "xz", "ccdm", "xsbj", "sfkknj", "sfkkzy",
    "kzybkxy", "sfznkx", "zdkxms", "sfkxq", "sfkcfx", "kkbk", "kkbkdj", "bklbkcj", "sfkgbcx",
    "sfrxtgkcxd", "tykczgxdcs", "xkxnm", "xkxqm", "kklxdm", "bbhzxjxb", "xkkz_id", "rlkz",
    "xkzgbj", "xszxzt", "txbsfrl", "xkxskcgskg", "rlzlkz", "cdrlkz", "jxbzcxskg", "sfyxsksjct",
];

/// Values the portal's own script sends when the page leaves a field unset.
pub const DEFAULT_FIELD_VALUES: &[(&str, &str)] = &[
    ("rwlx", "1"),
    ("xklc", "1"),
    ("xkly", "1"),
    ("bklx_id", "0"),
    ("sfkkjyxdxnxq", "0"),
    ("kzkcgs", "0"),
    ("sfkknj", "1"),
    ("sfkkzy", "1"),
    ("kzybkxy", "0"),
    ("sfznkx", "0"),
    ("zdkxms", "0"),
    ("sfkxq", "1"),
    ("sfkcfx", "1"),
    ("kkbk", "0"),
    ("kkbkdj", "0"),
    ("bklbkcj", "0"),
    ("sfkgbcx", "1"),
    ("sfrxtgkcxd", "1"),
    ("tykczgxdcs", "0"),
    ("bbhzxjxb", "0"),
    ("rlkz", "0"),
    ("xkzgbj", "0"),
    ("xszxzt", "1"),
    ("sfyxsksjct", "0"),
];

/// Keys under which list and detail endpoints return their row arrays.
pub const ROW_LIST_KEYS: &[&str] = &["tmpList", "rows"];

/// Course-list row keys.
pub mod list_row {
    pub const LOOKUP_KEY: &str = "kch_id";
    pub const COURSE_ID: &str = "kch";
    pub const COURSE_NAME: &str = "kcmc";
    pub const CREDIT: &str = "xf";
    pub const REUSE_FLAG: &str = "cxbj";
    pub const MINOR_FLAG: &str = "fxbj";
}

/// Detail row keys with a single meaning.
pub mod detail_row {
    pub const TEACHER: &str = "jsxx";
    pub const CLASS_TIME: &str = "sksj";
    pub const POSITION: &str = "jxdd";
    pub const CAPACITY: &str = "jxbrl";
    pub const ENROLLED: &str = "yxzrs";
    pub const TEACHING_CLASS_ID: &str = "jxb_id";
    pub const CAPACITY_LOCKED: &str = "dsfrl";
    pub const CAMPUS: &[&str] = &["xqumc", "yqmc"];
}

/// Candidate keys in precedence order. Detail rows are consulted first,
/// then the course-list row, with the same key order.
pub const ACADEMY_DETAIL_KEYS: &[&str] = &[
    "kkxy", "kkxy_name", "kkxy_mc", "kkxymc", "kkxyid", "kkxyId", "dwmc", "kkdwmc",
];
pub const ACADEMY_SUMMARY_KEYS: &[&str] = &["kkxy", "kkxy_name", "kkxymc", "dwmc"];
pub const MAJOR_KEYS: &[&str] = &["zyfxmc", "zymc", "zyhmc", "zyfxname"];
pub const TEACHING_MODE_DETAIL_KEYS: &[&str] = &["jxms", "jxmsmc", "skfs", "skfsmc", "jxms_name"];
pub const TEACHING_MODE_SUMMARY_KEYS: &[&str] = &["jxms", "jxmsmc", "skfs", "skfsmc"];
pub const LANGUAGE_MODE_KEYS: &[&str] = &["yylx", "yylxmc", "yyxz", "yyxzmc", "yyms", "yymsmc"];
pub const SELECTION_NOTE_KEYS: &[&str] = &["xkbz", "xklybz", "bz", "kcbz", "bzxx"];
pub const CLASS_STATUS_KEYS: &[&str] = &["jxbzt", "krlx", "zt", "status"];

/// Placeholder the portal prints for "no note".
pub const EMPTY_NOTE_MARKER: &str = "--";

/// Class statuses are only surfaced when they announce a suspension.
pub const SUSPENDED_MARKER: &str = "停";

/// Limitation labels as the catalog consumers display them.
pub mod limitation {
    pub const REUSE_ONLY: &str = "仅限重修";
    pub const MINOR_CLASS: &str = "辅修班";
    pub const CAPACITY_LOCKED: &str = "容量锁定";
    pub const FULL: &str = "人数已满";
}

/// Look up a default query value.
pub fn default_value(key: &str) -> Option<&'static str> {
    DEFAULT_FIELD_VALUES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}
