//! Core domain model for hotel reputation runs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "hrep-core";

/// Date format used for run dates everywhere (table headers, snapshots, summaries).
pub const RUN_DATE_FORMAT: &str = "%Y-%m-%d";

/// Canonical spelling of a site id: trimmed and upper-cased.
pub fn normalize_site_id(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Normalizes a user- or config-provided site list, dropping blanks and repeats
/// while keeping first-seen order.
pub fn normalize_sites<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for site in raw {
        let site = normalize_site_id(site.as_ref());
        if !site.is_empty() && !out.contains(&site) {
            out.push(site);
        }
    }
    out
}

pub fn parse_run_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), RUN_DATE_FORMAT).ok()
}

/// One tracked hotel and its per-site identifiers (URL, location id, place id...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotelConfig {
    pub name: String,
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
}

impl HotelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifiers: BTreeMap::new(),
        }
    }

    pub fn with_identifier(mut self, site: &str, id: impl Into<String>) -> Self {
        self.identifiers.insert(normalize_site_id(site), id.into());
        self
    }

    /// Identifier for `site`, ignoring blank entries.
    pub fn identifier_for(&self, site: &str) -> Option<&str> {
        let site = normalize_site_id(site);
        self.identifiers
            .iter()
            .find(|(key, _)| normalize_site_id(key) == site)
            .map(|(_, id)| id.trim())
            .filter(|id| !id.is_empty())
    }
}

/// Raw handoff contract from collectors into the sync pipeline.
///
/// Every field is optional on purpose: the validator, not serde, decides whether a
/// collector produced a well-formed row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObservationDraft {
    #[serde(default)]
    pub hotel: Option<String>,
    #[serde(default, alias = "date")]
    pub run_date: Option<String>,
    #[serde(default)]
    pub score: Option<JsonValue>,
    #[serde(default)]
    pub raw_fields: BTreeMap<String, JsonValue>,
}

impl ObservationDraft {
    pub fn scored(hotel: impl Into<String>, run_date: NaiveDate, score: f64) -> Self {
        Self {
            hotel: Some(hotel.into()),
            run_date: Some(run_date.format(RUN_DATE_FORMAT).to_string()),
            score: Some(JsonValue::from(score)),
            raw_fields: BTreeMap::new(),
        }
    }

    pub fn unscored(hotel: impl Into<String>, run_date: NaiveDate) -> Self {
        Self {
            hotel: Some(hotel.into()),
            run_date: Some(run_date.format(RUN_DATE_FORMAT).to_string()),
            score: None,
            raw_fields: BTreeMap::new(),
        }
    }

    pub fn with_raw_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.raw_fields.insert(key.into(), value.into());
        self
    }
}

/// Validated observation, ready for a table upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub site: String,
    pub hotel_name: String,
    pub run_date: NaiveDate,
    pub score: Option<f64>,
    #[serde(default)]
    pub raw_fields: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SiteStatus {
    Ok,
    OkEmpty,
    Failed,
}

impl SiteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SiteStatus::Ok => "OK",
            SiteStatus::OkEmpty => "OK_EMPTY",
            SiteStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRunStatus {
    pub status: SiteStatus,
    pub row_count: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SiteRunStatus {
    pub fn ok(row_count: usize, warnings: Vec<String>) -> Self {
        Self {
            status: SiteStatus::Ok,
            row_count,
            warnings,
            error: None,
        }
    }

    pub fn ok_empty(row_count: usize, warnings: Vec<String>) -> Self {
        Self {
            status: SiteStatus::OkEmpty,
            row_count,
            warnings,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            status: SiteStatus::Failed,
            row_count: 0,
            warnings,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Ok,
    Warn,
    Failed,
}

impl OverallStatus {
    /// Worst status wins: FAILED > WARN > OK.
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a SiteRunStatus>) -> Self {
        statuses
            .into_iter()
            .map(|s| match s.status {
                SiteStatus::Ok => OverallStatus::Ok,
                SiteStatus::OkEmpty => OverallStatus::Warn,
                SiteStatus::Failed => OverallStatus::Failed,
            })
            .max()
            .unwrap_or(OverallStatus::Ok)
    }

    pub fn exit_code(self) -> u8 {
        match self {
            OverallStatus::Failed => 1,
            OverallStatus::Ok | OverallStatus::Warn => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Ok => "OK",
            OverallStatus::Warn => "WARN",
            OverallStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated outcome of one run. `overall_status` is always derived from the
/// per-site statuses, including after deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RunSummaryDocument")]
pub struct RunSummary {
    run_date: NaiveDate,
    sites: BTreeMap<String, SiteRunStatus>,
    overall_status: OverallStatus,
}

#[derive(Deserialize)]
struct RunSummaryDocument {
    run_date: NaiveDate,
    #[serde(default)]
    sites: BTreeMap<String, SiteRunStatus>,
}

impl From<RunSummaryDocument> for RunSummary {
    fn from(doc: RunSummaryDocument) -> Self {
        RunSummary::new(doc.run_date, doc.sites)
    }
}

impl RunSummary {
    pub fn new(run_date: NaiveDate, sites: BTreeMap<String, SiteRunStatus>) -> Self {
        let overall_status = OverallStatus::from_statuses(sites.values());
        Self {
            run_date,
            sites,
            overall_status,
        }
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn sites(&self) -> &BTreeMap<String, SiteRunStatus> {
        &self.sites
    }

    pub fn site(&self, site: &str) -> Option<&SiteRunStatus> {
        self.sites.get(site)
    }

    pub fn overall_status(&self) -> OverallStatus {
        self.overall_status
    }

    pub fn exit_code(&self) -> u8 {
        self.overall_status.exit_code()
    }

    pub fn into_sites(self) -> BTreeMap<String, SiteRunStatus> {
        self.sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 7).unwrap()
    }

    fn summary(statuses: Vec<(&str, SiteRunStatus)>) -> RunSummary {
        RunSummary::new(
            date(),
            statuses
                .into_iter()
                .map(|(site, status)| (site.to_string(), status))
                .collect(),
        )
    }

    #[test]
    fn normalize_sites_uppercases_and_filters_empty() {
        let raw = [" booking ", "TripAdvisor", "", "  ", "google", "BOOKING"];
        assert_eq!(normalize_sites(raw), vec!["BOOKING", "TRIPADVISOR", "GOOGLE"]);
    }

    #[test]
    fn overall_status_is_worst_site_status() {
        assert_eq!(summary(vec![]).overall_status(), OverallStatus::Ok);
        assert_eq!(
            summary(vec![("BOOKING", SiteRunStatus::ok(1, vec![]))]).overall_status(),
            OverallStatus::Ok
        );
        let warn = summary(vec![
            ("BOOKING", SiteRunStatus::ok(1, vec![])),
            ("TRIPADVISOR", SiteRunStatus::ok_empty(0, vec!["no rows".into()])),
        ]);
        assert_eq!(warn.overall_status(), OverallStatus::Warn);
        assert_eq!(warn.exit_code(), 0);

        let failed = summary(vec![
            ("BOOKING", SiteRunStatus::ok(1, vec![])),
            ("EXPEDIA", SiteRunStatus::failed("timeout", vec![])),
            ("TRIPADVISOR", SiteRunStatus::ok_empty(0, vec![])),
        ]);
        assert_eq!(failed.overall_status(), OverallStatus::Failed);
        assert_eq!(failed.exit_code(), 1);
    }

    #[test]
    fn status_names_serialize_in_screaming_case() {
        let json = serde_json::to_value(summary(vec![(
            "TRIPADVISOR",
            SiteRunStatus::ok_empty(0, vec!["no rows".into()]),
        )]))
        .unwrap();
        assert_eq!(json["run_date"], "2025-09-07");
        assert_eq!(json["sites"]["TRIPADVISOR"]["status"], "OK_EMPTY");
        assert_eq!(json["overall_status"], "WARN");
    }

    #[test]
    fn deserialized_summary_recomputes_overall_status() {
        let doc = serde_json::json!({
            "run_date": "2025-09-07",
            "sites": {"EXPEDIA": {"status": "FAILED", "row_count": 0, "warnings": [], "error": "boom"}},
            "overall_status": "OK"
        });
        let parsed: RunSummary = serde_json::from_value(doc).unwrap();
        assert_eq!(parsed.overall_status(), OverallStatus::Failed);
    }

    #[test]
    fn identifier_lookup_ignores_case_and_blanks() {
        let hotel = HotelConfig::new("Hotel Alpha")
            .with_identifier("booking", "https://example.test/alpha")
            .with_identifier("expedia", "  ");
        assert_eq!(hotel.identifier_for("BOOKING"), Some("https://example.test/alpha"));
        assert_eq!(hotel.identifier_for("EXPEDIA"), None);
        assert_eq!(hotel.identifier_for("GOOGLE"), None);
    }

    #[test]
    fn draft_accepts_date_alias() {
        let draft: ObservationDraft =
            serde_json::from_str(r#"{"hotel":"Hotel Alpha","date":"2025-09-07","score":8.7}"#).unwrap();
        assert_eq!(draft.run_date.as_deref(), Some("2025-09-07"));
        assert_eq!(draft.score, Some(JsonValue::from(8.7)));
    }
}
