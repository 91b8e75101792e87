//! Weekly run orchestration: configuration, validation, cross-environment merging
//! and run reporting.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use futures::FutureExt;
use hrep_collectors::{
    collector_for_site, CollectorContext, CollectorSpec, HttpClientConfig, SiteCollector,
    TokenBucketConfig,
};
use hrep_core::{
    normalize_site_id, normalize_sites, parse_run_date, HotelConfig, ObservationDraft,
    ResultRecord, RunSummary, SiteRunStatus, SiteStatus, RUN_DATE_FORMAT,
};
use hrep_storage::{
    write_atomically, BatchSnapshot, CsvTableOptions, CsvTableStore, MemoryTableStore, SiteTable,
    StoreError, TableRow, TableSchema, TableStore, HOTEL_COLUMN,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "hrep-sync";

pub const NO_ROWS: &str = "no rows";
pub const NO_SCORED_ROWS: &str = "no scored rows";
pub const SITE_NOT_CONFIGURED: &str = "site is not configured";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub fixtures_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Shared request budget across all HTTP collectors; unset means unlimited.
    pub http_rate_per_min: Option<u32>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("HREP_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/hotels.yaml")),
            data_dir: std::env::var("HREP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            fixtures_dir: std::env::var("HREP_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            scheduler_enabled: std::env::var("HREP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("HREP_SYNC_CRON").unwrap_or_else(|_| "0 6 * * 1".to_string()),
            user_agent: std::env::var("HREP_USER_AGENT")
                .unwrap_or_else(|_| "hrep-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("HREP_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_rate_per_min: std::env::var("HREP_HTTP_RATE_PER_MIN")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Default layout under `root`: `config/hotels.yaml`, `data/`, `fixtures/`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_path: root.join("config").join("hotels.yaml"),
            data_dir: root.join("data"),
            fixtures_dir: root.join("fixtures"),
            scheduler_enabled: false,
            sync_cron: "0 6 * * 1".to_string(),
            user_agent: "hrep-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_rate_per_min: None,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self.http_rate_per_min.and_then(TokenBucketConfig::per_minute),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    #[serde(default = "default_separator")]
    pub separator: char,
    #[serde(default = "default_columns")]
    pub columns: Vec<String>,
}

fn default_separator() -> char {
    ';'
}

fn default_columns() -> Vec<String> {
    TableSchema::standard().columns
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            columns: default_columns(),
        }
    }
}

impl TableConfig {
    pub fn csv_options(&self) -> Result<CsvTableOptions> {
        let separator = u8::try_from(self.separator)
            .ok()
            .filter(|b| b.is_ascii())
            .with_context(|| format!("table separator {:?} must be a single ASCII character", self.separator))?;
        if self.columns.first().map(String::as_str) != Some(HOTEL_COLUMN) {
            bail!("table columns must start with `{HOTEL_COLUMN}`, got {:?}", self.columns);
        }
        Ok(CsvTableOptions {
            separator,
            schema: TableSchema::new(self.columns.iter().cloned()),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    pub site_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub collector: CollectorSpec,
}

fn default_enabled() -> bool {
    true
}

/// Contents of the YAML run configuration (`HREP_CONFIG`).
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub table: TableConfig,
    pub sites: Vec<SiteConfig>,
    #[serde(default)]
    pub hotels: Vec<HotelConfig>,
}

impl RunConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut config: RunConfig = serde_yaml::from_str(text).context("parsing run configuration")?;
        config.normalize()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn normalize(&mut self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for site in &mut self.sites {
            let id = normalize_sites([&site.site_id]);
            let Some(id) = id.into_iter().next() else {
                bail!("site entry with an empty site_id");
            };
            if !seen.insert(id.clone()) {
                bail!("site {id} is configured more than once");
            }
            site.site_id = id;
        }
        for hotel in &mut self.hotels {
            let name = hotel.name.trim();
            if name.is_empty() {
                bail!("hotel entry with an empty name");
            }
            hotel.name = name.to_string();
        }
        self.table.csv_options()?;
        Ok(())
    }

    pub fn enabled_sites(&self) -> impl Iterator<Item = &SiteConfig> {
        self.sites.iter().filter(|s| s.enabled)
    }

    pub fn site_ids(&self) -> Vec<String> {
        self.enabled_sites().map(|s| s.site_id.clone()).collect()
    }

    /// One collector per enabled site, in configuration order.
    pub fn build_collectors(&self, ctx: &CollectorContext) -> Vec<Box<dyn SiteCollector>> {
        self.enabled_sites()
            .map(|site| collector_for_site(&site.site_id, &site.collector, ctx))
            .collect()
    }
}

/// Malformed collector output. Rejects the whole site batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("row {index}: missing hotel")]
    MissingHotel { index: usize },
    #[error("row {index} ({hotel}): missing run date")]
    MissingRunDate { index: usize, hotel: String },
    #[error("row {index} ({hotel}): run date `{value}` is not YYYY-MM-DD")]
    InvalidRunDate {
        index: usize,
        hotel: String,
        value: String,
    },
    #[error("row {index} ({hotel}): score must be a number, got {value}")]
    InvalidScore {
        index: usize,
        hotel: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedBatch {
    pub records: Vec<ResultRecord>,
    pub warnings: Vec<String>,
}

impl ValidatedBatch {
    pub fn scored(&self) -> usize {
        self.records.iter().filter(|r| r.score.is_some()).count()
    }

    pub fn status(&self) -> SiteRunStatus {
        let warnings = self.warnings.clone();
        if self.scored() == 0 {
            SiteRunStatus::ok_empty(self.records.len(), warnings)
        } else {
            SiteRunStatus::ok(self.records.len(), warnings)
        }
    }
}

/// Checks collector output against the configured hotels and the run date.
#[derive(Debug, Clone)]
pub struct Validator {
    hotels: BTreeSet<String>,
}

impl Validator {
    pub fn new(hotels: &[HotelConfig]) -> Self {
        Self {
            hotels: hotels.iter().map(|h| h.name.trim().to_string()).collect(),
        }
    }

    pub fn validate(
        &self,
        site: &str,
        run_date: NaiveDate,
        drafts: Vec<ObservationDraft>,
    ) -> Result<ValidatedBatch, SchemaError> {
        let mut warnings = Vec::new();
        if drafts.is_empty() {
            warnings.push(NO_ROWS.to_string());
            return Ok(ValidatedBatch {
                records: Vec::new(),
                warnings,
            });
        }

        let mut parsed = Vec::with_capacity(drafts.len());
        for (index, draft) in drafts.into_iter().enumerate() {
            parsed.push(check_shape(index, draft)?);
        }

        let mut records: Vec<ResultRecord> = Vec::new();
        let mut positions: BTreeMap<String, usize> = BTreeMap::new();
        for (hotel, date, score, raw_fields) in parsed {
            if !self.hotels.contains(&hotel) {
                warnings.push(format!("unknown hotel `{hotel}` dropped"));
                continue;
            }
            if date != run_date {
                warnings.push(format!("stale row for `{hotel}` dated {date} dropped"));
                continue;
            }
            if let Some(JsonValue::String(err)) = raw_fields.get("error") {
                warnings.push(format!("`{hotel}`: {err}"));
            }
            let record = ResultRecord {
                site: site.to_string(),
                hotel_name: hotel.clone(),
                run_date: date,
                score,
                raw_fields,
            };
            match positions.get(&hotel) {
                Some(&pos) => {
                    warnings.push(format!("duplicate row for `{hotel}` on {date}; last value wins"));
                    records[pos] = record;
                }
                None => {
                    positions.insert(hotel, records.len());
                    records.push(record);
                }
            }
        }

        if records.is_empty() {
            warnings.push("no usable rows".to_string());
        } else if records.iter().all(|r| r.score.is_none()) {
            warnings.push(NO_SCORED_ROWS.to_string());
        }
        Ok(ValidatedBatch { records, warnings })
    }
}

type ShapedRow = (String, NaiveDate, Option<f64>, BTreeMap<String, JsonValue>);

fn check_shape(index: usize, draft: ObservationDraft) -> Result<ShapedRow, SchemaError> {
    let hotel = draft
        .hotel
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(SchemaError::MissingHotel { index })?
        .to_string();

    let raw_date = draft
        .run_date
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| SchemaError::MissingRunDate {
            index,
            hotel: hotel.clone(),
        })?;
    let date = parse_run_date(raw_date).ok_or_else(|| SchemaError::InvalidRunDate {
        index,
        hotel: hotel.clone(),
        value: raw_date.to_string(),
    })?;

    let score = match &draft.score {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::Number(n)) => n.as_f64(),
        Some(other) => {
            return Err(SchemaError::InvalidScore {
                index,
                hotel,
                value: other.to_string(),
            })
        }
    };
    Ok((hotel, date, score, draft.raw_fields))
}

/// Runs site collectors one after another and records a status per site.
pub struct RunOrchestrator {
    collectors: Vec<Box<dyn SiteCollector>>,
}

impl RunOrchestrator {
    pub fn new(collectors: Vec<Box<dyn SiteCollector>>) -> Self {
        Self { collectors }
    }

    pub fn with_collector(mut self, collector: Box<dyn SiteCollector>) -> Self {
        self.collectors.push(collector);
        self
    }

    pub fn site_ids(&self) -> Vec<String> {
        self.collectors
            .iter()
            .map(|c| normalize_site_id(c.site_id()))
            .collect()
    }

    /// Collects, validates and stores every configured site (or the `selection`
    /// subset). A failing site never stops the ones after it.
    pub async fn run(
        &self,
        selection: Option<&[String]>,
        hotels: &[HotelConfig],
        run_date: NaiveDate,
        store: &mut dyn TableStore,
    ) -> RunSummary {
        let validator = Validator::new(hotels);
        let selected = selection
            .map(normalize_sites)
            .filter(|sites| !sites.is_empty());
        let configured = self.site_ids();
        let mut sites = BTreeMap::new();

        if let Some(requested) = &selected {
            for site in requested.iter().filter(|s| !configured.contains(*s)) {
                warn!(site = %site, "requested site is not configured");
                sites.insert(site.clone(), SiteRunStatus::failed(SITE_NOT_CONFIGURED, Vec::new()));
            }
        }

        for (collector, site) in self.collectors.iter().zip(configured) {
            if selected.as_ref().is_some_and(|requested| !requested.contains(&site)) {
                continue;
            }
            info!(site = %site, %run_date, "collecting site");
            let status = run_site(collector.as_ref(), &site, &validator, hotels, run_date, &mut *store).await;
            match status.status {
                SiteStatus::Failed => error!(
                    site = %site,
                    error = status.error.as_deref().unwrap_or_default(),
                    "site failed"
                ),
                SiteStatus::OkEmpty => warn!(site = %site, warnings = ?status.warnings, "site returned no scores"),
                SiteStatus::Ok => info!(site = %site, rows = status.row_count, "site ok"),
            }
            sites.insert(site, status);
        }

        RunSummary::new(run_date, sites)
    }
}

async fn run_site(
    collector: &dyn SiteCollector,
    site: &str,
    validator: &Validator,
    hotels: &[HotelConfig],
    run_date: NaiveDate,
    store: &mut dyn TableStore,
) -> SiteRunStatus {
    let collected = AssertUnwindSafe(collector.collect(hotels, run_date))
        .catch_unwind()
        .await;
    let drafts = match collected {
        Ok(Ok(drafts)) => drafts,
        Ok(Err(err)) => return SiteRunStatus::failed(err.to_string(), Vec::new()),
        Err(panic) => {
            return SiteRunStatus::failed(
                format!("collector panicked: {}", panic_message(panic.as_ref())),
                Vec::new(),
            )
        }
    };
    debug!(site, rows = drafts.len(), "collector returned");

    let batch = match validator.validate(site, run_date, drafts) {
        Ok(batch) => batch,
        Err(err) => return SiteRunStatus::failed(format!("schema error: {err}"), Vec::new()),
    };

    let rows = batch
        .records
        .iter()
        .map(|record| TableRow {
            hotel: record.hotel_name.clone(),
            run_date: record.run_date,
            score: record.score,
        })
        .collect::<Vec<_>>();
    if let Err(err) = store.upsert_rows(site, &rows) {
        return SiteRunStatus::failed(format!("store error: {err}"), batch.warnings.clone());
    }
    batch.status()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Two environments disagree on the non-date columns of a site table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("merge conflict for {site}: schema {left} does not match {right}")]
pub struct MergeConflict {
    pub site: String,
    pub left: TableSchema,
    pub right: TableSchema,
}

#[derive(Debug, Error)]
enum CommitError {
    #[error(transparent)]
    Conflict(#[from] MergeConflict),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Union of several batch snapshots, ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub run_date: NaiveDate,
    pub tables: BTreeMap<String, SiteTable>,
    pub statuses: BTreeMap<String, SiteRunStatus>,
    pub conflicts: Vec<MergeConflict>,
}

impl MergeOutcome {
    pub fn summary(&self) -> RunSummary {
        RunSummary::new(self.run_date, self.statuses.clone())
    }
}

/// Merges batch snapshots cell by cell. Batches are applied in
/// `(completed_at, batch_id)` order so the latest writer wins regardless of
/// argument order; an unscored cell never replaces a score. Sites whose schemas
/// disagree are dropped and marked failed.
///
/// A later batch that failed a site without rows does not override a site that
/// already has merged rows. Row counts are taken from the merged table.
pub fn merge_batches(mut batches: Vec<BatchSnapshot>) -> Result<MergeOutcome> {
    batches.sort_by(|a, b| (a.completed_at, a.batch_id).cmp(&(b.completed_at, b.batch_id)));
    let run_date = batches
        .iter()
        .map(|b| b.run_date)
        .max()
        .context("no batch snapshots to merge")?;

    let mut schemas: BTreeMap<String, TableSchema> = BTreeMap::new();
    let mut cells: BTreeMap<String, BTreeMap<(String, NaiveDate), Option<f64>>> = BTreeMap::new();
    let mut conflicts: BTreeMap<String, MergeConflict> = BTreeMap::new();
    let mut statuses: BTreeMap<String, SiteRunStatus> = BTreeMap::new();

    for batch in batches {
        debug!(batch_id = %batch.batch_id, completed_at = %batch.completed_at, "merging batch");
        let mut contributed = BTreeSet::new();
        for (site, table) in batch.tables {
            let site = normalize_site_id(&site);
            match schemas.get(&site) {
                Some(existing) if *existing != table.schema => {
                    conflicts.entry(site.clone()).or_insert_with(|| MergeConflict {
                        site: site.clone(),
                        left: existing.clone(),
                        right: table.schema.clone(),
                    });
                    continue;
                }
                Some(_) => {}
                None => {
                    schemas.insert(site.clone(), table.schema.clone());
                }
            }
            if !table.rows.is_empty() {
                contributed.insert(site.clone());
            }
            let site_cells = cells.entry(site).or_default();
            for row in table.rows {
                let cell = site_cells.entry((row.hotel, row.run_date)).or_insert(None);
                if row.score.is_some() {
                    *cell = row.score;
                }
            }
        }

        for (site, status) in batch.summary.into_sites() {
            let site = normalize_site_id(&site);
            let has_rows = cells.get(&site).is_some_and(|c| !c.is_empty());
            if status.status == SiteStatus::Failed && has_rows && !contributed.contains(&site) {
                let error = status.error.unwrap_or_default();
                warn!(
                    site = %site,
                    batch_id = %batch.batch_id,
                    error = %error,
                    "keeping rows merged from an earlier batch"
                );
                statuses
                    .entry(site)
                    .or_insert_with(|| SiteRunStatus::ok(0, Vec::new()))
                    .warnings
                    .push(format!("later batch failed: {error}"));
                continue;
            }
            statuses.insert(site, status);
        }
    }

    for (site, conflict) in &conflicts {
        warn!(site = %site, error = %conflict, "dropping conflicting site from merge");
        cells.remove(site);
        let warnings = statuses
            .get(site)
            .map(|s| s.warnings.clone())
            .unwrap_or_default();
        statuses.insert(site.clone(), SiteRunStatus::failed(conflict.to_string(), warnings));
    }

    for (site, site_cells) in &cells {
        let Some(status) = statuses.get_mut(site) else {
            continue;
        };
        if status.status == SiteStatus::Failed {
            continue;
        }
        let current = site_cells
            .iter()
            .filter(|((_, date), _)| *date == run_date)
            .map(|(_, score)| score)
            .collect::<Vec<_>>();
        status.row_count = current.len();
        if status.status == SiteStatus::OkEmpty && current.iter().any(|score| score.is_some()) {
            status.status = SiteStatus::Ok;
            status.warnings.retain(|w| w != NO_ROWS && w != NO_SCORED_ROWS);
        }
    }

    let tables = cells
        .into_iter()
        .filter_map(|(site, site_cells)| {
            let schema = schemas.get(&site)?.clone();
            let rows = site_cells
                .into_iter()
                .map(|((hotel, run_date), score)| TableRow {
                    hotel,
                    run_date,
                    score,
                })
                .collect();
            Some((site, SiteTable { schema, rows }))
        })
        .collect();

    Ok(MergeOutcome {
        run_date,
        tables,
        statuses,
        conflicts: conflicts.into_values().collect(),
    })
}

/// Writes merged tables into the durable store. A site whose schema differs from
/// the table already on disk is left untouched and reported as failed.
pub fn commit_merge(outcome: MergeOutcome, store: &mut dyn TableStore) -> RunSummary {
    let MergeOutcome {
        run_date,
        tables,
        mut statuses,
        ..
    } = outcome;

    for (site, table) in tables {
        match commit_site(&site, &table, store) {
            Ok(()) => info!(site = %site, rows = table.rows.len(), "committed site table"),
            Err(err) => {
                error!(site = %site, error = %err, "site commit failed");
                let warnings = statuses
                    .get(&site)
                    .map(|s| s.warnings.clone())
                    .unwrap_or_default();
                statuses.insert(site, SiteRunStatus::failed(err.to_string(), warnings));
            }
        }
    }

    RunSummary::new(run_date, statuses)
}

fn commit_site(site: &str, table: &SiteTable, store: &mut dyn TableStore) -> Result<(), CommitError> {
    if let Some(existing) = store.schema(site)? {
        if existing != table.schema {
            return Err(MergeConflict {
                site: site.to_string(),
                left: existing,
                right: table.schema.clone(),
            }
            .into());
        }
    }
    store.upsert_rows(site, &table.rows)?;
    Ok(())
}

pub fn to_json(summary: &RunSummary) -> serde_json::Result<JsonValue> {
    serde_json::to_value(summary)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationLevel {
    Warning,
    Error,
}

impl AnnotationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationLevel::Warning => "warning",
            AnnotationLevel::Error => "error",
        }
    }
}

/// One CI workflow annotation. `Display` renders the GitHub workflow command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiAnnotation {
    pub level: AnnotationLevel,
    pub title: String,
    pub message: String,
}

impl fmt::Display for CiAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "::{} title={}::{}",
            self.level.as_str(),
            escape_property(&self.title),
            escape_data(&self.message)
        )
    }
}

fn escape_data(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

fn escape_property(value: &str) -> String {
    escape_data(value).replace(':', "%3A").replace(',', "%2C")
}

pub fn to_ci_annotations(summary: &RunSummary) -> Vec<CiAnnotation> {
    let run_date = summary.run_date().format(RUN_DATE_FORMAT);
    summary
        .sites()
        .iter()
        .filter_map(|(site, status)| match status.status {
            SiteStatus::Ok => None,
            SiteStatus::OkEmpty => Some(CiAnnotation {
                level: AnnotationLevel::Warning,
                title: format!("{site} empty"),
                message: format!(
                    "{site} returned no scores for {run_date}: {}",
                    status.warnings.join("; ")
                ),
            }),
            SiteStatus::Failed => Some(CiAnnotation {
                level: AnnotationLevel::Error,
                title: format!("{site} failed"),
                message: format!(
                    "{site} failed for {run_date}: {}",
                    status.error.as_deref().unwrap_or("unknown error")
                ),
            }),
        })
        .collect()
}

pub fn to_markdown(summary: &RunSummary) -> String {
    let mut out = format!(
        "## Hotel reputation run {}\n\nOverall: **{}**\n\n| Site | Status | Rows | Notes |\n|---|---|---|---|\n",
        summary.run_date().format(RUN_DATE_FORMAT),
        summary.overall_status()
    );
    for (site, status) in summary.sites() {
        let notes = match &status.error {
            Some(error) => error.clone(),
            None => status.warnings.join("; "),
        };
        out.push_str(&format!(
            "| {site} | {} | {} | {} |\n",
            status.status,
            status.row_count,
            notes.replace('|', "\\|").replace('\n', " ")
        ));
    }
    out
}

pub fn write_summary_json(summary: &RunSummary, path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    write_atomically(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "wrote run summary");
    Ok(())
}

/// Appends the markdown summary to `$GITHUB_STEP_SUMMARY` when running in a
/// workflow. Returns whether anything was written.
pub fn append_step_summary(summary: &RunSummary) -> Result<bool> {
    let Some(path) = std::env::var_os("GITHUB_STEP_SUMMARY").filter(|p| !p.is_empty()) else {
        return Ok(false);
    };
    let path = PathBuf::from(path);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(to_markdown(summary).as_bytes())
        .with_context(|| format!("appending to {}", path.display()))?;
    Ok(true)
}

pub fn load_snapshots(paths: &[PathBuf]) -> Result<Vec<BatchSnapshot>> {
    paths
        .iter()
        .map(|path| {
            BatchSnapshot::load(path).with_context(|| format!("loading batch snapshot {}", path.display()))
        })
        .collect()
}

/// One `run` invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub sites: Option<Vec<String>>,
    pub run_date: NaiveDate,
    pub merge: Vec<PathBuf>,
}

impl RunRequest {
    pub fn for_date(run_date: NaiveDate) -> Self {
        Self {
            sites: None,
            run_date,
            merge: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct SyncPipeline {
    config: SyncConfig,
    run_config: RunConfig,
    context: CollectorContext,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, run_config: RunConfig) -> Result<Self> {
        let context = CollectorContext::new(config.fixtures_dir.clone(), config.http_client_config())?;
        Ok(Self {
            config,
            run_config,
            context,
        })
    }

    pub async fn load(config: SyncConfig) -> Result<Self> {
        let run_config = RunConfig::load(&config.config_path).await?;
        Self::new(config, run_config)
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    pub fn table_store(&self) -> Result<CsvTableStore> {
        Ok(CsvTableStore::new(
            self.config.data_dir.clone(),
            self.run_config.table.csv_options()?,
        ))
    }

    pub fn orchestrator(&self) -> RunOrchestrator {
        RunOrchestrator::new(self.run_config.build_collectors(&self.context))
    }

    /// Runs the collectors into a staging store and packages the result for a
    /// later merge. Nothing is written to the durable tables.
    pub async fn run_to_batch(&self, sites: Option<&[String]>, run_date: NaiveDate) -> Result<BatchSnapshot> {
        let schema = self.run_config.table.csv_options()?.schema;
        let mut staging = MemoryTableStore::with_schema(schema);
        info!(run_id = %self.context.run_id, %run_date, "starting run");
        let summary = self
            .orchestrator()
            .run(sites, &self.run_config.hotels, run_date, &mut staging)
            .await;
        Ok(BatchSnapshot::from_store(summary, &staging, Utc::now()))
    }

    /// Collect, merge with any external snapshots, commit to the CSV tables.
    pub async fn run_weekly(&self, request: &RunRequest) -> Result<RunSummary> {
        let batch = self.run_to_batch(request.sites.as_deref(), request.run_date).await?;
        let mut batches = vec![batch];
        batches.extend(load_snapshots(&request.merge)?);
        self.merge_and_commit(batches)
    }

    pub fn merge_and_commit(&self, batches: Vec<BatchSnapshot>) -> Result<RunSummary> {
        let outcome = merge_batches(batches)?;
        let mut store = self.table_store()?;
        let summary = commit_merge(outcome, &mut store);
        info!(
            run_date = %summary.run_date(),
            status = %summary.overall_status(),
            sites = summary.sites().len(),
            "run committed"
        );
        Ok(summary)
    }

    /// Freshness check of every enabled site table for `run_date`.
    pub fn verify(&self, run_date: NaiveDate) -> Result<RunSummary> {
        let store = self.table_store()?;
        let mut sites = BTreeMap::new();
        for site in self.run_config.site_ids() {
            let path = store.table_path(&site);
            let status = match store.check(&site, run_date) {
                Err(err) => SiteRunStatus::failed(err.to_string(), Vec::new()),
                Ok(check) if !check.exists => {
                    SiteRunStatus::failed(format!("{} does not exist", path.display()), Vec::new())
                }
                Ok(check) if !check.has_date => SiteRunStatus::failed(
                    format!("{} has no column for {run_date}", path.display()),
                    Vec::new(),
                ),
                Ok(check) if check.scored == 0 => SiteRunStatus::ok_empty(
                    0,
                    vec![format!("{NO_SCORED_ROWS} for {run_date} (0/{})", check.total)],
                ),
                Ok(check) => {
                    let warnings = if check.scored < check.total {
                        vec![format!("{}/{} hotels scored", check.scored, check.total)]
                    } else {
                        Vec::new()
                    };
                    SiteRunStatus::ok(check.scored, warnings)
                }
            };
            debug!(site = %site, status = %status.status, "verified site table");
            sites.insert(site, status);
        }
        Ok(RunSummary::new(run_date, sites))
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::new(self.clone());
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let request = RunRequest::for_date(Utc::now().date_naive());
                match pipeline.run_weekly(&request).await {
                    Ok(summary) => {
                        for annotation in to_ci_annotations(&summary) {
                            warn!(%annotation, "scheduled run annotation");
                        }
                        info!(status = %summary.overall_status(), "scheduled run finished");
                    }
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
