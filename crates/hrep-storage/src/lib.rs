//! Per-site score tables and the batch snapshots exchanged between run environments.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use hrep_core::{normalize_site_id, parse_run_date, RunSummary, RUN_DATE_FORMAT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrep-storage";

pub const HOTEL_COLUMN: &str = "Hotel";
pub const AVERAGE_COLUMN: &str = "Average Score";

const TABLE_FILE_SUFFIX: &str = "_scores.csv";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed table {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("snapshot {path} failed checksum verification (expected {expected}, got {actual})")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("serializing snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ordered non-date columns of a site table. Date columns are implied by the rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    /// `Hotel` + `Average Score`, the layout of the existing per-site CSV files.
    pub fn standard() -> Self {
        Self::new([HOTEL_COLUMN, AVERAGE_COLUMN])
    }
}

impl Default for TableSchema {
    fn default() -> Self {
        Self::standard()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.columns.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub hotel: String,
    pub run_date: NaiveDate,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteTable {
    pub schema: TableSchema,
    pub rows: Vec<TableRow>,
}

/// Freshness of one site table for one run date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TableCheck {
    pub exists: bool,
    pub has_date: bool,
    pub scored: usize,
    pub total: usize,
}

/// Durable per-site table keyed by (hotel, run_date).
///
/// `upsert` must be idempotent: the same key always ends up holding the last score
/// written, earlier run dates are never touched. A `None` score is "no observation":
/// it creates a blank cell but never clears a stored score.
pub trait TableStore: Send {
    fn upsert(
        &mut self,
        site: &str,
        hotel: &str,
        run_date: NaiveDate,
        score: Option<f64>,
    ) -> Result<(), StoreError>;

    /// Upserts every row of one site. Stores that can should apply all of them or none.
    fn upsert_rows(&mut self, site: &str, rows: &[TableRow]) -> Result<(), StoreError> {
        for row in rows {
            self.upsert(site, &row.hotel, row.run_date, row.score)?;
        }
        Ok(())
    }

    fn rows(&self, site: &str) -> Result<Vec<TableRow>, StoreError>;

    /// `None` when the site has no table yet.
    fn schema(&self, site: &str) -> Result<Option<TableSchema>, StoreError>;

    fn sites(&self) -> Result<Vec<String>, StoreError>;

    fn check(&self, site: &str, run_date: NaiveDate) -> Result<TableCheck, StoreError> {
        if self.schema(site)?.is_none() {
            return Ok(TableCheck::default());
        }
        let rows = self.rows(site)?;
        let hotels: BTreeSet<&str> = rows.iter().map(|r| r.hotel.as_str()).collect();
        let dated = rows.iter().filter(|r| r.run_date == run_date);
        let mut has_date = false;
        let mut scored = 0;
        for row in dated {
            has_date = true;
            if row.score.is_some() {
                scored += 1;
            }
        }
        Ok(TableCheck {
            exists: true,
            has_date,
            scored,
            total: hotels.len(),
        })
    }
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    cells: BTreeMap<(String, NaiveDate), Option<f64>>,
}

/// Long-table store kept in memory. Used as the per-run staging area.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    schema: TableSchema,
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema given to tables created by `upsert`.
    pub fn with_schema(schema: TableSchema) -> Self {
        Self {
            schema,
            tables: BTreeMap::new(),
        }
    }

    pub fn table(&self, site: &str) -> Option<SiteTable> {
        self.tables.get(&normalize_site_id(site)).map(|t| SiteTable {
            schema: t.schema.clone(),
            rows: t
                .cells
                .iter()
                .map(|((hotel, run_date), score)| TableRow {
                    hotel: hotel.clone(),
                    run_date: *run_date,
                    score: *score,
                })
                .collect(),
        })
    }

    pub fn tables(&self) -> BTreeMap<String, SiteTable> {
        self.tables
            .keys()
            .filter_map(|site| self.table(site).map(|t| (site.clone(), t)))
            .collect()
    }
}

impl TableStore for MemoryTableStore {
    fn upsert(
        &mut self,
        site: &str,
        hotel: &str,
        run_date: NaiveDate,
        score: Option<f64>,
    ) -> Result<(), StoreError> {
        let schema = self.schema.clone();
        let table = self
            .tables
            .entry(normalize_site_id(site))
            .or_insert_with(|| MemoryTable {
                schema,
                cells: BTreeMap::new(),
            });
        let cell = table.cells.entry((hotel.to_string(), run_date)).or_insert(None);
        if score.is_some() {
            *cell = score;
        }
        Ok(())
    }

    fn rows(&self, site: &str) -> Result<Vec<TableRow>, StoreError> {
        Ok(self.table(site).map(|t| t.rows).unwrap_or_default())
    }

    fn schema(&self, site: &str) -> Result<Option<TableSchema>, StoreError> {
        Ok(self
            .tables
            .get(&normalize_site_id(site))
            .map(|t| t.schema.clone()))
    }

    fn sites(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.keys().cloned().collect())
    }
}

#[derive(Debug, Clone)]
pub struct CsvTableOptions {
    pub separator: u8,
    /// Columns given to tables this store creates.
    pub schema: TableSchema,
}

impl Default for CsvTableOptions {
    fn default() -> Self {
        Self {
            separator: b';',
            schema: TableSchema::standard(),
        }
    }
}

/// Wide CSV tables, one file per site: `Hotel`, optional `Average Score`, then one
/// column per run date. An upsert rewrites a single cell and recomputes the average.
#[derive(Debug, Clone)]
pub struct CsvTableStore {
    root: PathBuf,
    options: CsvTableOptions,
}

impl CsvTableStore {
    pub fn new(root: impl Into<PathBuf>, options: CsvTableOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn table_path(&self, site: &str) -> PathBuf {
        self.root.join(format!(
            "{}{TABLE_FILE_SUFFIX}",
            normalize_site_id(site).to_ascii_lowercase()
        ))
    }

    fn load(&self, site: &str) -> Result<Option<WideTable>, StoreError> {
        let path = self.table_path(site);
        if !path.exists() {
            return Ok(None);
        }
        WideTable::read(&path, self.options.separator, &self.options.schema).map(Some)
    }

    fn load_or_create(&self, site: &str) -> Result<WideTable, StoreError> {
        Ok(match self.load(site)? {
            Some(table) => table,
            None => {
                info!(site, path = %self.table_path(site).display(), "creating site table");
                WideTable::empty(self.options.schema.clone())
            }
        })
    }

    fn save(&self, site: &str, table: &WideTable) -> Result<(), StoreError> {
        let path = self.table_path(site);
        let bytes = table.to_csv_bytes(&path, self.options.separator)?;
        write_atomically(&path, &bytes)
    }
}

impl TableStore for CsvTableStore {
    fn upsert(
        &mut self,
        site: &str,
        hotel: &str,
        run_date: NaiveDate,
        score: Option<f64>,
    ) -> Result<(), StoreError> {
        let mut table = self.load_or_create(site)?;
        table.set(hotel, run_date, score);
        self.save(site, &table)?;
        debug!(site, hotel, %run_date, ?score, "upserted score cell");
        Ok(())
    }

    /// One read and one atomic write for the whole batch.
    fn upsert_rows(&mut self, site: &str, rows: &[TableRow]) -> Result<(), StoreError> {
        let mut table = self.load_or_create(site)?;
        for row in rows {
            table.set(&row.hotel, row.run_date, row.score);
        }
        self.save(site, &table)?;
        debug!(site, rows = rows.len(), "upserted score rows");
        Ok(())
    }

    fn rows(&self, site: &str) -> Result<Vec<TableRow>, StoreError> {
        Ok(self.load(site)?.map(|t| t.rows()).unwrap_or_default())
    }

    fn schema(&self, site: &str) -> Result<Option<TableSchema>, StoreError> {
        Ok(self.load(site)?.map(|t| t.schema))
    }

    fn sites(&self) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            action: "listing",
            path: self.root.clone(),
            source,
        })?;
        let mut sites = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(TABLE_FILE_SUFFIX).map(normalize_site_id)
            })
            .filter(|site| !site.is_empty())
            .collect::<Vec<_>>();
        sites.sort();
        Ok(sites)
    }

    fn check(&self, site: &str, run_date: NaiveDate) -> Result<TableCheck, StoreError> {
        let Some(table) = self.load(site)? else {
            return Ok(TableCheck::default());
        };
        let has_date = table.dates.contains(&run_date);
        let scored = table
            .hotels
            .iter()
            .filter(|h| table.scores.contains_key(&((*h).clone(), run_date)))
            .count();
        Ok(TableCheck {
            exists: true,
            has_date,
            scored,
            total: table.hotels.len(),
        })
    }
}

#[derive(Debug, Clone)]
struct WideTable {
    schema: TableSchema,
    dates: BTreeSet<NaiveDate>,
    hotels: Vec<String>,
    scores: BTreeMap<(String, NaiveDate), f64>,
    /// Cells of non-date columns other than `Hotel`/`Average Score`, kept verbatim.
    passthrough: BTreeMap<(String, String), String>,
}

impl WideTable {
    fn empty(schema: TableSchema) -> Self {
        Self {
            schema,
            dates: BTreeSet::new(),
            hotels: Vec::new(),
            scores: BTreeMap::new(),
            passthrough: BTreeMap::new(),
        }
    }

    fn read(path: &Path, separator: u8, default_schema: &TableSchema) -> Result<Self, StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(separator)
            .has_headers(false)
            .flexible(true)
            .from_path(path)
            .map_err(|source| StoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
        let mut records = reader.records();

        let header = match records.next() {
            Some(record) => record.map_err(|source| StoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?,
            None => return Ok(Self::empty(default_schema.clone())),
        };

        let mut columns = Vec::new();
        let mut layout = Vec::new();
        for (idx, cell) in header.iter().enumerate() {
            let name = cell.trim_start_matches('\u{feff}').trim();
            if idx == 0 && name != HOTEL_COLUMN {
                return Err(StoreError::Malformed {
                    path: path.to_path_buf(),
                    message: format!("first column must be `{HOTEL_COLUMN}`, found `{name}`"),
                });
            }
            match parse_run_date(name) {
                Some(date) => layout.push(Column::Date(date)),
                None => {
                    columns.push(name.to_string());
                    layout.push(Column::Named(name.to_string()));
                }
            }
        }

        let mut table = Self::empty(TableSchema { columns });
        table.dates = layout
            .iter()
            .filter_map(|c| match c {
                Column::Date(d) => Some(*d),
                Column::Named(_) => None,
            })
            .collect();

        for record in records {
            let record = record.map_err(|source| StoreError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let hotel = record.get(0).map(str::trim).unwrap_or_default();
            if hotel.is_empty() {
                continue;
            }
            table.ensure_hotel(hotel);
            for (column, cell) in layout.iter().zip(record.iter()).skip(1) {
                match column {
                    Column::Date(date) => {
                        if let Some(score) = parse_score_cell(cell) {
                            table.scores.insert((hotel.to_string(), *date), score);
                        }
                    }
                    Column::Named(name) if name == AVERAGE_COLUMN => {}
                    Column::Named(name) => {
                        if !cell.is_empty() {
                            table
                                .passthrough
                                .insert((hotel.to_string(), name.clone()), cell.to_string());
                        }
                    }
                }
            }
        }
        Ok(table)
    }

    fn ensure_hotel(&mut self, hotel: &str) {
        if !self.hotels.iter().any(|h| h == hotel) {
            self.hotels.push(hotel.to_string());
        }
    }

    fn set(&mut self, hotel: &str, run_date: NaiveDate, score: Option<f64>) {
        self.ensure_hotel(hotel);
        self.dates.insert(run_date);
        if let Some(score) = score {
            self.scores.insert((hotel.to_string(), run_date), score);
        }
    }

    fn average(&self, hotel: &str) -> Option<f64> {
        let values = self
            .dates
            .iter()
            .filter_map(|d| self.scores.get(&(hotel.to_string(), *d)))
            .collect::<Vec<_>>();
        if values.is_empty() {
            return None;
        }
        let mean = values.iter().copied().sum::<f64>() / values.len() as f64;
        Some((mean * 100.0).round() / 100.0)
    }

    fn rows(&self) -> Vec<TableRow> {
        self.hotels
            .iter()
            .flat_map(|hotel| {
                self.dates.iter().map(move |date| TableRow {
                    hotel: hotel.clone(),
                    run_date: *date,
                    score: self.scores.get(&(hotel.clone(), *date)).copied(),
                })
            })
            .collect()
    }

    fn to_csv_bytes(&self, path: &Path, separator: u8) -> Result<Vec<u8>, StoreError> {
        let csv_err = |source| StoreError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::WriterBuilder::new()
            .delimiter(separator)
            .from_writer(Vec::new());

        let header = self
            .schema
            .columns
            .iter()
            .cloned()
            .chain(self.dates.iter().map(|d| d.format(RUN_DATE_FORMAT).to_string()))
            .collect::<Vec<_>>();
        writer.write_record(&header).map_err(csv_err)?;

        for hotel in &self.hotels {
            let mut record = Vec::with_capacity(header.len());
            for column in &self.schema.columns {
                let cell = if column == HOTEL_COLUMN {
                    hotel.clone()
                } else if column == AVERAGE_COLUMN {
                    self.average(hotel).map(format_score).unwrap_or_default()
                } else {
                    self.passthrough
                        .get(&(hotel.clone(), column.clone()))
                        .cloned()
                        .unwrap_or_default()
                };
                record.push(cell);
            }
            for date in &self.dates {
                record.push(
                    self.scores
                        .get(&(hotel.clone(), *date))
                        .copied()
                        .map(format_score)
                        .unwrap_or_default(),
                );
            }
            writer.write_record(&record).map_err(csv_err)?;
        }

        writer.into_inner().map_err(|err| StoreError::Io {
            action: "buffering",
            path: path.to_path_buf(),
            source: err.into_error(),
        })
    }
}

enum Column {
    Named(String),
    Date(NaiveDate),
}

fn parse_score_cell(cell: &str) -> Option<f64> {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return None;
    }
    cell.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn format_score(score: f64) -> String {
    format!("{score}")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::Io {
        action: "creating directory",
        path: parent.to_path_buf(),
        source,
    })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        });
    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::Io {
            action: "writing temp file",
            path: temp_path,
            source,
        });
    }

    fs::rename(&temp_path, path).map_err(|source| {
        let _ = fs::remove_file(&temp_path);
        StoreError::Io {
            action: "renaming temp file onto",
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Everything one execution environment produced for one run: the staged site
/// tables plus that environment's run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: Uuid,
    pub run_date: NaiveDate,
    pub completed_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub tables: BTreeMap<String, SiteTable>,
    #[serde(default)]
    pub tables_sha256: String,
}

impl BatchSnapshot {
    pub fn new(
        summary: RunSummary,
        tables: BTreeMap<String, SiteTable>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            run_date: summary.run_date(),
            completed_at,
            summary,
            tables,
            tables_sha256: String::new(),
        }
    }

    pub fn from_store(summary: RunSummary, staging: &MemoryTableStore, completed_at: DateTime<Utc>) -> Self {
        Self::new(summary, staging.tables(), completed_at)
    }

    pub fn tables_checksum(tables: &BTreeMap<String, SiteTable>) -> Result<String, StoreError> {
        Ok(sha256_hex(&serde_json::to_vec(tables)?))
    }

    /// Writes the snapshot as pretty JSON, stamping the tables checksum.
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let mut sealed = self.clone();
        sealed.tables_sha256 = Self::tables_checksum(&self.tables)?;
        let bytes = serde_json::to_vec_pretty(&sealed)?;
        write_atomically(path, &bytes)?;
        info!(
            batch_id = %sealed.batch_id,
            path = %path.display(),
            sites = sealed.tables.len(),
            "wrote batch snapshot"
        );
        Ok(())
    }

    /// Reads a snapshot and rejects it unless the tables checksum matches.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
            action: "reading",
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: BatchSnapshot =
            serde_json::from_str(&text).map_err(|e| StoreError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let actual = Self::tables_checksum(&snapshot.tables)?;
        if snapshot.tables_sha256 != actual {
            return Err(StoreError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: snapshot.tables_sha256,
                actual,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrep_core::SiteRunStatus;
    use tempfile::tempdir;

    fn d(raw: &str) -> NaiveDate {
        parse_run_date(raw).unwrap()
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn memory_upsert_is_idempotent_and_keeps_history() {
        let mut store = MemoryTableStore::new();
        store.upsert("booking", "Hotel Alpha", d("2025-09-07"), Some(8.7)).unwrap();
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-14"), Some(8.8)).unwrap();
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-14"), Some(8.8)).unwrap();

        let rows = store.rows("BOOKING").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].score, Some(8.7));
        assert_eq!(rows[1].score, Some(8.8));
        assert_eq!(store.sites().unwrap(), vec!["BOOKING"]);
    }

    #[test]
    fn memory_check_counts_scored_hotels_for_date() {
        let mut store = MemoryTableStore::new();
        assert_eq!(store.check("BOOKING", d("2025-09-07")).unwrap(), TableCheck::default());

        store.upsert("BOOKING", "Hotel Alpha", d("2025-08-31"), Some(8.1)).unwrap();
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-07"), Some(8.7)).unwrap();
        store.upsert("BOOKING", "Hotel Beta", d("2025-09-07"), None).unwrap();
        assert_eq!(
            store.check("BOOKING", d("2025-09-07")).unwrap(),
            TableCheck {
                exists: true,
                has_date: true,
                scored: 1,
                total: 2
            }
        );
        assert!(!store.check("BOOKING", d("2025-09-14")).unwrap().has_date);
    }

    #[test]
    fn csv_store_writes_wide_layout_with_average() {
        let dir = tempdir().unwrap();
        let mut store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-14"), Some(9.0)).unwrap();
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-07"), Some(8.5)).unwrap();
        store.upsert("BOOKING", "Hotel Beta", d("2025-09-14"), None).unwrap();

        let text = fs::read_to_string(dir.path().join("booking_scores.csv")).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "Hotel;Average Score;2025-09-07;2025-09-14");
        assert_eq!(lines[1], "Hotel Alpha;8.75;8.5;9");
        assert_eq!(lines[2], "Hotel Beta;;;");
        assert_eq!(store.sites().unwrap(), vec!["BOOKING"]);
    }

    #[test]
    fn csv_upsert_twice_leaves_identical_file() {
        let dir = tempdir().unwrap();
        let mut store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-07"), Some(8.7)).unwrap();
        let first = fs::read(store.table_path("BOOKING")).unwrap();
        store.upsert("BOOKING", "Hotel Alpha", d("2025-09-07"), Some(8.7)).unwrap();
        let second = fs::read(store.table_path("BOOKING")).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.rows("BOOKING").unwrap().len(), 1);
    }

    #[test]
    fn unscored_upsert_keeps_stored_score() {
        let dir = tempdir().unwrap();
        let mut store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        store.upsert("TRIPADVISOR", "Hotel Alpha", d("2025-09-07"), Some(4.5)).unwrap();
        let first = fs::read_to_string(store.table_path("TRIPADVISOR")).unwrap();
        store.upsert("TRIPADVISOR", "Hotel Alpha", d("2025-09-07"), None).unwrap();

        assert_eq!(fs::read_to_string(store.table_path("TRIPADVISOR")).unwrap(), first);
        assert_eq!(store.rows("TRIPADVISOR").unwrap()[0].score, Some(4.5));

        let mut memory = MemoryTableStore::new();
        memory.upsert("TRIPADVISOR", "Hotel Alpha", d("2025-09-07"), Some(4.5)).unwrap();
        memory.upsert("TRIPADVISOR", "Hotel Alpha", d("2025-09-07"), None).unwrap();
        memory.upsert("TRIPADVISOR", "Hotel Beta", d("2025-09-07"), None).unwrap();
        let rows = memory.rows("TRIPADVISOR").unwrap();
        assert_eq!(rows[0].score, Some(4.5));
        assert_eq!(rows[1].score, None);
    }

    #[test]
    fn csv_upsert_rows_writes_whole_batch() {
        let dir = tempdir().unwrap();
        let mut store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        let rows = vec![
            TableRow {
                hotel: "Hotel Alpha".into(),
                run_date: d("2025-09-07"),
                score: Some(8.4),
            },
            TableRow {
                hotel: "Hotel Beta".into(),
                run_date: d("2025-09-07"),
                score: None,
            },
        ];
        store.upsert_rows("EXPEDIA", &rows).unwrap();
        assert_eq!(
            fs::read_to_string(store.table_path("EXPEDIA")).unwrap(),
            "Hotel;Average Score;2025-09-07\nHotel Alpha;8.4;8.4\nHotel Beta;;\n"
        );
        assert_eq!(store.rows("EXPEDIA").unwrap(), rows);
    }

    #[test]
    fn csv_store_keeps_unknown_columns_and_old_dates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("google_scores.csv");
        fs::write(&path, "Hotel;Region;Average Score;2025-09-07\nHotel Alpha;Algarve;4.5;4.5\n").unwrap();

        let mut store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        assert_eq!(
            store.schema("GOOGLE").unwrap(),
            Some(TableSchema::new(["Hotel", "Region", "Average Score"]))
        );
        store.upsert("GOOGLE", "Hotel Alpha", d("2025-09-14"), Some(4.7)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "Hotel;Region;Average Score;2025-09-07;2025-09-14");
        assert_eq!(lines[1], "Hotel Alpha;Algarve;4.6;4.5;4.7");
    }

    #[test]
    fn check_reports_missing_table() {
        let dir = tempdir().unwrap();
        let store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        assert_eq!(store.check("BOOKING", d("2026-02-13")).unwrap(), TableCheck::default());
    }

    #[test]
    fn check_detects_missing_date_column() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("booking_scores.csv"),
            "Hotel;Average Score;2026-02-12\nA;4.5;4.5\nB;4.0;4.0\n",
        )
        .unwrap();
        let store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        let check = store.check("BOOKING", d("2026-02-13")).unwrap();
        assert_eq!(
            check,
            TableCheck {
                exists: true,
                has_date: false,
                scored: 0,
                total: 2
            }
        );
    }

    #[test]
    fn check_counts_scored_rows() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("booking_scores.csv"),
            "Hotel;Average Score;2026-02-13\nA;4.5;4.5\nB;4.0;\nC;3.8;3.8\n",
        )
        .unwrap();
        let store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        let check = store.check("BOOKING", d("2026-02-13")).unwrap();
        assert_eq!(
            check,
            TableCheck {
                exists: true,
                has_date: true,
                scored: 2,
                total: 3
            }
        );
    }

    #[test]
    fn header_without_hotel_column_is_malformed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("booking_scores.csv"), "Name;2026-02-13\nA;4.5\n").unwrap();
        let store = CsvTableStore::new(dir.path(), CsvTableOptions::default());
        assert!(matches!(
            store.rows("BOOKING"),
            Err(StoreError::Malformed { .. })
        ));
    }

    #[test]
    fn tampered_snapshot_is_rejected() {
        let dir = tempdir().unwrap();
        let date = d("2025-09-07");
        let mut staging = MemoryTableStore::new();
        staging.upsert("EXPEDIA", "Hotel Alpha", date, Some(8.6)).unwrap();
        let summary = RunSummary::new(
            date,
            [("EXPEDIA".to_string(), SiteRunStatus::ok(1, vec![]))].into(),
        );
        let snapshot = BatchSnapshot::from_store(summary, &staging, Utc::now());

        let path = dir.path().join("batch.json");
        snapshot.write(&path).unwrap();
        let loaded = BatchSnapshot::load(&path).unwrap();
        assert_eq!(loaded.tables, snapshot.tables);
        assert_eq!(loaded.batch_id, snapshot.batch_id);

        let text = fs::read_to_string(&path).unwrap().replace("8.6", "9.9");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            BatchSnapshot::load(&path),
            Err(StoreError::ChecksumMismatch { .. })
        ));
    }
}
