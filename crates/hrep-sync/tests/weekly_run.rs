use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use hrep_core::{OverallStatus, SiteStatus};
use hrep_storage::BatchSnapshot;
use hrep_sync::{to_ci_annotations, RunRequest, SyncConfig, SyncPipeline};
use tempfile::tempdir;

const CONFIG: &str = r#"
table:
  separator: ";"
  columns: [Hotel, Average Score]
sites:
  - site_id: booking
    collector: { mode: fixture }
  - site_id: tripadvisor
    collector: { mode: fixture }
  - site_id: expedia
    collector: { mode: fixture }
hotels:
  - name: Hotel Alpha
  - name: Hotel Beta
"#;

fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 9, 7).unwrap()
}

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn workspace(root: &Path) {
    write(&root.join("config/hotels.yaml"), CONFIG);
    write(
        &root.join("fixtures/BOOKING/2025-09-07.json"),
        r#"[
            {"hotel": "Hotel Alpha", "date": "2025-09-07", "score": 8.7},
            {"hotel": "Hotel Beta", "date": "2025-09-07", "score": 8.2}
        ]"#,
    );
    write(&root.join("fixtures/TRIPADVISOR/latest.json"), "[]");
}

#[tokio::test]
async fn weekly_run_persists_wide_tables_and_reports_failures() {
    let dir = tempdir().unwrap();
    workspace(dir.path());
    let pipeline = SyncPipeline::load(SyncConfig::rooted_at(dir.path())).await.unwrap();

    let summary = pipeline.run_weekly(&RunRequest::for_date(run_date())).await.unwrap();
    assert_eq!(summary.site("BOOKING").unwrap().status, SiteStatus::Ok);
    assert_eq!(summary.site("BOOKING").unwrap().row_count, 2);
    assert_eq!(summary.site("TRIPADVISOR").unwrap().status, SiteStatus::OkEmpty);
    assert_eq!(summary.site("TRIPADVISOR").unwrap().warnings, vec!["no rows".to_string()]);
    assert_eq!(summary.site("EXPEDIA").unwrap().status, SiteStatus::Failed);
    assert_eq!(summary.overall_status(), OverallStatus::Failed);
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(to_ci_annotations(&summary).len(), 2);

    let table_path = dir.path().join("data/booking_scores.csv");
    let first = fs::read_to_string(&table_path).unwrap();
    assert_eq!(
        first,
        "Hotel;Average Score;2025-09-07\nHotel Alpha;8.7;8.7\nHotel Beta;8.2;8.2\n"
    );
    assert!(!dir.path().join("data/expedia_scores.csv").exists());

    pipeline.run_weekly(&RunRequest::for_date(run_date())).await.unwrap();
    assert_eq!(fs::read_to_string(&table_path).unwrap(), first);
}

#[tokio::test]
async fn restricted_site_batch_is_merged_into_main_run() {
    let dir = tempdir().unwrap();
    workspace(dir.path());
    write(
        &dir.path().join("fixtures/EXPEDIA/latest.json"),
        r#"{"site": "EXPEDIA", "rows": [{"hotel": "Hotel Alpha", "score": 8.4}]}"#,
    );
    let pipeline = SyncPipeline::load(SyncConfig::rooted_at(dir.path())).await.unwrap();

    let restricted = pipeline
        .run_to_batch(Some(&["expedia".to_string()]), run_date())
        .await
        .unwrap();
    assert_eq!(restricted.summary.sites().len(), 1);
    let batch_path = dir.path().join("batches/expedia.json");
    restricted.write(&batch_path).unwrap();
    assert!(!dir.path().join("data/expedia_scores.csv").exists());

    let request = RunRequest {
        sites: Some(vec!["BOOKING".to_string(), "TRIPADVISOR".to_string()]),
        run_date: run_date(),
        merge: vec![batch_path.clone()],
    };
    let summary = pipeline.run_weekly(&request).await.unwrap();
    assert_eq!(summary.sites().len(), 3);
    assert_eq!(summary.site("EXPEDIA").unwrap().status, SiteStatus::Ok);
    assert_eq!(summary.overall_status(), OverallStatus::Warn);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("data/expedia_scores.csv")).unwrap(),
        "Hotel;Average Score;2025-09-07\nHotel Alpha;8.4;8.4\n"
    );

    let verified = pipeline.verify(run_date()).unwrap();
    assert_eq!(verified.site("BOOKING").unwrap().status, SiteStatus::Ok);
    assert_eq!(verified.site("EXPEDIA").unwrap().status, SiteStatus::Ok);
    assert!(verified.site("EXPEDIA").unwrap().warnings.is_empty());
    assert_eq!(verified.site("TRIPADVISOR").unwrap().status, SiteStatus::Failed);

    let stale = pipeline
        .verify(NaiveDate::from_ymd_opt(2025, 9, 14).unwrap())
        .unwrap();
    assert_eq!(stale.overall_status(), OverallStatus::Failed);
}

#[tokio::test]
async fn tampered_batch_aborts_the_merge() {
    let dir = tempdir().unwrap();
    workspace(dir.path());
    let pipeline = SyncPipeline::load(SyncConfig::rooted_at(dir.path())).await.unwrap();

    let batch = pipeline
        .run_to_batch(Some(&["BOOKING".to_string()]), run_date())
        .await
        .unwrap();
    let batch_path = dir.path().join("booking.json");
    batch.write(&batch_path).unwrap();
    let text = fs::read_to_string(&batch_path).unwrap().replace("8.7", "9.7");
    fs::write(&batch_path, text).unwrap();

    assert!(BatchSnapshot::load(&batch_path).is_err());
    let request = RunRequest {
        sites: Some(vec!["TRIPADVISOR".to_string()]),
        run_date: run_date(),
        merge: vec![batch_path],
    };
    let err = pipeline.run_weekly(&request).await.unwrap_err();
    assert!(format!("{err:#}").contains("checksum"));
    assert!(!dir.path().join("data/booking_scores.csv").exists());
}
