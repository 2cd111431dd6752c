//! Lab-feed ingestion (source A).
//!
//! The external transfer job drops pipe-delimited result files into a local
//! directory; this module decodes each row into a [`Sample`] and hands the
//! batch to the reconciliation engine. A malformed row is fatal to that row
//! only: it is logged and skipped, never allowed to sink the file.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{computing_id_from_email, synthesize_barcode, Sample};
use crate::{reconcile, store};

/// Field separator used by the lab feed.
const FEED_DELIMITER: u8 = b'|';

/// Timestamp layout used by the feed, e.g. `202010050930`.
const FEED_DATE_FORMAT: &str = "%Y%m%d%H%M";

// Column names as they appear in the feed header.
const COL_STUDENT_ID: &str = "Student ID";
const COL_PHONE: &str = "Student Cellphone";
const COL_EMAIL: &str = "Student Email";
const COL_DATE: &str = "Test Date Time";
const COL_LOCATION: &str = "Test Kiosk Loc";
const COL_RESULT: &str = "Test Result Code";
// Optional columns; older feed versions do not carry them.
const COL_STATION: &str = "Test Kiosk Station";
const COL_BARCODE: &str = "Result Barcode";

// ---

/// Build a [`Sample`] from one decoded feed row.
///
/// All six core columns must be present (empty values are allowed for the
/// contact and result fields); a missing column yields
/// [`Error::MissingColumn`] naming it. When the feed supplies no barcode,
/// one is synthesized from student id, timestamp, and location.
pub fn sample_from_feed_row(
    row: &HashMap<String, String>,
    file_name: Option<&str>,
) -> Result<Sample> {
    // ---
    let student_id = required(row, COL_STUDENT_ID)?.to_string();
    let date_raw = required(row, COL_DATE)?;
    let phone = optional_value(required(row, COL_PHONE)?);
    let email = optional_value(required(row, COL_EMAIL)?);
    let location_raw = required(row, COL_LOCATION)?;
    let result_code = optional_value(required(row, COL_RESULT)?);

    let naive = NaiveDateTime::parse_from_str(date_raw, FEED_DATE_FORMAT).map_err(|e| {
        Error::InvalidColumn {
            column: COL_DATE.to_string(),
            detail: format!("{date_raw:?}: {e}"),
        }
    })?;
    let location = parse_site_code(COL_LOCATION, location_raw)?;
    let station = match row.get(COL_STATION).map(String::as_str) {
        Some(raw) if !raw.trim().is_empty() => parse_site_code(COL_STATION, raw)?,
        _ => 0,
    };

    let barcode = match row.get(COL_BARCODE).map(|b| b.trim()) {
        Some(b) if !b.is_empty() => b.to_string(),
        _ => synthesize_barcode(&student_id, naive, location),
    };

    let mut sample = Sample::new(&barcode, &student_id, Utc.from_utc_datetime(&naive), location);
    sample.station = station;
    sample.computing_id = email.as_deref().and_then(computing_id_from_email);
    sample.phone = phone;
    sample.email = email;
    sample.result_code = result_code;
    sample.ivy_file = file_name.map(str::to_string);
    sample.from_feed = true;
    Ok(sample)
}

fn required<'a>(row: &'a HashMap<String, String>, column: &str) -> Result<&'a str> {
    row.get(column)
        .map(String::as_str)
        .ok_or_else(|| Error::MissingColumn(column.to_string()))
}

fn optional_value(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_site_code(column: &str, raw: &str) -> Result<i64> {
    raw.trim().parse::<i64>().map_err(|e| Error::InvalidColumn {
        column: column.to_string(),
        detail: format!("{raw:?}: {e}"),
    })
}

// ---

/// Decode one feed file into samples, skipping (and logging) bad rows.
pub fn samples_from_feed_file(path: &Path) -> Result<Vec<Sample>> {
    // ---
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(FEED_DELIMITER)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut samples = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row: HashMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        match sample_from_feed_row(&row, Some(&file_name)) {
            Ok(sample) => samples.push(sample),
            Err(e) => {
                warn!("Skipping row {} of {}: {}", index + 2, file_name, e);
            }
        }
    }
    Ok(samples)
}

/// Import every feed file sitting in the drop directory.
///
/// Each new file is decoded, reconciled into the store, and recorded in the
/// `ivy_file` batch table; files already recorded there are skipped, so a
/// file left sitting in the directory is processed exactly once. A file that
/// fails outright is logged and skipped so one bad drop cannot stall the
/// rest of the feed. Returns the number of records reconciled.
pub async fn import_feed_directory(
    pool: &SqlitePool,
    dir: &Path,
    now: DateTime<Utc>,
) -> Result<usize> {
    // ---
    let processed: HashSet<String> = store::processed_feed_files(pool).await?.into_iter().collect();

    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut total = 0;
    for path in paths {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if processed.contains(&file_name) {
            continue;
        }

        let samples = match samples_from_feed_file(&path) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Could not read feed file {}: {}", file_name, e);
                continue;
            }
        };

        let count = samples.len();
        reconcile::add_or_update_records(pool, &samples, now).await?;
        store::upsert_ivy_file(pool, &file_name, count as i64, now).await?;
        info!("Imported {} records from {}", count, file_name);
        total += count;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::io::Write;

    const HEADER: &str =
        "Student ID|Student Cellphone|Student Email|Test Date Time|Test Kiosk Loc|Test Result Code";

    fn row(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_row() -> HashMap<String, String> {
        row(&[
            (COL_STUDENT_ID, "987654321"),
            (COL_PHONE, "555-555-1212"),
            (COL_EMAIL, "dhf8r@virginia.edu"),
            (COL_DATE, "202010050930"),
            (COL_LOCATION, "50"),
            (COL_RESULT, "1142270225"),
        ])
    }

    #[test]
    fn test_row_maps_to_sample() {
        // ---
        let sample = sample_from_feed_row(&full_row(), Some("results-1005.csv")).unwrap();
        assert_eq!(sample.barcode, "987654321-202010050930-0050");
        assert_eq!(sample.student_id, "987654321");
        assert_eq!(sample.phone.as_deref(), Some("555-555-1212"));
        assert_eq!(sample.email.as_deref(), Some("dhf8r@virginia.edu"));
        assert_eq!(sample.computing_id.as_deref(), Some("dhf8r"));
        assert_eq!(sample.result_code.as_deref(), Some("1142270225"));
        assert_eq!(sample.location, 50);
        assert_eq!(sample.station, 0);
        assert_eq!(sample.ivy_file.as_deref(), Some("results-1005.csv"));
        assert!(sample.from_feed);
        assert!(!sample.from_kiosk);

        use chrono::Timelike;
        assert_eq!(sample.date.hour(), 9);
        assert_eq!(sample.date.minute(), 30);
    }

    #[test]
    fn test_explicit_barcode_wins_over_synthesis() {
        // ---
        let mut data = full_row();
        data.insert(COL_BARCODE.to_string(), "987654321-AAA-202010050930-0050".to_string());
        data.insert(COL_STATION.to_string(), "30".to_string());
        let sample = sample_from_feed_row(&data, None).unwrap();
        assert_eq!(sample.barcode, "987654321-AAA-202010050930-0050");
        assert_eq!(sample.station, 30);
        assert!(sample.ivy_file.is_none());
    }

    #[test]
    fn test_missing_column_is_named() {
        // ---
        let mut data = full_row();
        data.remove(COL_EMAIL);
        let err = sample_from_feed_row(&data, None).unwrap_err();
        match err {
            Error::MissingColumn(column) => assert_eq!(column, COL_EMAIL),
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn test_unparseable_date_is_rejected() {
        // ---
        let mut data = full_row();
        data.insert(COL_DATE.to_string(), "10/05/2020 09:30".to_string());
        let err = sample_from_feed_row(&data, None).unwrap_err();
        match err {
            Error::InvalidColumn { column, .. } => assert_eq!(column, COL_DATE),
            other => panic!("expected InvalidColumn, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_optional_fields_become_none() {
        // ---
        let mut data = full_row();
        data.insert(COL_PHONE.to_string(), "  ".to_string());
        data.insert(COL_RESULT.to_string(), String::new());
        let sample = sample_from_feed_row(&data, None).unwrap();
        assert!(sample.phone.is_none());
        assert!(sample.result_code.is_none(), "no result yet means pending");
    }

    #[test]
    fn test_feed_file_skips_bad_rows() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results-1005.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{HEADER}").unwrap();
        writeln!(
            file,
            "987654321|555-555-1212|dhf8r@virginia.edu|202010050930|50|1142270225"
        )
        .unwrap();
        // Bad timestamp; the row should be skipped, not the file
        writeln!(file, "111222333|||bogus|50|").unwrap();
        writeln!(file, "444555666||other@virginia.edu|202010051100|40|").unwrap();

        let samples = samples_from_feed_file(&path).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].student_id, "987654321");
        assert_eq!(samples[1].location, 40);
    }

    #[tokio::test]
    async fn test_import_feed_directory_records_batches() {
        // ---
        let pool = crate::store::tests::test_pool().await;
        let dir = tempfile::tempdir().unwrap();

        let mut file = std::fs::File::create(dir.path().join("day1.csv")).unwrap();
        writeln!(file, "{HEADER}").unwrap();
        writeln!(
            file,
            "987654321|555-555-1212|dhf8r@virginia.edu|202010050930|50|1142270225"
        )
        .unwrap();
        writeln!(file, "111111111||one@virginia.edu|202010051000|50|").unwrap();

        let now = chrono::Utc::now();
        let total = import_feed_directory(&pool, dir.path(), now).await.unwrap();
        assert_eq!(total, 2);

        let stored = store::fetch_sample(&pool, "987654321-202010050930-0050")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ivy_file.as_deref(), Some("day1.csv"));
        assert!(stored.from_feed);

        let files = sqlx::query_as::<_, crate::models::IvyFile>("SELECT * FROM ivy_file")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "day1.csv");
        assert_eq!(files[0].sample_count, 2);

        // The file is still in the directory but is not processed again
        let again = import_feed_directory(&pool, dir.path(), now).await.unwrap();
        assert_eq!(again, 0);
    }
}
