//! Scheduled pipeline pass.
//!
//! One pass imports any waiting feed files, then runs the email and SMS
//! notification passes. Each step logs its own failure and lets the later
//! steps run; feed trouble must never silence notifications for records
//! already in the store.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::config::Config;
use crate::notify::{self, Notifier, PassSummary};
use crate::{ingest, reconcile};

/// Outcome of one scheduled pass, for the caller's log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassReport {
    /// Feed records reconciled this pass.
    pub imported: usize,
    /// Contact-less records merged into counterparts this pass.
    pub merged: usize,
    pub email: PassSummary,
    pub sms: PassSummary,
}

// ---

/// Run one full update-and-notify pass.
///
/// The caller supplies `now` so the whole pass shares a single timestamp;
/// the scheduler passes the wall clock, tests pass fixed instants.
pub async fn update_and_notify(
    pool: &SqlitePool,
    cfg: &Config,
    notifier: &dyn Notifier,
    now: DateTime<Utc>,
) -> PassReport {
    // ---
    let mut report = PassReport::default();

    if cfg.feed_import_dir.is_empty() {
        info!("No feed import directory configured; skipping import");
    } else {
        match ingest::import_feed_directory(pool, Path::new(&cfg.feed_import_dir), now).await {
            Ok(count) => report.imported = count,
            Err(e) => error!("Feed import failed: {}", e),
        }
    }

    // The sweep covers records however they arrived, so it runs even when
    // no feed directory is configured
    match reconcile::merge_similar_records(pool, now).await {
        Ok(merged) => report.merged = merged,
        Err(e) => error!("Record merge sweep failed: {}", e),
    }

    match notify::notify_by_email(pool, notifier, cfg, None, false, now).await {
        Ok(summary) => report.email = summary,
        Err(e) => error!("Email pass failed: {}", e),
    }
    match notify::notify_by_text(pool, notifier, cfg, None, false, now).await {
        Ok(summary) => report.sms = summary,
        Err(e) => error!("SMS pass failed: {}", e),
    }

    info!(
        "Pass complete: {} imported, {} merged, email {}/{} sent/failed, sms {}/{} sent/failed",
        report.imported,
        report.merged,
        report.email.sent,
        report.email.failed,
        report.sms.sent,
        report.sms.failed
    );
    report
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::tests::test_config;
    use crate::error::SendError;
    use crate::models::Sample;
    use crate::store::{self, tests::test_pool};
    use chrono::TimeZone;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        emails: AtomicUsize,
        texts: AtomicUsize,
    }

    impl CountingNotifier {
        fn new() -> Self {
            Self {
                emails: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            }
        }
    }

    impl Notifier for CountingNotifier {
        fn send_email(
            &self,
            _to: &str,
            _subject: &str,
            _body: &str,
        ) -> std::result::Result<(), SendError> {
            self.emails.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn send_sms(&self, _to: &str, _body: &str) -> std::result::Result<(), SendError> {
            self.texts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pass_imports_then_notifies() {
        // ---
        let pool = test_pool().await;
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("day1.csv")).unwrap();
        writeln!(
            file,
            "Student ID|Student Cellphone|Student Email|Test Date Time|Test Kiosk Loc|Test Result Code"
        )
        .unwrap();
        writeln!(
            file,
            "987654321|434-555-0199|dhf8r@virginia.edu|202010050930|50|1142270225"
        )
        .unwrap();

        let mut cfg = test_config();
        cfg.feed_import_dir = dir.path().to_string_lossy().into_owned();
        let notifier = CountingNotifier::new();

        // 15:00 UTC is inside the SMS window at UTC-5
        let now = Utc.with_ymd_and_hms(2020, 10, 6, 15, 0, 0).unwrap();
        let report = update_and_notify(&pool, &cfg, &notifier, now).await;

        assert_eq!(report.imported, 1);
        assert_eq!(report.email.sent, 1);
        assert_eq!(report.sms.sent, 1);
        assert_eq!(notifier.emails.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.texts.load(Ordering::SeqCst), 1);

        let stored = store::fetch_sample(&pool, "987654321-202010050930-0050")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.email_notified);
        assert!(stored.text_notified);

        // A second pass finds nothing left to do
        let again = update_and_notify(&pool, &cfg, &notifier, now).await;
        assert_eq!(again.email.sent, 0);
        assert_eq!(again.sms.sent, 0);
    }

    #[tokio::test]
    async fn test_sweep_runs_without_import_dir() {
        // ---
        let pool = test_pool().await;
        let event_time = Utc.with_ymd_and_hms(2020, 10, 5, 9, 30, 0).unwrap();

        // A kiosk record and its contact-bearing twin, loaded before any
        // feed directory was configured
        let mut orphan = Sample::new("k-1", "987654321", event_time, 50);
        orphan.from_kiosk = true;
        store::insert_sample(&pool, &orphan).await.unwrap();

        let mut twin = Sample::new("f-1", "987654321", event_time, 50);
        twin.phone = Some("434-555-0199".to_string());
        twin.email = Some("dhf8r@virginia.edu".to_string());
        twin.result_code = Some("1142270225".to_string());
        twin.from_feed = true;
        store::insert_sample(&pool, &twin).await.unwrap();

        let cfg = test_config();
        assert!(cfg.feed_import_dir.is_empty());
        let notifier = CountingNotifier::new();
        let now = Utc.with_ymd_and_hms(2020, 10, 6, 15, 0, 0).unwrap();

        let report = update_and_notify(&pool, &cfg, &notifier, now).await;
        assert_eq!(report.merged, 1, "the sweep does not depend on feed import");

        let merged = store::fetch_sample(&pool, "k-1").await.unwrap().unwrap();
        assert_eq!(merged.email.as_deref(), Some("dhf8r@virginia.edu"));
        assert!(store::fetch_sample(&pool, "f-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notification_runs_without_import_dir() {
        // ---
        let pool = test_pool().await;
        let mut sample = Sample::new(
            "bc-1",
            "987654321",
            Utc.with_ymd_and_hms(2020, 10, 5, 9, 30, 0).unwrap(),
            50,
        );
        sample.email = Some("dhf8r@virginia.edu".to_string());
        sample.result_code = Some("1142270225".to_string());
        store::insert_sample(&pool, &sample).await.unwrap();

        let cfg = test_config();
        let notifier = CountingNotifier::new();
        let now = Utc.with_ymd_and_hms(2020, 10, 6, 15, 0, 0).unwrap();
        let report = update_and_notify(&pool, &cfg, &notifier, now).await;

        assert_eq!(report.imported, 0);
        assert_eq!(report.email.sent, 1);
        // No phone on record: the SMS pass records a failure and moves on
        assert_eq!(report.sms.failed, 1);
    }
}
