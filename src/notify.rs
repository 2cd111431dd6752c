//! Notification state tracking and outbound send passes.
//!
//! The store records every send attempt per record and channel; a record is
//! "pending" while it has a result but no successful delivery on that
//! channel. Passes are deliberately sequential: the inter-send delay plus
//! one-at-a-time processing is the throttling mechanism for the upstream
//! mail and SMS providers.
//!
//! Transport mechanics live behind the [`Notifier`] trait; this module only
//! decides whether and to whom to send, and how to classify failures.

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SendError};
use crate::models::{Channel, Sample};
use crate::store;

/// Subject line for result notification emails.
const EMAIL_SUBJECT: &str = "BE SAFE Notification";

// ---

/// Outbound transport boundary. Implementations may fail with
/// provider-specific errors, which the passes classify via
/// [`SendError::aborts_pass`].
pub trait Notifier: Send + Sync {
    fn send_email(&self, to: &str, subject: &str, body: &str) -> std::result::Result<(), SendError>;
    fn send_sms(&self, to: &str, body: &str) -> std::result::Result<(), SendError>;
}

/// Logs outbound messages instead of delivering them. Used until a real
/// transport is wired into the deployment, and for local development.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_email(&self, to: &str, subject: &str, _body: &str) -> std::result::Result<(), SendError> {
        info!("EMAIL to {}: {}", to, subject);
        Ok(())
    }

    fn send_sms(&self, to: &str, _body: &str) -> std::result::Result<(), SendError> {
        info!("SMS to {}", to);
        Ok(())
    }
}

/// Outcome counts for one notification pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Successful sends recorded this pass.
    pub sent: usize,
    /// Per-record failures recorded this pass.
    pub failed: usize,
    /// True when a hard transport failure cut the pass short.
    pub aborted: bool,
}

// ---

fn sent_flag_column(channel: Channel) -> &'static str {
    match channel {
        Channel::Email => "email_notified",
        Channel::Text => "text_notified",
    }
}

/// Records awaiting delivery on a channel: result present, sent flag still
/// false, optionally restricted to one import batch.
///
/// A record whose most recent attempt on the channel failed is skipped
/// unless `retry` is set, so a permanently-bad address cannot hot-loop;
/// manual retry sweeps pass `retry = true`.
pub async fn pending_samples(
    pool: &SqlitePool,
    channel: Channel,
    batch: Option<&str>,
    retry: bool,
) -> Result<Vec<Sample>> {
    // ---
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM sample WHERE result_code IS NOT NULL AND ");
    qb.push(sent_flag_column(channel));
    qb.push(" = FALSE");
    if let Some(batch) = batch {
        qb.push(" AND ivy_file = ");
        qb.push_bind(batch.to_string());
    }
    qb.push(" ORDER BY rowid");
    let candidates = qb.build_query_as::<Sample>().fetch_all(pool).await?;

    let mut pending = Vec::new();
    for sample in candidates {
        if !retry {
            let last = store::last_attempt(pool, &sample.barcode, channel).await?;
            if last.is_some_and(|attempt| !attempt.successful) {
                continue;
            }
        }
        pending.push(sample);
    }
    Ok(pending)
}

/// Append an attempt and, on success, flip the channel's sent flag. Both
/// writes commit together and immediately, so a crash mid-pass leaves every
/// already-processed record correctly settled.
pub async fn record_attempt(
    pool: &SqlitePool,
    barcode: &str,
    channel: Channel,
    successful: bool,
    error_message: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;
    store::insert_attempt(&mut *tx, barcode, channel, now, successful, error_message).await?;
    if successful {
        let sql = format!(
            "UPDATE sample SET {} = TRUE, last_modified = $2 WHERE barcode = $1",
            sent_flag_column(channel)
        );
        sqlx::query(&sql)
            .bind(barcode)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

// ---

/// Send result emails to every pending record, up to the per-pass cap.
///
/// Failure classification: a disconnect or provider rate-limit aborts the
/// remainder of the pass with nothing recorded for the triggering record
/// (it stays pending and is retried automatically next pass); any other
/// error is recorded as a failed attempt and the pass moves on.
pub async fn notify_by_email(
    pool: &SqlitePool,
    notifier: &dyn Notifier,
    cfg: &Config,
    batch: Option<&str>,
    retry: bool,
    now: DateTime<Utc>,
) -> Result<PassSummary> {
    // ---
    let pending = pending_samples(pool, Channel::Email, batch, retry).await?;
    info!("Email pass: {} pending record(s)", pending.len());

    let mut summary = PassSummary::default();
    for sample in pending {
        if summary.sent + summary.failed >= cfg.email_send_cap as usize {
            info!(
                "Email send cap of {} reached; remaining records wait for the next pass",
                cfg.email_send_cap
            );
            break;
        }

        let Some(email) = sample.email.as_deref().map(str::trim).filter(|e| !e.is_empty())
        else {
            record_attempt(
                pool,
                &sample.barcode,
                Channel::Email,
                false,
                Some("no email address on record"),
                now,
            )
            .await?;
            summary.failed += 1;
            continue;
        };

        let body = email_body(cfg, &sample);
        match notifier.send_email(email, EMAIL_SUBJECT, &body) {
            Ok(()) => {
                record_attempt(pool, &sample.barcode, Channel::Email, true, None, now).await?;
                summary.sent += 1;
            }
            Err(e) if e.aborts_pass() => {
                warn!("Email pass aborted after {} send(s): {}", summary.sent, e);
                summary.aborted = true;
                break;
            }
            Err(e) => {
                warn!("Email to {} failed: {}", sample.barcode, e);
                record_attempt(
                    pool,
                    &sample.barcode,
                    Channel::Email,
                    false,
                    Some(&e.to_string()),
                    now,
                )
                .await?;
                summary.failed += 1;
            }
        }

        sleep(Duration::from_millis(cfg.send_delay_ms)).await;
    }
    Ok(summary)
}

/// Send result texts to every pending record, but only at a reasonable
/// local hour. Outside the window the pass is a pure no-op: nothing sent,
/// nothing recorded.
pub async fn notify_by_text(
    pool: &SqlitePool,
    notifier: &dyn Notifier,
    cfg: &Config,
    batch: Option<&str>,
    retry: bool,
    now: DateTime<Utc>,
) -> Result<PassSummary> {
    // ---
    if !within_sms_window(cfg, now) {
        info!("Skipping SMS pass; outside the {:02}:00-{:02}:00 window",
            cfg.sms_window_start_hour, cfg.sms_window_end_hour);
        return Ok(PassSummary::default());
    }

    let pending = pending_samples(pool, Channel::Text, batch, retry).await?;
    info!("SMS pass: {} pending record(s)", pending.len());

    let mut summary = PassSummary::default();
    for sample in pending {
        let phone = sample
            .phone
            .as_deref()
            .ok_or_else(|| SendError::InvalidRecipient("no phone number on record".to_string()))
            .and_then(normalize_us_phone);

        let outcome = phone.and_then(|number| {
            notifier
                .send_sms(&number, &sms_body(cfg, &sample))
                .map(|()| number)
        });

        match outcome {
            Ok(_) => {
                record_attempt(pool, &sample.barcode, Channel::Text, true, None, now).await?;
                summary.sent += 1;
            }
            Err(e) if e.aborts_pass() => {
                warn!("SMS pass aborted after {} send(s): {}", summary.sent, e);
                summary.aborted = true;
                break;
            }
            Err(e) => {
                warn!("SMS to {} failed: {}", sample.barcode, e);
                record_attempt(
                    pool,
                    &sample.barcode,
                    Channel::Text,
                    false,
                    Some(&e.to_string()),
                    now,
                )
                .await?;
                summary.failed += 1;
            }
        }

        sleep(Duration::from_millis(cfg.send_delay_ms)).await;
    }
    Ok(summary)
}

/// Where "reasonable" is between the configured window hours in the fixed
/// reference timezone.
pub fn within_sms_window(cfg: &Config, now: DateTime<Utc>) -> bool {
    // ---
    let offset = FixedOffset::east_opt(cfg.local_tz_offset_hours * 3600)
        .unwrap_or_else(|| Utc.fix());
    let local_hour = now.with_timezone(&offset).hour();
    local_hour >= cfg.sms_window_start_hour && local_hour < cfg.sms_window_end_hour
}

// ---

/// Link a student follows to view their result.
fn result_link(cfg: &Config, sample: &Sample) -> String {
    format!(
        "{}?code={}",
        cfg.result_url_base,
        sample.result_code.as_deref().unwrap_or_default()
    )
}

/// Addressee name: the email local part when we have one, else a generic
/// salutation.
fn display_name(sample: &Sample) -> String {
    sample
        .email
        .as_deref()
        .and_then(|e| e.split('@').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "Student".to_string())
}

fn email_body(cfg: &Config, sample: &Sample) -> String {
    format!(
        "Dear {},\n\nYou have an important notification about your recent test.\n\
         Please visit: {}\n",
        display_name(sample),
        result_link(cfg, sample)
    )
}

fn sms_body(cfg: &Config, sample: &Sample) -> String {
    format!(
        "Dear {}, You have an important notification, please visit: {}. \
         Reply 'STOP' to opt-out.",
        display_name(sample),
        result_link(cfg, sample)
    )
}

/// Normalize a US phone number to E.164, rejecting anything that is not
/// ten digits (or eleven with a leading 1).
fn normalize_us_phone(raw: &str) -> std::result::Result<String, SendError> {
    // ---
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    match digits.len() {
        10 => Ok(format!("+1{digits}")),
        11 if digits.starts_with('1') => Ok(format!("+{digits}")),
        _ => Err(SendError::InvalidRecipient(format!(
            "invalid phone number: {raw}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::tests::test_config;
    use crate::store::tests::test_pool;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Behavior {
        Fail,
        Disconnect,
        RateLimit,
    }

    /// Scriptable transport double: records every send, fails on command.
    #[derive(Default)]
    struct MockNotifier {
        emails: Mutex<Vec<String>>,
        texts: Mutex<Vec<String>>,
        scripted: Mutex<HashMap<String, Behavior>>,
    }

    impl MockNotifier {
        fn script(&self, recipient: &str, behavior: Behavior) {
            self.scripted
                .lock()
                .unwrap()
                .insert(recipient.to_string(), behavior);
        }

        fn check(&self, to: &str) -> std::result::Result<(), SendError> {
            match self.scripted.lock().unwrap().get(to) {
                Some(Behavior::Fail) => Err(SendError::Other("mailbox unavailable".to_string())),
                Some(Behavior::Disconnect) => {
                    Err(SendError::Disconnected("connection reset".to_string()))
                }
                Some(Behavior::RateLimit) => {
                    Err(SendError::RateLimited("454 slow down".to_string()))
                }
                None => Ok(()),
            }
        }
    }

    impl Notifier for MockNotifier {
        fn send_email(
            &self,
            to: &str,
            _subject: &str,
            _body: &str,
        ) -> std::result::Result<(), SendError> {
            self.check(to)?;
            self.emails.lock().unwrap().push(to.to_string());
            Ok(())
        }

        fn send_sms(&self, to: &str, _body: &str) -> std::result::Result<(), SendError> {
            self.check(to)?;
            self.texts.lock().unwrap().push(to.to_string());
            Ok(())
        }
    }

    fn notified_sample(barcode: &str, index: u32) -> Sample {
        // ---
        let mut s = Sample::new(
            barcode,
            "987654321",
            Utc.with_ymd_and_hms(2020, 10, 5, 9, index % 60, 0).unwrap(),
            50,
        );
        s.email = Some(format!("student{index}@virginia.edu"));
        s.phone = Some("434-555-0199".to_string());
        s.result_code = Some("1142270225".to_string());
        s
    }

    async fn attempt_rows(pool: &SqlitePool, successful: bool) -> i64 {
        sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM notification WHERE successful = $1")
            .bind(successful)
            .fetch_one(pool)
            .await
            .unwrap()
            .0
    }

    fn daytime() -> DateTime<Utc> {
        // 15:00 UTC is 10:00 at UTC-5, inside the default window
        Utc.with_ymd_and_hms(2020, 10, 6, 15, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_pending_requires_result_and_unsent_flag() {
        // ---
        let pool = test_pool().await;

        let ready = notified_sample("bc-ready", 1);
        store::insert_sample(&pool, &ready).await.unwrap();

        let mut no_result = notified_sample("bc-pending-lab", 2);
        no_result.result_code = None;
        store::insert_sample(&pool, &no_result).await.unwrap();

        let mut already_sent = notified_sample("bc-done", 3);
        already_sent.email_notified = true;
        store::insert_sample(&pool, &already_sent).await.unwrap();

        let pending = pending_samples(&pool, Channel::Email, None, false)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].barcode, "bc-ready");

        // The email flag does not gate the SMS channel
        let sms_pending = pending_samples(&pool, Channel::Text, None, false)
            .await
            .unwrap();
        assert_eq!(sms_pending.len(), 2);
    }

    #[tokio::test]
    async fn test_pending_batch_filter() {
        // ---
        let pool = test_pool().await;
        let mut a = notified_sample("bc-a", 1);
        a.ivy_file = Some("day1.csv".to_string());
        let mut b = notified_sample("bc-b", 2);
        b.ivy_file = Some("day2.csv".to_string());
        store::insert_sample(&pool, &a).await.unwrap();
        store::insert_sample(&pool, &b).await.unwrap();

        let pending = pending_samples(&pool, Channel::Email, Some("day2.csv"), false)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].barcode, "bc-b");
    }

    #[tokio::test]
    async fn test_retry_suppression() {
        // ---
        let pool = test_pool().await;
        store::insert_sample(&pool, &notified_sample("bc-1", 1))
            .await
            .unwrap();

        record_attempt(&pool, "bc-1", Channel::Email, false, Some("bounced"), daytime())
            .await
            .unwrap();
        assert!(pending_samples(&pool, Channel::Email, None, false)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            pending_samples(&pool, Channel::Email, None, true)
                .await
                .unwrap()
                .len(),
            1,
            "retry sweeps see it again"
        );

        // A later success settles the record for good
        record_attempt(&pool, "bc-1", Channel::Email, true, None, daytime()).await.unwrap();
        let settled = store::fetch_sample(&pool, "bc-1").await.unwrap().unwrap();
        assert!(settled.email_notified);
        assert!(pending_samples(&pool, Channel::Email, None, true)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_email_pass_caps_sends() {
        // ---
        let pool = test_pool().await;
        for i in 0..200 {
            store::insert_sample(&pool, &notified_sample(&format!("bc-{i:03}"), i))
                .await
                .unwrap();
        }
        let cfg = test_config();
        let notifier = MockNotifier::default();

        let summary = notify_by_email(&pool, &notifier, &cfg, None, false, daytime())
            .await
            .unwrap();
        assert_eq!(summary.sent, 190);
        assert_eq!(summary.failed, 0);
        assert!(!summary.aborted);

        assert_eq!(attempt_rows(&pool, true).await, 190);
        assert_eq!(attempt_rows(&pool, false).await, 0);

        // The ten leftovers were never attempted and remain pending
        let leftovers = pending_samples(&pool, Channel::Email, None, false)
            .await
            .unwrap();
        assert_eq!(leftovers.len(), 10);
    }

    #[tokio::test]
    async fn test_email_pass_records_failure_and_continues() {
        // ---
        let pool = test_pool().await;
        for i in 1..=3 {
            store::insert_sample(&pool, &notified_sample(&format!("bc-{i}"), i))
                .await
                .unwrap();
        }
        let cfg = test_config();
        let notifier = MockNotifier::default();
        notifier.script("student2@virginia.edu", Behavior::Fail);

        let summary = notify_by_email(&pool, &notifier, &cfg, None, false, daytime())
            .await
            .unwrap();
        assert_eq!(summary.sent, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.aborted);

        let failed = store::last_attempt(&pool, "bc-2", Channel::Email)
            .await
            .unwrap()
            .unwrap();
        assert!(!failed.successful);
        assert_eq!(failed.error_message.as_deref(), Some("send failed: mailbox unavailable"));
        let record = store::fetch_sample(&pool, "bc-2").await.unwrap().unwrap();
        assert!(!record.email_notified);
        let ok = store::fetch_sample(&pool, "bc-3").await.unwrap().unwrap();
        assert!(ok.email_notified, "the pass continued past the failure");
    }

    #[tokio::test]
    async fn test_disconnect_aborts_email_pass() {
        // ---
        let pool = test_pool().await;
        for i in 1..=3 {
            store::insert_sample(&pool, &notified_sample(&format!("bc-{i}"), i))
                .await
                .unwrap();
        }
        let cfg = test_config();
        let notifier = MockNotifier::default();
        notifier.script("student2@virginia.edu", Behavior::Disconnect);

        let summary = notify_by_email(&pool, &notifier, &cfg, None, false, daytime())
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);
        assert!(summary.aborted);

        // No attempt was recorded for the aborting record or anything after
        // it; both stay pending for the next pass.
        assert!(store::last_attempt(&pool, "bc-2", Channel::Email)
            .await
            .unwrap()
            .is_none());
        let leftovers = pending_samples(&pool, Channel::Email, None, false)
            .await
            .unwrap();
        assert_eq!(leftovers.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_aborts_email_pass() {
        // ---
        let pool = test_pool().await;
        for i in 1..=2 {
            store::insert_sample(&pool, &notified_sample(&format!("bc-{i}"), i))
                .await
                .unwrap();
        }
        let cfg = test_config();
        let notifier = MockNotifier::default();
        notifier.script("student1@virginia.edu", Behavior::RateLimit);

        let summary = notify_by_email(&pool, &notifier, &cfg, None, false, daytime())
            .await
            .unwrap();
        assert_eq!(summary.sent, 0);
        assert!(summary.aborted);
        assert_eq!(attempt_rows(&pool, false).await, 0);
    }

    #[tokio::test]
    async fn test_sms_pass_outside_window_is_noop() {
        // ---
        let pool = test_pool().await;
        store::insert_sample(&pool, &notified_sample("bc-1", 1))
            .await
            .unwrap();
        let cfg = test_config();
        let notifier = MockNotifier::default();

        // 04:00 UTC is 23:00 at UTC-5: outside the window
        let late = Utc.with_ymd_and_hms(2020, 10, 6, 4, 0, 0).unwrap();
        let summary = notify_by_text(&pool, &notifier, &cfg, None, false, late)
            .await
            .unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(notifier.texts.lock().unwrap().is_empty());
        assert_eq!(attempt_rows(&pool, true).await + attempt_rows(&pool, false).await, 0);
    }

    #[tokio::test]
    async fn test_sms_pass_sends_in_window() {
        // ---
        let pool = test_pool().await;
        store::insert_sample(&pool, &notified_sample("bc-1", 1))
            .await
            .unwrap();
        let cfg = test_config();
        let notifier = MockNotifier::default();

        let summary = notify_by_text(&pool, &notifier, &cfg, None, false, daytime())
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(
            notifier.texts.lock().unwrap().as_slice(),
            &["+14345550199".to_string()]
        );
        let record = store::fetch_sample(&pool, "bc-1").await.unwrap().unwrap();
        assert!(record.text_notified);
        assert!(!record.email_notified);
    }

    #[tokio::test]
    async fn test_sms_invalid_phone_is_a_recorded_failure() {
        // ---
        let pool = test_pool().await;
        let mut bad = notified_sample("bc-1", 1);
        bad.phone = Some("123".to_string());
        store::insert_sample(&pool, &bad).await.unwrap();
        store::insert_sample(&pool, &notified_sample("bc-2", 2))
            .await
            .unwrap();
        let cfg = test_config();
        let notifier = MockNotifier::default();

        let summary = notify_by_text(&pool, &notifier, &cfg, None, false, daytime())
            .await
            .unwrap();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failed, 1);

        let attempt = store::last_attempt(&pool, "bc-1", Channel::Text)
            .await
            .unwrap()
            .unwrap();
        assert!(!attempt.successful);
        assert!(attempt.error_message.unwrap().contains("invalid phone number"));
    }

    #[test]
    fn test_phone_normalization() {
        // ---
        assert_eq!(
            normalize_us_phone("434-555-0199").unwrap(),
            "+14345550199"
        );
        assert_eq!(
            normalize_us_phone("(434) 555-0199").unwrap(),
            "+14345550199"
        );
        assert_eq!(
            normalize_us_phone("1 434 555 0199").unwrap(),
            "+14345550199"
        );
        assert!(normalize_us_phone("123").is_err());
        assert!(normalize_us_phone("2434 555 0199").is_err());
    }

    #[test]
    fn test_sms_window_boundaries() {
        // ---
        let cfg = test_config();
        let at = |utc_hour: u32| Utc.with_ymd_and_hms(2020, 10, 6, utc_hour, 0, 0).unwrap();
        // UTC-5: window 08:00-22:00 local is 13:00-03:00 UTC
        assert!(within_sms_window(&cfg, at(13)), "08:00 local, first allowed hour");
        assert!(within_sms_window(&cfg, at(23)), "18:00 local");
        assert!(!within_sms_window(&cfg, at(12)), "07:00 local, too early");
        assert!(!within_sms_window(&cfg, at(3)), "22:00 local, window closed");
    }

    #[test]
    fn test_message_composition() {
        // ---
        let cfg = test_config();
        let sample = notified_sample("bc-1", 7);
        let body = email_body(&cfg, &sample);
        assert!(body.starts_with("Dear student7,"));
        assert!(body.contains("https://results.example.edu/lookup?code=1142270225"));

        let mut anonymous = sample.clone();
        anonymous.email = None;
        assert!(sms_body(&cfg, &anonymous).starts_with("Dear Student,"));
    }
}
