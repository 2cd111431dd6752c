//! Row-level operations on the record store.
//!
//! Thin sqlx helpers shared by the reconciliation, notification, and
//! reporting code. Helpers that participate in multi-statement merges are
//! generic over the executor so callers can run them inside a transaction;
//! everything else takes the pool directly and commits per statement.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::Result;
use crate::models::{Channel, Deposit, Notification, Sample};
use crate::search::SearchSpec;

/// Page size for the paged record search.
const SEARCH_PAGE_SIZE: i64 = 10;

// ---

/// Look up one sample by its barcode.
pub async fn fetch_sample<'e, E>(executor: E, barcode: &str) -> Result<Option<Sample>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    // ---
    let sample = sqlx::query_as::<_, Sample>("SELECT * FROM sample WHERE barcode = $1")
        .bind(barcode)
        .fetch_optional(executor)
        .await?;
    Ok(sample)
}

/// Insert a brand-new sample row.
pub async fn insert_sample<'e, E>(executor: E, sample: &Sample) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    // ---
    sqlx::query(
        r#"
        INSERT INTO sample (
            barcode, student_id, computing_id, date, location, station,
            phone, email, result_code, ivy_file, from_feed, from_kiosk,
            email_notified, text_notified, created_on, last_modified
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(&sample.barcode)
    .bind(&sample.student_id)
    .bind(&sample.computing_id)
    .bind(sample.date)
    .bind(sample.location)
    .bind(sample.station)
    .bind(&sample.phone)
    .bind(&sample.email)
    .bind(&sample.result_code)
    .bind(&sample.ivy_file)
    .bind(sample.from_feed)
    .bind(sample.from_kiosk)
    .bind(sample.email_notified)
    .bind(sample.text_notified)
    .bind(sample.created_on)
    .bind(sample.last_modified)
    .execute(executor)
    .await?;

    Ok(())
}

/// Write back every mutable field of an existing sample. `created_on` is
/// immutable and deliberately not part of the update.
pub async fn update_sample<'e, E>(executor: E, sample: &Sample) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    // ---
    sqlx::query(
        r#"
        UPDATE sample SET
            student_id = $2, computing_id = $3, date = $4, location = $5,
            station = $6, phone = $7, email = $8, result_code = $9,
            ivy_file = $10, from_feed = $11, from_kiosk = $12,
            email_notified = $13, text_notified = $14, last_modified = $15
        WHERE barcode = $1
        "#,
    )
    .bind(&sample.barcode)
    .bind(&sample.student_id)
    .bind(&sample.computing_id)
    .bind(sample.date)
    .bind(sample.location)
    .bind(sample.station)
    .bind(&sample.phone)
    .bind(&sample.email)
    .bind(&sample.result_code)
    .bind(&sample.ivy_file)
    .bind(sample.from_feed)
    .bind(sample.from_kiosk)
    .bind(sample.email_notified)
    .bind(sample.text_notified)
    .bind(sample.last_modified)
    .execute(executor)
    .await?;

    Ok(())
}

/// Delete a sample; the FK cascade removes its notification attempts.
pub async fn delete_sample<'e, E>(executor: E, barcode: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM sample WHERE barcode = $1")
        .bind(barcode)
        .execute(executor)
        .await?;
    Ok(())
}

/// All samples carrying neither a phone number nor an email address, in
/// insertion order. These are the kiosk-submitted records the similarity
/// sweep tries to pair with a feed record.
pub async fn samples_without_contact_info(pool: &SqlitePool) -> Result<Vec<Sample>> {
    // ---
    let samples = sqlx::query_as::<_, Sample>(
        r#"
        SELECT * FROM sample
        WHERE (phone IS NULL OR TRIM(phone) = '')
          AND (email IS NULL OR TRIM(email) = '')
        ORDER BY rowid
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(samples)
}

/// Find the first contact-bearing sample describing the same physical event
/// as `sample` (same student, timestamp, and location) under a different
/// barcode. First match in insertion order wins.
pub async fn find_contact_counterpart<'e, E>(
    executor: E,
    sample: &Sample,
) -> Result<Option<Sample>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    // ---
    let counterpart = sqlx::query_as::<_, Sample>(
        r#"
        SELECT * FROM sample
        WHERE student_id = $1
          AND date = $2
          AND location = $3
          AND barcode != $4
          AND ((phone IS NOT NULL AND TRIM(phone) != '')
            OR (email IS NOT NULL AND TRIM(email) != ''))
        ORDER BY rowid
        LIMIT 1
        "#,
    )
    .bind(&sample.student_id)
    .bind(sample.date)
    .bind(sample.location)
    .bind(&sample.barcode)
    .fetch_optional(executor)
    .await?;
    Ok(counterpart)
}

// ---

/// Append one notification attempt row.
pub async fn insert_attempt<'e, E>(
    executor: E,
    barcode: &str,
    channel: Channel,
    date: DateTime<Utc>,
    successful: bool,
    error_message: Option<&str>,
) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    // ---
    sqlx::query(
        r#"
        INSERT INTO notification (sample_barcode, channel, date, successful, error_message)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(barcode)
    .bind(channel)
    .bind(date)
    .bind(successful)
    .bind(error_message)
    .execute(executor)
    .await?;
    Ok(())
}

/// The most recent attempt for one sample on one channel, if any.
pub async fn last_attempt(
    pool: &SqlitePool,
    barcode: &str,
    channel: Channel,
) -> Result<Option<Notification>> {
    // ---
    let attempt = sqlx::query_as::<_, Notification>(
        r#"
        SELECT * FROM notification
        WHERE sample_barcode = $1 AND channel = $2
        ORDER BY date DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(barcode)
    .bind(channel)
    .fetch_optional(pool)
    .await?;
    Ok(attempt)
}

/// Full attempt history for one sample, newest first.
pub async fn attempts_for(pool: &SqlitePool, barcode: &str) -> Result<Vec<Notification>> {
    let attempts = sqlx::query_as::<_, Notification>(
        r#"
        SELECT * FROM notification
        WHERE sample_barcode = $1
        ORDER BY date DESC, id DESC
        "#,
    )
    .bind(barcode)
    .fetch_all(pool)
    .await?;
    Ok(attempts)
}

/// Move every attempt logged against `from_barcode` onto `to_barcode`.
/// Used when the similarity sweep collapses two rows into one.
pub async fn reassign_attempts<'e, E>(executor: E, from_barcode: &str, to_barcode: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE notification SET sample_barcode = $2 WHERE sample_barcode = $1")
        .bind(from_barcode)
        .bind(to_barcode)
        .execute(executor)
        .await?;
    Ok(())
}

/// Counts of attempts in a date range, split by channel and outcome:
/// (email ok, email failed, text ok, text failed). Feeds the dashboard
/// topbar.
pub async fn attempt_counts(
    pool: &SqlitePool,
    spec: &SearchSpec,
) -> Result<(i64, i64, i64, i64)> {
    // ---
    let rows = sqlx::query_as::<_, (String, bool, i64)>(
        r#"
        SELECT channel, successful, COUNT(*) FROM notification
        WHERE date >= $1 AND date < $2
        GROUP BY channel, successful
        "#,
    )
    .bind(spec.start_datetime())
    .bind(spec.end_datetime_exclusive())
    .fetch_all(pool)
    .await?;

    let mut counts = (0, 0, 0, 0);
    for (channel, successful, count) in rows {
        match (channel.as_str(), successful) {
            ("email", true) => counts.0 = count,
            ("email", false) => counts.1 = count,
            ("text", true) => counts.2 = count,
            ("text", false) => counts.3 = count,
            _ => {}
        }
    }
    Ok(counts)
}

// ---

/// Record (or refresh) the bookkeeping row for one ingested feed file.
pub async fn upsert_ivy_file(
    pool: &SqlitePool,
    file_name: &str,
    sample_count: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    // ---
    sqlx::query(
        r#"
        INSERT INTO ivy_file (file_name, date_added, sample_count)
        VALUES ($1, $2, $3)
        ON CONFLICT (file_name) DO UPDATE SET
            date_added = EXCLUDED.date_added,
            sample_count = EXCLUDED.sample_count
        "#,
    )
    .bind(file_name)
    .bind(now)
    .bind(sample_count)
    .execute(pool)
    .await?;
    Ok(())
}

/// Names of feed files already imported. The ingester skips these so a
/// file sitting in the drop directory is only processed once.
pub async fn processed_feed_files(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows = sqlx::query_as::<_, (String,)>("SELECT file_name FROM ivy_file")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

/// Append an inventory deposit.
pub async fn add_deposit(
    pool: &SqlitePool,
    amount: i64,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO deposit (date_added, amount, notes) VALUES ($1, $2, $3)")
        .bind(now)
        .bind(amount)
        .bind(notes)
        .execute(pool)
        .await?;
    Ok(())
}

/// Full deposit ledger, newest first, for the admin view.
pub async fn deposits(pool: &SqlitePool) -> Result<Vec<Deposit>> {
    let rows = sqlx::query_as::<_, Deposit>(
        "SELECT * FROM deposit ORDER BY date_added DESC, id DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Running inventory balance: total deposited minus samples collected since
/// `since`. Reports zero until the first deposit is logged.
pub async fn deposit_balance(pool: &SqlitePool, since: DateTime<Utc>) -> Result<i64> {
    // ---
    let (deposits, total): (i64, Option<i64>) =
        sqlx::query_as("SELECT COUNT(*), SUM(amount) FROM deposit")
            .fetch_one(pool)
            .await?;
    if deposits == 0 {
        return Ok(0);
    }

    let (used,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sample WHERE date >= $1")
        .bind(since)
        .fetch_one(pool)
        .await?;

    Ok(total.unwrap_or(0) - used)
}

// ---

/// Number of samples matching a search spec. The reporting views are
/// expected to sum to exactly this figure for the same spec.
pub async fn count_matching(pool: &SqlitePool, spec: &SearchSpec) -> Result<i64> {
    // ---
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM sample WHERE 1 = 1");
    spec.push_predicates(&mut qb, true);
    let (count,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
    Ok(count)
}

/// Paged record search ordered by `last_modified`, optionally restricted to
/// records touched after a sync watermark. Page size is fixed at 10 to match
/// the dashboard table.
pub async fn search_samples(
    pool: &SqlitePool,
    spec: &SearchSpec,
    modified_after: Option<DateTime<Utc>>,
    page: i64,
) -> Result<Vec<Sample>> {
    // ---
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM sample WHERE 1 = 1");
    spec.push_predicates(&mut qb, true);
    if let Some(watermark) = modified_after {
        qb.push(" AND last_modified > ");
        qb.push_bind(watermark);
    }
    qb.push(" ORDER BY last_modified");
    qb.push(" LIMIT ");
    qb.push_bind(SEARCH_PAGE_SIZE);
    qb.push(" OFFSET ");
    qb.push_bind(page * SEARCH_PAGE_SIZE);

    let samples = qb.build_query_as::<Sample>().fetch_all(pool).await?;
    Ok(samples)
}
