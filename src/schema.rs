//! Database schema management for `resultflow`.
//!
//! Ensures required tables and indexes exist before the pipeline runs.
//! Applied once on startup from `main.rs`, and by test fixtures against
//! in-memory databases.

use anyhow::Result;
use sqlx::SqlitePool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `sample` table keyed by barcode, the `notification` attempt
/// log (cascade-deleted with its sample), and the `ivy_file` / `deposit`
/// bookkeeping tables. Safe to call on every startup; no-op if objects
/// already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    // ---
    // Cascade from sample to notification requires enforcement to be on
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;

    let mut tx = pool.begin().await?;

    // Canonical per-test-event records, one row per barcode
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sample (
            barcode        TEXT PRIMARY KEY,
            student_id     TEXT    NOT NULL,
            computing_id   TEXT,
            date           TEXT    NOT NULL,
            location       INTEGER NOT NULL DEFAULT 0,
            station        INTEGER NOT NULL DEFAULT 0,
            phone          TEXT,
            email          TEXT,
            result_code    TEXT,
            ivy_file       TEXT,
            from_feed      BOOLEAN NOT NULL DEFAULT FALSE,
            from_kiosk     BOOLEAN NOT NULL DEFAULT FALSE,
            email_notified BOOLEAN NOT NULL DEFAULT FALSE,
            text_notified  BOOLEAN NOT NULL DEFAULT FALSE,
            created_on     TEXT    NOT NULL,
            last_modified  TEXT    NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Send-attempt log; rows live and die with their sample
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notification (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            sample_barcode TEXT    NOT NULL
                           REFERENCES sample (barcode) ON DELETE CASCADE,
            channel        TEXT    NOT NULL,
            date           TEXT    NOT NULL,
            successful     BOOLEAN NOT NULL,
            error_message  TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // One row per ingested feed file
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ivy_file (
            file_name    TEXT PRIMARY KEY,
            date_added   TEXT    NOT NULL,
            sample_count INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Append-only inventory ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deposit (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            date_added TEXT    NOT NULL,
            amount     INTEGER NOT NULL,
            notes      TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Basic indexes for the reconciliation and reporting queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sample_identity
            ON sample (student_id, date, location);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_sample_date
            ON sample (date);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_notification_barcode
            ON notification (sample_barcode, channel, date);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
