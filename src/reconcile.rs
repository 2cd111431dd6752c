//! Record reconciliation.
//!
//! Two producers describe the same physical test event: the collection
//! kiosks submit a record at swab time (identity and timing only) and the
//! lab feed delivers the result later with contact info attached. Phase one
//! is an exact-barcode upsert; phase two is an explicitly-invoked similarity
//! sweep for historical data where the producers disagreed on barcode
//! format.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{computing_id_from_email, Sample};
use crate::store;

// ---

/// Merge a batch of incoming records into the store by exact barcode match.
///
/// Idempotent and safe to call repeatedly with overlapping inputs: a known
/// barcode gets a fill-gap field merge (incoming data never erases existing
/// data), an unknown one is inserted. The whole batch commits in one
/// transaction; a constraint violation aborts it with no partial state
/// visible to readers.
pub async fn add_or_update_records(
    pool: &SqlitePool,
    samples: &[Sample],
    now: DateTime<Utc>,
) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for incoming in samples {
        match store::fetch_sample(&mut *tx, &incoming.barcode).await? {
            Some(mut existing) => {
                existing.merge_from(incoming);
                existing.last_modified = now;
                store::update_sample(&mut *tx, &existing).await?;
            }
            None => {
                let mut fresh = incoming.clone();
                fresh.created_on = now;
                fresh.last_modified = now;
                store::insert_sample(&mut *tx, &fresh).await?;
            }
        }
    }

    tx.commit().await?;
    debug!("Reconciled batch of {} records", samples.len());
    Ok(())
}

/// Similarity sweep for records the exact-barcode path cannot pair.
///
/// Each record lacking any contact info (the kiosk path produces these)
/// looks for one counterpart with contact info matching its student id,
/// timestamp, and location exactly under a different barcode. The first
/// counterpart in store order becomes the donor: its fields fill the
/// survivor's gaps, its notification attempts are reassigned, and the donor
/// row is deleted. The survivor keeps its barcode and `created_on`.
///
/// Safe to run repeatedly: once merged, the survivor carries contact info
/// and no longer matches the sweep's selection. Each pair commits on its
/// own, so a crash mid-sweep loses nothing already merged.
///
/// Returns the number of pairs merged.
pub async fn merge_similar_records(pool: &SqlitePool, now: DateTime<Utc>) -> Result<usize> {
    // ---
    let orphans = store::samples_without_contact_info(pool).await?;
    let mut merged = 0;

    for mut survivor in orphans {
        let Some(donor) = store::find_contact_counterpart(pool, &survivor).await? else {
            continue;
        };

        survivor.merge_from(&donor);
        // Carry delivery state over so an already-notified event is not
        // notified a second time under the surviving barcode.
        if donor.email_notified {
            survivor.email_notified = true;
        }
        if donor.text_notified {
            survivor.text_notified = true;
        }
        survivor.last_modified = now;

        let mut tx = pool.begin().await?;
        store::reassign_attempts(&mut *tx, &donor.barcode, &survivor.barcode).await?;
        store::update_sample(&mut *tx, &survivor).await?;
        store::delete_sample(&mut *tx, &donor.barcode).await?;
        tx.commit().await?;

        debug!(
            "Merged donor {} into {} for student {}",
            donor.barcode, survivor.barcode, survivor.student_id
        );
        merged += 1;
    }

    if merged > 0 {
        info!("Similarity sweep merged {} record pair(s)", merged);
    }
    Ok(merged)
}

/// Backfill `computing_id` from the email address wherever it is missing.
/// Existing computing ids are left alone. Returns the number of records
/// corrected.
pub async fn correct_computing_id(pool: &SqlitePool, now: DateTime<Utc>) -> Result<usize> {
    // ---
    let candidates = sqlx::query_as::<_, Sample>(
        r#"
        SELECT * FROM sample
        WHERE (computing_id IS NULL OR TRIM(computing_id) = '')
          AND email IS NOT NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut corrected = 0;
    for mut sample in candidates {
        let Some(derived) = sample.email.as_deref().and_then(computing_id_from_email) else {
            continue;
        };
        sample.computing_id = Some(derived);
        sample.last_modified = now;
        store::update_sample(pool, &sample).await?;
        corrected += 1;
    }
    Ok(corrected)
}
