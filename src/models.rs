//! Data models for the test-result pipeline.
//!
//! `Sample` is the canonical per-test-event record, keyed by barcode and
//! assembled over time from two producers: the lab feed (which knows contact
//! info) and the collection kiosks (which do not). `Notification` is the
//! per-send attempt log that drives retry suppression.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Delivery channel for an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Text,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Text => "text",
        }
    }
}

/// One observation of a test event, keyed by barcode.
///
/// A row may be populated by the lab feed, by a kiosk submission, or both
/// over its lifetime; `merge_from` governs how later observations fold into
/// an existing row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Sample {
    // ---
    pub barcode: String,
    pub student_id: String,
    pub computing_id: Option<String>,
    pub date: DateTime<Utc>,
    pub location: i64,
    pub station: i64,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub result_code: Option<String>,
    /// Name of the feed file this record arrived in, if any.
    pub ivy_file: Option<String>,
    /// Provenance: seen in a lab feed file.
    pub from_feed: bool,
    /// Provenance: submitted directly by a collection kiosk.
    pub from_kiosk: bool,
    pub email_notified: bool,
    pub text_notified: bool,
    pub created_on: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Sample {
    /// Create a bare record as a kiosk submission would: identity and timing
    /// only, no contact info or result.
    pub fn new(barcode: &str, student_id: &str, date: DateTime<Utc>, location: i64) -> Self {
        // ---
        let now = Utc::now();
        Sample {
            barcode: barcode.to_string(),
            student_id: student_id.to_string(),
            computing_id: None,
            date,
            location,
            station: 0,
            phone: None,
            email: None,
            result_code: None,
            ivy_file: None,
            from_feed: false,
            from_kiosk: false,
            email_notified: false,
            text_notified: false,
            created_on: now,
            last_modified: now,
        }
    }

    /// Fold a later observation of the same event into this record.
    ///
    /// Optional fields are filled or replaced only when the incoming value is
    /// present and non-empty; incoming data never erases existing data.
    /// Provenance flags are OR'd, never cleared. The caller is responsible
    /// for bumping `last_modified`.
    pub fn merge_from(&mut self, other: &Sample) {
        // ---
        if non_empty(&other.phone) {
            self.phone = other.phone.clone();
        }
        if non_empty(&other.email) {
            self.email = other.email.clone();
        }
        if non_empty(&other.result_code) {
            self.result_code = other.result_code.clone();
        }
        if non_empty(&other.computing_id) {
            self.computing_id = other.computing_id.clone();
        }
        if non_empty(&other.ivy_file) {
            self.ivy_file = other.ivy_file.clone();
        }
        if other.station != 0 {
            self.station = other.station;
        }
        if other.from_feed {
            self.from_feed = true;
        }
        if other.from_kiosk {
            self.from_kiosk = true;
        }
    }

    /// True when this record carries no contact info at all. Such records
    /// came from the kiosk path and are candidates for the similarity sweep.
    pub fn lacks_contact_info(&self) -> bool {
        !non_empty(&self.phone) && !non_empty(&self.email)
    }

    /// Placeholder records inserted by station self-tests use student id 0.
    pub fn is_placeholder(&self) -> bool {
        self.student_id == "0"
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Synthesize the canonical barcode for sources that do not supply one:
/// `{student_id}-{YYYYMMDDHHMM}-{location:04}`.
pub fn synthesize_barcode(student_id: &str, date: NaiveDateTime, location: i64) -> String {
    format!("{}-{}-{:04}", student_id, date.format("%Y%m%d%H%M"), location)
}

/// Derive a computing id from a university email address.
///
/// Returns the lowercased local part for `…@virginia.edu` addresses
/// (case-insensitive domain, surrounding whitespace ignored), `None` for
/// anything else.
pub fn computing_id_from_email(email: &str) -> Option<String> {
    // ---
    let trimmed = email.trim();
    let (local, domain) = trimmed.split_once('@')?;
    if !domain.eq_ignore_ascii_case("virginia.edu") || local.is_empty() {
        return None;
    }
    Some(local.to_ascii_lowercase())
}

// ---

/// One notification send attempt, owned by its sample.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    // ---
    pub id: i64,
    pub sample_barcode: String,
    pub channel: Channel,
    pub date: DateTime<Utc>,
    pub successful: bool,
    pub error_message: Option<String>,
}

/// Metadata for one ingested feed file. Re-importing the same file name
/// updates the row in place rather than duplicating it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct IvyFile {
    pub file_name: String,
    pub date_added: DateTime<Utc>,
    pub sample_count: i64,
}

/// Append-only inventory ledger entry, used only for the running-balance
/// stat on the dashboard.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Deposit {
    pub id: i64,
    pub date_added: DateTime<Utc>,
    pub amount: i64,
    pub notes: Option<String>,
}
