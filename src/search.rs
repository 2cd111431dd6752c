//! Typed search specification shared by reporting and record search.
//!
//! Every optional filter is an explicit field; the same predicate builder
//! feeds all aggregation dimensions and the paged record search, so a given
//! spec always selects the same set of rows no matter which view asks.

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use sqlx::{QueryBuilder, Sqlite};

// ---

/// Filters applied when selecting samples for reports.
///
/// The date range covers the calendar days `start_date..=end_date`; the
/// underlying timestamp predicate is half-open, `[start_date 00:00,
/// end_date+1 00:00)`, so midnight boundaries are never double counted.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    // ---
    pub start_date: NaiveDate,
    /// Last calendar day of the range, inclusive.
    pub end_date: NaiveDate,
    pub student_ids: Option<Vec<String>>,
    pub locations: Option<Vec<i64>>,
    pub stations: Option<Vec<i64>>,
    pub computing_ids: Option<Vec<String>>,
    /// When false (the default), station self-test placeholder records
    /// (student id 0) are excluded.
    pub include_tests: bool,
}

impl SearchSpec {
    /// A spec covering the given calendar days with no other filters.
    pub fn for_range(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        SearchSpec {
            start_date,
            end_date,
            student_ids: None,
            locations: None,
            stations: None,
            computing_ids: None,
            include_tests: false,
        }
    }

    /// Inclusive lower timestamp bound (midnight starting the first day).
    pub fn start_datetime(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.start_date.and_hms_opt(0, 0, 0).unwrap())
    }

    /// Exclusive upper timestamp bound (midnight after the last day).
    pub fn end_datetime_exclusive(&self) -> DateTime<Utc> {
        let day_after = self
            .end_date
            .checked_add_days(Days::new(1))
            .unwrap_or(self.end_date);
        Utc.from_utc_datetime(&day_after.and_hms_opt(0, 0, 0).unwrap())
    }

    /// Number of calendar days covered by the range.
    pub fn days_in_range(&self) -> i64 {
        (self.end_date - self.start_date).num_days() + 1
    }

    /// Append this spec's predicates to a query that already ends in a
    /// `WHERE` clause (e.g. `... WHERE 1 = 1`).
    ///
    /// `with_dates` lets callers that bucket over their own shifted windows
    /// (the rolling-totals view) skip the date-range predicate while keeping
    /// every other filter identical.
    pub fn push_predicates(&self, qb: &mut QueryBuilder<'_, Sqlite>, with_dates: bool) {
        // ---
        if with_dates {
            qb.push(" AND date >= ");
            qb.push_bind(self.start_datetime());
            qb.push(" AND date < ");
            qb.push_bind(self.end_datetime_exclusive());
        }
        if let Some(ids) = &self.student_ids {
            push_in_clause(qb, "student_id", ids.iter().cloned());
        }
        if let Some(ids) = &self.computing_ids {
            push_in_clause(qb, "computing_id", ids.iter().cloned());
        }
        if let Some(locations) = &self.locations {
            push_in_clause(qb, "location", locations.iter().copied());
        }
        if let Some(stations) = &self.stations {
            push_in_clause(qb, "station", stations.iter().copied());
        }
        if !self.include_tests {
            qb.push(" AND student_id != '0'");
        }
    }
}

impl Default for SearchSpec {
    /// Today only, matching the dashboard's landing view.
    fn default() -> Self {
        let today = Utc::now().date_naive();
        SearchSpec::for_range(today, today)
    }
}

fn push_in_clause<T>(
    qb: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    values: impl Iterator<Item = T>,
) where
    T: for<'q> sqlx::Encode<'q, Sqlite> + sqlx::Type<Sqlite> + Send + 'static,
{
    // ---
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    qb.push(")");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Timelike;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_range_bounds_are_half_open() {
        // ---
        let spec = SearchSpec::for_range(date(2020, 11, 1), date(2020, 11, 7));
        assert_eq!(spec.start_datetime().date_naive(), date(2020, 11, 1));
        assert_eq!(
            spec.end_datetime_exclusive().date_naive(),
            date(2020, 11, 8),
            "upper bound is the midnight after the last day"
        );
        assert_eq!(spec.end_datetime_exclusive().hour(), 0);
        assert_eq!(spec.days_in_range(), 7);
    }

    #[test]
    fn test_single_day_range() {
        let spec = SearchSpec::for_range(date(2020, 11, 1), date(2020, 11, 1));
        assert_eq!(spec.days_in_range(), 1);
        assert_eq!(
            spec.end_datetime_exclusive().date_naive(),
            date(2020, 11, 2)
        );
    }
}
