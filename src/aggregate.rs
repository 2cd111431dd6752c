//! Time-bucketed aggregate statistics over the record store.
//!
//! Every dimension (calendar day, hour of day, weekday, rolling windows)
//! filters through the same [`SearchSpec`] predicates, so the numbers on one
//! chart always reconcile with the others for the same request. Counting is
//! done here after a plain filtered fetch; the store is not asked to pivot.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Days, Duration, Timelike, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::error::Result;
use crate::search::SearchSpec;

/// Bucket series per station.
pub type StationSeries = BTreeMap<i64, Vec<i64>>;

/// Bucket series per location, then per station within it.
pub type LocationBreakdown = BTreeMap<i64, StationSeries>;

/// Per-location counts for the current search window and the same window
/// shifted back one and two periods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekTotals {
    pub two_weeks_ago: i64,
    pub one_week_ago: i64,
    pub current: i64,
}

// ---

#[derive(sqlx::FromRow)]
struct EventRow {
    location: i64,
    station: i64,
    date: DateTime<Utc>,
}

async fn fetch_events(
    pool: &SqlitePool,
    spec: &SearchSpec,
    with_dates: bool,
) -> Result<Vec<EventRow>> {
    // ---
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT location, station, date FROM sample WHERE 1 = 1");
    spec.push_predicates(&mut qb, with_dates);
    let rows = qb.build_query_as::<EventRow>().fetch_all(pool).await?;
    Ok(rows)
}

/// The source's hand-tuned display rounding: add 0.4, then round. Biased
/// upward relative to standard rounding; kept verbatim so charts match the
/// historical dashboard.
fn round_rate(count: i64, divisor: i64) -> i64 {
    (count as f64 / divisor as f64 + 0.4).round() as i64
}

// ---

/// Count of records per calendar day in the search range, grouped by
/// location and station. Buckets are midnight-aligned and half-open, so a
/// record is counted in exactly one day.
pub async fn totals_by_day(pool: &SqlitePool, spec: &SearchSpec) -> Result<LocationBreakdown> {
    // ---
    let days = spec.days_in_range() as usize;
    let mut data = LocationBreakdown::new();

    for event in fetch_events(pool, spec, true).await? {
        let index = (event.date.date_naive() - spec.start_date).num_days();
        if index < 0 || index as usize >= days {
            debug!("Event outside day buckets, skipping: {}", event.date);
            continue;
        }
        let series = data
            .entry(event.location)
            .or_default()
            .entry(event.station)
            .or_insert_with(|| vec![0; days]);
        series[index as usize] += 1;
    }
    Ok(data)
}

/// Average records per hour of day, grouped by location and station.
///
/// Raw hourly counts are rotated by `rotation` buckets to shift the feed's
/// UTC timestamps back to local wall-clock hours, then divided by the
/// number of days in the search range (with the `+0.4` display rounding) to
/// report a daily rate rather than a raw sum.
pub async fn totals_by_hour(
    pool: &SqlitePool,
    spec: &SearchSpec,
    rotation: u32,
) -> Result<LocationBreakdown> {
    // ---
    let days = spec.days_in_range().max(1);
    let rotation = rotation as usize % 24;

    let mut raw: LocationBreakdown = BTreeMap::new();
    for event in fetch_events(pool, spec, true).await? {
        let series = raw
            .entry(event.location)
            .or_default()
            .entry(event.station)
            .or_insert_with(|| vec![0; 24]);
        series[event.date.hour() as usize] += 1;
    }

    let mut data = LocationBreakdown::new();
    for (location, stations) in raw {
        for (station, counts) in stations {
            let rotated: Vec<i64> = (0..24)
                .map(|bucket| round_rate(counts[(bucket + rotation) % 24], days))
                .collect();
            data.entry(location).or_default().insert(station, rotated);
        }
    }
    Ok(data)
}

/// Average records per weekday (Monday = 0), grouped by location and
/// station, normalized by how many times each weekday occurs in the search
/// range. A weekday that never occurs in range reports its raw count
/// instead of dividing by zero.
pub async fn totals_by_weekday(pool: &SqlitePool, spec: &SearchSpec) -> Result<LocationBreakdown> {
    // ---
    let occurrences = weekday_occurrences(spec);

    let mut raw: LocationBreakdown = BTreeMap::new();
    for event in fetch_events(pool, spec, true).await? {
        let series = raw
            .entry(event.location)
            .or_default()
            .entry(event.station)
            .or_insert_with(|| vec![0; 7]);
        series[event.date.weekday().num_days_from_monday() as usize] += 1;
    }

    let mut data = LocationBreakdown::new();
    for (location, stations) in raw {
        for (station, counts) in stations {
            let normalized: Vec<i64> = (0..7)
                .map(|weekday| {
                    if occurrences[weekday] > 0 {
                        round_rate(counts[weekday], occurrences[weekday])
                    } else {
                        counts[weekday]
                    }
                })
                .collect();
            data.entry(location).or_default().insert(station, normalized);
        }
    }
    Ok(data)
}

/// How many times each weekday (Monday = 0) occurs across the calendar days
/// of the search range.
fn weekday_occurrences(spec: &SearchSpec) -> [i64; 7] {
    // ---
    let mut counts = [0i64; 7];
    let mut day = spec.start_date;
    while day <= spec.end_date {
        counts[day.weekday().num_days_from_monday() as usize] += 1;
        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }
    counts
}

/// Per-location counts for the search window and the same-length windows
/// shifted back 7 and 14 days, enabling week-over-week comparison. All
/// non-date filters from the spec still apply.
pub async fn totals_last_week(
    pool: &SqlitePool,
    spec: &SearchSpec,
) -> Result<BTreeMap<i64, WeekTotals>> {
    // ---
    let start = spec.start_datetime();
    let end = spec.end_datetime_exclusive();

    // One fetch over the widest span; windows are classified here
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT location, station, date FROM sample WHERE 1 = 1");
    qb.push(" AND date >= ");
    qb.push_bind(start - Duration::days(14));
    qb.push(" AND date < ");
    qb.push_bind(end);
    spec.push_predicates(&mut qb, false);
    let events = qb.build_query_as::<EventRow>().fetch_all(pool).await?;

    let mut data: BTreeMap<i64, WeekTotals> = BTreeMap::new();
    for event in events {
        let totals = data.entry(event.location).or_insert(WeekTotals {
            two_weeks_ago: 0,
            one_week_ago: 0,
            current: 0,
        });
        let two_back = Duration::days(14);
        let one_back = Duration::days(7);
        if event.date >= start - two_back && event.date < end - two_back {
            totals.two_weeks_ago += 1;
        }
        if event.date >= start - one_back && event.date < end - one_back {
            totals.one_week_ago += 1;
        }
        if event.date >= start && event.date < end {
            totals.current += 1;
        }
    }
    Ok(data)
}

/// Flatten a per-location, per-station breakdown into single chart series.
///
/// With several locations, stations are summed per location and the keys
/// are locations; with exactly one location, its per-station series are
/// returned unwrapped and the keys are stations.
pub fn collapse_series(data: &LocationBreakdown) -> BTreeMap<i64, Vec<i64>> {
    // ---
    if data.len() == 1 {
        let stations = data.values().next().unwrap();
        return stations.clone();
    }

    let mut collapsed = BTreeMap::new();
    for (location, stations) in data {
        let length = stations.values().map(Vec::len).max().unwrap_or(0);
        let mut summed = vec![0i64; length];
        for series in stations.values() {
            for (index, value) in series.iter().enumerate() {
                summed[index] += value;
            }
        }
        collapsed.insert(*location, summed);
    }
    collapsed
}
