//! Metric domain types: definitions, normalized values, date ranges.
//!
//! Providers report values in heterogeneous shapes (untyped strings from
//! GA, minor-unit integers from Stripe). Everything is normalized here into
//! [`MetricValue`] before storage so display code never re-parses.

use crate::provider::RawValue;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

mod store;

pub use store::{MetricRecord, MetricStore, UpsertOutcome};

/// How a metric's values should be interpreted and stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Integer counter (sessions, users, charge counts).
    Count,
    /// Continuous measure (durations, rates), stored with 2-decimal rounding.
    Measure,
    /// Money in major units. Adapters convert from minor units before this
    /// point; storage rounds to 2 decimals like any measure.
    Monetary,
}

/// A metric as discovered from the provider catalog.
#[derive(Clone, Debug, Serialize)]
pub struct MetricDefinition {
    /// Machine name used in report queries (e.g. "sessions").
    pub name: String,
    /// Provider-supplied human description, denormalized for display.
    pub description: String,
    pub kind: MetricKind,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind,
        }
    }
}

/// A normalized metric value, ready for storage.
///
/// `Raw` preserves values that failed to parse — they are stored as-is and
/// surfaced in the run report as skipped, never dropped silently.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Count(i64),
    Measure(f64),
    Raw(String),
}

impl MetricValue {
    pub fn is_raw(&self) -> bool {
        matches!(self, MetricValue::Raw(_))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Normalize a provider-reported value according to the metric's kind.
///
/// Counts parse to integers; measures and monetary values round to two
/// decimals. Unparseable input becomes `Raw` rather than an error.
pub fn normalize(kind: MetricKind, raw: &RawValue) -> MetricValue {
    match kind {
        MetricKind::Count => match raw {
            RawValue::Int(i) => MetricValue::Count(*i),
            RawValue::Float(f) if f.fract() == 0.0 => MetricValue::Count(*f as i64),
            RawValue::Float(f) => MetricValue::Measure(round2(*f)),
            RawValue::Text(s) => match s.trim().parse::<i64>() {
                Ok(i) => MetricValue::Count(i),
                // GA reports some counters as floats ("12.0")
                Err(_) => match s.trim().parse::<f64>() {
                    Ok(f) if f.fract() == 0.0 => MetricValue::Count(f as i64),
                    Ok(f) => MetricValue::Measure(round2(f)),
                    Err(_) => MetricValue::Raw(s.clone()),
                },
            },
        },
        MetricKind::Measure | MetricKind::Monetary => match raw {
            RawValue::Int(i) => MetricValue::Measure(*i as f64),
            RawValue::Float(f) => MetricValue::Measure(round2(*f)),
            RawValue::Text(s) => match s.trim().parse::<f64>() {
                Ok(f) => MetricValue::Measure(round2(f)),
                Err(_) => MetricValue::Raw(s.clone()),
            },
        },
    }
}

/// An inclusive range of dates to reconcile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// A range from `start` to `end` inclusive. Reversed bounds are swapped
    /// rather than rejected.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Default range for a provider: `days` complete days ending
    /// `finality_lag_days` before today, so partial-day values never land
    /// in the store.
    pub fn latest_complete(today: NaiveDate, finality_lag_days: i64, days: i64) -> Self {
        let end = today - chrono::Duration::days(finality_lag_days);
        let start = end - chrono::Duration::days(days.max(1) - 1);
        Self { start, end }
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take(self.num_days() as usize)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}
