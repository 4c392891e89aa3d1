//! Trend aggregation: readings into weekly, monthly and quarterly points.
//!
//! Weeks and months average the readings that land in them. A quarter is
//! the sample-weighted mean of its three monthly aggregates, so an empty
//! month carries no weight. Readings keyed directly by quarter cannot be
//! split across months and join the quarter as one more weighted part.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::{GateError, Result};
use crate::models::{KpiReading, Scope, TrendPoint};
use crate::period::{PeriodKey, PeriodRange, Window};
use crate::store::ReadingQuery;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Bucket {
    sum: f64,
    samples: u32,
}

impl Bucket {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.samples += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.sum / f64::from(self.samples))
    }
}

/// Sample-weighted mean of `(aggregate, samples)` parts. Parts without
/// samples are skipped; `None` when nothing has samples.
pub fn weighted_mean(parts: &[(Option<f64>, u32)]) -> Option<f64> {
    let (weighted, samples) = parts
        .iter()
        .filter_map(|(value, samples)| match value {
            Some(value) if *samples > 0 => Some((value * f64::from(*samples), *samples)),
            _ => None,
        })
        .fold((0.0, 0u32), |(sum, count), (v, n)| (sum + v, count + n));
    (samples > 0).then(|| weighted / f64::from(samples))
}

/// Aggregate of one period as `(value, samples)`.
fn aggregate_period(
    window: Window,
    period: PeriodKey,
    buckets: &HashMap<PeriodKey, Bucket>,
    quarter_direct: &HashMap<PeriodKey, Bucket>,
) -> (Option<f64>, u32) {
    match window {
        Window::Weekly | Window::Monthly => {
            let bucket = buckets.get(&period).copied().unwrap_or_default();
            (bucket.mean(), bucket.samples)
        }
        Window::Quarterly => {
            let mut parts: Vec<(Option<f64>, u32)> = period
                .months()
                .iter()
                .map(|month| {
                    let bucket = buckets.get(month).copied().unwrap_or_default();
                    (bucket.mean(), bucket.samples)
                })
                .collect();
            if let Some(direct) = quarter_direct.get(&period) {
                parts.push((direct.mean(), direct.samples));
            }
            let samples = parts.iter().map(|(_, n)| n).sum();
            (weighted_mean(&parts), samples)
        }
    }
}

/// Rolls readings into one point per period of `range`, gaps included.
///
/// Readings from the period just before the range feed the first point's
/// `prior_period_value`.
pub fn rollup(
    kpi_key: &str,
    window: Window,
    range: &PeriodRange,
    readings: &[KpiReading],
    computed_at: DateTime<Utc>,
) -> Vec<TrendPoint> {
    // Quarters are built from monthly buckets.
    let bucket_granularity = match window {
        Window::Weekly => Window::Weekly,
        Window::Monthly | Window::Quarterly => Window::Monthly,
    };

    let mut buckets: HashMap<PeriodKey, Bucket> = HashMap::new();
    let mut quarter_direct: HashMap<PeriodKey, Bucket> = HashMap::new();
    let mut skipped = 0usize;

    for reading in readings.iter().filter(|r| r.kpi_key == kpi_key) {
        if !reading.value.is_finite() {
            skipped += 1;
            continue;
        }
        match reading.period_key.bucket_for(bucket_granularity) {
            Some(bucket) => buckets.entry(bucket).or_default().add(reading.value),
            None if window == Window::Quarterly => quarter_direct
                .entry(reading.period_key)
                .or_default()
                .add(reading.value),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(kpi = kpi_key, window = %window, skipped, "Readings not attributable to window");
    }

    let mut prior = range
        .from()
        .prev()
        .and_then(|prev| aggregate_period(window, prev, &buckets, &quarter_direct).0);

    range
        .periods()
        .into_iter()
        .map(|period| {
            let (aggregate_value, sample_count) =
                aggregate_period(window, period, &buckets, &quarter_direct);
            let point = TrendPoint {
                kpi_key: kpi_key.to_string(),
                window,
                period_key: period,
                aggregate_value,
                sample_count,
                prior_period_value: prior,
                computed_at,
            };
            prior = aggregate_value;
            point
        })
        .collect()
}

impl Engine {
    /// Aggregates a KPI over an inclusive period range and caches the points.
    pub async fn aggregate(
        &self,
        scope: &Scope,
        kpi_key: &str,
        window: Window,
        from: PeriodKey,
        to: PeriodKey,
    ) -> Result<Vec<TrendPoint>> {
        let range = PeriodRange::new(from, to)?;
        if range.granularity() != window {
            return Err(GateError::InvalidRange(format!(
                "{range} is not a {window} range"
            )));
        }

        let lookback = range.from().prev().unwrap_or_else(|| range.from());
        let query = ReadingQuery {
            kpi_key: kpi_key.to_string(),
            from: lookback.start_date(),
            to: range.to().end_date(),
            dimension_filter: None,
        };
        let readings = self.fetch_readings(scope, &query).await?;
        let points = rollup(kpi_key, window, &range, &readings, Utc::now());

        for point in &points {
            self.bounded("upsert_trend_point", self.store().upsert_trend_point(scope, point))
                .await?;
        }

        info!(
            tenant = %scope,
            kpi = kpi_key,
            window = %window,
            range = %range,
            points = points.len(),
            empty = points.iter().filter(|p| p.sample_count == 0).count(),
            "Aggregated trend"
        );
        Ok(points)
    }
}
