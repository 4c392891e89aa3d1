//! Root-cause ranking of a flagged period's deviation across one dimension.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{GateError, Result};
use crate::models::{Flag, KpiReading, RcaTopContributor, Scope};
use crate::period::{PeriodKey, Window};
use crate::store::ReadingQuery;

/// Partition name for readings that lack the requested tag.
pub const UNTAGGED: &str = "(none)";

#[derive(Debug, Clone, PartialEq)]
pub enum Ranking {
    Ranked(Vec<RcaTopContributor>),
    /// The period is not `warn` or `alert`; nothing to explain.
    NotFlagged(Flag),
    /// Too few readings for a meaningful attribution.
    InsufficientSamples { have: u32, need: u32 },
}

/// Everything `rank` needs to know about the period being explained.
#[derive(Debug, Clone, Copy)]
pub struct RankRequest<'a> {
    pub kpi_key: &'a str,
    pub period: PeriodKey,
    pub window: Window,
    pub dimension_key: &'a str,
    pub target: f64,
    pub top_n: usize,
    pub min_samples: u32,
}

/// Ranks partitions by their share of the deviation from target.
///
/// Each partition contributes `(mean - target) * (n / N)`; shares are the
/// contributions normalized by their absolute sum, so `sum(|share|) <= 1`.
pub fn rank(request: &RankRequest<'_>, readings: &[KpiReading]) -> Ranking {
    let mut partitions: BTreeMap<&str, (f64, u32)> = BTreeMap::new();
    for reading in readings.iter().filter(|r| r.value.is_finite()) {
        let value = reading
            .dimension_tags
            .get(request.dimension_key)
            .map_or(UNTAGGED, String::as_str);
        let entry = partitions.entry(value).or_insert((0.0, 0));
        entry.0 += reading.value;
        entry.1 += 1;
    }

    let total: u32 = partitions.values().map(|(_, n)| n).sum();
    if total < request.min_samples {
        return Ranking::InsufficientSamples {
            have: total,
            need: request.min_samples,
        };
    }

    let contributions: Vec<(&str, f64, u32)> = partitions
        .into_iter()
        .map(|(value, (sum, n))| {
            let mean = sum / f64::from(n);
            let contribution = (mean - request.target) * (f64::from(n) / f64::from(total));
            (value, contribution, n)
        })
        .collect();
    let absolute: f64 = contributions.iter().map(|(_, c, _)| c.abs()).sum();

    let mut shares: Vec<(&str, f64, u32)> = contributions
        .into_iter()
        .map(|(value, contribution, n)| {
            let share = if absolute > 0.0 {
                (contribution / absolute).clamp(-1.0, 1.0)
            } else {
                0.0
            };
            (value, share, n)
        })
        .collect();

    shares.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then_with(|| a.0.cmp(b.0)));
    shares.truncate(request.top_n);

    Ranking::Ranked(
        shares
            .into_iter()
            .enumerate()
            .map(|(idx, (value, share, n))| RcaTopContributor {
                kpi_key: request.kpi_key.to_string(),
                period_key: request.period,
                window: request.window,
                dimension_key: request.dimension_key.to_string(),
                dimension_value: value.to_string(),
                impact_share: share,
                sample_count: n,
                rank: idx as u32 + 1,
            })
            .collect(),
    )
}

impl Engine {
    /// Explains a flagged period by ranking contributors along `dimension_key`.
    pub async fn rank_contributors(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
        dimension_key: &str,
        top_n: Option<usize>,
    ) -> Result<Ranking> {
        let top_n = top_n.unwrap_or(self.config().rca.default_top_n);
        if top_n == 0 {
            return Err(GateError::InvalidRequest("top_n must be at least 1".to_string()));
        }

        let flag = self.evaluate(scope, kpi_key, period, window).await?;
        let target = match (flag.flag, flag.threshold_value) {
            (Flag::Warn | Flag::Alert, Some(target)) => target,
            (other, _) => {
                info!(tenant = %scope, kpi = kpi_key, period = %period, flag = %other, "Period not flagged, skipping RCA");
                return Ok(Ranking::NotFlagged(other));
            }
        };

        let query = ReadingQuery {
            kpi_key: kpi_key.to_string(),
            from: period.start_date(),
            to: period.end_date(),
            dimension_filter: None,
        };
        let readings: Vec<KpiReading> = self
            .fetch_readings(scope, &query)
            .await?
            .into_iter()
            .filter(|r| r.period_key.bucket_for(window) == Some(period))
            .collect();

        let request = RankRequest {
            kpi_key,
            period,
            window,
            dimension_key,
            target,
            top_n,
            min_samples: self.config().rca.min_samples,
        };

        let ranking = rank(&request, &readings);
        match &ranking {
            Ranking::Ranked(contributors) => {
                self.bounded(
                    "replace_contributors",
                    self.store().replace_contributors(
                        scope,
                        kpi_key,
                        period,
                        window,
                        dimension_key,
                        contributors,
                    ),
                )
                .await?;
                info!(
                    tenant = %scope,
                    kpi = kpi_key,
                    period = %period,
                    dimension = dimension_key,
                    contributors = contributors.len(),
                    "Ranked contributors"
                );
            }
            Ranking::InsufficientSamples { have, need } => {
                warn!(tenant = %scope, kpi = kpi_key, period = %period, have, need, "Too few samples for RCA");
            }
            Ranking::NotFlagged(_) => {}
        }
        Ok(ranking)
    }
}
