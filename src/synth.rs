//! Quarterly insights and monthly recommendations built from stored flags
//! and contributors. Regenerating a period upserts its rows and prunes the
//! ones the latest generation left out.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use chrono::Utc;
use tracing::info;

use crate::engine::Engine;
use crate::error::{GateError, Result};
use crate::models::{
    Flag, GenerateInsightsResponse, MonthlyFlag, QuarterlyInsight, RcaTopContributor,
    Recommendation, Scope, UpsertOutcome,
};
use crate::period::{PeriodKey, Window};

/// Contributors named per insight.
const INSIGHT_CONTRIBUTORS: usize = 3;

/// Per-KPI digest of a set of monthly flags.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiDigest {
    pub kpi_key: String,
    pub worst_flag: Flag,
    pub flagged_periods: Vec<PeriodKey>,
    pub mean_value: Option<f64>,
    pub max_adverse_deviation: Option<f64>,
    pub latest: MonthlyFlag,
}

/// Groups flags by KPI and orders them most severe first: worst flag,
/// then largest adverse deviation, then KPI key.
pub fn prioritize(flags: &[MonthlyFlag]) -> Vec<KpiDigest> {
    let mut by_kpi: BTreeMap<&str, Vec<&MonthlyFlag>> = BTreeMap::new();
    for flag in flags {
        by_kpi.entry(flag.kpi_key.as_str()).or_default().push(flag);
    }

    let mut digests: Vec<KpiDigest> = by_kpi
        .into_iter()
        .filter_map(|(kpi_key, mut flags)| {
            flags.sort_by_key(|f| f.period_key);
            let latest = (*flags.last()?).clone();
            let worst_flag = flags
                .iter()
                .map(|f| f.flag)
                .max_by_key(Flag::priority)
                .unwrap_or(Flag::NoRef);
            let flagged_periods = flags
                .iter()
                .filter(|f| f.flag.is_flagged())
                .map(|f| f.period_key)
                .collect();
            let values: Vec<f64> = flags.iter().filter_map(|f| f.metric_value).collect();
            let mean_value = (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64);
            let max_adverse_deviation = flags
                .iter()
                .filter_map(|f| f.adverse_deviation)
                .max_by(f64::total_cmp);

            Some(KpiDigest {
                kpi_key: kpi_key.to_string(),
                worst_flag,
                flagged_periods,
                mean_value,
                max_adverse_deviation,
                latest,
            })
        })
        .collect();

    digests.sort_by(|a, b| {
        b.worst_flag
            .priority()
            .cmp(&a.worst_flag.priority())
            .then_with(|| match (a.max_adverse_deviation, b.max_adverse_deviation) {
                (Some(x), Some(y)) => y.total_cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.kpi_key.cmp(&b.kpi_key))
    });
    digests
}

/// Contributor labels by absolute impact, strongest first, without repeats.
fn strongest_labels(contributors: &[RcaTopContributor], limit: usize) -> Vec<String> {
    let mut sorted: Vec<&RcaTopContributor> = contributors.iter().collect();
    sorted.sort_by(|a, b| {
        b.impact_share
            .abs()
            .total_cmp(&a.impact_share.abs())
            .then_with(|| a.label().cmp(&b.label()))
    });

    let mut seen = BTreeSet::new();
    sorted
        .into_iter()
        .map(RcaTopContributor::label)
        .filter(|label| seen.insert(label.clone()))
        .take(limit)
        .collect()
}

fn insight_summary(digest: &KpiDigest, contributors: &[String]) -> String {
    let mut summary = String::new();
    let _ = write!(
        summary,
        "{}: worst flag {} with {} flagged month(s)",
        digest.kpi_key,
        digest.worst_flag,
        digest.flagged_periods.len()
    );
    if let Some(mean) = digest.mean_value {
        let _ = write!(summary, ", mean {mean:.2}");
    }
    if let Some(deviation) = digest.max_adverse_deviation.filter(|d| *d > 0.0) {
        let _ = write!(summary, ", peak adverse deviation {deviation:.2}");
    }
    if !contributors.is_empty() {
        let _ = write!(summary, "; driven by {}", contributors.join(", "));
    }
    summary
}

fn recommendation_action(digest: &KpiDigest, focus: Option<&str>) -> String {
    let flag = &digest.latest;
    let verb = match flag.flag {
        Flag::Alert => "Escalate",
        Flag::Warn => "Review",
        Flag::Ok | Flag::NoRef => "Monitor",
    };
    let mut action = format!("{verb} {}", flag.kpi_key);
    if let (Some(value), Some(target)) = (flag.metric_value, flag.threshold_value) {
        let _ = write!(action, ": {value:.2} against target {target:.2}");
    }
    if let Some(deviation) = flag.adverse_deviation {
        let _ = write!(action, " ({deviation:.2} on the adverse side)");
    }
    if let Some(focus) = focus {
        let _ = write!(action, ". Start with {focus}");
    }
    action
}

impl Engine {
    /// Writes one insight per KPI flagged in the quarter's months.
    pub async fn generate_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
        limit: usize,
    ) -> Result<GenerateInsightsResponse> {
        let quarter_key = PeriodKey::quarter(year, quarter)?;
        let _guard = self
            .lock_key(format!("insights:{scope}:{quarter_key}"))
            .await;

        let months = quarter_key.months();
        let flags = self
            .bounded("list_flags", self.store().list_flags(scope, Window::Monthly, &months))
            .await?;
        let mut digests = prioritize(&flags);
        digests.truncate(limit);

        let computed_at = Utc::now();
        let mut created = false;
        let mut initiatives = BTreeSet::new();
        let mut keep = Vec::with_capacity(digests.len());

        for digest in &digests {
            let mut contributors = Vec::new();
            for month in &digest.flagged_periods {
                contributors.extend(
                    self.bounded(
                        "list_contributors",
                        self.store()
                            .list_contributors(scope, &digest.kpi_key, *month, Window::Monthly),
                    )
                    .await?,
                );
            }
            let top_contributors = strongest_labels(&contributors, INSIGHT_CONTRIBUTORS);
            initiatives.extend(top_contributors.iter().cloned());

            let insight = QuarterlyInsight {
                scope: scope.clone(),
                year,
                quarter,
                kpi_key: digest.kpi_key.clone(),
                worst_flag: digest.worst_flag,
                flagged_months: digest.flagged_periods.len() as u32,
                mean_value: digest.mean_value,
                summary: insight_summary(digest, &top_contributors),
                top_contributors,
                computed_at,
            };
            let outcome = self
                .bounded("upsert_quarterly_insight", self.store().upsert_quarterly_insight(&insight))
                .await?;
            created |= outcome == UpsertOutcome::Inserted;
            keep.push(digest.kpi_key.clone());
        }

        let pruned = self
            .bounded(
                "prune_quarterly_insights",
                self.store().prune_quarterly_insights(scope, year, quarter, &keep),
            )
            .await?;

        let response = GenerateInsightsResponse {
            created,
            kpis_count: digests.len(),
            initiatives_count: initiatives.len(),
        };
        info!(
            tenant = %scope,
            quarter = %quarter_key,
            created = response.created,
            kpis = response.kpis_count,
            initiatives = response.initiatives_count,
            pruned,
            "Generated quarterly insights"
        );
        Ok(response)
    }

    /// Writes prioritized recommendations for the month's `warn`/`alert` KPIs
    /// and removes any left over from earlier generations. Returns the set size.
    pub async fn generate_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
        limit: usize,
    ) -> Result<usize> {
        if month.granularity() != Window::Monthly {
            return Err(GateError::InvalidRange(format!("{month} is not a month")));
        }
        let _guard = self
            .lock_key(format!("recommendations:{scope}:{month}"))
            .await;

        let flags = self
            .bounded("list_flags", self.store().list_flags(scope, Window::Monthly, &[month]))
            .await?;
        let mut digests: Vec<KpiDigest> = prioritize(&flags)
            .into_iter()
            .filter(|d| d.worst_flag.is_flagged())
            .collect();
        digests.truncate(limit);

        let computed_at = Utc::now();
        let mut keep = Vec::with_capacity(digests.len());
        for (idx, digest) in digests.iter().enumerate() {
            let contributors = self
                .bounded(
                    "list_contributors",
                    self.store()
                        .list_contributors(scope, &digest.kpi_key, month, Window::Monthly),
                )
                .await?;
            let focus = strongest_labels(&contributors, 1).into_iter().next();

            let recommendation = Recommendation {
                scope: scope.clone(),
                month,
                kpi_key: digest.kpi_key.clone(),
                priority: idx as u32 + 1,
                severity: digest.worst_flag,
                action: recommendation_action(digest, focus.as_deref()),
                focus,
                computed_at,
            };
            self.bounded("upsert_recommendation", self.store().upsert_recommendation(&recommendation))
                .await?;
            keep.push(digest.kpi_key.clone());
        }

        let pruned = self
            .bounded("prune_recommendations", self.store().prune_recommendations(scope, month, &keep))
            .await?;
        info!(
            tenant = %scope,
            month = %month,
            count = keep.len(),
            pruned,
            "Generated recommendations"
        );
        Ok(keep.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(kpi: &str, period: &str, flag: Flag, deviation: Option<f64>) -> MonthlyFlag {
        MonthlyFlag {
            kpi_key: kpi.to_string(),
            period_key: period.parse().unwrap(),
            flag,
            metric_value: deviation.map(|d| 5.0 + d),
            threshold_value: Some(5.0),
            adverse_deviation: deviation,
            trend_window: Window::Monthly,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn alerts_rank_ahead_of_warnings_then_by_deviation() {
        let flags = vec![
            flag("training_overdue", "2025-01", Flag::Warn, Some(9.0)),
            flag("incident_rate", "2025-01", Flag::Ok, Some(0.5)),
            flag("incident_rate", "2025-02", Flag::Alert, Some(4.0)),
            flag("phishing_click_rate", "2025-02", Flag::Alert, Some(6.0)),
            flag("policy_ack_rate", "2025-03", Flag::NoRef, None),
        ];
        let order: Vec<String> = prioritize(&flags).into_iter().map(|d| d.kpi_key).collect();
        assert_eq!(
            order,
            vec!["phishing_click_rate", "incident_rate", "training_overdue", "policy_ack_rate"]
        );
    }

    #[test]
    fn digest_tracks_flagged_months_and_mean() {
        let flags = vec![
            flag("incident_rate", "2025-01", Flag::Ok, Some(1.0)),
            flag("incident_rate", "2025-02", Flag::Warn, Some(2.0)),
            flag("incident_rate", "2025-03", Flag::Alert, Some(6.0)),
        ];
        let digest = &prioritize(&flags)[0];
        assert_eq!(digest.worst_flag, Flag::Alert);
        assert_eq!(digest.flagged_periods.len(), 2);
        assert_eq!(digest.mean_value, Some(8.0));
        assert_eq!(digest.latest.period_key.to_string(), "2025-03");
    }

    #[test]
    fn strongest_labels_dedupe_across_months() {
        let contributor = |value: &str, share: f64, period: &str| RcaTopContributor {
            kpi_key: "incident_rate".to_string(),
            period_key: period.parse().unwrap(),
            window: Window::Monthly,
            dimension_key: "department".to_string(),
            dimension_value: value.to_string(),
            impact_share: share,
            sample_count: 4,
            rank: 1,
        };
        let labels = strongest_labels(
            &[
                contributor("sales", 0.4, "2025-01"),
                contributor("sales", 0.7, "2025-02"),
                contributor("it", -0.5, "2025-02"),
            ],
            3,
        );
        assert_eq!(labels, vec!["department=sales", "department=it"]);
    }
}
