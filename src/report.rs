use std::fmt::Write;

use uuid::Uuid;

use crate::calibration::CalibrationReport;
use crate::engine::Engine;
use crate::error::{GateError, Result};
use crate::models::{MonthlyFlag, QuarterlyInsight, RcaTopContributor, Recommendation, Scope};
use crate::period::{PeriodKey, Window};

/// Everything shown in a monthly gate report.
#[derive(Debug, Clone, Default)]
pub struct ReportInput<'a> {
    pub flags: &'a [MonthlyFlag],
    pub contributors: &'a [RcaTopContributor],
    pub recommendations: &'a [Recommendation],
    pub insights: &'a [QuarterlyInsight],
    pub calibration: Option<&'a CalibrationReport>,
}

fn value_or_dash(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

pub fn build_report(scope: &Scope, month: PeriodKey, input: &ReportInput<'_>) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# KPI Gate Report");
    let _ = writeln!(output, "Generated for {} (month {})", scope, month);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Flags");

    if input.flags.is_empty() {
        let _ = writeln!(output, "No flags evaluated for this month.");
    } else {
        let mut flags: Vec<&MonthlyFlag> = input.flags.iter().collect();
        flags.sort_by(|a, b| {
            b.flag
                .priority()
                .cmp(&a.flag.priority())
                .then_with(|| a.kpi_key.cmp(&b.kpi_key))
        });
        for flag in flags {
            let _ = writeln!(
                output,
                "- {}: {} (value {}, target {})",
                flag.kpi_key,
                flag.flag,
                value_or_dash(flag.metric_value),
                value_or_dash(flag.threshold_value)
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Contributors");

    if input.contributors.is_empty() {
        let _ = writeln!(output, "No contributors ranked for this month.");
    } else {
        for contributor in input.contributors {
            let _ = writeln!(
                output,
                "- {} #{} {} share {:+.2} across {} readings",
                contributor.kpi_key,
                contributor.rank,
                contributor.label(),
                contributor.impact_share,
                contributor.sample_count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recommendations");

    if input.recommendations.is_empty() {
        let _ = writeln!(output, "No recommendations for this month.");
    } else {
        for recommendation in input.recommendations {
            let _ = writeln!(
                output,
                "{}. [{}] {}",
                recommendation.priority, recommendation.severity, recommendation.action
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Quarter {}-Q{}", month.year(), month.quarter_number());

    if input.insights.is_empty() {
        let _ = writeln!(output, "No quarterly insights generated.");
    } else {
        for insight in input.insights {
            let _ = writeln!(output, "- {}", insight.summary);
        }
    }

    if let Some(calibration) = input.calibration {
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "## Calibration v{} ({})",
            calibration.run.model_version,
            calibration.run.overall_status.as_str()
        );
        for cell in &calibration.cells {
            let _ = writeln!(
                output,
                "- {} vs {}: r {:+.2} (p {:.3}, n {}, residual {:.2})",
                cell.activity_dimension,
                cell.outcome_metric,
                cell.observed_correlation,
                cell.p_value,
                cell.sample_size,
                cell.residual
            );
        }
        for suggestion in &calibration.suggestions {
            let _ = writeln!(
                output,
                "- weight {}: {:.2} -> {:.2} [{}]",
                suggestion.activity_dimension,
                suggestion.current_weight,
                suggestion.suggested_weight,
                suggestion.suggestion_status.as_str()
            );
        }
    }

    output
}

impl Engine {
    /// Renders the stored results of `month`, plus a calibration run if given.
    /// Reads only; nothing is recomputed.
    pub async fn monthly_report(
        &self,
        scope: &Scope,
        month: PeriodKey,
        calibration_run: Option<Uuid>,
    ) -> Result<String> {
        if month.granularity() != Window::Monthly {
            return Err(GateError::InvalidRange(format!("{month} is not a month")));
        }

        let flags = self
            .bounded("list_flags", self.store().list_flags(scope, Window::Monthly, &[month]))
            .await?;
        let mut contributors = Vec::new();
        for flag in flags.iter().filter(|f| f.flag.is_flagged()) {
            contributors.extend(
                self.bounded(
                    "list_contributors",
                    self.store()
                        .list_contributors(scope, &flag.kpi_key, month, Window::Monthly),
                )
                .await?,
            );
        }
        let recommendations = self
            .bounded("list_recommendations", self.store().list_recommendations(scope, month))
            .await?;
        let insights = self
            .bounded(
                "list_quarterly_insights",
                self.store()
                    .list_quarterly_insights(scope, month.year(), month.quarter_number()),
            )
            .await?;
        let calibration = match calibration_run {
            Some(run_id) => Some(self.calibration_report(scope, run_id).await?),
            None => None,
        };

        Ok(build_report(
            scope,
            month,
            &ReportInput {
                flags: &flags,
                contributors: &contributors,
                recommendations: &recommendations,
                insights: &insights,
                calibration: calibration.as_ref(),
            },
        ))
    }
}
