use chrono::Utc;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{GateError, Result};
use crate::models::{Flag, KpiTarget, MonthlyFlag, Scope};
use crate::period::{PeriodKey, Window};

/// Flag plus the adverse deviation it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub flag: Flag,
    pub adverse_deviation: Option<f64>,
}

/// Classifies a period value against its target.
///
/// Precedence: missing target or value is `no_ref`; then the alert band
/// (`warn_band * multiplier`), then the warn band, both inclusive. Only
/// deviation in the KPI's adverse direction counts.
pub fn classify(value: Option<f64>, target: Option<&KpiTarget>, default_multiplier: f64) -> Assessment {
    let (Some(value), Some(target)) = (value.filter(|v| v.is_finite()), target) else {
        return Assessment {
            flag: Flag::NoRef,
            adverse_deviation: None,
        };
    };

    let adverse = target.direction.adverse_deviation(value, target.target_value);
    let warn_band = target.warn_band.abs();
    let multiplier = target
        .alert_band_multiplier
        .filter(|m| m.is_finite() && *m >= 1.0)
        .unwrap_or(default_multiplier);
    let alert_band = warn_band * multiplier;

    let flag = if adverse <= 0.0 {
        Flag::Ok
    } else if adverse >= alert_band {
        Flag::Alert
    } else if adverse >= warn_band {
        Flag::Warn
    } else {
        Flag::Ok
    };

    Assessment {
        flag,
        adverse_deviation: Some(adverse),
    }
}

impl Engine {
    /// Flags one period of a KPI and stores the result.
    pub async fn evaluate(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<MonthlyFlag> {
        if period.granularity() != window {
            return Err(GateError::InvalidRange(format!(
                "{period} is not a {window} period"
            )));
        }

        let point = self
            .aggregate(scope, kpi_key, window, period, period)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GateError::InvalidRange(format!("no trend point for {period}")))?;
        let target = self.target(scope, kpi_key).await?;

        let assessment = classify(
            point.aggregate_value,
            target.as_ref(),
            self.config().flags.default_alert_band_multiplier,
        );
        if assessment.flag == Flag::NoRef {
            warn!(
                tenant = %scope,
                kpi = kpi_key,
                period = %period,
                has_target = target.is_some(),
                samples = point.sample_count,
                "No reference for flag"
            );
        }

        let flag = MonthlyFlag {
            kpi_key: kpi_key.to_string(),
            period_key: period,
            flag: assessment.flag,
            metric_value: point.aggregate_value,
            threshold_value: target.as_ref().map(|t| t.target_value),
            adverse_deviation: assessment.adverse_deviation,
            trend_window: window,
            computed_at: Utc::now(),
        };
        self.bounded("upsert_flag", self.store().upsert_flag(scope, &flag))
            .await?;

        info!(
            tenant = %scope,
            kpi = kpi_key,
            period = %period,
            window = %window,
            flag = %flag.flag,
            "Evaluated flag"
        );
        Ok(flag)
    }
}
