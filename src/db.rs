//! Postgres backend.

use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::error::GateError;
use crate::models::{
    CalibrationCell, CalibrationRun, Direction, KpiReading, KpiTarget, MonthlyFlag,
    QuarterlyInsight, RcaTopContributor, Recommendation, RunStatus, Scope, SuggestionStatus,
    TrendPoint, UpsertOutcome, WeightSuggestion,
};
use crate::period::{PeriodKey, Window};
use crate::store::{GateStore, Page, ReadingPage, ReadingQuery, ReadingSource, StoreError, TargetSource};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SEED_DEPARTMENTS: [&str; 4] = ["finance", "it", "operations", "sales"];
const SEED_REACH: [f64; 12] = [
    120.0, 340.0, 210.0, 450.0, 180.0, 390.0, 260.0, 300.0, 150.0, 420.0, 230.0, 360.0,
];

/// Loads a year of department-tagged readings and targets for `scope`.
pub async fn seed(pool: &PgPool, scope: &Scope) -> anyhow::Result<usize> {
    let targets = [
        ("incident_rate", 5.0, Direction::LowerIsBetter, 2.0, None),
        ("phishing_click_rate", 8.0, Direction::LowerIsBetter, 2.0, Some(2.0)),
        ("training_completion", 85.0, Direction::HigherIsBetter, 5.0, None),
    ];

    for (kpi_key, target_value, direction, warn_band, multiplier) in targets {
        sqlx::query(
            r#"
            INSERT INTO kpi_gate.kpi_targets
            (tenant, kpi_key, target_value, direction, warn_band, alert_band_multiplier)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant, kpi_key) DO UPDATE
            SET target_value = EXCLUDED.target_value,
                direction = EXCLUDED.direction,
                warn_band = EXCLUDED.warn_band,
                alert_band_multiplier = EXCLUDED.alert_band_multiplier
            "#,
        )
        .bind(scope.as_str())
        .bind(kpi_key)
        .bind(target_value)
        .bind(direction.as_str())
        .bind(warn_band)
        .bind(multiplier)
        .execute(pool)
        .await?;
    }

    let mut month = PeriodKey::month(2024, 1).context("invalid seed month")?;
    let mut inserted = 0usize;

    for (i, reach) in SEED_REACH.iter().enumerate() {
        for (j, department) in SEED_DEPARTMENTS.iter().enumerate() {
            let training = 55.0 + 3.0 * i as f64 + 2.0 * j as f64;
            let campaign_reach = reach + 10.0 * j as f64;
            let spike = match (*department, i) {
                ("sales", 9) => 10.0,
                ("sales", 10) => 30.0,
                _ => 0.0,
            };
            let incidents = 12.0 - 0.08 * training - 0.01 * campaign_reach + 0.3 * j as f64 + spike;
            let phishing = 18.0 - 0.15 * training + 0.5 * j as f64;

            for (kpi_key, value) in [
                ("incident_rate", incidents),
                ("phishing_click_rate", phishing),
                ("training_completion", training),
                ("campaign_reach", campaign_reach),
            ] {
                let tags = serde_json::json!({ "department": department });
                let result = sqlx::query(
                    r#"
                    INSERT INTO kpi_gate.kpi_readings
                    (id, tenant, kpi_key, period_key, anchor_date, value, dimension_tags, source_key)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (source_key) DO NOTHING
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(scope.as_str())
                .bind(kpi_key)
                .bind(month.to_string())
                .bind(month.anchor_date())
                .bind(value)
                .bind(tags)
                .bind(format!("seed-{scope}-{kpi_key}-{month}-{department}"))
                .execute(pool)
                .await?;

                if result.rows_affected() > 0 {
                    inserted += 1;
                }
            }
        }
        month = month.next().context("seed month overflow")?;
    }

    Ok(inserted)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => StoreError::Unavailable(err.to_string()),
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Decode(err.to_string()),
        other => StoreError::Backend(other.to_string()),
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column).map_err(map_sqlx)
}

fn parse<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = GateError>,
{
    let raw: String = get(row, column)?;
    raw.parse()
        .map_err(|err: GateError| StoreError::Decode(format!("{column}: {err}")))
}

fn count(row: &PgRow, column: &str) -> Result<u32, StoreError> {
    let raw: i32 = get(row, column)?;
    u32::try_from(raw).map_err(|_| StoreError::Decode(format!("{column}: negative count {raw}")))
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Backend(format!("{column}: {value} out of range")))
}

/// Maps a JSONB tag object to string tags. Scalars are stringified and
/// nulls dropped; nested values are rejected.
pub fn tags_from_json(value: serde_json::Value) -> Result<BTreeMap<String, String>, StoreError> {
    let serde_json::Value::Object(object) = value else {
        return Err(StoreError::Decode("dimension_tags is not an object".to_string()));
    };

    let mut tags = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => s,
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                return Err(StoreError::Decode(format!("dimension tag {key} is not a scalar")));
            }
        };
        tags.insert(key, text);
    }
    Ok(tags)
}

fn upsert_outcome(row: Option<PgRow>) -> Result<UpsertOutcome, StoreError> {
    match row {
        None => Ok(UpsertOutcome::Stale),
        Some(row) => {
            let inserted: bool = get(&row, "inserted")?;
            Ok(if inserted {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::Updated
            })
        }
    }
}

fn reading_from_row(row: &PgRow) -> Result<KpiReading, StoreError> {
    Ok(KpiReading {
        kpi_key: get(row, "kpi_key")?,
        period_key: parse(row, "period_key")?,
        value: get(row, "value")?,
        dimension_tags: tags_from_json(get(row, "dimension_tags")?)?,
    })
}

fn target_from_row(row: &PgRow) -> Result<KpiTarget, StoreError> {
    Ok(KpiTarget {
        target_value: get(row, "target_value")?,
        direction: parse(row, "direction")?,
        warn_band: get(row, "warn_band")?,
        alert_band_multiplier: get(row, "alert_band_multiplier")?,
    })
}

fn trend_point_from_row(row: &PgRow) -> Result<TrendPoint, StoreError> {
    Ok(TrendPoint {
        kpi_key: get(row, "kpi_key")?,
        window: parse(row, "trend_window")?,
        period_key: parse(row, "period_key")?,
        aggregate_value: get(row, "aggregate_value")?,
        sample_count: count(row, "sample_count")?,
        prior_period_value: get(row, "prior_period_value")?,
        computed_at: get(row, "computed_at")?,
    })
}

fn flag_from_row(row: &PgRow) -> Result<MonthlyFlag, StoreError> {
    Ok(MonthlyFlag {
        kpi_key: get(row, "kpi_key")?,
        period_key: parse(row, "period_key")?,
        flag: parse(row, "flag")?,
        metric_value: get(row, "metric_value")?,
        threshold_value: get(row, "threshold_value")?,
        adverse_deviation: get(row, "adverse_deviation")?,
        trend_window: parse(row, "trend_window")?,
        computed_at: get(row, "computed_at")?,
    })
}

fn contributor_from_row(row: &PgRow) -> Result<RcaTopContributor, StoreError> {
    Ok(RcaTopContributor {
        kpi_key: get(row, "kpi_key")?,
        period_key: parse(row, "period_key")?,
        window: parse(row, "trend_window")?,
        dimension_key: get(row, "dimension_key")?,
        dimension_value: get(row, "dimension_value")?,
        impact_share: get(row, "impact_share")?,
        sample_count: count(row, "sample_count")?,
        rank: count(row, "rank")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<CalibrationRun, StoreError> {
    Ok(CalibrationRun {
        id: get(row, "id")?,
        scope: Scope::new(get::<String>(row, "tenant")?),
        model_version: get(row, "model_version")?,
        outcome_metric: get(row, "outcome_metric")?,
        period_start: parse(row, "period_start")?,
        period_end: parse(row, "period_end")?,
        overall_status: parse(row, "overall_status")?,
        created_at: get(row, "created_at")?,
        completed_at: get(row, "completed_at")?,
    })
}

fn cell_from_row(row: &PgRow) -> Result<CalibrationCell, StoreError> {
    Ok(CalibrationCell {
        calibration_run_id: get(row, "run_id")?,
        activity_dimension: get(row, "activity_dimension")?,
        outcome_metric: get(row, "outcome_metric")?,
        observed_correlation: get(row, "observed_correlation")?,
        p_value: get(row, "p_value")?,
        sample_size: count(row, "sample_size")?,
        residual: get(row, "residual")?,
    })
}

fn suggestion_from_row(row: &PgRow) -> Result<WeightSuggestion, StoreError> {
    Ok(WeightSuggestion {
        id: get(row, "id")?,
        calibration_run_id: get(row, "run_id")?,
        activity_dimension: get(row, "activity_dimension")?,
        current_weight: get(row, "current_weight")?,
        suggested_weight: get(row, "suggested_weight")?,
        suggestion_status: parse(row, "suggestion_status")?,
        decided_by: get(row, "decided_by")?,
        decided_at: get(row, "decided_at")?,
    })
}

fn insight_from_row(row: &PgRow) -> Result<QuarterlyInsight, StoreError> {
    let contributors: serde_json::Value = get(row, "top_contributors")?;
    Ok(QuarterlyInsight {
        scope: Scope::new(get::<String>(row, "tenant")?),
        year: get(row, "year")?,
        quarter: count(row, "quarter")?,
        kpi_key: get(row, "kpi_key")?,
        worst_flag: parse(row, "worst_flag")?,
        flagged_months: count(row, "flagged_months")?,
        mean_value: get(row, "mean_value")?,
        top_contributors: serde_json::from_value(contributors)
            .map_err(|err| StoreError::Decode(format!("top_contributors: {err}")))?,
        summary: get(row, "summary")?,
        computed_at: get(row, "computed_at")?,
    })
}

fn recommendation_from_row(row: &PgRow) -> Result<Recommendation, StoreError> {
    Ok(Recommendation {
        scope: Scope::new(get::<String>(row, "tenant")?),
        month: parse(row, "month")?,
        kpi_key: get(row, "kpi_key")?,
        priority: count(row, "priority")?,
        severity: parse(row, "severity")?,
        focus: get(row, "focus")?,
        action: get(row, "action")?,
        computed_at: get(row, "computed_at")?,
    })
}

const RUN_COLUMNS: &str = "id, tenant, model_version, outcome_metric, period_start, period_end, \
                           overall_status, created_at, completed_at";

#[async_trait]
impl ReadingSource for PgStore {
    async fn list_readings_page(
        &self,
        scope: &Scope,
        query: &ReadingQuery,
        page: Page,
    ) -> Result<ReadingPage, StoreError> {
        let limit = i64::from(page.limit.max(1));
        let (filter_key, filter_value) = match &query.dimension_filter {
            Some((key, value)) => (Some(key.as_str()), Some(value.as_str())),
            None => (None, None),
        };

        // One extra row tells whether another page exists.
        let rows = sqlx::query(
            r#"
            SELECT kpi_key, period_key, value, dimension_tags
            FROM kpi_gate.kpi_readings
            WHERE tenant = $1
              AND kpi_key = $2
              AND anchor_date BETWEEN $3 AND $4
              AND ($5::text IS NULL OR dimension_tags ->> $5 = $6)
            ORDER BY anchor_date, period_key, id
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(scope.as_str())
        .bind(&query.kpi_key)
        .bind(query.from)
        .bind(query.to)
        .bind(filter_key)
        .bind(filter_value)
        .bind(limit + 1)
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let has_more = rows.len() as i64 > limit;
        let readings = rows
            .iter()
            .take(limit as usize)
            .map(reading_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let next_offset = has_more.then(|| page.offset + readings.len() as u32);

        Ok(ReadingPage {
            readings,
            next_offset,
        })
    }
}

#[async_trait]
impl TargetSource for PgStore {
    async fn get_kpi_target(
        &self,
        scope: &Scope,
        kpi_key: &str,
    ) -> Result<Option<KpiTarget>, StoreError> {
        let row = sqlx::query(
            "SELECT target_value, direction, warn_band, alert_band_multiplier \
             FROM kpi_gate.kpi_targets WHERE tenant = $1 AND kpi_key = $2",
        )
        .bind(scope.as_str())
        .bind(kpi_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(target_from_row).transpose()
    }
}

#[async_trait]
impl GateStore for PgStore {
    async fn upsert_trend_point(
        &self,
        scope: &Scope,
        point: &TrendPoint,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO kpi_gate.trend_points AS t
            (tenant, kpi_key, trend_window, period_key, aggregate_value, sample_count,
             prior_period_value, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant, kpi_key, trend_window, period_key) DO UPDATE
            SET aggregate_value = EXCLUDED.aggregate_value,
                sample_count = EXCLUDED.sample_count,
                prior_period_value = EXCLUDED.prior_period_value,
                computed_at = EXCLUDED.computed_at
            WHERE t.computed_at <= EXCLUDED.computed_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(scope.as_str())
        .bind(&point.kpi_key)
        .bind(point.window.as_str())
        .bind(point.period_key.to_string())
        .bind(point.aggregate_value)
        .bind(to_i32(point.sample_count, "sample_count")?)
        .bind(point.prior_period_value)
        .bind(point.computed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        upsert_outcome(row)
    }

    async fn get_trend_point(
        &self,
        scope: &Scope,
        kpi_key: &str,
        window: Window,
        period: PeriodKey,
    ) -> Result<Option<TrendPoint>, StoreError> {
        let row = sqlx::query(
            "SELECT kpi_key, trend_window, period_key, aggregate_value, sample_count, \
             prior_period_value, computed_at FROM kpi_gate.trend_points \
             WHERE tenant = $1 AND kpi_key = $2 AND trend_window = $3 AND period_key = $4",
        )
        .bind(scope.as_str())
        .bind(kpi_key)
        .bind(window.as_str())
        .bind(period.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(trend_point_from_row).transpose()
    }

    async fn upsert_flag(
        &self,
        scope: &Scope,
        flag: &MonthlyFlag,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO kpi_gate.monthly_flags AS f
            (tenant, kpi_key, period_key, trend_window, flag, metric_value, threshold_value,
             adverse_deviation, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant, kpi_key, period_key, trend_window) DO UPDATE
            SET flag = EXCLUDED.flag,
                metric_value = EXCLUDED.metric_value,
                threshold_value = EXCLUDED.threshold_value,
                adverse_deviation = EXCLUDED.adverse_deviation,
                computed_at = EXCLUDED.computed_at
            WHERE f.computed_at <= EXCLUDED.computed_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(scope.as_str())
        .bind(&flag.kpi_key)
        .bind(flag.period_key.to_string())
        .bind(flag.trend_window.as_str())
        .bind(flag.flag.as_str())
        .bind(flag.metric_value)
        .bind(flag.threshold_value)
        .bind(flag.adverse_deviation)
        .bind(flag.computed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        upsert_outcome(row)
    }

    async fn get_flag(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<Option<MonthlyFlag>, StoreError> {
        let row = sqlx::query(
            "SELECT kpi_key, period_key, trend_window, flag, metric_value, threshold_value, \
             adverse_deviation, computed_at FROM kpi_gate.monthly_flags \
             WHERE tenant = $1 AND kpi_key = $2 AND period_key = $3 AND trend_window = $4",
        )
        .bind(scope.as_str())
        .bind(kpi_key)
        .bind(period.to_string())
        .bind(window.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(flag_from_row).transpose()
    }

    async fn list_flags(
        &self,
        scope: &Scope,
        window: Window,
        periods: &[PeriodKey],
    ) -> Result<Vec<MonthlyFlag>, StoreError> {
        let periods: Vec<String> = periods.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            "SELECT kpi_key, period_key, trend_window, flag, metric_value, threshold_value, \
             adverse_deviation, computed_at FROM kpi_gate.monthly_flags \
             WHERE tenant = $1 AND trend_window = $2 AND period_key = ANY($3) \
             ORDER BY kpi_key, period_key",
        )
        .bind(scope.as_str())
        .bind(window.as_str())
        .bind(&periods)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(flag_from_row).collect()
    }

    async fn replace_contributors(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
        dimension_key: &str,
        contributors: &[RcaTopContributor],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "DELETE FROM kpi_gate.rca_top_contributors \
             WHERE tenant = $1 AND kpi_key = $2 AND period_key = $3 \
             AND trend_window = $4 AND dimension_key = $5",
        )
        .bind(scope.as_str())
        .bind(kpi_key)
        .bind(period.to_string())
        .bind(window.as_str())
        .bind(dimension_key)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for contributor in contributors {
            sqlx::query(
                r#"
                INSERT INTO kpi_gate.rca_top_contributors
                (tenant, kpi_key, period_key, trend_window, dimension_key, dimension_value,
                 impact_share, sample_count, rank)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(scope.as_str())
            .bind(kpi_key)
            .bind(period.to_string())
            .bind(window.as_str())
            .bind(dimension_key)
            .bind(&contributor.dimension_value)
            .bind(contributor.impact_share)
            .bind(to_i32(contributor.sample_count, "sample_count")?)
            .bind(to_i32(contributor.rank, "rank")?)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)
    }

    async fn list_contributors(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<Vec<RcaTopContributor>, StoreError> {
        let rows = sqlx::query(
            "SELECT kpi_key, period_key, trend_window, dimension_key, dimension_value, \
             impact_share, sample_count, rank FROM kpi_gate.rca_top_contributors \
             WHERE tenant = $1 AND kpi_key = $2 AND period_key = $3 AND trend_window = $4 \
             ORDER BY dimension_key, rank",
        )
        .bind(scope.as_str())
        .bind(kpi_key)
        .bind(period.to_string())
        .bind(window.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(contributor_from_row).collect()
    }

    async fn create_calibration_run(
        &self,
        scope: &Scope,
        outcome_metric: &str,
        period_start: PeriodKey,
        period_end: PeriodKey,
        created_at: DateTime<Utc>,
    ) -> Result<CalibrationRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // Serializes version allocation per tenant until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(scope.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO kpi_gate.calibration_runs
            (id, tenant, model_version, outcome_metric, period_start, period_end,
             overall_status, created_at)
            SELECT $1, $2, COALESCE(MAX(model_version), 0) + 1, $3, $4, $5, 'pending', $6
            FROM kpi_gate.calibration_runs
            WHERE tenant = $2
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(scope.as_str())
        .bind(outcome_metric)
        .bind(period_start.to_string())
        .bind(period_end.to_string())
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let run = run_from_row(&row)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(run)
    }

    async fn get_calibration_run(
        &self,
        scope: &Scope,
        id: Uuid,
    ) -> Result<Option<CalibrationRun>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM kpi_gate.calibration_runs WHERE id = $1 AND tenant = $2"
        ))
        .bind(id)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn complete_calibration_run(
        &self,
        scope: &Scope,
        id: Uuid,
        status: RunStatus,
        cells: &[CalibrationCell],
        suggestions: &[WeightSuggestion],
        completed_at: DateTime<Utc>,
    ) -> Result<CalibrationRun, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let updated = sqlx::query(&format!(
            "UPDATE kpi_gate.calibration_runs SET overall_status = $3, completed_at = $4 \
             WHERE id = $1 AND tenant = $2 AND overall_status = 'pending' \
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(id)
        .bind(scope.as_str())
        .bind(status.as_str())
        .bind(completed_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = updated else {
            let current = sqlx::query(
                "SELECT overall_status FROM kpi_gate.calibration_runs WHERE id = $1 AND tenant = $2",
            )
            .bind(id)
            .bind(scope.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            return Err(match current {
                Some(row) => {
                    let status: RunStatus = parse(&row, "overall_status")?;
                    StoreError::Conflict(format!(
                        "calibration run {id} is already {}",
                        status.as_str()
                    ))
                }
                None => StoreError::NotFound(format!("calibration run {id}")),
            });
        };
        let run = run_from_row(&row)?;

        for cell in cells {
            sqlx::query(
                r#"
                INSERT INTO kpi_gate.calibration_cells
                (run_id, activity_dimension, outcome_metric, observed_correlation, p_value,
                 sample_size, residual)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(id)
            .bind(&cell.activity_dimension)
            .bind(&cell.outcome_metric)
            .bind(cell.observed_correlation)
            .bind(cell.p_value)
            .bind(to_i32(cell.sample_size, "sample_size")?)
            .bind(cell.residual)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        for suggestion in suggestions {
            sqlx::query(
                r#"
                INSERT INTO kpi_gate.weight_suggestions
                (id, run_id, activity_dimension, current_weight, suggested_weight,
                 suggestion_status, decided_by, decided_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(suggestion.id)
            .bind(id)
            .bind(&suggestion.activity_dimension)
            .bind(suggestion.current_weight)
            .bind(suggestion.suggested_weight)
            .bind(suggestion.suggestion_status.as_str())
            .bind(suggestion.decided_by.as_deref())
            .bind(suggestion.decided_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        tx.commit().await.map_err(map_sqlx)?;
        Ok(run)
    }

    async fn list_calibration_cells(
        &self,
        scope: &Scope,
        run_id: Uuid,
    ) -> Result<Vec<CalibrationCell>, StoreError> {
        let rows = sqlx::query(
            "SELECT c.run_id, c.activity_dimension, c.outcome_metric, c.observed_correlation, \
             c.p_value, c.sample_size, c.residual \
             FROM kpi_gate.calibration_cells c \
             JOIN kpi_gate.calibration_runs r ON r.id = c.run_id \
             WHERE c.run_id = $1 AND r.tenant = $2 \
             ORDER BY c.activity_dimension",
        )
        .bind(run_id)
        .bind(scope.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(cell_from_row).collect()
    }

    async fn list_weight_suggestions(
        &self,
        scope: &Scope,
        run_id: Uuid,
    ) -> Result<Vec<WeightSuggestion>, StoreError> {
        let rows = sqlx::query(
            "SELECT w.id, w.run_id, w.activity_dimension, w.current_weight, w.suggested_weight, \
             w.suggestion_status, w.decided_by, w.decided_at \
             FROM kpi_gate.weight_suggestions w \
             JOIN kpi_gate.calibration_runs r ON r.id = w.run_id \
             WHERE w.run_id = $1 AND r.tenant = $2 \
             ORDER BY w.activity_dimension",
        )
        .bind(run_id)
        .bind(scope.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(suggestion_from_row).collect()
    }

    async fn decide_weight_suggestion(
        &self,
        scope: &Scope,
        id: Uuid,
        status: SuggestionStatus,
        decided_by: &str,
        decided_at: DateTime<Utc>,
    ) -> Result<WeightSuggestion, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE kpi_gate.weight_suggestions w
            SET suggestion_status = $3, decided_by = $4, decided_at = $5
            FROM kpi_gate.calibration_runs r
            WHERE w.id = $1 AND r.id = w.run_id AND r.tenant = $2
              AND w.suggestion_status = 'pending'
            RETURNING w.id, w.run_id, w.activity_dimension, w.current_weight,
                      w.suggested_weight, w.suggestion_status, w.decided_by, w.decided_at
            "#,
        )
        .bind(id)
        .bind(scope.as_str())
        .bind(status.as_str())
        .bind(decided_by)
        .bind(decided_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if let Some(row) = updated {
            return suggestion_from_row(&row);
        }

        let current = sqlx::query(
            "SELECT w.suggestion_status FROM kpi_gate.weight_suggestions w \
             JOIN kpi_gate.calibration_runs r ON r.id = w.run_id \
             WHERE w.id = $1 AND r.tenant = $2",
        )
        .bind(id)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Err(match current {
            Some(row) => {
                let status: SuggestionStatus = parse(&row, "suggestion_status")?;
                StoreError::Conflict(format!(
                    "weight suggestion {id} is already {}",
                    status.as_str()
                ))
            }
            None => StoreError::NotFound(format!("weight suggestion {id}")),
        })
    }

    async fn delete_calibration_run(&self, scope: &Scope, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM kpi_gate.calibration_runs WHERE id = $1 AND tenant = $2")
            .bind(id)
            .bind(scope.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_quarterly_insight(
        &self,
        insight: &QuarterlyInsight,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO kpi_gate.quarterly_insights AS q
            (tenant, year, quarter, kpi_key, worst_flag, flagged_months, mean_value,
             top_contributors, summary, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tenant, year, quarter, kpi_key) DO UPDATE
            SET worst_flag = EXCLUDED.worst_flag,
                flagged_months = EXCLUDED.flagged_months,
                mean_value = EXCLUDED.mean_value,
                top_contributors = EXCLUDED.top_contributors,
                summary = EXCLUDED.summary,
                computed_at = EXCLUDED.computed_at
            WHERE q.computed_at <= EXCLUDED.computed_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(insight.scope.as_str())
        .bind(insight.year)
        .bind(to_i32(insight.quarter, "quarter")?)
        .bind(&insight.kpi_key)
        .bind(insight.worst_flag.as_str())
        .bind(to_i32(insight.flagged_months, "flagged_months")?)
        .bind(insight.mean_value)
        .bind(serde_json::json!(insight.top_contributors))
        .bind(&insight.summary)
        .bind(insight.computed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        upsert_outcome(row)
    }

    async fn prune_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM kpi_gate.quarterly_insights \
             WHERE tenant = $1 AND year = $2 AND quarter = $3 AND NOT (kpi_key = ANY($4))",
        )
        .bind(scope.as_str())
        .bind(year)
        .bind(to_i32(quarter, "quarter")?)
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn list_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
    ) -> Result<Vec<QuarterlyInsight>, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant, year, quarter, kpi_key, worst_flag, flagged_months, mean_value, \
             top_contributors, summary, computed_at FROM kpi_gate.quarterly_insights \
             WHERE tenant = $1 AND year = $2 AND quarter = $3 ORDER BY kpi_key",
        )
        .bind(scope.as_str())
        .bind(year)
        .bind(to_i32(quarter, "quarter")?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(insight_from_row).collect()
    }

    async fn upsert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO kpi_gate.recommendations AS r
            (tenant, month, kpi_key, priority, severity, focus, action, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tenant, month, kpi_key) DO UPDATE
            SET priority = EXCLUDED.priority,
                severity = EXCLUDED.severity,
                focus = EXCLUDED.focus,
                action = EXCLUDED.action,
                computed_at = EXCLUDED.computed_at
            WHERE r.computed_at <= EXCLUDED.computed_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(recommendation.scope.as_str())
        .bind(recommendation.month.to_string())
        .bind(&recommendation.kpi_key)
        .bind(to_i32(recommendation.priority, "priority")?)
        .bind(recommendation.severity.as_str())
        .bind(recommendation.focus.as_deref())
        .bind(&recommendation.action)
        .bind(recommendation.computed_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        upsert_outcome(row)
    }

    async fn prune_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM kpi_gate.recommendations \
             WHERE tenant = $1 AND month = $2 AND NOT (kpi_key = ANY($3))",
        )
        .bind(scope.as_str())
        .bind(month.to_string())
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn list_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
    ) -> Result<Vec<Recommendation>, StoreError> {
        let rows = sqlx::query(
            "SELECT tenant, month, kpi_key, priority, severity, focus, action, computed_at \
             FROM kpi_gate.recommendations WHERE tenant = $1 AND month = $2 \
             ORDER BY priority, kpi_key",
        )
        .bind(scope.as_str())
        .bind(month.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(recommendation_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tags_keep_strings_and_stringify_scalars() {
        let tags = tags_from_json(json!({
            "department": "sales",
            "site": 12,
            "remote": true,
            "manager": null
        }))
        .unwrap();
        assert_eq!(tags.get("department").map(String::as_str), Some("sales"));
        assert_eq!(tags.get("site").map(String::as_str), Some("12"));
        assert_eq!(tags.get("remote").map(String::as_str), Some("true"));
        assert!(!tags.contains_key("manager"));
    }

    #[test]
    fn nested_or_non_object_tags_are_decode_errors() {
        assert!(matches!(
            tags_from_json(json!({ "department": { "name": "sales" } })),
            Err(StoreError::Decode(_))
        ));
        assert!(matches!(tags_from_json(json!(["sales"])), Err(StoreError::Decode(_))));
    }

    #[test]
    fn pool_timeouts_are_retryable() {
        assert!(matches!(map_sqlx(sqlx::Error::PoolTimedOut), StoreError::Unavailable(_)));
        assert!(matches!(map_sqlx(sqlx::Error::RowNotFound), StoreError::NotFound(_)));
        assert!(GateError::from_store("list_readings", map_sqlx(sqlx::Error::PoolTimedOut)).is_retryable());
    }
}
