//! Boundary traits for readings, targets and derived records, plus the
//! in-memory backend. The Postgres backend lives in `db.rs`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    CalibrationCell, CalibrationRun, KpiReading, KpiTarget, MonthlyFlag, QuarterlyInsight,
    RcaTopContributor, Recommendation, RunStatus, Scope, SuggestionStatus, TrendPoint,
    UpsertOutcome, WeightSuggestion,
};
use crate::period::{PeriodKey, Window};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Timeout or connectivity failure; the caller may retry.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("row decode failed: {0}")]
    Decode(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Readings of one KPI whose period anchor falls within `[from, to]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingQuery {
    pub kpi_key: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    /// Only readings tagged `(dimension, value)`.
    pub dimension_filter: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ReadingPage {
    pub readings: Vec<KpiReading>,
    pub next_offset: Option<u32>,
}

#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// One page of readings ordered by period ascending.
    async fn list_readings_page(
        &self,
        scope: &Scope,
        query: &ReadingQuery,
        page: Page,
    ) -> Result<ReadingPage, StoreError>;
}

#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn get_kpi_target(
        &self,
        scope: &Scope,
        kpi_key: &str,
    ) -> Result<Option<KpiTarget>, StoreError>;
}

/// Persistence for derived entities.
///
/// Keyed upserts are last-write-wins on the record's computation timestamp:
/// an older computation never replaces a newer one.
#[async_trait]
pub trait GateStore: Send + Sync {
    async fn upsert_trend_point(
        &self,
        scope: &Scope,
        point: &TrendPoint,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_trend_point(
        &self,
        scope: &Scope,
        kpi_key: &str,
        window: Window,
        period: PeriodKey,
    ) -> Result<Option<TrendPoint>, StoreError>;

    async fn upsert_flag(&self, scope: &Scope, flag: &MonthlyFlag)
        -> Result<UpsertOutcome, StoreError>;

    async fn get_flag(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<Option<MonthlyFlag>, StoreError>;

    /// Flags of every KPI for the given periods.
    async fn list_flags(
        &self,
        scope: &Scope,
        window: Window,
        periods: &[PeriodKey],
    ) -> Result<Vec<MonthlyFlag>, StoreError>;

    /// Replaces the ranked set for `(kpi, period, window, dimension)`.
    async fn replace_contributors(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
        dimension_key: &str,
        contributors: &[RcaTopContributor],
    ) -> Result<(), StoreError>;

    /// Stored contributors across all dimensions, by dimension then rank.
    async fn list_contributors(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<Vec<RcaTopContributor>, StoreError>;

    /// Creates a pending run with the next model version for the tenant.
    /// Never merges concurrent requests.
    async fn create_calibration_run(
        &self,
        scope: &Scope,
        outcome_metric: &str,
        period_start: PeriodKey,
        period_end: PeriodKey,
        created_at: DateTime<Utc>,
    ) -> Result<CalibrationRun, StoreError>;

    async fn get_calibration_run(
        &self,
        scope: &Scope,
        id: Uuid,
    ) -> Result<Option<CalibrationRun>, StoreError>;

    /// Moves a pending run to a terminal status and attaches its output.
    /// Fails with `Conflict` if the run is no longer pending.
    async fn complete_calibration_run(
        &self,
        scope: &Scope,
        id: Uuid,
        status: RunStatus,
        cells: &[CalibrationCell],
        suggestions: &[WeightSuggestion],
        completed_at: DateTime<Utc>,
    ) -> Result<CalibrationRun, StoreError>;

    async fn list_calibration_cells(
        &self,
        scope: &Scope,
        run_id: Uuid,
    ) -> Result<Vec<CalibrationCell>, StoreError>;

    async fn list_weight_suggestions(
        &self,
        scope: &Scope,
        run_id: Uuid,
    ) -> Result<Vec<WeightSuggestion>, StoreError>;

    /// Records a human decision. Fails with `Conflict` unless the suggestion is pending.
    async fn decide_weight_suggestion(
        &self,
        scope: &Scope,
        id: Uuid,
        status: SuggestionStatus,
        decided_by: &str,
        decided_at: DateTime<Utc>,
    ) -> Result<WeightSuggestion, StoreError>;

    /// Deletes a run with its cells and suggestions. Returns false if absent.
    async fn delete_calibration_run(&self, scope: &Scope, id: Uuid) -> Result<bool, StoreError>;

    async fn upsert_quarterly_insight(
        &self,
        insight: &QuarterlyInsight,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Drops insights of the quarter whose KPI is not in `keep`.
    async fn prune_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
        keep: &[String],
    ) -> Result<u64, StoreError>;

    async fn list_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
    ) -> Result<Vec<QuarterlyInsight>, StoreError>;

    async fn upsert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Drops recommendations of `month` whose KPI is not in `keep`.
    async fn prune_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
        keep: &[String],
    ) -> Result<u64, StoreError>;

    async fn list_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
    ) -> Result<Vec<Recommendation>, StoreError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

type TrendKey = (Scope, String, Window, PeriodKey);
type FlagKey = (Scope, String, PeriodKey, Window);
type ContributorKey = (Scope, String, PeriodKey, Window, String);
type InsightKey = (Scope, i32, u32, String);
type RecommendationKey = (Scope, PeriodKey, String);

#[derive(Default)]
struct CalibrationTables {
    runs: HashMap<Uuid, CalibrationRun>,
    cells: HashMap<Uuid, Vec<CalibrationCell>>,
    suggestions: HashMap<Uuid, Vec<WeightSuggestion>>,
}

/// Thread-safe store backed by hash maps. Not durable.
#[derive(Default)]
pub struct InMemoryStore {
    readings: RwLock<Vec<(Scope, KpiReading)>>,
    targets: RwLock<HashMap<(Scope, String), KpiTarget>>,
    trends: RwLock<HashMap<TrendKey, TrendPoint>>,
    flags: RwLock<HashMap<FlagKey, MonthlyFlag>>,
    contributors: RwLock<HashMap<ContributorKey, Vec<RcaTopContributor>>>,
    calibration: RwLock<CalibrationTables>,
    insights: RwLock<HashMap<InsightKey, QuarterlyInsight>>,
    recommendations: RwLock<HashMap<RecommendationKey, Recommendation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_reading(&self, scope: &Scope, reading: KpiReading) {
        write(&self.readings).push((scope.clone(), reading));
    }

    pub fn set_target(&self, scope: &Scope, kpi_key: &str, target: KpiTarget) {
        write(&self.targets).insert((scope.clone(), kpi_key.to_string()), target);
    }

    pub fn remove_target(&self, scope: &Scope, kpi_key: &str) {
        write(&self.targets).remove(&(scope.clone(), kpi_key.to_string()));
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn upsert_newer<K, V>(
    map: &mut HashMap<K, V>,
    key: K,
    value: V,
    stamp: impl Fn(&V) -> DateTime<Utc>,
) -> UpsertOutcome
where
    K: Eq + Hash,
{
    match map.get(&key) {
        Some(existing) if stamp(existing) > stamp(&value) => UpsertOutcome::Stale,
        Some(_) => {
            map.insert(key, value);
            UpsertOutcome::Updated
        }
        None => {
            map.insert(key, value);
            UpsertOutcome::Inserted
        }
    }
}

#[async_trait]
impl ReadingSource for InMemoryStore {
    async fn list_readings_page(
        &self,
        scope: &Scope,
        query: &ReadingQuery,
        page: Page,
    ) -> Result<ReadingPage, StoreError> {
        let readings = read(&self.readings);
        let mut matching: Vec<&KpiReading> = readings
            .iter()
            .filter(|(owner, reading)| {
                let anchor = reading.period_key.anchor_date();
                owner == scope
                    && reading.kpi_key == query.kpi_key
                    && anchor >= query.from
                    && anchor <= query.to
                    && query.dimension_filter.as_ref().map_or(true, |(key, value)| {
                        reading.dimension_tags.get(key) == Some(value)
                    })
            })
            .map(|(_, reading)| reading)
            .collect();
        matching.sort_by_key(|reading| (reading.period_key.anchor_date(), reading.period_key));

        let offset = page.offset as usize;
        let limit = page.limit.max(1) as usize;
        let slice: Vec<KpiReading> = matching.iter().skip(offset).take(limit).map(|r| (*r).clone()).collect();
        let next_offset = (offset + slice.len() < matching.len()).then(|| (offset + slice.len()) as u32);

        Ok(ReadingPage {
            readings: slice,
            next_offset,
        })
    }
}

#[async_trait]
impl TargetSource for InMemoryStore {
    async fn get_kpi_target(
        &self,
        scope: &Scope,
        kpi_key: &str,
    ) -> Result<Option<KpiTarget>, StoreError> {
        Ok(read(&self.targets)
            .get(&(scope.clone(), kpi_key.to_string()))
            .cloned())
    }
}

#[async_trait]
impl GateStore for InMemoryStore {
    async fn upsert_trend_point(
        &self,
        scope: &Scope,
        point: &TrendPoint,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = (scope.clone(), point.kpi_key.clone(), point.window, point.period_key);
        Ok(upsert_newer(&mut write(&self.trends), key, point.clone(), |p| p.computed_at))
    }

    async fn get_trend_point(
        &self,
        scope: &Scope,
        kpi_key: &str,
        window: Window,
        period: PeriodKey,
    ) -> Result<Option<TrendPoint>, StoreError> {
        let key = (scope.clone(), kpi_key.to_string(), window, period);
        Ok(read(&self.trends).get(&key).cloned())
    }

    async fn upsert_flag(
        &self,
        scope: &Scope,
        flag: &MonthlyFlag,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = (scope.clone(), flag.kpi_key.clone(), flag.period_key, flag.trend_window);
        Ok(upsert_newer(&mut write(&self.flags), key, flag.clone(), |f| f.computed_at))
    }

    async fn get_flag(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<Option<MonthlyFlag>, StoreError> {
        let key = (scope.clone(), kpi_key.to_string(), period, window);
        Ok(read(&self.flags).get(&key).cloned())
    }

    async fn list_flags(
        &self,
        scope: &Scope,
        window: Window,
        periods: &[PeriodKey],
    ) -> Result<Vec<MonthlyFlag>, StoreError> {
        let mut flags: Vec<MonthlyFlag> = read(&self.flags)
            .iter()
            .filter(|((owner, _, period, w), _)| {
                owner == scope && *w == window && periods.contains(period)
            })
            .map(|(_, flag)| flag.clone())
            .collect();
        flags.sort_by(|a, b| (&a.kpi_key, a.period_key).cmp(&(&b.kpi_key, b.period_key)));
        Ok(flags)
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
        let key = (
            scope.clone(),
            kpi_key.to_string(),
            period,
            window,
            dimension_key.to_string(),
        );
        write(&self.contributors).insert(key, contributors.to_vec());
        Ok(())
    }

    async fn list_contributors(
        &self,
        scope: &Scope,
        kpi_key: &str,
        period: PeriodKey,
        window: Window,
    ) -> Result<Vec<RcaTopContributor>, StoreError> {
        let mut out: Vec<RcaTopContributor> = read(&self.contributors)
            .iter()
            .filter(|((owner, kpi, p, w, _), _)| {
                owner == scope && kpi == kpi_key && *p == period && *w == window
            })
            .flat_map(|(_, ranked)| ranked.iter().cloned())
            .collect();
        out.sort_by(|a, b| (&a.dimension_key, a.rank).cmp(&(&b.dimension_key, b.rank)));
        Ok(out)
    }

    async fn create_calibration_run(
        &self,
        scope: &Scope,
        outcome_metric: &str,
        period_start: PeriodKey,
        period_end: PeriodKey,
        created_at: DateTime<Utc>,
    ) -> Result<CalibrationRun, StoreError> {
        let mut tables = write(&self.calibration);
        let model_version = tables
            .runs
            .values()
            .filter(|run| &run.scope == scope)
            .map(|run| run.model_version)
            .max()
            .unwrap_or(0)
            + 1;

        let run = CalibrationRun {
            id: Uuid::new_v4(),
            scope: scope.clone(),
            model_version,
            outcome_metric: outcome_metric.to_string(),
            period_start,
            period_end,
            overall_status: RunStatus::Pending,
            created_at,
            completed_at: None,
        };
        tables.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_calibration_run(
        &self,
        scope: &Scope,
        id: Uuid,
    ) -> Result<Option<CalibrationRun>, StoreError> {
        Ok(read(&self.calibration)
            .runs
            .get(&id)
            .filter(|run| &run.scope == scope)
            .cloned())
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
        let mut tables = write(&self.calibration);
        let run = tables
            .runs
            .get_mut(&id)
            .filter(|run| &run.scope == scope)
            .ok_or_else(|| StoreError::NotFound(format!("calibration run {id}")))?;

        if run.overall_status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "calibration run {id} is already {}",
                run.overall_status.as_str()
            )));
        }
        run.overall_status = status;
        run.completed_at = Some(completed_at);
        let updated = run.clone();

        tables.cells.insert(id, cells.to_vec());
        tables.suggestions.insert(id, suggestions.to_vec());
        Ok(updated)
    }

    async fn list_calibration_cells(
        &self,
        scope: &Scope,
        run_id: Uuid,
    ) -> Result<Vec<CalibrationCell>, StoreError> {
        let tables = read(&self.calibration);
        if !tables.runs.get(&run_id).is_some_and(|run| &run.scope == scope) {
            return Ok(Vec::new());
        }
        Ok(tables.cells.get(&run_id).cloned().unwrap_or_default())
    }

    async fn list_weight_suggestions(
        &self,
        scope: &Scope,
        run_id: Uuid,
    ) -> Result<Vec<WeightSuggestion>, StoreError> {
        let tables = read(&self.calibration);
        if !tables.runs.get(&run_id).is_some_and(|run| &run.scope == scope) {
            return Ok(Vec::new());
        }
        Ok(tables.suggestions.get(&run_id).cloned().unwrap_or_default())
    }

    async fn decide_weight_suggestion(
        &self,
        scope: &Scope,
        id: Uuid,
        status: SuggestionStatus,
        decided_by: &str,
        decided_at: DateTime<Utc>,
    ) -> Result<WeightSuggestion, StoreError> {
        let mut tables = write(&self.calibration);
        let CalibrationTables { runs, suggestions, .. } = &mut *tables;

        let suggestion = suggestions
            .iter_mut()
            .filter(|(run_id, _)| runs.get(*run_id).is_some_and(|run| &run.scope == scope))
            .flat_map(|(_, list)| list.iter_mut())
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("weight suggestion {id}")))?;

        if suggestion.suggestion_status != SuggestionStatus::Pending {
            return Err(StoreError::Conflict(format!(
                "weight suggestion {id} is already {}",
                suggestion.suggestion_status.as_str()
            )));
        }
        suggestion.suggestion_status = status;
        suggestion.decided_by = Some(decided_by.to_string());
        suggestion.decided_at = Some(decided_at);
        Ok(suggestion.clone())
    }

    async fn delete_calibration_run(&self, scope: &Scope, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = write(&self.calibration);
        if !tables.runs.get(&id).is_some_and(|run| &run.scope == scope) {
            return Ok(false);
        }
        tables.runs.remove(&id);
        tables.cells.remove(&id);
        tables.suggestions.remove(&id);
        Ok(true)
    }

    async fn upsert_quarterly_insight(
        &self,
        insight: &QuarterlyInsight,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = (
            insight.scope.clone(),
            insight.year,
            insight.quarter,
            insight.kpi_key.clone(),
        );
        Ok(upsert_newer(&mut write(&self.insights), key, insight.clone(), |i| i.computed_at))
    }

    async fn prune_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        let mut insights = write(&self.insights);
        let before = insights.len();
        insights.retain(|(owner, y, q, kpi), _| {
            !(owner == scope && *y == year && *q == quarter && !keep.contains(kpi))
        });
        Ok((before - insights.len()) as u64)
    }

    async fn list_quarterly_insights(
        &self,
        scope: &Scope,
        year: i32,
        quarter: u32,
    ) -> Result<Vec<QuarterlyInsight>, StoreError> {
        let mut out: Vec<QuarterlyInsight> = read(&self.insights)
            .iter()
            .filter(|((owner, y, q, _), _)| owner == scope && *y == year && *q == quarter)
            .map(|(_, insight)| insight.clone())
            .collect();
        out.sort_by(|a, b| a.kpi_key.cmp(&b.kpi_key));
        Ok(out)
    }

    async fn upsert_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = (
            recommendation.scope.clone(),
            recommendation.month,
            recommendation.kpi_key.clone(),
        );
        Ok(upsert_newer(
            &mut write(&self.recommendations),
            key,
            recommendation.clone(),
            |r| r.computed_at,
        ))
    }

    async fn prune_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
        keep: &[String],
    ) -> Result<u64, StoreError> {
        let mut recommendations = write(&self.recommendations);
        let before = recommendations.len();
        recommendations.retain(|(owner, m, kpi), _| !(owner == scope && *m == month && !keep.contains(kpi)));
        Ok((before - recommendations.len()) as u64)
    }

    async fn list_recommendations(
        &self,
        scope: &Scope,
        month: PeriodKey,
    ) -> Result<Vec<Recommendation>, StoreError> {
        let mut out: Vec<Recommendation> = read(&self.recommendations)
            .iter()
            .filter(|((owner, m, _), _)| owner == scope && *m == month)
            .map(|(_, rec)| rec.clone())
            .collect();
        out.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.kpi_key.cmp(&b.kpi_key)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn reading(kpi: &str, period: &str, value: f64) -> KpiReading {
        KpiReading {
            kpi_key: kpi.to_string(),
            period_key: period.parse().unwrap(),
            value,
            dimension_tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn readings_are_paginated_in_period_order() {
        let store = InMemoryStore::new();
        let scope = Scope::new("acme");
        for (period, value) in [("2025-03", 3.0), ("2025-01", 1.0), ("2025-02", 2.0)] {
            store.insert_reading(&scope, reading("incident_rate", period, value));
        }
        store.insert_reading(&Scope::new("other"), reading("incident_rate", "2025-01", 99.0));

        let query = ReadingQuery {
            kpi_key: "incident_rate".to_string(),
            from: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2025, 12, 31).unwrap(),
            dimension_filter: None,
        };
        let first = store
            .list_readings_page(&scope, &query, Page { offset: 0, limit: 2 })
            .await
            .unwrap();
        assert_eq!(first.readings.iter().map(|r| r.value).collect::<Vec<_>>(), vec![1.0, 2.0]);
        assert_eq!(first.next_offset, Some(2));

        let second = store
            .list_readings_page(&scope, &query, Page { offset: 2, limit: 2 })
            .await
            .unwrap();
        assert_eq!(second.readings.len(), 1);
        assert_eq!(second.next_offset, None);
    }

    #[tokio::test]
    async fn older_computations_do_not_overwrite_newer_ones() {
        let store = InMemoryStore::new();
        let scope = Scope::new("acme");
        let now = Utc::now();
        let point = |value: f64, at: DateTime<Utc>| TrendPoint {
            kpi_key: "incident_rate".to_string(),
            window: Window::Monthly,
            period_key: "2025-03".parse().unwrap(),
            aggregate_value: Some(value),
            sample_count: 1,
            prior_period_value: None,
            computed_at: at,
        };

        assert_eq!(
            store.upsert_trend_point(&scope, &point(1.0, now)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store
                .upsert_trend_point(&scope, &point(0.5, now - chrono::Duration::seconds(5)))
                .await
                .unwrap(),
            UpsertOutcome::Stale
        );
        let stored = store
            .get_trend_point(&scope, "incident_rate", Window::Monthly, "2025-03".parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.aggregate_value, Some(1.0));
    }

    #[tokio::test]
    async fn model_versions_increase_per_tenant() {
        let store = InMemoryStore::new();
        let acme = Scope::new("acme");
        let start: PeriodKey = "2025-01".parse().unwrap();
        let end: PeriodKey = "2025-06".parse().unwrap();

        let first = store.create_calibration_run(&acme, "incident_rate", start, end, Utc::now()).await.unwrap();
        let second = store.create_calibration_run(&acme, "incident_rate", start, end, Utc::now()).await.unwrap();
        let other = store
            .create_calibration_run(&Scope::new("globex"), "incident_rate", start, end, Utc::now())
            .await
            .unwrap();

        assert_eq!(first.model_version, 1);
        assert_eq!(second.model_version, 2);
        assert_ne!(first.id, second.id);
        assert_eq!(other.model_version, 1);
    }

    #[tokio::test]
    async fn deleting_a_run_cascades() {
        let store = InMemoryStore::new();
        let scope = Scope::new("acme");
        let period: PeriodKey = "2025-01".parse().unwrap();
        let run = store.create_calibration_run(&scope, "incident_rate", period, period, Utc::now()).await.unwrap();
        let cell = CalibrationCell {
            calibration_run_id: run.id,
            activity_dimension: "training_completion".to_string(),
            outcome_metric: "incident_rate".to_string(),
            observed_correlation: -0.8,
            p_value: 0.01,
            sample_size: 12,
            residual: 0.3,
        };
        store
            .complete_calibration_run(&scope, run.id, RunStatus::Converged, &[cell], &[], Utc::now())
            .await
            .unwrap();
        assert_eq!(store.list_calibration_cells(&scope, run.id).await.unwrap().len(), 1);

        assert!(store.delete_calibration_run(&scope, run.id).await.unwrap());
        assert!(store.get_calibration_run(&scope, run.id).await.unwrap().is_none());
        assert!(store.list_calibration_cells(&scope, run.id).await.unwrap().is_empty());
        assert!(!store.delete_calibration_run(&scope, run.id).await.unwrap());
    }

    #[tokio::test]
    async fn pruning_insights_keeps_listed_kpis_and_other_quarters() {
        let store = InMemoryStore::new();
        let scope = Scope::new("acme");
        let insight = |quarter: u32, kpi: &str| QuarterlyInsight {
            scope: scope.clone(),
            year: 2025,
            quarter,
            kpi_key: kpi.to_string(),
            worst_flag: crate::models::Flag::Warn,
            flagged_months: 1,
            mean_value: Some(1.0),
            top_contributors: Vec::new(),
            summary: String::new(),
            computed_at: Utc::now(),
        };
        for (quarter, kpi) in [(1, "incident_rate"), (1, "phishing_click_rate"), (2, "phishing_click_rate")] {
            store.upsert_quarterly_insight(&insight(quarter, kpi)).await.unwrap();
        }

        let removed = store
            .prune_quarterly_insights(&scope, 2025, 1, &["incident_rate".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let q1 = store.list_quarterly_insights(&scope, 2025, 1).await.unwrap();
        assert_eq!(q1.iter().map(|i| i.kpi_key.as_str()).collect::<Vec<_>>(), vec!["incident_rate"]);
        assert_eq!(store.list_quarterly_insights(&scope, 2025, 2).await.unwrap().len(), 1);
    }
}
