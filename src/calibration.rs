//! Fits activity weights against an outcome KPI over monthly aggregates
//! (z-scored OLS, Jacobi condition number) and proposes normalized weights.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::CalibrationConfig;
use crate::engine::Engine;
use crate::error::{GateError, Result};
use crate::models::{
    CalibrationCell, CalibrationRun, Decision, RunStatus, Scope, SuggestionStatus,
    WeightSuggestion,
};
use crate::period::{PeriodKey, PeriodRange, Window};

/// Off-diagonal mass below which the Jacobi sweep counts as diagonal.
const JACOBI_OFF_DIAGONAL_EPSILON: f64 = 1e-22;

/// Pivot magnitude treated as zero during elimination.
const PIVOT_EPSILON: f64 = 1e-14;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityWeight {
    pub dimension: String,
    pub current_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRequest {
    pub outcome_metric: String,
    pub activities: Vec<ActivityWeight>,
    pub period_start: PeriodKey,
    pub period_end: PeriodKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub run: CalibrationRun,
    pub cells: Vec<CalibrationCell>,
    pub suggestions: Vec<WeightSuggestion>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fit {
    /// Standardized coefficients, one per activity column.
    pub coefficients: Vec<f64>,
    pub rss: f64,
    /// RMS of fitted minus observed outcome, in outcome units.
    pub residual_rms: f64,
    pub condition_number: f64,
    pub iterations: u32,
}

/// Pearson correlation coefficient. Zero when either side is constant.
///
/// r = Σ[(xi - x̄)(yi - ȳ)] / sqrt(Σ(xi - x̄)² × Σ(yi - ȳ)²)
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n == 0 {
        return 0.0;
    }
    let nf = n as f64;
    let mean_x = x[..n].iter().sum::<f64>() / nf;
    let mean_y = y[..n].iter().sum::<f64>() / nf;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (a, b) in x[..n].iter().zip(&y[..n]) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let denominator = (var_x * var_y).sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        (cov / denominator).clamp(-1.0, 1.0)
    }
}

/// Two-tailed p-value of a correlation via Student's t with n-2 degrees of freedom.
pub fn p_value_for_r(r: f64, n: usize) -> f64 {
    if n < 3 {
        return 1.0;
    }
    if r.abs() >= 0.9999 {
        return 0.0;
    }

    let df = (n - 2) as f64;
    let t_stat = r * df.sqrt() / (1.0 - r * r).sqrt();
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t_stat.abs())),
        Err(_) => 1.0,
    }
}

/// RMS of an intercept-only model, i.e. the outcome's population spread.
/// Used as the cell residual when no fit is available.
pub fn baseline_residual(outcome: &[f64]) -> f64 {
    mean_and_sd(outcome).map_or(0.0, |(_, sd)| sd)
}

fn mean_and_sd(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sd = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    Some((mean, sd))
}

fn standardize(values: &[f64]) -> Option<Vec<f64>> {
    let (mean, sd) = mean_and_sd(values)?;
    if !sd.is_finite() || sd <= 1e-12 * mean.abs().max(1.0) {
        return None;
    }
    Some(values.iter().map(|v| (v - mean) / sd).collect())
}

/// Eigenvalues of a symmetric matrix by cyclic Jacobi rotations.
/// `None` when the off-diagonal mass does not vanish within `max_sweeps`.
fn jacobi_eigenvalues(matrix: &[Vec<f64>], max_sweeps: u32) -> Option<Vec<f64>> {
    let n = matrix.len();
    let mut a = matrix.to_vec();

    for _ in 0..max_sweeps {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p][q] * a[p][q])
            .sum();
        if off < JACOBI_OFF_DIAGONAL_EPSILON {
            return Some((0..n).map(|i| a[i][i]).collect());
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[p][q].abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for row in a.iter_mut() {
                    let (kp, kq) = (row[p], row[q]);
                    row[p] = c * kp - s * kq;
                    row[q] = s * kp + c * kq;
                }
                for k in 0..n {
                    let (pk, qk) = (a[p][k], a[q][k]);
                    a[p][k] = c * pk - s * qk;
                    a[q][k] = s * pk + c * qk;
                }
            }
        }
    }
    None
}

/// Gaussian elimination with partial pivoting. `None` for singular systems.
fn solve(matrix: &[Vec<f64>], rhs: &[f64]) -> Option<Vec<f64>> {
    let n = rhs.len();
    let mut a: Vec<Vec<f64>> = matrix
        .iter()
        .zip(rhs)
        .map(|(row, b)| {
            let mut augmented = row.clone();
            augmented.push(*b);
            augmented
        })
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < PIVOT_EPSILON {
            return None;
        }
        a.swap(col, pivot);
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..=n {
                let above = a[col][k];
                a[row][k] -= factor * above;
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (a[row][n] - tail) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Least-squares fit of `outcome` on `columns` (each column one activity).
pub fn fit(columns: &[Vec<f64>], outcome: &[f64], config: &CalibrationConfig) -> Result<Fit> {
    let instability = |reason: String| GateError::NumericalInstability(reason);

    let y = standardize(outcome).ok_or_else(|| instability("outcome is constant".to_string()))?;
    let outcome_sd = baseline_residual(outcome);
    let z: Vec<Vec<f64>> = columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            standardize(column).ok_or_else(|| instability(format!("activity column {i} is constant")))
        })
        .collect::<Result<_>>()?;

    let k = z.len();
    let n = y.len() as f64;
    let normal: Vec<Vec<f64>> = (0..k)
        .map(|i| {
            (0..k)
                .map(|j| z[i].iter().zip(&z[j]).map(|(a, b)| a * b).sum::<f64>() / n)
                .collect()
        })
        .collect();
    let rhs: Vec<f64> = z
        .iter()
        .map(|column| column.iter().zip(&y).map(|(a, b)| a * b).sum::<f64>() / n)
        .collect();

    let eigenvalues = jacobi_eigenvalues(&normal, config.max_iterations)
        .ok_or_else(|| instability("eigen-decomposition did not converge".to_string()))?;
    let largest = eigenvalues.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let smallest = eigenvalues.iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
    if smallest <= 1e-12 * largest.max(1.0) {
        return Err(instability("activity columns are collinear".to_string()));
    }
    let condition_number = largest / smallest;
    if condition_number > config.max_condition_number {
        return Err(instability(format!(
            "condition number {condition_number:.3e} exceeds {:.3e}",
            config.max_condition_number
        )));
    }

    let rss_of = |beta: &[f64]| -> f64 {
        (0..y.len())
            .map(|t| {
                let fitted: f64 = beta.iter().zip(&z).map(|(b, column)| b * column[t]).sum();
                (y[t] - fitted).powi(2)
            })
            .sum()
    };

    let mut beta = solve(&normal, &rhs).ok_or_else(|| instability("normal equations are singular".to_string()))?;
    let mut rss = rss_of(&beta);

    for iteration in 1..=config.max_iterations {
        let residual: Vec<f64> = (0..k)
            .map(|i| rhs[i] - normal[i].iter().zip(&beta).map(|(a, b)| a * b).sum::<f64>())
            .collect();
        let delta = solve(&normal, &residual)
            .ok_or_else(|| instability("refinement step is singular".to_string()))?;
        for (b, d) in beta.iter_mut().zip(&delta) {
            *b += d;
        }
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(instability("coefficients diverged".to_string()));
        }

        let next = rss_of(&beta);
        if (rss - next).abs() <= config.tolerance * rss.max(1.0) {
            return Ok(Fit {
                coefficients: beta,
                rss: next,
                residual_rms: (next / n).sqrt() * outcome_sd,
                condition_number,
                iterations: iteration,
            });
        }
        rss = next;
    }

    Err(instability(format!(
        "residual sum of squares did not stabilize within {} iterations",
        config.max_iterations
    )))
}

/// Maps coefficients to weights in `[0, 1]` summing to 1.
///
/// `direction_sign` is +1 when a higher outcome is good and -1 otherwise,
/// so activities that push the outcome the right way get positive weight.
/// If every weight clips to zero the current weights are kept.
pub fn suggest_weights(coefficients: &[f64], current: &[f64], direction_sign: f64) -> Vec<f64> {
    let clipped: Vec<f64> = coefficients
        .iter()
        .map(|c| (c * direction_sign).clamp(0.0, 1.0))
        .collect();
    let total: f64 = clipped.iter().sum();
    if total > 0.0 {
        clipped.iter().map(|w| w / total).collect()
    } else {
        current.to_vec()
    }
}

fn build_cells(
    run_id: Uuid,
    outcome_metric: &str,
    activities: &[ActivityWeight],
    columns: &[Vec<f64>],
    outcome: &[f64],
    residual: f64,
) -> Vec<CalibrationCell> {
    activities
        .iter()
        .zip(columns)
        .map(|(activity, column)| {
            let r = pearson(column, outcome);
            CalibrationCell {
                calibration_run_id: run_id,
                activity_dimension: activity.dimension.clone(),
                outcome_metric: outcome_metric.to_string(),
                observed_correlation: r,
                p_value: p_value_for_r(r, outcome.len()),
                sample_size: outcome.len() as u32,
                residual,
            }
        })
        .collect()
}

fn validate_request(request: &CalibrationRequest) -> Result<PeriodRange> {
    let range = PeriodRange::new(request.period_start, request.period_end)?;
    if range.granularity() != Window::Monthly {
        return Err(GateError::InvalidRange(format!(
            "calibration runs over monthly periods, got {range}"
        )));
    }
    if request.activities.is_empty() {
        return Err(GateError::InvalidRequest("no activity dimensions".to_string()));
    }

    let mut seen = BTreeSet::new();
    for activity in &request.activities {
        if activity.dimension == request.outcome_metric {
            return Err(GateError::InvalidRequest(format!(
                "{} is both activity and outcome",
                activity.dimension
            )));
        }
        if !seen.insert(activity.dimension.as_str()) {
            return Err(GateError::InvalidRequest(format!(
                "duplicate activity {}",
                activity.dimension
            )));
        }
        if !activity.current_weight.is_finite() {
            return Err(GateError::InvalidRequest(format!(
                "current weight of {} is not finite",
                activity.dimension
            )));
        }
    }
    Ok(range)
}

impl Engine {
    /// Runs one calibration. Every call creates a new, independently
    /// versioned run, even for an identical request.
    pub async fn calibrate(
        &self,
        scope: &Scope,
        request: &CalibrationRequest,
    ) -> Result<CalibrationReport> {
        let range = validate_request(request)?;
        let config = &self.config().calibration;

        let outcome_points = self
            .aggregate(scope, &request.outcome_metric, Window::Monthly, range.from(), range.to())
            .await?;
        let mut activity_points = Vec::with_capacity(request.activities.len());
        for activity in &request.activities {
            activity_points.push(
                self.aggregate(scope, &activity.dimension, Window::Monthly, range.from(), range.to())
                    .await?,
            );
        }
        let direction_sign = self
            .target(scope, &request.outcome_metric)
            .await?
            .map_or(1.0, |t| t.direction.sign());

        // A month is a paired sample only when every series has a value.
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); request.activities.len()];
        let mut outcome = Vec::new();
        for (idx, point) in outcome_points.iter().enumerate() {
            let Some(y) = point.aggregate_value else { continue };
            let xs: Option<Vec<f64>> = activity_points
                .iter()
                .map(|series| series.get(idx).and_then(|p| p.aggregate_value))
                .collect();
            if let Some(xs) = xs {
                outcome.push(y);
                for (column, x) in columns.iter_mut().zip(xs) {
                    column.push(x);
                }
            }
        }
        let paired = outcome.len() as u32;

        let run = self
            .bounded(
                "create_calibration_run",
                self.store().create_calibration_run(
                    scope,
                    &request.outcome_metric,
                    range.from(),
                    range.to(),
                    Utc::now(),
                ),
            )
            .await?;

        let (status, cells, suggestions) = if paired < config.min_paired_samples {
            warn!(
                tenant = %scope,
                run = %run.id,
                paired,
                need = config.min_paired_samples,
                "Insufficient paired samples for calibration"
            );
            (RunStatus::InsufficientData, Vec::new(), Vec::new())
        } else {
            let cells_with = |residual: f64| {
                build_cells(run.id, &request.outcome_metric, &request.activities, &columns, &outcome, residual)
            };
            match fit(&columns, &outcome, config) {
                Ok(fit) => {
                    let cells = cells_with(fit.residual_rms);
                    let current: Vec<f64> = request.activities.iter().map(|a| a.current_weight).collect();
                    let weights = suggest_weights(&fit.coefficients, &current, direction_sign);
                    let suggestions = request
                        .activities
                        .iter()
                        .zip(weights)
                        .map(|(activity, suggested)| WeightSuggestion {
                            id: Uuid::new_v4(),
                            calibration_run_id: run.id,
                            activity_dimension: activity.dimension.clone(),
                            current_weight: activity.current_weight,
                            suggested_weight: suggested,
                            suggestion_status: SuggestionStatus::Pending,
                            decided_by: None,
                            decided_at: None,
                        })
                        .collect();
                    info!(
                        tenant = %scope,
                        run = %run.id,
                        rss = fit.rss,
                        condition_number = fit.condition_number,
                        iterations = fit.iterations,
                        "Calibration fit converged"
                    );
                    (RunStatus::Converged, cells, suggestions)
                }
                Err(err) => {
                    warn!(tenant = %scope, run = %run.id, error = %err, "Calibration fit diverged");
                    (RunStatus::Diverged, cells_with(baseline_residual(&outcome)), Vec::new())
                }
            }
        };

        let status = run.overall_status.transition(status)?;
        let run = self
            .bounded(
                "complete_calibration_run",
                self.store().complete_calibration_run(
                    scope,
                    run.id,
                    status,
                    &cells,
                    &suggestions,
                    Utc::now(),
                ),
            )
            .await?;

        info!(
            tenant = %scope,
            run = %run.id,
            model_version = run.model_version,
            status = run.overall_status.as_str(),
            paired,
            "Calibration run completed"
        );
        Ok(CalibrationReport {
            run,
            cells,
            suggestions,
        })
    }

    pub async fn calibration_report(&self, scope: &Scope, run_id: Uuid) -> Result<CalibrationReport> {
        let run = self
            .bounded("get_calibration_run", self.store().get_calibration_run(scope, run_id))
            .await?
            .ok_or_else(|| GateError::NotFound(format!("calibration run {run_id}")))?;
        let cells = self
            .bounded("list_calibration_cells", self.store().list_calibration_cells(scope, run_id))
            .await?;
        let suggestions = self
            .bounded("list_weight_suggestions", self.store().list_weight_suggestions(scope, run_id))
            .await?;
        Ok(CalibrationReport {
            run,
            cells,
            suggestions,
        })
    }

    /// Closes a run left pending (e.g. after an upstream failure) as `diverged`.
    pub async fn abandon_calibration_run(&self, scope: &Scope, run_id: Uuid) -> Result<CalibrationRun> {
        let run = self
            .bounded("get_calibration_run", self.store().get_calibration_run(scope, run_id))
            .await?
            .ok_or_else(|| GateError::NotFound(format!("calibration run {run_id}")))?;
        let status = run.overall_status.transition(RunStatus::Diverged)?;
        self.bounded(
            "complete_calibration_run",
            self.store()
                .complete_calibration_run(scope, run_id, status, &[], &[], Utc::now()),
        )
        .await
    }

    pub async fn delete_calibration_run(&self, scope: &Scope, run_id: Uuid) -> Result<bool> {
        let deleted = self
            .bounded("delete_calibration_run", self.store().delete_calibration_run(scope, run_id))
            .await?;
        info!(tenant = %scope, run = %run_id, deleted, "Deleted calibration run");
        Ok(deleted)
    }

    pub async fn approve_weight_suggestion(
        &self,
        scope: &Scope,
        suggestion_id: Uuid,
        decided_by: &str,
    ) -> Result<WeightSuggestion> {
        self.decide_weight_suggestion(scope, suggestion_id, Decision::Approve, decided_by)
            .await
    }

    pub async fn reject_weight_suggestion(
        &self,
        scope: &Scope,
        suggestion_id: Uuid,
        decided_by: &str,
    ) -> Result<WeightSuggestion> {
        self.decide_weight_suggestion(scope, suggestion_id, Decision::Reject, decided_by)
            .await
    }

    async fn decide_weight_suggestion(
        &self,
        scope: &Scope,
        suggestion_id: Uuid,
        decision: Decision,
        decided_by: &str,
    ) -> Result<WeightSuggestion> {
        if decided_by.trim().is_empty() {
            return Err(GateError::InvalidRequest("decision needs a decider".to_string()));
        }
        let suggestion = self
            .bounded(
                "decide_weight_suggestion",
                self.store().decide_weight_suggestion(
                    scope,
                    suggestion_id,
                    decision.status(),
                    decided_by,
                    Utc::now(),
                ),
            )
            .await?;
        info!(
            tenant = %scope,
            suggestion = %suggestion_id,
            status = suggestion.suggestion_status.as_str(),
            decided_by,
            "Recorded weight suggestion decision"
        );
        Ok(suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GateConfig;
    use crate::models::{Direction, KpiReading, KpiTarget};
    use crate::store::InMemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const CAMPAIGN_REACH: [f64; 12] = [
        120.0, 340.0, 210.0, 450.0, 180.0, 390.0, 260.0, 300.0, 150.0, 420.0, 230.0, 360.0,
    ];

    fn training(i: usize) -> f64 {
        60.0 + 5.0 * i as f64
    }

    fn incidents(i: usize) -> f64 {
        let noise = ((i * 7) % 5) as f64 * 0.1;
        20.0 - 0.15 * training(i) - 0.02 * CAMPAIGN_REACH[i] + noise
    }

    fn seeded_engine(months: usize) -> (Arc<InMemoryStore>, Engine, Scope) {
        let store = Arc::new(InMemoryStore::new());
        let scope = Scope::new("acme");
        let mut month: PeriodKey = "2024-01".parse().unwrap();
        for i in 0..months {
            for (kpi, value) in [
                ("training_completion", training(i)),
                ("campaign_reach", CAMPAIGN_REACH[i]),
                ("incident_rate", incidents(i)),
            ] {
                store.insert_reading(
                    &scope,
                    KpiReading {
                        kpi_key: kpi.to_string(),
                        period_key: month,
                        value,
                        dimension_tags: BTreeMap::new(),
                    },
                );
            }
            month = month.next().unwrap();
        }
        store.set_target(
            &scope,
            "incident_rate",
            KpiTarget {
                target_value: 5.0,
                direction: Direction::LowerIsBetter,
                warn_band: 2.0,
                alert_band_multiplier: None,
            },
        );
        let engine = Engine::with_backend(store.clone(), GateConfig::default());
        (store, engine, scope)
    }

    fn request() -> CalibrationRequest {
        CalibrationRequest {
            outcome_metric: "incident_rate".to_string(),
            activities: vec![
                ActivityWeight {
                    dimension: "training_completion".to_string(),
                    current_weight: 0.5,
                },
                ActivityWeight {
                    dimension: "campaign_reach".to_string(),
                    current_weight: 0.5,
                },
            ],
            period_start: "2024-01".parse().unwrap(),
            period_end: "2024-12".parse().unwrap(),
        }
    }

    #[test]
    fn pearson_matches_known_values() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((pearson(&x, &[2.0, 4.0, 6.0, 8.0, 10.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&x, &[5.0, 4.0, 3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&x, &[3.0; 5]), 0.0);
    }

    #[test]
    fn p_value_shrinks_with_stronger_correlation() {
        assert_eq!(p_value_for_r(0.5, 2), 1.0);
        assert!(p_value_for_r(0.9, 30) < p_value_for_r(0.3, 30));
        assert!(p_value_for_r(0.9, 30) < 0.05);
    }

    #[test]
    fn jacobi_finds_eigenvalues_of_a_symmetric_matrix() {
        let mut eigen = jacobi_eigenvalues(&[vec![2.0, 1.0], vec![1.0, 2.0]], 50).unwrap();
        eigen.sort_by(f64::total_cmp);
        assert!((eigen[0] - 1.0).abs() < 1e-10);
        assert!((eigen[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn solve_handles_pivoting_and_singularity() {
        let x = solve(&[vec![0.0, 1.0], vec![2.0, 0.0]], &[3.0, 4.0]).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-12 && (x[1] - 3.0).abs() < 1e-12);
        assert!(solve(&[vec![1.0, 2.0], vec![2.0, 4.0]], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn fit_recovers_an_exact_linear_relationship() {
        let x1: Vec<f64> = (0..12).map(training).collect();
        let x2 = CAMPAIGN_REACH.to_vec();
        let y: Vec<f64> = (0..12).map(|i| 3.0 - 0.1 * x1[i] - 0.01 * x2[i]).collect();

        let fit = fit(&[x1, x2], &y, &CalibrationConfig::default()).unwrap();
        assert!(fit.rss < 1e-12);
        assert!(fit.coefficients.iter().all(|c| *c < 0.0));
        assert!(fit.condition_number >= 1.0);
    }

    #[test]
    fn residual_comes_from_the_fitted_model() {
        let x: Vec<f64> = (0..12).map(training).collect();
        let y: Vec<f64> = (0..12).map(incidents).collect();
        let r = pearson(&x, &y);

        let single = fit(&[x.clone()], &y, &CalibrationConfig::default()).unwrap();
        let expected = baseline_residual(&y) * (1.0 - r * r).sqrt();
        assert!((single.residual_rms - expected).abs() < 1e-9);

        // A second informative column can only shrink the residual.
        let both = fit(&[x, CAMPAIGN_REACH.to_vec()], &y, &CalibrationConfig::default()).unwrap();
        assert!(both.residual_rms <= single.residual_rms + 1e-12);
    }

    #[test]
    fn collinear_activities_are_numerically_unstable() {
        let x1: Vec<f64> = (0..12).map(training).collect();
        let x2: Vec<f64> = x1.iter().map(|v| v * 2.0 + 1.0).collect();
        let y: Vec<f64> = (0..12).map(incidents).collect();
        assert!(matches!(
            fit(&[x1, x2], &y, &CalibrationConfig::default()),
            Err(GateError::NumericalInstability(_))
        ));
    }

    #[test]
    fn suggestions_are_clipped_and_renormalized() {
        let weights = suggest_weights(&[-0.6, -0.2, 0.4], &[0.3, 0.3, 0.4], -1.0);
        assert!((weights[0] - 0.75).abs() < 1e-12);
        assert!((weights[1] - 0.25).abs() < 1e-12);
        assert_eq!(weights[2], 0.0);

        // Nothing helps the outcome: keep the current weights.
        assert_eq!(suggest_weights(&[0.5, 0.2], &[0.7, 0.3], -1.0), vec![0.7, 0.3]);
    }

    #[tokio::test]
    async fn converged_run_produces_pending_normalized_suggestions() {
        let (_, engine, scope) = seeded_engine(12);
        let report = engine.calibrate(&scope, &request()).await.unwrap();

        assert_eq!(report.run.overall_status, RunStatus::Converged);
        assert_eq!(report.run.model_version, 1);
        assert_eq!(report.cells.len(), 2);
        assert!(report.cells.iter().all(|c| c.sample_size == 12));
        assert!(report.cells.iter().all(|c| c.observed_correlation < 0.0));
        let residual = report.cells[0].residual;
        assert!(residual >= 0.0 && report.cells.iter().all(|c| c.residual == residual));

        let total: f64 = report.suggestions.iter().map(|s| s.suggested_weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(report
            .suggestions
            .iter()
            .all(|s| s.suggestion_status == SuggestionStatus::Pending
                && (0.0..=1.0).contains(&s.suggested_weight)));
    }

    #[tokio::test]
    async fn too_few_paired_months_is_insufficient_data() {
        let (_, engine, scope) = seeded_engine(4);
        let report = engine.calibrate(&scope, &request()).await.unwrap();
        assert_eq!(report.run.overall_status, RunStatus::InsufficientData);
        assert!(report.suggestions.is_empty());
    }

    #[tokio::test]
    async fn concurrent_calibrations_create_distinct_runs() {
        let (_, engine, scope) = seeded_engine(12);
        let request = request();
        let (a, b) = tokio::join!(engine.calibrate(&scope, &request), engine.calibrate(&scope, &request));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.run.id, b.run.id);
        let mut versions = vec![a.run.model_version, b.run.model_version];
        versions.sort_unstable();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn decisions_are_recorded_once() {
        let (_, engine, scope) = seeded_engine(12);
        let report = engine.calibrate(&scope, &request()).await.unwrap();
        let first = report.suggestions[0].id;
        let second = report.suggestions[1].id;

        let approved = engine.approve_weight_suggestion(&scope, first, "ciso").await.unwrap();
        assert_eq!(approved.suggestion_status, SuggestionStatus::Approved);
        assert_eq!(approved.decided_by.as_deref(), Some("ciso"));

        assert!(matches!(
            engine.reject_weight_suggestion(&scope, first, "ciso").await,
            Err(GateError::StateConflict(_))
        ));
        let rejected = engine.reject_weight_suggestion(&scope, second, "ciso").await.unwrap();
        assert_eq!(rejected.suggestion_status, SuggestionStatus::Rejected);

        // The run's fit is untouched by decisions.
        let stored = engine.calibration_report(&scope, report.run.id).await.unwrap();
        assert_eq!(stored.run.overall_status, RunStatus::Converged);
        assert_eq!(stored.cells, report.cells);
    }

    #[tokio::test]
    async fn terminal_runs_cannot_be_reopened_or_abandoned() {
        let (_, engine, scope) = seeded_engine(12);
        let report = engine.calibrate(&scope, &request()).await.unwrap();
        assert!(matches!(
            engine.abandon_calibration_run(&scope, report.run.id).await,
            Err(GateError::StateConflict(_))
        ));
    }

    #[tokio::test]
    async fn pending_runs_can_be_abandoned() {
        let (store, engine, scope) = seeded_engine(12);
        let period: PeriodKey = "2024-01".parse().unwrap();
        let run = crate::store::GateStore::create_calibration_run(
            store.as_ref(),
            &scope,
            "incident_rate",
            period,
            period,
            Utc::now(),
        )
        .await
        .unwrap();

        let closed = engine.abandon_calibration_run(&scope, run.id).await.unwrap();
        assert_eq!(closed.overall_status, RunStatus::Diverged);
        assert!(closed.completed_at.is_some());
    }

    #[tokio::test]
    async fn rejects_malformed_requests() {
        let (_, engine, scope) = seeded_engine(12);

        let mut duplicate = request();
        duplicate.activities[1].dimension = "training_completion".to_string();
        assert!(matches!(
            engine.calibrate(&scope, &duplicate).await,
            Err(GateError::InvalidRequest(_))
        ));

        let mut reversed = request();
        std::mem::swap(&mut reversed.period_start, &mut reversed.period_end);
        assert!(matches!(
            engine.calibrate(&scope, &reversed).await,
            Err(GateError::InvalidRange(_))
        ));
    }
}
