use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GateError;
use crate::period::{PeriodKey, Window};

/// Tenant identifier supplied by the caller on every operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Scope(String);

impl Scope {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self(tenant.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiReading {
    pub kpi_key: String,
    pub period_key: PeriodKey,
    pub value: f64,
    #[serde(default)]
    pub dimension_tags: BTreeMap<String, String>,
}

/// Which side of the target is adverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::HigherIsBetter => "higher_is_better",
            Direction::LowerIsBetter => "lower_is_better",
        }
    }

    /// How far `value` sits on the bad side of `target`. Negative means favorable.
    pub fn adverse_deviation(&self, value: f64, target: f64) -> f64 {
        match self {
            Direction::HigherIsBetter => target - value,
            Direction::LowerIsBetter => value - target,
        }
    }

    /// +1 when raising the metric is good, -1 otherwise.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::HigherIsBetter => 1.0,
            Direction::LowerIsBetter => -1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "higher_is_better" => Ok(Direction::HigherIsBetter),
            "lower_is_better" => Ok(Direction::LowerIsBetter),
            other => Err(GateError::Storage {
                operation: "decode_direction",
                reason: format!("unknown direction {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiTarget {
    pub target_value: f64,
    pub direction: Direction,
    pub warn_band: f64,
    /// Falls back to the configured default when absent.
    pub alert_band_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub kpi_key: String,
    pub window: Window,
    pub period_key: PeriodKey,
    /// `None` when the period had no samples; never read as zero.
    pub aggregate_value: Option<f64>,
    pub sample_count: u32,
    pub prior_period_value: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

/// Severity of a period relative to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Ok,
    Warn,
    Alert,
    NoRef,
}

impl Flag {
    /// Ordering used when prioritizing: alert first, no_ref last.
    pub fn priority(&self) -> u8 {
        match self {
            Flag::Alert => 3,
            Flag::Warn => 2,
            Flag::Ok => 1,
            Flag::NoRef => 0,
        }
    }

    pub fn is_flagged(&self) -> bool {
        matches!(self, Flag::Warn | Flag::Alert)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Flag::Ok => "ok",
            Flag::Warn => "warn",
            Flag::Alert => "alert",
            Flag::NoRef => "no_ref",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flag {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Flag::Ok),
            "warn" => Ok(Flag::Warn),
            "alert" => Ok(Flag::Alert),
            "no_ref" => Ok(Flag::NoRef),
            other => Err(GateError::Storage {
                operation: "decode_flag",
                reason: format!("unknown flag {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyFlag {
    pub kpi_key: String,
    pub period_key: PeriodKey,
    pub flag: Flag,
    pub metric_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub adverse_deviation: Option<f64>,
    pub trend_window: Window,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaTopContributor {
    pub kpi_key: String,
    pub period_key: PeriodKey,
    pub window: Window,
    pub dimension_key: String,
    pub dimension_value: String,
    pub impact_share: f64,
    pub sample_count: u32,
    pub rank: u32,
}

impl RcaTopContributor {
    pub fn label(&self) -> String {
        format!("{}={}", self.dimension_key, self.dimension_value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Converged,
    Diverged,
    InsufficientData,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            RunStatus::Pending => false,
            RunStatus::Converged | RunStatus::Diverged | RunStatus::InsufficientData => true,
        }
    }

    /// Validates a status change. Only `pending` may move, and only to a terminal state.
    pub fn transition(self, to: RunStatus) -> Result<RunStatus, GateError> {
        match (self, to) {
            (RunStatus::Pending, RunStatus::Pending) => Err(GateError::StateConflict(
                "run is already pending".to_string(),
            )),
            (RunStatus::Pending, next) => Ok(next),
            (current, next) => Err(GateError::StateConflict(format!(
                "run is {} and cannot move to {}",
                current.as_str(),
                next.as_str()
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Converged => "converged",
            RunStatus::Diverged => "diverged",
            RunStatus::InsufficientData => "insufficient_data",
        }
    }
}

impl FromStr for RunStatus {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "converged" => Ok(RunStatus::Converged),
            "diverged" => Ok(RunStatus::Diverged),
            "insufficient_data" => Ok(RunStatus::InsufficientData),
            other => Err(GateError::Storage {
                operation: "decode_run_status",
                reason: format!("unknown run status {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRun {
    pub id: Uuid,
    pub scope: Scope,
    pub model_version: i32,
    pub outcome_metric: String,
    pub period_start: PeriodKey,
    pub period_end: PeriodKey,
    pub overall_status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCell {
    pub calibration_run_id: Uuid,
    pub activity_dimension: String,
    pub outcome_metric: String,
    pub observed_correlation: f64,
    pub p_value: f64,
    pub sample_size: u32,
    pub residual: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for SuggestionStatus {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "approved" => Ok(SuggestionStatus::Approved),
            "rejected" => Ok(SuggestionStatus::Rejected),
            other => Err(GateError::Storage {
                operation: "decode_suggestion_status",
                reason: format!("unknown suggestion status {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSuggestion {
    pub id: Uuid,
    pub calibration_run_id: Uuid,
    pub activity_dimension: String,
    pub current_weight: f64,
    pub suggested_weight: f64,
    pub suggestion_status: SuggestionStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// A recorded human decision on a weight suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn status(&self) -> SuggestionStatus {
        match self {
            Decision::Approve => SuggestionStatus::Approved,
            Decision::Reject => SuggestionStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarterlyInsight {
    pub scope: Scope,
    pub year: i32,
    pub quarter: u32,
    pub kpi_key: String,
    pub worst_flag: Flag,
    pub flagged_months: u32,
    pub mean_value: Option<f64>,
    pub top_contributors: Vec<String>,
    pub summary: String,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub scope: Scope,
    pub month: PeriodKey,
    pub kpi_key: String,
    pub priority: u32,
    pub severity: Flag,
    pub focus: Option<String>,
    pub action: String,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateInsightsResponse {
    pub created: bool,
    pub kpis_count: usize,
    pub initiatives_count: usize,
}

/// Whether an upsert inserted a new row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// A newer computation already holds the key.
    Stale,
}
