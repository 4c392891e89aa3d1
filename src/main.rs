use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use kpi_gate::calibration::{ActivityWeight, CalibrationRequest};
use kpi_gate::db::{self, PgStore};
use kpi_gate::models::Scope;
use kpi_gate::rca::Ranking;
use kpi_gate::{Engine, GateConfig, PeriodKey, Window};

#[derive(Parser)]
#[command(name = "kpi-gate")]
#[command(about = "KPI trends, flags, root causes and weight calibration per tenant", long_about = None)]
struct Cli {
    /// Tenant every command operates on
    #[arg(long, env = "KPI_GATE_TENANT")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a year of demo readings and targets for the tenant
    Seed,
    /// Aggregate a KPI over an inclusive period range
    Trend {
        #[arg(long)]
        kpi: String,
        #[arg(long, default_value = "monthly")]
        window: Window,
        #[arg(long)]
        from: PeriodKey,
        #[arg(long)]
        to: PeriodKey,
    },
    /// Flag one period of a KPI against its target
    Flag {
        #[arg(long)]
        kpi: String,
        #[arg(long)]
        period: PeriodKey,
        #[arg(long, default_value = "monthly")]
        window: Window,
    },
    /// Rank contributors to a flagged period along one dimension
    Rca {
        #[arg(long)]
        kpi: String,
        #[arg(long)]
        period: PeriodKey,
        #[arg(long)]
        dimension: String,
        #[arg(long, default_value = "monthly")]
        window: Window,
        #[arg(long)]
        top_n: Option<usize>,
    },
    /// Fit activity weights against an outcome KPI
    Calibrate {
        #[arg(long)]
        outcome: String,
        /// Activity and its current weight, as `dimension=weight`
        #[arg(long = "activity", value_parser = parse_activity, required = true)]
        activities: Vec<ActivityWeight>,
        #[arg(long)]
        from: PeriodKey,
        #[arg(long)]
        to: PeriodKey,
    },
    /// Approve a pending weight suggestion
    Approve {
        #[arg(long)]
        suggestion: Uuid,
        #[arg(long)]
        by: String,
    },
    /// Reject a pending weight suggestion
    Reject {
        #[arg(long)]
        suggestion: Uuid,
        #[arg(long)]
        by: String,
    },
    /// Generate quarterly insights from stored monthly flags
    Insights {
        #[arg(long)]
        year: i32,
        #[arg(long)]
        quarter: u32,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Generate prioritized recommendations for a month
    Recommend {
        #[arg(long)]
        month: PeriodKey,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Generate a markdown report for a month
    Report {
        #[arg(long)]
        month: PeriodKey,
        #[arg(long)]
        calibration_run: Option<Uuid>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn parse_activity(raw: &str) -> Result<ActivityWeight, String> {
    let (dimension, weight) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected dimension=weight, got '{raw}'"))?;
    let current_weight = weight
        .trim()
        .parse::<f64>()
        .map_err(|err| format!("invalid weight '{weight}': {err}"))?;
    Ok(ActivityWeight {
        dimension: dimension.trim().to_string(),
        current_weight,
    })
}

fn value_or_dash(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = GateConfig::load().context("failed to load configuration")?;
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_millis(config.upstream.timeout_ms))
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let scope = Scope::new(cli.tenant);
    let engine = Engine::with_backend(Arc::new(PgStore::new(pool.clone())), config);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let inserted = db::seed(&pool, &scope).await?;
            println!("Inserted {inserted} readings for {scope}.");
        }
        Commands::Trend {
            kpi,
            window,
            from,
            to,
        } => {
            let points = engine.aggregate(&scope, &kpi, window, from, to).await?;
            println!("{kpi} ({window}):");
            for point in &points {
                println!(
                    "- {}: {} across {} readings (prior {})",
                    point.period_key,
                    value_or_dash(point.aggregate_value),
                    point.sample_count,
                    value_or_dash(point.prior_period_value)
                );
            }
        }
        Commands::Flag {
            kpi,
            period,
            window,
        } => {
            let flag = engine.evaluate(&scope, &kpi, period, window).await?;
            println!(
                "{} {}: {} (value {}, target {}, adverse deviation {})",
                flag.kpi_key,
                flag.period_key,
                flag.flag,
                value_or_dash(flag.metric_value),
                value_or_dash(flag.threshold_value),
                value_or_dash(flag.adverse_deviation)
            );
        }
        Commands::Rca {
            kpi,
            period,
            dimension,
            window,
            top_n,
        } => match engine
            .rank_contributors(&scope, &kpi, period, window, &dimension, top_n)
            .await?
        {
            Ranking::Ranked(contributors) => {
                println!("Top contributors to {kpi} in {period} by {dimension}:");
                for contributor in &contributors {
                    println!(
                        "{}. {} share {:+.2} across {} readings",
                        contributor.rank,
                        contributor.dimension_value,
                        contributor.impact_share,
                        contributor.sample_count
                    );
                }
            }
            Ranking::NotFlagged(flag) => {
                println!("{kpi} in {period} is {flag}; nothing to explain.");
            }
            Ranking::InsufficientSamples { have, need } => {
                println!("Only {have} readings for {kpi} in {period}; need at least {need}.");
            }
        },
        Commands::Calibrate {
            outcome,
            activities,
            from,
            to,
        } => {
            let request = CalibrationRequest {
                outcome_metric: outcome,
                activities,
                period_start: from,
                period_end: to,
            };
            let report = engine.calibrate(&scope, &request).await?;
            println!(
                "Calibration run {} (v{}) finished {}.",
                report.run.id,
                report.run.model_version,
                report.run.overall_status.as_str()
            );
            for cell in &report.cells {
                println!(
                    "- {}: r {:+.2} (p {:.3}, n {})",
                    cell.activity_dimension, cell.observed_correlation, cell.p_value, cell.sample_size
                );
            }
            for suggestion in &report.suggestions {
                println!(
                    "- suggestion {} for {}: {:.2} -> {:.2}",
                    suggestion.id,
                    suggestion.activity_dimension,
                    suggestion.current_weight,
                    suggestion.suggested_weight
                );
            }
        }
        Commands::Approve { suggestion, by } => {
            let decided = engine.approve_weight_suggestion(&scope, suggestion, &by).await?;
            println!("Suggestion {} approved by {by}.", decided.id);
        }
        Commands::Reject { suggestion, by } => {
            let decided = engine.reject_weight_suggestion(&scope, suggestion, &by).await?;
            println!("Suggestion {} rejected by {by}.", decided.id);
        }
        Commands::Insights {
            year,
            quarter,
            limit,
        } => {
            let response = engine
                .generate_quarterly_insights(&scope, year, quarter, limit)
                .await?;
            println!(
                "{}-Q{}: {} KPIs, {} initiatives{}.",
                year,
                quarter,
                response.kpis_count,
                response.initiatives_count,
                if response.created { ", new insights written" } else { "" }
            );
        }
        Commands::Recommend { month, limit } => {
            let count = engine.generate_recommendations(&scope, month, limit).await?;
            println!("{count} recommendations stored for {month}.");
        }
        Commands::Report {
            month,
            calibration_run,
            out,
        } => {
            let report = engine.monthly_report(&scope, month, calibration_run).await?;
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
