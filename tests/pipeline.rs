//! End-to-end runs of the engine over the in-memory backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use kpi_gate::calibration::{ActivityWeight, CalibrationRequest};
use kpi_gate::models::{Direction, Flag, KpiReading, KpiTarget, RunStatus, Scope};
use kpi_gate::rca::Ranking;
use kpi_gate::{Engine, GateConfig, GateError, GateStore, InMemoryStore, PeriodKey, Window};

fn month(raw: &str) -> PeriodKey {
    raw.parse().unwrap()
}

fn reading(kpi: &str, period: &str, value: f64, department: &str) -> KpiReading {
    KpiReading {
        kpi_key: kpi.to_string(),
        period_key: month(period),
        value,
        dimension_tags: BTreeMap::from([("department".to_string(), department.to_string())]),
    }
}

fn target(value: f64, direction: Direction, warn_band: f64) -> KpiTarget {
    KpiTarget {
        target_value: value,
        direction,
        warn_band,
        alert_band_multiplier: None,
    }
}

/// March 2025: incident_rate alerts (driven by sales), phishing warns,
/// training is on target. February is clean.
fn governance_tenant(store: &InMemoryStore, scope: &Scope) {
    store.set_target(scope, "incident_rate", target(5.0, Direction::LowerIsBetter, 2.0));
    store.set_target(scope, "phishing_click_rate", target(8.0, Direction::LowerIsBetter, 2.0));
    store.set_target(scope, "training_completion", target(85.0, Direction::HigherIsBetter, 5.0));

    for (value, department) in [(14.0, "sales"), (14.0, "sales"), (5.0, "it"), (5.0, "finance")] {
        store.insert_reading(scope, reading("incident_rate", "2025-03", value, department));
    }
    for department in ["sales", "it", "finance"] {
        store.insert_reading(scope, reading("incident_rate", "2025-02", 5.0, department));
        store.insert_reading(scope, reading("phishing_click_rate", "2025-03", 11.0, department));
        store.insert_reading(scope, reading("training_completion", "2025-03", 90.0, department));
    }
}

async fn evaluate_quarter(engine: &Engine, scope: &Scope) {
    for (kpi, period, expected) in [
        ("incident_rate", "2025-02", Flag::Ok),
        ("incident_rate", "2025-03", Flag::Alert),
        ("phishing_click_rate", "2025-03", Flag::Warn),
        ("training_completion", "2025-03", Flag::Ok),
    ] {
        let flag = engine
            .evaluate(scope, kpi, month(period), Window::Monthly)
            .await
            .unwrap();
        assert_eq!(flag.flag, expected, "{kpi} {period}");
    }
}

fn setup() -> (Arc<InMemoryStore>, Engine, Scope) {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::with_backend(store.clone(), GateConfig::default());
    let scope = Scope::new("acme");
    governance_tenant(&store, &scope);
    (store, engine, scope)
}

#[tokio::test]
async fn flagged_month_flows_into_recommendations_and_report() {
    let (store, engine, scope) = setup();
    evaluate_quarter(&engine, &scope).await;

    let ranking = engine
        .rank_contributors(&scope, "incident_rate", month("2025-03"), Window::Monthly, "department", None)
        .await
        .unwrap();
    let contributors = match ranking {
        Ranking::Ranked(contributors) => contributors,
        other => panic!("expected a ranking, got {other:?}"),
    };
    assert_eq!(contributors[0].dimension_value, "sales");
    assert_eq!(contributors[0].rank, 1);
    assert!((contributors[0].impact_share - 1.0).abs() < 1e-9);
    assert!(contributors.iter().map(|c| c.impact_share.abs()).sum::<f64>() <= 1.0 + 1e-9);

    let count = engine
        .generate_recommendations(&scope, month("2025-03"), 5)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let recommendations = store.list_recommendations(&scope, month("2025-03")).await.unwrap();
    assert_eq!(recommendations[0].kpi_key, "incident_rate");
    assert_eq!(recommendations[0].severity, Flag::Alert);
    assert_eq!(recommendations[0].focus.as_deref(), Some("department=sales"));
    assert_eq!(recommendations[1].kpi_key, "phishing_click_rate");
    assert_eq!(recommendations[1].priority, 2);

    let report = engine
        .monthly_report(&scope, month("2025-03"), None)
        .await
        .unwrap();
    assert!(report.contains("1. [alert] Escalate incident_rate"));
    assert!(report.contains("2. [warn] Review phishing_click_rate"));
    assert!(report.contains("department=sales"));
}

#[tokio::test]
async fn regenerating_quarterly_insights_rewrites_instead_of_duplicating() {
    let (store, engine, scope) = setup();
    evaluate_quarter(&engine, &scope).await;
    engine
        .rank_contributors(&scope, "incident_rate", month("2025-03"), Window::Monthly, "department", None)
        .await
        .unwrap();

    let first = engine.generate_quarterly_insights(&scope, 2025, 1, 10).await.unwrap();
    assert!(first.created);
    assert_eq!(first.kpis_count, 3);
    assert_eq!(first.initiatives_count, 3);

    let second = engine.generate_quarterly_insights(&scope, 2025, 1, 10).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.kpis_count, first.kpis_count);

    let insights = store.list_quarterly_insights(&scope, 2025, 1).await.unwrap();
    let kpis: Vec<&str> = insights.iter().map(|i| i.kpi_key.as_str()).collect();
    assert_eq!(kpis, vec!["incident_rate", "phishing_click_rate", "training_completion"]);
    let incident = &insights[0];
    assert_eq!(incident.worst_flag, Flag::Alert);
    assert_eq!(incident.flagged_months, 1);
    assert_eq!(incident.top_contributors[0], "department=sales");
}

#[tokio::test]
async fn narrower_regeneration_prunes_dropped_insights() {
    let (store, engine, scope) = setup();
    evaluate_quarter(&engine, &scope).await;

    let first = engine.generate_quarterly_insights(&scope, 2025, 1, 10).await.unwrap();
    assert_eq!(first.kpis_count, 3);

    let second = engine.generate_quarterly_insights(&scope, 2025, 1, 1).await.unwrap();
    assert_eq!(second.kpis_count, 1);

    let insights = store.list_quarterly_insights(&scope, 2025, 1).await.unwrap();
    let kpis: Vec<&str> = insights.iter().map(|i| i.kpi_key.as_str()).collect();
    assert_eq!(kpis, vec!["incident_rate"]);

    let report = engine.monthly_report(&scope, month("2025-03"), None).await.unwrap();
    assert!(!report.contains("phishing_click_rate: worst flag"));
}

#[tokio::test]
async fn quarterly_window_flags_and_ranks_the_whole_quarter() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::with_backend(store.clone(), GateConfig::default());
    let scope = Scope::new("acme");
    store.set_target(&scope, "incident_rate", target(5.0, Direction::LowerIsBetter, 2.0));

    for period in ["2025-01", "2025-02", "2025-03"] {
        for (value, department) in [(12.0, "sales"), (5.0, "it"), (5.0, "finance")] {
            store.insert_reading(&scope, reading("incident_rate", period, value, department));
        }
    }
    // Week 1 of 2025 starts in December but its Thursday is in January.
    store.insert_reading(&scope, reading("incident_rate", "2025-W01", 12.0, "sales"));
    // Week 14 starts on March 31 but its Thursday is in April.
    store.insert_reading(&scope, reading("incident_rate", "2025-W14", 50.0, "sales"));

    let quarter = month("2025-Q1");
    let flag = engine
        .evaluate(&scope, "incident_rate", quarter, Window::Quarterly)
        .await
        .unwrap();
    assert_eq!(flag.flag, Flag::Warn);
    assert!((flag.metric_value.unwrap() - 7.8).abs() < 1e-9);

    let ranking = engine
        .rank_contributors(&scope, "incident_rate", quarter, Window::Quarterly, "department", None)
        .await
        .unwrap();
    let contributors = match ranking {
        Ranking::Ranked(contributors) => contributors,
        other => panic!("expected a ranking, got {other:?}"),
    };
    assert_eq!(contributors[0].dimension_value, "sales");
    assert_eq!(contributors[0].sample_count, 4);
    assert_eq!(contributors[0].window, Window::Quarterly);

    let stored = store
        .list_contributors(&scope, "incident_rate", quarter, Window::Quarterly)
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert!(store
        .list_contributors(&scope, "incident_rate", month("2025-03"), Window::Monthly)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn zero_top_n_is_rejected_before_any_write() {
    let (store, engine, scope) = setup();

    let err = engine
        .rank_contributors(&scope, "incident_rate", month("2025-03"), Window::Monthly, "department", Some(0))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::InvalidRequest(_)));

    let flag = store
        .get_flag(&scope, "incident_rate", month("2025-03"), Window::Monthly)
        .await
        .unwrap();
    assert!(flag.is_none());
}

#[tokio::test]
async fn concurrent_recommendation_runs_leave_one_set() {
    let (store, engine, scope) = setup();
    evaluate_quarter(&engine, &scope).await;

    let (a, b) = tokio::join!(
        engine.generate_recommendations(&scope, month("2025-03"), 5),
        engine.generate_recommendations(&scope, month("2025-03"), 5),
    );
    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 2);

    let recommendations = store.list_recommendations(&scope, month("2025-03")).await.unwrap();
    let priorities: Vec<u32> = recommendations.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![1, 2]);
}

#[tokio::test]
async fn resolved_kpis_drop_out_of_regenerated_recommendations() {
    let (store, engine, scope) = setup();
    evaluate_quarter(&engine, &scope).await;
    engine.generate_recommendations(&scope, month("2025-03"), 5).await.unwrap();

    // Loosening the phishing target turns its month green.
    store.set_target(&scope, "phishing_click_rate", target(12.0, Direction::LowerIsBetter, 2.0));
    engine
        .evaluate(&scope, "phishing_click_rate", month("2025-03"), Window::Monthly)
        .await
        .unwrap();

    let count = engine.generate_recommendations(&scope, month("2025-03"), 5).await.unwrap();
    assert_eq!(count, 1);
    let recommendations = store.list_recommendations(&scope, month("2025-03")).await.unwrap();
    assert_eq!(recommendations.len(), 1);
    assert_eq!(recommendations[0].kpi_key, "incident_rate");
}

#[tokio::test]
async fn empty_month_is_no_ref_and_not_zero() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::with_backend(store.clone(), GateConfig::default());
    let scope = Scope::new("globex");
    store.set_target(&scope, "incident_rate", target(5.0, Direction::LowerIsBetter, 2.0));

    let flag = engine
        .evaluate(&scope, "incident_rate", month("2025-03"), Window::Monthly)
        .await
        .unwrap();
    assert_eq!(flag.flag, Flag::NoRef);
    assert_eq!(flag.metric_value, None);
    assert_eq!(flag.threshold_value, Some(5.0));

    let points = engine
        .aggregate(&scope, "incident_rate", Window::Monthly, month("2025-01"), month("2025-03"))
        .await
        .unwrap();
    assert_eq!(points.len(), 3);
    assert!(points.iter().all(|p| p.aggregate_value.is_none() && p.sample_count == 0));

    let ranking = engine
        .rank_contributors(&scope, "incident_rate", month("2025-03"), Window::Monthly, "department", None)
        .await
        .unwrap();
    assert_eq!(ranking, Ranking::NotFlagged(Flag::NoRef));
}

#[tokio::test]
async fn tenant_without_data_gets_empty_results() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::with_backend(store, GateConfig::default());
    let scope = Scope::new("initech");

    let response = engine.generate_quarterly_insights(&scope, 2025, 1, 10).await.unwrap();
    assert!(!response.created);
    assert_eq!(response.kpis_count, 0);
    assert_eq!(response.initiatives_count, 0);

    let count = engine.generate_recommendations(&scope, month("2025-03"), 5).await.unwrap();
    assert_eq!(count, 0);

    let report = engine.monthly_report(&scope, month("2025-03"), None).await.unwrap();
    assert!(report.contains("No recommendations for this month."));
}

#[tokio::test]
async fn calibration_suggestions_are_decided_once() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::with_backend(store.clone(), GateConfig::default());
    let scope = Scope::new("acme");
    store.set_target(&scope, "incident_rate", target(5.0, Direction::LowerIsBetter, 2.0));

    let reach = [120.0, 340.0, 210.0, 450.0, 180.0, 390.0, 260.0, 300.0, 150.0, 420.0, 230.0, 360.0];
    let mut period = month("2024-01");
    for (i, campaign_reach) in reach.iter().enumerate() {
        let training = 55.0 + 3.0 * i as f64;
        let noise = if i % 2 == 0 { 0.1 } else { -0.1 };
        let incidents = 12.0 - 0.08 * training - 0.01 * campaign_reach + noise;
        let key = period.to_string();
        store.insert_reading(&scope, reading("training_completion", &key, training, "all"));
        store.insert_reading(&scope, reading("campaign_reach", &key, *campaign_reach, "all"));
        store.insert_reading(&scope, reading("incident_rate", &key, incidents, "all"));
        period = period.next().unwrap();
    }

    let request = CalibrationRequest {
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
        period_start: month("2024-01"),
        period_end: month("2024-12"),
    };
    let report = engine.calibrate(&scope, &request).await.unwrap();
    assert_eq!(report.run.overall_status, RunStatus::Converged);
    assert_eq!(report.run.model_version, 1);
    assert_eq!(report.cells.len(), 2);
    assert!(report.cells.iter().all(|c| c.observed_correlation < 0.0 && c.sample_size == 12));

    let total: f64 = report.suggestions.iter().map(|s| s.suggested_weight).sum();
    assert!((total - 1.0).abs() < 1e-9);
    assert!(report
        .suggestions
        .iter()
        .all(|s| (0.0..=1.0).contains(&s.suggested_weight)));

    let suggestion = report.suggestions[0].id;
    let approved = engine
        .approve_weight_suggestion(&scope, suggestion, "analyst@acme")
        .await
        .unwrap();
    assert_eq!(approved.decided_by.as_deref(), Some("analyst@acme"));

    let again = engine
        .reject_weight_suggestion(&scope, suggestion, "analyst@acme")
        .await
        .unwrap_err();
    assert!(matches!(again, GateError::StateConflict(_)));

    let rerun = engine.calibrate(&scope, &request).await.unwrap();
    assert_eq!(rerun.run.model_version, 2);
}
