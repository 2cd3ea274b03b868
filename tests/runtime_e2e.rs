//! Full-loop runtime test: lifecycle, serving, attribution, state updates,
//! guardrails, decisions, and the analytics surface working together.

use std::sync::Arc;

use bandix::{
    arms, cohorts, events, export, guardrails, summary, timeseries, ArmCatalog, ArmSort,
    CheckStatus, Clock, Context, ControlParams, DecisionEngine, EGreedyParams, Error, EventFilter,
    ExperimentConfig, ExperimentId, ExperimentManager, ExperimentStatus, ExportFormat,
    Granularity, GuardrailMonitor, IngestTarget, ManualClock, Metric, Page, PolicyId,
    PolicyParams, PolicySpec, RewardAttributor, RewardKind, ServePipeline, Store, ThompsonParams,
    TrafficPlan, Verdict,
};

const HOUR_MS: i64 = 60 * 60 * 1000;

struct Rig {
    store: Arc<Store>,
    clock: Arc<ManualClock>,
    manager: ExperimentManager,
    pipeline: ServePipeline,
    attributor: RewardAttributor,
    monitor: GuardrailMonitor,
    engine: DecisionEngine,
}

fn rig() -> Rig {
    let store = Arc::new(Store::new());
    let clock = Arc::new(ManualClock::at(1_700_000_000_000));
    let c = || Arc::clone(&clock) as Arc<dyn Clock>;
    Rig {
        manager: ExperimentManager::new(Arc::clone(&store), c()),
        pipeline: ServePipeline::new(Arc::clone(&store), c()),
        attributor: RewardAttributor::new(Arc::clone(&store), c()),
        monitor: GuardrailMonitor::new(Arc::clone(&store), c()),
        engine: DecisionEngine::new(Arc::clone(&store), c()),
        store,
        clock,
    }
}

fn launch(rig: &Rig, id: &str, fraction: f64) -> ExperimentId {
    let id = ExperimentId::new(id);
    let plan = TrafficPlan::new([("ts", 0.34), ("eg", 0.33), ("ctrl", 0.33)]).unwrap();
    let config = ExperimentConfig::new("e2e-salt", fraction, plan);
    let policies = vec![
        PolicySpec::new(
            "ts",
            id.clone(),
            PolicyParams::Thompson(ThompsonParams {
                propensity_draws: 500,
                ..Default::default()
            }),
        ),
        PolicySpec::new(
            "eg",
            id.clone(),
            PolicyParams::EGreedy(EGreedyParams { epsilon: 0.1 }),
        ),
        PolicySpec::new(
            "ctrl",
            id.clone(),
            PolicyParams::Control(ControlParams::default()),
        ),
    ];
    let catalog = ArmCatalog::from_ids(id.clone(), 1, ["alpha", "beta", "gamma"]).unwrap();
    rig.manager
        .create(id.clone(), "full loop", config, policies, "ctrl", catalog)
        .unwrap();
    rig.manager.start(&id).unwrap();
    id
}

#[test]
fn serve_attribute_update_analyze_loop() {
    let rig = rig();
    let id = launch(&rig, "loop", 1.0);

    // Serve a wave of users, clicking on a third of them.
    let mut clicked = 0usize;
    for user in 0..300u64 {
        let slots = rig
            .pipeline
            .recommend(
                user,
                "default",
                &Context::from_pairs([("device", if user % 2 == 0 { "tv" } else { "phone" })]),
                1,
            )
            .unwrap();
        if user % 3 == 0 {
            rig.attributor
                .ingest(
                    IngestTarget::Event(slots[0].event_id.clone()),
                    RewardKind::Click,
                    1.0,
                )
                .unwrap();
            clicked += 1;
        }
        rig.clock.advance(500);
    }
    assert_eq!(rig.store.event_count(&id), 300);

    // Eager attribution finalizes the clicked events and queues updates.
    let report = rig.attributor.run_once();
    assert_eq!(report.finalized, clicked);
    assert_eq!(rig.store.reward_queue_len(), clicked);
    assert_eq!(rig.attributor.drain_updates(1000), clicked);
    assert_eq!(rig.store.reward_queue_len(), 0);

    // State rows moved: total pulls across the experiment equals the number
    // of applied updates.
    let total_pulls: u64 = rig
        .store
        .states_of(&id)
        .iter()
        .map(|(_, s)| s.pulls)
        .sum();
    assert_eq!(total_pulls, clicked as u64);

    // Close the window: everything else freezes to zero.
    rig.clock.advance(25 * HOUR_MS);
    let closing = rig.attributor.run_once();
    assert_eq!(closing.closed_zero, 300 - clicked);
    rig.attributor.drain_updates(10_000);

    // Analytics reflect the loop.
    let summary = summary(&rig.store, &id).unwrap();
    assert_eq!(summary.serves, 300);
    assert_eq!(
        summary.policies.iter().map(|p| p.finalized).sum::<u64>(),
        300
    );
    let arms = arms(&rig.store, &id, ArmSort::Serves, 10).unwrap();
    assert!(!arms.is_empty());
    assert_eq!(arms.iter().map(|a| a.serves).sum::<u64>(), 300);

    let series =
        timeseries(&rig.store, &id, Metric::Serves, Granularity::Hour).unwrap();
    assert_eq!(series.iter().map(|(_, v)| *v as u64).sum::<u64>(), 300);

    let cohorts = cohorts(&rig.store, &id, "device").unwrap();
    assert_eq!(cohorts.len(), 2);

    let rewarded = events(
        &rig.store,
        &id,
        &EventFilter {
            rewarded: Some(true),
            ..Default::default()
        },
        Page {
            offset: 0,
            limit: 1000,
        },
    )
    .unwrap();
    assert_eq!(rewarded.len(), 300);

    let mut out = Vec::new();
    let rows = export(&rig.store, &id, ExportFormat::Jsonl, &mut out).unwrap();
    assert_eq!(rows, 300);

    // Guardrails are healthy, and healthy checks are also recorded.
    let guard = rig.monitor.evaluate(&id).unwrap();
    assert!(!guard.rolled_back);
    assert!(guard
        .checks
        .iter()
        .all(|c| c.status != CheckStatus::Fail));
    assert!(!guardrails(&rig.store, &id).unwrap().is_empty());

    // Too little data and time for any verdict: continue.
    let decision = rig.engine.evaluate(&id, 1).unwrap();
    assert_eq!(decision.verdict, Verdict::Continue);
    assert_eq!(rig.store.decisions_of(&id).len(), 1);
}

#[test]
fn lifecycle_rules_are_enforced() {
    let rig = rig();
    let id = launch(&rig, "lifecycle", 0.5);

    // Ramp may only grow while active.
    assert!(rig.manager.set_traffic(&id, Some(0.7), None).is_ok());
    let err = rig.manager.set_traffic(&id, Some(0.4), None).unwrap_err();
    assert!(matches!(err, Error::Configuration(_)), "{err}");

    // Unknown policies cannot enter the plan.
    let bad_plan = TrafficPlan::new([("ghost", 1.0)]).unwrap();
    assert!(rig.manager.set_traffic(&id, None, Some(bad_plan)).is_err());

    // Pause: serves fall to the default policy and are not recorded.
    rig.manager.pause(&id).unwrap();
    let before = rig.store.event_count(&id);
    let slots = rig
        .pipeline
        .recommend(3, "default", &Context::new(), 1)
        .unwrap();
    assert_eq!(slots[0].policy_id, PolicyId::new("ctrl"));
    assert_eq!(rig.store.event_count(&id), before);

    // Resume and serve again: recording resumes.
    rig.manager.resume(&id).unwrap();
    rig.pipeline
        .recommend(3, "default", &Context::new(), 1)
        .unwrap();
    assert!(rig.store.event_count(&id) > before);

    // Draft-only transitions are rejected from terminal states.
    rig.manager.end(&id).unwrap();
    assert!(matches!(
        rig.manager.resume(&id),
        Err(Error::InvalidTransition { .. })
    ));
    assert_eq!(
        rig.store.experiment(&id).unwrap().status,
        ExperimentStatus::Ended
    );
}

#[test]
fn salt_change_resets_assignments() {
    let rig = rig();
    let id = launch(&rig, "salted", 1.0);
    for user in 0..50u64 {
        rig.pipeline
            .recommend(user, "default", &Context::new(), 1)
            .unwrap();
    }
    assert!(rig.store.assignment_count(&id) > 0);

    rig.manager.set_salt(&id, "fresh-salt").unwrap();
    assert_eq!(rig.store.assignment_count(&id), 0);

    // New serves re-assign under the new salt.
    rig.pipeline
        .recommend(1, "default", &Context::new(), 1)
        .unwrap();
    assert_eq!(rig.store.assignment_count(&id), 1);
}

#[test]
fn out_of_experiment_users_are_logged_on_default_policy() {
    let rig = rig();
    let id = launch(&rig, "partial", 0.2);
    let mut in_exp = 0u64;
    let mut out_exp = 0u64;
    for user in 0..400u64 {
        let slots = rig
            .pipeline
            .recommend(user, "default", &Context::new(), 1)
            .unwrap();
        if rig.store.assignment(user, &id).is_some() {
            in_exp += 1;
        } else {
            assert_eq!(slots[0].policy_id, PolicyId::new("ctrl"));
            out_exp += 1;
        }
    }
    // Everyone gets an event row for comparability.
    assert_eq!(rig.store.event_count(&id), 400);
    assert!(in_exp > 0 && out_exp > 0);
    let share = in_exp as f64 / 400.0;
    assert!((share - 0.2).abs() < 0.1, "in-experiment share {share}");
}

#[test]
fn ingest_rejects_out_of_range_values_and_unknown_events() {
    let rig = rig();
    launch(&rig, "ranges", 1.0);
    assert!(matches!(
        rig.attributor.ingest(
            IngestTarget::UserArm {
                user_id: 1,
                arm_id: "alpha".to_string(),
                at_ms: rig.clock.now_ms(),
            },
            RewardKind::Rating,
            7.0,
        ),
        Err(Error::SignalOutOfRange { .. })
    ));
    assert!(matches!(
        rig.attributor.ingest(
            IngestTarget::Event(bandix::EventId::new("missing")),
            RewardKind::Click,
            1.0,
        ),
        Err(Error::NotFound { .. })
    ));
    // User/arm-addressed signals with valid values are accepted.
    assert!(rig
        .attributor
        .ingest(
            IngestTarget::UserArm {
                user_id: 1,
                arm_id: "alpha".to_string(),
                at_ms: rig.clock.now_ms(),
            },
            RewardKind::ThumbsUp,
            1.0,
        )
        .unwrap());
}

#[test]
fn user_arm_signals_attribute_to_matching_serves() {
    let rig = rig();
    let _id = launch(&rig, "useranm", 1.0);
    let slots = rig
        .pipeline
        .recommend(12, "default", &Context::new(), 1)
        .unwrap();
    let arm = slots[0].arm_id.clone();

    rig.clock.advance(60_000);
    rig.attributor
        .ingest(
            IngestTarget::UserArm {
                user_id: 12,
                arm_id: arm,
                at_ms: rig.clock.now_ms(),
            },
            RewardKind::Rating,
            5.0,
        )
        .unwrap();
    let report = rig.attributor.run_once();
    assert_eq!(report.finalized, 1);
    let event = rig.store.event(&slots[0].event_id).unwrap();
    // Rating 5 maps to reward 1 under the composite mapping.
    assert_eq!(event.reward, Some(1.0));
}

#[test]
fn validation_report_surfaces_issues_and_warnings() {
    let rig = rig();
    let id = launch(&rig, "report", 0.0);
    let report = rig.manager.validate(&id).unwrap();
    assert!(report.valid);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("traffic_fraction is 0")));
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("no assignments")));
    assert_eq!(report.status, ExperimentStatus::Active);
}
