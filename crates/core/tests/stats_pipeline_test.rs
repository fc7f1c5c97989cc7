// Integration tests for the node -> stats host pipeline
//
// Two driver nodes run simulated users against a dry-run executor and post
// their summaries straight into an in-process aggregator.
//
// Run with: cargo test -p rampart-core --test stats_pipeline_test

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rampart_core::behavior::{BehaviorSpec, TransitionChooserKind, NO_ASYNC_BEHAVIOR};
use rampart_core::stats::StatsSink;
use rampart_core::{
    AddWorkloadMessage, InitializeRunStatsMessage, InitializeWorkloadMessage, LifecycleState,
    NodeWorkload, StatsAggregator, StatsIntervalCompleteMessage, StatsSummary, TransportError,
    WorkloadConfig,
};
use serde_json::json;

/// Hands summaries to the aggregator without HTTP in between
struct AggregatorSink {
    run: String,
    aggregator: Arc<StatsAggregator>,
}

#[async_trait]
impl StatsSink for AggregatorSink {
    async fn send(&self, summary: &StatsSummary) -> Result<(), TransportError> {
        self.aggregator
            .post_stats_summary(&self.run, summary.clone())
            .await
            .expect("run is initialized on the aggregator");
        Ok(())
    }
}

fn behavior() -> BehaviorSpec {
    serde_json::from_value(json!({
        "name": "browser",
        "operations": ["home", "search", "view"],
        "transitionMatrices": [
            [[0, 1, 1]],
            [[1, 0, 3]],
            [[2, 1, 0]]
        ],
        "transitionChoosers": ["default", "default", "default"],
        "asyncBehaviors": [NO_ASYNC_BEHAVIOR, NO_ASYNC_BEHAVIOR, NO_ASYNC_BEHAVIOR],
        "meanCycleTimes": [1.0, 1.0, 2.0],
        "responseTimeLimits": [1.0, 1.0, 1.0],
        "responseTimeLimitsPercentile": [90.0, 90.0, 90.0],
        "mixPercentage": [20.0, 40.0, 40.0],
        "mixPercentageTolerance": 1.0,
        "useResponseTime": [true, true, true]
    }))
    .expect("behavior spec parses")
}

fn workload(output_csv: bool) -> WorkloadConfig {
    serde_json::from_value(json!({
        "name": "browse",
        "behaviorSpecName": "browser",
        "maxUsers": 20,
        "loadPath": {
            "type": "interval",
            "name": "steady",
            "printCsv": output_csv,
            "loadIntervals": [{"type": "uniform", "name": "only", "duration": 60, "users": 20}]
        }
    }))
    .expect("workload parses")
}

fn node(
    node_number: u32,
    aggregator: &Arc<StatsAggregator>,
    executor: Arc<rampart_core::DryRunExecutor>,
    output_csv: bool,
) -> NodeWorkload {
    let added = AddWorkloadMessage {
        workload: workload(output_csv),
        behavior_specs: vec![behavior()],
    };
    let init = InitializeWorkloadMessage {
        hostname: format!("driver{node_number}"),
        node_number,
        num_nodes: 2,
        stats_host_name: "master".into(),
        stats_port_number: 7500,
        run_name: "r1".into(),
        per_target_stats: false,
    };
    NodeWorkload::with_sink(
        added,
        &init,
        executor,
        Arc::new(AggregatorSink {
            run: "r1".into(),
            aggregator: aggregator.clone(),
        }),
    )
    .expect("node workload initializes")
}

fn close(spec: &str, start: i64, end: i64, users: i64) -> StatsIntervalCompleteMessage {
    StatsIntervalCompleteMessage {
        completed_spec_name: spec.into(),
        cur_interval_name: "only".into(),
        cur_interval_start_time: start,
        last_interval_end_time: end,
        interval_start_users: users,
        interval_end_users: users,
    }
}

#[tokio::test(start_paused = true)]
async fn test_interval_rollup_combines_both_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let aggregator = Arc::new(StatsAggregator::new());
    aggregator.initialize_run(
        "r1",
        InitializeRunStatsMessage {
            hosts: vec!["driver0".into(), "driver1".into()],
            stats_output_dir_name: dir.path().to_string_lossy().into_owned(),
            workload_name_to_num_targets_map: HashMap::from([("browse".to_string(), 1)]),
        },
    );
    aggregator.run_started("r1", 0).unwrap();

    let executor = Arc::new(rampart_core::DryRunExecutor::new(Duration::from_millis(50)));
    let nodes = [
        node(0, &aggregator, executor.clone(), true),
        node(1, &aggregator, executor, true),
    ];
    for node in &nodes {
        assert_eq!(node.max_users(), 10);
        node.change_active_users(10).unwrap();
    }
    tokio::time::sleep(Duration::from_secs(60)).await;

    nodes[0].stats_interval_complete(&close("steady", 0, 60_000, 20)).await;
    let status = aggregator.rollup_status("r1", "browse", "steady", "only").unwrap();
    assert_eq!(status.num_samples_expected, 2);
    assert_eq!(status.num_samples_received, 1);
    assert!(!status.is_complete());

    nodes[1].stats_interval_complete(&close("steady", 0, 60_000, 20)).await;
    let status = aggregator.rollup_status("r1", "browse", "steady", "only").unwrap();
    let rollup = status.rollup.expect("both nodes reported");
    assert_eq!(rollup.start_active_users, 20);
    assert!(rollup.total_num_ops > 0);
    assert_eq!(rollup.total_num_failed, 0);
    assert!((rollup.interval_duration_sec - 60.0).abs() < f64::EPSILON);
    assert!(rollup.operations.contains_key("home"));

    let csv = dir.path().join("r1-browse-steady.csv");
    let contents = tokio::fs::read_to_string(&csv).await.unwrap();
    assert_eq!(contents.lines().count(), 2);

    for node in &nodes {
        node.stop().await;
        assert_eq!(node.state(), LifecycleState::Completed);
    }
    let totals = aggregator.run_complete("r1", 61_000).unwrap();
    assert_eq!(totals.len(), 1);
    assert_eq!(totals[0].interval_name, "run");
    assert_eq!(totals[0].total_num_ops, rollup.total_num_ops);
}

#[test_log::test(tokio::test)]
async fn test_node_rejects_users_beyond_its_share() {
    let aggregator = Arc::new(StatsAggregator::new());
    let executor = Arc::new(rampart_core::DryRunExecutor::default());
    let node = node(1, &aggregator, executor, false);
    assert!(node.change_active_users(11).is_err());
    assert_eq!(node.state(), LifecycleState::Initialized);
    node.change_active_users(0).unwrap();
    assert_eq!(node.state(), LifecycleState::Running);
}

#[test]
fn test_choosers_accept_legacy_names() {
    let kinds: Vec<TransitionChooserKind> =
        serde_json::from_value(json!(["default", "BidOther", "bidleaveother"])).unwrap();
    assert_eq!(kinds[0], TransitionChooserKind::Default);
    assert_eq!(kinds[1], TransitionChooserKind::BidOther);
    assert_eq!(kinds[2], TransitionChooserKind::BidLeaveOther);
}
