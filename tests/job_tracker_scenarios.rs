use shuttlecore::{
    AttemptState, CheckpointManager, CoreConfig, Job, JobState, JobTracker, LoggingClusterRuntime, LoggingWorkerApi,
    NodeSpec, ResourceManager, StageConfig, StageState,
};
use std::sync::Arc;
use std::time::Duration;

async fn tracker_for(successors: Vec<Vec<usize>>, totals: Vec<u64>, retry_budget: u32) -> JobTracker {
    let job = Job::new_pending("word-count".to_string(), 0);
    let node_specs = totals
        .into_iter()
        .map(|total| NodeSpec {
            resource: ResourceManager::new_id(total),
            config: StageConfig {
                capacity: 2,
                retry_budget,
                duplicates_enabled: false,
                duplicate_cap: 1,
            },
        })
        .collect();
    let checkpoint = Arc::new(CheckpointManager::new_in_memory().await.unwrap());
    JobTracker::new(
        job,
        successors,
        node_specs,
        Arc::new(CoreConfig::default()),
        Arc::new(LoggingClusterRuntime),
        Arc::new(LoggingWorkerApi),
        checkpoint,
    )
    .unwrap()
}

async fn drain_node(tracker: &JobTracker, node: usize, outcome: AttemptState) {
    loop {
        match tracker.assign(node, "w1").unwrap() {
            shuttlecore::AssignOutcome::Unit { unit_no, attempt_no, .. } => {
                tracker.finish(node, unit_no, attempt_no, "w1", outcome).unwrap();
            }
            shuttlecore::AssignOutcome::Wait => tokio::time::sleep(Duration::from_millis(1)).await,
            shuttlecore::AssignOutcome::NoMore => break,
        }
    }
}

#[tokio::test]
async fn map_reduce_two_stage_dag_unlocks_reduce_after_map_completes() {
    // Node 0 (map): 5 units. Node 1 (reduce): 3 partitions. 0 -> 1.
    let tracker = tracker_for(vec![vec![1], vec![]], vec![5, 3], 3).await;
    tracker.start();
    assert_eq!(tracker.stage_state(1).unwrap(), StageState::Pending);

    drain_node(&tracker, 0, AttemptState::Completed).await;
    assert_eq!(tracker.stage_state(0).unwrap(), StageState::Completed);

    drain_node(&tracker, 1, AttemptState::Completed).await;
    assert_eq!(tracker.stage_state(1).unwrap(), StageState::Completed);

    assert!(matches!(tracker.job().state, JobState::Completed { .. }));
}

#[tokio::test]
async fn unit_failing_twice_then_succeeding_completes_the_stage() {
    let tracker = tracker_for(vec![vec![]], vec![1], 3).await;
    tracker.start();

    for _ in 0..2 {
        let (unit_no, attempt_no) = match tracker.assign(0, "w1").unwrap() {
            shuttlecore::AssignOutcome::Unit { unit_no, attempt_no, .. } => (unit_no, attempt_no),
            other => panic!("expected unit, got {other:?}"),
        };
        tracker.finish(0, unit_no, attempt_no, "w1", AttemptState::Failed).unwrap();
    }

    let (unit_no, attempt_no) = match tracker.assign(0, "w1").unwrap() {
        shuttlecore::AssignOutcome::Unit { unit_no, attempt_no, .. } => (unit_no, attempt_no),
        other => panic!("expected unit, got {other:?}"),
    };
    tracker.finish(0, unit_no, attempt_no, "w1", AttemptState::Completed).unwrap();

    assert_eq!(tracker.stage_state(0).unwrap(), StageState::Completed);
    assert!(matches!(tracker.job().state, JobState::Completed { .. }));
}

#[tokio::test]
async fn unit_exhausting_retry_budget_fails_the_whole_two_stage_job() {
    // Node 0 -> node 1; node 0's only unit fails twice against a budget of 2.
    let tracker = tracker_for(vec![vec![1], vec![]], vec![1, 1], 2).await;
    tracker.start();

    for _ in 0..2 {
        let (unit_no, attempt_no) = match tracker.assign(0, "w1").unwrap() {
            shuttlecore::AssignOutcome::Unit { unit_no, attempt_no, .. } => (unit_no, attempt_no),
            other => panic!("expected unit, got {other:?}"),
        };
        tracker.finish(0, unit_no, attempt_no, "w1", AttemptState::Failed).unwrap();
    }

    assert_eq!(tracker.stage_state(0).unwrap(), StageState::Failed);
    // Node 1 never had a chance to start, so killing it still marks it terminal.
    assert_eq!(tracker.stage_state(1).unwrap(), StageState::Killed);
    assert!(matches!(tracker.job().state, JobState::Failed { .. }));
}
