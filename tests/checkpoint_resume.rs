use shuttlecore::{
    AssignOutcome, AttemptState, CheckpointManager, CoreConfig, Job, JobSnapshot, JobState, JobStateMachine,
    JobTracker, LoggingClusterRuntime, LoggingWorkerApi, NodeSnapshot, ResourceManager, StageConfig,
};
use std::sync::Arc;

#[tokio::test]
async fn resumed_tracker_resets_in_flight_attempts_to_pending_and_keeps_completed_work() {
    let checkpoint = Arc::new(CheckpointManager::new_in_memory().await.unwrap());

    let job = Job::new_pending("word-count".to_string(), 0);
    let job_id = job.id;
    let mut sm = JobStateMachine::new(job);
    sm.start().unwrap();
    let running_job = sm.into_job();
    assert!(matches!(running_job.state, JobState::Running { .. }));

    // Simulate a coordinator that crashed mid-job: one node, 4 units, one
    // already done, one allocated (in flight when the process died), two
    // still pending.
    let mut resource = ResourceManager::new_id(4);
    let done_unit = match resource.acquire() {
        shuttlecore::Acquisition::Unit { unit_no, .. } => unit_no,
        other => panic!("expected unit, got {other:?}"),
    };
    resource.complete(done_unit).unwrap();
    let in_flight_unit = match resource.acquire() {
        shuttlecore::Acquisition::Unit { unit_no, .. } => unit_no,
        other => panic!("expected unit, got {other:?}"),
    };
    assert_eq!(resource.counters().allocated, 1);
    assert_eq!(resource.counters().pending, 2);

    let snapshot = JobSnapshot {
        job: running_job,
        successors: vec![vec![]],
        dag_in_degree: vec![0],
        dag_started: vec![true],
        nodes: vec![NodeSnapshot {
            node: 0,
            resource,
            config: StageConfig {
                capacity: 2,
                retry_budget: 3,
                duplicates_enabled: false,
                duplicate_cap: 1,
            },
        }],
    };
    checkpoint.save_snapshot(job_id, &snapshot).await.unwrap();

    let loaded = checkpoint.load_snapshot(job_id).await.unwrap().expect("snapshot must exist");
    let resumed = JobTracker::resume(
        loaded,
        Arc::new(CoreConfig::default()),
        Arc::new(LoggingClusterRuntime),
        Arc::new(LoggingWorkerApi),
        checkpoint.clone(),
    )
    .unwrap();

    // The in-flight unit is back in the pending pool: three units (the two
    // genuinely pending ones plus the reset in-flight one), not one, are
    // left to hand out.
    let mut remaining = Vec::new();
    loop {
        match resumed.assign(0, "w-resumed").unwrap() {
            AssignOutcome::Unit { unit_no, attempt_no, .. } => {
                remaining.push(unit_no);
                resumed.finish(0, unit_no, attempt_no, "w-resumed", AttemptState::Completed).unwrap();
            }
            AssignOutcome::NoMore => break,
            AssignOutcome::Wait => tokio::time::sleep(std::time::Duration::from_millis(1)).await,
        }
    }
    assert_eq!(remaining.len(), 3);
    assert!(remaining.contains(&in_flight_unit));
    assert!(!remaining.contains(&done_unit));
    assert!(matches!(resumed.job().state, JobState::Completed { .. }));
}
