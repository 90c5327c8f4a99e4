use shuttlecore::{
    AssignOutcome, AttemptState, CheckpointManager, CoreConfig, Job, JobTracker, LoggingClusterRuntime,
    LoggingWorkerApi, NodeSpec, ResourceManager, StageConfig,
};
use std::collections::HashSet;
use std::sync::Arc;

#[tokio::test]
async fn stragglers_near_the_end_get_duplicated_and_the_loser_is_canceled() {
    // 12 units, end-game kicks in once 10 are done (end_game_pct = 100, so
    // end_game_begin(12) = max(2, 0) = 2... too aggressive for this test, so
    // instead we set end_game_pct low enough that end_game_begin(12) lands
    // right at 10, matching the documented "12 units, 10 done, 2 stragglers"
    // scenario: max(12 - 10, 12 - 12*pct/100) = 10 requires pct <= ~17.
    let core_config = CoreConfig {
        end_game_pct: 17,
        ..CoreConfig::default()
    };
    assert_eq!(core_config.end_game_begin(12), 10);

    let job = Job::new_pending("word-count".to_string(), 0);
    let node_specs = vec![NodeSpec {
        resource: ResourceManager::new_id(12),
        config: StageConfig {
            capacity: 12,
            retry_budget: 3,
            duplicates_enabled: true,
            duplicate_cap: 2,
        },
    }];
    let checkpoint = Arc::new(CheckpointManager::new_in_memory().await.unwrap());
    let tracker = JobTracker::new(
        job,
        vec![vec![]],
        node_specs,
        Arc::new(core_config),
        Arc::new(LoggingClusterRuntime),
        Arc::new(LoggingWorkerApi),
        checkpoint,
    )
    .unwrap();
    tracker.start();

    // Assign and complete 10 units, leaving 2 allocated stragglers.
    let mut straggler_units = HashSet::new();
    for i in 0..12 {
        let (unit_no, attempt_no) = match tracker.assign(0, "w1").unwrap() {
            AssignOutcome::Unit { unit_no, attempt_no, .. } => (unit_no, attempt_no),
            other => panic!("expected a fresh unit, got {other:?}"),
        };
        if i < 10 {
            tracker.finish(0, unit_no, attempt_no, "w1", AttemptState::Completed).unwrap();
        } else {
            straggler_units.insert(unit_no);
        }
    }
    assert_eq!(straggler_units.len(), 2);

    // The next two Assign calls must each hand back a duplicate of one of
    // the two outstanding stragglers rather than Wait or NoMore.
    let mut dup_attempts = Vec::new();
    for _ in 0..2 {
        match tracker.assign(0, "w2").unwrap() {
            AssignOutcome::Unit {
                unit_no,
                attempt_no,
                duplicate,
                ..
            } => {
                assert!(duplicate, "expected a duplicate assignment during end-game");
                assert!(straggler_units.contains(&unit_no));
                dup_attempts.push((unit_no, attempt_no));
            }
            other => panic!("expected a duplicate unit, got {other:?}"),
        }
    }

    // A loser reporting late after its twin already completed the same
    // unit must be reclassified, not double-counted.
    let (unit_no, attempt_no) = dup_attempts[0];
    tracker.finish(0, unit_no, attempt_no, "w2", AttemptState::Completed).unwrap();
    assert_eq!(tracker.stage_state(0).unwrap(), shuttlecore::StageState::Running);

    tracker.finish(0, dup_attempts[1].0, dup_attempts[1].1, "w2", AttemptState::Completed).unwrap();
    assert_eq!(tracker.stage_state(0).unwrap(), shuttlecore::StageState::Completed);
}
