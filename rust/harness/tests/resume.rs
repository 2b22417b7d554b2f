//! Stopping at `exit_stage`, restarting from the stage recorded in
//! `state.json`, and checking that an interrupted run ends with the same
//! checkpoints as one that was never stopped.

mod common;

use std::fs;

use common::{FakeToolkit, checkpoint, experiment, scheduler};
use rnn_config::StageSpec;
use rnn_harness::{
    RunOutcome, RunStatus, StateManager,
    state::Phase,
};

#[tokio::test]
async fn test_exit_stage_stops_before_iteration() {
    let (dir, mut opts) = experiment();
    opts.cleanup = false;
    opts.exit_stage = Some(5);
    let toolkit = FakeToolkit::default();

    let outcome = scheduler(opts, toolkit.clone(), None).run().await.unwrap();
    assert_eq!(outcome, RunOutcome::ExitedEarly { iter: 5 });
    assert_eq!(toolkit.iterations(), vec![0, 1, 2, 3, 4]);

    let root = dir.path();
    assert!((0..=5).all(|i| checkpoint(root, i).exists()));
    assert!(!checkpoint(root, 6).exists());

    let state = StateManager::for_dir(root).load().unwrap();
    assert_eq!(state.status, RunStatus::Exited);
    assert_eq!(state.phase, Phase::Iterating);
    assert_eq!(state.resume_stage(), Some(5));
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() {
    let (straight, mut opts) = experiment();
    opts.cleanup = false;
    scheduler(opts, FakeToolkit::default(), None)
        .run()
        .await
        .unwrap();

    let (resumed, mut opts) = experiment();
    opts.cleanup = false;
    opts.exit_stage = Some(5);
    scheduler(opts.clone(), FakeToolkit::default(), None)
        .run()
        .await
        .unwrap();

    let state = StateManager::for_dir(resumed.path()).load().unwrap();
    opts.exit_stage = None;
    opts.stage = StageSpec::Index(state.resume_stage().unwrap());
    let toolkit = FakeToolkit::default();
    let outcome = scheduler(opts, toolkit.clone(), None).run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed { num_iters: 13 });
    assert_eq!(toolkit.iterations(), (5..13).collect::<Vec<_>>());
    assert_eq!(toolkit.calls.lock().unwrap().egs, 0);

    for i in 0..=13 {
        assert_eq!(
            fs::read(checkpoint(straight.path(), i)).unwrap(),
            fs::read(checkpoint(resumed.path(), i)).unwrap(),
            "checkpoint {i} differs"
        );
    }
    assert_eq!(
        fs::read(straight.path().join("final.raw")).unwrap(),
        fs::read(resumed.path().join("final.raw")).unwrap()
    );

    let state = StateManager::for_dir(resumed.path()).load().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.attempts, 2);
}

#[tokio::test]
async fn test_start_at_combine() {
    let (dir, mut opts) = experiment();
    opts.cleanup = false;
    scheduler(opts.clone(), FakeToolkit::default(), None)
        .run()
        .await
        .unwrap();
    fs::remove_file(dir.path().join("final.raw")).unwrap();

    opts.stage = StageSpec::Combine;
    let toolkit = FakeToolkit::default();
    scheduler(opts, toolkit.clone(), None).run().await.unwrap();

    let calls = toolkit.calls.lock().unwrap();
    assert!(calls.iterations.is_empty());
    assert_eq!(calls.combined, vec![11, 12, 13]);
    assert_eq!(calls.priors, 1);
    assert!(dir.path().join("final.raw").exists());
}

#[test]
fn test_crashed_run_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let sm = StateManager::for_dir(dir.path());

    // A PID that cannot belong to a live process.
    sm.mark_started(u32::MAX).unwrap();
    sm.mark_stage_completed(7).unwrap();

    assert!(sm.recover_crashed().unwrap());
    let state = sm.load().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.phase, Phase::Aborted);
    assert_eq!(state.resume_stage(), Some(8));

    // Nothing to recover the second time.
    assert!(!sm.recover_crashed().unwrap());
}
