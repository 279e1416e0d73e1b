// tests/pipeline.rs

//! Orchestrator runs against substitute preparer, builder and publisher.

mod common;

use autodeb::Error;
use autodeb::cancel::CancelFlag;
use autodeb::pipeline::PipelineOutcome;
use autodeb::state::{FailureStage, Outcome, PackagingState, PreparationFailure, Status};
use common::{Harness, version};
use std::sync::atomic::Ordering;

const ARCHS: &[&str] = &["amd64", "arm64"];

fn outcomes(state: &PackagingState) -> Vec<(String, Outcome)> {
    state
        .attempts
        .iter()
        .map(|a| (a.arch.clone(), a.outcome))
        .collect()
}

/// A success or failure at position i+1 requires a success at position i
fn assert_gated(state: &PackagingState) {
    for pair in state.attempts.windows(2) {
        if pair[1].outcome != Outcome::NotAttempted {
            assert_eq!(
                pair[0].outcome,
                Outcome::Success,
                "{} attempted after {} {}",
                pair[1].arch,
                pair[0].arch,
                pair[0].outcome
            );
        }
    }
}

#[test]
fn test_both_architectures_built_and_published() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);

    let outcome = h.run_next();
    assert_eq!(outcome, PipelineOutcome::Published(version("16.4.8")));
    assert!(!outcome.needs_attention());

    assert_eq!(h.preparer.prepared(), vec!["16.4.8"]);
    assert_eq!(h.builder.archs_built(), vec!["amd64", "arm64"]);

    let state = h.store.read(&version("16.4.8")).unwrap();
    assert_eq!(state.status, Status::Published);
    assert_eq!(
        outcomes(state),
        vec![
            ("amd64".to_string(), Outcome::Success),
            ("arm64".to_string(), Outcome::Success)
        ]
    );
    assert_eq!(
        state.auto_ref.as_ref().unwrap().tag,
        "auto/debian/16.4.8_pirogue1"
    );

    let staged: Vec<String> = h
        .publisher
        .staged()
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        staged,
        vec![
            "frida_16.4.8~pirogue1_amd64.deb",
            "frida_16.4.8~pirogue1_arm64.deb"
        ]
    );
    assert_eq!(h.preparer.pushed(), vec!["auto/debian/16.4.8_pirogue1"]);

    let messages = h.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("**Successful automatic packaging: 16.4.8**"));
    assert!(messages[0].contains("✅ build: amd64"));
    assert!(messages[0].contains("✅ build: arm64"));
    assert!(messages[0].contains("✅ push"));
}

#[test]
fn test_first_architecture_failure_stops_the_version() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.builder.fail("amd64", "debuild exited with code 2");

    let outcome = h.run_next();
    assert_eq!(outcome, PipelineOutcome::Failed(version("16.4.8")));
    assert!(outcome.needs_attention());

    assert_eq!(h.builder.archs_built(), vec!["amd64"]);
    assert!(h.publisher.staged().is_empty());
    assert!(h.preparer.pushed().is_empty());

    let state = h.store.read(&version("16.4.8")).unwrap();
    assert_eq!(state.status, Status::Failed);
    assert!(state.attempt("arm64").is_none());
    let failure = state.failure.as_ref().unwrap();
    assert_eq!(
        failure.stage,
        FailureStage::Building {
            arch: "amd64".to_string()
        }
    );

    let messages = h.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("**Failed automatic packaging: 16.4.8**"));
    assert!(messages[0].contains("❌ build: amd64: debuild exited with code 2"));
    assert!(!messages[0].contains("arm64"));
}

#[test]
fn test_later_architecture_failure_keeps_earlier_success() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.builder.fail("arm64", "timed out after 12h");

    assert_eq!(h.run_next(), PipelineOutcome::Failed(version("16.4.8")));
    let state = h.store.read(&version("16.4.8")).unwrap();
    assert_eq!(
        outcomes(state),
        vec![
            ("amd64".to_string(), Outcome::Success),
            ("arm64".to_string(), Outcome::Failure)
        ]
    );
    assert!(h.publisher.staged().is_empty());
}

#[test]
fn test_gating_holds_for_every_failure_position() {
    let archs = ["amd64", "arm64", "armhf"];
    for failing in archs {
        let mut h = Harness::new(&archs, &["16.4.8"]);
        h.builder.fail(failing, "failed");
        h.run_next();

        let state = h.store.read(&version("16.4.8")).unwrap();
        assert_gated(state);
        assert_eq!(h.builder.archs_built().last().map(String::as_str), Some(failing));
        let position = archs.iter().position(|a| *a == failing).unwrap();
        assert_eq!(h.builder.archs_built().len(), position + 1);
    }
}

#[test]
fn test_second_run_is_a_no_op() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.run_next();
    let document = h.store.document().clone();
    let builds = h.builder.calls().len();

    assert_eq!(h.run_next(), PipelineOutcome::Idle);
    assert_eq!(h.store.document(), &document);
    assert_eq!(h.builder.calls().len(), builds);
    assert_eq!(h.reopen().document(), &document);
}

#[test]
fn test_rewind_rebuilds_only_later_architectures() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.run_next();
    let v = version("16.4.8");
    let amd64 = h.store.read(&v).unwrap().attempt("amd64").unwrap().clone();

    h.store
        .rewind(&v, "arm64", Some("emulator was unreliable"))
        .unwrap();
    let state = h.store.read(&v).unwrap();
    assert_eq!(state.status, Status::Building);
    let rewound = state.attempt("arm64").unwrap();
    assert_eq!(rewound.outcome, Outcome::NotAttempted);
    let mark = rewound.rewound.as_ref().unwrap();
    assert_eq!(mark.previous_outcome, Outcome::Success);
    assert_eq!(mark.reason.as_deref(), Some("emulator was unreliable"));

    assert_eq!(h.run_next(), PipelineOutcome::Published(v.clone()));
    assert_eq!(h.builder.archs_built(), vec!["amd64", "arm64", "arm64"]);

    let state = h.store.read(&v).unwrap();
    assert_eq!(state.attempt("amd64").unwrap(), &amd64);
    assert_eq!(state.attempt("arm64").unwrap().outcome, Outcome::Success);
    assert_eq!(state.superseded.len(), 1);
    assert!(state.superseded[0].rewound.is_some());
}

#[test]
fn test_rewind_rejects_unknown_architecture_and_pending_version() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    let v = version("16.4.8");
    assert!(h.store.rewind(&v, "amd64", None).is_err());

    h.run_next();
    assert!(h.store.rewind(&v, "riscv64", None).is_err());
    assert_eq!(h.store.read(&v).unwrap().status, Status::Published);
}

#[test]
fn test_merge_conflict_blocks_until_retried() {
    let mut h = Harness::new(ARCHS, &["16.4.8", "16.5.0"]);
    h.preparer.conflict_on("16.4.8");

    assert_eq!(h.run_next(), PipelineOutcome::Failed(version("16.4.8")));
    let state = h.store.read(&version("16.4.8")).unwrap();
    assert_eq!(state.status, Status::Failed);
    assert_eq!(
        state.failure.as_ref().unwrap().stage,
        FailureStage::Preparing {
            kind: PreparationFailure::MergeConflict
        }
    );
    assert!(state.auto_ref.is_none());
    assert!(h.builder.calls().is_empty());
    assert!(h.messages()[0].contains("❌ prepare"));

    // The next version is not started behind the operator's back
    assert_eq!(h.run_next(), PipelineOutcome::Blocked(version("16.4.8")));
    assert!(h.store.read(&version("16.5.0")).is_none());
    assert!(h.builder.calls().is_empty());

    h.preparer.conflicts.lock().unwrap().clear();
    h.store
        .retry(&version("16.4.8"), Some("conflict resolved"))
        .unwrap();
    assert_eq!(
        h.store.read(&version("16.4.8")).unwrap().status,
        Status::Pending
    );

    assert_eq!(h.run_next(), PipelineOutcome::Published(version("16.4.8")));
    assert_eq!(h.run_next(), PipelineOutcome::Published(version("16.5.0")));
    assert_eq!(h.run_next(), PipelineOutcome::Idle);
}

#[test]
fn test_retry_after_build_failure_keeps_successful_architectures() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.builder.fail("arm64", "out of memory");
    h.run_next();

    h.builder.heal("arm64");
    h.store.retry(&version("16.4.8"), None).unwrap();
    assert_eq!(h.run_next(), PipelineOutcome::Published(version("16.4.8")));
    assert_eq!(h.builder.archs_built(), vec!["amd64", "arm64", "arm64"]);
    assert_eq!(h.preparer.prepared(), vec!["16.4.8"]);
}

#[test]
fn test_retry_rejects_versions_that_did_not_fail() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.run_next();
    assert!(h.store.retry(&version("16.4.8"), None).is_err());
    assert!(h.store.retry(&version("9.9.9"), None).is_err());
}

#[test]
fn test_publish_failure_leaves_version_built() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.publisher.fails.store(true, Ordering::SeqCst);

    let outcome = h.run_next();
    assert_eq!(outcome, PipelineOutcome::PublishFailed(version("16.4.8")));
    assert!(outcome.needs_attention());
    assert_eq!(
        h.store.read(&version("16.4.8")).unwrap().status,
        Status::Built
    );
    assert!(h.preparer.pushed().is_empty());

    h.publisher.fails.store(false, Ordering::SeqCst);
    assert_eq!(h.run_next(), PipelineOutcome::Published(version("16.4.8")));
    assert_eq!(h.builder.calls().len(), 2);
}

#[test]
fn test_push_failure_leaves_version_built() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.preparer.push_fails.store(true, Ordering::SeqCst);

    assert_eq!(
        h.run_next(),
        PipelineOutcome::PublishFailed(version("16.4.8"))
    );
    assert_eq!(
        h.store.read(&version("16.4.8")).unwrap().status,
        Status::Built
    );
    assert!(h.messages()[0].contains("❌ push"));
}

#[test]
fn test_unusable_working_tree_is_reported() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    *h.preparer.check_error.lock().unwrap() =
        Some("Local and remote debian/bookworm branches have diverged".to_string());

    let err = h.orchestrator().run_next().unwrap_err();
    assert!(matches!(err, Error::ConfigError(_)));
    assert!(h.store.read(&version("16.4.8")).is_none());
    assert!(h.builder.calls().is_empty());

    let messages = h.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0],
        "**❌ Packaging pipeline failed**\n\
         - Configuration error: Local and remote debian/bookworm branches have diverged"
    );

    // Fixed by the operator: the next run proceeds normally
    *h.preparer.check_error.lock().unwrap() = None;
    assert_eq!(h.run_next(), PipelineOutcome::Published(version("16.4.8")));
}

#[test]
fn test_cancellation_between_builds_resumes_later() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    *h.builder.cancel_after.lock().unwrap() = Some(("amd64".to_string(), h.cancel.clone()));

    assert_eq!(h.run_next(), PipelineOutcome::Interrupted(version("16.4.8")));
    assert!(h.messages().is_empty());
    let state = h.store.read(&version("16.4.8")).unwrap();
    assert_eq!(state.status, Status::Building);
    assert_eq!(state.next_build_index(), 1);

    // Someone pushed a fix to the automated branch in the meantime
    *h.preparer.head.lock().unwrap() = Some("deadbeef".to_string());
    *h.builder.cancel_after.lock().unwrap() = None;
    h.cancel = CancelFlag::new();

    assert_eq!(h.run_next(), PipelineOutcome::Published(version("16.4.8")));
    assert_eq!(h.builder.archs_built(), vec!["amd64", "arm64"]);
    let state = h.store.read(&version("16.4.8")).unwrap();
    assert_eq!(state.auto_ref.as_ref().unwrap().commit, "deadbeef");
    assert_eq!(
        state.attempt("arm64").unwrap().commit.as_deref(),
        Some("deadbeef")
    );
}

#[test]
fn test_run_all_processes_pending_versions_in_order() {
    let mut h = Harness::new(ARCHS, &["16.5.0", "16.4.8"]);

    let outcome = h.orchestrator().run_all().unwrap();
    assert_eq!(outcome, PipelineOutcome::Published(version("16.5.0")));
    assert_eq!(h.preparer.prepared(), vec!["16.4.8", "16.5.0"]);
    assert_eq!(h.builder.calls().len(), 4);
    assert_eq!(h.messages().len(), 2);
}

#[test]
fn test_run_all_stops_at_first_failure() {
    let mut h = Harness::new(ARCHS, &["16.4.8", "16.5.0"]);
    h.preparer.conflict_on("16.4.8");

    let outcome = h.orchestrator().run_all().unwrap();
    assert_eq!(outcome, PipelineOutcome::Failed(version("16.4.8")));
    assert!(h.store.read(&version("16.5.0")).is_none());
}

#[test]
fn test_state_survives_reopen() {
    let mut h = Harness::new(ARCHS, &["16.4.8"]);
    h.builder.fail("arm64", "failed");
    h.run_next();

    let reopened = h.reopen();
    assert_eq!(reopened.document(), h.store.document());
    assert_eq!(
        reopened.read(&version("16.4.8")).unwrap().status,
        Status::Failed
    );
}
