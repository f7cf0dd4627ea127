//! Lifecycle tests for full orchestrator scenarios.
//!
//! These drive `submit` through scripted sessions and verifiers to verify
//! end-to-end behavior: decomposition, intervention, verification-gated
//! completion, reward backpropagation, pruning, and invariant preservation.

use std::sync::Arc;

use serde_json::json;

use overseer::core::hooks::{HookDecision, HookEvent, HookEventKind, HookRegistration};
use overseer::core::rules::{Rule, RuleAction, RuleSpec};
use overseer::errors::OverseerError;
use overseer::io::event_log::{kinds, read_task_events};
use overseer::io::session::SessionCommand;
use overseer::orchestrator::Orchestrator;
use overseer::task::{DecompositionPattern, TaskOptions, TaskStatus};
use overseer::test_support::{
    ScriptedSession, ScriptedSessionRunner, ScriptedVerdict, ScriptedVerifier, TestProject,
    evidence, temp_project, test_config,
};

fn arena() -> TestProject {
    temp_project()
}

fn confirm_rule() -> Rule {
    Rule::compile(RuleSpec {
        id: "confirm".to_string(),
        pattern: r"\[y/N\]".to_string(),
        action: RuleAction::Send {
            input: "y\n".to_string(),
        },
        priority: 10,
        cooldown_ms: 5_000,
    })
    .expect("valid rule")
}

fn options(pattern: DecompositionPattern, fan_out: u32) -> TaskOptions {
    TaskOptions {
        decomposition_pattern: pattern,
        fan_out,
        max_depth: 3,
        live_notify: false,
    }
}

/// The fan-out scenario: one parent, three children at depth 1, rewards
/// backpropagated with decay once all children exit 0 with verified files.
#[test]
fn fan_out_creates_linked_children_and_decayed_parent_reward() {
    let arena = arena();
    let runner = Arc::new(ScriptedSessionRunner::new(vec![
        ScriptedSession::succeeding(&["working on part 1\n"]),
        ScriptedSession::succeeding(&["working on part 2\n"]),
        ScriptedSession::succeeding(&["working on part 3\n"]),
    ]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        ScriptedVerdict::Evidence(evidence(&["calc.py"], 1, 0)),
        ScriptedVerdict::Evidence(evidence(&["test_calc.py"], 1, 0)),
        ScriptedVerdict::Evidence(evidence(&["README.txt"], 1, 0)),
    ]));
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(runner)
        .verifier(verifier)
        .build()
        .expect("build");

    // A fan_out of 3 decomposes even without an explicit pattern.
    let root_id = orchestrator
        .submit("create calculator", options(DecompositionPattern::None, 3))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let tasks = orchestrator.status("*");
    assert_eq!(tasks.len(), 4, "1 parent + 3 children");

    let parent = tasks.iter().find(|t| t.id == root_id).expect("parent");
    let children: Vec<_> = tasks.iter().filter(|t| t.id != root_id).collect();
    assert_eq!(children.len(), 3);
    for child in &children {
        assert_eq!(child.parent_id.as_deref(), Some(root_id.as_str()));
        assert_eq!(child.depth, 1);
        assert_eq!(child.status, TaskStatus::Completed);
        assert_eq!(child.visits, 1);
    }
    assert_eq!(parent.status, TaskStatus::Completed);
    assert_eq!(parent.visits, 3);

    // Each child earned 1.0 (artifact + passing check); the parent holds the
    // decayed sum 0.9 * (1 + 1 + 1).
    let child_sum: f64 = children.iter().map(|c| c.total_reward).sum();
    assert!((child_sum - 3.0).abs() < 1e-9);
    assert!((parent.total_reward - 0.9 * child_sum).abs() < 1e-9);
    assert!((parent.average_reward() - parent.total_reward / 3.0).abs() < 1e-9);

    // Terminal statuses imply no open sessions, and the snapshot is sound.
    assert!(orchestrator.check_invariants().is_empty());
}

/// A matched prompt pattern injects the rule's input exactly once.
#[test]
fn intervention_rule_fires_and_injects_input() {
    let arena = arena();
    let runner = Arc::new(ScriptedSessionRunner::new(vec![ScriptedSession::succeeding(&[
        "setting up\n",
        "Do you want to continue? [y/N] ",
        "continuing\n",
    ])]));
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(runner.clone())
        .verifier(Arc::new(ScriptedVerifier::empty()))
        .rules(vec![confirm_rule()])
        .build()
        .expect("build");

    let root_id = orchestrator
        .submit("install deps", options(DecompositionPattern::None, 1))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let commands = runner.commands_for(&root_id);
    assert_eq!(
        commands,
        vec![SessionCommand::Write(b"y\n".to_vec())],
        "exactly one injection for the matched prompt"
    );

    // The intervention is on the task's event record, and the task moved
    // through intervened on its way to completion.
    let events = read_task_events(
        &arena.root.join(".overseer").join("events.jsonl"),
        &root_id,
    )
    .expect("events");
    assert!(events.iter().any(|e| e.kind == kinds::INTERVENTION && e.payload["fired"] == json!(true)));
    let task = &orchestrator.status(&root_id)[0];
    assert_eq!(task.status, TaskStatus::Completed);
}

/// Reward comes from evidence, never from the transcript: a session that
/// loudly claims success but produces no artifacts scores at most zero.
#[test]
fn self_reported_success_without_artifacts_earns_nothing() {
    let arena = arena();
    let runner = Arc::new(ScriptedSessionRunner::new(vec![ScriptedSession::succeeding(&[
        "ALL DONE! Everything works perfectly, all tests pass!\n",
    ])]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![ScriptedVerdict::Evidence(
        evidence(&[], 0, 0),
    )]));
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(runner)
        .verifier(verifier)
        .build()
        .expect("build");

    let root_id = orchestrator
        .submit("fix the bug", options(DecompositionPattern::None, 1))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let task = &orchestrator.status(&root_id)[0];
    assert!(task.total_reward <= 0.0);
}

/// A non-zero exit forces reward -1 and prunes the branch.
#[test]
fn nonzero_exit_fails_and_prunes() {
    let arena = arena();
    let runner = Arc::new(ScriptedSessionRunner::new(vec![ScriptedSession::exiting(2)]));
    let verifier = Arc::new(ScriptedVerifier::empty());
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(runner)
        .verifier(verifier)
        .build()
        .expect("build");

    let root_id = orchestrator
        .submit("doomed", options(DecompositionPattern::None, 1))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let task = &orchestrator.status(&root_id)[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.total_reward, -1.0);
    assert!(task.archived, "pruned branches are archived, not deleted");

    let events = read_task_events(
        &arena.root.join(".overseer").join("events.jsonl"),
        &root_id,
    )
    .expect("events");
    assert!(events.iter().any(|e| e.kind == kinds::BRANCH_PRUNED));
    assert!(orchestrator.check_invariants().is_empty());
}

/// An unreachable verification collaborator holds the task unverified: it
/// is never marked completed, and the branch is not pruned like a failure.
#[test]
fn verification_outage_never_completes_the_task() {
    let arena = arena();
    let runner = Arc::new(ScriptedSessionRunner::new(vec![ScriptedSession::succeeding(&[
        "did things\n",
    ])]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![ScriptedVerdict::Unavailable]));
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(runner)
        .verifier(verifier)
        .build()
        .expect("build");

    let root_id = orchestrator
        .submit("anything", options(DecompositionPattern::None, 1))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let task = &orchestrator.status(&root_id)[0];
    assert_ne!(task.status, TaskStatus::Completed);
    assert_eq!(task.visits, 0, "no reward recorded without evidence");
    assert!(!task.archived, "an outage is not a pruning failure");

    let events = read_task_events(
        &arena.root.join(".overseer").join("events.jsonl"),
        &root_id,
    )
    .expect("events");
    assert!(events.iter().any(|e| e.kind == kinds::VERIFICATION_UNAVAILABLE));
}

/// Validation hooks gate submission: the first block wins and nothing runs.
#[test]
fn blocking_validation_hook_rejects_submission() {
    let arena = arena();
    let hook = HookRegistration::new(
        "deny-all",
        vec![HookEventKind::RequestReceived],
        100,
        Arc::new(|_event: &HookEvent| HookDecision::Block {
            reason: "not today".to_string(),
        }),
    );
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(Arc::new(ScriptedSessionRunner::new(Vec::new())))
        .verifier(Arc::new(ScriptedVerifier::empty()))
        .hook(hook)
        .build()
        .expect("build");

    let err = orchestrator
        .submit("anything", options(DecompositionPattern::None, 1))
        .unwrap_err();
    match err.downcast_ref::<OverseerError>() {
        Some(OverseerError::Blocked { hook, reason }) => {
            assert_eq!(hook, "deny-all");
            assert_eq!(reason, "not today");
        }
        other => panic!("expected blocked, got {other:?}"),
    }
    assert!(orchestrator.status("*").is_empty());
}

/// `Modify` patches from validation hooks rewrite the prompt before the
/// task is created.
#[test]
fn modify_hook_rewrites_prompt() {
    let arena = arena();
    let hook = HookRegistration::new(
        "prompt-prefix",
        vec![HookEventKind::RequestReceived],
        10,
        Arc::new(|event: &HookEvent| {
            let original = event.payload["prompt"].as_str().unwrap_or_default();
            HookDecision::Modify {
                patch: json!({"prompt": format!("[audited] {original}")}),
            }
        }),
    );
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(Arc::new(ScriptedSessionRunner::new(vec![
            ScriptedSession::succeeding(&[]),
        ])))
        .verifier(Arc::new(ScriptedVerifier::empty()))
        .hook(hook)
        .build()
        .expect("build");

    let root_id = orchestrator
        .submit("create calculator", options(DecompositionPattern::None, 1))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let task = &orchestrator.status(&root_id)[0];
    assert_eq!(task.prompt, "[audited] create calculator");
}

/// Sequential decomposition feeds each step the previous step's evidence
/// summary rather than the raw transcript.
#[test]
fn sequential_steps_see_previous_evidence_summary() {
    let arena = arena();
    let runner = Arc::new(ScriptedSessionRunner::new(vec![
        ScriptedSession::succeeding(&["step one\n"]),
        ScriptedSession::succeeding(&["step two\n"]),
    ]));
    let verifier = Arc::new(ScriptedVerifier::new(vec![
        ScriptedVerdict::Evidence(evidence(&["calc.py"], 0, 0)),
        ScriptedVerdict::Evidence(evidence(&["test_calc.py"], 0, 0)),
    ]));
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(runner)
        .verifier(verifier)
        .build()
        .expect("build");

    let root_id = orchestrator
        .submit("build then test", options(DecompositionPattern::Sequential, 2))
        .expect("submit");
    orchestrator.join(&root_id).expect("join");

    let tasks = orchestrator.status("*");
    assert_eq!(tasks.len(), 3, "parent + 2 sequential steps");
    let second = tasks
        .iter()
        .find(|t| t.id.ends_with(".2"))
        .expect("second step");
    assert!(
        second.prompt.contains("calc.py"),
        "step 2 prompt should carry step 1's evidence summary"
    );
    assert_eq!(
        tasks.iter().find(|t| t.id == root_id).expect("parent").status,
        TaskStatus::Completed
    );
}

/// Requests against unknown tasks are typed errors, not panics.
#[test]
fn unknown_task_requests_are_rejected() {
    let arena = arena();
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(Arc::new(ScriptedSessionRunner::new(Vec::new())))
        .verifier(Arc::new(ScriptedVerifier::empty()))
        .build()
        .expect("build");

    assert!(matches!(
        orchestrator.send("t99", b"hello"),
        Err(OverseerError::UnknownTask(_))
    ));
    assert!(matches!(
        orchestrator.output("t99", None),
        Err(OverseerError::UnknownTask(_))
    ));
    assert!(matches!(
        orchestrator.interrupt("t99", None),
        Err(OverseerError::UnknownTask(_))
    ));
}

/// Live monitors receive the event stream when the submission opts in, and
/// a dropped receiver never wedges execution.
#[test]
fn live_notify_pushes_events_to_monitors() {
    let arena = arena();
    let orchestrator = Orchestrator::builder(test_config(), &arena.root)
        .session_runner(Arc::new(ScriptedSessionRunner::new(vec![
            ScriptedSession::succeeding(&["hello\n"]),
        ])))
        .verifier(Arc::new(ScriptedVerifier::empty()))
        .build()
        .expect("build");

    let subscription = orchestrator.attach_monitor();
    let mut opts = options(DecompositionPattern::None, 1);
    opts.live_notify = true;
    let root_id = orchestrator.submit("anything", opts).expect("submit");
    orchestrator.join(&root_id).expect("join");

    let received: Vec<_> = subscription.receiver.try_iter().collect();
    assert!(
        received.iter().any(|e| e.kind == kinds::TASK_SUBMITTED),
        "monitor should see the submission"
    );
    assert!(received.iter().any(|e| e.kind == kinds::SESSION_CLOSED));
    orchestrator.detach_monitor(subscription.id);
}
