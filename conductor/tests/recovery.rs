//! Crash recovery: a second process resumes the execution a first one left
//! running, without repeating settled work.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use serde_json::json;

use conductor::core::identity::assign_ids;
use conductor::core::plan::{ExecState, Node, NodeStatus};
use conductor::core::types::{AgentStatus, ExecutionStatus};
use conductor::io::config::{ExecutionConfig, OrphanPolicy};
use conductor::io::store::{NewAgent, Store};
use conductor::scheduler::{Runtime, Scheduler, keys};
use conductor::test_support::{ScriptedBackend, counting_tool, fixed_render};

fn workflow() -> Node {
    Node::group(vec![
        Node::tool("echo", json!("first")).with_key("first"),
        Node::tool("echo", json!("second")).with_key("second"),
    ])
}

#[test]
fn resume_reruns_only_unsettled_nodes_and_fails_orphans() {
    let state = tempfile::tempdir().expect("tempdir");

    // First process: starts the execution, finishes one node, then dies with
    // an agent still marked running.
    let (execution_id, orphan) = {
        let store = Store::open(state.path()).expect("store");
        let config = serde_json::to_value(ExecutionConfig::default()).expect("config");
        let execution_id = store
            .start_execution("workflow", None, &config, None)
            .expect("start");
        let mut tree = workflow();
        assign_ids(&mut tree).expect("ids");
        let done = ExecState {
            status: NodeStatus::Completed,
            result_summary: Some("\"first\"".to_string()),
            ..ExecState::default()
        };
        store
            .set_state(
                &keys::node(&execution_id, &tree.children[0].id),
                &serde_json::to_value(&done).expect("exec"),
                "node:completed",
            )
            .expect("seed node");
        let orphan = store
            .start_agent(&NewAgent {
                execution_id: &execution_id,
                node_id: &tree.children[1].id,
                prompt: "half way",
                model: "sonnet",
            })
            .expect("agent");
        store.record_iteration(&execution_id, 1).expect("iteration");
        store.close().expect("close");
        (execution_id, orphan)
    };

    // Second process.
    let (tool, calls) = counting_tool();
    let store = Store::open(state.path()).expect("reopen");
    let runtime = Arc::new(
        Runtime::new(store, Arc::new(ScriptedBackend::new(Vec::new()))).with_tool("echo", tool),
    );
    let mut scheduler = Scheduler::resume(
        Arc::clone(&runtime),
        Arc::new(fixed_render(workflow())),
        ExecutionConfig::default(),
    )
    .expect("resume")
    .expect("incomplete execution");
    assert_eq!(scheduler.execution_id(), execution_id);
    assert_eq!(scheduler.iteration(), 1);

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let agent = runtime
        .store()
        .get_agent(&orphan)
        .expect("get agent")
        .expect("agent");
    assert_eq!(agent.status, AgentStatus::Failed);
    assert!(
        runtime
            .store()
            .find_incomplete_execution()
            .expect("find")
            .is_none()
    );
}

#[test]
fn resume_without_running_execution_returns_none() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = Store::open(state.path()).expect("store");
    let runtime = Arc::new(Runtime::new(store, Arc::new(ScriptedBackend::new(Vec::new()))));

    let resumed = Scheduler::resume(
        runtime,
        Arc::new(fixed_render(workflow())),
        ExecutionConfig::default(),
    )
    .expect("resume");

    assert!(resumed.is_none());
}

/// Seed an execution whose first node finished and whose second node was
/// running when the process died.
fn seed_interrupted(store: &Store) -> String {
    let config = serde_json::to_value(ExecutionConfig::default()).expect("config");
    let execution_id = store
        .start_execution("workflow", None, &config, None)
        .expect("start");
    let mut tree = workflow();
    assign_ids(&mut tree).expect("ids");
    for (node, status) in [
        (&tree.children[0], NodeStatus::Completed),
        (&tree.children[1], NodeStatus::Running),
    ] {
        let exec = ExecState {
            status,
            ..ExecState::default()
        };
        store
            .set_state(
                &keys::node(&execution_id, &node.id),
                &serde_json::to_value(&exec).expect("exec"),
                "test",
            )
            .expect("seed node");
    }
    execution_id
}

#[test]
fn orphaned_nodes_rerun_by_default() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = Store::open(state.path()).expect("store");
    seed_interrupted(&store);
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(
        Runtime::new(store, Arc::new(ScriptedBackend::new(Vec::new()))).with_tool("echo", tool),
    );

    let mut scheduler = Scheduler::resume(
        Arc::clone(&runtime),
        Arc::new(fixed_render(workflow())),
        ExecutionConfig::default(),
    )
    .expect("resume")
    .expect("incomplete execution");
    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn fail_policy_fails_orphaned_nodes_instead_of_rerunning() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = Store::open(state.path()).expect("store");
    let execution_id = seed_interrupted(&store);
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(
        Runtime::new(store, Arc::new(ScriptedBackend::new(Vec::new()))).with_tool("echo", tool),
    );
    let config = ExecutionConfig {
        orphan_policy: OrphanPolicy::Fail,
        ..ExecutionConfig::default()
    };

    let mut scheduler = Scheduler::resume(
        Arc::clone(&runtime),
        Arc::new(fixed_render(workflow())),
        config,
    )
    .expect("resume")
    .expect("incomplete execution");
    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.execution_id, execution_id);
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|e| e.contains("orphaned by crash"))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.children[1].exec.status, NodeStatus::Failed);
}

#[test]
fn global_timeout_counts_time_before_the_resume() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = Store::open(state.path()).expect("store");
    let config = serde_json::to_value(ExecutionConfig::default()).expect("config");
    let execution_id = store
        .start_execution("workflow", None, &config, None)
        .expect("start");
    thread::sleep(Duration::from_millis(1_100));

    let (tool, _) = counting_tool();
    let runtime = Arc::new(
        Runtime::new(store, Arc::new(ScriptedBackend::new(Vec::new()))).with_tool("echo", tool),
    );
    let config = ExecutionConfig {
        global_timeout_secs: Some(1),
        ..ExecutionConfig::default()
    };
    let mut scheduler = Scheduler::resume(
        Arc::clone(&runtime),
        Arc::new(fixed_render(workflow())),
        config,
    )
    .expect("resume")
    .expect("incomplete execution");
    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.execution_id, execution_id);
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.end_reason, "global_timeout");
    assert_eq!(outcome.iterations, 1);
}
