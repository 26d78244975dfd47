//! End-to-end scheduler scenarios.
//!
//! Each test drives a full execution against a real state store and checks
//! what the store recorded afterwards.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use conductor::core::identity::assign_ids;
use conductor::core::loops::{LoopState, LoopStatus};
use conductor::core::plan::{ExecState, Node, NodeStatus};
use conductor::core::types::{ExecutionStatus, UnitStatus};
use conductor::io::config::{AgentDefaults, ExecutionConfig, ToolDefaults};
use conductor::io::store::Store;
use conductor::io::vcs::git::GitStore;
use conductor::scheduler::{RenderContext, Runtime, Scheduler, ToolFn, keys, tool_fn};
use conductor::sequencer::{SequenceState, sequence_key};
use conductor::test_support::{
    ScriptedBackend, ScriptedReply, TestRepo, counting_tool, failing_tool, fixed_render,
    sleeping_tool,
};

fn open_store(dir: &tempfile::TempDir) -> Store {
    Store::open(dir.path()).expect("store")
}

fn no_agents() -> Arc<ScriptedBackend> {
    Arc::new(ScriptedBackend::new(Vec::new()))
}

/// One node that completes on its first activation ends the run by
/// quiescence on the next frame, long before `max_iterations`.
#[test]
fn single_node_quiesces_before_max_iterations() {
    let state = tempfile::tempdir().expect("tempdir");
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(Runtime::new(open_store(&state), no_agents()).with_tool("echo", tool));
    let config = ExecutionConfig {
        max_iterations: 3,
        ..ExecutionConfig::default()
    };
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(Node::tool("echo", json!("hi")))),
        config,
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.end_reason, "quiescent");
    assert_eq!(outcome.iterations, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let record = runtime
        .store()
        .get_execution(&outcome.execution_id)
        .expect("get")
        .expect("record");
    assert_eq!(record.iterations, 2);
    assert_eq!(record.end_reason.as_deref(), Some("quiescent"));
}

/// A mutating tool that writes a file and then fails is rolled back, leaving
/// the working copy as it was.
#[test]
fn failed_write_is_rolled_back() {
    let repo = TestRepo::new().expect("repo");
    let state = tempfile::tempdir().expect("tempdir");
    let target = repo.path().join("x.txt");
    let write_then_fail = {
        let target = target.clone();
        tool_fn(move |_: &Value| -> Result<Value> {
            fs::write(&target, "partial").map_err(|err| anyhow!("write: {err}"))?;
            Err(anyhow!("disk full"))
        })
    };
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents())
            .with_tool("Write", write_then_fail)
            .with_changesets(Arc::new(GitStore::new(repo.path())), &ToolDefaults::default()),
    );
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(Node::tool("Write", json!({"path": "x.txt"})))),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let error = outcome.error.expect("error text");
    assert!(error.contains("disk full"), "{error}");
    assert!(error.contains("rolled back"), "{error}");
    assert!(!target.exists());

    let metrics = runtime.wrapper().expect("wrapper").metrics();
    assert_eq!(metrics.rollbacks, 1);
    assert_eq!(metrics.failed_calls, 1);
    let snapshots = runtime
        .store()
        .list_snapshots(&outcome.execution_id)
        .expect("snapshots");
    assert!(!snapshots.is_empty());
}

/// Sequential steps advance one at a time; the second step only runs once
/// the first has been recorded as done, and completion is recorded once.
#[test]
fn sequential_steps_advance_in_order() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = open_store(&state);
    let execution = Arc::new(Mutex::new(String::new()));
    let observed = Arc::new(Mutex::new(Vec::new()));

    let observing_tool = |delay: Duration| {
        let store = store.clone();
        let execution = Arc::clone(&execution);
        let observed = Arc::clone(&observed);
        tool_fn(move |input: &Value| -> Result<Value> {
            thread::sleep(delay);
            let id = execution.lock().expect("execution").clone();
            let seq: SequenceState = store
                .get_state(&sequence_key(&id, "step"))?
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            observed
                .lock()
                .expect("observed")
                .push((input.clone(), seq.current_index, Instant::now()));
            Ok(input.clone())
        })
    };
    let runtime = Arc::new(
        Runtime::new(store.clone(), no_agents())
            .with_tool("a", observing_tool(Duration::from_millis(20)))
            .with_tool("b", observing_tool(Duration::from_millis(30))),
    );
    let tree = Node::group(vec![
        Node::step("A").with_child(Node::tool("a", json!("A"))),
        Node::step("B").with_child(Node::tool("b", json!("B"))),
    ]);
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");
    *execution.lock().expect("execution") = scheduler.execution_id().to_string();

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let observed = observed.lock().expect("observed").clone();
    assert_eq!(observed.len(), 2);
    assert_eq!((observed[0].0.clone(), observed[0].1), (json!("A"), 0));
    assert_eq!((observed[1].0.clone(), observed[1].1), (json!("B"), 1));
    assert!(observed[1].2 >= observed[0].2 + Duration::from_millis(30));

    let seq: SequenceState = serde_json::from_value(
        store
            .get_state(&sequence_key(&outcome.execution_id, "step"))
            .expect("get")
            .expect("sequence state"),
    )
    .expect("parse");
    assert_eq!(seq.current_index, 2);
    assert!(seq.fired);
    let fired_writes = store
        .transitions(Some(&sequence_key(&outcome.execution_id, "step")), 100)
        .expect("transitions")
        .iter()
        .filter(|t| t.new_value.as_ref().and_then(|v| v.get("fired")) == Some(&json!(true)))
        .filter(|t| t.old_value.as_ref().and_then(|v| v.get("fired")) != Some(&json!(true)))
        .count();
    assert_eq!(fired_writes, 1);
}

/// A schema miss is corrected with exactly one retry whose prompt names the
/// missing field; the corrected object is written back.
#[test]
fn schema_miss_is_corrected_with_one_retry() {
    let state = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedReply::Output(r#"{"name":"x"}"#.to_string()),
        ScriptedReply::Output(r#"{"name":"x","age":5}"#.to_string()),
    ]));
    let runtime = Arc::new(Runtime::new(open_store(&state), backend.clone()));
    let schema = json!({
        "type": "object",
        "properties": {"name": {"type": "string"}, "age": {"type": "number"}},
        "required": ["name", "age"],
    });
    let tree = Node::agent("describe the user")
        .with_prop("schema", schema)
        .with_prop("state_key", "user");
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let prompts = backend.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("age"), "{}", prompts[1]);
    let user = runtime
        .store()
        .get_state(&keys::var(&outcome.execution_id, "user"))
        .expect("get");
    assert_eq!(user, Some(json!({"name": "x", "age": 5})));

    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.exec.status, NodeStatus::Completed);
    let agents = runtime
        .store()
        .list_agents(&outcome.execution_id)
        .expect("agents");
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].structured, Some(json!({"name": "x", "age": 5})));
}

#[test]
fn budget_exhaustion_ends_the_run() {
    let state = tempfile::tempdir().expect("tempdir");
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(Runtime::new(open_store(&state), no_agents()).with_tool("echo", tool));
    let mut config = ExecutionConfig::default();
    config.limits.max_tool_calls = Some(2);
    let render = |ctx: &conductor::scheduler::RenderContext<'_>| -> Result<Node> {
        Ok(Node::tool("echo", json!(ctx.iteration)).with_key(format!("n{}", ctx.iteration)))
    };
    let mut scheduler =
        Scheduler::start(Arc::clone(&runtime), Arc::new(render), config).expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.end_reason, "budget_exhausted");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn global_timeout_cancels_a_blocked_human_wait() {
    let state = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(Runtime::new(open_store(&state), no_agents()));
    let config = ExecutionConfig {
        global_timeout_secs: Some(1),
        human_poll_ms: 10,
        ..ExecutionConfig::default()
    };
    let tree = Node::new("human").with_prop("prompt", "anyone there?");
    let mut scheduler =
        Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config)
            .expect("start");

    let started = Instant::now();
    let outcome = scheduler.run().expect("run");

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.end_reason, "global_timeout");
    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.exec.status, NodeStatus::Cancelled);
}

#[test]
fn rejected_human_wait_fails_the_execution() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = open_store(&state);
    let runtime = Arc::new(Runtime::new(store.clone(), no_agents()));
    let config = ExecutionConfig {
        human_poll_ms: 10,
        ..ExecutionConfig::default()
    };
    let tree = Node::new("human").with_prop("prompt", "deploy?");
    let mut scheduler =
        Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config)
            .expect("start");
    let execution_id = scheduler.execution_id().to_string();

    let responder = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let waiting = store
                .state_with_prefix(&keys::waiting_prefix(&execution_id))
                .expect("waiting");
            if let Some(entry) = waiting.values().next() {
                let node_id = entry["node_id"].as_str().expect("node id");
                store
                    .set_state(
                        &keys::human(&execution_id, node_id),
                        &json!({"approved": false, "comment": "not today"}),
                        "test",
                    )
                    .expect("respond");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("human wait never appeared");
    });

    let outcome = scheduler.run().expect("run");
    responder.join().expect("responder");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|e| e.contains("not today"))
    );
}

fn recording_tool(log: &Arc<Mutex<Vec<String>>>) -> ToolFn {
    let log = Arc::clone(log);
    tool_fn(move |input: &Value| -> Result<Value> {
        let entry = input.as_str().unwrap_or_default().to_string();
        log.lock().expect("log").push(entry);
        Ok(input.clone())
    })
}

fn sequence_state(store: &Store, execution_id: &str, scope: &str) -> SequenceState {
    serde_json::from_value(
        store
            .get_state(&sequence_key(execution_id, scope))
            .expect("get")
            .expect("sequence state"),
    )
    .expect("parse")
}

fn fired_transitions(store: &Store, execution_id: &str, scope: &str) -> usize {
    store
        .transitions(Some(&sequence_key(execution_id, scope)), 100)
        .expect("transitions")
        .iter()
        .filter(|t| t.new_value.as_ref().and_then(|v| v.get("fired")) == Some(&json!(true)))
        .filter(|t| t.old_value.as_ref().and_then(|v| v.get("fired")) != Some(&json!(true)))
        .count()
}

#[test]
fn max_iterations_with_a_failed_node_fails_the_execution() {
    let state = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents()).with_tool("boom", failing_tool("disk on fire")),
    );
    let config = ExecutionConfig {
        max_iterations: 1,
        ..ExecutionConfig::default()
    };
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(Node::tool("boom", Value::Null))),
        config,
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.end_reason, "max_iterations");
    assert!(
        outcome
            .error
            .as_deref()
            .is_some_and(|e| e.contains("disk on fire"))
    );
    let record = runtime
        .store()
        .get_execution(&outcome.execution_id)
        .expect("get")
        .expect("record");
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(record.end_reason.as_deref(), Some("max_iterations"));
}

#[test]
fn unnamed_sibling_steps_each_run_in_order() {
    let state = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(Mutex::new(Vec::new()));
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents()).with_tool("record", recording_tool(&log)),
    );
    let tree = Node::group(vec![
        Node::new("step").with_child(Node::tool("record", json!("first"))),
        Node::new("step").with_child(Node::tool("record", json!("second"))),
    ]);
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(
        *log.lock().expect("log"),
        vec!["first".to_string(), "second".to_string()]
    );
    let steps = runtime.store().list_steps(&outcome.execution_id).expect("steps");
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|step| step.status == UnitStatus::Completed));
    let seq = sequence_state(runtime.store(), &outcome.execution_id, "step");
    assert_eq!(seq.units.len(), 2);
    assert_eq!(seq.current_index, 2);
}

#[test]
fn duplicate_step_names_fail_the_execution() {
    let state = tempfile::tempdir().expect("tempdir");
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(Runtime::new(open_store(&state), no_agents()).with_tool("echo", tool));
    let tree = Node::group(vec![
        Node::step("build").with_child(Node::tool("echo", json!(1))),
        Node::step("build").with_child(Node::tool("echo", json!(2))),
    ]);
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.end_reason, "error");
    let error = outcome.error.expect("error");
    assert!(error.contains("duplicate unit name 'build'"), "{error}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn duplicate_sibling_keys_fail_the_execution() {
    let state = tempfile::tempdir().expect("tempdir");
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(Runtime::new(open_store(&state), no_agents()).with_tool("echo", tool));
    let tree = Node::group(vec![
        Node::tool("echo", json!("a")).with_key("k"),
        Node::tool("echo", json!("b")).with_key("k"),
    ]);
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.end_reason, "error");
    assert_eq!(outcome.iterations, 1);
    let error = outcome.error.expect("error");
    assert!(error.contains("duplicate key 'k'"), "{error}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// The body writes `count`; the loop re-checks its condition against the
/// latest render before every iteration.
#[test]
fn while_loop_repeats_until_its_condition_is_false() {
    let state = tempfile::tempdir().expect("tempdir");
    let calls = Arc::new(Mutex::new(0u64));
    let increment = {
        let calls = Arc::clone(&calls);
        tool_fn(move |input: &Value| -> Result<Value> {
            *calls.lock().expect("calls") += 1;
            Ok(json!(input.as_u64().unwrap_or(0) + 1))
        })
    };
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents()).with_tool("increment", increment),
    );
    let render = |ctx: &RenderContext<'_>| -> Result<Node> {
        let count = ctx.get("count").and_then(Value::as_u64).unwrap_or(0);
        Ok(Node::new("while")
            .with_key("counter")
            .with_prop("condition", count < 3)
            .with_child(
                Node::tool("increment", json!(count)).with_prop("state_key", "count"),
            ))
    };
    let mut scheduler =
        Scheduler::start(Arc::clone(&runtime), Arc::new(render), ExecutionConfig::default())
            .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.end_reason, "quiescent");
    assert_eq!(*calls.lock().expect("calls"), 3);
    let count = runtime
        .store()
        .get_state(&keys::var(&outcome.execution_id, "count"))
        .expect("get");
    assert_eq!(count, Some(json!(3)));

    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.exec.status, NodeStatus::Completed);
    let loop_state: LoopState = serde_json::from_value(
        runtime
            .store()
            .get_state(&keys::loop_state(&outcome.execution_id, &tree.id))
            .expect("get")
            .expect("loop state"),
    )
    .expect("parse");
    assert_eq!(loop_state.current_iteration, 3);
    assert_eq!(loop_state.status, LoopStatus::Completed);
    assert_eq!(loop_state.stop_reason.as_deref(), Some("condition_false"));
}

#[test]
fn ralph_loop_stops_at_its_iteration_cap() {
    let state = tempfile::tempdir().expect("tempdir");
    let log = Arc::new(Mutex::new(Vec::new()));
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents()).with_tool("record", recording_tool(&log)),
    );
    let tree = Node::new("ralph")
        .with_prop("max_iterations", 2)
        .with_child(Node::step("attempt").with_child(Node::tool("record", json!("try"))));
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(log.lock().expect("log").len(), 2);
    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.exec.status, NodeStatus::Completed);
    assert!(
        tree.exec
            .result_summary
            .as_deref()
            .is_some_and(|s| s.starts_with("max_reached"))
    );
    let steps = runtime.store().list_steps(&outcome.execution_id).expect("steps");
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|step| step.status == UnitStatus::Completed));
}

#[test]
fn failing_loop_body_fails_the_loop() {
    let state = tempfile::tempdir().expect("tempdir");
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents()).with_tool("boom", failing_tool("flaky")),
    );
    let tree = Node::new("while")
        .with_prop("condition", true)
        .with_child(Node::tool("boom", Value::Null));
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.error.as_deref().is_some_and(|e| e.contains("flaky")));
    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.exec.status, NodeStatus::Failed);
}

/// Alternating between two frames forever never converges; the storm guard
/// ends the run long before `max_iterations`.
#[test]
fn oscillating_frames_trip_the_storm_guard() {
    let state = tempfile::tempdir().expect("tempdir");
    let (tool, calls) = counting_tool();
    let runtime = Arc::new(Runtime::new(open_store(&state), no_agents()).with_tool("echo", tool));
    let render = |ctx: &RenderContext<'_>| -> Result<Node> {
        let side = ctx.iteration % 2;
        Ok(Node::tool("echo", json!(side)).with_key(format!("n{side}")))
    };
    let config = ExecutionConfig {
        max_iterations: 100,
        ..ExecutionConfig::default()
    };
    let mut scheduler =
        Scheduler::start(Arc::clone(&runtime), Arc::new(render), config).expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.end_reason, "frame_storm");
    assert!(outcome.error.as_deref().is_some_and(|e| e.contains("frame storm")));
    assert!(calls.load(Ordering::SeqCst) <= 12);
}

#[test]
fn parallel_failure_closes_every_sibling_step() {
    let state = tempfile::tempdir().expect("tempdir");
    let (tool, _) = counting_tool();
    let runtime = Arc::new(
        Runtime::new(open_store(&state), no_agents())
            .with_tool("echo", tool)
            .with_tool("boom", failing_tool("tests failed")),
    );
    let tree = Node::phase("checks").with_prop("parallel", true).with_children(vec![
        Node::step("lint").with_child(Node::tool("echo", json!(1))),
        Node::step("test").with_child(Node::tool("boom", Value::Null)),
        Node::step("docs").with_child(Node::tool("echo", json!(2))),
    ]);
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let steps = runtime.store().list_steps(&outcome.execution_id).expect("steps");
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|step| step.status != UnitStatus::Running));
    let status_of = |name: &str| {
        steps
            .iter()
            .find(|step| step.name == name)
            .map(|step| step.status)
    };
    assert_eq!(status_of("test"), Some(UnitStatus::Failed));
    assert_eq!(status_of("lint"), Some(UnitStatus::Completed));
    assert_eq!(status_of("docs"), Some(UnitStatus::Completed));
}

#[test]
fn parallel_steps_fire_completion_once() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = open_store(&state);
    let runtime = Arc::new(
        Runtime::new(store.clone(), no_agents())
            .with_tool("slow", sleeping_tool(Duration::from_millis(20))),
    );
    let tree = Node::phase("fanout").with_prop("parallel", true).with_children(vec![
        Node::step("one").with_child(Node::tool("slow", json!(1))),
        Node::step("two").with_child(Node::tool("slow", json!(2))),
        Node::step("three").with_child(Node::tool("slow", json!(3))),
    ]);
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let seq = sequence_state(&store, &outcome.execution_id, "step:fanout");
    assert_eq!(seq.current_index, 3);
    assert!(seq.fired);
    assert_eq!(fired_transitions(&store, &outcome.execution_id, "step:fanout"), 1);
}

#[test]
fn approved_human_wait_completes_the_execution() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = open_store(&state);
    let runtime = Arc::new(Runtime::new(store.clone(), no_agents()));
    let config = ExecutionConfig {
        human_poll_ms: 10,
        ..ExecutionConfig::default()
    };
    let tree = Node::new("human")
        .with_prop("prompt", "merge?")
        .with_prop("state_key", "merge");
    let mut scheduler =
        Scheduler::start(Arc::clone(&runtime), Arc::new(fixed_render(tree)), config)
            .expect("start");
    let execution_id = scheduler.execution_id().to_string();

    let responder = {
        let store = store.clone();
        let execution_id = execution_id.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                let waiting = store
                    .state_with_prefix(&keys::waiting_prefix(&execution_id))
                    .expect("waiting");
                if let Some(entry) = waiting.values().next() {
                    let node_id = entry["node_id"].as_str().expect("node id");
                    store
                        .set_state(
                            &keys::human(&execution_id, node_id),
                            &json!({"approved": true, "comment": "ship it"}),
                            "test",
                        )
                        .expect("respond");
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("human wait never appeared");
        })
    };

    let outcome = scheduler.run().expect("run");
    responder.join().expect("responder");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.error, None);
    let tree = outcome.tree.expect("tree");
    assert_eq!(tree.exec.status, NodeStatus::Completed);
    assert_eq!(
        store.get_state(&keys::var(&execution_id, "merge")).expect("get"),
        Some(json!({"approved": true, "comment": "ship it"}))
    );
    assert!(
        store
            .state_with_prefix(&keys::waiting_prefix(&execution_id))
            .expect("waiting")
            .is_empty()
    );
}

/// A crash after the first of three sequential steps: the resumed run picks
/// up at the stored cursor and runs only the remaining steps, in order.
#[test]
fn resumed_sequence_continues_at_its_stored_index() {
    let state = tempfile::tempdir().expect("tempdir");
    let store = open_store(&state);
    let workflow = || {
        Node::group(vec![
            Node::step("A").with_child(Node::tool("record", json!("A"))),
            Node::step("B").with_child(Node::tool("record", json!("B"))),
            Node::step("C").with_child(Node::tool("record", json!("C"))),
        ])
    };

    let config = serde_json::to_value(ExecutionConfig::default()).expect("config");
    let execution_id = store
        .start_execution("workflow", None, &config, None)
        .expect("start");
    let mut seeded = workflow();
    assign_ids(&mut seeded).expect("ids");
    let done = serde_json::to_value(ExecState {
        status: NodeStatus::Completed,
        ..ExecState::default()
    })
    .expect("exec");
    let step_a = &seeded.children[0];
    for node_id in [&step_a.id, &step_a.children[0].id] {
        store
            .set_state(&keys::node(&execution_id, node_id), &done, "test")
            .expect("seed node");
    }
    let cursor = SequenceState {
        units: vec!["A".to_string(), "B".to_string(), "C".to_string()],
        current_index: 1,
        ..SequenceState::default()
    };
    store
        .set_state(
            &sequence_key(&execution_id, "step"),
            &serde_json::to_value(&cursor).expect("cursor"),
            "test",
        )
        .expect("seed cursor");
    store.record_iteration(&execution_id, 1).expect("iteration");

    let log = Arc::new(Mutex::new(Vec::new()));
    let runtime = Arc::new(
        Runtime::new(store.clone(), no_agents()).with_tool("record", recording_tool(&log)),
    );
    let mut scheduler = Scheduler::resume(
        Arc::clone(&runtime),
        Arc::new(fixed_render(workflow())),
        ExecutionConfig::default(),
    )
    .expect("resume")
    .expect("incomplete execution");
    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.execution_id, execution_id);
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(
        *log.lock().expect("log"),
        vec!["B".to_string(), "C".to_string()]
    );
    let seq = sequence_state(&store, &execution_id, "step");
    assert_eq!(seq.current_index, 3);
    assert_eq!(seq.units.len(), 3);
}

/// Five backend failures with a 100ms base and a 100ms cap wait 500ms in
/// total; uncapped doubling would wait over three seconds.
#[test]
fn agent_retry_backoff_is_capped() {
    let state = tempfile::tempdir().expect("tempdir");
    let mut replies: Vec<ScriptedReply> = (0..5)
        .map(|i| ScriptedReply::Fail(format!("backend down {i}")))
        .collect();
    replies.push(ScriptedReply::Output("recovered".to_string()));
    let backend = Arc::new(ScriptedBackend::new(replies));
    let runtime = Arc::new(Runtime::new(open_store(&state), backend.clone()));
    let config = ExecutionConfig {
        agent: AgentDefaults {
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_max_ms: 100,
            ..AgentDefaults::default()
        },
        ..ExecutionConfig::default()
    };
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(Node::agent("try again"))),
        config,
    )
    .expect("start");

    let started = Instant::now();
    let outcome = scheduler.run().expect("run");
    let elapsed = started.elapsed();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(backend.prompts().len(), 6);
    assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2_500), "{elapsed:?}");
}

#[test]
fn reviewing_agents_record_their_verdict() {
    let state = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(ScriptedBackend::new(vec![ScriptedReply::Output(
        r#"{"approved": false, "summary": "needs tests", "issues": ["no coverage for resume"]}"#
            .to_string(),
    )]));
    let runtime = Arc::new(Runtime::new(open_store(&state), backend));
    let tree = Node::agent("review the diff")
        .with_prop("schema", json!({"type": "object", "required": ["approved"]}))
        .with_prop("review_target", "step:build")
        .with_prop("reviewer", "critic");
    let mut scheduler = Scheduler::start(
        Arc::clone(&runtime),
        Arc::new(fixed_render(tree)),
        ExecutionConfig::default(),
    )
    .expect("start");

    let outcome = scheduler.run().expect("run");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    let reviews = runtime
        .store()
        .list_reviews(&outcome.execution_id)
        .expect("reviews");
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].target, "step:build");
    assert_eq!(reviews[0].reviewer, "critic");
    assert!(!reviews[0].approved);
    assert_eq!(reviews[0].summary, "needs tests");
    assert_eq!(reviews[0].issues, vec!["no coverage for resume".to_string()]);
}
