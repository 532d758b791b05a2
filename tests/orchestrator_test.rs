//! Integration tests for round-based plan execution and the plan job
//! handler.

use async_trait::async_trait;
use relay_rs::dead_letter::DeadLetterQueue;
use relay_rs::error::{Error, Result};
use relay_rs::handlers::{PLAN_JOB, PlanHandler};
use relay_rs::log::{DurableLog, MemoryLog, Position};
use relay_rs::model::{Action, NewJob, ResultChunk, Step, WorkflowPlan};
use relay_rs::orchestrator::{
    ExecutionState, Orchestrator, Outputs, PlanStatus, StateSnapshot, Tool, ToolRegistry, tool_fn,
};
use relay_rs::results::ResultPublisher;
use relay_rs::worker::{HandlerRegistry, Worker};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

/// Test tool driven entirely by its parameters.
///
/// - `name`: recorded when the call starts and finishes
/// - `out` / `value`: output key (default `name`) and value (default `name`)
/// - `concat`: state keys whose string values are joined into the output
/// - `barrier`: wait on the shared barrier before finishing
/// - `sleep_ms`: sleep before finishing
/// - `fail`: return a tool error
#[derive(Clone)]
struct Scripted {
    barrier: Arc<Barrier>,
    started: Arc<Mutex<Vec<String>>>,
    finished: Arc<Mutex<Vec<String>>>,
}

impl Scripted {
    fn new() -> Self {
        Self {
            barrier: Arc::new(Barrier::new(2)),
            started: Arc::default(),
            finished: Arc::default(),
        }
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    /// A registry with this tool behind every action.
    fn registry(&self) -> ToolRegistry {
        [Action::Complete, Action::Format, Action::Categorize, Action::Persist]
            .into_iter()
            .fold(ToolRegistry::new(), |tools, action| {
                tools.register(action, self.clone())
            })
    }
}

#[async_trait]
impl Tool for Scripted {
    async fn call(&self, params: &Value, state: &StateSnapshot) -> Result<Outputs> {
        let name = params["name"].as_str().unwrap_or_default().to_string();
        self.started.lock().unwrap().push(name.clone());

        if params["barrier"].as_bool().unwrap_or(false) {
            self.barrier.wait().await;
        }
        if let Some(ms) = params["sleep_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if params["fail"].as_bool().unwrap_or(false) {
            return Err(Error::Tool(format!("{name} exploded")));
        }

        let value = match params["concat"].as_array() {
            Some(keys) => Value::String(
                keys.iter()
                    .filter_map(|k| k.as_str())
                    .filter_map(|k| state.get_str(k))
                    .collect::<Vec<_>>()
                    .join("+"),
            ),
            None => params
                .get("value")
                .cloned()
                .unwrap_or_else(|| Value::String(name.clone())),
        };
        let key = params["out"].as_str().unwrap_or(&name).to_string();

        self.finished.lock().unwrap().push(name);
        let mut out = Outputs::new();
        out.insert(key, value);
        Ok(out)
    }
}

fn step(id: &str, action: Action, params: Value) -> Step {
    let mut params = params;
    params["name"] = Value::String(id.to_string());
    Step::new(id, action).parameters(params)
}

fn orchestrator(tools: ToolRegistry) -> Orchestrator {
    Orchestrator::new(Arc::new(tools))
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn diamond_runs_independent_steps_together() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "diamond",
        vec![
            step("a", Action::Categorize, json!({ "barrier": true })),
            step("b", Action::Format, json!({ "barrier": true })),
            step("c", Action::Persist, json!({ "concat": ["a", "b"] })).depends_on(["a", "b"]),
        ],
    );

    // Both first-round steps wait on a two-party barrier, so the plan only
    // finishes if they run concurrently.
    let report = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator(tool.registry()).execute(&plan),
    )
    .await
    .expect("first-round steps should run concurrently")
    .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.plan_id, "diamond");
    assert_eq!(report.rounds, vec![vec!["a", "b"], vec!["c"]]);
    assert_eq!(report.state["c"], json!("a+b"));
    assert_eq!(tool.started().last().map(String::as_str), Some("c"));
}

#[tokio::test]
async fn outputs_merge_in_plan_order() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "overlap",
        vec![
            // The first step finishes last; the later step still wins.
            step("first", Action::Format, json!({ "out": "x", "value": 1, "sleep_ms": 20 })),
            step("second", Action::Format, json!({ "out": "x", "value": 2 })),
        ],
    );

    let report = orchestrator(tool.registry()).execute(&plan).await.unwrap();

    assert_eq!(tool.finished(), vec!["second", "first"]);
    assert_eq!(report.state["x"], json!(2));
}

#[tokio::test]
async fn seeded_state_is_visible_to_steps() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "seeded",
        vec![step("greet", Action::Complete, json!({ "concat": ["message"] }))],
    );
    let state = ExecutionState::new().with("message", json!("hello"));

    let report = orchestrator(tool.registry())
        .execute_with(&plan, state)
        .await
        .unwrap();

    assert_eq!(report.state["greet"], json!("hello"));
    assert_eq!(report.state["message"], json!("hello"));
}

#[tokio::test]
async fn closure_tools_can_be_registered() {
    let upper = tool_fn(|params: Value, _state| async move {
        let text = params["text"].as_str().unwrap_or_default().to_uppercase();
        let mut out = Outputs::new();
        out.insert("upper".into(), text.into());
        Ok::<_, Error>(out)
    });
    let tools = ToolRegistry::new().register(Action::Format, upper);
    let plan = WorkflowPlan::new(
        "closure",
        vec![Step::new("shout", Action::Format).parameters(json!({ "text": "hi" }))],
    );

    let report = orchestrator(tools).execute(&plan).await.unwrap();
    assert_eq!(report.state["upper"], json!("HI"));
}

// ---------------------------------------------------------------------------
// Dependency errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cycle_is_reported_after_runnable_steps() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "cyclic",
        vec![
            step("w", Action::Format, json!({})),
            step("x", Action::Format, json!({})).depends_on(["y"]),
            step("y", Action::Format, json!({})).depends_on(["x"]),
        ],
    );

    let err = orchestrator(tool.registry())
        .execute(&plan)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "PLAN_CYCLE_OR_MISSING_DEPENDENCY");
    match err {
        Error::UnresolvableDependencies { plan_id, pending } => {
            assert_eq!(plan_id, "cyclic");
            assert_eq!(pending, vec!["x", "y"]);
        }
        other => panic!("expected unresolvable dependencies, got {other:?}"),
    }
    assert_eq!(tool.started(), vec!["w"]);
}

#[tokio::test]
async fn missing_dependency_is_reported() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "dangling",
        vec![
            step("a", Action::Format, json!({})),
            step("z", Action::Format, json!({})).depends_on(["nope"]),
        ],
    );

    let err = orchestrator(tool.registry())
        .execute(&plan)
        .await
        .unwrap_err();

    let Error::UnresolvableDependencies { pending, .. } = err else {
        panic!("expected unresolvable dependencies, got {err:?}");
    };
    assert_eq!(pending, vec!["z"]);
}

// ---------------------------------------------------------------------------
// Step failure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn step_failure_aborts_round_and_later_rounds() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "failing",
        vec![
            step("boom", Action::Format, json!({ "fail": true })),
            step("slow", Action::Categorize, json!({ "sleep_ms": 60_000 })),
            step("after", Action::Persist, json!({})).depends_on(["boom"]),
        ],
    );

    let err = orchestrator(tool.registry())
        .execute(&plan)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "STEP_EXECUTION_FAILURE");
    match &err {
        Error::StepFailed { step_id, message } => {
            assert_eq!(step_id, "boom");
            assert_eq!(message, "tool error: boom exploded");
        }
        other => panic!("expected step failure, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(tool.finished().is_empty(), "sibling was cancelled");
    assert!(!tool.started().contains(&"after".to_string()));
}

// ---------------------------------------------------------------------------
// Invalid plans
// ---------------------------------------------------------------------------

#[test]
fn unknown_action_is_invalid() {
    let err = WorkflowPlan::from_json(json!({
        "plan_id": "p",
        "steps": [{ "step_id": "a", "action": "launch_rockets" }],
    }))
    .unwrap_err();

    assert_eq!(err.code(), "INVALID_PLAN");
}

#[test]
fn plan_json_defaults_parameters_and_dependencies() {
    let plan = WorkflowPlan::from_json(json!({
        "plan_id": "p",
        "steps": [
            { "step_id": "a", "action": "complete" },
            { "step_id": "b", "action": "persist", "dependencies": ["a"] },
        ],
    }))
    .unwrap();

    assert_eq!(plan.steps[0].parameters, Value::Null);
    assert!(plan.steps[0].dependencies.is_empty());
    assert!(plan.steps[1].dependencies.contains("a"));
}

#[tokio::test]
async fn unregistered_action_runs_nothing() {
    let tool = Scripted::new();
    let tools = ToolRegistry::new().register(Action::Format, tool.clone());
    let plan = WorkflowPlan::new(
        "partial",
        vec![
            step("a", Action::Format, json!({})),
            step("b", Action::Persist, json!({})),
        ],
    );

    let err = orchestrator(tools).execute(&plan).await.unwrap_err();

    assert!(matches!(err, Error::InvalidPlan(_)));
    assert!(tool.started().is_empty());
}

#[tokio::test]
async fn duplicate_step_ids_are_invalid() {
    let tool = Scripted::new();
    let plan = WorkflowPlan::new(
        "dupes",
        vec![
            step("a", Action::Format, json!({})),
            step("a", Action::Format, json!({})),
        ],
    );

    let err = orchestrator(tool.registry())
        .execute(&plan)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_PLAN");
}

#[tokio::test]
async fn empty_plan_completes_without_rounds() {
    let report = orchestrator(ToolRegistry::new())
        .execute(&WorkflowPlan::new("empty", vec![]))
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
    assert!(report.rounds.is_empty());
    assert!(report.state.is_empty());
}

// ---------------------------------------------------------------------------
// Plan jobs
// ---------------------------------------------------------------------------

struct PlanHarness {
    jobs: Arc<MemoryLog>,
    results: Arc<MemoryLog>,
    dead_letters: Arc<MemoryLog>,
    worker: Worker,
}

impl PlanHarness {
    fn new(tools: ToolRegistry) -> Self {
        let jobs = Arc::new(MemoryLog::new("jobs"));
        let results = Arc::new(MemoryLog::new("results"));
        let dead_letters = Arc::new(MemoryLog::new("dead_letters"));
        let handlers =
            HandlerRegistry::new().register(PLAN_JOB, PlanHandler::new(orchestrator(tools)));
        let worker = Worker::new(
            "w1",
            jobs.clone(),
            ResultPublisher::new(results.clone()),
            DeadLetterQueue::new(dead_letters.clone()),
            Arc::new(handlers),
        );
        Self {
            jobs,
            results,
            dead_letters,
            worker,
        }
    }

    async fn run(&self, plan: &WorkflowPlan) -> Value {
        let job = NewJob::new(PLAN_JOB, "client-a")
            .message("plan it")
            .field("plan", serde_json::to_value(plan).unwrap())
            .into_job();
        self.jobs
            .append(&serde_json::to_value(&job).unwrap())
            .await
            .unwrap();

        assert_eq!(self.worker.poll_once().await.unwrap(), 1);

        let entries = self
            .results
            .read_after(Position::ZERO, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1, "plan jobs publish one final chunk");
        let chunk = ResultChunk::from_entry(&entries[0]).unwrap();
        assert!(chunk.is_final);
        assert_eq!(chunk.job_id, job.id);
        serde_json::from_str(&chunk.payload).unwrap()
    }
}

#[tokio::test]
async fn plan_job_publishes_summary() {
    let tool = Scripted::new();
    let h = PlanHarness::new(tool.registry());
    let plan = WorkflowPlan::new(
        "job-plan",
        vec![
            step("echo", Action::Complete, json!({ "concat": ["message"] })),
            step("done", Action::Persist, json!({})).depends_on(["echo"]),
        ],
    );

    let summary = h.run(&plan).await;

    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["plan_id"], "job-plan");
    assert_eq!(summary["rounds"], json!([["echo"], ["done"]]));
    assert_eq!(summary["state"]["echo"], "plan it");
    assert_eq!(summary["state"]["client_id"], "client-a");
    assert_eq!(h.jobs.len().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_plan_job_is_reported_not_retried() {
    let tool = Scripted::new();
    let h = PlanHarness::new(tool.registry());
    let plan = WorkflowPlan::new(
        "doomed",
        vec![step("boom", Action::Format, json!({ "fail": true }))],
    );

    let summary = h.run(&plan).await;

    assert_eq!(summary["status"], "failed");
    assert_eq!(summary["plan_id"], "doomed");
    assert_eq!(summary["code"], "STEP_EXECUTION_FAILURE");
    assert_eq!(h.jobs.len().await.unwrap(), 0, "job is acked, not requeued");
    assert_eq!(h.dead_letters.len().await.unwrap(), 0);
    assert_eq!(tool.started(), vec!["boom"]);
}
