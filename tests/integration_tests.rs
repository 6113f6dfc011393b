//! Cross-module integration tests: resolver guarantees, checkpoint and
//! event recovery, retry behavior, and full orchestrator runs against
//! scripted capabilities.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use conductor::agent::{AgentInvoker, AgentRequest, AgentResponse};
use conductor::checkpoint::CheckpointStore;
use conductor::config::Config;
use conductor::context::{BranchKind, ExecutionContext};
use conductor::db::{Db, DbHandle};
use conductor::errors::ErrorKind;
use conductor::events::{EventKind, EventStore};
use conductor::model::epic::Epic;
use conductor::model::repository::{Repository, RepositoryKind};
use conductor::model::task::{Priority, Task, TaskStatus, Usage};
use conductor::notify::NullNotifier;
use conductor::orchestrator::Orchestrator;
use conductor::pipeline::phase::{Phase, PhaseResult};
use conductor::pipeline::Pipeline;
use conductor::recovery::{RecoveryManager, RecoveryOutcome};
use conductor::resolver::{EpicResolver, ResolveError};
use conductor::retry::{execute_with_retry, CircuitBreaker, RetryPolicy};
use conductor::vcs::VersionControl;

// =========================================
// Test doubles
// =========================================

struct ScriptedAgent {
    responses: Mutex<Vec<Result<AgentResponse>>>,
    invocations: Mutex<u32>,
}

impl ScriptedAgent {
    fn with_outputs(outputs: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(
                outputs
                    .into_iter()
                    .map(|o| {
                        Ok(AgentResponse {
                            output: o,
                            session_id: Some("sess".into()),
                            usage: Usage {
                                input_tokens: 10,
                                output_tokens: 5,
                            },
                            cost_usd: 0.01,
                        })
                    })
                    .collect(),
            ),
            invocations: Mutex::new(0),
        })
    }

    fn invocation_count(&self) -> u32 {
        *self.invocations.lock().unwrap()
    }
}

#[async_trait]
impl AgentInvoker for ScriptedAgent {
    async fn invoke(&self, _request: &AgentRequest) -> Result<AgentResponse> {
        *self.invocations.lock().unwrap() += 1;
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            anyhow::bail!("scripted agent ran out of responses")
        }
        responses.remove(0)
    }
}

#[derive(Default)]
struct StubVcs;

#[async_trait]
impl VersionControl for StubVcs {
    async fn create_branch(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }
    async fn checkout(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }
    async fn commit_all(&self, _repo: &Path, _message: &str) -> Result<()> {
        Ok(())
    }
    async fn push(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }
    async fn diff_against(&self, _repo: &Path, _base: &str) -> Result<String> {
        Ok(String::new())
    }
    async fn list_remote_branches(&self, _repo: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn reset_to(&self, _repo: &Path, _commit: &str) -> Result<()> {
        Ok(())
    }
}

fn topology() -> Vec<Repository> {
    vec![
        Repository::new("backend", RepositoryKind::Backend)
            .with_execution_order(1)
            .with_patterns(vec!["backend/**".into()]),
        Repository::new("frontend", RepositoryKind::Frontend)
            .with_execution_order(2)
            .with_patterns(vec!["frontend/**".into()]),
    ]
}

fn orchestrator(
    dir: &Path,
    agent: Arc<dyn AgentInvoker>,
    require_approval: bool,
) -> (Orchestrator, DbHandle) {
    std::fs::write(
        dir.join("conductor.toml"),
        format!(
            r#"
[settings]
require_approval = {require_approval}

[[repositories]]
name = "backend"
kind = "backend"
execution_order = 1
patterns = ["backend/**"]

[[repositories]]
name = "frontend"
kind = "frontend"
execution_order = 2
patterns = ["frontend/**"]
"#
        ),
    )
    .unwrap();
    let config = Config::load(dir).unwrap();
    config.ensure_directories().unwrap();
    let db = DbHandle::new(Db::open_in_memory().unwrap());
    let orch = Orchestrator::with_capabilities(
        config,
        db.clone(),
        agent,
        Arc::new(StubVcs),
        Arc::new(NullNotifier),
    );
    (orch, db)
}

fn plan_output(epics: serde_json::Value) -> String {
    serde_json::json!({ "epics": epics }).to_string()
}

// =========================================
// Resolver guarantees
// =========================================

#[test]
fn accepted_epics_always_have_files() {
    let repos = topology();
    let resolver = EpicResolver::new(&repos);
    let resolution = resolver
        .resolve(vec![
            Epic::new("e1", "API").with_files_to_modify(vec!["backend/api.rs".into()]),
            Epic::new("e2", "UI").with_files_to_read(vec!["frontend/App.tsx".into()]),
        ])
        .unwrap();

    for epic in &resolution.epics {
        assert!(epic.file_count() > 0, "epic {} has no files", epic.id);
    }
}

#[test]
fn accepted_epics_never_share_write_paths_per_repository() {
    let repos = topology();
    let resolver = EpicResolver::new(&repos);
    let resolution = resolver
        .resolve(vec![
            Epic::new("e1", "Users").with_files_to_modify(vec!["backend/users.rs".into()]),
            Epic::new("e2", "Orders").with_files_to_modify(vec!["backend/orders.rs".into()]),
            Epic::new("e3", "UI").with_files_to_create(vec!["frontend/Orders.tsx".into()]),
        ])
        .unwrap();

    let epics = &resolution.epics;
    for i in 0..epics.len() {
        for j in (i + 1)..epics.len() {
            if epics[i].affected_repositories == epics[j].affected_repositories {
                let a = epics[i].write_set();
                let b = epics[j].write_set();
                assert!(a.is_disjoint(&b), "{} and {} overlap", epics[i].id, epics[j].id);
            }
        }
    }
}

#[test]
fn split_produces_per_repository_sub_epics_with_ordering_edge() {
    let repos = topology();
    let resolver = EpicResolver::new(&repos);
    let resolution = resolver
        .resolve(vec![Epic::new("epic-1", "Feature").with_files_to_modify(vec![
            "backend/api.go".into(),
            "frontend/App.tsx".into(),
        ])])
        .unwrap();

    assert_eq!(resolution.epics.len(), 2);
    let backend = resolution.epics.iter().find(|e| e.id == "epic-1-backend").unwrap();
    let frontend = resolution.epics.iter().find(|e| e.id == "epic-1-frontend").unwrap();

    assert_eq!(backend.files_to_modify, vec!["backend/api.go"]);
    assert_eq!(frontend.files_to_modify, vec!["frontend/App.tsx"]);
    assert!(backend.dependencies.is_empty());
    assert_eq!(frontend.dependencies, vec!["epic-1-backend"]);
}

#[test]
fn conflicting_pair_is_rejected_then_sequenced_pair_accepted() {
    let repos = topology();
    let resolver = EpicResolver::new(&repos);

    let conflicting = vec![
        Epic::new("epic-1", "User endpoints")
            .with_repositories(vec!["backend".into()])
            .with_files_to_modify(vec!["src/user.ts".into()]),
        Epic::new("epic-2", "User cleanup")
            .with_repositories(vec!["backend".into()])
            .with_files_to_modify(vec!["src/user.ts".into()]),
    ];
    match resolver.resolve(conflicting).unwrap_err() {
        ResolveError::Conflict { conflicts, .. } => {
            assert_eq!(conflicts[0].first_epic, "epic-1");
            assert_eq!(conflicts[0].second_epic, "epic-2");
            assert_eq!(conflicts[0].paths, vec!["src/user.ts"]);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // Corrected: the second epic now reads the shared file and depends on
    // the first, so they run sequentially.
    let corrected = vec![
        Epic::new("epic-1", "User endpoints")
            .with_repositories(vec!["backend".into()])
            .with_files_to_modify(vec!["src/user.ts".into()])
            .with_execution_order(1),
        Epic::new("epic-2", "User cleanup")
            .with_repositories(vec!["backend".into()])
            .with_files_to_read(vec!["src/user.ts".into()])
            .with_files_to_modify(vec!["src/cleanup.ts".into()])
            .with_dependencies(vec!["epic-1".into()])
            .with_execution_order(2),
    ];
    let resolution = resolver.resolve(corrected).unwrap();
    assert_eq!(resolution.epics[0].id, "epic-1");
    assert!(resolution.epics[1].depends_on("epic-1"));
}

// =========================================
// Checkpoint and recovery
// =========================================

#[test]
fn checkpoint_roundtrip_reproduces_registry_and_results() {
    let task = Task::new("t", "d", Priority::Medium, vec![]);
    let mut ctx = ExecutionContext::new(task.clone(), topology());
    ctx.register_branch("conductor/epic-a", BranchKind::Epic, "a", "backend");
    ctx.register_branch("conductor/story-b", BranchKind::Story, "b", "frontend");
    ctx.record_phase("analysis", PhaseResult::ok(serde_json::json!({"ok": 1})));

    let snapshot = ctx.to_checkpoint();
    let mut restored = ExecutionContext::new(task, topology());
    restored.restore_from_checkpoint(snapshot);

    assert_eq!(restored.branches(), ctx.branches());
    assert_eq!(restored.phase_records(), ctx.phase_records());
}

#[tokio::test]
async fn event_log_takes_precedence_over_checkpoint() {
    let db = DbHandle::new(Db::open_in_memory().unwrap());
    let events = EventStore::new(db.clone());
    let checkpoints = CheckpointStore::new(db.clone());

    let task = Task::new("t", "d", Priority::Medium, vec![]);
    let task_id = task.id.clone();

    // Checkpoint registering a branch the event history does not know.
    let mut stale = ExecutionContext::new(task.clone(), vec![]);
    stale.register_branch("conductor/epic-stale", BranchKind::Epic, "stale", "backend");
    checkpoints.save(&task_id, &stale.to_checkpoint()).await.unwrap();

    // Event history with the real plan.
    let epic = Epic::new("epic-live", "Live")
        .with_files_to_modify(vec!["backend/live.rs".into()])
        .with_repositories(vec!["backend".into()]);
    events
        .append(
            &task_id,
            EventKind::EpicsPlanned,
            "planner",
            serde_json::json!({ "epics": [epic] }),
            None,
        )
        .await
        .unwrap();

    let manager = RecoveryManager::new(events, checkpoints, db);
    let mut ctx = ExecutionContext::new(task, vec![]);
    let outcome = manager.recover(&mut ctx).await.unwrap();

    assert!(matches!(outcome, RecoveryOutcome::Events(_)));
    assert_eq!(ctx.data.epics.len(), 1);
    assert!(ctx.branches().values().all(|r| r.owner_id == "epic-live"));
}

// =========================================
// Retry and circuit breaker
// =========================================

#[test]
fn expected_backoff_is_monotone_and_capped() {
    let policy = RetryPolicy::default();
    let mut last = 0;
    for attempt in 1..=20 {
        let delay = policy.expected_delay_ms(attempt);
        assert!(delay >= last);
        assert!(delay <= policy.max_delay_ms);
        last = delay;
    }
    assert_eq!(policy.expected_delay_ms(20), policy.max_delay_ms);
}

#[test]
fn billing_failures_never_trip_the_breaker() {
    let breaker = CircuitBreaker::default();
    for _ in 0..100 {
        breaker.record_failure(ErrorKind::Billing);
    }
    assert!(breaker.can_execute());

    // Network failures still do.
    for _ in 0..10 {
        breaker.record_failure(ErrorKind::Network);
    }
    assert!(!breaker.can_execute());
}

#[tokio::test]
async fn network_failures_exhaust_retries_and_raise_original_error() {
    let attempts = Arc::new(Mutex::new(0u32));
    let attempts_clone = attempts.clone();
    let policy = RetryPolicy {
        max_retries: 3,
        initial_delay_ms: 1,
        ..Default::default()
    };

    let result: Result<()> = execute_with_retry(&policy, move || {
        let attempts = attempts_clone.clone();
        async move {
            *attempts.lock().unwrap() += 1;
            anyhow::bail!("connection reset by peer")
        }
    })
    .await;

    assert_eq!(*attempts.lock().unwrap(), 3);
    assert!(result.unwrap_err().to_string().contains("connection reset"));
}

// =========================================
// Pipeline approval gate
// =========================================

struct FixedPhase {
    name: &'static str,
    result: PhaseResult,
}

#[async_trait]
impl Phase for FixedPhase {
    fn name(&self) -> &'static str {
        self.name
    }
    async fn execute(&self, _ctx: &mut ExecutionContext) -> PhaseResult {
        self.result.clone()
    }
}

#[tokio::test]
async fn approval_request_halts_pipeline_with_success() {
    let pipeline = Pipeline::new(
        vec![
            Box::new(FixedPhase {
                name: "one",
                result: PhaseResult::ok(serde_json::json!({})),
            }),
            Box::new(FixedPhase {
                name: "two",
                result: PhaseResult::ok(serde_json::json!({})).with_approval_request(),
            }),
            Box::new(FixedPhase {
                name: "three",
                result: PhaseResult::ok(serde_json::json!({})),
            }),
        ],
        Arc::new(NullNotifier),
    );
    let mut ctx = ExecutionContext::new(Task::new("t", "d", Priority::Medium, vec![]), vec![]);
    let report = pipeline.execute(&mut ctx).await;

    assert!(report.success);
    assert!(report.paused_for_approval);
    assert_eq!(report.completed_phases, 2);
    assert_eq!(report.total_phases, 3);
    assert_eq!(report.phase_results.len(), 2);
}

// =========================================
// Full orchestrator runs
// =========================================

fn happy_path_outputs() -> Vec<String> {
    vec![
        "the task touches the backend user module".to_string(),
        plan_output(serde_json::json!([{
            "id": "epic-1",
            "title": "User API",
            "filesToModify": ["backend/src/user.rs"]
        }])),
        "implemented the epic".to_string(),
        "review: ship it".to_string(),
    ]
}

#[tokio::test]
async fn full_run_completes_task_and_keeps_event_history() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::with_outputs(happy_path_outputs());
    let (orch, db) = orchestrator(dir.path(), agent.clone(), false);

    let task = orch
        .submit("Add user API", "CRUD", Priority::High, vec![])
        .await
        .unwrap();
    let report = orch.run(&task.id).await.unwrap();

    assert!(report.success);
    assert_eq!(report.completed_phases, 4);
    assert_eq!(agent.invocation_count(), 4);

    let id = task.id.clone();
    let stored = db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.total_cost_usd > 0.0);
    for phase in ["analysis", "planning", "development", "review"] {
        assert!(stored.phase_state(phase).is_completed(), "{phase} not completed");
    }

    // Terminal success cleared the checkpoint but kept the events.
    let id = task.id.clone();
    assert!(db.call(move |db| db.load_checkpoint(&id)).await.unwrap().is_none());
    let events = orch.events().replay(&task.id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::EpicsPlanned));
}

#[tokio::test]
async fn crashed_run_resumes_skipping_completed_phases() {
    let dir = tempfile::tempdir().unwrap();

    // First run: development fails after analysis and planning completed.
    let agent = ScriptedAgent::with_outputs(vec![
        "analysis".to_string(),
        plan_output(serde_json::json!([{
            "id": "epic-1",
            "title": "User API",
            "filesToModify": ["backend/src/user.rs"]
        }])),
    ]);
    // Development's agent call errors out (scripted agent is empty by then).
    let (orch, db) = orchestrator(dir.path(), agent, false);
    let task = orch
        .submit("Add user API", "CRUD", Priority::High, vec![])
        .await
        .unwrap();
    let report = orch.run(&task.id).await.unwrap();
    assert!(!report.success);

    let id = task.id.clone();
    let stored = db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
    assert!(stored.phase_state("analysis").is_completed());
    assert!(stored.phase_state("planning").is_completed());
    assert!(stored.phase_state("development").is_failed());

    // Second run with a fresh orchestrator over the same database: only
    // development and review execute.
    let resume_agent = ScriptedAgent::with_outputs(vec![
        "implemented".to_string(),
        "review: fine".to_string(),
    ]);
    let config = Config::load(dir.path()).unwrap();
    let orch2 = Orchestrator::with_capabilities(
        config,
        db.clone(),
        resume_agent.clone(),
        Arc::new(StubVcs),
        Arc::new(NullNotifier),
    );
    let report = orch2.run(&task.id).await.unwrap();

    assert!(report.success);
    assert_eq!(resume_agent.invocation_count(), 2);

    let id = task.id.clone();
    let stored = db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
}

#[tokio::test]
async fn approval_pause_and_resume_via_events() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::with_outputs(happy_path_outputs());
    let (orch, db) = orchestrator(dir.path(), agent.clone(), true);

    let task = orch
        .submit("Add user API", "CRUD", Priority::High, vec![])
        .await
        .unwrap();

    // First run pauses at review.
    let report = orch.run(&task.id).await.unwrap();
    assert!(report.success);
    assert!(report.paused_for_approval);
    let id = task.id.clone();
    let stored = db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Paused);
    assert_eq!(agent.invocation_count(), 4);

    // Approval arrives; the resumed run completes without re-invoking the
    // reviewer.
    orch.approve(&task.id).await.unwrap();
    let report = orch.run(&task.id).await.unwrap();
    assert!(report.success);
    assert!(!report.paused_for_approval);
    assert_eq!(agent.invocation_count(), 4);

    let id = task.id.clone();
    let stored = db.call(move |db| db.get_task(&id)).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
}

#[tokio::test]
async fn continuation_forces_completed_phases_to_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::with_outputs(happy_path_outputs());
    let (orch, db) = orchestrator(dir.path(), agent.clone(), false);

    let task = orch
        .submit("Add user API", "CRUD", Priority::High, vec![])
        .await
        .unwrap();
    orch.run(&task.id).await.unwrap();
    assert_eq!(agent.invocation_count(), 4);

    // New requirements arrive after completion.
    orch.continue_task(&task.id, "also expose a search endpoint")
        .await
        .unwrap();

    let rerun_agent = ScriptedAgent::with_outputs(happy_path_outputs());
    let config = Config::load(dir.path()).unwrap();
    let orch2 = Orchestrator::with_capabilities(
        config,
        db,
        rerun_agent.clone(),
        Arc::new(StubVcs),
        Arc::new(NullNotifier),
    );
    let report = orch2.run(&task.id).await.unwrap();

    assert!(report.success);
    // Every phase re-ran despite being completed before.
    assert_eq!(rerun_agent.invocation_count(), 4);
}

#[tokio::test]
async fn concurrent_run_for_same_task_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let agent = ScriptedAgent::with_outputs(vec![]);
    let (orch, _db) = orchestrator(dir.path(), agent, false);

    let task = orch
        .submit("t", "d", Priority::Medium, vec![])
        .await
        .unwrap();

    let lock_dir = dir.path().join(".conductor/locks");
    let _held = conductor::lock::TaskLock::acquire(&lock_dir, &task.id).unwrap();

    let err = orch.run(&task.id).await.unwrap_err();
    assert!(err.to_string().contains("active pipeline run"));
}

// =========================================
// CLI smoke test
// =========================================

#[test]
fn cli_help_runs() {
    use assert_cmd::Command;
    use predicates::prelude::*;

    Command::cargo_bin("conductor")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("orchestrator"));
}
