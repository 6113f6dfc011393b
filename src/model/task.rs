//! Task records and per-phase state.
//!
//! A task is the unit of user-visible work. It is created on submission,
//! mutated one phase section at a time as the pipeline advances, and never
//! deleted — later requirements arrive as continuations that force the
//! affected phases to re-run.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Lifecycle status of a task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    /// Halted at an approval gate; resumes on an approval-granted event.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Token usage reported by an agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// State of one named phase on a task.
///
/// A tagged variant rather than one struct full of optionals: a phase that
/// is `Pending` has no timestamps to lie about, and a `Completed` phase
/// always carries its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Pending,
    InProgress {
        started_at: DateTime<Utc>,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        output: serde_json::Value,
        session_id: Option<String>,
        usage: Usage,
        cost_usd: f64,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
    },
}

impl PhaseState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Stored output, present only for completed phases.
    pub fn output(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Completed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Additional requirements appended after initial completion.
///
/// An unprocessed continuation forces every phase to re-run so the new
/// requirements get folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    pub requirements: String,
    pub added_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// Names of the target repositories, resolved against configuration.
    pub repositories: Vec<String>,
    /// Phase name → state. BTreeMap keeps serialization deterministic.
    pub phase_states: BTreeMap<String, PhaseState>,
    pub total_usage: Usage,
    pub total_cost_usd: f64,
    pub continuations: Vec<Continuation>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: &str, description: &str, priority: Priority, repositories: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            description: description.to_string(),
            priority,
            repositories,
            phase_states: BTreeMap::new(),
            total_usage: Usage::default(),
            total_cost_usd: 0.0,
            continuations: Vec::new(),
            status: TaskStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn phase_state(&self, phase: &str) -> &PhaseState {
        static PENDING: PhaseState = PhaseState::Pending;
        self.phase_states.get(phase).unwrap_or(&PENDING)
    }

    pub fn set_phase_state(&mut self, phase: &str, state: PhaseState) {
        self.phase_states.insert(phase.to_string(), state);
        self.updated_at = Utc::now();
    }

    /// Whether any continuation has not yet been folded into a run.
    pub fn has_unprocessed_continuations(&self) -> bool {
        self.continuations.iter().any(|c| !c.processed)
    }

    pub fn add_continuation(&mut self, requirements: &str) {
        self.continuations.push(Continuation {
            requirements: requirements.to_string(),
            added_at: Utc::now(),
            processed: false,
        });
        self.updated_at = Utc::now();
    }

    pub fn mark_continuations_processed(&mut self) {
        for c in &mut self.continuations {
            c.processed = true;
        }
        self.updated_at = Utc::now();
    }

    /// Accumulate usage/cost from one agent invocation.
    pub fn record_spend(&mut self, usage: Usage, cost_usd: f64) {
        self.total_usage.add(usage);
        self.total_cost_usd += cost_usd;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("Add login", "OAuth login flow", Priority::High, vec!["backend".into()]);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority, Priority::High);
        assert!(task.phase_states.is_empty());
        assert!(!task.has_unprocessed_continuations());
        assert_eq!(task.total_cost_usd, 0.0);
    }

    #[test]
    fn test_phase_state_defaults_to_pending() {
        let task = Task::new("t", "d", Priority::Medium, vec![]);
        assert_eq!(*task.phase_state("planning"), PhaseState::Pending);
    }

    #[test]
    fn test_phase_state_roundtrip_serialization() {
        let state = PhaseState::Completed {
            started_at: Utc::now(),
            completed_at: Utc::now(),
            output: serde_json::json!({"epics": 3}),
            session_id: Some("sess-1".into()),
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
            },
            cost_usd: 0.42,
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"status\":\"completed\""));
        let parsed: PhaseState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, parsed);
    }

    #[test]
    fn test_continuations_force_reprocessing() {
        let mut task = Task::new("t", "d", Priority::Medium, vec![]);
        task.add_continuation("also support SSO");
        assert!(task.has_unprocessed_continuations());

        task.mark_continuations_processed();
        assert!(!task.has_unprocessed_continuations());
        // History is kept.
        assert_eq!(task.continuations.len(), 1);
    }

    #[test]
    fn test_record_spend_accumulates() {
        let mut task = Task::new("t", "d", Priority::Medium, vec![]);
        task.record_spend(
            Usage {
                input_tokens: 10,
                output_tokens: 20,
            },
            0.5,
        );
        task.record_spend(
            Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
            0.25,
        );
        assert_eq!(task.total_usage.input_tokens, 15);
        assert_eq!(task.total_usage.output_tokens, 25);
        assert!((task.total_cost_usd - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
    }
}
