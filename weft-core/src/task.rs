//! Tasks and their lifecycle state machine
//!
//! A task is an action the scheduler can place: implementation candidates,
//! typed parameters, a priority and a state. Transitions are validated
//! centrally; an invalid transition is a programming error surfaced as
//! `Error::InvalidState`, never silently applied.

use crate::implementation::{Implementation, WorkerId};
use crate::parameter::Parameter;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a task, allocated monotonically at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    /// Waiting on unfinished predecessors
    Waiting,
    /// All predecessors finished, not yet placed
    Ready,
    /// Placed on a worker, start not yet acknowledged
    Scheduled,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }

    /// Validate a transition against the state machine.
    ///
    /// Cancellation is reachable from every non-terminal state; `Failed`
    /// actions with remaining retry budget re-enter `Ready`.
    pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (from, to),
            (Created, Waiting | Ready)
                | (Waiting, Ready)
                | (Ready, Scheduled)
                | (Scheduled, Running)
                | (Running, Done | Failed)
                | (Failed, Ready) // retry
                | (Created | Waiting | Ready | Scheduled | Running, Cancelled)
        )
    }
}

/// Submission-time description of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescription {
    /// Application that submitted the task
    pub app_id: Uuid,

    /// Task signature, e.g. `increment(FILE_T)`
    pub signature: String,

    /// Implementation candidates, at least one
    pub implementations: Vec<Implementation>,

    pub params: Vec<Parameter>,

    /// User-supplied priority, default 0
    pub priority: i32,

    /// Optional barrier group
    pub group: Option<String>,
}

impl TaskDescription {
    /// Reject malformed submissions before they reach the analyser.
    pub fn validate(&self) -> Result<()> {
        if self.signature.is_empty() {
            return Err(Error::Submission("empty task signature".into()));
        }
        if self.implementations.is_empty() {
            return Err(Error::Submission(format!(
                "task {} declares no implementations",
                self.signature
            )));
        }
        Ok(())
    }
}

/// A task instance tracked by the runtime.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub description: TaskDescription,
    state: TaskState,
    /// Zero-based execution attempt, bumped on retry
    pub attempt: u32,
    /// Workers excluded from placement after host-sticky faults
    pub excluded_workers: Vec<WorkerId>,
    pub submitted_at: DateTime<Utc>,
    history: Vec<(TaskState, DateTime<Utc>)>,
}

impl Task {
    pub fn new(id: TaskId, description: TaskDescription) -> Self {
        let now = Utc::now();
        Self {
            id,
            description,
            state: TaskState::Created,
            attempt: 0,
            excluded_workers: Vec::new(),
            submitted_at: now,
            history: vec![(TaskState::Created, now)],
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Transition to `to`, validating against the state machine.
    pub fn transition(&mut self, to: TaskState) -> Result<()> {
        if !TaskState::is_valid_transition(self.state, to) {
            return Err(Error::InvalidState(format!(
                "task {}: invalid transition {:?} -> {:?}",
                self.id, self.state, to
            )));
        }
        self.state = to;
        self.history.push((to, Utc::now()));
        Ok(())
    }

    pub fn history(&self) -> &[(TaskState, DateTime<Utc>)] {
        &self.history
    }

    pub fn exclude_worker(&mut self, worker: WorkerId) {
        if !self.excluded_workers.contains(&worker) {
            self.excluded_workers.push(worker);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::implementation::ResourceDescription;

    fn description() -> TaskDescription {
        TaskDescription {
            app_id: Uuid::new_v4(),
            signature: "increment(FILE_T)".into(),
            implementations: vec![Implementation::new(
                "increment(FILE_T)",
                ResourceDescription::new(1, 256),
            )],
            params: Vec::new(),
            priority: 0,
            group: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut task = Task::new(TaskId(1), description());
        for state in [
            TaskState::Waiting,
            TaskState::Ready,
            TaskState::Scheduled,
            TaskState::Running,
            TaskState::Done,
        ] {
            task.transition(state).unwrap();
        }
        assert!(task.state().is_terminal());
        assert_eq!(task.history().len(), 6);
    }

    #[test]
    fn test_created_straight_to_ready() {
        let mut task = Task::new(TaskId(1), description());
        assert!(task.transition(TaskState::Ready).is_ok());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut task = Task::new(TaskId(1), description());
        let err = task.transition(TaskState::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(task.state(), TaskState::Created);
    }

    #[test]
    fn test_retry_reenters_ready() {
        let mut task = Task::new(TaskId(1), description());
        task.transition(TaskState::Ready).unwrap();
        task.transition(TaskState::Scheduled).unwrap();
        task.transition(TaskState::Running).unwrap();
        task.transition(TaskState::Failed).unwrap();
        assert!(task.transition(TaskState::Ready).is_ok());
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        for path in [vec![], vec![TaskState::Waiting], vec![TaskState::Ready]] {
            let mut task = Task::new(TaskId(1), description());
            for s in path {
                task.transition(s).unwrap();
            }
            assert!(task.transition(TaskState::Cancelled).is_ok());
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = Task::new(TaskId(1), description());
        task.transition(TaskState::Cancelled).unwrap();
        assert!(task.transition(TaskState::Ready).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_implementations() {
        let mut desc = description();
        desc.implementations.clear();
        assert!(matches!(desc.validate(), Err(Error::Submission(_))));
    }

    #[test]
    fn test_exclude_worker_dedupes() {
        let mut task = Task::new(TaskId(1), description());
        task.exclude_worker(WorkerId::new("w1"));
        task.exclude_worker(WorkerId::new("w1"));
        assert_eq!(task.excluded_workers.len(), 1);
    }
}
