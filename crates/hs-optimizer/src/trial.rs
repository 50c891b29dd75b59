//! Trials, run results and sweep bookkeeping.

use chrono::{DateTime, Utc};
use hs_types::{Objective, RunError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::space::Assignment;

/// Unique sweep identifier.
pub type SweepId = Uuid;

/// A single trial: one parameter combination dispatched as one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: Uuid,
    /// Zero-based position in generation order.
    pub number: usize,
    pub parameters: Assignment,
    pub created_at: DateTime<Utc>,
}

impl Trial {
    pub fn new(number: usize, parameters: Assignment) -> Self {
        Self {
            id: Uuid::new_v4(),
            number,
            parameters,
            created_at: Utc::now(),
        }
    }
}

/// How a dispatched run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Exited cleanly and reported the objective.
    Succeeded { value: f64 },
    /// Exited cleanly but never reported the objective.
    MissingMetric { reason: String },
    /// Exited non-zero or was killed by a signal.
    Failed {
        exit_code: Option<i32>,
        reason: String,
    },
    /// The program could not be started.
    LaunchFailed { reason: String },
}

impl RunOutcome {
    /// Objective value, if this outcome is comparable at all.
    pub fn metric(&self) -> Option<f64> {
        match self {
            Self::Succeeded { value } if !value.is_nan() => Some(*value),
            _ => None,
        }
    }

    /// Whether the child process itself failed (as opposed to merely not
    /// reporting a metric).
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::LaunchFailed { .. })
    }

    /// Map a per-run error onto the outcome recorded for its trial.
    pub fn from_error(error: &RunError) -> Self {
        match error {
            RunError::Launch { .. } => Self::LaunchFailed {
                reason: error.to_string(),
            },
            RunError::Failed { exit_code } => Self::Failed {
                exit_code: *exit_code,
                reason: error.to_string(),
            },
            RunError::MissingMetric { .. } => Self::MissingMetric {
                reason: error.to_string(),
            },
            RunError::Cancelled { .. } | RunError::Io { .. } => Self::Failed {
                exit_code: None,
                reason: error.to_string(),
            },
        }
    }
}

/// Result of a single run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub trial: Trial,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub fn new(
        run_id: Uuid,
        trial: Trial,
        outcome: RunOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            trial,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn metric(&self) -> Option<f64> {
        self.outcome.metric()
    }

    pub fn duration_seconds(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Why a sweep stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The loop ended without attempting a single trial.
    NoTrials,
    /// An external stop signal was received.
    Cancelled,
    /// Too many consecutive run failures.
    FailureThreshold { consecutive: usize },
}

/// Lifecycle state for a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Idle,
    Running,
    Completed,
    Aborted(AbortReason),
}

impl SweepPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted(_))
    }

    /// Process exit code for a finished sweep: 0 completed, 1 no trials
    /// attempted, 2 cancelled, 3 failure threshold exceeded.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Idle | Self::Running | Self::Aborted(AbortReason::NoTrials) => 1,
            Self::Aborted(AbortReason::Cancelled) => 2,
            Self::Aborted(AbortReason::FailureThreshold { .. }) => 3,
        }
    }
}

/// Results of one sweep execution, in completion order, plus the best pointer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepState {
    objective: Objective,
    results: Vec<RunResult>,
    best: Option<usize>,
    consecutive_failures: usize,
}

impl SweepState {
    pub fn new(objective: Objective) -> Self {
        Self {
            objective,
            results: Vec::new(),
            best: None,
            consecutive_failures: 0,
        }
    }

    /// Append a result and update the best trial if it strictly improves on
    /// the current best. Returns whether it became the new best.
    pub fn record(&mut self, result: RunResult) -> bool {
        if result.outcome.is_failure() {
            self.consecutive_failures += 1;
        } else {
            self.consecutive_failures = 0;
        }

        let improves = match (result.metric(), self.best()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(value), Some(best)) => match best.metric() {
                Some(incumbent) => self.objective.goal.improves(value, incumbent),
                None => true,
            },
        };

        self.results.push(result);
        if improves {
            self.best = Some(self.results.len() - 1);
        }
        improves
    }

    pub fn best(&self) -> Option<&RunResult> {
        self.best.map(|i| &self.results[i])
    }

    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.is_failure())
            .count()
    }
}
