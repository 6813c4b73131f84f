//! Step model: definitions, runtime rows, and the status state machine.
//!
//! This module provides:
//! - `StepStatus`: The step lifecycle enum with its stable integer encoding
//! - `Step`: The full step definition stored in the bucket (carries the DAG
//!   edges and the code reference)
//! - `StepRow`: The runtime record kept in the hub's metadata store

use serde::{Deserialize, Serialize};

/// Step lifecycle state.
///
/// ```text
///              upload (starter)
///                    │
/// ┌────────┐ parent  ▼            lease   ┌─────────┐
/// │ QUEUED │───────►PENDING──────────────►│ WORKING │
/// └────────┘ done                         └─────────┘
///                                         │    │   │
///                              done       │    │   │ error
///                    ┌─────────┐◄─────────┘    │   ▼
///                    │ SUCCESS │          stale lease  ┌───────┐
///                    └─────────┘          (re-offered) │ ERROR │
///                                                      └───────┘
/// ```
///
/// `cancel` is reachable from any state and, like `success`, is terminal
/// until an explicit reset.
///
/// The integer codes are part of the persisted format and the upload wire
/// body; they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Uploaded but blocked on at least one parent.
    Queued,
    /// Runnable; eligible for the next lease.
    Pending,
    /// Leased to a worker (lease is reclaimed when the epoch goes stale).
    Working,
    /// Finished successfully. Terminal until reset.
    Success,
    /// Worker reported a failure; `msg`/`trace` carry the details.
    Error,
    /// Cancelled, along with everything reachable in its DAG. Terminal until reset.
    Cancel,
}

impl StepStatus {
    /// Returns the stable integer encoding.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Queued => 0,
            Self::Pending => 1,
            Self::Working => 2,
            Self::Success => 3,
            Self::Error => 4,
            Self::Cancel => 5,
        }
    }

    /// Decodes a stored integer code.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Queued),
            1 => Some(Self::Pending),
            2 => Some(Self::Working),
            3 => Some(Self::Success),
            4 => Some(Self::Error),
            5 => Some(Self::Cancel),
            _ => None,
        }
    }

    /// Returns a lowercase label suitable for responses, metrics, and logs.
    #[must_use]
    pub const fn as_label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Working => "working",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancel => "cancel",
        }
    }

    /// Returns true if this state is terminal (until an explicit reset).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Cancel)
    }

    /// All states, in code order.
    #[must_use]
    pub const fn all() -> [Self; 6] {
        [
            Self::Queued,
            Self::Pending,
            Self::Working,
            Self::Success,
            Self::Error,
            Self::Cancel,
        ]
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Full step definition, stored in the bucket at `step/<id>`.
///
/// This is the document the pipeline DSL parser produces: scheduling
/// attributes plus the DAG edges and the embedded-code reference. The hub
/// treats it as read-only; only the runtime row mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Opaque unique identifier.
    pub id: String,
    /// Human-readable name from the pipeline source.
    #[serde(default)]
    pub name: String,
    /// Higher runs earlier within a scope.
    #[serde(default)]
    pub priority: i64,
    /// Named bucket for coarse prioritization (`production`, `default`, ...).
    pub scope: String,
    /// Reserved per-step rate hint. Stored and echoed, not consulted by the
    /// scheduler.
    #[serde(default)]
    pub velocity: Option<f64>,
    /// Throttling group.
    pub tag: String,
    /// Embedded language the code runs under.
    #[serde(default)]
    pub language: String,
    /// Source text of the step body.
    #[serde(default)]
    pub code: String,
    /// Entry point within `code`.
    #[serde(default)]
    pub func: String,
    /// Per-step job timeout hint, in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Ids of predecessor steps.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Ids of successor steps.
    #[serde(default)]
    pub children: Vec<String>,
}

impl Step {
    /// Creates a minimal definition with no edges and default priority.
    #[must_use]
    pub fn new(id: impl Into<String>, scope: impl Into<String>, tag: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            priority: 0,
            scope: scope.into(),
            velocity: None,
            tag: tag.into(),
            language: String::new(),
            code: String::new(),
            func: String::new(),
            timeout: None,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the parent edges.
    #[must_use]
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.parents = parents.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the child edges.
    #[must_use]
    pub fn with_children(mut self, children: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    /// Returns true if the step has no parents and starts as `pending`.
    #[must_use]
    pub fn is_starter(&self) -> bool {
        self.parents.is_empty()
    }

    /// The status a freshly uploaded (or fully reset) copy of this step gets.
    #[must_use]
    pub fn initial_status(&self) -> StepStatus {
        if self.is_starter() {
            StepStatus::Pending
        } else {
            StepStatus::Queued
        }
    }
}

/// Runtime record for one step, one row in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    /// Opaque unique identifier (primary key).
    pub id: String,
    /// Higher runs earlier within a scope.
    pub priority: i64,
    /// Scope filter value.
    pub scope: String,
    /// Reserved per-step rate hint.
    pub velocity: Option<f64>,
    /// Throttling group.
    pub tag: String,
    /// Current lifecycle state. Stored as its integer code, exposed by name.
    pub status: StepStatus,
    /// Unix seconds of the last status transition.
    pub epoch: i64,
    /// Last error message, empty otherwise.
    pub msg: String,
    /// Last stack trace, empty otherwise.
    pub trace: String,
}

impl StepRow {
    /// Builds the runtime row for a definition at a given status and instant.
    #[must_use]
    pub fn from_step(step: &Step, status: StepStatus, epoch: i64) -> Self {
        Self {
            id: step.id.clone(),
            priority: step.priority,
            scope: step.scope.clone(),
            velocity: step.velocity,
            tag: step.tag.clone(),
            status,
            epoch,
            msg: String::new(),
            trace: String::new(),
        }
    }
}
