//! Job stage tracking.
//!
//! ```text
//! Fetched → CursorResolved → CandidatesFetched → Processed → ReplySent → Labeled → Committed
//!                                   │    ▲           │
//!                                   ▼    │           ▼
//!                                  Filtered ───────► Committed
//! ```
//!
//! `Processed` and `Filtered` are per-candidate; after each candidate the job
//! returns to `CandidatesFetched`. `DeadLettered` is reachable from any
//! non-terminal stage.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a job is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Dequeued and decoded.
    Fetched,
    /// Mailbox and history bounds known.
    CursorResolved,
    /// Candidate list built.
    CandidatesFetched,
    /// Current candidate failed eligibility.
    Filtered,
    /// Current candidate passed eligibility.
    Processed,
    ReplySent,
    Labeled,
    /// Cursor advanced; terminal.
    Committed,
    /// Parked by the worker; terminal.
    DeadLettered,
}

impl JobStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::DeadLettered)
    }

    /// Whether moving from `self` to `target` is allowed.
    pub fn can_transition_to(&self, target: JobStage) -> bool {
        use JobStage::*;

        if self.is_terminal() {
            return false;
        }
        if target == DeadLettered {
            return true;
        }
        matches!(
            (self, target),
            (Fetched, CursorResolved)
                | (CursorResolved, CandidatesFetched)
                | (CursorResolved, Committed)
                | (CandidatesFetched, Filtered)
                | (CandidatesFetched, Processed)
                | (CandidatesFetched, Committed)
                | (Filtered, CandidatesFetched)
                | (Filtered, Committed)
                | (Processed, ReplySent)
                | (Processed, CandidatesFetched)
                | (Processed, Committed)
                | (ReplySent, Labeled)
                | (ReplySent, CandidatesFetched)
                | (ReplySent, Committed)
                | (Labeled, CandidatesFetched)
                | (Labeled, Committed)
        )
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fetched => "fetched",
            Self::CursorResolved => "cursor_resolved",
            Self::CandidatesFetched => "candidates_fetched",
            Self::Filtered => "filtered",
            Self::Processed => "processed",
            Self::ReplySent => "reply_sent",
            Self::Labeled => "labeled",
            Self::Committed => "committed",
            Self::DeadLettered => "dead_lettered",
        };
        write!(f, "{s}")
    }
}

/// Records a job's path through the stages.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: JobStage,
    history: Vec<JobStage>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: JobStage::Fetched,
            history: vec![JobStage::Fetched],
        }
    }

    pub fn current(&self) -> JobStage {
        self.current
    }

    pub fn history(&self) -> &[JobStage] {
        &self.history
    }

    /// Move to `target`. Invalid transitions are logged and ignored.
    pub fn advance(&mut self, target: JobStage) -> bool {
        if !self.current.can_transition_to(target) {
            tracing::warn!(from = %self.current, to = %target, "Invalid job stage transition");
            return false;
        }
        tracing::trace!(from = %self.current, to = %target, "Job stage");
        self.current = target;
        self.history.push(target);
        true
    }
}
