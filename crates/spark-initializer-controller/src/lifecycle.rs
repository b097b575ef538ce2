//! Per-pod processing stage
//!
//! Tracks where each pod is in the control loop so an invalid hand-off (for
//! example a worker releasing a key the dispatcher never queued) shows up in
//! the logs instead of going unnoticed. The tracker also counts consecutive
//! permanent failures per pod for the terminal-failure policy.

use std::fmt;

use dashmap::DashMap;
use thiserror::Error;

use spark_initializer_common::PodKey;

/// Stage of a pod in the control loop
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessingStage {
    /// Seen by the watch with the sentinel present
    Observed,
    /// Waiting in the retry queue
    Queued,
    /// Being fetched, mutated and submitted
    Mutating,
    /// Change accepted by the API server
    Patched,
    /// Nothing left to do for this pod
    Done,
}

impl ProcessingStage {
    /// Whether moving from `self` to `next` is allowed
    pub fn can_transition_to(self, next: ProcessingStage) -> bool {
        use ProcessingStage::*;
        matches!(
            (self, next),
            (Observed, Queued)
                | (Observed, Mutating)
                | (Queued, Mutating)
                | (Mutating, Patched)
                | (Mutating, Queued)
                | (Patched, Done)
                | (Done, Observed)
        )
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Observed => "Observed",
            Self::Queued => "Queued",
            Self::Mutating => "Mutating",
            Self::Patched => "Patched",
            Self::Done => "Done",
        };
        f.write_str(s)
    }
}

/// Rejected stage change
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    /// The key has no recorded stage
    #[error("no stage recorded for {key}")]
    Untracked {
        /// Pod key
        key: PodKey,
    },
    /// The move is not allowed from the current stage
    #[error("invalid stage transition for {key}: {from} -> {to}")]
    InvalidTransition {
        /// Pod key
        key: PodKey,
        /// Current stage
        from: ProcessingStage,
        /// Requested stage
        to: ProcessingStage,
    },
}

/// Concurrent map of pod key to stage
#[derive(Debug, Default)]
pub struct StageTracker {
    stages: DashMap<PodKey, ProcessingStage>,
    permanent_failures: DashMap<PodKey, u32>,
}

impl StageTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pod sighting.
    ///
    /// Unknown keys and keys in `Done` (a new pod reusing the name) become
    /// `Observed`; any other stage is kept and reported as an error.
    pub fn observe(&self, key: &PodKey) -> Result<(), StageError> {
        let mut entry = self
            .stages
            .entry(key.clone())
            .or_insert(ProcessingStage::Done);
        let from = *entry;
        if from.can_transition_to(ProcessingStage::Observed) {
            *entry = ProcessingStage::Observed;
            self.permanent_failures.remove(key);
            Ok(())
        } else {
            Err(StageError::InvalidTransition {
                key: key.clone(),
                from,
                to: ProcessingStage::Observed,
            })
        }
    }

    /// Move a tracked key to `to`, returning the previous stage
    pub fn transition(
        &self,
        key: &PodKey,
        to: ProcessingStage,
    ) -> Result<ProcessingStage, StageError> {
        let mut entry = self
            .stages
            .get_mut(key)
            .ok_or_else(|| StageError::Untracked { key: key.clone() })?;
        let from = *entry;
        if !from.can_transition_to(to) {
            return Err(StageError::InvalidTransition {
                key: key.clone(),
                from,
                to,
            });
        }
        *entry = to;
        Ok(from)
    }

    /// Current stage of a key
    pub fn stage(&self, key: &PodKey) -> Option<ProcessingStage> {
        self.stages.get(key).map(|s| *s)
    }

    /// Count one more permanent failure of a key, returning the new total
    pub fn record_permanent_failure(&self, key: &PodKey) -> u32 {
        let mut count = self.permanent_failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Consecutive permanent failures recorded for a key
    pub fn permanent_failures(&self, key: &PodKey) -> u32 {
        self.permanent_failures.get(key).map_or(0, |c| *c)
    }

    /// Reset the permanent failure count of a key
    pub fn clear_failures(&self, key: &PodKey) {
        self.permanent_failures.remove(key);
    }

    /// Stop tracking a key
    pub fn remove(&self, key: &PodKey) {
        self.stages.remove(key);
        self.permanent_failures.remove(key);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
