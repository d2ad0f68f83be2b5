use crate::config::ConfigError;
use crate::filter::FilterError;
use crate::target::{Action, Target};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// What a failed apply left behind for its target.
///
/// Apply removes conflicting rules before inserting the requested one and
/// never rolls back on its own, so a failure part way through can leave the
/// target open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    /// The chain holds the same rules for the target as before the call
    Unchanged,
    /// A denying rule was removed and nothing replaced it
    Accepting,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Unchanged => f.write_str("target state unchanged"),
            TargetState::Accepting => f.write_str("target now accepts traffic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStage {
    CheckConflict(Action),
    RemoveConflict(Action),
    Insert,
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyStage::CheckConflict(action) => {
                write!(f, "checking for an existing {} rule", action)
            }
            ApplyStage::RemoveConflict(action) => write!(f, "removing the {} rule", action),
            ApplyStage::Insert => f.write_str("inserting the rule"),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to {action} traffic for {target} while {stage} ({state}): {source}")]
pub struct ApplyError {
    pub target: Target,
    pub action: Action,
    pub stage: ApplyStage,
    pub state: TargetState,
    pub source: FilterError,
}

#[derive(Debug, Error)]
pub enum BlockerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to initialize chain '{chain}': {source}")]
    Initialize {
        chain: String,
        #[source]
        source: FilterError,
    },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("failed to list rules of chain '{chain}': {source}")]
    List {
        chain: String,
        #[source]
        source: FilterError,
    },
}

impl BlockerError {
    /// Target state after a failed apply, `None` for other failures
    pub fn target_state(&self) -> Option<TargetState> {
        match self {
            BlockerError::Apply(err) => Some(err.state),
            _ => None,
        }
    }
}
