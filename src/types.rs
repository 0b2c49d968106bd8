use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a node or of a whole dispatch.
///
/// Nodes move through `New -> Running -> {Completed, Dispatching, Failed,
/// Cancelled}`; a `Dispatching` node (an expanded sublattice) stays pending
/// until its child dispatch reports back. Dispatches additionally pass
/// through `Postprocessing` while the final result is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[serde(rename = "NEW_OBJECT")]
    New,
    Running,
    Dispatching,
    Postprocessing,
    Completed,
    Failed,
    Cancelled,
    PostprocessingFailed,
}

impl Status {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::Cancelled | Status::PostprocessingFailed
        )
    }

    pub fn is_terminal_success(self) -> bool {
        matches!(self, Status::Completed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Re-applying the current non-terminal status is allowed so that
    /// attribute-only updates can carry the status along.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;

        if self == next {
            return !self.is_terminal();
        }

        match (self, next) {
            (New, Running) | (New, Cancelled) | (New, Failed) => true,
            (Running, Completed)
            | (Running, Dispatching)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Postprocessing) => true,
            (Dispatching, Completed) | (Dispatching, Failed) | (Dispatching, Cancelled) => true,
            (Postprocessing, Completed)
            | (Postprocessing, PostprocessingFailed)
            | (Postprocessing, Failed)
            | (Postprocessing, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::New => "NEW_OBJECT",
            Status::Running => "RUNNING",
            Status::Dispatching => "DISPATCHING",
            Status::Postprocessing => "POSTPROCESSING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Cancelled => "CANCELLED",
            Status::PostprocessingFailed => "POSTPROCESSING_FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NEW_OBJECT" | "NEW" => Ok(Status::New),
            "RUNNING" => Ok(Status::Running),
            "DISPATCHING" => Ok(Status::Dispatching),
            "POSTPROCESSING" => Ok(Status::Postprocessing),
            "COMPLETED" => Ok(Status::Completed),
            "FAILED" => Ok(Status::Failed),
            "CANCELLED" => Ok(Status::Cancelled),
            "POSTPROCESSING_FAILED" => Ok(Status::PostprocessingFailed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// How the data layer treats live dispatch state.
///
/// - `Cached`: graph stores of live dispatches are kept in an in-process
///   registry; persistence is write-through.
/// - `Stateless`: nothing is cached; every read goes back to the
///   [`DataStore`](crate::data::DataStore).
///
/// Both modes are observably identical to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Cached,
    Stateless,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Stateless
    }
}
