//! Run records: one unit of work in a sweep.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::RunIdentity;
use crate::run_dir::RunDirectory;
use crate::tree::ConfigTree;

/// Lifecycle of a run. Created `Pending` by the expander, moved forward by the
/// dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A materializable run: identity, resolved config, directory and status.
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Position in the expander's enumeration order.
    pub index: usize,
    pub identity: RunIdentity,
    pub config: ConfigTree,
    pub dir: RunDirectory,
    pub status: RunStatus,
}

impl RunRecord {
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }
}
