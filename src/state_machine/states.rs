use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a global task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted, no subtasks emitted yet
    Pending,
    /// Steps are being dispatched
    Running,
    /// Pause requested, waiting for in-flight subtasks to settle
    Pausing,
    /// Parked until resumed
    Paused,
    /// Resume requested
    Resuming,
    /// Cancel requested externally
    Cancelling,
    /// Canceled before any subtask was emitted
    Canceled,
    /// Revert batch in flight
    Reverting,
    /// Revert finished
    Reverted,
    /// All steps finished successfully
    Succeed,
    /// Task could not be orchestrated at all
    Failed,
}

impl TaskState {
    /// No further transitions are allowed from a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeed | Self::Failed | Self::Reverted | Self::Canceled
        )
    }

    /// States in which a dispatcher has nothing to drive until an external request arrives
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Cancelling => "cancelling",
            Self::Canceled => "canceled",
            Self::Reverting => "reverting",
            Self::Reverted => "reverted",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "pausing" => Ok(Self::Pausing),
            "paused" => Ok(Self::Paused),
            "resuming" => Ok(Self::Resuming),
            "cancelling" => Ok(Self::Cancelling),
            "canceled" => Ok(Self::Canceled),
            "reverting" => Ok(Self::Reverting),
            "reverted" => Ok(Self::Reverted),
            "succeed" => Ok(Self::Succeed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}

/// Lifecycle states of a subtask, driven by the executing node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Running,
    Succeed,
    Failed,
    Canceled,
    Reverted,
}

impl SubtaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Outcomes that stop the current step from completing normally
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Reverted => "reverted",
        }
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubtaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeed" => Ok(Self::Succeed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "reverted" => Ok(Self::Reverted),
            _ => Err(format!("Invalid subtask state: {s}")),
        }
    }
}

impl Default for SubtaskState {
    fn default() -> Self {
        Self::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_terminal_check() {
        assert!(TaskState::Succeed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Reverted.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Reverting.is_terminal());
        assert!(!TaskState::Cancelling.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
    }

    #[test]
    fn test_subtask_state_classification() {
        assert!(SubtaskState::Succeed.is_terminal());
        assert!(SubtaskState::Reverted.is_terminal());
        assert!(!SubtaskState::Running.is_terminal());
        assert!(SubtaskState::Failed.is_failure());
        assert!(SubtaskState::Canceled.is_failure());
        assert!(!SubtaskState::Reverted.is_failure());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(TaskState::Cancelling.to_string(), "cancelling");
        assert_eq!("reverting".parse::<TaskState>().unwrap(), TaskState::Reverting);
        assert!("in_progress".parse::<TaskState>().is_err());

        assert_eq!(SubtaskState::Canceled.to_string(), "canceled");
        assert_eq!(
            "reverted".parse::<SubtaskState>().unwrap(),
            SubtaskState::Reverted
        );
    }

    #[test]
    fn test_state_serde() {
        let json = serde_json::to_string(&TaskState::Succeed).unwrap();
        assert_eq!(json, "\"succeed\"");

        let parsed: SubtaskState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, SubtaskState::Failed);
    }
}
