//! Validated task state transitions.
//!
//! Every state write performed by the core goes through
//! [`verify_task_state_transition`] first; storage implementations check it again
//! before applying a compare-and-set so an invalid transition is never persisted.

use super::states::TaskState;

/// Targets reachable from `from` in a single transition, self-transitions excluded
pub fn allowed_targets(from: TaskState) -> &'static [TaskState] {
    use TaskState::*;

    match from {
        Pending => &[Running, Succeed, Failed, Cancelling, Pausing],
        Running => &[Succeed, Failed, Reverting, Cancelling, Pausing],
        Cancelling => &[Reverting, Canceled],
        Reverting => &[Reverted],
        Pausing => &[Paused, Cancelling],
        Paused => &[Resuming, Cancelling],
        Resuming => &[Running, Cancelling],
        Succeed | Failed | Reverted | Canceled => &[],
    }
}

/// Whether a task may move from `from` to `to`
pub fn verify_task_state_transition(from: TaskState, to: TaskState) -> bool {
    if from == to {
        return true;
    }
    allowed_targets(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn test_verify_task_state_transition_table() {
        let cases = [
            (Running, Running, true),
            (Pending, Running, true),
            (Pending, Reverting, false),
            (Running, Reverting, true),
            (Reverting, Reverted, true),
            (Reverting, Succeed, false),
            (Running, Pausing, true),
            (Running, Resuming, false),
            (Cancelling, Running, false),
            (Canceled, Running, false),
        ];

        for (from, to, expected) in cases {
            assert_eq!(
                verify_task_state_transition(from, to),
                expected,
                "{from} -> {to}"
            );
        }
    }

    #[test]
    fn test_terminal_states_have_no_targets() {
        for state in [Succeed, Failed, Reverted, Canceled] {
            assert!(allowed_targets(state).is_empty());
        }
    }

    #[test]
    fn test_cancel_path_reaches_revert() {
        assert!(verify_task_state_transition(Running, Cancelling));
        assert!(verify_task_state_transition(Cancelling, Reverting));
        assert!(verify_task_state_transition(Cancelling, Canceled));
        assert!(!verify_task_state_transition(Cancelling, Succeed));
    }

    #[test]
    fn test_pause_resume_cycle() {
        assert!(verify_task_state_transition(Pausing, Paused));
        assert!(verify_task_state_transition(Paused, Resuming));
        assert!(verify_task_state_transition(Resuming, Running));
        assert!(!verify_task_state_transition(Paused, Running));
    }
}
