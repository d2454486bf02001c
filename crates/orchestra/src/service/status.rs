//! Service status and the operations each status permits

use std::fmt;

/// Position of a service in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    None,
    Preparing,
    Ready,
    AbortingPrepare,
    PrepareAborted,
    Running,
    /// Completed without error
    Ended,
    Stopping,
    /// Manually stopped without error
    Stopped,
    Error,
}

/// Guarded operations of an [`EnhancedService`](super::EnhancedService)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    StartPrepare,
    WaitPrepare,
    AbortPrepare,
    Start,
    Wait,
    Stop,
    AbortPrepareOrStop,
}

/// Lifecycle phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prepare,
    Main,
}

impl Status {
    pub const ALL: [Status; 10] = [
        Status::None,
        Status::Preparing,
        Status::Ready,
        Status::AbortingPrepare,
        Status::PrepareAborted,
        Status::Running,
        Status::Ended,
        Status::Stopping,
        Status::Stopped,
        Status::Error,
    ];

    /// Check if the service is idle. `Error` is not idle: it must be reset.
    pub fn is_doing_nothing(self) -> bool {
        match self {
            Status::None
            | Status::Ready
            | Status::PrepareAborted
            | Status::Ended
            | Status::Stopped => true,
            Status::Preparing
            | Status::AbortingPrepare
            | Status::Running
            | Status::Stopping
            | Status::Error => false,
        }
    }

    /// Transition table: whether `op` may run from this status.
    ///
    /// `phase` is the phase of the service's current step, if any. Waiting is
    /// allowed on a finished step of the matching phase, so a step that ends
    /// before the caller waits on it still reports its own outcome.
    pub fn permits(self, op: Operation, phase: Option<Phase>) -> bool {
        use Operation as Op;

        let prepare_step = phase == Some(Phase::Prepare);
        let main_step = phase == Some(Phase::Main);

        match self {
            Status::None => matches!(op, Op::StartPrepare),
            Status::Preparing => {
                matches!(op, Op::WaitPrepare | Op::AbortPrepare | Op::AbortPrepareOrStop)
            }
            Status::Ready => matches!(op, Op::WaitPrepare | Op::Start),
            Status::AbortingPrepare => matches!(op, Op::AbortPrepare | Op::AbortPrepareOrStop),
            Status::PrepareAborted => op == Op::WaitPrepare && prepare_step,
            Status::Running => matches!(op, Op::Wait | Op::Stop | Op::AbortPrepareOrStop),
            Status::Ended => op == Op::Wait,
            Status::Stopping => {
                matches!(op, Op::Stop | Op::AbortPrepareOrStop) || (op == Op::Wait && main_step)
            }
            Status::Stopped => op == Op::Wait && main_step,
            Status::Error => {
                (op == Op::WaitPrepare && prepare_step) || (op == Op::Wait && main_step)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::None => "None",
            Status::Preparing => "Preparing",
            Status::Ready => "Ready",
            Status::AbortingPrepare => "AbortingPrepare",
            Status::PrepareAborted => "PrepareAborted",
            Status::Running => "Running",
            Status::Ended => "Ended",
            Status::Stopping => "Stopping",
            Status::Stopped => "Stopped",
            Status::Error => "Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::StartPrepare => "start preparing",
            Operation::WaitPrepare => "wait for prepare",
            Operation::AbortPrepare => "abort prepare",
            Operation::Start => "start",
            Operation::Wait => "wait",
            Operation::Stop => "stop",
            Operation::AbortPrepareOrStop => "abort prepare or stop",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Prepare => "prepare",
            Phase::Main => "main",
        };
        f.write_str(name)
    }
}
