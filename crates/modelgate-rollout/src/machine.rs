//! Per-slot transition table.
//!
//! ```text
//! Idle ──begin_benchmark──▶ Benchmarking ──reject / incomplete / cancel──▶ Idle
//!                               │  └──promote──▶ RollbackWindowOpen (Idle if first version)
//!                               └──begin_ab──▶ AbTesting ──keep / cancel──▶ Idle
//!                                                  └──promote──▶ RollbackWindowOpen
//! RollbackWindowOpen ──rollback / expire──▶ Idle
//! any ──force_promote──▶ RollbackWindowOpen (Idle if first version)
//! ```

use modelgate_state::SlotState;

use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginBenchmark,
    /// Benchmark rejected the candidate or did not complete.
    Reject,
    /// Automatic promotion. `windowed` is false for a slot's first version.
    Promote { windowed: bool },
    BeginAbTest,
    /// A/B test concluded in favour of the incumbent.
    KeepIncumbent,
    /// Operator aborted the in-flight benchmark or A/B test.
    Cancel,
    Rollback,
    ExpireWindow,
    ForcePromote { windowed: bool },
}

/// Target state of `transition` from `from`, or `InvalidTransition`.
pub fn next_state(from: SlotState, transition: Transition) -> ControlResult<SlotState> {
    use SlotState::*;
    use Transition::*;

    let promoted = |windowed: bool| if windowed { RollbackWindowOpen } else { Idle };

    let to = match (from, transition) {
        (Idle, BeginBenchmark) => Some(Benchmarking),
        (Benchmarking, Reject) => Some(Idle),
        (Benchmarking, Promote { windowed }) => Some(promoted(windowed)),
        (Benchmarking, BeginAbTest) => Some(AbTesting),
        (Benchmarking | AbTesting, Cancel) => Some(Idle),
        (AbTesting, Promote { windowed }) => Some(promoted(windowed)),
        (AbTesting, KeepIncumbent) => Some(Idle),
        (RollbackWindowOpen, Rollback | ExpireWindow) => Some(Idle),
        (_, ForcePromote { windowed }) => Some(promoted(windowed)),
        _ => None,
    };
    to.ok_or_else(|| {
        ControlError::invalid(format!("{transition:?} is not valid in state {from:?}"))
    })
}
