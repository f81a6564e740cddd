//! modelgate release controller — benchmark gating, A/B tests, rollback.
//!
//! This crate owns the per-slot state machine that decides whether a newly
//! detected model version replaces the one in production.
//!
//! # Components
//!
//! - **`policy`** — Pure decision functions (benchmark comparison, A/B conclusion, quality score)
//! - **`machine`** — Slot transition table
//! - **`rollback`** — Rollback and window-expiry planning, quality alarm
//! - **`controller`** — Drives slots through transitions, owns per-slot locks

pub mod controller;
pub mod error;
pub mod machine;
pub mod policy;
pub mod rollback;

pub use controller::{CheckReport, Controller, ControllerBuilder, OutcomeAck, SlotStatus, StepOutcome};
pub use error::{ControlError, ControlResult};
pub use machine::{next_state, Transition};
pub use policy::{conclude_ab, decide, decide_bootstrap, quality_score, AbConclusion, Decision};
pub use rollback::{alarm_tripped, RollbackManager};
