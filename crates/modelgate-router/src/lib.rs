//! modelgate-router — answers "which version serves this request?".
//!
//! The controller publishes an immutable [`RouteSnapshot`] per slot whenever
//! it commits a transition. [`TrafficRouter::route`] only loads the current
//! snapshot map (an `ArcSwap`), so it never waits on a slot's write lock or
//! on any I/O.
//!
//! During an A/B test a session key is hashed into `[0, 1)` with a seed
//! derived from the test itself and compared against the traffic split. The
//! assignment is a pure function of the test and the key, so it is sticky for
//! the life of the test without any shared cache, and changes once a new test
//! starts.

pub mod router;
pub mod stable_hash;

pub use router::{AbRoute, Assignment, RouteError, RouteResult, RouteSnapshot, TrafficRouter};
