//! modelgate-monitor — discovers new upstream model releases.
//!
//! A [`VersionSource`] is polled per slot. Entries that are not yet in the
//! slot's version history are validated, persisted as `Candidate` records,
//! and only then announced as [`CandidateDetected`] events, so a crash
//! between the two steps is recovered by re-scanning unsignalled candidates.

pub mod error;
pub mod feed;
pub mod monitor;

pub use error::{FeedError, FeedResult};
pub use feed::{from_config, FeedEntry, FileFeed, HttpFeed, VersionSource};
pub use monitor::{CandidateDetected, VersionMonitor};
