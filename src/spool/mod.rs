//! On-disk spool layout: the job filename grammar and the hard-link lock
//! protocol layered on top of it.

pub mod entry;
pub mod lock;

pub use entry::{EntryKind, JobName};
pub use lock::LockAttempt;
