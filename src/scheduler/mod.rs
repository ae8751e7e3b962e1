pub mod batch;
pub mod scan;

pub use batch::BatchPolicy;
pub use scan::{scan_spool, BatchCandidate, JobRunner, ScanOutcome};
