//! Per-job execution pipeline.
//!
//! One worker process per job, forked off by [`JobExecutor`] while the
//! scanner keeps going. Inside the worker:
//!
//! 1. Resolve the submitter and open the job file under elevated
//!    privileges, then vet it ([`executor`]): tamper checks against the
//!    open descriptor, header parse ([`header`]), uid match.
//! 2. Unlink the job file, create the exclusive output file, open an
//!    authentication session ([`session`]).
//! 3. Run `/bin/sh` as the submitter with the job file on stdin, output
//!    captured, and an empty environment — the empty environment is a
//!    security contract, not an oversight.
//! 4. Release the lock and mail the output if the header asks for it.
//!
//! A worker failure leaves the `=` lock entry behind; the scanner ages it
//! out, so a crashed worker neither loses the job forever nor re-runs it
//! immediately.

pub mod executor;
pub mod header;
pub mod session;

pub use executor::JobExecutor;
