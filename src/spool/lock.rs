use std::fs;
use std::io;
use std::path::Path;

use crate::error::{Result, RunqError};
use crate::spool::entry::JobName;

/// Outcome of a lock attempt. Contention is an expected state, not an
/// error: a second runner backing off is how double execution is prevented.
#[derive(Debug)]
pub enum LockAttempt {
    /// The `=` link was created; this runner owns the job.
    Acquired,
    /// Another runner already holds the lock.
    Held,
}

/// Try to take the link lock for a job.
///
/// Locking creates a hard link from the job file to its `=`-prefixed mirror
/// name. Hard-link creation is atomic with `EEXIST` semantics on the
/// underlying filesystem, which is the entire mutual-exclusion story: no
/// advisory locks, no lease metadata.
pub fn try_lock(dir: &Path, name: &JobName) -> Result<LockAttempt> {
    let job = dir.join(name.as_str());
    let lock = dir.join(name.lock_name());
    match fs::hard_link(&job, &lock) {
        Ok(()) => Ok(LockAttempt::Acquired),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(LockAttempt::Held),
        Err(e) => Err(RunqError::syscall("cannot link execution file", e)),
    }
}

/// Remove the `=` entry for a job. Used both for normal release after the
/// user shell has exited and for reclaiming locks left by dead runners.
pub fn unlock(dir: &Path, name: &JobName) -> io::Result<()> {
    fs::remove_file(dir.join(name.lock_name()))
}

/// A lock entry whose `nlink` has dropped to 1 has lost its job file: the
/// executor unlinked the job but died before releasing the lock. Once the
/// encoded time is `CHECK_INTERVAL` in the past the original runner is
/// presumed dead and the entry is garbage.
pub fn lock_is_stale(nlink: u64, run_time: i64, check_interval: i64, now: i64) -> bool {
    nlink == 1 && run_time + check_interval <= now
}
