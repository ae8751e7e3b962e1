use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use crate::config::CHECK_INTERVAL;
use crate::error::{Result, RunqError};
use crate::spool::entry::{EntryKind, JobName};
use crate::spool::lock;

/// Seam between the scanner and whatever starts jobs. Production hands the
/// scan a [`crate::worker::JobExecutor`]; tests record the calls.
pub trait JobRunner {
    fn run(&mut self, name: &JobName, uid: u32, gid: u32) -> Result<()>;
}

/// The best batch job found by a scan, with the owner identity the
/// executor needs to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCandidate {
    pub name: JobName,
    pub uid: u32,
    pub gid: u32,
}

/// What a scan pass learned about the spool.
#[derive(Debug)]
pub struct ScanOutcome {
    /// When the next scan should happen at the latest. Never more than
    /// `CHECK_INTERVAL` away, never later than the earliest future job.
    pub next_wake: i64,
    /// Some entry needs attention later: a future job, a job being
    /// prepared, or a deferred batch candidate. The inverse drives the
    /// skip-if-unchanged optimization.
    pub pending_work: bool,
    /// Lexicographically smallest runnable batch entry, if any.
    pub batch: Option<BatchCandidate>,
    /// How many runnable batch entries the pass saw in total.
    pub batch_waiting: u32,
}

/// One pass over the spool directory: classify every entry, reclaim stale
/// locks, start eligible immediate jobs through `runner`, and select the
/// batch candidate for the scheduler to gate.
pub fn scan_spool(dir: &Path, now: i64, runner: &mut dyn JobRunner) -> Result<ScanOutcome> {
    let mut next_wake = now + CHECK_INTERVAL;
    let mut pending_work = false;
    let mut batch: Option<BatchCandidate> = None;
    let mut batch_waiting = 0u32;

    let entries =
        fs::read_dir(dir).map_err(|e| RunqError::syscall("cannot read job spool", e))?;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let file_name = entry.file_name();
        let Some(name_str) = file_name.to_str() else {
            continue;
        };
        let Some(name) = JobName::parse(name_str) else {
            continue;
        };

        // Chances are a "=" entry has been deleted from under us; racing
        // deletions are normal, not errors.
        let meta = match fs::metadata(dir.join(name_str)) {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }

        // Not yet marked executable: the submitter is still writing it,
        // and it will probably become runnable soon.
        if meta.mode() & (libc::S_IXUSR as u32) == 0 {
            pending_work = true;
            continue;
        }

        let run_time = name.run_time();

        match name.kind() {
            EntryKind::Lock => {
                if lock::lock_is_stale(meta.nlink(), run_time, CHECK_INTERVAL, now) {
                    tracing::debug!(entry = name_str, "Removing stale lock entry");
                    remove_ignoring_enoent(&dir.join(name_str));
                }
                continue;
            }
            EntryKind::Foreign => continue,
            EntryKind::Batch | EntryKind::Immediate => {}
        }

        if meta.nlink() > 1 {
            if run_time + CHECK_INTERVAL <= now {
                // The runner that locked this job is presumed dead; drop
                // its lock and reschedule the job for now.
                tracing::warn!(job = %name, "Reclaiming job from dead runner");
                remove_ignoring_enoent(&dir.join(name.lock_name()));
                next_wake = now;
                pending_work = true;
            }
            continue;
        }

        pending_work = true;

        if run_time > now {
            if next_wake > run_time {
                next_wake = run_time;
            }
            continue;
        }

        if name.kind() == EntryKind::Batch {
            batch_waiting += 1;
            let better = match &batch {
                None => true,
                Some(best) => name < best.name,
            };
            if better {
                batch = Some(BatchCandidate {
                    name,
                    uid: meta.uid(),
                    gid: meta.gid(),
                });
            }
        } else if let Err(e) = runner.run(&name, meta.uid(), meta.gid()) {
            // Fatal to this job attempt only; the rest of the scan goes on.
            tracing::error!(job = %name, error = %e, "Failed to start job");
        }
    }

    Ok(ScanOutcome {
        next_wake,
        pending_work,
        batch,
        batch_waiting,
    })
}

fn remove_ignoring_enoent(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Could not remove spool entry");
        }
    }
}
