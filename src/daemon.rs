use std::fs;
use std::os::unix::fs::MetadataExt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::{DaemonConfig, CHECK_INTERVAL};
use crate::error::{Result, RunqError};
use crate::privs::Identity;
use crate::scheduler::batch::{self, BatchPolicy};
use crate::scheduler::scan::{scan_spool, JobRunner};
use crate::shutdown::{self, Wakeup};
use crate::worker::JobExecutor;

/// Main daemon that orchestrates all components: it drives the scan,
/// applies the batch policy on top of it, and owns the loop state between
/// iterations.
pub struct Daemon {
    config: DaemonConfig,
    executor: JobExecutor,
    policy: BatchPolicy,
    /// Scan-skip latch: set when a scan found nothing at all to do, cleared
    /// by SIGHUP or a spool mtime change.
    nothing_to_do: bool,
    last_mtime: i64,
}

impl Daemon {
    pub fn new(config: DaemonConfig, identity: Identity) -> Self {
        let executor = JobExecutor::new(&config, identity);
        let policy = BatchPolicy::new(config.batch_interval, config.load_avg);
        Self {
            config,
            executor,
            policy,
            nothing_to_do: false,
            last_mtime: 0,
        }
    }

    /// One scan pass. Returns the time by which the next pass must run.
    ///
    /// To avoid spinning up the disk unnecessarily, the spool directory is
    /// stat'ed first: if the previous pass found nothing to do and the
    /// directory has not changed since, the pass is skipped outright.
    pub fn run_once(&mut self, now: i64) -> Result<i64> {
        let dir_meta = fs::metadata(&self.config.job_dir)
            .map_err(|e| RunqError::syscall("cannot stat job spool", e))?;
        let mtime = dir_meta.mtime();
        if self.nothing_to_do && mtime <= self.last_mtime {
            return Ok(now + CHECK_INTERVAL);
        }
        self.last_mtime = mtime;

        let outcome = scan_spool(&self.config.job_dir, now, &mut self.executor)?;
        self.nothing_to_do = !outcome.pending_work;

        let mut next_wake = outcome.next_wake;
        let mut waiting = outcome.batch_waiting;

        if let Some(candidate) = outcome.batch {
            if self.policy.try_start(now, batch::sample_load) {
                if let Err(e) = self
                    .executor
                    .run(&candidate.name, candidate.uid, candidate.gid)
                {
                    tracing::error!(job = %candidate.name, error = %e, "Failed to start batch job");
                }
                waiting -= 1;
            }
        }
        // Batch work that could not start this scan still needs a wakeup at
        // the throttle boundary.
        if waiting > 0 {
            if let Some(next_batch) = self.policy.next_batch() {
                if next_batch < next_wake {
                    next_wake = next_batch;
                    self.nothing_to_do = false;
                }
            }
        }

        tracing::debug!(
            next_wake = %format_time(next_wake),
            pending = !self.nothing_to_do,
            "Scan complete"
        );
        Ok(next_wake)
    }

    /// Daemon mode: scan, sleep until the next wakeup or a signal, repeat.
    /// Returns after a termination signal; in-flight workers are
    /// independent processes and run to completion.
    pub fn run(&mut self, wakeup: &Wakeup) -> Result<()> {
        loop {
            if shutdown::take_rescan_request() {
                tracing::info!("Rescan requested");
                self.nothing_to_do = false;
            }
            let now = unix_now();
            let next_wake = self.run_once(now)?;
            if shutdown::terminated() {
                break;
            }
            wakeup.sleep_until(next_wake, unix_now());
            if shutdown::terminated() {
                break;
            }
        }
        tracing::info!("Termination signal received, exiting");
        Ok(())
    }
}

/// Seconds since the epoch; the `now` captured once per loop iteration.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| timestamp.to_string())
}
