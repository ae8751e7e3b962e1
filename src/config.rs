use std::path::PathBuf;

/// Seconds after which a still-locked job is presumed abandoned by a dead
/// runner and its lock is reclaimed.
pub const CHECK_INTERVAL: i64 = 3600;

/// Default minimum gap between two batch job starts, in seconds.
pub const BATCH_INTERVAL_DEFAULT: u32 = 60;

/// Default 1-minute load average above which batch jobs are deferred.
pub const LOAD_AVG_DEFAULT: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Spool directory holding queued job files; also the daemon's working
    /// directory.
    pub job_dir: PathBuf,
    /// Directory where per-job output files are captured.
    pub output_dir: PathBuf,
    /// Minimum seconds between batch job starts.
    pub batch_interval: u32,
    /// Load-average threshold gating batch jobs.
    pub load_avg: f64,
    /// Service account the daemon runs as between privileged sections.
    pub service_user: String,
    pub service_group: String,
    /// Mail delivery program, invoked as `sendmail -i <login>`.
    pub mail_program: PathBuf,
    /// Run a single scan and exit instead of looping.
    pub one_shot: bool,
    pub debug: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            job_dir: PathBuf::from("/var/spool/runqd/jobs"),
            output_dir: PathBuf::from("/var/spool/runqd/output"),
            batch_interval: BATCH_INTERVAL_DEFAULT,
            load_avg: LOAD_AVG_DEFAULT,
            service_user: "daemon".to_string(),
            service_group: "daemon".to_string(),
            mail_program: PathBuf::from("/usr/sbin/sendmail"),
            one_shot: false,
            debug: false,
        }
    }
}

impl DaemonConfig {
    pub fn with_spool(mut self, job_dir: PathBuf, output_dir: PathBuf) -> Self {
        self.job_dir = job_dir;
        self.output_dir = output_dir;
        self
    }

    /// Set the batch load threshold. Zero or below resets to the platform
    /// default, matching the `-l` flag contract.
    pub fn set_load_avg(&mut self, value: f64) {
        self.load_avg = if value <= 0.0 { LOAD_AVG_DEFAULT } else { value };
    }
}
