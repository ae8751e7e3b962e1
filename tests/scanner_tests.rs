use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use runqd::config::CHECK_INTERVAL;
use runqd::scheduler::scan::{scan_spool, JobRunner};
use runqd::spool::JobName;
use runqd::Result;

/// A scan "now" with room on both sides inside the 8-hex-digit minute
/// encoding.
const NOW_MINUTES: u32 = 0x0300_0000;
const NOW: i64 = NOW_MINUTES as i64 * 60;

#[derive(Default)]
struct RecordingRunner {
    runs: Vec<(String, u32, u32)>,
}

impl JobRunner for RecordingRunner {
    fn run(&mut self, name: &JobName, uid: u32, gid: u32) -> Result<()> {
        self.runs.push((name.to_string(), uid, gid));
        Ok(())
    }
}

fn job_name(queue: char, serial: u32, minutes: u32) -> String {
    format!("{queue}{serial:05x}{minutes:08x}")
}

fn add_job(dir: &Path, name: &str, executable: bool) {
    let path = dir.join(name);
    fs::write(
        &path,
        "#!/bin/sh\n# atrun uid=1000 gid=1000\n# mail alice 0\necho hi\n",
    )
    .unwrap();
    let mode = if executable { 0o700 } else { 0o600 };
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
}

#[test]
fn test_immediate_job_runs_during_scan() {
    let spool = tempfile::tempdir().unwrap();
    let name = job_name('a', 1, NOW_MINUTES - 10);
    add_job(spool.path(), &name, true);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert_eq!(runner.runs.len(), 1);
    assert_eq!(runner.runs[0].0, name);
    assert!(outcome.pending_work);
    assert!(outcome.batch.is_none());
    assert!(outcome.next_wake <= NOW + CHECK_INTERVAL);
}

#[test]
fn test_all_eligible_immediate_jobs_run_in_one_scan() {
    let spool = tempfile::tempdir().unwrap();
    add_job(spool.path(), &job_name('a', 1, NOW_MINUTES - 10), true);
    add_job(spool.path(), &job_name('c', 2, NOW_MINUTES - 5), true);

    let mut runner = RecordingRunner::default();
    scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert_eq!(runner.runs.len(), 2);
}

#[test]
fn test_future_job_sets_next_wake() {
    let spool = tempfile::tempdir().unwrap();
    let name = JobName::parse(&job_name('a', 1, NOW_MINUTES + 60)).unwrap();
    add_job(spool.path(), name.as_str(), true);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert!(outcome.pending_work);
    assert_eq!(outcome.next_wake, name.run_time());
}

#[test]
fn test_unfinalized_job_is_pending_but_never_run() {
    let spool = tempfile::tempdir().unwrap();
    // Execute bit clear: the submitter has not finished writing it.
    add_job(spool.path(), &job_name('a', 1, NOW_MINUTES - 10), false);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert!(outcome.pending_work);
}

#[test]
fn test_unparseable_names_are_ignored() {
    let spool = tempfile::tempdir().unwrap();
    add_job(spool.path(), "README", true);
    add_job(spool.path(), "a00001abcdef1", true); // 13 chars
    add_job(spool.path(), "a00001abcdef123", true); // 15 chars

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert!(!outcome.pending_work);
    assert_eq!(outcome.next_wake, NOW + CHECK_INTERVAL);
}

#[test]
fn test_foreign_queue_characters_are_ignored() {
    let spool = tempfile::tempdir().unwrap();
    add_job(spool.path(), &job_name('1', 1, NOW_MINUTES - 10), true);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert!(!outcome.pending_work);
}

#[test]
fn test_subdirectory_with_job_like_name_is_ignored() {
    let spool = tempfile::tempdir().unwrap();
    fs::create_dir(spool.path().join(job_name('a', 1, NOW_MINUTES - 10))).unwrap();

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert!(!outcome.pending_work);
}

#[test]
fn test_locked_job_is_not_rerun() {
    let spool = tempfile::tempdir().unwrap();
    // Scheduled recently enough that the lock holder is presumed alive.
    let name = JobName::parse(&job_name('a', 1, NOW_MINUTES - 10)).unwrap();
    add_job(spool.path(), name.as_str(), true);
    fs::hard_link(
        spool.path().join(name.as_str()),
        spool.path().join(name.lock_name()),
    )
    .unwrap();

    let mut runner = RecordingRunner::default();
    scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert!(spool.path().join(name.lock_name()).exists());
    assert!(spool.path().join(name.as_str()).exists());
}

#[test]
fn test_stale_runner_is_reclaimed() {
    let spool = tempfile::tempdir().unwrap();
    // Locked, but scheduled more than CHECK_INTERVAL in the past: the
    // runner died between locking and unlinking.
    let minutes = NOW_MINUTES - (CHECK_INTERVAL / 60) as u32 - 1;
    let name = JobName::parse(&job_name('a', 1, minutes)).unwrap();
    add_job(spool.path(), name.as_str(), true);
    fs::hard_link(
        spool.path().join(name.as_str()),
        spool.path().join(name.lock_name()),
    )
    .unwrap();

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    // The lock is dropped and the job rescheduled for now; it runs on the
    // next scan rather than this one.
    assert!(runner.runs.is_empty());
    assert!(!spool.path().join(name.lock_name()).exists());
    assert!(spool.path().join(name.as_str()).exists());
    assert_eq!(outcome.next_wake, NOW);
    assert!(outcome.pending_work);

    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();
    assert_eq!(runner.runs.len(), 1);
    assert!(outcome.next_wake <= NOW + CHECK_INTERVAL);
}

#[test]
fn test_orphaned_lock_entry_is_removed_once_aged() {
    let spool = tempfile::tempdir().unwrap();
    let minutes = NOW_MINUTES - (CHECK_INTERVAL / 60) as u32 - 1;
    let name = JobName::parse(&job_name('a', 1, minutes)).unwrap();
    add_job(spool.path(), name.as_str(), true);
    fs::hard_link(
        spool.path().join(name.as_str()),
        spool.path().join(name.lock_name()),
    )
    .unwrap();
    // The job file is gone; only the "=" entry remains, with nlink 1.
    fs::remove_file(spool.path().join(name.as_str())).unwrap();

    let mut runner = RecordingRunner::default();
    scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(!spool.path().join(name.lock_name()).exists());
    assert!(runner.runs.is_empty());
}

#[test]
fn test_orphaned_lock_entry_is_kept_while_fresh() {
    let spool = tempfile::tempdir().unwrap();
    let name = JobName::parse(&job_name('a', 1, NOW_MINUTES - 10)).unwrap();
    add_job(spool.path(), name.as_str(), true);
    fs::hard_link(
        spool.path().join(name.as_str()),
        spool.path().join(name.lock_name()),
    )
    .unwrap();
    fs::remove_file(spool.path().join(name.as_str())).unwrap();

    let mut runner = RecordingRunner::default();
    scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(spool.path().join(name.lock_name()).exists());
}

#[test]
fn test_batch_jobs_are_selected_not_run() {
    let spool = tempfile::tempdir().unwrap();
    add_job(spool.path(), &job_name('B', 1, NOW_MINUTES - 10), true);
    add_job(spool.path(), &job_name('b', 2, NOW_MINUTES - 20), true);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert!(runner.runs.is_empty());
    assert_eq!(outcome.batch_waiting, 2);
    // "B00001..." sorts ahead of "b00002...".
    let candidate = outcome.batch.unwrap();
    assert_eq!(candidate.name.as_str(), job_name('B', 1, NOW_MINUTES - 10));
    assert!(outcome.pending_work);
}

#[test]
fn test_batch_selection_prefers_smaller_filename_over_earlier_time() {
    let spool = tempfile::tempdir().unwrap();
    // C job is scheduled earlier, but the B filename is lexicographically
    // smaller, so B wins. The filename is the contract.
    let b_name = job_name('B', 1, NOW_MINUTES - 5);
    let c_name = job_name('C', 2, NOW_MINUTES - 500);
    add_job(spool.path(), &b_name, true);
    add_job(spool.path(), &c_name, true);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    assert_eq!(outcome.batch.unwrap().name.as_str(), b_name);
}

#[test]
fn test_batch_candidate_owner_is_reported() {
    let spool = tempfile::tempdir().unwrap();
    add_job(spool.path(), &job_name('b', 1, NOW_MINUTES - 10), true);

    let mut runner = RecordingRunner::default();
    let outcome = scan_spool(spool.path(), NOW, &mut runner).unwrap();

    let candidate = outcome.batch.unwrap();
    // Test fixtures are owned by whoever runs the tests.
    // SAFETY: getuid/getgid cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    assert_eq!(candidate.uid, uid);
    assert_eq!(candidate.gid, gid);
}
