use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::DaemonConfig;
use crate::error::{Result, RunqError};
use crate::privs::{self, Identity};
use crate::scheduler::batch::nice_increment;
use crate::scheduler::scan::JobRunner;
use crate::spool::lock::{self, LockAttempt};
use crate::spool::JobName;
use crate::worker::header::{self, JobHeader};
use crate::worker::session::{NullSession, SessionProvider};

/// Runs one job file at a time: link-lock it, fork a worker, and in the
/// worker open and vet the file, run the submitter's shell with captured
/// output, then deliver that output by mail.
pub struct JobExecutor {
    job_dir: PathBuf,
    output_dir: PathBuf,
    mail_program: PathBuf,
    identity: Identity,
    session: Box<dyn SessionProvider>,
}

impl JobExecutor {
    pub fn new(config: &DaemonConfig, identity: Identity) -> Self {
        Self {
            job_dir: config.job_dir.clone(),
            output_dir: config.output_dir.clone(),
            mail_program: config.mail_program.clone(),
            identity,
            session: Box::new(NullSession),
        }
    }

    pub fn with_session(mut self, session: Box<dyn SessionProvider>) -> Self {
        self.session = session;
        self
    }

    /// Lock the job and fork off a worker child to run it. The parent
    /// returns to the scan immediately; everything else happens in the
    /// worker, which never returns to the caller.
    pub fn run_file(&self, name: &JobName, uid: u32, gid: u32) -> Result<()> {
        match lock::try_lock(&self.job_dir, name)? {
            LockAttempt::Held => {
                tracing::warn!(job = %name, "Trying to execute job twice");
                return Ok(());
            }
            LockAttempt::Acquired => {}
        }
        // If anything goes wrong between here and the job-file unlink, the
        // job restarts once the scanner clears the aged-out "=" entry.

        // SAFETY: the daemon is single-threaded, so the child inherits a
        // consistent process image. The child only runs the worker body and
        // exits; it never returns to the scan loop.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(RunqError::syscall(
                "cannot fork job worker",
                io::Error::last_os_error(),
            )),
            0 => {
                let code = match self.worker_body(name, uid, gid) {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::error!(job = %name, serial = name.serial(), error = %e, "Job aborted");
                        1
                    }
                };
                std::process::exit(code);
            }
            _ => Ok(()),
        }
    }

    /// The worker child: vet the job file, run the shell, deliver output.
    fn worker_body(&self, name: &JobName, uid: u32, gid: u32) -> Result<()> {
        let submitter = privs::passwd_for_uid(uid).ok_or(RunqError::UnknownUid(uid))?;

        let job_path = self.job_dir.join(name.as_str());
        let mut job_file = {
            let _priv = self.identity.elevate();
            File::open(&job_path)
                .map_err(|e| RunqError::syscall("cannot open input file", e))?
        };

        tamper_check(&job_file, &job_path)?;

        let header = parse_and_vet_header(&job_file, uid)?;

        // Committed to executing this script: from here the "=" entry is
        // the only spool evidence of the job.
        fs::remove_file(&job_path)
            .map_err(|e| RunqError::syscall("cannot unlink job file", e))?;

        let out_path = self.output_dir.join(name.as_str());
        let mut output = create_output_file(&out_path, name)?;
        {
            let _priv = self.identity.elevate();
            // SAFETY: fchown on an fd we own. Failure is survivable; the
            // mail child reads through our descriptor regardless.
            let rc = unsafe { libc::fchown(output.as_raw_fd(), uid, header.gid) };
            if rc != 0 {
                tracing::warn!(
                    job = %name,
                    uid,
                    gid = header.gid,
                    error = %io::Error::last_os_error(),
                    "Could not change owner of output file"
                );
            }
        }

        output
            .write_all(mail_preamble(name.serial(), &header.login).as_bytes())
            .map_err(|e| RunqError::syscall("cannot write output header", e))?;
        let size_before = output
            .metadata()
            .map_err(|e| RunqError::syscall("cannot stat output file", e))?
            .len();

        let session = {
            let _priv = self.identity.elevate();
            self.session.open(&submitter.name)?
        };

        job_file
            .seek(SeekFrom::Start(0))
            .map_err(|e| RunqError::syscall("cannot rewind job file", e))?;
        let mut shell = self.spawn_shell(job_file, &output, &submitter, &header, name.queue())?;

        // The inherited SIGCHLD handler may reap the shell from under us;
        // ECHILD from the wait then means the child is simply gone.
        match shell.wait() {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ECHILD) => {}
            Err(e) => return Err(RunqError::syscall("waiting for user shell", e)),
        }

        {
            let _priv = self.identity.elevate();
            session.close()?;
        }

        // Final size from our own handle, before any descriptor changes
        // hands.
        let size_after = output
            .metadata()
            .map_err(|e| RunqError::syscall("cannot stat output file", e))?
            .len();

        // The output file stays readable through our descriptor after the
        // unlink; the mail child is its last reader.
        if let Err(e) = fs::remove_file(&out_path) {
            tracing::warn!(job = %name, error = %e, "Removing output file failed");
        }
        if let Err(e) = lock::unlock(&self.job_dir, name) {
            tracing::warn!(job = %name, error = %e, "Removing lock file failed");
        }

        if header::should_mail(header.send_mail, size_after != size_before) {
            output
                .seek(SeekFrom::Start(0))
                .map_err(|e| RunqError::syscall("cannot rewind output file", e))?;
            let err = self.exec_mailer(output, &submitter, &header, gid);
            return Err(RunqError::syscall("exec failed for mail command", err));
        }
        Ok(())
    }

    fn spawn_shell(
        &self,
        job_file: File,
        output: &File,
        submitter: &privs::Passwd,
        header: &JobHeader,
        queue: char,
    ) -> Result<std::process::Child> {
        let stdout = output
            .try_clone()
            .map_err(|e| RunqError::syscall("cannot duplicate output descriptor", e))?;
        let stderr = output
            .try_clone()
            .map_err(|e| RunqError::syscall("cannot duplicate output descriptor", e))?;

        let identity = self.identity;
        let login = cstring(submitter.name.as_bytes())?;
        let spool = cstring(self.job_dir.as_os_str().as_bytes())?;
        let supplementary_gid = submitter.gid;
        let target_gid = header.gid;
        let target_uid = header.uid;
        let nice = nice_increment(queue);

        let mut command = Command::new("/bin/sh");
        command
            .arg0("sh")
            .env_clear()
            .stdin(Stdio::from(job_file))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        // SAFETY: runs in the forked child of a single-threaded process.
        // Only direct syscalls, no allocation. The identity transition is
        // irreversible once setuid succeeds.
        unsafe {
            command.pre_exec(move || {
                if libc::chdir(spool.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                let _ = libc::nice(nice);
                if identity.is_privileged() {
                    identity.raise_effective()?;
                    if libc::initgroups(login.as_ptr(), supplementary_gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setgid(target_gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setuid(target_uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                libc::chdir(b"/\0".as_ptr().cast());
                Ok(())
            });
        }
        command
            .spawn()
            .map_err(|e| RunqError::syscall("exec failed for /bin/sh", e))
    }

    /// Replace the worker with `sendmail -i <login>`, output file on stdin.
    /// Only returns on failure.
    fn exec_mailer(
        &self,
        output: File,
        submitter: &privs::Passwd,
        header: &JobHeader,
        owner_gid: u32,
    ) -> io::Error {
        let identity = self.identity;
        let login = match cstring(submitter.name.as_bytes()) {
            Ok(c) => c,
            Err(e) => return io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        };
        let supplementary_gid = submitter.gid;
        let target_uid = header.uid;

        let mut command = Command::new(&self.mail_program);
        command
            .arg0("sendmail")
            .arg("-i")
            .arg(&header.login)
            .env_clear()
            .stdin(Stdio::from(output))
            // Some sendmail implementations are confused if stdout and
            // stderr are not available.
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: as for the shell child; exec replaces this worker.
        unsafe {
            command.pre_exec(move || {
                if identity.is_privileged() {
                    identity.raise_effective()?;
                    if libc::initgroups(login.as_ptr(), supplementary_gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setgid(owner_gid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setuid(target_uid) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                libc::chdir(b"/\0".as_ptr().cast());
                Ok(())
            });
        }
        command.exec()
    }
}

impl JobRunner for JobExecutor {
    fn run(&mut self, name: &JobName, uid: u32, gid: u32) -> Result<()> {
        self.run_file(name, uid, gid)
    }
}

/// Compare the opened descriptor against the path it was opened by. A
/// mismatch in device, inode, ownership or size means the file was swapped
/// from under us; a symlink or extra hard link means someone is trying to
/// alias another script into the job's place.
fn tamper_check(job_file: &File, job_path: &Path) -> Result<()> {
    let opened = job_file
        .metadata()
        .map_err(|e| RunqError::syscall("cannot fstat input file", e))?;
    let on_disk = fs::symlink_metadata(job_path)
        .map_err(|e| RunqError::syscall("cannot lstat input file", e))?;

    if on_disk.file_type().is_symlink() {
        return Err(RunqError::Tampered("symbolic link encountered"));
    }
    if opened.dev() != on_disk.dev()
        || opened.ino() != on_disk.ino()
        || opened.uid() != on_disk.uid()
        || opened.gid() != on_disk.gid()
        || opened.len() != on_disk.len()
    {
        return Err(RunqError::Tampered("file replaced between open and check"));
    }
    // Two links are expected: the job file and our "=" entry.
    if opened.nlink() > 2 {
        return Err(RunqError::Tampered("linked script"));
    }
    Ok(())
}

fn parse_and_vet_header(job_file: &File, owner_uid: u32) -> Result<JobHeader> {
    let mut reader = BufReader::new(job_file);
    let header = header::parse_header(&mut reader)?;
    if header.uid != owner_uid {
        return Err(RunqError::Header(format!(
            "header uid {} does not match file uid {}",
            header.uid, owner_uid
        )));
    }
    if header.login.starts_with('-') {
        return Err(RunqError::IllegalMailName(header.login));
    }
    Ok(header)
}

/// Owner read/write only, and strictly exclusive: a pre-existing output
/// file means two workers collided on the same name, which the lock
/// protocol is supposed to make impossible.
fn create_output_file(out_path: &Path, name: &JobName) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(out_path)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                tracing::error!(job = %name, serial = name.serial(), "Duplicate output file");
            }
            RunqError::syscall("cannot create output file", e)
        })
}

fn mail_preamble(serial: u32, login: &str) -> String {
    format!("Subject: Output from your job {serial:8}\nTo: {login}\n\n")
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| RunqError::Header("embedded NUL in identity string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_mail_preamble_layout() {
        assert_eq!(
            mail_preamble(1, "alice"),
            "Subject: Output from your job        1\nTo: alice\n\n"
        );
        assert_eq!(
            mail_preamble(0xfffff, "bob"),
            "Subject: Output from your job  1048575\nTo: bob\n\n"
        );
    }

    #[test]
    fn test_tamper_check_accepts_untouched_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a0000100000000");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        let file = File::open(&path).unwrap();
        assert!(tamper_check(&file, &path).is_ok());
    }

    #[test]
    fn test_tamper_check_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("real");
        let path = dir.path().join("a0000100000000");
        fs::write(&target, "#!/bin/sh\n").unwrap();
        symlink(&target, &path).unwrap();
        let file = File::open(&path).unwrap();
        let err = tamper_check(&file, &path).unwrap_err();
        assert!(matches!(err, RunqError::Tampered(_)));
    }

    #[test]
    fn test_tamper_check_rejects_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a0000100000000");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        let file = File::open(&path).unwrap();
        // Swap a different inode in behind the open descriptor.
        fs::remove_file(&path).unwrap();
        fs::write(&path, "#!/bin/sh\nrm -rf /\n").unwrap();
        let err = tamper_check(&file, &path).unwrap_err();
        assert!(matches!(err, RunqError::Tampered(_)));
    }

    #[test]
    fn test_tamper_check_rejects_extra_links() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a0000100000000");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::hard_link(&path, dir.path().join("=0000100000000")).unwrap();
        fs::hard_link(&path, dir.path().join("alias")).unwrap();
        let file = File::open(&path).unwrap();
        let err = tamper_check(&file, &path).unwrap_err();
        assert!(matches!(err, RunqError::Tampered(_)));
    }

    #[test]
    fn test_vet_header_rejects_uid_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job");
        fs::write(
            &path,
            "#!/bin/sh\n# atrun uid=1000 gid=1000\n# mail alice 0\n",
        )
        .unwrap();
        let file = File::open(&path).unwrap();
        assert!(parse_and_vet_header(&file, 1001).is_err());
        let file = File::open(&path).unwrap();
        assert!(parse_and_vet_header(&file, 1000).is_ok());
    }

    #[test]
    fn test_vet_header_rejects_leading_dash_login() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job");
        fs::write(
            &path,
            "#!/bin/sh\n# atrun uid=1000 gid=1000\n# mail -oops 0\n",
        )
        .unwrap();
        let file = File::open(&path).unwrap();
        let err = parse_and_vet_header(&file, 1000).unwrap_err();
        assert!(matches!(err, RunqError::IllegalMailName(_)));
    }

    #[test]
    fn test_create_output_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let name = JobName::parse("a0000100000000").unwrap();
        let path = dir.path().join(name.as_str());
        assert!(create_output_file(&path, &name).is_ok());
        assert!(create_output_file(&path, &name).is_err());
    }
}
