//! Service identity and scoped privilege elevation.
//!
//! The daemon does not need root most of the time. At startup it resolves
//! the configured service user/group and drops its effective ids to them,
//! keeping the saved set-user-ID privileged. Operations that genuinely need
//! privilege (opening a submitter's job file, chowning the output file,
//! opening the authentication session) re-acquire it through [`Identity::elevate`],
//! whose guard restores the service identity on every exit path.

use std::ffi::{CStr, CString};
use std::io;

use crate::error::{Result, RunqError};

/// Resolved process identity: the privileged ids the process started with
/// and the service ids it runs as between elevated sections.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    privileged: bool,
    service_uid: libc::uid_t,
    service_gid: libc::gid_t,
    elevated_uid: libc::uid_t,
    elevated_gid: libc::gid_t,
}

impl Identity {
    /// Resolve the service account and relinquish root to it.
    ///
    /// When the process was not started with privileges, identity handling
    /// degrades to a no-op: elevation guards do nothing and children run as
    /// the invoking user. Everything else behaves identically.
    pub fn assume(user: &str, group: &str) -> Result<Identity> {
        // SAFETY: geteuid/getegid cannot fail.
        let euid = unsafe { libc::geteuid() };
        let egid = unsafe { libc::getegid() };

        if euid != 0 {
            tracing::warn!(uid = euid, "Started without privileges; identity switching disabled");
            return Ok(Identity {
                privileged: false,
                service_uid: euid,
                service_gid: egid,
                elevated_uid: euid,
                elevated_gid: egid,
            });
        }

        let (service_uid, _) = lookup_user(user)
            .ok_or_else(|| RunqError::Identity(format!("cannot get uid for {user}")))?;
        let service_gid = lookup_group(group)
            .ok_or_else(|| RunqError::Identity(format!("cannot get gid for {group}")))?;

        let identity = Identity {
            privileged: true,
            service_uid,
            service_gid,
            elevated_uid: euid,
            elevated_gid: egid,
        };
        identity
            .drop_effective()
            .map_err(|e| RunqError::syscall("relinquishing privileges", e))?;
        Ok(identity)
    }

    /// Identity for tests and tools that never switch users.
    pub fn unprivileged() -> Identity {
        // SAFETY: geteuid/getegid cannot fail.
        let euid = unsafe { libc::geteuid() };
        let egid = unsafe { libc::getegid() };
        Identity {
            privileged: false,
            service_uid: euid,
            service_gid: egid,
            elevated_uid: euid,
            elevated_gid: egid,
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Re-acquire the privileged identity for the duration of the returned
    /// guard. Dropping the guard restores the service identity; a restore
    /// failure terminates the process rather than letting elevated
    /// credentials leak into subsequent code.
    pub fn elevate(&self) -> PrivGuard<'_> {
        if self.privileged {
            if let Err(e) = self.raise_effective() {
                tracing::error!(error = %e, "Cannot acquire privileges");
                std::process::exit(1);
            }
        }
        PrivGuard { identity: self }
    }

    /// Raise the effective ids without a guard. Only for `pre_exec`
    /// closures, where the transition is immediately followed by an
    /// irreversible `setuid` to the target user.
    pub fn raise_effective(&self) -> io::Result<()> {
        if !self.privileged {
            return Ok(());
        }
        // SAFETY: plain id syscalls; the uid is raised first because
        // setegid needs an effective uid of 0.
        unsafe {
            if libc::seteuid(self.elevated_uid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setegid(self.elevated_gid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    fn drop_effective(&self) -> io::Result<()> {
        if !self.privileged {
            return Ok(());
        }
        // SAFETY: the gid is dropped first, while the effective uid is
        // still 0. The saved set-user-ID stays privileged so elevate()
        // can switch back.
        unsafe {
            if libc::setegid(self.service_gid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::seteuid(self.service_uid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Scoped privilege elevation; restores the service identity on drop.
pub struct PrivGuard<'a> {
    identity: &'a Identity,
}

impl Drop for PrivGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.identity.drop_effective() {
            tracing::error!(error = %e, "Cannot relinquish privileges");
            std::process::exit(1);
        }
    }
}

/// A copied-out passwd entry for a job's submitter.
#[derive(Debug, Clone)]
pub struct Passwd {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

/// Look up the passwd entry for a uid. Returns `None` when no entry exists,
/// which aborts the job: output could not be delivered to anyone.
pub fn passwd_for_uid(uid: u32) -> Option<Passwd> {
    // SAFETY: getpwuid returns a pointer into static storage; all fields
    // are copied out before any other passwd call can overwrite it. The
    // daemon is single-threaded.
    unsafe {
        let pw = libc::getpwuid(uid as libc::uid_t);
        if pw.is_null() {
            return None;
        }
        let name = CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
        Some(Passwd {
            name,
            uid: (*pw).pw_uid,
            gid: (*pw).pw_gid,
        })
    }
}

fn lookup_user(name: &str) -> Option<(libc::uid_t, libc::gid_t)> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: as for getpwuid; fields copied out immediately.
    unsafe {
        let pw = libc::getpwnam(c_name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some(((*pw).pw_uid, (*pw).pw_gid))
        }
    }
}

fn lookup_group(name: &str) -> Option<libc::gid_t> {
    let c_name = CString::new(name).ok()?;
    // SAFETY: as for getpwnam.
    unsafe {
        let gr = libc::getgrnam(c_name.as_ptr());
        if gr.is_null() {
            None
        } else {
            Some((*gr).gr_gid)
        }
    }
}
