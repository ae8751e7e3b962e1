use std::fmt;

/// A job filename is exactly 14 characters: one queue character, five hex
/// digits of serial number, eight hex digits of scheduled time in minutes
/// since the epoch.
pub const NAME_LEN: usize = 14;

/// First character of a lock entry.
pub const LOCK_CHAR: char = '=';

/// How the scanner treats a parsed spool entry, keyed off its queue
/// character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// `=`-prefixed hard link: a runner owns the mirrored job.
    Lock,
    /// Uppercase queue or `b`: gated by load average and the batch throttle.
    Batch,
    /// Any other letter: runs as soon as its scheduled time has passed.
    Immediate,
    /// Not a letter; some file type invented in the meantime. Ignored.
    Foreign,
}

/// A parsed spool filename.
///
/// The raw on-disk name is retained verbatim: hex digits are accepted in
/// either case, so a normalized re-rendering would not necessarily name the
/// same directory entry. Ordering is lexicographic on the raw name, which is
/// the batch candidate selection contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobName {
    raw: String,
    serial: u32,
    minutes: u32,
}

impl JobName {
    /// Parse a directory entry name, returning `None` for anything that is
    /// not a well-formed job or lock name.
    pub fn parse(name: &str) -> Option<JobName> {
        let bytes = name.as_bytes();
        if bytes.len() != NAME_LEN || !bytes[0].is_ascii() {
            return None;
        }
        if !bytes[1..].iter().all(u8::is_ascii_hexdigit) {
            return None;
        }
        let serial = u32::from_str_radix(&name[1..6], 16).ok()?;
        let minutes = u32::from_str_radix(&name[6..NAME_LEN], 16).ok()?;
        Some(JobName {
            raw: name.to_string(),
            serial,
            minutes,
        })
    }

    pub fn queue(&self) -> char {
        self.raw.as_bytes()[0] as char
    }

    /// Serial number of the job, used in log lines and the mail subject.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Scheduled execution time in seconds since the epoch. Authoritative;
    /// file mtimes are never consulted for scheduling.
    pub fn run_time(&self) -> i64 {
        i64::from(self.minutes) * 60
    }

    pub fn kind(&self) -> EntryKind {
        let queue = self.queue();
        if queue == LOCK_CHAR {
            EntryKind::Lock
        } else if queue.is_ascii_uppercase() || queue == 'b' {
            EntryKind::Batch
        } else if queue.is_ascii_lowercase() {
            EntryKind::Immediate
        } else {
            EntryKind::Foreign
        }
    }

    /// The on-disk filename, byte for byte.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Name of the lock entry mirroring this job: the queue character
    /// replaced by `=`.
    pub fn lock_name(&self) -> String {
        let mut name = self.raw.clone();
        name.replace_range(0..1, "=");
        name
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
