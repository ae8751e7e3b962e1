use std::io::BufRead;

use crate::error::{Result, RunqError};

/// The fixed prologue of every job file:
///
/// ```text
/// #!/bin/sh
/// # atrun uid=<uid> gid=<gid>
/// # mail <login-padded-to-LOGIN_NAME_MAX> <switch>
/// ```
///
/// The switch is tri-valued: 1 = always mail, 0 = mail only if the job
/// produced output, -1 = never mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeader {
    pub uid: u32,
    pub gid: u32,
    pub login: String,
    pub send_mail: i32,
}

/// Width of the padded login field: the platform login-name maximum,
/// defaulting to 128 when the platform does not report one.
pub fn login_name_max() -> usize {
    // SAFETY: sysconf has no failure modes beyond returning -1.
    let max = unsafe { libc::sysconf(libc::_SC_LOGIN_NAME_MAX) };
    if max > 0 {
        max as usize
    } else {
        128
    }
}

/// Parse the three header lines from the start of a job file.
pub fn parse_header<R: BufRead>(reader: &mut R) -> Result<JobHeader> {
    let shebang = read_line(reader)?;
    if shebang != "#!/bin/sh" {
        return Err(RunqError::Header("missing #!/bin/sh line".to_string()));
    }

    let owner_line = read_line(reader)?;
    let rest = owner_line
        .strip_prefix("# atrun uid=")
        .ok_or_else(|| RunqError::Header("missing atrun owner line".to_string()))?;
    let (uid_field, rest) = rest
        .split_once(" gid=")
        .ok_or_else(|| RunqError::Header("missing gid field".to_string()))?;
    let uid = parse_id(uid_field)?;
    let gid = parse_id(rest)?;

    let mail_line = read_line(reader)?;
    let rest = mail_line
        .strip_prefix("# mail ")
        .ok_or_else(|| RunqError::Header("missing mail line".to_string()))?;
    let mut fields = rest.split_whitespace();
    let login = fields
        .next()
        .ok_or_else(|| RunqError::Header("missing mail name".to_string()))?;
    if login.len() > login_name_max() {
        return Err(RunqError::Header(format!("mail name {login} too long")));
    }
    let send_mail = fields
        .next()
        .and_then(|field| field.parse::<i32>().ok())
        .ok_or_else(|| RunqError::Header("missing mail switch".to_string()))?;
    if fields.next().is_some() {
        return Err(RunqError::Header("trailing fields on mail line".to_string()));
    }

    Ok(JobHeader {
        uid,
        gid,
        login: login.to_string(),
        send_mail,
    })
}

/// Mail if the switch demands it, or if the job produced output and the
/// switch does not forbid it.
pub fn should_mail(send_mail: i32, produced_output: bool) -> bool {
    send_mail == 1 || (send_mail != -1 && produced_output)
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let bytes = reader
        .read_line(&mut line)
        .map_err(|e| RunqError::syscall("reading job header", e))?;
    if bytes == 0 {
        return Err(RunqError::Header("truncated header".to_string()));
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(line)
}

fn parse_id(field: &str) -> Result<u32> {
    field
        .trim_end()
        .parse::<u32>()
        .map_err(|_| RunqError::Header(format!("bad id field {field:?}")))
}
