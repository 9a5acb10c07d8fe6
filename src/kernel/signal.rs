/// Process-group signalling for sandbox termination
///
/// Every sandbox leader calls `setsid()`, so its pid is also its process group
/// and session id. Signals go to the whole group; when the group is already
/// gone the leader itself is signalled as a fallback.
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::thread;
use std::time::{Duration, Instant};

const TERM_POLL: Duration = Duration::from_millis(5);

/// What a termination sequence actually did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KillReport {
    pub pid: i32,
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Deliver `signal` to the process group led by `leader`.
///
/// Returns true when at least one process received it.
pub fn signal_group(leader: Pid, signal: Signal) -> std::result::Result<bool, String> {
    match killpg(leader, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => match kill(leader, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(format!("kill({leader}, {signal}) failed: {e}")),
        },
        Err(e) => Err(format!("killpg({leader}, {signal}) failed: {e}")),
    }
}

/// SIGKILL the group led by `leader`, ignoring groups that already vanished.
pub fn kill_group(leader: Pid) -> bool {
    match signal_group(leader, Signal::SIGKILL) {
        Ok(sent) => sent,
        Err(e) => {
            log::warn!("{}", e);
            false
        }
    }
}

/// Graceful termination: SIGTERM, wait up to `grace` for `leader_gone` to
/// report the leader exited, then SIGKILL the group unconditionally.
///
/// `leader_gone` is polled, so it may reap the leader itself. Once it returns
/// true the group is no longer signalled by pid, since the pid may be reused.
pub fn terminate_group<F>(leader: Pid, grace: Duration, mut leader_gone: F) -> KillReport
where
    F: FnMut() -> bool,
{
    let mut report = KillReport {
        pid: leader.as_raw(),
        ..KillReport::default()
    };
    let start = Instant::now();

    match signal_group(leader, Signal::SIGTERM) {
        Ok(sent) => report.term_sent = sent,
        Err(e) => report.notes.push(e),
    }

    let mut gone = leader_gone();
    while !gone && start.elapsed() < grace {
        thread::sleep(TERM_POLL.min(grace.saturating_sub(start.elapsed())));
        gone = leader_gone();
    }

    if gone {
        report.notes.push("leader exited within the grace period".to_string());
    } else {
        match signal_group(leader, Signal::SIGKILL) {
            Ok(sent) => report.kill_sent = sent,
            Err(e) => report.notes.push(e),
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Decoded `wait4` status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitState {
    pub fn from_raw(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            ExitState {
                exit_code: Some(libc::WEXITSTATUS(status)),
                signal: None,
            }
        } else if libc::WIFSIGNALED(status) {
            ExitState {
                exit_code: None,
                signal: Some(libc::WTERMSIG(status)),
            }
        } else {
            ExitState {
                exit_code: None,
                signal: None,
            }
        }
    }
}

/// Exit state and resource usage of a reaped child
#[derive(Debug, Clone, Copy)]
pub struct Reaped {
    pub state: ExitState,
    pub cpu_time: Duration,
    /// `ru_maxrss` converted to bytes
    pub max_rss_bytes: u64,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Reap `pid` if it has exited. `Ok(None)` means it is still running.
pub fn try_reap(pid: Pid) -> std::result::Result<Option<Reaped>, Errno> {
    reap(pid, libc::WNOHANG)
}

/// Block until `pid` exits and reap it.
pub fn reap_blocking(pid: Pid) -> std::result::Result<Reaped, Errno> {
    loop {
        if let Some(reaped) = reap(pid, 0)? {
            return Ok(reaped);
        }
    }
}

fn reap(pid: Pid, flags: libc::c_int) -> std::result::Result<Option<Reaped>, Errno> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data, fully written by wait4 on success.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: status and usage point at live stack values.
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, flags, &mut usage) };
        if rc == 0 {
            return Ok(None);
        }
        if rc == pid.as_raw() {
            return Ok(Some(Reaped {
                state: ExitState::from_raw(status),
                cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
                max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
            }));
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(e),
        }
    }
}
