/// procfs session accounting
///
/// Fallback when no delegated cgroup exists. The sandbox leader starts its own
/// session, so every process it forks (and that does not call `setsid` again)
/// shares the leader's session id. Usage is the sum over `/proc/[pid]/stat` of
/// those members, plus what the leader collected from its reaped children.
use crate::kernel::accounting::{Accounting, UsageSample};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::time::Duration;

/// Fields of `/proc/[pid]/stat` used for accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub pgrp: i32,
    pub session: i32,
    pub utime_ticks: u64,
    pub stime_ticks: u64,
    pub cutime_ticks: u64,
    pub cstime_ticks: u64,
    pub rss_pages: u64,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Parse one stat line. The command name may contain spaces and parentheses,
/// so fields are counted from the last `)`.
pub fn parse_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let fields: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // fields[0] is stat field 3 (state)
    let field = |n: usize| fields.get(n - 3).copied();
    let number = |n: usize| field(n).and_then(|v| v.parse::<i64>().ok());

    Some(ProcStat {
        pid,
        state: field(3)?.chars().next()?,
        pgrp: number(5)? as i32,
        session: number(6)? as i32,
        utime_ticks: number(14)?.max(0) as u64,
        stime_ticks: number(15)?.max(0) as u64,
        cutime_ticks: number(16)?.max(0) as u64,
        cstime_ticks: number(17)?.max(0) as u64,
        rss_pages: number(24)?.max(0) as u64,
    })
}

pub fn read_stat(pid: i32) -> Option<ProcStat> {
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|content| parse_stat(&content))
}

/// Every process whose session id is `session`
pub fn session_members(session: i32) -> Vec<ProcStat> {
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot scan /proc: {}", e);
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_stat)
        .filter(|stat| stat.session == session)
        .collect()
}

fn clock_ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Accounting over the session led by one sandbox leader
pub struct SessionAccounting {
    leader: i32,
    ticks_per_second: u64,
    page_size: u64,
    peak_memory: u64,
    /// CPU of the leader's reaped children, which outlives the leader's stat entry
    reaped_cpu_ticks: u64,
}

impl SessionAccounting {
    pub fn new(leader: Pid) -> Self {
        SessionAccounting {
            leader: leader.as_raw(),
            ticks_per_second: clock_ticks_per_second(),
            page_size: page_size(),
            peak_memory: 0,
            reaped_cpu_ticks: 0,
        }
    }

    fn live_members(&self) -> Vec<ProcStat> {
        session_members(self.leader)
            .into_iter()
            .filter(|stat| !stat.is_zombie())
            .collect()
    }
}

impl Accounting for SessionAccounting {
    fn backend_name(&self) -> &'static str {
        "procfs"
    }

    fn sample(&mut self) -> UsageSample {
        let members = session_members(self.leader);
        let mut memory = 0u64;
        let mut ticks = 0u64;
        let mut processes = 0u32;

        for stat in &members {
            ticks += stat.utime_ticks + stat.stime_ticks;
            if stat.pid == self.leader {
                self.reaped_cpu_ticks = self
                    .reaped_cpu_ticks
                    .max(stat.cutime_ticks + stat.cstime_ticks);
            }
            if !stat.is_zombie() {
                memory += stat.rss_pages * self.page_size;
                processes += 1;
            }
        }
        ticks += self.reaped_cpu_ticks;
        self.peak_memory = self.peak_memory.max(memory);

        UsageSample {
            memory_bytes: memory,
            peak_memory_bytes: self.peak_memory,
            processes,
            cpu_time: Duration::from_millis(ticks * 1000 / self.ticks_per_second),
            oom_killed: false,
            fork_refused: false,
        }
    }

    fn kill_all(&mut self) {
        for stat in self.live_members() {
            let _ = kill(Pid::from_raw(stat.pid), Signal::SIGKILL);
        }
    }

    fn is_empty(&mut self) -> bool {
        self.live_members().is_empty()
    }

    fn enforces_memory(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_awkward_comm() {
        let line = "4242 (my (odd) prog) S 1 4242 4242 0 -1 4194560 100 0 0 0 \
                    25 7 3 1 20 0 1 0 1000 10485760 512 18446744073709551615";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.pgrp, 4242);
        assert_eq!(stat.session, 4242);
        assert_eq!(stat.utime_ticks, 25);
        assert_eq!(stat.stime_ticks, 7);
        assert_eq!(stat.cutime_ticks, 3);
        assert_eq!(stat.cstime_ticks, 1);
        assert_eq!(stat.rss_pages, 512);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(parse_stat("").is_none());
        assert!(parse_stat("12 (short) R 1").is_none());
    }

    #[test]
    fn test_own_process_is_readable() {
        let me = std::process::id() as i32;
        let stat = read_stat(me).unwrap();
        assert_eq!(stat.pid, me);
        assert!(stat.rss_pages > 0);
    }

    #[test]
    fn test_empty_session_samples_zero() {
        // Session ids are pids; an id beyond pid_max never has members.
        let mut accounting = SessionAccounting::new(Pid::from_raw(i32::MAX));
        let sample = accounting.sample();
        assert_eq!(sample.processes, 0);
        assert_eq!(sample.memory_bytes, 0);
        assert!(accounting.is_empty());
    }
}
