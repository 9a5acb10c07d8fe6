/// Background retry of workspace removals that failed or overran their bound
use crate::config::types::Result;
use crate::observability::audit;
use crate::observability::metrics::HarnessMetrics;
use crate::safety::purge::purge_tree;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay before each retry; the path is abandoned after the last one.
pub const DEFAULT_RETRY_SCHEDULE: [Duration; 5] = [
    Duration::from_millis(50),
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

/// Handle to the janitor thread. Cloning shares the same queue.
#[derive(Clone)]
pub struct Janitor {
    tx: Sender<PathBuf>,
    pending: Arc<AtomicUsize>,
}

struct Retry {
    path: PathBuf,
    attempt: usize,
    due: Instant,
}

impl Janitor {
    pub fn spawn(metrics: Arc<HarnessMetrics>) -> Result<Self> {
        Self::spawn_with_schedule(DEFAULT_RETRY_SCHEDULE.to_vec(), metrics)
    }

    pub fn spawn_with_schedule(schedule: Vec<Duration>, metrics: Arc<HarnessMetrics>) -> Result<Self> {
        let (tx, rx) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);

        std::thread::Builder::new()
            .name("runbox-janitor".to_string())
            .spawn(move || run(rx, schedule, worker_pending, metrics))?;

        Ok(Janitor { tx, pending })
    }

    /// Queue a path for removal; returns immediately.
    pub fn defer(&self, path: PathBuf) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.tx.send(path) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!(
                "Janitor is gone, workspace {} left behind",
                err.into_inner().display()
            );
        }
    }

    /// Paths queued or being retried
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until the queue drains. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }
}

fn run(
    rx: Receiver<PathBuf>,
    schedule: Vec<Duration>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<HarnessMetrics>,
) {
    let mut queue: Vec<Retry> = Vec::new();
    let mut closed = false;

    loop {
        let now = Instant::now();
        let next_due = queue.iter().map(|retry| retry.due).min();

        if closed {
            match next_due {
                None => break,
                Some(due) => std::thread::sleep(due.saturating_duration_since(now)),
            }
        } else {
            let received = match next_due {
                Some(due) => rx.recv_timeout(due.saturating_duration_since(now)),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(path) => {
                    queue.push(Retry {
                        path,
                        attempt: 0,
                        due: Instant::now(),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => closed = true,
            }
        }

        let now = Instant::now();
        let mut index = 0;
        while index < queue.len() {
            if queue[index].due > now {
                index += 1;
                continue;
            }
            let retry = &mut queue[index];
            match purge_tree(&retry.path) {
                Ok(()) => {
                    log::info!(
                        "Deferred cleanup removed {} after {} attempt(s)",
                        retry.path.display(),
                        retry.attempt + 1
                    );
                    queue.swap_remove(index);
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) if retry.attempt + 1 >= schedule.len() => {
                    log::error!(
                        "Giving up on workspace {} after {} attempts: {}",
                        retry.path.display(),
                        retry.attempt + 1,
                        err
                    );
                    metrics.cleanup_abandoned.inc();
                    audit::cleanup_abandoned(&retry.path, &err.to_string());
                    queue.swap_remove(index);
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) => {
                    let delay = schedule[retry.attempt];
                    log::warn!(
                        "Cleanup of {} failed (attempt {}), retrying in {:?}: {}",
                        retry.path.display(),
                        retry.attempt + 1,
                        delay,
                        err
                    );
                    retry.attempt += 1;
                    retry.due = now + delay;
                    index += 1;
                }
            }
        }
    }
}
