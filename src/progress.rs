use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::types::ProgressSnapshot;

pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counters shared between the scheduler, its workers and any observers.
///
/// Writers bump `attempted` before `accepted` for the same unit of work and
/// `snapshot` reads in the opposite order, so every snapshot satisfies
/// `accepted <= attempted <= total`.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub attempted: Arc<AtomicU64>,
    pub accepted: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            attempted: Arc::new(AtomicU64::new(0)),
            accepted: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Zero the counters and fix the total for a new run.
    pub fn reset(&self, total: u64) {
        self.accepted.store(0, Ordering::SeqCst);
        self.attempted.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn record_attempt(&self) {
        self.attempted.fetch_add(1, Ordering::SeqCst);
    }

    /// Guard that records one attempt exactly once: on `finish`, or on drop
    /// if the unit of work unwinds first.
    pub fn attempt_guard(&self) -> AttemptGuard {
        AttemptGuard { progress: self.clone(), recorded: false }
    }

    /// Count one accepted outcome unless that would exceed `limit`.
    /// Returns false when the budget is already used up.
    pub fn try_accept(&self, limit: Option<u64>) -> bool {
        match limit {
            None => {
                self.accepted.fetch_add(1, Ordering::SeqCst);
                true
            }
            Some(max) => self
                .accepted
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
                .is_ok(),
        }
    }

    pub fn limit_reached(&self, limit: Option<u64>) -> bool {
        limit.is_some_and(|max| self.accepted.load(Ordering::SeqCst) >= max)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let accepted = self.accepted.load(Ordering::SeqCst);
        let attempted = self.attempted.load(Ordering::SeqCst);
        ProgressSnapshot { attempted, accepted, total: self.total() }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AttemptGuard {
    progress: SharedProgress,
    recorded: bool,
}

impl AttemptGuard {
    pub fn finish(&mut self) {
        if !self.recorded {
            self.recorded = true;
            self.progress.record_attempt();
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Render one progress line. Periodic lines end in `\r` so the next one
/// overwrites them; only the final line ends in `\n`.
pub fn render_line(s: &ProgressSnapshot, last: bool) -> String {
    let end = if last { '\n' } else { '\r' };
    format!(
        "{}/{} ({:.2}%), accepted={}{}",
        s.attempted,
        s.total,
        s.percent(),
        s.accepted,
        end
    )
}

/// Periodic observer that prints the shared counters until finished.
pub struct ProgressReporter {
    cancel: CancellationToken,
    task: JoinHandle<Box<dyn Write + Send>>,
    progress: SharedProgress,
}

impl ProgressReporter {
    /// Start reporting to stdout.
    pub fn start(progress: SharedProgress) -> Self {
        Self::start_with_writer(progress, Box::new(io::stdout()), REPORT_INTERVAL)
    }

    pub fn start_with_writer(
        progress: SharedProgress,
        mut out: Box<dyn Write + Send>,
        every: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let observed = progress.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let line = render_line(&observed.snapshot(), false);
                        let _ = out.write_all(line.as_bytes());
                        let _ = out.flush();
                    }
                }
            }
            out
        });
        Self { cancel, task, progress }
    }

    /// Stop the ticker, wait for it, then print the final snapshot.
    /// Nothing is printed by the reporter after this returns.
    pub async fn finish(self) -> ProgressSnapshot {
        self.cancel.cancel();
        let final_snapshot = self.progress.snapshot();
        let line = render_line(&final_snapshot, true);
        match self.task.await {
            Ok(mut out) => {
                let _ = out.write_all(line.as_bytes());
                let _ = out.flush();
            }
            Err(_) => print!("{line}"),
        }
        final_snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn render_running_and_final_lines() {
        let s = ProgressSnapshot { attempted: 1, accepted: 1, total: 4 };
        assert_eq!(render_line(&s, false), "1/4 (25.00%), accepted=1\r");
        assert_eq!(render_line(&s, true), "1/4 (25.00%), accepted=1\n");
        let done = ProgressSnapshot { attempted: 4, accepted: 2, total: 4 };
        assert!(render_line(&done, false).ends_with('\r'));
    }

    #[test]
    fn accept_respects_limit() {
        let p = SharedProgress::new();
        p.reset(10);
        assert!(p.try_accept(Some(2)));
        assert!(p.try_accept(Some(2)));
        assert!(!p.try_accept(Some(2)));
        assert!(p.limit_reached(Some(2)));
        assert!(!p.limit_reached(None));
        assert_eq!(p.snapshot().accepted, 2);
    }

    #[test]
    fn attempt_guard_records_once() {
        let p = SharedProgress::new();
        p.reset(2);
        {
            let mut g = p.attempt_guard();
            g.finish();
            g.finish();
        }
        assert_eq!(p.snapshot().attempted, 1);
    }

    #[tokio::test]
    async fn attempt_counted_when_task_panics() {
        let p = SharedProgress::new();
        p.reset(1);
        let observed = p.clone();
        let res = tokio::spawn(async move {
            let _attempt = observed.attempt_guard();
            panic!("worker blew up");
        })
        .await;
        assert!(res.unwrap_err().is_panic());
        assert_eq!(p.snapshot(), ProgressSnapshot { attempted: 1, accepted: 0, total: 1 });
    }

    #[tokio::test]
    async fn complete_tick_does_not_end_line() {
        let buf = SharedBuf::default();
        let p = SharedProgress::new();
        p.reset(1);
        p.record_attempt();
        let reporter =
            ProgressReporter::start_with_writer(p.clone(), Box::new(buf.clone()), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        reporter.finish().await;

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("1/1 (100.00%), accepted=0\r"));
        assert_eq!(text.matches('\n').count(), 1);
        assert!(text.ends_with("1/1 (100.00%), accepted=0\n"));
    }

    #[tokio::test]
    async fn finish_prints_final_counts_last() {
        let buf = SharedBuf::default();
        let p = SharedProgress::new();
        p.reset(3);
        let reporter =
            ProgressReporter::start_with_writer(p.clone(), Box::new(buf.clone()), Duration::from_millis(10));
        p.record_attempt();
        tokio::time::sleep(Duration::from_millis(35)).await;
        p.record_attempt();
        p.try_accept(None);
        let snap = reporter.finish().await;
        assert_eq!(snap, ProgressSnapshot { attempted: 2, accepted: 1, total: 3 });

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(text.ends_with("2/3 (66.67%), accepted=1\n"));
        assert_eq!(text.matches('\n').count(), 1);
    }
}
