//! Cooperative, cancellable repeating timers. Each tick is expected to check
//! its own liveness predicate (e.g. `network.status() == Online`) and return
//! early otherwise. Disarming is immediate on `Drop`; any in-flight tick
//! completes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// A single cooperative timer thread. The first tick fires after `first`,
/// subsequent ticks every `period`. A `first` of `None` means the timer is
/// armed but never fires its own initial tick -- useful for a ping timer
/// that should wait a full period before its first probe.
pub struct Timer {
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn start<F>(first: Option<Duration>, period: Duration, mut tick: F) -> Timer
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let thread = thread::Builder::new()
            .name("mesh-timer".into())
            .spawn(move || {
                if let Some(delay) = first {
                    if sleep_unless_cancelled(delay, &flag) {
                        return;
                    }
                }
                loop {
                    if flag.load(Ordering::SeqCst) {
                        return;
                    }
                    if !tick() {
                        return;
                    }
                    if sleep_unless_cancelled(period, &flag) {
                        return;
                    }
                }
            })
            .expect("failed to spawn mesh timer thread");

        Timer {
            cancelled,
            thread: Some(thread),
        }
    }
}

/// Sleeps in small slices so cancellation is observed promptly rather than
/// only at the end of a long period. Returns true if cancelled mid-sleep.
fn sleep_unless_cancelled(total: Duration, cancelled: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(SLICE);
        thread::sleep(step);
        remaining -= step;
    }
    cancelled.load(Ordering::SeqCst)
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_periodically_until_dropped() {
        let (tx, rx) = mpsc::channel();
        let timer = Timer::start(Some(Duration::from_millis(0)), Duration::from_millis(20), move || {
            let _ = tx.send(());
            true
        });
        rx.recv_timeout(Duration::from_millis(200)).unwrap();
        rx.recv_timeout(Duration::from_millis(200)).unwrap();
        drop(timer);
    }

    #[test]
    fn first_tick_can_be_disabled() {
        let (tx, rx) = mpsc::channel();
        let start = std::time::Instant::now();
        let timer = Timer::start(None, Duration::from_millis(30), move || {
            let _ = tx.send(start.elapsed());
            true
        });
        let elapsed = rx.recv_timeout(Duration::from_millis(500)).unwrap();
        assert!(elapsed >= Duration::from_millis(25));
        drop(timer);
    }
}
