//! A small pool of named OS worker threads pulling one-shot jobs off a
//! shared injector queue. Adapted from the teacher's `ethcore-io` worker:
//! same condvar-wakeup / deque-steal shape, generalised from `Work<Message>`
//! dispatch to plain boxed closures, since the mesh fabric's one-shot jobs
//! (dial attempts) need no handler-id routing.

use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool of threads draining a shared job queue. Used for one-shot
/// background work such as outbound dial attempts, so dialing
/// never spawns an unbounded number of raw OS threads.
pub struct WorkerPool {
    injector: Arc<Injector<Job>>,
    wait: Arc<Condvar>,
    wait_mutex: Arc<Mutex<()>>,
    shutting_down: Arc<AtomicBool>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        let injector = Arc::new(Injector::new());
        let wait = Arc::new(Condvar::new());
        let wait_mutex = Arc::new(Mutex::new(()));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let workers = (0..size.max(1))
            .map(|i| {
                Worker::spawn(
                    format!("{name}-{i}"),
                    injector.clone(),
                    wait.clone(),
                    wait_mutex.clone(),
                    shutting_down.clone(),
                )
            })
            .collect();

        WorkerPool {
            injector,
            wait,
            wait_mutex,
            shutting_down,
            workers,
        }
    }

    /// Enqueue a job. Runs on whichever worker wakes first.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.injector.push(Box::new(job));
        let _lock = self.wait_mutex.lock();
        self.wait.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _lock = self.wait_mutex.lock();
        self.shutting_down.store(true, Ordering::SeqCst);
        self.wait.notify_all();
        drop(_lock);
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        name: String,
        injector: Arc<Injector<Job>>,
        wait: Arc<Condvar>,
        wait_mutex: Arc<Mutex<()>>,
        shutting_down: Arc<AtomicBool>,
    ) -> Worker {
        let thread = thread::Builder::new()
            .name(format!("mesh-worker-{name}"))
            .spawn(move || loop {
                loop {
                    match injector.steal() {
                        Steal::Success(job) => job(),
                        Steal::Retry => continue,
                        Steal::Empty => break,
                    }
                }

                let mut lock = wait_mutex.lock();
                if shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                wait.wait(&mut lock);
                if shutting_down.load(Ordering::SeqCst) {
                    break;
                }
            })
            .expect("failed to spawn mesh worker thread");

        Worker {
            thread: Some(thread),
        }
    }

    fn join(mut self) {
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
    fn runs_enqueued_jobs() {
        let pool = WorkerPool::new("test", 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.spawn(move || tx.send(i).unwrap());
        }
        let mut got: Vec<i32> = (0..8).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }
}
