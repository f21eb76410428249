//! Work-sharing pool: one shared queue, many workers.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use super::{ResumableRef, ResumeResult, Scheduler, WorkerContext};

struct Shared {
    queue: Mutex<VecDeque<ResumableRef>>,
    cv: Condvar,
    stopping: AtomicBool,
}

/// The default scheduler: a mutex-and-condvar queue drained by a fixed pool
/// of workers. Fair (strict FIFO among ready resumables) and cheap on small
/// core counts.
pub struct SharingScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SharingScheduler {
    pub fn start(threads: usize, max_throughput: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stopping: AtomicBool::new(false),
        });
        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rook-worker-{worker_id}"))
                .spawn(move || worker_loop(shared, worker_id, max_throughput))
                .expect("failed to spawn scheduler worker");
            handles.push(handle);
        }
        Self {
            shared,
            threads: Mutex::new(handles),
        }
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize, max_throughput: usize) {
    let ctx = WorkerContext { worker_id };
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(r) = queue.pop_front() {
                    break Some(r);
                }
                if shared.stopping.load(Ordering::Acquire) {
                    break None;
                }
                shared.cv.wait(&mut queue);
            }
        };
        let Some(job) = job else {
            return;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.resume(&ctx, max_throughput)));
        match outcome {
            Ok(ResumeResult::ResumeLater) => {
                if shared.stopping.load(Ordering::Acquire) {
                    debug!(worker_id, "dropping resumable during shutdown");
                } else {
                    // Behind later arrivals: plain FIFO re-enqueue.
                    shared.queue.lock().push_back(job);
                    shared.cv.notify_one();
                }
            }
            Ok(_) => {}
            Err(_) => {
                error!(worker_id, "resumable panicked; reference dropped");
            }
        }
    }
}

impl Scheduler for SharingScheduler {
    fn schedule(&self, r: ResumableRef) {
        if self.shared.stopping.load(Ordering::Acquire) {
            debug!("schedule after shutdown; dropping resumable");
            return;
        }
        self.shared.queue.lock().push_back(r);
        self.shared.cv.notify_one();
    }

    fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cv.notify_all();
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("scheduler worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Resumable;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    struct CountedJob {
        hits: AtomicUsize,
        rounds: usize,
        done: mpsc::Sender<usize>,
    }

    impl Resumable for CountedJob {
        fn resume(&self, _worker: &WorkerContext, _max_throughput: usize) -> ResumeResult {
            let hit = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
            if hit < self.rounds {
                ResumeResult::ResumeLater
            } else {
                let _ = self.done.send(hit);
                ResumeResult::Done
            }
        }
    }

    #[test]
    fn resume_later_jobs_run_to_completion() {
        let pool = SharingScheduler::start(2, 5);
        let (tx, rx) = mpsc::channel();
        pool.schedule(Arc::new(CountedJob {
            hits: AtomicUsize::new(0),
            rounds: 4,
            done: tx,
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 4);
        pool.shutdown();
    }

    #[test]
    fn queued_jobs_get_a_final_resume_on_shutdown() {
        let pool = SharingScheduler::start(1, 5);
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();
        // Occupy the only worker so the second job stays queued.
        struct Blocker(Mutex<mpsc::Receiver<()>>);
        impl Resumable for Blocker {
            fn resume(&self, _w: &WorkerContext, _t: usize) -> ResumeResult {
                let _ = self.0.lock().recv_timeout(Duration::from_secs(2));
                ResumeResult::Done
            }
        }
        struct Witness(mpsc::Sender<usize>);
        impl Resumable for Witness {
            fn resume(&self, _w: &WorkerContext, _t: usize) -> ResumeResult {
                let _ = self.0.send(1);
                ResumeResult::Shutdown
            }
        }
        pool.schedule(Arc::new(Blocker(Mutex::new(block_rx))));
        pool.schedule(Arc::new(Witness(seen_tx)));
        let _ = block_tx.send(());
        pool.shutdown();
        // The witness ran exactly once even though shutdown raced it.
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    }

    #[test]
    fn panicking_jobs_do_not_kill_workers() {
        let pool = SharingScheduler::start(1, 5);
        struct Panics;
        impl Resumable for Panics {
            fn resume(&self, _w: &WorkerContext, _t: usize) -> ResumeResult {
                panic!("boom");
            }
        }
        let (tx, rx) = mpsc::channel();
        struct After(mpsc::Sender<()>);
        impl Resumable for After {
            fn resume(&self, _w: &WorkerContext, _t: usize) -> ResumeResult {
                let _ = self.0.send(());
                ResumeResult::Done
            }
        }
        pool.schedule(Arc::new(Panics));
        pool.schedule(Arc::new(After(tx)));
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        pool.shutdown();
    }
}
