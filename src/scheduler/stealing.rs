//! Work-stealing pool: per-worker deques plus a lock-free injector.
//!
//! Workers push and pop at the head of their own deque; thieves take from
//! the tail. External submissions land in the injector queue. An idle worker
//! polls its own deque, then the injector, then sweeps victims round-robin
//! and finally picks one at random before parking briefly.

use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use tracing::{debug, error};

use super::{ResumableRef, ResumeResult, Scheduler, WorkerContext};

const PARK_INTERVAL: Duration = Duration::from_millis(1);

struct Shared {
    injector: SegQueue<ResumableRef>,
    locals: Vec<Mutex<VecDeque<ResumableRef>>>,
    sleep: Mutex<()>,
    cv: Condvar,
    stopping: AtomicBool,
    round_robin: AtomicUsize,
}

thread_local! {
    // (pool identity, worker index) of the current thread, if it is a
    // stealing-pool worker.
    static WORKER_SLOT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

pub struct StealingScheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl StealingScheduler {
    pub fn start(threads: usize, max_throughput: usize) -> Self {
        let shared = Arc::new(Shared {
            injector: SegQueue::new(),
            locals: (0..threads).map(|_| Mutex::new(VecDeque::new())).collect(),
            sleep: Mutex::new(()),
            cv: Condvar::new(),
            stopping: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
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
}

fn pool_token(shared: &Arc<Shared>) -> usize {
    Arc::as_ptr(shared) as usize
}

fn find_work(shared: &Arc<Shared>, worker_id: usize) -> Option<ResumableRef> {
    // Own deque first: push and pop share the head.
    if let Some(r) = shared.locals[worker_id].lock().pop_front() {
        return Some(r);
    }
    if let Some(r) = shared.injector.pop() {
        return Some(r);
    }
    steal(shared, worker_id)
}

fn steal(shared: &Arc<Shared>, worker_id: usize) -> Option<ResumableRef> {
    let n = shared.locals.len();
    if n <= 1 {
        return None;
    }
    // One round-robin sweep over the other workers...
    let start = shared.round_robin.fetch_add(1, Ordering::Relaxed);
    for offset in 0..n {
        let victim = (start + offset) % n;
        if victim == worker_id {
            continue;
        }
        if let Some(r) = shared.locals[victim].lock().pop_back() {
            return Some(r);
        }
    }
    // ...then one random attempt before giving up.
    let victim = rand::thread_rng().gen_range(0..n);
    if victim != worker_id {
        return shared.locals[victim].lock().pop_back();
    }
    None
}

fn worker_loop(shared: Arc<Shared>, worker_id: usize, max_throughput: usize) {
    WORKER_SLOT.with(|slot| slot.set(Some((pool_token(&shared), worker_id))));
    let ctx = WorkerContext { worker_id };
    loop {
        match find_work(&shared, worker_id) {
            Some(job) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| job.resume(&ctx, max_throughput)));
                match outcome {
                    Ok(ResumeResult::ResumeLater) => {
                        if shared.stopping.load(Ordering::Acquire) {
                            debug!(worker_id, "dropping resumable during shutdown");
                        } else {
                            // Behind later arrivals: tail of the own deque,
                            // where thieves also look first.
                            shared.locals[worker_id].lock().push_back(job);
                            shared.cv.notify_one();
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        error!(worker_id, "resumable panicked; reference dropped");
                    }
                }
            }
            None => {
                if shared.stopping.load(Ordering::Acquire) {
                    break;
                }
                let mut guard = shared.sleep.lock();
                shared.cv.wait_for(&mut guard, PARK_INTERVAL);
            }
        }
    }
    WORKER_SLOT.with(|slot| slot.set(None));
}

impl Scheduler for StealingScheduler {
    fn schedule(&self, r: ResumableRef) {
        if self.shared.stopping.load(Ordering::Acquire) {
            debug!("schedule after shutdown; dropping resumable");
            return;
        }
        let token = pool_token(&self.shared);
        let local = WORKER_SLOT.with(|slot| match slot.get() {
            Some((t, idx)) if t == token => Some(idx),
            _ => None,
        });
        match local {
            // From a worker thread: head of the own deque.
            Some(idx) => self.shared.locals[idx].lock().push_front(r),
            None => self.shared.injector.push(r),
        }
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
    use std::sync::mpsc;

    struct Job {
        tx: mpsc::Sender<usize>,
        id: usize,
    }

    impl Resumable for Job {
        fn resume(&self, _worker: &WorkerContext, _max_throughput: usize) -> ResumeResult {
            let _ = self.tx.send(self.id);
            ResumeResult::Done
        }
    }

    #[test]
    fn all_submitted_jobs_run() {
        let pool = StealingScheduler::start(4, 5);
        let (tx, rx) = mpsc::channel();
        for id in 0..64 {
            pool.schedule(Arc::new(Job { tx: tx.clone(), id }));
        }
        let mut seen: Vec<usize> = (0..64)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn work_spawned_from_workers_is_stealable() {
        let pool = Arc::new(StealingScheduler::start(3, 5));
        let (tx, rx) = mpsc::channel();

        struct Fanout {
            pool: Arc<StealingScheduler>,
            tx: mpsc::Sender<usize>,
        }
        impl Resumable for Fanout {
            fn resume(&self, _worker: &WorkerContext, _max_throughput: usize) -> ResumeResult {
                // Schedule follow-up work from inside a worker; it lands on
                // the local deque and must still complete somewhere.
                for id in 0..16 {
                    self.pool.schedule(Arc::new(Job {
                        tx: self.tx.clone(),
                        id,
                    }));
                }
                ResumeResult::Done
            }
        }

        pool.schedule(Arc::new(Fanout {
            pool: pool.clone(),
            tx,
        }));
        let mut seen: Vec<usize> = (0..16)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        pool.shutdown();
    }
}
