//! The single-threaded dispatcher owning all consensus state.
//!
//! Every mutation of the log, the view, and the protocol components
//! happens on this thread. The dispatcher never blocks on I/O, only on
//! its own task queue; timers are logical delays relative to the task
//! loop, not wall-clock deadlines.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::trace;

/// Relative importance of a scheduled task. Numerically lower is more
/// important; an armed task is replaced only by one of strictly higher
/// priority.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

/// Handle to a scheduled task, used for cancellation and for the
/// priority-replacement rule.
#[derive(Clone)]
pub struct PriorityTask {
    priority: Priority,
    cancelled: Arc<AtomicBool>,
}

impl PriorityTask {
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Relaxed)
    }
}

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;
type RepeatingTask<S> = Box<dyn FnMut(&mut S) + Send>;

struct ScheduledJob<S> {
    delay: Duration,
    /// Re-arm interval measured from the end of each run; one-shot
    /// tasks have none.
    period: Option<Duration>,
    cancelled: Arc<AtomicBool>,
    job: RepeatingTask<S>,
}

enum Work<S> {
    Execute(Task<S>),
    Schedule(ScheduledJob<S>),
    Shutdown,
}

struct Timed<S> {
    run_at: Instant,
    seq: u64,
    job: ScheduledJob<S>,
}

impl<S> PartialEq for Timed<S> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<S> Eq for Timed<S> {}

impl<S> PartialOrd for Timed<S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Timed<S> {
    // min-heap on deadline; ties resolved by submission order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cloneable entry point into a dispatcher. Tasks submitted through one
/// handle are executed in submission order.
pub struct DispatcherHandle<S> {
    tx: Sender<Work<S>>,
    thread_id: Arc<OnceLock<ThreadId>>,
}

impl<S> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        DispatcherHandle {
            tx: self.tx.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

impl<S: 'static> DispatcherHandle<S> {
    /// Queues `task` for execution on the dispatcher thread.
    pub fn submit(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        // a send failure means the dispatcher is already gone; the
        // task can only be dropped at that point
        let _ = self.tx.send(Work::Execute(Box::new(task)));
    }

    /// Arms a one-shot task after `delay`.
    pub fn schedule(
        &self,
        priority: Priority,
        delay: Duration,
        task: impl FnOnce(&mut S) + Send + 'static,
    ) -> PriorityTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let done = cancelled.clone();
        let mut task = Some(task);
        let job = ScheduledJob {
            delay,
            period: None,
            cancelled: cancelled.clone(),
            job: Box::new(move |state: &mut S| {
                if let Some(task) = task.take() {
                    task(state);
                }
                done.store(true, AtomicOrdering::Relaxed);
            }),
        };
        let _ = self.tx.send(Work::Schedule(job));
        PriorityTask {
            priority,
            cancelled,
        }
    }

    /// Arms a repeating task: first run after `delay`, then re-armed
    /// `period` after each run completes.
    pub fn schedule_with_fixed_delay(
        &self,
        priority: Priority,
        delay: Duration,
        period: Duration,
        task: impl FnMut(&mut S) + Send + 'static,
    ) -> PriorityTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = ScheduledJob {
            delay,
            period: Some(period),
            cancelled: cancelled.clone(),
            job: Box::new(task),
        };
        let _ = self.tx.send(Work::Schedule(job));
        PriorityTask {
            priority,
            cancelled,
        }
    }

    /// Whether the calling thread is the dispatcher thread. Components
    /// owning dispatcher-exclusive state assert this on entry.
    pub fn am_i_in_dispatcher(&self) -> bool {
        self.thread_id
            .get()
            .map(|id| *id == thread::current().id())
            .unwrap_or(false)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Work::Shutdown);
    }
}

/// Spawns a named dispatcher thread. The state is constructed on the
/// dispatcher thread itself, with its own handle available, and never
/// leaves it.
pub fn spawn<S, F>(name: &str, init: F) -> (DispatcherHandle<S>, JoinHandle<()>)
where
    S: 'static,
    F: FnOnce(&DispatcherHandle<S>) -> S + Send + 'static,
{
    let (tx, rx) = unbounded();
    let thread_id = Arc::new(OnceLock::new());

    let handle = DispatcherHandle {
        tx,
        thread_id: thread_id.clone(),
    };
    let loop_handle = handle.clone();

    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = thread_id.set(thread::current().id());
            let mut state = init(&loop_handle);
            run_loop(&mut state, rx);
        })
        .expect("failed to spawn dispatcher thread");

    (handle, join)
}

fn run_loop<S>(state: &mut S, rx: Receiver<Work<S>>) {
    let mut heap: BinaryHeap<Timed<S>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        // run everything that is due
        let now = Instant::now();
        while heap.peek().map(|t| t.run_at <= now).unwrap_or(false) {
            let mut timed = heap.pop().unwrap();
            if timed.job.cancelled.load(AtomicOrdering::Relaxed) {
                continue;
            }
            (timed.job.job)(state);
            if let Some(period) = timed.job.period {
                if !timed.job.cancelled.load(AtomicOrdering::Relaxed) {
                    timed.run_at = Instant::now() + period;
                    seq += 1;
                    timed.seq = seq;
                    heap.push(timed);
                }
            }
        }

        let work = match heap.peek() {
            Some(next) => {
                let timeout = next.run_at.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(work) => work,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(work) => work,
                Err(_) => break,
            },
        };

        match work {
            Work::Execute(task) => task(state),
            Work::Schedule(job) => {
                seq += 1;
                heap.push(Timed {
                    run_at: Instant::now() + job.delay,
                    seq,
                    job,
                });
            }
            Work::Shutdown => break,
        }
    }

    trace!("dispatcher loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        hits: Arc<AtomicUsize>,
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (handle, join) = spawn("test-dispatcher", {
            let hits = hits.clone();
            move |_| Counter { hits }
        });

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..10usize {
            let order = order.clone();
            handle.submit(move |state: &mut Counter| {
                state.hits.fetch_add(1, AtomicOrdering::Relaxed);
                order.lock().push(i);
            });
        }

        handle.shutdown();
        join.join().unwrap();

        assert_eq!(hits.load(AtomicOrdering::Relaxed), 10);
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn scheduled_task_fires_and_cancel_works() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (handle, join) = spawn("test-dispatcher", {
            let hits = hits.clone();
            move |_| Counter { hits }
        });

        handle.schedule(
            Priority::Normal,
            Duration::from_millis(5),
            |state: &mut Counter| {
                state.hits.fetch_add(1, AtomicOrdering::Relaxed);
            },
        );
        let cancelled = handle.schedule(
            Priority::Normal,
            Duration::from_millis(5),
            |state: &mut Counter| {
                state.hits.fetch_add(100, AtomicOrdering::Relaxed);
            },
        );
        cancelled.cancel();

        thread::sleep(Duration::from_millis(60));
        handle.shutdown();
        join.join().unwrap();

        assert_eq!(hits.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn repeating_task_repeats_until_cancelled() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (handle, join) = spawn("test-dispatcher", {
            let hits = hits.clone();
            move |_| Counter { hits }
        });

        let task = handle.schedule_with_fixed_delay(
            Priority::Low,
            Duration::from_millis(1),
            Duration::from_millis(1),
            |state: &mut Counter| {
                state.hits.fetch_add(1, AtomicOrdering::Relaxed);
            },
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(AtomicOrdering::Relaxed) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        task.cancel();
        let after_cancel = hits.load(AtomicOrdering::Relaxed);
        assert!(after_cancel >= 3);

        thread::sleep(Duration::from_millis(20));
        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn affinity_is_detected() {
        let (handle, join) = spawn("test-dispatcher", |_| Counter {
            hits: Arc::new(AtomicUsize::new(0)),
        });

        assert!(!handle.am_i_in_dispatcher());

        let (tx, rx) = crossbeam_channel::bounded(1);
        let probe = handle.clone();
        handle.submit(move |_| {
            tx.send(probe.am_i_in_dispatcher()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());

        handle.shutdown();
        join.join().unwrap();
    }
}
