//! Background task ownership.
//!
//! The cache spawns short-lived tasks (page loads, copies, flushes) and a
//! long-lived serializer thread. Both are owned: teardown waits for the
//! task set to drain and then stops the serializer thread, so nothing
//! outlives the cache.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

struct TaskState {
    active: usize,
    handles: Vec<JoinHandle<()>>,
}

struct TaskInner {
    state: Mutex<TaskState>,
    drained: Condvar,
}

/// Set of spawned worker threads with deterministic drain.
pub(crate) struct TaskSet {
    inner: Arc<TaskInner>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskInner {
                state: Mutex::new(TaskState {
                    active: 0,
                    handles: Vec::new(),
                }),
                drained: Condvar::new(),
            }),
        }
    }

    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        let inner = Arc::clone(&self.inner);
        let mut state = self.inner.state.lock();
        state.active += 1;
        // Finished handles are dropped opportunistically; drain joins the rest.
        state.handles.retain(|handle| !handle.is_finished());
        let handle = thread::Builder::new()
            .name("silt-task".into())
            .spawn(move || {
                f();
                let mut state = inner.state.lock();
                state.active -= 1;
                if state.active == 0 {
                    inner.drained.notify_all();
                }
            })
            .expect("failed to spawn cache task");
        state.handles.push(handle);
    }

    /// Blocks until every spawned task has finished, then joins them.
    pub fn drain(&self) {
        let handles = {
            let mut state = self.inner.state.lock();
            while state.active > 0 {
                self.inner.drained.wait(&mut state);
            }
            std::mem::take(&mut state.handles)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct SerialQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct SerialInner {
    queue: Mutex<SerialQueue>,
    wakeup: Condvar,
}

/// Dedicated thread that runs serializer calls one at a time, in
/// submission order. This is the cache's stand-in for switching to the
/// serializer's home thread around every call.
pub(crate) struct SerialThread {
    inner: Arc<SerialInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialThread {
    pub fn new() -> Self {
        let inner = Arc::new(SerialInner {
            queue: Mutex::new(SerialQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("silt-serializer".into())
            .spawn(move || {
                let mut queue = worker.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        drop(queue);
                        job();
                        queue = worker.queue.lock();
                    } else if queue.shutdown {
                        break;
                    } else {
                        worker.wakeup.wait(&mut queue);
                    }
                }
            })
            .expect("failed to spawn serializer thread");
        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Runs `f` on the serializer thread and returns its result.
    pub fn call<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        struct Response<R> {
            slot: Mutex<Option<R>>,
            cv: Condvar,
        }
        let response = Arc::new(Response {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        });
        let producer = Arc::clone(&response);
        {
            let mut queue = self.inner.queue.lock();
            assert!(!queue.shutdown, "serializer thread already stopped");
            queue.jobs.push_back(Box::new(move || {
                let value = f();
                let mut slot = producer.slot.lock();
                *slot = Some(value);
                producer.cv.notify_all();
            }));
            self.inner.wakeup.notify_one();
        }
        let mut slot = response.slot.lock();
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            response.cv.wait(&mut slot);
        }
    }

    pub fn stop(&self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
            self.inner.wakeup.notify_one();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn serial_thread_runs_jobs_in_order() {
        let serial = SerialThread::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            let got: usize = serial.call(move || {
                log.lock().push(i);
                i
            });
            assert_eq!(got, i);
        }
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
        serial.stop();
    }

    #[test]
    fn task_set_drains() {
        let tasks = TaskSet::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            tasks.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tasks.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
