// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single-threaded queue for deferred completion work.

use std::io;
use std::panic;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use sync::Condvar;
use sync::Mutex;

#[derive(Default)]
struct QueueState {
    pending: bool,
    running: bool,
    stop: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// Runs one work function on a named thread each time it is queued.
///
/// Queueing while a run is already pending is a no-op, so back-to-back interrupts are coalesced
/// into a single run. Dropping the queue finishes pending work, then stops and joins the thread.
pub struct WorkQueue {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawns the thread `name` that will run `work`.
    pub fn start<F>(name: impl Into<String>, mut work: F) -> io::Result<WorkQueue>
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let shared = thread_shared;
            loop {
                let mut state = shared
                    .cond
                    .wait_while(shared.state.lock(), |s| !s.pending && !s.stop);
                if !state.pending {
                    break;
                }
                state.pending = false;
                state.running = true;
                drop(state);

                work();

                shared.state.lock().running = false;
                shared.cond.notify_all();
            }
        })?;

        Ok(WorkQueue {
            shared,
            handle: Some(handle),
        })
    }

    /// Schedules a run of the work function. Returns false if one was already pending.
    pub fn queue(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.pending {
            return false;
        }
        state.pending = true;
        self.shared.cond.notify_all();
        true
    }

    /// Waits until no run is pending or in progress.
    ///
    /// Must not be called from the work function itself.
    pub fn flush(&self) {
        let _state = self
            .shared
            .cond
            .wait_while(self.shared.state.lock(), |s| s.pending || s.running);
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.cond.notify_all();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                panic::resume_unwind(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn queued_work_runs() {
        let runs = Arc::new(AtomicU32::new(0));
        let queue = {
            let runs = runs.clone();
            WorkQueue::start("test_wq", move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        assert!(queue.queue());
        queue.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert!(queue.queue());
        queue.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_work_coalesces() {
        let (gate_tx, gate_rx) = channel::<()>();
        let runs = Arc::new(AtomicU32::new(0));
        let queue = {
            let runs = runs.clone();
            WorkQueue::start("test_wq", move || {
                let _ = gate_rx.recv();
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        assert!(queue.queue());
        // Wait until the first run has been picked up.
        while queue.shared.state.lock().pending {
            thread::yield_now();
        }
        assert!(queue.queue());
        assert!(!queue.queue());

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        queue.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_drains_pending_work() {
        let runs = Arc::new(AtomicU32::new(0));
        let queue = {
            let runs = runs.clone();
            WorkQueue::start("test_wq", move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        queue.queue();
        drop(queue);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_is_named() {
        let (tx, rx) = channel();
        let queue = WorkQueue::start("vfio_ccw_io", move || {
            let _ = tx.send(thread::current().name().map(str::to_owned));
        })
        .unwrap();
        queue.queue();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("vfio_ccw_io"));
    }
}
