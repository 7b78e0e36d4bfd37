// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::Condvar;
use crate::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Pending,
    Completed,
    Cancelled,
}

/// Outcome of [`Completion::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// `complete()` was called.
    Completed,
    /// `cancel()` was called before the completion fired.
    Cancelled,
    /// The timeout elapsed first.
    TimedOut,
}

/// A one-shot completion signal.
///
/// The first of `complete()` or `cancel()` decides the outcome; later calls are ignored. Every
/// waiter, past or future, observes that outcome.
#[derive(Debug)]
pub struct Completion {
    status: Mutex<Status>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Completion {
        Completion {
            status: Mutex::new(Status::Pending),
            cond: Condvar::new(),
        }
    }

    /// Fires the completion. Returns false if it had already been completed or cancelled.
    pub fn complete(&self) -> bool {
        self.finish(Status::Completed)
    }

    /// Cancels the completion. Returns false if it had already been completed or cancelled.
    pub fn cancel(&self) -> bool {
        self.finish(Status::Cancelled)
    }

    fn finish(&self, outcome: Status) -> bool {
        let mut status = self.status.lock();
        if *status != Status::Pending {
            return false;
        }
        *status = outcome;
        self.cond.notify_all();
        true
    }

    /// Blocks until the completion fires or is cancelled, or until `timeout` elapses.
    ///
    /// `None` waits forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let guard = self.status.lock();
        let status = match timeout {
            Some(dur) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, dur, |s| *s == Status::Pending);
                *guard
            }
            None => *self.cond.wait_while(guard, |s| *s == Status::Pending),
        };
        match status {
            Status::Pending => WaitResult::TimedOut,
            Status::Completed => WaitResult::Completed,
            Status::Cancelled => WaitResult::Cancelled,
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Completion::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn complete_wakes_waiter() {
        let completion = Arc::new(Completion::new());
        let waiter = {
            let completion = completion.clone();
            thread::spawn(move || completion.wait(None))
        };
        assert!(completion.complete());
        assert_eq!(waiter.join().unwrap(), WaitResult::Completed);
    }

    #[test]
    fn first_outcome_wins() {
        let completion = Completion::new();
        assert!(completion.cancel());
        assert!(!completion.complete());
        assert_eq!(completion.wait(None), WaitResult::Cancelled);
    }

    #[test]
    fn wait_times_out() {
        let completion = Completion::new();
        assert_eq!(
            completion.wait(Some(Duration::from_millis(10))),
            WaitResult::TimedOut
        );
    }
}
