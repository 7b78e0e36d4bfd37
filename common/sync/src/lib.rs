// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitives whose methods panic rather than return an error when poisoned.
//!
//! Releases are built with `panic = 'abort'`, so a panic while a lock is held takes the whole
//! process down and poison can never be observed. Code using these types therefore never has to
//! write `.lock().unwrap()`, which keeps `unwrap` reserved for places where it is reviewed on its
//! own merits.
//!
//! Besides the `Mutex`/`Condvar` wrappers this crate provides [`Completion`], a one-shot signal
//! one thread arms and another thread fires or cancels.

mod completion;
mod condvar;
mod mutex;

pub use crate::completion::Completion;
pub use crate::completion::WaitResult;
pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
pub use crate::mutex::WouldBlock;
