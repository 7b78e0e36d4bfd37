// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::fmt::Display;
use std::io;

use remain::sorted;
use thiserror::Error;

/// A positive errno value reported by the channel program builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// The raw (positive) errno value.
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

#[sorted]
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Another start, halt or clear is already in flight, or hardware answered cc 1/2.
    #[error("subchannel busy, retry later")]
    Busy,
    /// A waiter was released because the device was torn down.
    #[error("wait cancelled by device teardown")]
    Cancelled,
    /// Building or prefetching the channel program failed.
    #[error("channel program rejected: {0}")]
    ChannelProgram(Errno),
    /// The async region's command tag does not name the dispatched request.
    #[error("async command tag {0:#x} does not match the request")]
    CommandMismatch(u32),
    /// The hardware returned a condition code outside 0..=3.
    #[error("unexpected condition code {0}")]
    ConditionCode(u8),
    /// A region access was out of bounds.
    #[error("invalid region access at offset {offset:#x}, length {len}")]
    InvalidAccess { offset: u64, len: usize },
    /// The request is not valid in the current state.
    #[error("operation not permitted in the current state")]
    InvalidState,
    /// The subchannel is not operational.
    #[error("subchannel not operational")]
    NoDevice,
    /// The SCSW of an I/O request names no function.
    #[error("no function requested")]
    NoFunction,
    /// The channel program could not produce an ORB.
    #[error("channel program has no ORB")]
    NoOrb,
    /// The paths of the request are gone but others remain usable.
    #[error("no usable path for the request")]
    NoPath,
    /// Another caller is accessing the regions.
    #[error("region in use, try again")]
    RegionBusy,
    /// Quiesce did not see the interrupt in time.
    #[error("timed out waiting for the subchannel")]
    TimedOut,
    /// Transport mode, or halt/clear routed through the I/O region.
    #[error("operation not supported")]
    Unsupported,
}

impl Error {
    /// The signed code stored in a region's `ret_code` field.
    ///
    /// Anomalous condition codes are passed through as their (positive) value.
    pub fn errno(&self) -> i32 {
        use self::Error::*;

        match self {
            Busy => -libc::EBUSY,
            Cancelled => -libc::ECANCELED,
            ChannelProgram(e) => -e.raw(),
            CommandMismatch(_) => -libc::EINVAL,
            ConditionCode(cc) => *cc as i32,
            InvalidAccess { .. } => -libc::EINVAL,
            InvalidState => -libc::EIO,
            NoDevice => -libc::ENODEV,
            NoFunction => -libc::EINVAL,
            NoOrb => -libc::EIO,
            NoPath => -libc::EACCES,
            RegionBusy => -libc::EAGAIN,
            TimedOut => -libc::ETIMEDOUT,
            Unsupported => -libc::EOPNOTSUPP,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Converts an operation result into the value written to a region's `ret_code`.
pub(crate) fn ret_code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.errno(),
    }
}
