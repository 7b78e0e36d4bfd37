// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The subchannel handle shared with the channel subsystem layer.
//!
//! A [`Subchannel`] is created and owned by whoever binds the device; the state machine only
//! borrows it. Its lock is the hardware lock: every privileged instruction, and every
//! read-modify-write of the path masks and pending bits, happens with it held.

use std::sync::MutexGuard;

use enumn::N;
use sync::Mutex;

use crate::cio::ActivityControl;
use crate::cio::Orb;
use crate::cio::Schib;
use crate::cio::SubchannelId;

/// Condition code set by a privileged I/O instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum ConditionCode {
    Accepted = 0,
    StatusPending = 1,
    Busy = 2,
    NotOperational = 3,
}

/// The privileged channel I/O instructions, as provided by the platform.
///
/// Each instruction returns its raw condition code. Implementations are only ever called with
/// the owning [`Subchannel`]'s lock held.
pub trait ChannelIo: Send {
    /// Start subchannel.
    fn start(&mut self, schid: SubchannelId, orb: &Orb) -> u8;
    /// Halt subchannel.
    fn halt(&mut self, schid: SubchannelId) -> u8;
    /// Clear subchannel.
    fn clear(&mut self, schid: SubchannelId) -> u8;
    /// Cancel subchannel.
    fn cancel(&mut self, schid: SubchannelId) -> u8;
    /// Modify subchannel: enable or disable it with the given interruption parameter.
    fn modify(&mut self, schid: SubchannelId, enable: bool, intparm: u32) -> u8;
    /// Store subchannel. `None` means the subchannel is gone or its device is no longer valid.
    fn store(&mut self, schid: SubchannelId) -> Option<Schib>;
    /// Asks the channel subsystem to unregister the subchannel at its convenience.
    fn schedule_unregister(&mut self, schid: SubchannelId);
}

/// Everything guarded by the subchannel lock.
pub struct SubchannelState {
    pub(crate) io: Box<dyn ChannelIo>,
    /// Logical path mask: paths requests may currently use.
    pub(crate) lpm: u8,
    /// Operational path mask: paths not varied offline.
    pub(crate) opm: u8,
    pub(crate) schib: Schib,
    pub(crate) enabled: bool,
    pub(crate) usable: bool,
}

impl SubchannelState {
    /// Activity-control bits recorded for functions this side initiated.
    pub fn pending(&self) -> ActivityControl {
        self.schib.scsw.actl()
    }

    pub(crate) fn set_pending(&mut self, actl: ActivityControl) {
        self.schib.scsw.set_actl(actl);
    }
}

pub struct Subchannel {
    id: SubchannelId,
    state: Mutex<SubchannelState>,
}

impl Subchannel {
    /// Creates a handle for `id` whose paths in `lpm` are usable.
    pub fn new(id: SubchannelId, io: Box<dyn ChannelIo>, lpm: u8) -> Subchannel {
        Subchannel {
            id,
            state: Mutex::new(SubchannelState {
                io,
                lpm,
                opm: lpm,
                schib: Schib::default(),
                enabled: false,
                usable: true,
            }),
        }
    }

    pub fn id(&self) -> SubchannelId {
        self.id
    }

    /// Takes the hardware lock.
    pub fn lock(&self) -> MutexGuard<SubchannelState> {
        self.state.lock()
    }

    pub fn lpm(&self) -> u8 {
        self.lock().lpm
    }

    pub fn opm(&self) -> u8 {
        self.lock().opm
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// False once a request found no remaining path to the device.
    pub fn is_usable(&self) -> bool {
        self.lock().usable
    }

    /// Activity-control bits recorded for functions this side initiated.
    pub fn pending(&self) -> ActivityControl {
        self.lock().pending()
    }

    /// The interruption parameter the subchannel is enabled with.
    pub(crate) fn intparm(&self) -> u32 {
        self.id.sch_no as u32
    }
}
