// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the channel program translator.
//!
//! Translating a guest channel program (walking its CCWs, pinning guest pages, rewriting data
//! addresses) is done elsewhere; the state machine only drives its lifecycle.

use log::debug;
use log::warn;

use crate::cio::Orb;
use crate::cio::Scsw;
use crate::cio::SubchannelId;
use crate::error::Errno;
use crate::Error;
use crate::Result;

/// A translated, host-executable channel program.
pub trait ChannelProgram: Send {
    /// Prepares a channel program from the guest `orb`.
    fn init(&mut self, schid: SubchannelId, orb: &Orb) -> std::result::Result<(), Errno>;
    /// Translates and pins the CCW chain. Only called after a successful `init`.
    fn prefetch(&mut self) -> std::result::Result<(), Errno>;
    /// Unpins and releases everything `init` and `prefetch` acquired.
    fn free(&mut self);
    /// Produces the host ORB for start subchannel.
    fn get_orb(&mut self, intparm: u32, lpm: u8) -> Option<Orb>;
    /// Rewrites the CCW address in `scsw` from host to guest terms.
    fn update_scsw(&mut self, scsw: &mut Scsw);
    /// True if the guest page at `iova` is pinned by this program.
    fn iova_pinned(&self, iova: u64) -> bool;
}

/// Holds the device's channel program and guarantees each built program is freed exactly once.
pub(crate) struct ProgramSlot {
    program: Box<dyn ChannelProgram>,
    active: bool,
}

impl ProgramSlot {
    pub fn new(program: Box<dyn ChannelProgram>) -> ProgramSlot {
        ProgramSlot {
            program,
            active: false,
        }
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Initializes and prefetches a program for `orb`.
    ///
    /// A program still held from an earlier request is freed first. On error nothing is held: a
    /// program that failed to prefetch has already been freed.
    pub fn build(&mut self, schid: SubchannelId, orb: &Orb) -> Result<()> {
        if self.release() {
            warn!("{}: freed stale channel program", schid);
        }
        self.program
            .init(schid, orb)
            .map_err(Error::ChannelProgram)?;
        self.active = true;
        if let Err(e) = self.program.prefetch() {
            debug!("{}: prefetch failed: {}", schid, e);
            self.release();
            return Err(Error::ChannelProgram(e));
        }
        Ok(())
    }

    /// Frees the held program, if any. Returns whether one was held.
    pub fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.program.free();
        self.active = false;
        true
    }

    pub fn get_orb(&mut self, intparm: u32, lpm: u8) -> Option<Orb> {
        if !self.active {
            return None;
        }
        self.program.get_orb(intparm, lpm)
    }

    pub fn update_scsw(&mut self, scsw: &mut Scsw) {
        if self.active {
            self.program.update_scsw(scsw);
        }
    }

    pub fn iova_pinned(&self, iova: u64) -> bool {
        self.active && self.program.iova_pinned(iova)
    }
}
