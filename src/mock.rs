// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recording implementations of the hardware and channel program interfaces for unit tests.

use std::sync::Arc;

use sync::Mutex;

use crate::cio::Orb;
use crate::cio::Schib;
use crate::cio::Scsw;
use crate::cio::SubchannelId;
use crate::cp::ChannelProgram;
use crate::error::Errno;
use crate::subchannel::ChannelIo;

/// Condition codes to answer with and a count of every instruction issued.
pub struct MockHw {
    pub start_cc: u8,
    pub halt_cc: u8,
    pub clear_cc: u8,
    pub cancel_cc: u8,
    pub modify_cc: u8,
    /// Number of upcoming modify subchannel calls to answer busy regardless of `modify_cc`.
    pub busy_modifies: u32,
    /// What store subchannel returns; `None` makes the subchannel look gone.
    pub schib: Option<Schib>,
    pub starts: u32,
    pub halts: u32,
    pub clears: u32,
    pub cancels: u32,
    pub enables: u32,
    pub disables: u32,
    pub unregisters: u32,
    pub last_orb: Option<Orb>,
}

impl Default for MockHw {
    fn default() -> Self {
        MockHw {
            start_cc: 0,
            halt_cc: 0,
            clear_cc: 0,
            cancel_cc: 0,
            modify_cc: 0,
            busy_modifies: 0,
            schib: Some(Schib::default()),
            starts: 0,
            halts: 0,
            clears: 0,
            cancels: 0,
            enables: 0,
            disables: 0,
            unregisters: 0,
            last_orb: None,
        }
    }
}

pub type SharedHw = Arc<Mutex<MockHw>>;

pub struct MockChannelIo {
    hw: SharedHw,
}

impl MockChannelIo {
    pub fn new() -> (MockChannelIo, SharedHw) {
        let hw = SharedHw::default();
        (MockChannelIo { hw: hw.clone() }, hw)
    }
}

impl ChannelIo for MockChannelIo {
    fn start(&mut self, _schid: SubchannelId, orb: &Orb) -> u8 {
        let mut hw = self.hw.lock();
        hw.starts += 1;
        hw.last_orb = Some(*orb);
        hw.start_cc
    }

    fn halt(&mut self, _schid: SubchannelId) -> u8 {
        let mut hw = self.hw.lock();
        hw.halts += 1;
        hw.halt_cc
    }

    fn clear(&mut self, _schid: SubchannelId) -> u8 {
        let mut hw = self.hw.lock();
        hw.clears += 1;
        hw.clear_cc
    }

    fn cancel(&mut self, _schid: SubchannelId) -> u8 {
        let mut hw = self.hw.lock();
        hw.cancels += 1;
        hw.cancel_cc
    }

    fn modify(&mut self, _schid: SubchannelId, enable: bool, _intparm: u32) -> u8 {
        let mut hw = self.hw.lock();
        if enable {
            hw.enables += 1;
        } else {
            hw.disables += 1;
        }
        if hw.busy_modifies > 0 {
            hw.busy_modifies -= 1;
            return 2;
        }
        hw.modify_cc
    }

    fn store(&mut self, _schid: SubchannelId) -> Option<Schib> {
        self.hw.lock().schib
    }

    fn schedule_unregister(&mut self, _schid: SubchannelId) {
        self.hw.lock().unregisters += 1;
    }
}

/// Scripted results and a count of every lifecycle call.
pub struct MockCp {
    pub init_result: Result<(), Errno>,
    pub prefetch_result: Result<(), Errno>,
    /// Overrides the path mask of the ORB handed to start subchannel.
    pub orb_lpm: Option<u8>,
    pub pinned: Vec<u64>,
    pub inits: u32,
    pub prefetches: u32,
    pub frees: u32,
    pub scsw_updates: u32,
}

impl Default for MockCp {
    fn default() -> Self {
        MockCp {
            init_result: Ok(()),
            prefetch_result: Ok(()),
            orb_lpm: None,
            pinned: Vec::new(),
            inits: 0,
            prefetches: 0,
            frees: 0,
            scsw_updates: 0,
        }
    }
}

pub type SharedCp = Arc<Mutex<MockCp>>;

pub struct MockChannelProgram {
    cp: SharedCp,
}

impl MockChannelProgram {
    pub fn new() -> (MockChannelProgram, SharedCp) {
        let cp = SharedCp::default();
        (MockChannelProgram { cp: cp.clone() }, cp)
    }
}

impl ChannelProgram for MockChannelProgram {
    fn init(&mut self, _schid: SubchannelId, _orb: &Orb) -> Result<(), Errno> {
        let mut cp = self.cp.lock();
        cp.inits += 1;
        cp.init_result
    }

    fn prefetch(&mut self) -> Result<(), Errno> {
        let mut cp = self.cp.lock();
        cp.prefetches += 1;
        cp.prefetch_result
    }

    fn free(&mut self) {
        self.cp.lock().frees += 1;
    }

    fn get_orb(&mut self, intparm: u32, lpm: u8) -> Option<Orb> {
        let mut orb = Orb::default();
        orb.set_intparm(intparm);
        orb.set_lpm(self.cp.lock().orb_lpm.unwrap_or(lpm));
        Some(orb)
    }

    fn update_scsw(&mut self, _scsw: &mut Scsw) {
        self.cp.lock().scsw_updates += 1;
    }

    fn iova_pinned(&self, iova: u64) -> bool {
        self.cp.lock().pinned.contains(&iova)
    }
}
