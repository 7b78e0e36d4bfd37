// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Channel I/O data structures exchanged with the hardware and the guest.
//!
//! All multi-byte words inside these structures are big-endian, as the architecture defines them.
//! Bit numbers in the comments count from the most significant bit (bit 0) of a 32-bit word.

use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use bitflags::bitflags;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const ORB_SIZE: usize = 12;
pub const SCSW_SIZE: usize = 12;
pub const IRB_SIZE: usize = 96;
pub const SCHIB_SIZE: usize = 52;

// ORB word 1.
const ORB_TRANSPORT_MODE: u32 = 1 << 18; // bit 13
const ORB_LPM_SHIFT: u32 = 8; // bits 16-23

// SCSW word 0.
const SCSW_CC_SHIFT: u32 = 24; // bits 6-7
const SCSW_FCTL_SHIFT: u32 = 12; // bits 17-19
const SCSW_ACTL_SHIFT: u32 = 5; // bits 20-26
const SCSW_STCTL_SHIFT: u32 = 0; // bits 27-31

bitflags! {
    /// Function control field of the SCSW.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct FunctionControl: u8 {
        const START = 0x04;
        const HALT = 0x02;
        const CLEAR = 0x01;
    }
}

bitflags! {
    /// Activity control field of the SCSW.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ActivityControl: u8 {
        const RESUME_PENDING = 0x40;
        const START_PENDING = 0x20;
        const HALT_PENDING = 0x10;
        const CLEAR_PENDING = 0x08;
        const SUBCHANNEL_ACTIVE = 0x04;
        const DEVICE_ACTIVE = 0x02;
        const SUSPENDED = 0x01;
    }
}

bitflags! {
    /// Status control field of the SCSW.
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct StatusControl: u8 {
        const ALERT = 0x10;
        const INTERMEDIATE = 0x08;
        const PRIMARY = 0x04;
        const SECONDARY = 0x02;
        const STATUS_PENDING = 0x01;
    }
}

/// Subchannel identity: channel subsystem id, subchannel set id and subchannel number.
///
/// The textual form is `c.s.nnnn` in hex, e.g. `0.0.013f`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchannelId {
    pub cssid: u8,
    pub ssid: u8,
    pub sch_no: u16,
}

impl SubchannelId {
    pub const fn new(cssid: u8, ssid: u8, sch_no: u16) -> SubchannelId {
        SubchannelId {
            cssid,
            ssid,
            sch_no,
        }
    }
}

impl Display for SubchannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}.{:x}.{:04x}", self.cssid, self.ssid, self.sch_no)
    }
}

/// Error parsing a [`SubchannelId`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseSubchannelIdError(String);

impl Display for ParseSubchannelIdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid subchannel id `{}`, expected c.s.nnnn", self.0)
    }
}

impl std::error::Error for ParseSubchannelIdError {}

impl FromStr for SubchannelId {
    type Err = ParseSubchannelIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSubchannelIdError(s.to_owned());
        let mut parts = s.split('.');
        let (cssid, ssid, sch_no) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(s), Some(n), None) => (c, s, n),
            _ => return Err(err()),
        };
        if sch_no.len() != 4 {
            return Err(err());
        }
        let ssid = u8::from_str_radix(ssid, 16).map_err(|_| err())?;
        // Only four subchannel sets exist.
        if ssid > 3 {
            return Err(err());
        }
        Ok(SubchannelId {
            cssid: u8::from_str_radix(cssid, 16).map_err(|_| err())?,
            ssid,
            sch_no: u16::from_str_radix(sch_no, 16).map_err(|_| err())?,
        })
    }
}

impl Serialize for SubchannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SubchannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

fn word(bytes: &[u8], index: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[index * 4..index * 4 + 4]);
    u32::from_be_bytes(raw)
}

fn set_word(bytes: &mut [u8], index: usize, value: u32) {
    bytes[index * 4..index * 4 + 4].copy_from_slice(&value.to_be_bytes());
}

/// Operation request block, the operand of start subchannel.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(transparent)]
pub struct Orb(pub [u8; ORB_SIZE]);

impl Orb {
    /// Interruption parameter, handed back in the IRB of the resulting interrupt.
    pub fn intparm(&self) -> u32 {
        word(&self.0, 0)
    }

    pub fn set_intparm(&mut self, intparm: u32) {
        set_word(&mut self.0, 0, intparm);
    }

    /// True if the ORB requests transport mode rather than command mode.
    pub fn is_transport_mode(&self) -> bool {
        word(&self.0, 1) & ORB_TRANSPORT_MODE != 0
    }

    /// Logical path mask the request may use.
    pub fn lpm(&self) -> u8 {
        (word(&self.0, 1) >> ORB_LPM_SHIFT) as u8
    }

    pub fn set_lpm(&mut self, lpm: u8) {
        let w = word(&self.0, 1) & !(0xff << ORB_LPM_SHIFT);
        set_word(&mut self.0, 1, w | (lpm as u32) << ORB_LPM_SHIFT);
    }
}

/// Subchannel status word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(transparent)]
pub struct Scsw(pub [u8; SCSW_SIZE]);

impl Scsw {
    /// Builds a command-mode SCSW with the given control fields and condition code 0.
    pub fn new(fctl: FunctionControl, actl: ActivityControl, stctl: StatusControl) -> Scsw {
        let mut scsw = Scsw::default();
        let w0 = (fctl.bits() as u32) << SCSW_FCTL_SHIFT
            | (actl.bits() as u32) << SCSW_ACTL_SHIFT
            | (stctl.bits() as u32) << SCSW_STCTL_SHIFT;
        set_word(&mut scsw.0, 0, w0);
        scsw
    }

    /// Deferred condition code.
    pub fn cc(&self) -> u8 {
        ((word(&self.0, 0) >> SCSW_CC_SHIFT) & 0x3) as u8
    }

    pub fn fctl(&self) -> FunctionControl {
        FunctionControl::from_bits_truncate((word(&self.0, 0) >> SCSW_FCTL_SHIFT) as u8)
    }

    pub fn actl(&self) -> ActivityControl {
        ActivityControl::from_bits_truncate((word(&self.0, 0) >> SCSW_ACTL_SHIFT) as u8)
    }

    pub fn set_actl(&mut self, actl: ActivityControl) {
        let w = word(&self.0, 0) & !(0x7f << SCSW_ACTL_SHIFT);
        set_word(&mut self.0, 0, w | (actl.bits() as u32) << SCSW_ACTL_SHIFT);
    }

    pub fn stctl(&self) -> StatusControl {
        StatusControl::from_bits_truncate((word(&self.0, 0) >> SCSW_STCTL_SHIFT) as u8)
    }

    /// False only for unsolicited status: cc 0 with nothing but alert status pending.
    pub fn is_solicited(&self) -> bool {
        self.cc() != 0 || self.stctl() != (StatusControl::ALERT | StatusControl::STATUS_PENDING)
    }

    /// True once neither the subchannel nor the device is active any more.
    pub fn is_final(&self) -> bool {
        !self
            .actl()
            .intersects(ActivityControl::SUBCHANNEL_ACTIVE | ActivityControl::DEVICE_ACTIVE)
    }
}

/// Interruption response block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Irb {
    pub scsw: Scsw,
    pub esw: [u8; 20],
    pub ecw: [u8; 32],
    pub emw: [u8; 32],
}

impl Irb {
    pub fn new(scsw: Scsw) -> Irb {
        Irb {
            scsw,
            ..Default::default()
        }
    }
}

impl Default for Irb {
    fn default() -> Self {
        Irb::new_zeroed()
    }
}

/// Subchannel information block as stored by store subchannel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct Schib {
    pub pmcw: [u8; 28],
    pub scsw: Scsw,
    pub mba: [u8; 8],
    pub mda: [u8; 4],
}

impl Default for Schib {
    fn default() -> Self {
        Schib::new_zeroed()
    }
}

const_assert_eq!(std::mem::size_of::<Orb>(), ORB_SIZE);
const_assert_eq!(std::mem::size_of::<Scsw>(), SCSW_SIZE);
const_assert_eq!(std::mem::size_of::<Irb>(), IRB_SIZE);
const_assert_eq!(std::mem::size_of::<Schib>(), SCHIB_SIZE);

/// Reporting source code of a channel path CRW.
pub const CRW_RSC_CPATH: u8 = 0x4;
/// Error recovery code: facility initialized.
pub const CRW_ERC_INIT: u8 = 0x02;
/// Error recovery code: permanent error, facility not initialized.
pub const CRW_ERC_PERRN: u8 = 0x06;

/// Channel report word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Crw(pub u32);

impl Crw {
    pub fn new(rsc: u8, erc: u8, rsid: u16) -> Crw {
        Crw(((rsc as u32) & 0xf) << 24 | ((erc as u32) & 0x3f) << 16 | rsid as u32)
    }

    /// Reporting source code.
    pub fn rsc(&self) -> u8 {
        ((self.0 >> 24) & 0xf) as u8
    }

    /// Error recovery code.
    pub fn erc(&self) -> u8 {
        ((self.0 >> 16) & 0x3f) as u8
    }

    /// Reporting source id.
    pub fn rsid(&self) -> u16 {
        self.0 as u16
    }
}
