// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Layout of the device regions shared with the userspace driver.
//!
//! The I/O and async command regions are mailboxes: the caller writes a request, the write
//! dispatches an event, and the result code lands in `ret_code` before the write returns.

use enumn::N;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

use crate::cio::Irb;
use crate::cio::Orb;
use crate::cio::Schib;
use crate::cio::Scsw;
use crate::Error;
use crate::Result;

/// Regions exposed by the device, in index order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum RegionIndex {
    Io = 0,
    Async = 1,
    Schib = 2,
    Crw = 3,
}

impl RegionIndex {
    pub fn size(self) -> usize {
        match self {
            RegionIndex::Io => std::mem::size_of::<IoRegion>(),
            RegionIndex::Async => std::mem::size_of::<CmdRegion>(),
            RegionIndex::Schib => std::mem::size_of::<SchibRegion>(),
            RegionIndex::Crw => std::mem::size_of::<CrwRegion>(),
        }
    }

    pub fn is_writable(self) -> bool {
        matches!(self, RegionIndex::Io | RegionIndex::Async)
    }
}

/// The I/O region: an ORB and SCSW in, a result code and (later) the IRB out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct IoRegion {
    pub orb_area: Orb,
    pub scsw_area: Scsw,
    pub irb_area: Irb,
    /// Signed result code, host byte order.
    pub ret_code: u32,
}

/// Commands accepted by the async command region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum AsyncCommand {
    Halt = 1 << 0,
    Clear = 1 << 1,
}

/// The async command region: a halt or clear request in, a result code out.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CmdRegion {
    pub command: u32,
    /// Signed result code, host byte order.
    pub ret_code: u32,
}

/// The SCHIB region, refreshed by store subchannel on every read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SchibRegion {
    pub schib_area: Schib,
}

/// The CRW region. Each read hands out one pending channel report word.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct CrwRegion {
    /// Big-endian channel report word, zero if none was pending.
    pub crw: [u8; 4],
    pub pad: [u8; 4],
}

const_assert_eq!(std::mem::size_of::<IoRegion>(), 124);
const_assert_eq!(std::mem::size_of::<CmdRegion>(), 8);
const_assert_eq!(std::mem::size_of::<SchibRegion>(), 52);
const_assert_eq!(std::mem::size_of::<CrwRegion>(), 8);

impl Default for IoRegion {
    fn default() -> Self {
        IoRegion::new_zeroed()
    }
}

/// All regions of one device, guarded together by the device's region lock.
#[derive(Default)]
pub(crate) struct Regions {
    pub io: IoRegion,
    pub cmd: CmdRegion,
    pub schib: SchibRegion,
    pub crw: CrwRegion,
}

/// Fails unless `[offset, offset + len)` lies within a region of `size` bytes.
pub(crate) fn check_access(size: usize, offset: u64, len: usize) -> Result<usize> {
    let invalid = Error::InvalidAccess { offset, len };
    let start = usize::try_from(offset).map_err(|_| invalid)?;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start),
        _ => Err(invalid),
    }
}

/// Copies `data` into `region` at `offset`.
pub(crate) fn write_bytes<T>(region: &mut T, offset: u64, data: &[u8]) -> Result<()>
where
    T: FromBytes + IntoBytes,
{
    let bytes = region.as_mut_bytes();
    let start = check_access(bytes.len(), offset, data.len())?;
    bytes[start..start + data.len()].copy_from_slice(data);
    Ok(())
}

/// Copies bytes of `region` starting at `offset` into `data`.
pub(crate) fn read_bytes<T>(region: &T, offset: u64, data: &mut [u8]) -> Result<()>
where
    T: IntoBytes + Immutable,
{
    let bytes = region.as_bytes();
    let start = check_access(bytes.len(), offset, data.len())?;
    data.copy_from_slice(&bytes[start..start + data.len()]);
    Ok(())
}
