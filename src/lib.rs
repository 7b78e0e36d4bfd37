// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mediates a userspace driver's access to one channel-attached I/O subchannel.
//!
//! The driver talks to a [`VfioCcwDevice`] through fixed-layout regions: it writes an ORB and
//! SCSW to the I/O region to start a channel program, or a command tag to the async region to
//! halt or clear the subchannel. Each write runs the device's state machine, which issues the
//! privileged instruction through a [`ChannelIo`] and records the result in the region. When the
//! hardware interrupts, the IRB is captured immediately and handed to a work queue that finishes
//! the request and notifies the driver.

pub mod cio;
mod command;
mod cp;
mod device;
mod error;
mod fsm;
#[cfg(test)]
mod mock;
pub mod region;
mod subchannel;
mod workqueue;

pub use crate::cio::Crw;
pub use crate::cio::Irb;
pub use crate::cio::Orb;
pub use crate::cio::Schib;
pub use crate::cio::Scsw;
pub use crate::cio::SubchannelId;
pub use crate::cp::ChannelProgram;
pub use crate::device::PathEvent;
pub use crate::device::VfioCcwDevice;
pub use crate::device::VfioCcwParameters;
pub use crate::device::Waiter;
pub use crate::error::Errno;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::fsm::State;
pub use crate::region::AsyncCommand;
pub use crate::region::RegionIndex;
pub use crate::subchannel::ChannelIo;
pub use crate::subchannel::ConditionCode;
pub use crate::subchannel::Subchannel;
pub use crate::subchannel::SubchannelState;
