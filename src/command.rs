// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Issues the privileged instructions and folds their condition codes into [`Error`]s.
//!
//! Every helper takes the subchannel lock for the duration of the instruction and the
//! bookkeeping that depends on its outcome.

use log::debug;
use log::error;
use log::warn;

use crate::cio::ActivityControl;
use crate::cio::Schib;
use crate::cp::ProgramSlot;
use crate::fsm::State;
use crate::subchannel::ConditionCode;
use crate::subchannel::Subchannel;
use crate::subchannel::SubchannelState;
use crate::Error;
use crate::Result;

/// How many halt and clear attempts `cancel_halt_clear` makes before escalating or giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBudget {
    pub halt: u32,
    pub clear: u32,
}

fn condition_code(sch: &Subchannel, instruction: &str, cc: u8) -> Result<ConditionCode> {
    ConditionCode::n(cc).ok_or_else(|| {
        error!(
            "{}: {} returned unexpected condition code {}",
            sch.id(),
            instruction,
            cc
        );
        Error::ConditionCode(cc)
    })
}

/// Refreshes the stored SCHIB. Fails with `NoDevice` when the subchannel is gone.
fn update_schib(sch: &Subchannel, state: &mut SubchannelState) -> Result<Schib> {
    match state.io.store(sch.id()) {
        Some(schib) => {
            state.schib = schib;
            Ok(schib)
        }
        None => Err(Error::NoDevice),
    }
}

/// Stores the current SCHIB.
pub fn store(sch: &Subchannel) -> Result<Schib> {
    let mut state = sch.lock();
    update_schib(sch, &mut state)
}

/// Starts the channel program held in `program`.
///
/// `device_state` is set to `Busy` before the instruction is issued so that an interrupt racing
/// the return path finds the right state; on failure the caller restores it.
pub fn start(sch: &Subchannel, program: &mut ProgramSlot, device_state: &mut State) -> Result<()> {
    let mut state = sch.lock();
    let orb = program
        .get_orb(sch.intparm(), state.lpm)
        .ok_or(Error::NoOrb)?;

    *device_state = State::Busy;
    let cc = state.io.start(sch.id(), &orb);
    match condition_code(sch, "ssch", cc)? {
        ConditionCode::Accepted => {
            let pending = state.pending() | ActivityControl::START_PENDING;
            state.set_pending(pending);
            Ok(())
        }
        ConditionCode::StatusPending | ConditionCode::Busy => Err(Error::Busy),
        ConditionCode::NotOperational => {
            let lpm = orb.lpm();
            state.lpm = if lpm != 0 { state.lpm & !lpm } else { 0 };
            debug!("{}: ssch cc 3, paths {:#04x} remain", sch.id(), state.lpm);
            if update_schib(sch, &mut state).is_err() || state.lpm == 0 {
                state.usable = false;
                Err(Error::NoDevice)
            } else {
                Err(Error::NoPath)
            }
        }
    }
}

fn halt_locked(sch: &Subchannel, state: &mut SubchannelState) -> Result<()> {
    let cc = state.io.halt(sch.id());
    match condition_code(sch, "hsch", cc)? {
        ConditionCode::Accepted => {
            let pending = state.pending() | ActivityControl::HALT_PENDING;
            state.set_pending(pending);
            Ok(())
        }
        ConditionCode::StatusPending | ConditionCode::Busy => Err(Error::Busy),
        ConditionCode::NotOperational => Err(Error::NoDevice),
    }
}

/// Issues halt subchannel.
pub fn halt(sch: &Subchannel) -> Result<()> {
    let mut state = sch.lock();
    halt_locked(sch, &mut state)
}

fn clear_locked(sch: &Subchannel, state: &mut SubchannelState) -> Result<()> {
    let cc = state.io.clear(sch.id());
    match condition_code(sch, "csch", cc)? {
        ConditionCode::Accepted => {
            // A clear supersedes any other pending function.
            state.set_pending(ActivityControl::CLEAR_PENDING);
            Ok(())
        }
        ConditionCode::StatusPending | ConditionCode::Busy => Err(Error::Busy),
        ConditionCode::NotOperational => Err(Error::NoDevice),
    }
}

/// Issues clear subchannel.
pub fn clear(sch: &Subchannel) -> Result<()> {
    let mut state = sch.lock();
    clear_locked(sch, &mut state)
}

fn modify(sch: &Subchannel, enable: bool) -> Result<()> {
    let mut state = sch.lock();
    let cc = state.io.modify(sch.id(), enable, sch.intparm());
    match condition_code(sch, "msch", cc)? {
        ConditionCode::Accepted => {
            state.enabled = enable;
            Ok(())
        }
        ConditionCode::StatusPending | ConditionCode::Busy => Err(Error::Busy),
        ConditionCode::NotOperational => Err(Error::NoDevice),
    }
}

/// Enables the subchannel for I/O interruptions.
pub fn enable(sch: &Subchannel) -> Result<()> {
    modify(sch, true)
}

/// Disables the subchannel. Fails with `Busy` while a function is still in progress.
pub fn disable(sch: &Subchannel) -> Result<()> {
    modify(sch, false)
}

/// Issues cancel subchannel. `Ok(false)` means there was nothing cancelable.
fn cancel_locked(sch: &Subchannel, state: &mut SubchannelState) -> Result<bool> {
    let cc = state.io.cancel(sch.id());
    match condition_code(sch, "xsch", cc)? {
        ConditionCode::Accepted => Ok(true),
        ConditionCode::StatusPending => Err(Error::Busy),
        ConditionCode::Busy => Ok(false),
        ConditionCode::NotOperational => Err(Error::NoDevice),
    }
}

/// Makes one step of terminating whatever the subchannel is doing: cancel, then halt, then clear.
///
/// `retries` carries the remaining attempts of the current stage across calls. Callers start it
/// at `budget.clear`, which is what applies when a clear is already pending; entering the halt
/// stage resets it to `budget.halt` and entering the clear stage to `budget.clear`.
///
/// `Err(Busy)` means a halt or clear was issued (or status is pending) and the interrupt should
/// be waited for; `Ok(())` means the start function was cancelled outright. `Err(InvalidState)`
/// means all attempts are exhausted.
pub fn cancel_halt_clear(sch: &Subchannel, retries: &mut u32, budget: RetryBudget) -> Result<()> {
    let mut state = sch.lock();
    update_schib(sch, &mut state)?;
    let pending = state.pending();

    if !pending.intersects(ActivityControl::HALT_PENDING | ActivityControl::CLEAR_PENDING) {
        if cancel_locked(sch, &mut state)? {
            return Ok(());
        }
        *retries = budget.halt;
    }

    if !pending.contains(ActivityControl::CLEAR_PENDING) {
        if *retries > 0 {
            *retries -= 1;
            match halt_locked(sch, &mut state) {
                Err(Error::Busy) => {}
                Ok(()) => return Err(Error::Busy),
                Err(e) => return Err(e),
            }
        }
        warn!("{}: halt unsuccessful, trying clear", sch.id());
        *retries = budget.clear;
    }

    if *retries > 0 {
        *retries -= 1;
        return match clear_locked(sch, &mut state) {
            Ok(()) => Err(Error::Busy),
            Err(e) => Err(e),
        };
    }
    error!("{}: could not terminate the current function", sch.id());
    Err(Error::InvalidState)
}
