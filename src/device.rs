// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-subchannel device context handed to the userspace driver.
//!
//! Lock order: regions, then the device data, then the subchannel. The completion work takes the
//! device data and the regions one after the other, never both at once.

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use log::debug;
use log::error;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use sync::Completion;
use sync::Mutex;
use sync::WaitResult;

use crate::cio::Crw;
use crate::cio::Irb;
use crate::cio::SubchannelId;
use crate::cio::CRW_ERC_INIT;
use crate::cio::CRW_ERC_PERRN;
use crate::cio::CRW_RSC_CPATH;
use crate::command;
use crate::command::RetryBudget;
use crate::cp::ChannelProgram;
use crate::cp::ProgramSlot;
use crate::error::ret_code;
use crate::fsm;
use crate::fsm::Event;
use crate::fsm::Fsm;
use crate::fsm::Private;
use crate::fsm::State;
use crate::region;
use crate::region::AsyncCommand;
use crate::region::RegionIndex;
use crate::region::Regions;
use crate::subchannel::Subchannel;
use crate::workqueue::WorkQueue;
use crate::Error;
use crate::Result;

fn vfio_ccw_parameters_default_quiesce_timeout_ms() -> u64 {
    3000
}

fn vfio_ccw_parameters_default_halt_retries() -> u32 {
    3
}

fn vfio_ccw_parameters_default_clear_retries() -> u32 {
    255
}

fn vfio_ccw_parameters_default_worker_name() -> String {
    "vfio_ccw_io".to_owned()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VfioCcwParameters {
    pub subchannel: SubchannelId,
    /// How long quiesce waits for the interrupt of a halt or clear.
    #[serde(default = "vfio_ccw_parameters_default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
    /// Halt attempts quiesce makes before escalating to clear.
    #[serde(default = "vfio_ccw_parameters_default_halt_retries")]
    pub halt_retries: u32,
    /// Clear attempts quiesce makes before giving up on the subchannel.
    #[serde(default = "vfio_ccw_parameters_default_clear_retries")]
    pub clear_retries: u32,
    /// Name of the thread running completion work.
    #[serde(default = "vfio_ccw_parameters_default_worker_name")]
    pub worker_name: String,
}

impl VfioCcwParameters {
    pub fn new(subchannel: SubchannelId) -> VfioCcwParameters {
        VfioCcwParameters {
            subchannel,
            quiesce_timeout_ms: vfio_ccw_parameters_default_quiesce_timeout_ms(),
            halt_retries: vfio_ccw_parameters_default_halt_retries(),
            clear_retries: vfio_ccw_parameters_default_clear_retries(),
            worker_name: vfio_ccw_parameters_default_worker_name(),
        }
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    fn retry_budget(&self) -> RetryBudget {
        RetryBudget {
            halt: self.halt_retries,
            clear: self.clear_retries,
        }
    }
}

/// Channel path events reported by the channel subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathEvent {
    VaryOff,
    VaryOn,
    Offline,
    Online,
}

/// A caller blocked until the next interrupt is processed.
pub struct Waiter {
    completion: Arc<Completion>,
}

impl Waiter {
    /// Waits for the interrupt. `None` waits forever.
    ///
    /// Fails with `Cancelled` if the device is torn down first and with `TimedOut` if `timeout`
    /// elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        match self.completion.wait(timeout) {
            WaitResult::Completed => Ok(()),
            WaitResult::Cancelled => Err(Error::Cancelled),
            WaitResult::TimedOut => Err(Error::TimedOut),
        }
    }
}

#[derive(Default)]
struct CrwQueue {
    pending: VecDeque<Crw>,
    trigger: Option<Sender<()>>,
}

impl CrwQueue {
    fn signal(&mut self) {
        if let Some(trigger) = &self.trigger {
            if trigger.send(()).is_err() {
                debug!("crw trigger receiver gone");
                self.trigger = None;
            }
        }
    }
}

struct Inner {
    sch: Arc<Subchannel>,
    params: VfioCcwParameters,
    private: Mutex<Private>,
    regions: Mutex<Regions>,
    crw: Mutex<CrwQueue>,
    io_trigger: Mutex<Option<Sender<Irb>>>,
}

impl Inner {
    /// Deferred half of interrupt handling.
    fn io_todo(&self) {
        let id = self.sch.id();
        let irb = {
            let mut private = self.private.lock();
            let mut irb = private.irb;
            let is_final = irb.scsw.is_final();
            let solicited = irb.scsw.is_solicited();
            if solicited {
                private.program.update_scsw(&mut irb.scsw);
            }
            // The program must be gone before the device is Idle again, whatever ended it.
            let to_idle = is_final && matches!(private.state, State::Busy | State::Boxed);
            if ((is_final && solicited) || to_idle) && private.program.release() {
                debug!("{}: channel program finished", id);
            }
            if to_idle {
                private.set_state(id, State::Idle);
            }
            irb
        };

        self.regions.lock().io.irb_area = irb;

        let mut trigger = self.io_trigger.lock();
        if let Some(sender) = trigger.as_ref() {
            if sender.send(irb).is_err() {
                debug!("{}: io trigger receiver gone", id);
                *trigger = None;
            }
        }
    }
}

/// A vfio-ccw device: one subchannel passed through to a userspace driver.
pub struct VfioCcwDevice {
    // Dropped before `inner` so pending completion work still runs.
    queue: WorkQueue,
    inner: Arc<Inner>,
}

impl VfioCcwDevice {
    /// Binds a device to `sch`, using `program` to translate channel programs.
    ///
    /// The subchannel is enabled and the device starts out in `Standby`; if enabling fails it
    /// starts out `NotOperational`.
    pub fn new(
        sch: Arc<Subchannel>,
        program: Box<dyn ChannelProgram>,
        params: VfioCcwParameters,
    ) -> anyhow::Result<VfioCcwDevice> {
        if params.subchannel != sch.id() {
            bail!(
                "parameters name subchannel {} but the device is bound to {}",
                params.subchannel,
                sch.id()
            );
        }

        let state = match command::enable(&sch) {
            Ok(()) => State::Standby,
            Err(e) => {
                warn!("{}: failed to enable subchannel: {}", sch.id(), e);
                State::NotOperational
            }
        };

        let inner = Arc::new(Inner {
            sch,
            private: Mutex::new(Private::new(state, ProgramSlot::new(program))),
            regions: Mutex::new(Regions::default()),
            crw: Mutex::new(CrwQueue::default()),
            io_trigger: Mutex::new(None),
            params,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let queue = WorkQueue::start(inner.params.worker_name.clone(), move || {
            if let Some(inner) = weak.upgrade() {
                inner.io_todo();
            }
        })
        .context("failed to spawn completion worker")?;

        info!("{}: vfio-ccw device created ({})", inner.sch.id(), state);
        Ok(VfioCcwDevice { queue, inner })
    }

    pub fn id(&self) -> SubchannelId {
        self.inner.sch.id()
    }

    pub fn subchannel(&self) -> &Arc<Subchannel> {
        &self.inner.sch
    }

    pub fn params(&self) -> &VfioCcwParameters {
        &self.inner.params
    }

    pub fn state(&self) -> State {
        self.inner.private.lock().state
    }

    fn dispatch(&self, event: Event) -> Result<()> {
        let mut private = self.inner.private.lock();
        let schedule = || {
            self.queue.queue();
        };
        let mut fsm = Fsm {
            sch: &self.inner.sch,
            private: &mut *private,
            schedule_io_work: &schedule,
        };
        fsm::dispatch(&mut fsm, event)
    }

    fn set_state(&self, state: State) {
        self.inner.private.lock().set_state(self.id(), state);
    }

    /// Reports the subchannel gone.
    pub fn not_operational(&self) {
        let _ = self.dispatch(Event::NotOperational);
    }

    /// Delivers an I/O interruption for the subchannel.
    pub fn interrupt(&self, irb: &Irb) {
        let _ = self.dispatch(Event::Interrupt(*irb));
    }

    /// Starts a session: `Standby` to `Idle`.
    pub fn open(&self) -> Result<()> {
        let mut private = self.inner.private.lock();
        if private.state != State::Standby {
            debug!("{}: open in state {}", self.id(), private.state);
            return Err(Error::InvalidState);
        }
        private.set_state(self.id(), State::Idle);
        Ok(())
    }

    /// Ends the session: quiesces the subchannel and returns to `Standby`.
    ///
    /// A device without an open session (`Standby` or `NotOperational`) keeps its state and only
    /// drops the channel program it may hold.
    pub fn close(&self) -> Result<()> {
        {
            let mut private = self.inner.private.lock();
            if matches!(private.state, State::Standby | State::NotOperational) {
                if private.program.release() {
                    debug!("{}: dropped channel program on close", self.id());
                }
                return Ok(());
            }
        }
        self.quiesce()?;
        self.enable_into(State::Standby)
    }

    /// Quiesces the subchannel and makes it ready for new requests.
    pub fn reset(&self) -> Result<()> {
        self.quiesce()?;
        self.enable_into(State::Idle)
    }

    fn enable_into(&self, state: State) -> Result<()> {
        command::enable(&self.inner.sch)?;
        self.set_state(state);
        Ok(())
    }

    /// Terminates any function in progress and disables the subchannel.
    ///
    /// The device always ends up `NotOperational` with no channel program held, even when the
    /// function could not be terminated.
    pub fn quiesce(&self) -> Result<()> {
        let result = match command::disable(&self.inner.sch) {
            Err(Error::Busy) => self.terminate_io(),
            result => result,
        };
        if let Err(e) = result {
            error!("{}: failed to quiesce subchannel: {}", self.id(), e);
        }

        let mut private = self.inner.private.lock();
        if private.program.release() {
            debug!("{}: dropped channel program on quiesce", self.id());
        }
        private.cancel_completion();
        private.set_state(self.id(), State::NotOperational);
        result
    }

    fn terminate_io(&self) -> Result<()> {
        let sch = &self.inner.sch;
        let timeout = self.inner.params.quiesce_timeout();
        let budget = self.inner.params.retry_budget();
        let mut retries = budget.clear;
        loop {
            // Armed before the instruction so its interrupt cannot be missed.
            let waiter = self.arm_completion();
            match command::cancel_halt_clear(sch, &mut retries, budget) {
                Ok(()) => {}
                Err(Error::Busy) => {
                    if let Err(Error::TimedOut) = waiter.wait(Some(timeout)) {
                        warn!(
                            "{}: no interrupt within {:?} while quiescing",
                            sch.id(),
                            timeout
                        );
                    }
                }
                Err(e) => return Err(e),
            }
            self.queue.flush();
            match command::disable(sch) {
                Err(Error::Busy) => continue,
                result => return result,
            }
        }
    }

    /// Arms a waiter released by the next interrupt. A waiter already armed is shared.
    pub fn arm_completion(&self) -> Waiter {
        let mut private = self.inner.private.lock();
        let completion = private
            .completion
            .get_or_insert_with(|| Arc::new(Completion::new()))
            .clone();
        Waiter { completion }
    }

    /// Waits until all queued completion work has run.
    pub fn flush(&self) {
        self.queue.flush();
    }

    /// Registers the channel that receives each processed IRB.
    pub fn set_io_trigger(&self, trigger: Option<Sender<Irb>>) {
        *self.inner.io_trigger.lock() = trigger;
    }

    /// Registers the channel signalled when a channel report word is queued.
    pub fn set_crw_trigger(&self, trigger: Option<Sender<()>>) {
        let mut crw = self.inner.crw.lock();
        crw.trigger = trigger;
        if !crw.pending.is_empty() {
            crw.signal();
        }
    }

    /// Queues a channel report word for the driver and signals the CRW trigger.
    pub fn queue_crw(&self, rsc: u8, erc: u8, rsid: u16) {
        let crw = Crw::new(rsc, erc, rsid);
        debug!("{}: queueing crw {:#010x}", self.id(), crw.0);
        let mut queue = self.inner.crw.lock();
        queue.pending.push_back(crw);
        queue.signal();
    }

    /// Applies a channel path event to the subchannel's path masks and reports it with a CRW.
    pub fn channel_path_event(&self, chpid: u8, mask: u8, event: PathEvent) -> Result<()> {
        if mask == 0 {
            return Ok(());
        }
        debug!(
            "{}: chp {:02x} event {:?} mask {:#04x}",
            self.id(),
            chpid,
            event,
            mask
        );
        command::store(&self.inner.sch)?;

        let erc = {
            let mut state = self.inner.sch.lock();
            match event {
                PathEvent::VaryOff => {
                    state.opm &= !mask;
                    state.lpm &= !mask;
                    CRW_ERC_PERRN
                }
                PathEvent::VaryOn => {
                    state.opm |= mask;
                    state.lpm |= mask;
                    CRW_ERC_INIT
                }
                PathEvent::Offline => {
                    state.lpm &= !mask;
                    CRW_ERC_PERRN
                }
                PathEvent::Online => {
                    state.lpm |= mask & state.opm;
                    CRW_ERC_INIT
                }
            }
        };
        self.queue_crw(CRW_RSC_CPATH, erc, chpid as u16);
        Ok(())
    }

    /// Handles an unmap of guest memory at `iova`.
    ///
    /// Returns true if the held channel program had that page pinned and the device was reset.
    pub fn notify_dma_unmap(&self, iova: u64) -> Result<bool> {
        if !self.inner.private.lock().program.iova_pinned(iova) {
            return Ok(false);
        }
        info!(
            "{}: pinned page {:#x} unmapped, resetting",
            self.id(),
            iova
        );
        self.reset()?;
        Ok(true)
    }

    /// Writes the I/O region, issuing the request it describes.
    ///
    /// Returns the number of bytes written, or the error also stored in the region's `ret_code`.
    pub fn write_io_region(&self, offset: u64, data: &[u8]) -> Result<usize> {
        region::check_access(RegionIndex::Io.size(), offset, data.len())?;
        let mut regions = self
            .inner
            .regions
            .try_lock()
            .map_err(|_| Error::RegionBusy)?;
        region::write_bytes(&mut regions.io, offset, data)?;

        let event = Event::IoRequest {
            orb: regions.io.orb_area,
            scsw: regions.io.scsw_area,
        };
        let result = self.dispatch(event);
        regions.io.ret_code = ret_code(result) as u32;
        result.map(|()| data.len())
    }

    pub fn read_io_region(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        region::check_access(RegionIndex::Io.size(), offset, data.len())?;
        let regions = self.inner.regions.lock();
        region::read_bytes(&regions.io, offset, data)?;
        Ok(data.len())
    }

    /// Writes the async command region, issuing the halt or clear it names.
    pub fn write_async_region(&self, offset: u64, data: &[u8]) -> Result<usize> {
        region::check_access(RegionIndex::Async.size(), offset, data.len())?;
        let mut regions = self
            .inner
            .regions
            .try_lock()
            .map_err(|_| Error::RegionBusy)?;
        region::write_bytes(&mut regions.cmd, offset, data)?;

        let command = regions.cmd.command;
        let result = match AsyncCommand::n(command) {
            Some(AsyncCommand::Halt) => self.dispatch(Event::HaltRequest { command }),
            Some(AsyncCommand::Clear) => self.dispatch(Event::ClearRequest { command }),
            None => {
                warn!("{}: unknown async command {:#x}", self.id(), command);
                Err(Error::CommandMismatch(command))
            }
        };
        regions.cmd.ret_code = ret_code(result) as u32;
        result.map(|()| data.len())
    }

    pub fn read_async_region(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        region::check_access(RegionIndex::Async.size(), offset, data.len())?;
        let regions = self.inner.regions.lock();
        region::read_bytes(&regions.cmd, offset, data)?;
        Ok(data.len())
    }

    /// Reads the SCHIB region after refreshing it with store subchannel.
    pub fn read_schib_region(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        region::check_access(RegionIndex::Schib.size(), offset, data.len())?;
        let mut regions = self.inner.regions.lock();
        regions.schib.schib_area = command::store(&self.inner.sch)?;
        region::read_bytes(&regions.schib, offset, data)?;
        Ok(data.len())
    }

    /// Reads the CRW region, consuming the oldest queued channel report word.
    pub fn read_crw_region(&self, offset: u64, data: &mut [u8]) -> Result<usize> {
        region::check_access(RegionIndex::Crw.size(), offset, data.len())?;
        let crw = self.inner.crw.lock().pending.pop_front();

        {
            let mut regions = self.inner.regions.lock();
            if let Some(crw) = crw {
                regions.crw.crw = crw.0.to_be_bytes();
            }
            let result = region::read_bytes(&regions.crw, offset, data);
            regions.crw.crw = [0; 4];
            result?;
        }

        let mut queue = self.inner.crw.lock();
        if !queue.pending.is_empty() {
            queue.signal();
        }
        Ok(data.len())
    }

    /// Reads region `index`.
    pub fn read_region(&self, index: RegionIndex, offset: u64, data: &mut [u8]) -> Result<usize> {
        match index {
            RegionIndex::Io => self.read_io_region(offset, data),
            RegionIndex::Async => self.read_async_region(offset, data),
            RegionIndex::Schib => self.read_schib_region(offset, data),
            RegionIndex::Crw => self.read_crw_region(offset, data),
        }
    }

    /// Writes region `index`. Only the I/O and async regions are writable.
    pub fn write_region(&self, index: RegionIndex, offset: u64, data: &[u8]) -> Result<usize> {
        if !index.is_writable() {
            return Err(Error::InvalidAccess {
                offset,
                len: data.len(),
            });
        }
        match index {
            RegionIndex::Async => self.write_async_region(offset, data),
            _ => self.write_io_region(offset, data),
        }
    }
}

impl Drop for VfioCcwDevice {
    fn drop(&mut self) {
        self.inner.private.lock().cancel_completion();
    }
}
