// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-subchannel I/O state machine.
//!
//! Every request and every interrupt is an [`Event`]; [`dispatch`] picks the handler from the
//! current [`State`]. At most one start, halt or clear is in flight at a time: a request is only
//! accepted from `Idle` (or, for halt and clear, from `Busy`), and accepting it moves the machine
//! to `Busy` or `Boxed` before the instruction is issued.

use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::warn;
use sync::Completion;

use crate::cio::FunctionControl;
use crate::cio::Irb;
use crate::cio::Orb;
use crate::cio::Scsw;
use crate::cio::SubchannelId;
use crate::command;
use crate::cp::ProgramSlot;
use crate::region::AsyncCommand;
use crate::subchannel::Subchannel;
use crate::Error;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// The path to the device is gone. Only a new probe leaves this state.
    NotOperational,
    /// Bound, but no session is open.
    Standby,
    /// Ready for a request.
    Idle,
    /// A halt or clear was issued; waiting for its interrupt.
    Boxed,
    /// A channel program was started; waiting for its interrupt.
    Busy,
}

impl Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            State::NotOperational => "not operational",
            State::Standby => "standby",
            State::Idle => "idle",
            State::Boxed => "boxed",
            State::Busy => "busy",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The channel subsystem reports the subchannel gone.
    NotOperational,
    /// The I/O region was written.
    IoRequest { orb: Orb, scsw: Scsw },
    /// The async region was written with a halt command; `command` is the tag as written.
    HaltRequest { command: u32 },
    /// The async region was written with a clear command; `command` is the tag as written.
    ClearRequest { command: u32 },
    /// An I/O interruption arrived for the subchannel.
    Interrupt(Irb),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::NotOperational => "not-operational",
            Event::IoRequest { .. } => "io-request",
            Event::HaltRequest { .. } => "halt-request",
            Event::ClearRequest { .. } => "clear-request",
            Event::Interrupt(_) => "interrupt",
        }
    }
}

/// Device data the state machine reads and writes, guarded by the device lock.
pub(crate) struct Private {
    pub state: State,
    pub program: ProgramSlot,
    /// SCSW of the request being processed.
    pub scsw: Scsw,
    /// Snapshot of the last interrupt, consumed by the deferred completion work.
    pub irb: Irb,
    /// Fired by the next interrupt; cancelled on teardown.
    pub completion: Option<Arc<Completion>>,
}

impl Private {
    pub fn new(state: State, program: ProgramSlot) -> Private {
        Private {
            state,
            program,
            scsw: Scsw::default(),
            irb: Irb::default(),
            completion: None,
        }
    }

    pub fn set_state(&mut self, id: SubchannelId, state: State) {
        if self.state != state {
            debug!("{}: {} -> {}", id, self.state, state);
            self.state = state;
        }
    }

    /// Releases a waiter armed for the next interrupt, which will never come.
    pub fn cancel_completion(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.cancel();
        }
    }
}

/// One dispatch: the subchannel, the device data and the hook that queues completion work.
pub(crate) struct Fsm<'a> {
    pub sch: &'a Subchannel,
    pub private: &'a mut Private,
    pub schedule_io_work: &'a dyn Fn(),
}

impl Fsm<'_> {
    fn set_state(&mut self, state: State) {
        self.private.set_state(self.sch.id(), state);
    }

    fn not_operational(&mut self) -> Result<()> {
        info!("{}: subchannel not operational", self.sch.id());
        self.sch.lock().io.schedule_unregister(self.sch.id());
        self.set_state(State::NotOperational);
        if self.private.program.release() {
            debug!("{}: dropped in-flight channel program", self.sch.id());
        }
        self.private.cancel_completion();
        Ok(())
    }

    fn disabled_irq(&mut self) -> Result<()> {
        warn!(
            "{}: interrupt on a not operational subchannel, disabling",
            self.sch.id()
        );
        if let Err(e) = command::disable(self.sch) {
            error!("{}: failed to disable subchannel: {}", self.sch.id(), e);
        }
        Ok(())
    }

    fn irq(&mut self, irb: &Irb) -> Result<()> {
        self.private.irb = *irb;
        (self.schedule_io_work)();
        if let Some(completion) = self.private.completion.take() {
            completion.complete();
        }
        Ok(())
    }

    fn io_request(&mut self, orb: &Orb, scsw: &Scsw) -> Result<()> {
        self.set_state(State::Boxed);
        self.private.scsw = *scsw;

        let result = self.start_io(orb);
        if let Err(e) = result {
            debug!("{}: io request failed: {}", self.sch.id(), e);
            self.set_state(State::Idle);
        }
        result
    }

    fn start_io(&mut self, orb: &Orb) -> Result<()> {
        let fctl = self.private.scsw.fctl();
        if fctl.contains(FunctionControl::START) {
            // Only command mode channel programs are translated.
            if orb.is_transport_mode() {
                return Err(Error::Unsupported);
            }
            self.private.program.build(self.sch.id(), orb)?;
            let private = &mut *self.private;
            if let Err(e) = command::start(self.sch, &mut private.program, &mut private.state) {
                private.program.release();
                return Err(e);
            }
            debug!("{}: started channel program", self.sch.id());
            Ok(())
        } else if fctl.intersects(FunctionControl::HALT | FunctionControl::CLEAR) {
            // Halt and clear go through the async region.
            Err(Error::Unsupported)
        } else {
            Err(Error::NoFunction)
        }
    }

    fn async_request(&mut self, tag: u32, expected: AsyncCommand) -> Result<()> {
        let prev = self.private.state;
        self.set_state(State::Boxed);

        let result = match AsyncCommand::n(tag) {
            Some(AsyncCommand::Halt) if expected == AsyncCommand::Halt => command::halt(self.sch),
            Some(AsyncCommand::Clear) if expected == AsyncCommand::Clear => {
                command::clear(self.sch)
            }
            _ => {
                error!(
                    "{}: async command {:#x} dispatched as {:?}",
                    self.sch.id(),
                    tag,
                    expected
                );
                Err(Error::CommandMismatch(tag))
            }
        };
        if let Err(e) = result {
            debug!("{}: {:?} failed: {}", self.sch.id(), expected, e);
            self.set_state(prev);
        }
        result
    }
}

fn reject(fsm: &Fsm, event: &Event, error: Error) -> Result<()> {
    debug!(
        "{}: rejecting {} in state {}: {}",
        fsm.sch.id(),
        event.name(),
        fsm.private.state,
        error
    );
    Err(error)
}

/// Feeds `event` to the state machine.
///
/// Returns the result to report in the region that carried the request; for the
/// not-operational and interrupt events the result is always `Ok`.
pub(crate) fn dispatch(fsm: &mut Fsm, event: Event) -> Result<()> {
    use self::Event as E;
    use self::State as S;

    match (fsm.private.state, &event) {
        (S::NotOperational, E::NotOperational) => Ok(()),
        (S::NotOperational, E::IoRequest { .. }) => reject(fsm, &event, Error::InvalidState),
        (S::NotOperational, E::HaltRequest { .. }) => reject(fsm, &event, Error::InvalidState),
        (S::NotOperational, E::ClearRequest { .. }) => reject(fsm, &event, Error::InvalidState),
        (S::NotOperational, E::Interrupt(_)) => fsm.disabled_irq(),

        (S::Standby, E::NotOperational) => fsm.not_operational(),
        (S::Standby, E::IoRequest { .. }) => reject(fsm, &event, Error::InvalidState),
        (S::Standby, E::HaltRequest { .. }) => reject(fsm, &event, Error::InvalidState),
        (S::Standby, E::ClearRequest { .. }) => reject(fsm, &event, Error::InvalidState),
        (S::Standby, E::Interrupt(irb)) => fsm.irq(irb),

        (S::Idle, E::NotOperational) => fsm.not_operational(),
        (S::Idle, E::IoRequest { orb, scsw }) => fsm.io_request(orb, scsw),
        (S::Idle, E::HaltRequest { command }) => fsm.async_request(*command, AsyncCommand::Halt),
        (S::Idle, E::ClearRequest { command }) => fsm.async_request(*command, AsyncCommand::Clear),
        (S::Idle, E::Interrupt(irb)) => fsm.irq(irb),

        (S::Boxed, E::NotOperational) => fsm.not_operational(),
        (S::Boxed, E::IoRequest { .. }) => reject(fsm, &event, Error::Busy),
        (S::Boxed, E::HaltRequest { .. }) => reject(fsm, &event, Error::Busy),
        (S::Boxed, E::ClearRequest { .. }) => reject(fsm, &event, Error::Busy),
        (S::Boxed, E::Interrupt(irb)) => fsm.irq(irb),

        (S::Busy, E::NotOperational) => fsm.not_operational(),
        (S::Busy, E::IoRequest { .. }) => reject(fsm, &event, Error::Busy),
        (S::Busy, E::HaltRequest { command }) => fsm.async_request(*command, AsyncCommand::Halt),
        (S::Busy, E::ClearRequest { command }) => fsm.async_request(*command, AsyncCommand::Clear),
        (S::Busy, E::Interrupt(irb)) => fsm.irq(irb),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::cio::ActivityControl;
    use crate::cio::StatusControl;
    use crate::error::Errno;
    use crate::mock::MockChannelIo;
    use crate::mock::MockChannelProgram;
    use crate::mock::SharedCp;
    use crate::mock::SharedHw;

    const ALL_STATES: [State; 5] = [
        State::NotOperational,
        State::Standby,
        State::Idle,
        State::Boxed,
        State::Busy,
    ];

    struct Harness {
        sch: Subchannel,
        private: Private,
        hw: SharedHw,
        cp: SharedCp,
        scheduled: Cell<u32>,
    }

    impl Harness {
        fn new(state: State) -> Harness {
            let (io, hw) = MockChannelIo::new();
            let (program, cp) = MockChannelProgram::new();
            Harness {
                sch: Subchannel::new(SubchannelId::new(0, 0, 0x10), Box::new(io), 0xff),
                private: Private::new(state, ProgramSlot::new(Box::new(program))),
                hw,
                cp,
                scheduled: Cell::new(0),
            }
        }

        fn fire(&mut self, event: Event) -> Result<()> {
            let scheduled = &self.scheduled;
            let schedule = || scheduled.set(scheduled.get() + 1);
            let mut fsm = Fsm {
                sch: &self.sch,
                private: &mut self.private,
                schedule_io_work: &schedule,
            };
            dispatch(&mut fsm, event)
        }

        fn state(&self) -> State {
            self.private.state
        }

        fn instructions(&self) -> u32 {
            let hw = self.hw.lock();
            hw.starts + hw.halts + hw.clears
        }
    }

    fn start_request() -> Event {
        Event::IoRequest {
            orb: Orb::default(),
            scsw: Scsw::new(
                FunctionControl::START,
                ActivityControl::empty(),
                StatusControl::empty(),
            ),
        }
    }

    fn halt_request() -> Event {
        Event::HaltRequest {
            command: AsyncCommand::Halt as u32,
        }
    }

    fn clear_request() -> Event {
        Event::ClearRequest {
            command: AsyncCommand::Clear as u32,
        }
    }

    fn interrupt() -> Event {
        Event::Interrupt(Irb::new(Scsw::new(
            FunctionControl::START,
            ActivityControl::empty(),
            StatusControl::PRIMARY | StatusControl::SECONDARY | StatusControl::STATUS_PENDING,
        )))
    }

    #[test]
    fn not_operational_event() {
        for state in ALL_STATES {
            let mut h = Harness::new(state);
            assert_eq!(h.fire(Event::NotOperational), Ok(()));
            assert_eq!(h.state(), State::NotOperational);
            let expected = if state == State::NotOperational { 0 } else { 1 };
            assert_eq!(h.hw.lock().unregisters, expected, "from {}", state);
            assert_eq!(h.instructions(), 0);
        }
    }

    #[test]
    fn io_request_event() {
        let expected = [
            (State::NotOperational, Err(Error::InvalidState), State::NotOperational),
            (State::Standby, Err(Error::InvalidState), State::Standby),
            (State::Idle, Ok(()), State::Busy),
            (State::Boxed, Err(Error::Busy), State::Boxed),
            (State::Busy, Err(Error::Busy), State::Busy),
        ];
        for (state, result, next) in expected {
            let mut h = Harness::new(state);
            assert_eq!(h.fire(start_request()), result, "from {}", state);
            assert_eq!(h.state(), next, "from {}", state);
            let starts = if result.is_ok() { 1 } else { 0 };
            assert_eq!(h.hw.lock().starts, starts);
        }
    }

    #[test]
    fn halt_request_event() {
        let expected = [
            (State::NotOperational, Err(Error::InvalidState), State::NotOperational),
            (State::Standby, Err(Error::InvalidState), State::Standby),
            (State::Idle, Ok(()), State::Boxed),
            (State::Boxed, Err(Error::Busy), State::Boxed),
            (State::Busy, Ok(()), State::Boxed),
        ];
        for (state, result, next) in expected {
            let mut h = Harness::new(state);
            assert_eq!(h.fire(halt_request()), result, "from {}", state);
            assert_eq!(h.state(), next, "from {}", state);
            let halts = if result.is_ok() { 1 } else { 0 };
            assert_eq!(h.hw.lock().halts, halts);
        }
    }

    #[test]
    fn clear_request_event() {
        let expected = [
            (State::NotOperational, Err(Error::InvalidState), State::NotOperational),
            (State::Standby, Err(Error::InvalidState), State::Standby),
            (State::Idle, Ok(()), State::Boxed),
            (State::Boxed, Err(Error::Busy), State::Boxed),
            (State::Busy, Ok(()), State::Boxed),
        ];
        for (state, result, next) in expected {
            let mut h = Harness::new(state);
            assert_eq!(h.fire(clear_request()), result, "from {}", state);
            assert_eq!(h.state(), next, "from {}", state);
            let clears = if result.is_ok() { 1 } else { 0 };
            assert_eq!(h.hw.lock().clears, clears);
        }
    }

    #[test]
    fn interrupt_event() {
        for state in ALL_STATES {
            let mut h = Harness::new(state);
            let completion = Arc::new(Completion::new());
            h.private.completion = Some(completion.clone());

            assert_eq!(h.fire(interrupt()), Ok(()));
            assert_eq!(h.state(), state);
            if state == State::NotOperational {
                assert_eq!(h.scheduled.get(), 0);
                assert_eq!(h.hw.lock().disables, 1);
                assert_eq!(h.private.irb, Irb::default());
                assert!(completion.cancel());
            } else {
                assert_eq!(h.scheduled.get(), 1);
                assert_eq!(h.hw.lock().disables, 0);
                assert_eq!(Event::Interrupt(h.private.irb), interrupt());
                assert!(h.private.completion.is_none());
                assert!(!completion.cancel());
            }
        }
    }

    #[test]
    fn transport_mode_rejected() {
        let mut h = Harness::new(State::Idle);
        let mut orb = Orb::default();
        orb.0[5] = 0x04;
        assert!(orb.is_transport_mode());
        let event = Event::IoRequest {
            orb,
            scsw: Scsw::new(
                FunctionControl::START,
                ActivityControl::empty(),
                StatusControl::empty(),
            ),
        };
        assert_eq!(h.fire(event), Err(Error::Unsupported));
        assert_eq!(h.state(), State::Idle);
        assert_eq!(h.cp.lock().inits, 0);
        assert_eq!(h.instructions(), 0);
    }

    #[test]
    fn halt_and_clear_via_io_region_rejected() {
        for fctl in [FunctionControl::HALT, FunctionControl::CLEAR] {
            let mut h = Harness::new(State::Idle);
            let event = Event::IoRequest {
                orb: Orb::default(),
                scsw: Scsw::new(fctl, ActivityControl::empty(), StatusControl::empty()),
            };
            assert_eq!(h.fire(event), Err(Error::Unsupported));
            assert_eq!(h.state(), State::Idle);
            assert_eq!(h.instructions(), 0);
        }
    }

    #[test]
    fn no_function_rejected() {
        let mut h = Harness::new(State::Idle);
        let event = Event::IoRequest {
            orb: Orb::default(),
            scsw: Scsw::default(),
        };
        assert_eq!(h.fire(event), Err(Error::NoFunction));
        assert_eq!(h.state(), State::Idle);
    }

    #[test]
    fn build_failures_return_to_idle() {
        let mut h = Harness::new(State::Idle);
        h.cp.lock().init_result = Err(Errno(libc::EINVAL));
        assert_eq!(
            h.fire(start_request()),
            Err(Error::ChannelProgram(Errno(libc::EINVAL)))
        );
        assert_eq!(h.state(), State::Idle);
        assert_eq!(h.cp.lock().frees, 0);

        {
            let mut cp = h.cp.lock();
            cp.init_result = Ok(());
            cp.prefetch_result = Err(Errno(libc::EFAULT));
        }
        assert_eq!(
            h.fire(start_request()),
            Err(Error::ChannelProgram(Errno(libc::EFAULT)))
        );
        assert_eq!(h.state(), State::Idle);
        assert_eq!(h.cp.lock().frees, 1);
        assert_eq!(h.instructions(), 0);
    }

    #[test]
    fn start_failure_frees_program() {
        let mut h = Harness::new(State::Idle);
        h.hw.lock().start_cc = 2;
        assert_eq!(h.fire(start_request()), Err(Error::Busy));
        assert_eq!(h.state(), State::Idle);
        assert!(!h.private.program.is_active());
        let cp = h.cp.lock();
        assert_eq!(cp.inits, 1);
        assert_eq!(cp.frees, 1);
    }

    #[test]
    fn accepted_start_holds_program() {
        let mut h = Harness::new(State::Idle);
        assert_eq!(h.fire(start_request()), Ok(()));
        assert!(h.private.program.is_active());
        assert_eq!(h.cp.lock().frees, 0);

        // Teardown drops it.
        h.fire(Event::NotOperational).unwrap();
        assert!(!h.private.program.is_active());
        assert_eq!(h.cp.lock().frees, 1);
    }

    #[test]
    fn busy_rejection_keeps_snapshots() {
        let mut h = Harness::new(State::Idle);
        h.fire(start_request()).unwrap();
        h.fire(interrupt()).unwrap();
        let scsw = h.private.scsw;
        let irb = h.private.irb;

        for _ in 0..3 {
            let event = Event::IoRequest {
                orb: Orb::default(),
                scsw: Scsw::new(
                    FunctionControl::START,
                    ActivityControl::START_PENDING,
                    StatusControl::ALERT,
                ),
            };
            assert_eq!(h.fire(event), Err(Error::Busy));
        }
        assert_eq!(h.private.scsw, scsw);
        assert_eq!(h.private.irb, irb);
        assert_eq!(h.hw.lock().starts, 1);
    }

    #[test]
    fn async_tag_mismatch() {
        for state in [State::Idle, State::Busy] {
            let mut h = Harness::new(state);
            let event = Event::HaltRequest {
                command: AsyncCommand::Clear as u32,
            };
            assert_eq!(h.fire(event), Err(Error::CommandMismatch(2)));
            let event = Event::ClearRequest {
                command: AsyncCommand::Halt as u32,
            };
            assert_eq!(h.fire(event), Err(Error::CommandMismatch(1)));
            assert_eq!(h.state(), state);
            assert_eq!(h.instructions(), 0);
        }
    }

    #[test]
    fn halt_busy_restores_state() {
        let mut h = Harness::new(State::Busy);
        h.hw.lock().halt_cc = 2;
        assert_eq!(h.fire(halt_request()), Err(Error::Busy));
        assert_eq!(h.state(), State::Busy);
    }

    #[test]
    fn teardown_cancels_waiter() {
        let mut h = Harness::new(State::Busy);
        let completion = Arc::new(Completion::new());
        h.private.completion = Some(completion.clone());
        h.fire(Event::NotOperational).unwrap();
        assert_eq!(completion.wait(None), sync::WaitResult::Cancelled);
    }
}
