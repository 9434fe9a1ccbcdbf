//! Flashapp state machine driver
//!
//! The firmware owns its state machine; the host only ever writes the state
//! word once, to force INIT during bootstrap. Everything else is observed
//! through `program_status` (and `flashapp_state` as a second opinion):
//!
//! - a status in the `0xBAD0xxxx` class is fatal and surfaces as
//!   [`Error::Data`] no matter which status is being waited for
//! - a state of ERROR without a fatal status surfaces as [`Error::State`]
//! - anything else that does not reach the awaited status before the
//!   deadline surfaces as [`Error::Timeout`]

use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::ProtocolLayout;
use crate::poll::{poll_until, Clock};
use crate::session::Session;
use crate::status::{FlashAppState, ProgramStatus, BOOT_MAGIC};
use crate::target::TargetMemory;

impl<T: TargetMemory, C: Clock> Session<T, C> {
    /// Read and decode `program_status`
    pub fn read_status(&mut self) -> Result<ProgramStatus> {
        let var = self.layout().program_status;
        self.read_u32(var).map(ProgramStatus::from_raw)
    }

    /// Read and decode `flashapp_state`
    pub fn read_state(&mut self) -> Result<FlashAppState> {
        let var = self.layout().flashapp_state;
        self.read_u32(var).map(FlashAppState::from_raw)
    }

    /// Fail if the device reports a fatal status or sits in its ERROR state
    pub fn check_health(&mut self) -> Result<ProgramStatus> {
        check_health(&mut self.target, &self.layout)
    }

    /// Poll until `program_status` equals `expected`
    pub fn wait_for(&mut self, expected: ProgramStatus, timeout: Duration) -> Result<()> {
        let interval = self.poll_config().interval;
        let waiting_for = format!("status {}", expected);
        let clock = &self.clock;
        let target = &mut self.target;
        let layout = &self.layout;

        poll_until(clock, interval, timeout, &waiting_for, || {
            let status = ProgramStatus::from_raw(target.read32(layout.program_status.address)?);
            if status.is_fatal() {
                return Err(Error::Data { status });
            }
            if status == expected {
                return Ok(Some(()));
            }
            let state = FlashAppState::from_raw(target.read32(layout.flashapp_state.address)?);
            if state == FlashAppState::Error {
                return Err(Error::State { state, status });
            }
            log::trace!("waiting for {}: status {}, state {}", expected, status, state);
            Ok(None)
        })
    }

    /// [`wait_for`](Self::wait_for) with the session's default deadline
    pub fn wait_for_status(&mut self, expected: ProgramStatus) -> Result<()> {
        let timeout = self.poll_config().timeout;
        self.wait_for(expected, timeout)
    }

    /// Reset the target into the flashapp and wait until it is idle
    pub fn start(&mut self) -> Result<()> {
        let layout = self.layout().clone();

        log::debug!("Resetting target into flashapp");
        self.target_mut().reset_and_halt()?;
        self.write_u32(layout.flashapp_state, FlashAppState::Init.raw())?;
        self.write_u32(layout.boot_magic, BOOT_MAGIC)?;
        self.write_u32(layout.program_status, 0)?;
        self.target_mut().resume()?;

        self.wait_for_status(ProgramStatus::Idle)?;
        log::info!("Flashapp is idle");
        Ok(())
    }

    /// Contents of the firmware log buffer
    pub fn read_log(&mut self) -> Result<String> {
        let layout = self.layout().clone();
        let used = self.read_u32(layout.log_idx)?.min(layout.logbuf.size);
        let bytes = self
            .target_mut()
            .read_block(layout.logbuf.address, used as usize)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Field-level variant of [`Session::check_health`] for use inside poll loops
/// that already borrow the session's clock
pub(crate) fn check_health<T: TargetMemory>(
    target: &mut T,
    layout: &ProtocolLayout,
) -> Result<ProgramStatus> {
    let status = ProgramStatus::from_raw(target.read32(layout.program_status.address)?);
    if status.is_fatal() {
        return Err(Error::Data { status });
    }
    let state = FlashAppState::from_raw(target.read32(layout.flashapp_state.address)?);
    if state == FlashAppState::Error {
        return Err(Error::State { state, status });
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTarget;
    use crate::poll::{FakeClock, PollConfig};

    fn session(target: MockTarget, clock: FakeClock) -> Session<MockTarget, FakeClock> {
        Session::with_clock(
            target,
            ProtocolLayout::dual_context().unwrap(),
            PollConfig::default(),
            clock,
        )
    }

    #[test]
    fn test_wait_for_idle() {
        let mut target = MockTarget::new();
        target.set_status(ProgramStatus::Idle);
        let clock = FakeClock::new();
        let mut session = session(target, clock.clone());

        session.wait_for_status(ProgramStatus::Idle).unwrap();
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_wait_for_times_out_against_pinned_busy() {
        let clock = FakeClock::new();
        let status_clock = clock.clone();
        let mut target = MockTarget::new();
        target.status_override = Some(Box::new(move || {
            if status_clock.elapsed() < Duration::from_secs(11) {
                ProgramStatus::Busy.raw()
            } else {
                ProgramStatus::Idle.raw()
            }
        }));
        let mut session = session(target, clock.clone());

        let err = session
            .wait_for(ProgramStatus::Idle, Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(clock.elapsed() >= Duration::from_secs(10));
        assert!(clock.elapsed() <= Duration::from_secs(10) + Duration::from_millis(50));
    }

    #[test]
    fn test_fatal_status_names_status() {
        for expected in [ProgramStatus::Idle, ProgramStatus::Done, ProgramStatus::Busy] {
            let mut target = MockTarget::new();
            target.set_status(ProgramStatus::from_raw(0xBAD0_0002));
            let mut session = session(target, FakeClock::new());

            let err = session.wait_for_status(expected).unwrap_err();
            assert!(matches!(
                err,
                Error::Data {
                    status: ProgramStatus::BadHashFlash
                }
            ));
            assert!(err.to_string().contains("BAD_HAS_FLASH"));
        }
    }

    #[test]
    fn test_unknown_fatal_status() {
        let mut target = MockTarget::new();
        target.set_status(ProgramStatus::from_raw(0xBAD0_00FF));
        let mut session = session(target, FakeClock::new());

        let err = session.wait_for_status(ProgramStatus::Idle).unwrap_err();
        assert!(err.to_string().contains("UNKNOWN(0xBAD000FF)"));
    }

    #[test]
    fn test_error_state_without_fatal_status() {
        let mut target = MockTarget::new();
        target.set_status(ProgramStatus::Busy);
        target.set_state(FlashAppState::Error);
        let mut session = session(target, FakeClock::new());

        let err = session.wait_for_status(ProgramStatus::Idle).unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                state: FlashAppState::Error,
                status: ProgramStatus::Busy
            }
        ));
    }

    #[test]
    fn test_start_handshake() {
        let mut target = MockTarget::new();
        target.status_override = Some(Box::new(|| ProgramStatus::Idle.raw()));
        target.set_state(FlashAppState::Error);
        let mut session = session(target, FakeClock::new());
        let layout = session.layout().clone();

        session.start().unwrap();

        let target = session.into_target();
        assert_eq!(target.resets, 1);
        assert!(target.running);
        assert_eq!(target.peek32(layout.flashapp_state.address), 0);
        assert_eq!(target.peek32(layout.boot_magic.address), BOOT_MAGIC);
        assert_eq!(
            target.writes,
            vec![
                (layout.flashapp_state.address, 4),
                (layout.boot_magic.address, 4),
                (layout.program_status.address, 4),
            ]
        );
    }

    #[test]
    fn test_read_log() {
        let mut target = MockTarget::new();
        let layout = ProtocolLayout::dual_context().unwrap();
        target.poke(layout.logbuf.address, b"flashapp ready\nignored");
        target.poke(layout.log_idx.address, &15u32.to_le_bytes());
        let mut session = session(target, FakeClock::new());

        assert_eq!(session.read_log().unwrap(), "flashapp ready\n");
    }
}
