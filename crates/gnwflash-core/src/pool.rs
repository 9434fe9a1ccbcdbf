//! Double-buffered transfer context pool
//!
//! Two contexts live in shared RAM. A context whose `ready` word reads 0
//! belongs to the host; writing 1 hands it to the firmware, which clears it
//! again once the request has been erased, programmed and verified. The
//! `ready` word is the only backpressure: the host cannot get ahead of the
//! device by more than [`CONTEXT_COUNT`] requests.
//!
//! Ordering contract for [`ContextPool::submit`]: every parameter word, both
//! hashes and the payload are written before `ready`. The firmware may start
//! on a context the moment `ready` flips.

use std::time::Duration;

use crate::compress::{empty_sha256, sha256, PreparedChunk};
use crate::error::Result;
use crate::layout::{ContextLayout, ProtocolLayout, CONTEXT_COUNT};
use crate::poll::{poll_until, Clock};
use crate::session::Session;
use crate::state::check_health;
use crate::status::ProgramStatus;
use crate::target::TargetMemory;

/// Work handed to one context
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    /// Program a prepared chunk at `offset`
    Program {
        /// Destination extflash offset
        offset: u32,
        /// Payload and its integrity data
        chunk: &'a PreparedChunk,
        /// Erase the destination range first
        erase: bool,
    },
    /// Erase without programming
    Erase {
        /// First extflash offset to erase
        offset: u32,
        /// Bytes to erase, 0 for the whole chip
        bytes: u32,
    },
}

/// The two shared transfer contexts
#[derive(Debug, Clone)]
pub struct ContextPool {
    contexts: [ContextLayout; CONTEXT_COUNT],
}

impl ContextPool {
    /// Pool over the contexts of a resolved layout
    pub fn new(layout: &ProtocolLayout) -> Self {
        Self {
            contexts: layout.contexts,
        }
    }

    /// Context addresses
    pub fn contexts(&self) -> &[ContextLayout] {
        &self.contexts
    }

    /// Payload capacity of each context
    pub fn capacity(&self) -> usize {
        self.contexts[0].buffer.size as usize
    }

    /// Wait for a context the host owns and return its index
    ///
    /// A fatal device status ends the wait immediately instead of spinning
    /// until the deadline.
    pub fn acquire<T: TargetMemory, C: Clock>(&self, session: &mut Session<T, C>) -> Result<usize> {
        let poll = session.poll_config();
        let clock = &session.clock;
        let target = &mut session.target;
        let layout = &session.layout;

        poll_until(clock, poll.interval, poll.timeout, "a free transfer context", || {
            for ctx in &self.contexts {
                if target.read32(ctx.ready.address)? == 0 {
                    return Ok(Some(ctx.index));
                }
            }
            check_health(target, layout)?;
            Ok(None)
        })
    }

    /// Fill context `index` and hand it to the device
    ///
    /// `index` must come from [`acquire`](Self::acquire) with no submit in
    /// between.
    pub fn submit<T: TargetMemory, C: Clock>(
        &self,
        session: &mut Session<T, C>,
        index: usize,
        request: Request<'_>,
    ) -> Result<()> {
        let ctx = self.contexts[index];

        match request {
            Request::Program {
                offset,
                chunk,
                erase,
            } => {
                let (decompressed_size, decompressed_hash) = match chunk.decompressed {
                    Some(info) => (info.size, Some(info.sha256)),
                    None => (0, None),
                };
                let erase_bytes = if erase { chunk.original_len as u32 } else { 0 };

                log::debug!(
                    "context {}: chunk {} -> 0x{:08X}, {} bytes{}{}",
                    index,
                    chunk.index,
                    offset,
                    chunk.payload.len(),
                    if chunk.is_compressed() { " (lzma)" } else { "" },
                    if erase { ", erase" } else { "" },
                );

                session.write_u32(ctx.address, offset)?;
                session.write_u32(ctx.size, chunk.payload.len() as u32)?;
                session.write_u32(ctx.erase, erase as u32)?;
                session.write_u32(ctx.erase_bytes, erase_bytes)?;
                session.write_u32(ctx.decompressed_size, decompressed_size)?;
                session.write_var(ctx.expected_sha256, &sha256(&chunk.payload))?;
                if let Some(hash) = decompressed_hash {
                    session.write_var(ctx.expected_sha256_decompressed, &hash)?;
                }
                session.write_var(ctx.buffer, &chunk.payload)?;
            }
            Request::Erase { offset, bytes } => {
                if bytes == 0 {
                    log::debug!("context {}: whole chip erase", index);
                } else {
                    log::debug!("context {}: erase 0x{:08X} +{} bytes", index, offset, bytes);
                }

                session.write_u32(ctx.address, offset)?;
                session.write_u32(ctx.size, 0)?;
                session.write_u32(ctx.erase, 1)?;
                session.write_u32(ctx.erase_bytes, bytes)?;
                session.write_u32(ctx.decompressed_size, 0)?;
                session.write_var(ctx.expected_sha256, &empty_sha256())?;
            }
        }

        session.write_u32(ctx.ready, 1)
    }

    /// Wait until the device owns no context and reports IDLE
    pub fn drain<T: TargetMemory, C: Clock>(&self, session: &mut Session<T, C>) -> Result<()> {
        let timeout = session.poll_config().timeout;
        self.drain_within(session, timeout)
    }

    /// [`drain`](Self::drain) with an explicit deadline for each phase
    pub fn drain_within<T: TargetMemory, C: Clock>(
        &self,
        session: &mut Session<T, C>,
        timeout: Duration,
    ) -> Result<()> {
        let interval = session.poll_config().interval;
        {
            let clock = &session.clock;
            let target = &mut session.target;
            let layout = &session.layout;

            poll_until(clock, interval, timeout, "transfer contexts to drain", || {
                for ctx in &self.contexts {
                    if target.read32(ctx.ready.address)? != 0 {
                        check_health(target, layout)?;
                        return Ok(None);
                    }
                }
                Ok(Some(()))
            })?;
        }

        session.wait_for(ProgramStatus::Idle, timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::compress::{prepare_chunk, Compression};
    use crate::error::Error;
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

    fn busy(target: &mut MockTarget, layout: &ProtocolLayout, index: usize) {
        target.poke(layout.contexts[index].ready.address, &1u32.to_le_bytes());
    }

    #[test]
    fn test_acquire_skips_owned_context() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut target = MockTarget::new();
        busy(&mut target, &layout, 0);
        let mut session = session(target, FakeClock::new());
        let pool = ContextPool::new(&layout);

        assert_eq!(pool.acquire(&mut session).unwrap(), 1);
    }

    #[test]
    fn test_acquire_never_returns_busy_context() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut target = MockTarget::new();
        busy(&mut target, &layout, 0);
        busy(&mut target, &layout, 1);
        target.consume_ready = true;
        let clock = FakeClock::new();
        let mut session = session(target, clock.clone());
        let pool = ContextPool::new(&layout);

        let index = pool.acquire(&mut session).unwrap();
        let target = session.into_target();
        // Context 0 read 1 on the first pass and was consumed by the fake device
        assert_eq!(index, 0);
        assert_eq!(target.peek32(layout.contexts[index].ready.address), 0);
        assert_eq!(target.consumed, vec![0, 1]);
        assert_eq!(clock.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn test_acquire_times_out() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut target = MockTarget::new();
        busy(&mut target, &layout, 0);
        busy(&mut target, &layout, 1);
        let clock = FakeClock::new();
        let mut session = session(target, clock.clone());
        let pool = ContextPool::new(&layout);

        let err = pool.acquire(&mut session).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_acquire_surfaces_fatal_status() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut target = MockTarget::new();
        busy(&mut target, &layout, 0);
        busy(&mut target, &layout, 1);
        target.set_status(ProgramStatus::BadHashRam);
        let clock = FakeClock::new();
        let mut session = session(target, clock.clone());
        let pool = ContextPool::new(&layout);

        let err = pool.acquire(&mut session).unwrap_err();
        assert!(matches!(
            err,
            Error::Data {
                status: ProgramStatus::BadHashRam
            }
        ));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_submit_writes_ready_last() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut session = session(MockTarget::new(), FakeClock::new());
        let pool = ContextPool::new(&layout);
        let data: Vec<u8> = b"flashapp ".iter().copied().cycle().take(8192).collect();
        let chunk = prepare_chunk(0, &data, Compression::Lzma).unwrap();
        assert!(chunk.is_compressed());

        pool.submit(
            &mut session,
            1,
            Request::Program {
                offset: 0x1000,
                chunk: &chunk,
                erase: true,
            },
        )
        .unwrap();

        let ctx = layout.contexts[1];
        let target = session.into_target();
        assert_eq!(target.writes.last(), Some(&(ctx.ready.address, 4)));
        let buffer_write = target
            .writes
            .iter()
            .position(|w| *w == (ctx.buffer.address, chunk.payload.len()))
            .unwrap();
        assert_eq!(buffer_write, target.writes.len() - 2);

        assert_eq!(target.peek32(ctx.address.address), 0x1000);
        assert_eq!(target.peek32(ctx.size.address), chunk.payload.len() as u32);
        assert_eq!(target.peek32(ctx.erase.address), 1);
        assert_eq!(target.peek32(ctx.erase_bytes.address), 8192);
        assert_eq!(target.peek32(ctx.decompressed_size.address), 8192);
        assert_eq!(
            target.peek(ctx.expected_sha256.address, 32),
            sha256(&chunk.payload).to_vec()
        );
        assert_eq!(
            target.peek(ctx.expected_sha256_decompressed.address, 32),
            sha256(&data).to_vec()
        );
        // Context 0 untouched
        assert!(target
            .writes
            .iter()
            .all(|(addr, _)| *addr > layout.contexts[0].ready.address));
    }

    #[test]
    fn test_raw_chunk_sends_zero_decompressed_size() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut session = session(MockTarget::new(), FakeClock::new());
        let pool = ContextPool::new(&layout);
        let chunk = prepare_chunk(0, &[0xA5; 64], Compression::None).unwrap();

        pool.submit(
            &mut session,
            0,
            Request::Program {
                offset: 0,
                chunk: &chunk,
                erase: false,
            },
        )
        .unwrap();

        let ctx = layout.contexts[0];
        let target = session.into_target();
        assert_eq!(target.peek32(ctx.decompressed_size.address), 0);
        assert_eq!(target.peek32(ctx.erase.address), 0);
        assert_eq!(target.peek32(ctx.erase_bytes.address), 0);
        assert!(target
            .writes
            .iter()
            .all(|(addr, _)| *addr != ctx.expected_sha256_decompressed.address));
    }

    #[test]
    fn test_whole_chip_erase_request() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut session = session(MockTarget::new(), FakeClock::new());
        let pool = ContextPool::new(&layout);

        pool.submit(&mut session, 0, Request::Erase { offset: 0, bytes: 0 })
            .unwrap();

        let ctx = layout.contexts[0];
        let target = session.into_target();
        assert_eq!(target.peek32(ctx.erase.address), 1);
        assert_eq!(target.peek32(ctx.erase_bytes.address), 0);
        assert_eq!(target.peek32(ctx.size.address), 0);
        assert_eq!(
            target.peek(ctx.expected_sha256.address, 32),
            empty_sha256().to_vec()
        );
        assert!(target.writes.iter().all(|(addr, _)| *addr != ctx.buffer.address));
        assert_eq!(target.writes.last(), Some(&(ctx.ready.address, 4)));
    }

    #[test]
    fn test_drain_waits_for_contexts_then_idle() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut target = MockTarget::new();
        busy(&mut target, &layout, 0);
        busy(&mut target, &layout, 1);
        target.consume_ready = true;
        target.set_status(ProgramStatus::Idle);
        let mut session = session(target, FakeClock::new());
        let pool = ContextPool::new(&layout);

        pool.drain(&mut session).unwrap();
        let target = session.into_target();
        assert_eq!(target.consumed, vec![0, 1]);
    }

    #[test]
    fn test_drain_within_uses_given_deadline() {
        let layout = ProtocolLayout::dual_context().unwrap();
        let mut target = MockTarget::new();
        busy(&mut target, &layout, 1);
        target.set_status(ProgramStatus::Idle);
        let clock = FakeClock::new();
        let mut session = session(target, clock.clone());
        let pool = ContextPool::new(&layout);

        let err = pool
            .drain_within(&mut session, Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }
}
