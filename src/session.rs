// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode session state machine.
//!
//! One session drives one engine instance, one synchronous decode call per step: submit a
//! unit, dispatch on the output codes the engine returns, repeat. Once the input source is
//! exhausted the session switches to drain mode and keeps the engine fed with flush units
//! until it reports end-of-stream. No matter how a session ends (normally, through a
//! fatal error, or by drop), its resources are torn down in one fixed order: engine
//! session close, framebuffer pool release, scratch buffer release, engine last.

use nix::errno::Errno;
use thiserror::Error;

use crate::dma::AccessMode;
use crate::dma::AllocError;
use crate::dma::DmaAllocator;
use crate::dma::DmaBuffer;
use crate::engine::DecoderEngine;
use crate::engine::EncodedUnit;
use crate::engine::EngineSession;
use crate::engine::FrameId;
use crate::engine::OpenParams;
use crate::engine::OutputCodes;
use crate::pool::FramebufferPool;
use crate::pool::RegisterError;
use crate::pool::SlotId;
use crate::BitstreamSource;
use crate::OutputSink;

/// First value of the frame context counter; non-zero so "no context" can never be
/// confused with a real one.
pub const FIRST_FRAME_ID: FrameId = FrameId(0x100);

/// Mints the strictly increasing per-unit frame contexts. Never reset within a session.
#[derive(Debug)]
struct FrameIdCounter(u64);

impl FrameIdCounter {
    fn new() -> Self {
        Self(FIRST_FRAME_ID.0)
    }

    fn mint(&mut self) -> FrameId {
        let id = FrameId(self.0);
        self.0 += 1;
        id
    }
}

/// Observable phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Engine opened and scratch memory allocated; no unit submitted yet.
    Open,
    /// Live input is being submitted.
    Decoding,
    /// Input exhausted; flush units keep the engine emitting until end-of-stream. Never
    /// exited.
    Draining,
    /// Terminal; every resource has been released.
    Closed,
}

/// What a decode step concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// More work may be pending; step again.
    Continue,
    /// The input source is exhausted (while decoding) or the engine has emitted its last
    /// picture (while draining).
    EndOfInput,
}

/// Contract breaches that indicate a bug in the embedder or the engine, not a runtime
/// condition to recover from.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("framebuffer pool registered twice without an intervening stream info event")]
    PoolAlreadyRegistered,
    #[error("engine delivered a picture before any framebuffer pool was registered")]
    PictureWithoutPool,
    #[error("engine delivered a picture for unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("session is closed")]
    SessionClosed,
}

/// Fatal session failures. Any of these closes the session before it surfaces.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("resource allocation failed: {0}")]
    Resource(#[from] AllocError),
    #[error("decoder engine failure: {0}")]
    Engine(Errno),
    #[error("bitstream source failed: {0}")]
    Source(#[source] anyhow::Error),
    #[error("output sink failed: {0}")]
    Sink(#[source] anyhow::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
}

impl From<Errno> for SessionError {
    fn from(errno: Errno) -> Self {
        SessionError::Engine(errno)
    }
}

impl From<RegisterError> for SessionError {
    fn from(err: RegisterError) -> Self {
        match err {
            RegisterError::AlreadyRegistered => ProtocolViolation::PoolAlreadyRegistered.into(),
            RegisterError::Engine(errno) => SessionError::Engine(errno),
        }
    }
}

/// Counters the session maintains for observability. Dropped frames are reported here and
/// in the log, never as errors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub units_submitted: u64,
    pub pictures_delivered: u64,
    pub frames_dropped: u64,
    pub pools_built: u64,
}

/// One decode session: an engine instance, its bitstream scratch buffer, its framebuffer
/// pool, and the state machine driving them.
///
/// Field declaration order matches the teardown order so that the plain-drop path releases
/// resources in the same sequence [`Session::close`] does.
pub struct Session<E: DecoderEngine, A: DmaAllocator> {
    state: SessionState,
    frame_ids: FrameIdCounter,
    stats: SessionStats,
    engine_session: Option<E::Session>,
    pool: Option<FramebufferPool<A::Buffer>>,
    scratch: Option<A::Buffer>,
    allocator: A,
    engine: E,
}

impl<E: DecoderEngine, A: DmaAllocator> Session<E, A> {
    /// Allocates the engine's bitstream scratch buffer and opens the engine session.
    ///
    /// On failure everything acquired so far is released before the error surfaces.
    pub fn open(mut engine: E, allocator: A, params: &OpenParams) -> Result<Self, SessionError> {
        let layout = engine.scratch_layout();
        let scratch = allocator.allocate(layout.size, layout.alignment)?;
        let engine_session = engine
            .open(params, scratch.region())
            .map_err(SessionError::Engine)?;

        log::debug!(
            "session open:  codec: {:?}  scratch: {} byte @ {}",
            params.codec_format,
            scratch.size(),
            scratch.phys_addr(),
        );

        Ok(Self {
            state: SessionState::Open,
            frame_ids: FrameIdCounter::new(),
            stats: SessionStats::default(),
            engine_session: Some(engine_session),
            pool: None,
            scratch: Some(scratch),
            allocator,
            engine,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Runs one decode step: submits one unit (a flush unit while draining) and dispatches
    /// on the output codes the engine returns.
    ///
    /// A fatal error closes the session before it is returned. Partial per-step anomalies
    /// (a dropped frame) are not fatal.
    pub fn step<Src, Snk>(
        &mut self,
        source: &mut Src,
        sink: &mut Snk,
    ) -> Result<StepStatus, SessionError>
    where
        Src: BitstreamSource,
        Snk: OutputSink,
    {
        let result = self.step_inner(source, sink);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn step_inner<Src, Snk>(
        &mut self,
        source: &mut Src,
        sink: &mut Snk,
    ) -> Result<StepStatus, SessionError>
    where
        Src: BitstreamSource,
        Snk: OutputSink,
    {
        match self.state {
            SessionState::Closed => return Err(ProtocolViolation::SessionClosed.into()),
            SessionState::Open => {
                log::debug!("decoding started");
                self.state = SessionState::Decoding;
            }
            SessionState::Decoding | SessionState::Draining => (),
        }
        let draining = self.state == SessionState::Draining;

        // Split borrows so the pool can be swapped while the engine session stays
        // borrowed.
        let Self {
            engine_session,
            pool,
            allocator,
            frame_ids,
            stats,
            ..
        } = self;
        let engine_session = engine_session
            .as_mut()
            .ok_or(ProtocolViolation::SessionClosed)?;

        let codes = if draining {
            engine_session
                .decode(&EncodedUnit::flush())
                .map_err(SessionError::Engine)?
        } else {
            let mut unit = match source
                .next_unit()
                .map_err(|e| SessionError::Source(e.context("while reading the next access unit")))?
            {
                Some(unit) => unit,
                None => return Ok(StepStatus::EndOfInput),
            };
            let frame_id = frame_ids.mint();
            unit.context = Some(frame_id);

            log::info!(
                "encoded input frame:  frame id: {}  size: {} byte",
                frame_id,
                unit.data.len(),
            );
            stats.units_submitted += 1;

            engine_session
                .decode(&unit)
                .map_err(SessionError::Engine)?
        };

        if codes.unhandled_bits() != 0 {
            log::debug!(
                "ignoring unhandled output code bits {:#x}",
                codes.unhandled_bits(),
            );
        }

        if codes.contains(OutputCodes::INITIAL_INFO_AVAILABLE) {
            let info = engine_session
                .initial_info()
                .map_err(SessionError::Engine)?;
            log::info!(
                "initial info:  size: {}x{} pixel  rate: {}/{}  min num required framebuffers: {}  interlacing: {}  width/height ratio: {}  framebuffer alignment: {}",
                info.frame_width,
                info.frame_height,
                info.frame_rate_numerator,
                info.frame_rate_denominator,
                info.min_num_required_framebuffers,
                info.interlacing,
                info.pixel_aspect_ratio(),
                info.framebuffer_alignment,
            );

            // A new stream-info event invalidates the engine's hold on the previous pool;
            // release it before building the replacement.
            *pool = None;
            let mut new_pool = FramebufferPool::build(allocator, &info)?;
            new_pool.register(engine_session)?;
            *pool = Some(new_pool);
            stats.pools_built += 1;
        }

        if codes.contains(OutputCodes::DECODED_PICTURE_AVAILABLE) {
            let pool = pool.as_ref().ok_or(ProtocolViolation::PictureWithoutPool)?;
            let picture = engine_session
                .decoded_picture()
                .map_err(SessionError::Engine)?;
            let framebuffer = pool
                .slot(picture.slot)
                .ok_or(ProtocolViolation::UnknownSlot(picture.slot))?;

            let picture_size = pool.geometry().picture_size();
            {
                let mapping = framebuffer.buffer().map(AccessMode::ReadOnly)?;
                let data = &mapping.as_ref()[..picture_size];
                match picture.context {
                    Some(frame_id) => log::info!(
                        "decoded output picture:  frame id: {}  writing {} byte",
                        frame_id,
                        data.len(),
                    ),
                    None => {
                        log::info!("decoded output picture:  no frame id  writing {} byte", data.len())
                    }
                }
                sink.write_picture(picture.context, data)
                    .map_err(|e| SessionError::Sink(e.context("while writing a decoded picture")))?;
            }
            // The slot must not be touched again once it is back in the engine's free
            // pool.
            engine_session
                .mark_displayed(picture.slot)
                .map_err(SessionError::Engine)?;
            stats.pictures_delivered += 1;
        }

        if codes.contains(OutputCodes::DROPPED) {
            match engine_session.dropped_context() {
                Some(frame_id) => log::warn!("dropped frame:  frame id: {}", frame_id),
                None => log::warn!("dropped frame:  no frame id"),
            }
            stats.frames_dropped += 1;
        }

        if codes.contains(OutputCodes::END_OF_STREAM) {
            log::info!("engine reports end of stream; no more decoded frames available");
            return Ok(StepStatus::EndOfInput);
        }

        Ok(StepStatus::Continue)
    }

    /// Switches the session into drain mode: no further input is read and every subsequent
    /// step submits a flush unit. Drain mode is never exited.
    pub fn enable_drain(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => Err(ProtocolViolation::SessionClosed.into()),
            SessionState::Draining => Ok(()),
            SessionState::Open | SessionState::Decoding => {
                log::info!("draining decoder");
                self.engine_session
                    .as_mut()
                    .ok_or(ProtocolViolation::SessionClosed)?
                    .set_drain_enabled(true);
                self.state = SessionState::Draining;
                Ok(())
            }
        }
    }

    /// Decodes until the source is exhausted, drains the engine, and closes the session.
    /// Returns the final counters.
    pub fn run<Src, Snk>(
        &mut self,
        source: &mut Src,
        sink: &mut Snk,
    ) -> Result<SessionStats, SessionError>
    where
        Src: BitstreamSource,
        Snk: OutputSink,
    {
        while let StepStatus::Continue = self.step(source, sink)? {}

        self.enable_drain()?;
        while let StepStatus::Continue = self.step(source, sink)? {}

        self.close();
        Ok(self.stats)
    }

    /// Releases every resource in the fixed teardown order. Idempotent; also run on drop
    /// and after any fatal error.
    pub fn close(&mut self) {
        if let Some(engine_session) = self.engine_session.take() {
            self.engine.close(engine_session);
        }
        self.pool = None;
        self.scratch = None;
        if self.state != SessionState::Closed {
            log::debug!("session closed");
            self.state = SessionState::Closed;
        }
    }
}

impl<E: DecoderEngine, A: DmaAllocator> Drop for Session<E, A> {
    fn drop(&mut self) {
        self.close();
    }
}
