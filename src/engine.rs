// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contracts of the opaque decoder engine and the data types crossing them.
//!
//! The engine performs the actual entropy decoding and motion compensation; this crate only
//! ever sees it through [`DecoderEngine`] and [`EngineSession`]. Engine calls fail with raw
//! OS error numbers, like the kernel interfaces such engines typically wrap, and any
//! failure is fatal to the session that issued the call.

use std::fmt;

use enumn::N;
use nix::errno::Errno;

use crate::dma::PhysRegion;
use crate::pool::FramebufferDesc;
use crate::pool::SlotId;

/// Result type of all decoder engine calls.
pub type EngineResult<T> = Result<T, Errno>;

/// Compressed formats a decoder engine may accept.
///
/// The numeric values are the format ids engines report; `CodecFormat::n` maps a raw id
/// back into the enum.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum CodecFormat {
    #[default]
    H264 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    H263 = 3,
    Wmv3 = 4,
    Wvc1 = 5,
    Mjpeg = 6,
    Vp8 = 7,
}

/// Parameters for opening a decode session on an engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenParams {
    pub codec_format: CodecFormat,
    /// Coded size hint for containers that carry it; zero lets the engine read it from the
    /// bitstream.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Output pictures in presentation order rather than decode order.
    pub enable_frame_reordering: bool,
}

/// Size and alignment the engine requires for its bitstream scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchLayout {
    pub size: u64,
    pub alignment: u64,
}

/// Correlation token attached to a submitted access unit and returned with the decoded or
/// dropped output it produced.
///
/// Values are minted by the session from a strictly increasing 64-bit counter and never
/// reused within a session; 64 bits do not wrap within any realistic stream length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// One encoded access unit, viewed from caller-owned memory.
///
/// Valid only until the decode call it is submitted to returns.
#[derive(Debug, Clone, Copy)]
pub struct EncodedUnit<'a> {
    pub data: &'a [u8],
    /// Out-of-band codec configuration bytes, for containers that store them separately
    /// from the elementary stream.
    pub codec_data: Option<&'a [u8]>,
    /// Correlation token; assigned by the session, absent on drain submissions.
    pub context: Option<FrameId>,
}

impl EncodedUnit<'static> {
    /// The empty unit submitted in drain mode. The engine interprets it as "flush the
    /// pictures still buffered internally".
    pub fn flush() -> Self {
        Self {
            data: &[],
            codec_data: None,
            context: None,
        }
    }
}

impl EncodedUnit<'_> {
    pub fn is_flush(&self) -> bool {
        self.data.is_empty()
    }
}

/// Stream parameters the engine announces once it has seen enough of the bitstream.
///
/// Produced once per session, or again on a mid-stream resolution change. Read-only to this
/// crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialInfo {
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    /// Capacity the engine demands from the framebuffer pool.
    pub min_num_required_framebuffers: u32,
    pub interlacing: bool,
    /// Pixel aspect ratio in 16.16 fixed point.
    pub width_height_ratio: u32,
    /// Required alignment of each framebuffer allocation, in bytes.
    pub framebuffer_alignment: u32,
}

impl InitialInfo {
    pub fn pixel_aspect_ratio(&self) -> f32 {
        self.width_height_ratio as f32 / 65536.0
    }
}

/// The set of independent event flags one decode call returns.
///
/// Flags are not mutually exclusive. The four named bits are the ones this crate acts on,
/// in their declaration order; any other bit an engine sets is preserved and reported
/// through [`OutputCodes::unhandled_bits`] but otherwise ignored.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputCodes(u32);

impl OutputCodes {
    /// Stream parameters can be read with [`EngineSession::initial_info`] and the
    /// framebuffer pool must be (re)built before decoding continues.
    pub const INITIAL_INFO_AVAILABLE: OutputCodes = OutputCodes(1 << 0);
    /// A decoded picture is ready for [`EngineSession::decoded_picture`].
    pub const DECODED_PICTURE_AVAILABLE: OutputCodes = OutputCodes(1 << 1);
    /// The engine discarded a unit; its context is available through
    /// [`EngineSession::dropped_context`].
    pub const DROPPED: OutputCodes = OutputCodes(1 << 2);
    /// The engine will produce no further pictures.
    pub const END_OF_STREAM: OutputCodes = OutputCodes(1 << 3);

    const HANDLED_MASK: u32 = 0b1111;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, flags: OutputCodes) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// Bits this crate does not interpret.
    pub const fn unhandled_bits(self) -> u32 {
        self.0 & !Self::HANDLED_MASK
    }
}

impl std::ops::BitOr for OutputCodes {
    type Output = OutputCodes;

    fn bitor(self, rhs: OutputCodes) -> OutputCodes {
        OutputCodes(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for OutputCodes {
    fn bitor_assign(&mut self, rhs: OutputCodes) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for OutputCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(OutputCodes, &str); 4] = [
            (OutputCodes::INITIAL_INFO_AVAILABLE, "INITIAL_INFO_AVAILABLE"),
            (
                OutputCodes::DECODED_PICTURE_AVAILABLE,
                "DECODED_PICTURE_AVAILABLE",
            ),
            (OutputCodes::DROPPED, "DROPPED"),
            (OutputCodes::END_OF_STREAM, "END_OF_STREAM"),
        ];

        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unhandled = self.unhandled_bits();
        if unhandled != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{unhandled:#x}")?;
            first = false;
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

/// Transient handle to a decoded picture occupying one framebuffer pool slot.
///
/// The engine owns the slot's content until the consumer marks it displayed; the handle
/// itself is consumed within the decode step that fetched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPicture {
    pub slot: SlotId,
    /// Context of the access unit this picture was decoded from. The engine carries it
    /// across its internal reordering.
    pub context: Option<FrameId>,
}

/// Factory side of a decoder engine. One engine instance backs exactly one session.
pub trait DecoderEngine {
    type Session: EngineSession;

    /// Size and alignment of the bitstream scratch buffer [`DecoderEngine::open`] expects.
    fn scratch_layout(&self) -> ScratchLayout;

    /// Opens the decode session. `scratch` must satisfy [`DecoderEngine::scratch_layout`]
    /// and stay allocated until after [`DecoderEngine::close`].
    fn open(&mut self, params: &OpenParams, scratch: PhysRegion) -> EngineResult<Self::Session>;

    /// Closes `session` and releases every engine-side resource attached to it.
    fn close(&mut self, session: Self::Session);
}

/// One open decode session on an engine.
///
/// All calls are synchronous and blocking; the session controller never overlaps them.
pub trait EngineSession {
    /// Submits one access unit (or flush unit) and returns the event flags it triggered.
    fn decode(&mut self, unit: &EncodedUnit) -> EngineResult<OutputCodes>;

    /// Valid whenever a decode call reported [`OutputCodes::INITIAL_INFO_AVAILABLE`].
    fn initial_info(&mut self) -> EngineResult<InitialInfo>;

    /// Hands the complete output buffer set to the engine in one call. Must not be called
    /// again until the engine announces stream parameters again.
    fn register_framebuffers(&mut self, framebuffers: &[FramebufferDesc]) -> EngineResult<()>;

    /// Fetches the pending picture. At most one call per decode call that reported
    /// [`OutputCodes::DECODED_PICTURE_AVAILABLE`].
    fn decoded_picture(&mut self) -> EngineResult<DecodedPicture>;

    /// Returns `slot` to the engine's free pool once its content has been consumed.
    fn mark_displayed(&mut self, slot: SlotId) -> EngineResult<()>;

    /// Context of the most recently dropped unit, for diagnostic correlation.
    fn dropped_context(&mut self) -> Option<FrameId>;

    /// Switches the engine into drain mode, in which it emits internally buffered pictures
    /// in response to flush units.
    fn set_drain_enabled(&mut self, enabled: bool);
}
