// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate contains the orchestration layer for driving a stateful VPU video decoder: it
//! feeds pre-delimited access units to a decoder engine, interprets the output codes the
//! engine returns from each decode call, manages the pool of physically-addressed
//! framebuffers the engine decodes into, and drains the remaining pictures at
//! end-of-stream.
//!
//! The crate never implements codec math. The decoder engine is an opaque collaborator
//! reached through the traits in [`engine`]; what this crate implements is the protocol for
//! driving such an engine safely: buffer ownership transfer, capacity negotiation, and
//! shutdown/drain correctness.
//!
//! # Traits to implement by the embedder
//!
//! * [`engine::DecoderEngine`] and [`engine::EngineSession`] adapt the actual decoder,
//!   hardware or software.
//! * [`dma::DmaAllocator`] supplies the physically contiguous memory the engine decodes
//!   into. [`dma::MemFdAllocator`] is provided for engines that do not perform DMA.
//! * [`BitstreamSource`] produces access units with their boundaries already delimited;
//!   container and byte-stream framing is the embedder's concern.
//! * [`OutputSink`] consumes decoded pictures. [`WriteSink`] adapts any
//!   [`std::io::Write`].
//!
//! # Anatomy of a session
//!
//! [`session::Session::open`] allocates the engine's bitstream scratch buffer and opens an
//! engine session. Each [`session::Session::step`] submits one unit and dispatches on the
//! returned [`engine::OutputCodes`]: building and registering a fresh framebuffer pool when
//! the engine announces stream parameters, delivering and recycling a picture when one is
//! ready, recording dropped frames, and reporting end-of-stream.
//! [`session::Session::run`] is the full pump: decode until the source is exhausted, switch
//! to drain mode, and keep stepping with empty units until the engine reports
//! end-of-stream.
//!
//! Logging goes through the `log` facade. The embedding program installs a logger once at
//! startup; nothing in this crate mutates logging configuration at run time.

pub mod dma;
pub mod engine;
pub mod pool;
pub mod session;

use std::collections::VecDeque;
use std::io::Write;

use engine::EncodedUnit;
use engine::FrameId;

/// Trait for suppliers of encoded access units.
///
/// Unit boundaries must already be delimited; the session submits each returned unit to the
/// engine as-is. `Ok(None)` means the source is exhausted, after which the session switches
/// to drain mode and never asks again.
pub trait BitstreamSource {
    /// Returns the next access unit, or `None` once the input is exhausted.
    ///
    /// The returned unit borrows from the source and is only valid until the next call.
    /// Its `context` is left empty; the session assigns one before submission.
    fn next_unit(&mut self) -> anyhow::Result<Option<EncodedUnit<'_>>>;
}

/// Trait for consumers of decoded pictures.
pub trait OutputSink {
    /// Consumes one decoded picture.
    ///
    /// `data` is a mapping of the framebuffer the picture was decoded into and is valid
    /// only for the duration of the call; the slot is recycled to the engine as soon as
    /// this returns. `frame_id` is the context of the access unit the picture was decoded
    /// from.
    fn write_picture(&mut self, frame_id: Option<FrameId>, data: &[u8]) -> anyhow::Result<()>;
}

/// Adapter making any [`std::io::Write`] consume raw frame bytes, which is all a YUV dump
/// file needs.
pub struct WriteSink<W>(pub W);

impl<W: Write> OutputSink for WriteSink<W> {
    fn write_picture(&mut self, _frame_id: Option<FrameId>, data: &[u8]) -> anyhow::Result<()> {
        self.0.write_all(data)?;
        Ok(())
    }
}

/// [`BitstreamSource`] over access units that are already framed in memory.
///
/// Useful for tests and for embedders whose demuxer hands out whole units. Out-of-band
/// codec configuration bytes, if any, are attached to every unit the way container demuxers
/// deliver them.
pub struct MemorySource {
    units: VecDeque<Vec<u8>>,
    codec_data: Option<Vec<u8>>,
    current: Option<Vec<u8>>,
}

impl MemorySource {
    pub fn new<I: IntoIterator<Item = Vec<u8>>>(units: I) -> Self {
        Self {
            units: units.into_iter().collect(),
            codec_data: None,
            current: None,
        }
    }

    /// Attaches out-of-band codec configuration bytes to every unit.
    pub fn with_codec_data(mut self, codec_data: Vec<u8>) -> Self {
        self.codec_data = Some(codec_data);
        self
    }
}

impl BitstreamSource for MemorySource {
    fn next_unit(&mut self) -> anyhow::Result<Option<EncodedUnit<'_>>> {
        self.current = self.units.pop_front();
        Ok(self.current.as_ref().map(|data| EncodedUnit {
            data,
            codec_data: self.codec_data.as_deref(),
            context: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_yields_units_in_order_then_none() {
        let mut source = MemorySource::new([vec![1u8, 2], vec![3u8]]);

        let unit = source.next_unit().unwrap().unwrap();
        assert_eq!(unit.data, &[1, 2]);
        assert_eq!(unit.codec_data, None);
        assert_eq!(unit.context, None);

        let unit = source.next_unit().unwrap().unwrap();
        assert_eq!(unit.data, &[3]);

        assert!(source.next_unit().unwrap().is_none());
        // Exhaustion is permanent.
        assert!(source.next_unit().unwrap().is_none());
    }

    #[test]
    fn memory_source_attaches_codec_data_to_every_unit() {
        let mut source =
            MemorySource::new([vec![1u8], vec![2u8]]).with_codec_data(vec![0xaa, 0xbb]);

        let unit = source.next_unit().unwrap().unwrap();
        assert_eq!(unit.codec_data, Some(&[0xaa, 0xbb][..]));
        let unit = source.next_unit().unwrap().unwrap();
        assert_eq!(unit.codec_data, Some(&[0xaa, 0xbb][..]));
    }

    #[test]
    fn write_sink_receives_raw_frame_bytes() {
        let mut sink = WriteSink(Vec::new());
        sink.write_picture(Some(FrameId(0x100)), &[1, 2, 3]).unwrap();
        sink.write_picture(None, &[4]).unwrap();
        assert_eq!(sink.0, vec![1, 2, 3, 4]);
    }
}
