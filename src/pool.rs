// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framebuffer pool construction and registration.
//!
//! On a stream-info event the session turns the engine's parameters into a fixed pool of
//! physically-addressed framebuffers and registers the whole set with the engine in a
//! single call. The pool never resizes; a later stream-parameter change produces a whole
//! new pool.

use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

use crate::dma::AllocError;
use crate::dma::DmaAllocator;
use crate::dma::DmaBuffer;
use crate::dma::PhysAddr;
use crate::engine::EngineSession;
use crate::engine::InitialInfo;

/// Index of a framebuffer slot within its pool. Decoded pictures reference their slot by
/// this index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque pool-assigned tag identifying a slot in logs. Sequential from
/// [`FIRST_SLOT_TAG`]; unrelated to frame contexts and without bearing on decode
/// correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTag(pub u32);

impl fmt::Display for SlotTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub const FIRST_SLOT_TAG: SlotTag = SlotTag(0x2000);

/// Luma width alignment shared by the supported engine generations.
const WIDTH_ALIGNMENT: u32 = 16;

/// Buffer geometry computed from the engine's stream parameters.
///
/// Pictures are stored as I420 with a co-located motion-vector plane appended; strides and
/// plane sizes follow from the aligned frame size alone, so this is a pure function of
/// [`InitialInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub aligned_width: u32,
    pub aligned_height: u32,
    pub y_stride: u32,
    pub cbcr_stride: u32,
    pub y_size: u32,
    pub cbcr_size: u32,
    pub mvcol_size: u32,
    /// Size of one framebuffer allocation, rounded up to the engine's alignment.
    pub total_size: u32,
}

impl FrameGeometry {
    pub fn from_initial_info(info: &InitialInfo) -> Self {
        // Interlaced content is decoded field-wise; the height must cover two aligned
        // fields.
        let height_alignment = if info.interlacing {
            2 * WIDTH_ALIGNMENT
        } else {
            WIDTH_ALIGNMENT
        };
        let aligned_width = info.frame_width.next_multiple_of(WIDTH_ALIGNMENT);
        let aligned_height = info.frame_height.next_multiple_of(height_alignment);
        let y_stride = aligned_width;
        let y_size = y_stride * aligned_height;
        let cbcr_stride = y_stride / 2;
        let cbcr_size = y_size / 4;
        let mvcol_size = y_size / 4;
        let alignment = info.framebuffer_alignment.max(1);
        let total_size = (y_size + 2 * cbcr_size + mvcol_size).next_multiple_of(alignment);

        Self {
            aligned_width,
            aligned_height,
            y_stride,
            cbcr_stride,
            y_size,
            cbcr_size,
            mvcol_size,
            total_size,
        }
    }

    /// Bytes of one delivered picture: the I420 planes, without the motion-vector plane.
    pub fn picture_size(&self) -> usize {
        (self.y_size + 2 * self.cbcr_size) as usize
    }

    /// Fills the registration record for a framebuffer at `phys_addr`.
    pub fn framebuffer_desc(&self, phys_addr: PhysAddr, tag: SlotTag) -> FramebufferDesc {
        FramebufferDesc {
            phys_addr,
            y_offset: 0,
            cb_offset: self.y_size,
            cr_offset: self.y_size + self.cbcr_size,
            mvcol_offset: self.y_size + 2 * self.cbcr_size,
            y_stride: self.y_stride,
            cbcr_stride: self.cbcr_stride,
            tag,
        }
    }
}

/// What the engine needs to know about one framebuffer when the pool is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub phys_addr: PhysAddr,
    pub y_offset: u32,
    pub cb_offset: u32,
    pub cr_offset: u32,
    pub mvcol_offset: u32,
    pub y_stride: u32,
    pub cbcr_stride: u32,
    pub tag: SlotTag,
}

/// One pool slot: the backing allocation plus its debug tag.
pub struct Framebuffer<B> {
    buffer: B,
    tag: SlotTag,
}

impl<B: DmaBuffer> Framebuffer<B> {
    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn tag(&self) -> SlotTag {
        self.tag
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    /// Registration is not re-entrant; a pool instance registers exactly once.
    #[error("framebuffer pool is already registered")]
    AlreadyRegistered,
    #[error("engine rejected framebuffer registration: {0}")]
    Engine(#[source] Errno),
}

/// The fixed set of output buffers a session decodes into.
pub struct FramebufferPool<B> {
    geometry: FrameGeometry,
    slots: Vec<Framebuffer<B>>,
    registered: bool,
}

impl<B: DmaBuffer> FramebufferPool<B> {
    /// Allocates one framebuffer per slot the engine demands.
    ///
    /// The count is exactly `min_num_required_framebuffers`; no margin is added on top of
    /// what the engine itself negotiated. Allocation is all-or-nothing: a failure releases
    /// every already-allocated sibling before the error surfaces.
    pub fn build<A>(allocator: &A, info: &InitialInfo) -> Result<Self, AllocError>
    where
        A: DmaAllocator<Buffer = B>,
    {
        let geometry = FrameGeometry::from_initial_info(info);
        log::info!(
            "calculated sizes:  frame width&height: {}x{}  Y stride: {}  CbCr stride: {}  Y size: {}  CbCr size: {}  MvCol size: {}  total size: {}",
            geometry.aligned_width,
            geometry.aligned_height,
            geometry.y_stride,
            geometry.cbcr_stride,
            geometry.y_size,
            geometry.cbcr_size,
            geometry.mvcol_size,
            geometry.total_size,
        );

        let alignment = u64::from(info.framebuffer_alignment.max(1));
        // Collecting through Result drops the partial pool if any allocation fails.
        let slots = (0..info.min_num_required_framebuffers)
            .map(|i| {
                allocator
                    .allocate(u64::from(geometry.total_size), alignment)
                    .map(|buffer| Framebuffer {
                        buffer,
                        tag: SlotTag(FIRST_SLOT_TAG.0 + i),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            geometry,
            slots,
            registered: false,
        })
    }

    /// Hands the full slot set to the engine as one registration.
    pub fn register<S: EngineSession>(&mut self, session: &mut S) -> Result<(), RegisterError> {
        if self.registered {
            return Err(RegisterError::AlreadyRegistered);
        }

        let descs = self
            .slots
            .iter()
            .map(|slot| {
                self.geometry
                    .framebuffer_desc(slot.buffer.phys_addr(), slot.tag)
            })
            .collect::<Vec<_>>();

        session
            .register_framebuffers(&descs)
            .map_err(RegisterError::Engine)?;
        self.registered = true;

        Ok(())
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geometry
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot lookup for a picture handle returned by the engine.
    pub fn slot(&self, id: SlotId) -> Option<&Framebuffer<B>> {
        self.slots.get(id.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::dma::AccessMode;
    use crate::engine::DecodedPicture;
    use crate::engine::EncodedUnit;
    use crate::engine::EngineResult;
    use crate::engine::FrameId;
    use crate::engine::OutputCodes;

    fn test_info(min_framebuffers: u32) -> InitialInfo {
        InitialInfo {
            frame_width: 1920,
            frame_height: 1080,
            frame_rate_numerator: 30,
            frame_rate_denominator: 1,
            min_num_required_framebuffers: min_framebuffers,
            interlacing: false,
            width_height_ratio: 65536,
            framebuffer_alignment: 4096,
        }
    }

    /// Allocator that counts live buffers and can be told to fail the n-th allocation.
    #[derive(Clone, Default)]
    struct TrackingAllocator {
        live: Rc<RefCell<i64>>,
        total: Rc<RefCell<u32>>,
        fail_at: Option<u32>,
    }

    struct TrackedBuffer {
        data: Rc<Vec<u8>>,
        phys: PhysAddr,
        live: Rc<RefCell<i64>>,
    }

    impl Drop for TrackedBuffer {
        fn drop(&mut self) {
            *self.live.borrow_mut() -= 1;
        }
    }

    struct TrackedMapping(Rc<Vec<u8>>);

    impl AsRef<[u8]> for TrackedMapping {
        fn as_ref(&self) -> &[u8] {
            &self.0
        }
    }

    impl DmaBuffer for TrackedBuffer {
        type Mapping = TrackedMapping;

        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        fn phys_addr(&self) -> PhysAddr {
            self.phys
        }

        fn map(&self, _mode: AccessMode) -> Result<TrackedMapping, AllocError> {
            Ok(TrackedMapping(Rc::clone(&self.data)))
        }
    }

    impl DmaAllocator for TrackingAllocator {
        type Buffer = TrackedBuffer;

        fn allocate(&self, size: u64, _alignment: u64) -> Result<TrackedBuffer, AllocError> {
            let mut total = self.total.borrow_mut();
            *total += 1;
            if Some(*total) == self.fail_at {
                return Err(AllocError::FailedToCreate(Errno::ENOMEM));
            }
            *self.live.borrow_mut() += 1;
            Ok(TrackedBuffer {
                data: Rc::new(vec![0u8; size as usize]),
                phys: PhysAddr(0x8000_0000 + u64::from(*total) * 0x0100_0000),
                live: Rc::clone(&self.live),
            })
        }
    }

    /// Engine session that only records framebuffer registrations.
    #[derive(Default)]
    struct RecordingSession {
        registrations: Vec<Vec<FramebufferDesc>>,
    }

    impl EngineSession for RecordingSession {
        fn decode(&mut self, _unit: &EncodedUnit) -> EngineResult<OutputCodes> {
            Err(Errno::ENOSYS)
        }

        fn initial_info(&mut self) -> EngineResult<InitialInfo> {
            Err(Errno::ENOSYS)
        }

        fn register_framebuffers(
            &mut self,
            framebuffers: &[FramebufferDesc],
        ) -> EngineResult<()> {
            self.registrations.push(framebuffers.to_vec());
            Ok(())
        }

        fn decoded_picture(&mut self) -> EngineResult<DecodedPicture> {
            Err(Errno::ENOSYS)
        }

        fn mark_displayed(&mut self, _slot: SlotId) -> EngineResult<()> {
            Err(Errno::ENOSYS)
        }

        fn dropped_context(&mut self) -> Option<FrameId> {
            None
        }

        fn set_drain_enabled(&mut self, _enabled: bool) {}
    }

    #[test]
    fn geometry_for_progressive_1080p() {
        let geometry = FrameGeometry::from_initial_info(&test_info(4));

        assert_eq!(geometry.aligned_width, 1920);
        // 1080 is not a multiple of 16.
        assert_eq!(geometry.aligned_height, 1088);
        assert_eq!(geometry.y_stride, 1920);
        assert_eq!(geometry.cbcr_stride, 960);
        assert_eq!(geometry.y_size, 1920 * 1088);
        assert_eq!(geometry.cbcr_size, 1920 * 1088 / 4);
        assert_eq!(geometry.mvcol_size, 1920 * 1088 / 4);
        // Y + 2*CbCr + MvCol, rounded up to the 4096-byte alignment.
        assert_eq!(geometry.total_size, 3_657_728);
        assert_eq!(geometry.picture_size(), 1920 * 1088 * 3 / 2);
    }

    #[test]
    fn interlaced_height_aligns_to_two_fields() {
        let mut info = test_info(4);
        info.frame_width = 720;
        info.frame_height = 576;
        info.interlacing = true;

        let geometry = FrameGeometry::from_initial_info(&info);
        assert_eq!(geometry.aligned_width, 720);
        assert_eq!(geometry.aligned_height, 576);

        info.frame_height = 570;
        let geometry = FrameGeometry::from_initial_info(&info);
        assert_eq!(geometry.aligned_height, 576);

        info.interlacing = false;
        let geometry = FrameGeometry::from_initial_info(&info);
        assert_eq!(geometry.aligned_height, 576);
    }

    #[test]
    fn framebuffer_desc_lays_planes_out_contiguously() {
        let geometry = FrameGeometry::from_initial_info(&test_info(4));
        let desc = geometry.framebuffer_desc(PhysAddr(0x1000), SlotTag(0x2003));

        assert_eq!(desc.phys_addr, PhysAddr(0x1000));
        assert_eq!(desc.y_offset, 0);
        assert_eq!(desc.cb_offset, geometry.y_size);
        assert_eq!(desc.cr_offset, geometry.y_size + geometry.cbcr_size);
        assert_eq!(desc.mvcol_offset, geometry.y_size + 2 * geometry.cbcr_size);
        assert_eq!(desc.y_stride, geometry.y_stride);
        assert_eq!(desc.cbcr_stride, geometry.cbcr_stride);
        assert_eq!(desc.tag, SlotTag(0x2003));
    }

    #[test]
    fn build_allocates_exactly_the_required_count() {
        let allocator = TrackingAllocator::default();
        let pool = FramebufferPool::build(&allocator, &test_info(5)).unwrap();

        assert_eq!(pool.len(), 5);
        assert_eq!(*allocator.live.borrow(), 5);
        for (i, id) in (0..5).enumerate() {
            let slot = pool.slot(SlotId(id)).unwrap();
            assert_eq!(slot.tag(), SlotTag(FIRST_SLOT_TAG.0 + i as u32));
            assert_eq!(slot.buffer().size(), u64::from(pool.geometry().total_size));
        }
        assert!(pool.slot(SlotId(5)).is_none());

        drop(pool);
        assert_eq!(*allocator.live.borrow(), 0);
    }

    #[test]
    fn build_failure_releases_already_allocated_siblings() {
        let allocator = TrackingAllocator {
            fail_at: Some(3),
            ..Default::default()
        };

        let result = FramebufferPool::build(&allocator, &test_info(5));
        assert!(matches!(result, Err(AllocError::FailedToCreate(_))));
        // The first two buffers were allocated and released; no further attempts.
        assert_eq!(*allocator.total.borrow(), 3);
        assert_eq!(*allocator.live.borrow(), 0);
    }

    #[test]
    fn register_hands_the_whole_set_over_once() {
        let allocator = TrackingAllocator::default();
        let mut pool = FramebufferPool::build(&allocator, &test_info(4)).unwrap();
        let mut session = RecordingSession::default();

        pool.register(&mut session).unwrap();
        assert_eq!(session.registrations.len(), 1);
        let descs = &session.registrations[0];
        assert_eq!(descs.len(), 4);
        assert_eq!(descs[0].tag, FIRST_SLOT_TAG);
        assert_eq!(descs[3].tag, SlotTag(FIRST_SLOT_TAG.0 + 3));

        assert!(matches!(
            pool.register(&mut session),
            Err(RegisterError::AlreadyRegistered)
        ));
        assert_eq!(session.registrations.len(), 1);
    }
}
