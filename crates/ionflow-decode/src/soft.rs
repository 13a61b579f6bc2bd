//! In-process decode engine.
//!
//! `SoftDecodeEngine` follows the engine contract (slots handed in with
//! `release`, pictures reported with `poll`) without decoding anything.  In
//! [`SoftMode::Autonomous`] every submitted packet becomes a picture as soon
//! as a slot is free; in [`SoftMode::Scripted`] tests decide which slot
//! completes and with what size.  When built over a [`HeapAllocator`] the
//! engine paints each picture so downstream checksums have content to hash.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use ionflow_core::alloc::{BufferToken, HeapAllocator, PhysicalBuffer};
use ionflow_core::error::EngineCode;

use crate::engine::{Completion, DecodeEngine, EngineResult, SessionParams};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftMode {
    Autonomous,
    Scripted,
}

#[derive(Default)]
struct SoftState {
    params: Option<SessionParams>,
    tokens: Vec<Option<BufferToken>>,
    free: BTreeSet<usize>,
    pending: VecDeque<u64>,
    ready: VecDeque<Completion>,
    pictures: u64,

    header_writes: usize,
    last_header: Option<Bytes>,
    submissions: Vec<u64>,
    releases: Vec<usize>,
    resets: usize,

    fail_init: Option<i32>,
    fail_submit: Option<i32>,
    fail_reset: Option<i32>,
    fail_release: Option<i32>,
    zero_area: usize,
}

pub struct SoftDecodeEngine {
    mode: SoftMode,
    heap: Option<Arc<HeapAllocator>>,
    state: Mutex<SoftState>,
}

impl SoftDecodeEngine {
    pub fn new(mode: SoftMode) -> Self {
        Self {
            mode,
            heap: None,
            state: Mutex::new(SoftState::default()),
        }
    }

    /// Engine that writes a test pattern into every decoded slot.
    pub fn with_heap(mode: SoftMode, heap: Arc<HeapAllocator>) -> Self {
        Self {
            heap: Some(heap),
            ..Self::new(mode)
        }
    }

    pub fn mode(&self) -> SoftMode {
        self.mode
    }

    /// Report `slot` as decoded at `width`×`height`, stamped with the oldest
    /// pending packet.  `false` if the engine does not hold `slot`.
    pub fn complete(&self, slot: usize, width: u32, height: u32) -> bool {
        let mut state = self.state.lock();
        if !state.free.contains(&slot) {
            return false;
        }
        let timestamp = state.pending.pop_front().unwrap_or(0);
        self.finish_picture(&mut state, slot, width, height, timestamp)
    }

    /// Like [`complete`](Self::complete) with an explicit timestamp.
    pub fn complete_with(&self, slot: usize, width: u32, height: u32, timestamp: u64) -> bool {
        let mut state = self.state.lock();
        self.finish_picture(&mut state, slot, width, height, timestamp)
    }

    pub fn fail_init(&self, code: i32) {
        self.state.lock().fail_init = Some(code);
    }

    pub fn fail_next_submit(&self, code: i32) {
        self.state.lock().fail_submit = Some(code);
    }

    pub fn fail_next_reset(&self, code: i32) {
        self.state.lock().fail_reset = Some(code);
    }

    pub fn fail_next_release(&self, code: i32) {
        self.state.lock().fail_release = Some(code);
    }

    /// Report the next `count` autonomous pictures with zero size.
    pub fn emit_zero_area(&self, count: usize) {
        self.state.lock().zero_area = count;
    }

    pub fn header_writes(&self) -> usize {
        self.state.lock().header_writes
    }

    pub fn last_header(&self) -> Option<Bytes> {
        self.state.lock().last_header.clone()
    }

    /// Engine timestamps of every accepted packet, in order.
    pub fn submissions(&self) -> Vec<u64> {
        self.state.lock().submissions.clone()
    }

    /// Every slot handed to the engine, in order.
    pub fn releases(&self) -> Vec<usize> {
        self.state.lock().releases.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.lock().resets
    }

    pub fn free_slots(&self) -> usize {
        self.state.lock().free.len()
    }

    fn finish_picture(
        &self,
        state: &mut SoftState,
        slot: usize,
        width: u32,
        height: u32,
        timestamp: u64,
    ) -> bool {
        if !state.free.remove(&slot) {
            return false;
        }
        if width > 0 && height > 0 {
            state.pictures += 1;
            self.paint(state, slot, width, height);
        }
        trace!(slot, width, height, timestamp, "soft picture ready");
        state.ready.push_back(Completion {
            slot,
            width,
            height,
            timestamp,
        });
        true
    }

    fn decode_pending(&self, state: &mut SoftState) {
        let (width, height) = state
            .params
            .as_ref()
            .map_or((0, 0), |p| (p.width, p.height));
        while !state.pending.is_empty() {
            let Some(&slot) = state.free.first() else {
                break;
            };
            let timestamp = state.pending.pop_front().unwrap_or(0);
            let (w, h) = if state.zero_area > 0 {
                state.zero_area -= 1;
                (0, 0)
            } else {
                (width, height)
            };
            self.finish_picture(state, slot, w, h, timestamp);
        }
    }

    /// Luma ramp offset by the picture number, neutral chroma.
    fn paint(&self, state: &SoftState, slot: usize, width: u32, height: u32) {
        let (Some(heap), Some(params), Some(Some(token))) =
            (&self.heap, &state.params, state.tokens.get(slot))
        else {
            return;
        };
        let seed = state.pictures as u8;
        let layout = params.output_format.plane_layout(width, height);
        let painted = heap.with_block(*token, |data| {
            for (index, plane) in layout.iter().enumerate() {
                let end = (plane.offset + plane.len()).min(data.len());
                let Some(bytes) = data.get_mut(plane.offset..end) else {
                    continue;
                };
                if index == 0 {
                    for (i, byte) in bytes.iter_mut().enumerate() {
                        *byte = seed.wrapping_add((i % plane.linesize.max(1)) as u8);
                    }
                } else {
                    bytes.fill(128);
                }
            }
        });
        if let Err(err) = painted {
            debug!(slot, error = %err, "soft engine could not paint slot");
        }
    }
}

impl DecodeEngine for SoftDecodeEngine {
    fn init(&self, params: &SessionParams, header: Option<&[u8]>) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_init.take() {
            return Err(EngineCode(code));
        }
        debug!(
            codec = %params.codec,
            width = params.width,
            height = params.height,
            header_len = header.map_or(0, <[u8]>::len),
            "soft decode engine initialized"
        );
        state.params = Some(params.clone());
        Ok(())
    }

    fn release(&self, slot: usize, buffer: &PhysicalBuffer) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_release.take() {
            return Err(EngineCode(code));
        }
        if state.tokens.len() <= slot {
            state.tokens.resize(slot + 1, None);
        }
        state.tokens[slot] = Some(buffer.token());
        state.free.insert(slot);
        state.releases.push(slot);
        if self.mode == SoftMode::Autonomous {
            self.decode_pending(&mut state);
        }
        Ok(())
    }

    fn write_header(&self, header: &[u8]) -> EngineResult<()> {
        let mut state = self.state.lock();
        state.header_writes += 1;
        state.last_header = Some(Bytes::copy_from_slice(header));
        Ok(())
    }

    fn submit(&self, data: &[u8], timestamp: u64) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_submit.take() {
            return Err(EngineCode(code));
        }
        trace!(len = data.len(), timestamp, "soft packet accepted");
        state.submissions.push(timestamp);
        state.pending.push_back(timestamp);
        if self.mode == SoftMode::Autonomous {
            self.decode_pending(&mut state);
        }
        Ok(())
    }

    fn poll(&self) -> Option<Completion> {
        self.state.lock().ready.pop_front()
    }

    fn frames_in_flight(&self) -> bool {
        let state = self.state.lock();
        !state.ready.is_empty() || !state.pending.is_empty()
    }

    fn reset(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_reset.take() {
            return Err(EngineCode(code));
        }
        state.pending.clear();
        let abandoned: Vec<usize> = state.ready.drain(..).map(|c| c.slot).collect();
        state.free.extend(abandoned);
        state.resets += 1;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "soft-decode"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionflow_core::codec_traits::Packet;
    use ionflow_core::context::DeviceContext;
    use ionflow_core::types::PixelFormat;

    use crate::codec::CodecKind;
    use crate::pump::{DecodePump, DecoderConfig, PollOutput};

    #[test]
    fn autonomous_engine_waits_for_free_slots() {
        let engine = Arc::new(SoftDecodeEngine::new(SoftMode::Autonomous));
        let ctx = DeviceContext::new(HeapAllocator::new());
        let mut config = DecoderConfig::new(CodecKind::H264, 32, 32);
        config.pool_capacity = 1;
        let mut pump = DecodePump::open(&ctx, engine.clone(), config).expect("pump");

        pump.submit(&Packet::new(vec![1u8], 0)).expect("p1");
        pump.submit(&Packet::new(vec![2u8], 40_000)).expect("p2");
        let first = pump.poll_output().expect("poll").into_frame().expect("first");
        assert!(matches!(pump.poll_output().expect("poll"), PollOutput::WouldBlock));
        assert!(engine.frames_in_flight());

        drop(first);
        let second = pump.poll_output().expect("poll").into_frame().expect("second");
        assert_eq!(second.timestamp(), 3_601);
    }

    #[test]
    fn heap_backed_engine_paints_frames() {
        let heap = HeapAllocator::new();
        let ctx = DeviceContext::new(heap.clone());
        let engine = Arc::new(SoftDecodeEngine::with_heap(SoftMode::Autonomous, heap));
        let mut config = DecoderConfig::new(CodecKind::Hevc, 8, 4);
        config.output_format = PixelFormat::Nv12;
        let mut pump = DecodePump::open(&ctx, engine, config).expect("pump");

        pump.submit(&Packet::new(vec![0u8; 4], 0)).expect("submit");
        let frame = pump.poll_output().expect("poll").into_frame().expect("frame");
        let mapped = frame.map().expect("map");
        let luma = mapped.plane(0).expect("luma");
        assert_eq!(&luma[..4], &[1, 2, 3, 4]);
        assert!(mapped.plane(1).expect("chroma").iter().all(|&b| b == 128));
    }

    #[test]
    fn zero_area_pictures_are_recycled() {
        let engine = Arc::new(SoftDecodeEngine::new(SoftMode::Autonomous));
        let ctx = DeviceContext::new(HeapAllocator::new());
        let mut config = DecoderConfig::new(CodecKind::H264, 16, 16);
        config.pool_capacity = 1;
        let mut pump = DecodePump::open(&ctx, engine.clone(), config).expect("pump");
        engine.emit_zero_area(1);

        pump.submit(&Packet::new(vec![1u8], 0)).expect("p1");
        pump.submit(&Packet::new(vec![2u8], 40_000)).expect("p2");
        // The zero-area picture frees its slot, which decodes the next packet.
        assert!(matches!(pump.poll_output().expect("poll"), PollOutput::WouldBlock));
        let frame = pump.poll_output().expect("poll").into_frame().expect("frame");
        assert_eq!(frame.timestamp(), 3_601);
    }

    #[test]
    fn scripted_completion_requires_engine_ownership() {
        let engine = SoftDecodeEngine::new(SoftMode::Scripted);
        assert!(!engine.complete(0, 16, 16));
        let heap = HeapAllocator::new();
        let buffer = PhysicalBuffer::allocate(heap, 64).expect("alloc");
        engine.release(0, &buffer).expect("release");
        assert!(engine.complete_with(0, 16, 16, 7));
        assert!(!engine.complete(0, 16, 16));
        assert_eq!(engine.poll().map(|c| c.timestamp), Some(7));
    }
}
