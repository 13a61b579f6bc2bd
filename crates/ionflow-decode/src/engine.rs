//! The seam between the decode pump and a hardware decode engine.
//!
//! Engine calls are synchronous and report failures as opaque
//! [`EngineCode`]s.  The pump owns the mapping into [`EngineError`].
//!
//! Slot ownership: after `init`, the pump hands every pool slot to the engine
//! with [`DecodeEngine::release`].  The engine reports filled slots through
//! [`DecodeEngine::poll`]; a reported slot belongs to the pool until it is
//! handed back with `release` again (by [`EngineRecycler`] when the last
//! consumer handle drops).

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use ionflow_core::alloc::PhysicalBuffer;
use ionflow_core::error::{EngineCode, EngineError, Result};
use ionflow_core::pool::SlotRecycler;
use ionflow_core::types::PixelFormat;

use crate::codec::{CodecKind, StreamFormat, StreamType};

pub type EngineResult<T> = std::result::Result<T, EngineCode>;

/// Everything the engine needs to start a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionParams {
    pub codec: CodecKind,
    pub stream_type: StreamType,
    pub stream_format: StreamFormat,
    /// Coded width (unaligned).
    pub width: u32,
    pub height: u32,
    /// Frame duration in 90 kHz ticks, 0 when unknown.
    pub rate: u32,
    pub output_format: PixelFormat,
    #[serde(skip)]
    pub extradata: Bytes,
}

/// One decoded picture reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub timestamp: u64,
}

pub trait DecodeEngine: Send + Sync {
    /// Start a session; `header` is the reconstructed parameter-set blob.
    fn init(&self, params: &SessionParams, header: Option<&[u8]>) -> EngineResult<()>;

    /// Give slot `slot` (backed by `buffer`) to the engine for decoding into.
    fn release(&self, slot: usize, buffer: &PhysicalBuffer) -> EngineResult<()>;

    /// Write the out-of-band header ahead of the next packet.
    fn write_header(&self, header: &[u8]) -> EngineResult<()>;

    /// Submit one compressed packet stamped with an engine timestamp.
    fn submit(&self, data: &[u8], timestamp: u64) -> EngineResult<()>;

    /// Next completed picture, if any.
    fn poll(&self) -> Option<Completion>;

    /// Whether submitted work may still produce pictures.
    fn frames_in_flight(&self) -> bool;

    /// Discard in-flight state.  Slots reported but not yet recycled stay
    /// with their consumers.
    fn reset(&self) -> EngineResult<()>;

    fn name(&self) -> &'static str {
        "decode-engine"
    }
}

/// Pool recycler that hands released slots back to the engine.
pub struct EngineRecycler<E: DecodeEngine> {
    engine: Arc<E>,
}

impl<E: DecodeEngine> EngineRecycler<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

impl<E: DecodeEngine> SlotRecycler for EngineRecycler<E> {
    fn recycle(&self, index: usize, buffer: &PhysicalBuffer) -> Result<()> {
        self.engine
            .release(index, buffer)
            .map_err(|code| EngineError::EngineFailure {
                op: "release",
                code: code.0,
            })
    }
}
