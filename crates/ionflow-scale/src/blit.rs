//! 2D blit engine seam.
//!
//! Surfaces are described by the physical buffer token and the engine's own
//! format code, never by a mapped address: the engine reads and writes the
//! buffers directly.

use ionflow_core::alloc::BufferToken;
use ionflow_core::context::GeometryLimits;
use ionflow_core::error::EngineCode;

pub type BlitResult = std::result::Result<(), EngineCode>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// One side of a blit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Surface {
    pub token: BufferToken,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Device format code (see `DeviceContext::engine_code`).
    pub format_code: u32,
    pub rect: Rect,
}

/// A stretch blit from `src.rect` into `dst.rect`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlitRequest {
    pub src: Surface,
    pub dst: Surface,
    pub rotation: Rotation,
}

pub trait BlitEngine: Send + Sync {
    /// Output sizes the engine can produce.
    fn limits(&self) -> GeometryLimits;

    /// Run one blit synchronously.
    fn stretch_blit(&self, request: &BlitRequest) -> BlitResult;

    fn name(&self) -> &'static str {
        "blit-engine"
    }
}
