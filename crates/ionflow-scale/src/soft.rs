//! Nearest-neighbour blit engine over [`HeapAllocator`] buffers.
//!
//! Scales each plane independently in the surface's own format.  Format
//! conversion and rotation are refused with `-EINVAL`, as is any blit whose
//! buffers are currently mapped by a consumer (`-EBUSY`).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use ionflow_core::alloc::HeapAllocator;
use ionflow_core::context::{DEVICE_FORMATS, GeometryLimits};
use ionflow_core::error::EngineCode;
use ionflow_core::types::{PixelFormat, ceil_rshift};

use crate::blit::{BlitEngine, BlitRequest, BlitResult, Rotation, Surface};

const EINVAL: i32 = -22;
const EBUSY: i32 = -16;

pub const DEFAULT_LIMITS: GeometryLimits = GeometryLimits {
    min_width: 2,
    min_height: 2,
    max_width: 8192,
    max_height: 8192,
};

pub struct SoftBlitEngine {
    heap: Arc<HeapAllocator>,
    limits: GeometryLimits,
    fail_next: Mutex<Option<i32>>,
}

impl SoftBlitEngine {
    pub fn new(heap: Arc<HeapAllocator>) -> Self {
        Self::with_limits(heap, DEFAULT_LIMITS)
    }

    pub fn with_limits(heap: Arc<HeapAllocator>, limits: GeometryLimits) -> Self {
        Self {
            heap,
            limits,
            fail_next: Mutex::new(None),
        }
    }

    /// Make the next blit fail with `code`.
    pub fn fail_next(&self, code: i32) {
        *self.fail_next.lock() = Some(code);
    }
}

fn surface_format(surface: &Surface) -> Option<PixelFormat> {
    DEVICE_FORMATS
        .iter()
        .find(|e| e.engine_code == surface.format_code)
        .map(|e| e.format)
}

fn scale_planes(format: PixelFormat, src: &Surface, dst: &Surface, from: &[u8], to: &mut [u8]) {
    let src_layout = format.plane_layout(src.rect.width, src.rect.height);
    let dst_layout = format.plane_layout(dst.rect.width, dst.rect.height);
    for (index, desc) in format.planes().iter().enumerate() {
        let (s, d) = (src_layout[index], dst_layout[index]);
        let unit = desc.unit_bytes;
        let src_units = ceil_rshift(src.rect.width, desc.h_shift) as usize;
        let dst_units = ceil_rshift(dst.rect.width, desc.h_shift) as usize;
        for dy in 0..d.rows {
            let sy = dy * s.rows / d.rows;
            for dx in 0..dst_units {
                let sx = dx * src_units / dst_units;
                let from_at = s.offset + sy * s.linesize + sx * unit;
                let to_at = d.offset + dy * d.linesize + dx * unit;
                if let (Some(px), Some(out)) =
                    (from.get(from_at..from_at + unit), to.get_mut(to_at..to_at + unit))
                {
                    out.copy_from_slice(px);
                }
            }
        }
    }
}

impl BlitEngine for SoftBlitEngine {
    fn limits(&self) -> GeometryLimits {
        self.limits
    }

    fn stretch_blit(&self, request: &BlitRequest) -> BlitResult {
        if let Some(code) = self.fail_next.lock().take() {
            return Err(EngineCode(code));
        }
        let (src, dst) = (&request.src, &request.dst);
        if request.rotation != Rotation::Deg0 || src.format_code != dst.format_code {
            return Err(EngineCode(EINVAL));
        }
        let Some(format) = surface_format(src) else {
            return Err(EngineCode(EINVAL));
        };
        if !self.limits.contains(dst.rect.width, dst.rect.height)
            || src.rect.width == 0
            || src.rect.height == 0
        {
            return Err(EngineCode(EINVAL));
        }

        trace!(
            src = %src.token,
            dst = %dst.token,
            format = %format,
            src_w = src.rect.width,
            src_h = src.rect.height,
            dst_w = dst.rect.width,
            dst_h = dst.rect.height,
            "soft stretch blit"
        );
        self.heap
            .with_blocks(src.token, dst.token, |from, to| {
                scale_planes(format, src, dst, from, to)
            })
            .map_err(|err| {
                warn!(error = %err, "soft blit could not access buffers");
                EngineCode(EBUSY)
            })
    }

    fn name(&self) -> &'static str {
        "soft-blit"
    }
}
