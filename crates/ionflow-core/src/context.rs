//! Shared device context: allocator, device format table, geometry
//! constraints and memory accounting.
//!
//! Every pool allocation goes through the context (it implements
//! [`PhysicalAllocator`] by wrapping the backend allocator), so current and
//! peak device memory are tracked in one place.  A configured memory limit
//! either warns (default) or fails the allocation when strict.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alloc::{BufferToken, PhysicalAllocator};
use crate::error::{EngineError, Result};
use crate::types::PixelFormat;

// ─── Device format table ─────────────────────────────────────────────────────

/// Mapping between a [`PixelFormat`] and the blit engine's format code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FormatEntry {
    pub engine_code: u32,
    pub format: PixelFormat,
}

const fn entry(engine_code: u32, format: PixelFormat) -> FormatEntry {
    FormatEntry {
        engine_code,
        format,
    }
}

/// Formats the 2D engine accepts, in device order.
pub const DEVICE_FORMATS: [FormatEntry; 10] = [
    entry(1, PixelFormat::Rgba),
    entry(2, PixelFormat::Rgb0),
    entry(3, PixelFormat::Rgb24),
    entry(4, PixelFormat::Rgb565),
    entry(5, PixelFormat::Bgra),
    entry(0x3231_5659, PixelFormat::Yuv420p),
    entry(0x2020_3859, PixelFormat::Gray8),
    entry(0x10, PixelFormat::Nv16),
    entry(0x11, PixelFormat::Nv21),
    entry(0x14, PixelFormat::Yuyv422),
];

// ─── Geometry constraints ────────────────────────────────────────────────────

/// Inclusive frame size bounds declared by an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryLimits {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl GeometryLimits {
    pub fn contains(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }

    pub fn check(&self, width: u32, height: u32) -> Result<()> {
        if self.contains(width, height) {
            return Ok(());
        }
        Err(EngineError::InvalidGeometry {
            width,
            height,
            min_width: self.min_width,
            min_height: self.min_height,
            max_width: self.max_width,
            max_height: self.max_height,
        })
    }
}

/// What a frames context on this device may hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameConstraints {
    pub valid_formats: Vec<PixelFormat>,
    pub limits: GeometryLimits,
}

impl FrameConstraints {
    pub fn check_format(&self, format: PixelFormat) -> Result<()> {
        if self.valid_formats.contains(&format) {
            Ok(())
        } else {
            Err(EngineError::UnsupportedFormat(format))
        }
    }
}

// ─── Memory accounting ───────────────────────────────────────────────────────

/// Atomic device-memory byte counters.  Lock-free reads.
struct MemoryAccounting {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryAccounting {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    fn on_free(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        (
            self.current.load(Ordering::Relaxed),
            self.peak.load(Ordering::Relaxed),
        )
    }
}

/// Returns `Ok(true)` when the allocation would exceed the limit in
/// warn-only mode.
fn check_memory_limit(
    strict: bool,
    limit: Option<usize>,
    current: usize,
    requested: usize,
) -> Result<bool> {
    let Some(limit_bytes) = limit.filter(|limit| *limit > 0) else {
        return Ok(false);
    };
    if current.saturating_add(requested) <= limit_bytes {
        return Ok(false);
    }
    if strict {
        return Err(EngineError::MemoryLimitExceeded {
            limit_bytes,
            current_bytes: current,
            requested_bytes: requested,
        });
    }
    Ok(true)
}

// ─── Device context ──────────────────────────────────────────────────────────

/// Long-lived device context shared by every pool and engine of a session.
pub struct DeviceContext {
    backend: Arc<dyn PhysicalAllocator>,
    formats: Vec<FormatEntry>,
    memory: MemoryAccounting,
    memory_limit: AtomicUsize,
    strict_memory_limit: AtomicBool,
}

impl DeviceContext {
    /// Context over `backend` with the standard device format table.
    pub fn new(backend: Arc<dyn PhysicalAllocator>) -> Arc<Self> {
        Self::with_formats(backend, DEVICE_FORMATS.to_vec())
    }

    pub fn with_formats(backend: Arc<dyn PhysicalAllocator>, formats: Vec<FormatEntry>) -> Arc<Self> {
        info!(
            backend = backend.name(),
            formats = formats.len(),
            "Device context created"
        );
        Arc::new(Self {
            backend,
            formats,
            memory: MemoryAccounting::new(),
            memory_limit: AtomicUsize::new(0),
            strict_memory_limit: AtomicBool::new(false),
        })
    }

    /// This context as an accounted allocator for [`PhysicalBuffer`](crate::alloc::PhysicalBuffer).
    pub fn allocator(self: &Arc<Self>) -> Arc<dyn PhysicalAllocator> {
        self.clone()
    }

    pub fn formats(&self) -> &[FormatEntry] {
        &self.formats
    }

    pub fn supports(&self, format: PixelFormat) -> bool {
        self.engine_code(format).is_some()
    }

    pub fn engine_code(&self, format: PixelFormat) -> Option<u32> {
        self.formats
            .iter()
            .find(|e| e.format == format)
            .map(|e| e.engine_code)
    }

    pub fn format_for_code(&self, engine_code: u32) -> Option<PixelFormat> {
        self.formats
            .iter()
            .find(|e| e.engine_code == engine_code)
            .map(|e| e.format)
    }

    /// Host transfer formats with `preferred` first.
    pub fn transfer_formats(&self, preferred: PixelFormat) -> Vec<PixelFormat> {
        std::iter::once(preferred)
            .chain(
                self.formats
                    .iter()
                    .map(|e| e.format)
                    .filter(|f| *f != preferred),
            )
            .collect()
    }

    pub fn frame_constraints(&self, limits: GeometryLimits) -> FrameConstraints {
        FrameConstraints {
            valid_formats: self.formats.iter().map(|e| e.format).collect(),
            limits,
        }
    }

    /// Current and peak bytes allocated through this context.
    #[inline]
    pub fn memory_usage(&self) -> (usize, usize) {
        self.memory.snapshot()
    }

    /// Set a device memory cap (bytes).  0 = unlimited.
    pub fn set_memory_limit(&self, limit_bytes: usize) {
        self.memory_limit.store(limit_bytes, Ordering::Relaxed);
        info!(limit_bytes, "Device memory limit set");
    }

    /// Enable/disable hard-fail behavior when the memory limit would be exceeded.
    pub fn set_strict_memory_limit(&self, enabled: bool) {
        self.strict_memory_limit.store(enabled, Ordering::Relaxed);
        info!(enabled, "Strict device memory limit enforcement");
    }

    pub fn health_snapshot(&self) -> DeviceSnapshot {
        let (current, peak) = self.memory.snapshot();
        DeviceSnapshot {
            backend: self.backend.name(),
            memory_current_bytes: current,
            memory_peak_bytes: peak,
            memory_limit_bytes: self.memory_limit.load(Ordering::Relaxed),
            formats: self.formats.len(),
        }
    }

    pub fn report(&self) {
        let (current, peak) = self.memory.snapshot();
        info!(
            backend = self.backend.name(),
            memory_current_kb = current / 1024,
            memory_peak_kb = peak / 1024,
            memory_limit_kb = self.memory_limit.load(Ordering::Relaxed) / 1024,
            "Device memory report"
        );
    }
}

impl PhysicalAllocator for DeviceContext {
    fn alloc(&self, size: usize) -> Result<BufferToken> {
        let (current, _) = self.memory.snapshot();
        let limit = match self.memory_limit.load(Ordering::Relaxed) {
            0 => None,
            limit => Some(limit),
        };
        let would_exceed = check_memory_limit(
            self.strict_memory_limit.load(Ordering::Relaxed),
            limit,
            current,
            size,
        )?;
        let token = self.backend.alloc(size)?;
        self.memory.on_alloc(size);
        if would_exceed {
            warn!(
                current_bytes = current,
                requested_bytes = size,
                limit_bytes = limit.unwrap_or(0),
                "Device memory would exceed configured limit; continuing because strict limit is off"
            );
        }
        Ok(token)
    }

    fn free(&self, token: BufferToken, size: usize) {
        self.backend.free(token, size);
        self.memory.on_free(size);
    }

    fn map(&self, token: BufferToken, size: usize) -> Result<NonNull<u8>> {
        self.backend.map(token, size)
    }

    fn unmap(&self, token: BufferToken, addr: NonNull<u8>, size: usize) {
        self.backend.unmap(token, addr, size)
    }

    fn name(&self) -> &'static str {
        self.backend.name()
    }
}

/// Immutable snapshot of device memory for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub backend: &'static str,
    pub memory_current_bytes: usize,
    pub memory_peak_bytes: usize,
    pub memory_limit_bytes: usize,
    pub formats: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{HeapAllocator, PhysicalBuffer};

    const LIMITS: GeometryLimits = GeometryLimits {
        min_width: 2,
        min_height: 2,
        max_width: 8192,
        max_height: 8192,
    };

    #[test]
    fn format_table_round_trips_codes() {
        let ctx = DeviceContext::new(HeapAllocator::new());
        assert_eq!(ctx.engine_code(PixelFormat::Nv21), Some(0x11));
        assert_eq!(ctx.engine_code(PixelFormat::Yuv420p), Some(0x3231_5659));
        assert_eq!(ctx.format_for_code(0x2020_3859), Some(PixelFormat::Gray8));
        assert!(!ctx.supports(PixelFormat::Nv12));
    }

    #[test]
    fn transfer_formats_put_preferred_first() {
        let ctx = DeviceContext::new(HeapAllocator::new());
        let formats = ctx.transfer_formats(PixelFormat::Nv21);
        assert_eq!(formats[0], PixelFormat::Nv21);
        assert_eq!(formats.len(), DEVICE_FORMATS.len());
        assert_eq!(
            formats.iter().filter(|f| **f == PixelFormat::Nv21).count(),
            1
        );
    }

    #[test]
    fn constraints_reject_out_of_range_geometry() {
        let ctx = DeviceContext::new(HeapAllocator::new());
        let constraints = ctx.frame_constraints(LIMITS);
        assert!(constraints.limits.check(1920, 1080).is_ok());
        assert!(constraints.limits.check(2, 2).is_ok());
        let err = constraints.limits.check(1, 1080).expect_err("too narrow");
        assert!(matches!(err, EngineError::InvalidGeometry { width: 1, .. }));
        assert!(constraints.limits.check(8193, 16).is_err());
        assert!(matches!(
            constraints.check_format(PixelFormat::Nv12),
            Err(EngineError::UnsupportedFormat(PixelFormat::Nv12))
        ));
    }

    #[test]
    fn accounting_tracks_current_and_peak() {
        let ctx = DeviceContext::new(HeapAllocator::new());
        let a = PhysicalBuffer::allocate(ctx.allocator(), 1_000).expect("a");
        let b = PhysicalBuffer::allocate(ctx.allocator(), 500).expect("b");
        assert_eq!(ctx.memory_usage(), (1_500, 1_500));
        drop(a);
        assert_eq!(ctx.memory_usage(), (500, 1_500));
        drop(b);
        assert_eq!(ctx.memory_usage().0, 0);
    }

    #[test]
    fn memory_limit_warn_only_mode_preserves_success() {
        let over = check_memory_limit(false, Some(1_024), 900, 200).expect("warn-only");
        assert!(over);
    }

    #[test]
    fn memory_limit_strict_mode_fails_when_exceeded() {
        let err = check_memory_limit(true, Some(1_024), 900, 200).expect_err("strict");
        match err {
            EngineError::MemoryLimitExceeded {
                limit_bytes,
                current_bytes,
                requested_bytes,
            } => {
                assert_eq!(limit_bytes, 1_024);
                assert_eq!(current_bytes, 900);
                assert_eq!(requested_bytes, 200);
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert!(!check_memory_limit(true, Some(1_024), 824, 200).expect("boundary"));
    }

    #[test]
    fn strict_limit_blocks_context_allocation() {
        let ctx = DeviceContext::new(HeapAllocator::new());
        ctx.set_memory_limit(1_000);
        ctx.set_strict_memory_limit(true);
        let _a = PhysicalBuffer::allocate(ctx.allocator(), 800).expect("fits");
        let err = PhysicalBuffer::allocate(ctx.allocator(), 800).expect_err("over limit");
        assert_eq!(err.error_code(), 101);
        assert_eq!(ctx.health_snapshot().memory_current_bytes, 800);
    }
}
