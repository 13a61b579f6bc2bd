//! Fixed-capacity hardware buffer pool and the ref-counted buffer handle.
//!
//! # Ownership protocol
//!
//! Every slot is either [`SlotState::FreeWithEngine`] or
//! [`SlotState::OwnedByConsumer`].  A slot becomes owned only through
//! [`BufferPool::mark_ready`] (engine output with a non-zero area) or
//! [`BufferPool::acquire_free`] (engine-less output pools), and each of those
//! creates exactly one [`DecodedBuffer`].
//!
//! A `DecodedBuffer` is an `Arc` over a private lease.  `share()` / `clone()`
//! adds a consumer, dropping (or `release()`) removes one, and the lease's
//! `Drop` hands the slot back exactly once when the last consumer goes away.
//! Double recycle cannot happen because only the lease's destructor
//! releases an owned slot.
//!
//! The lease holds a strong reference to the pool internals, so the pool and
//! its physical buffers outlive every handle.  The pool holds no reference to
//! its handles.
//!
//! # Locking
//!
//! The slot table is one `parking_lot::Mutex`.  The engine recycler is always
//! invoked after the table lock is released.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::alloc::{BufferToken, MappedRegion, PhysicalBuffer};
use crate::context::DeviceContext;
use crate::error::{EngineError, Result};
use crate::host::HostFrame;
use crate::types::{
    BUFFER_LINE_ALIGN, PixelFormat, PlaneLayout, UNKNOWN_TIMESTAMP, engine_timestamp_to_micros,
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a slot to the engine that fills it.
///
/// The decode session installs one of these on its pool; output pools of the
/// scale stage have none.  Called from whichever thread drops the last
/// handle, never with the slot table locked.
pub trait SlotRecycler: Send + Sync {
    fn recycle(&self, index: usize, buffer: &PhysicalBuffer) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    FreeWithEngine,
    OwnedByConsumer,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub capacity: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl PoolConfig {
    pub fn new(capacity: usize, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            capacity,
            width,
            height,
            format,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.format
            .buffer_size(self.width, self.height, BUFFER_LINE_ALIGN)
    }
}

/// Metadata carried by a [`DecodedBuffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FrameMeta {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Engine-clock timestamp; [`UNKNOWN_TIMESTAMP`] when absent.
    pub timestamp: u64,
}

// ─── Statistics ──────────────────────────────────────────────────────────────

/// Lock-free pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Handles created by `mark_ready`/`acquire_free`.
    pub handed_out: AtomicU64,
    /// Zero-area engine outputs sent straight back.
    pub not_ready: AtomicU64,
    /// Slots returned after their last handle dropped.
    pub recycled: AtomicU64,
    /// Recycler calls that failed.
    pub recycle_failures: AtomicU64,
    /// `acquire_free` calls that found no free slot.
    pub exhausted: AtomicU64,
}

/// Serializable view of a pool for reports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub id: u64,
    pub label: &'static str,
    pub capacity: usize,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_size: usize,
    pub owned: usize,
    pub handed_out: u64,
    pub not_ready: u64,
    pub recycled: u64,
    pub recycle_failures: u64,
    pub exhausted: u64,
}

// ─── Pool ────────────────────────────────────────────────────────────────────

struct PoolInner {
    id: u64,
    label: &'static str,
    config: PoolConfig,
    buffer_size: usize,
    slots: Vec<PhysicalBuffer>,
    states: Mutex<Vec<SlotState>>,
    recycler: Option<Arc<dyn SlotRecycler>>,
    stats: PoolStats,
    ctx: Arc<DeviceContext>,
}

impl PoolInner {
    fn check_index(&self, index: usize) -> Result<()> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(EngineError::SlotOutOfRange {
                index,
                capacity: self.slots.len(),
            })
        }
    }

    /// Last handle for `index` dropped.
    fn release_slot(&self, index: usize) {
        {
            let mut states = self.states.lock();
            match states.get_mut(index) {
                Some(state) if *state == SlotState::OwnedByConsumer => {
                    *state = SlotState::FreeWithEngine;
                }
                other => {
                    error!(pool = self.id, index, state = ?other, "release of a slot that is not owned");
                    return;
                }
            }
        }
        self.stats.recycled.fetch_add(1, Ordering::Relaxed);
        debug!(pool = self.id, index, "slot released");
        self.hand_back(index);
    }

    fn hand_back(&self, index: usize) {
        let Some(recycler) = &self.recycler else {
            return;
        };
        if let Err(err) = recycler.recycle(index, &self.slots[index]) {
            self.stats.recycle_failures.fetch_add(1, Ordering::Relaxed);
            warn!(pool = self.id, index, error = %err, "engine refused recycled slot");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        debug!(
            pool = self.id,
            label = self.label,
            capacity = self.slots.len(),
            "buffer pool destroyed"
        );
    }
}

/// Fixed set of physical buffers shared with a hardware engine.
///
/// Cloning a `BufferPool` is cheap and refers to the same slots.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Allocate `config.capacity` buffers up front.
    ///
    /// Fails with [`EngineError::AllocFailure`] (or the context's
    /// memory-limit error) if any buffer cannot be allocated; buffers that
    /// were already allocated are freed.
    pub fn create(
        ctx: &Arc<DeviceContext>,
        label: &'static str,
        config: PoolConfig,
        recycler: Option<Arc<dyn SlotRecycler>>,
    ) -> Result<Self> {
        if config.capacity == 0 {
            return Err(EngineError::Config(format!(
                "{label} pool capacity must be at least 1"
            )));
        }
        if config.width == 0 || config.height == 0 {
            return Err(EngineError::Config(format!(
                "{label} pool size {}x{} not supported",
                config.width, config.height
            )));
        }

        let buffer_size = config.buffer_size();
        let mut slots = Vec::with_capacity(config.capacity);
        for index in 0..config.capacity {
            match PhysicalBuffer::allocate(ctx.allocator(), buffer_size) {
                Ok(buf) => slots.push(buf),
                Err(err) => {
                    error!(
                        label,
                        index,
                        buffer_size,
                        capacity = config.capacity,
                        error = %err,
                        "buffer pool allocation failed"
                    );
                    return Err(err);
                }
            }
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            pool = id,
            label,
            capacity = config.capacity,
            width = config.width,
            height = config.height,
            format = %config.format,
            buffer_size,
            "buffer pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                label,
                states: Mutex::new(vec![SlotState::FreeWithEngine; config.capacity]),
                config,
                buffer_size,
                slots,
                recycler,
                stats: PoolStats::default(),
                ctx: ctx.clone(),
            }),
        })
    }

    /// The physical buffer of a free slot, for attaching to the engine.
    pub fn acquire_for_engine(&self, index: usize) -> Result<&PhysicalBuffer> {
        self.inner.check_index(index)?;
        if self.inner.states.lock()[index] == SlotState::OwnedByConsumer {
            return Err(EngineError::SlotBusy(index));
        }
        Ok(&self.inner.slots[index])
    }

    /// Turn engine output in `index` into a handle.
    ///
    /// A zero-area result means the engine produced nothing in that slot: it
    /// is handed straight back and `Ok(None)` (not ready) is returned.
    pub fn mark_ready(
        &self,
        index: usize,
        width: u32,
        height: u32,
        timestamp: u64,
    ) -> Result<Option<DecodedBuffer>> {
        let inner = &self.inner;
        inner.check_index(index)?;

        // A slot a consumer still holds is never handed back or re-issued.
        let oversized = width > inner.config.width || height > inner.config.height;
        {
            let mut states = inner.states.lock();
            if states[index] == SlotState::OwnedByConsumer {
                return Err(EngineError::SlotBusy(index));
            }
            if width != 0 && height != 0 && !oversized {
                states[index] = SlotState::OwnedByConsumer;
            }
        }

        if width == 0 || height == 0 {
            inner.stats.not_ready.fetch_add(1, Ordering::Relaxed);
            debug!(pool = inner.id, index, width, height, "zero-area output recycled");
            inner.hand_back(index);
            return Ok(None);
        }
        if oversized {
            inner.hand_back(index);
            return Err(EngineError::InvariantViolation(format!(
                "engine reported {width}x{height} in slot {index} of a {}x{} pool",
                inner.config.width, inner.config.height
            )));
        }
        inner.stats.handed_out.fetch_add(1, Ordering::Relaxed);
        Ok(Some(DecodedBuffer::new(
            inner.clone(),
            index,
            FrameMeta {
                width,
                height,
                format: inner.config.format,
                timestamp,
            },
        )))
    }

    /// Take the lowest free slot of an engine-less pool.
    ///
    /// `Ok(None)` when every slot is owned.  Pools with a recycler belong to
    /// their engine and refuse this call.
    pub fn acquire_free(&self) -> Result<Option<DecodedBuffer>> {
        let inner = &self.inner;
        if inner.recycler.is_some() {
            return Err(EngineError::InvariantViolation(format!(
                "{} pool slots are owned by its engine",
                inner.label
            )));
        }
        let index = {
            let mut states = inner.states.lock();
            let Some(index) = states
                .iter()
                .position(|s| *s == SlotState::FreeWithEngine)
            else {
                inner.stats.exhausted.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            };
            states[index] = SlotState::OwnedByConsumer;
            index
        };
        inner.stats.handed_out.fetch_add(1, Ordering::Relaxed);
        Ok(Some(DecodedBuffer::new(
            inner.clone(),
            index,
            FrameMeta {
                width: inner.config.width,
                height: inner.config.height,
                format: inner.config.format,
                timestamp: UNKNOWN_TIMESTAMP,
            },
        )))
    }

    /// Idempotent recycle: a no-op for free slots.
    ///
    /// Owned slots are released only by their handle; asking to recycle one
    /// fails with [`EngineError::SlotBusy`].
    pub fn recycle(&self, index: usize) -> Result<()> {
        self.inner.check_index(index)?;
        match self.inner.states.lock()[index] {
            SlotState::FreeWithEngine => Ok(()),
            SlotState::OwnedByConsumer => Err(EngineError::SlotBusy(index)),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn width(&self) -> u32 {
        self.inner.config.width
    }

    pub fn height(&self) -> u32 {
        self.inner.config.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.config.format
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.inner.ctx
    }

    pub fn buffer(&self, index: usize) -> Option<&PhysicalBuffer> {
        self.inner.slots.get(index)
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.inner.states.lock().get(index).copied()
    }

    pub fn owned_slots(&self) -> usize {
        self.inner
            .states
            .lock()
            .iter()
            .filter(|s| **s == SlotState::OwnedByConsumer)
            .count()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let stats = &self.inner.stats;
        let config = &self.inner.config;
        PoolSnapshot {
            id: self.inner.id,
            label: self.inner.label,
            capacity: self.capacity(),
            width: config.width,
            height: config.height,
            format: config.format,
            buffer_size: self.inner.buffer_size,
            owned: self.owned_slots(),
            handed_out: stats.handed_out.load(Ordering::Relaxed),
            not_ready: stats.not_ready.load(Ordering::Relaxed),
            recycled: stats.recycled.load(Ordering::Relaxed),
            recycle_failures: stats.recycle_failures.load(Ordering::Relaxed),
            exhausted: stats.exhausted.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            pool = s.id,
            label = s.label,
            capacity = s.capacity,
            owned = s.owned,
            handed_out = s.handed_out,
            not_ready = s.not_ready,
            recycled = s.recycled,
            recycle_failures = s.recycle_failures,
            exhausted = s.exhausted,
            "Buffer pool report"
        );
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("config", &self.inner.config)
            .finish()
    }
}

// ─── Handle ──────────────────────────────────────────────────────────────────

struct SlotLease {
    pool: Arc<PoolInner>,
    index: usize,
    meta: FrameMeta,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release_slot(self.index);
    }
}

/// Reference-counted capability over one owned pool slot.
///
/// Clones share the slot; the slot is recycled when the last clone drops.
#[derive(Clone)]
pub struct DecodedBuffer {
    lease: Arc<SlotLease>,
}

impl DecodedBuffer {
    fn new(pool: Arc<PoolInner>, index: usize, meta: FrameMeta) -> Self {
        Self {
            lease: Arc::new(SlotLease { pool, index, meta }),
        }
    }

    /// Add a consumer.  Same as `clone()`.
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// Drop this consumer's reference.
    pub fn release(self) {
        drop(self);
    }

    /// Live consumers of this slot.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.lease)
    }

    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    pub fn index(&self) -> usize {
        self.lease.index
    }

    pub fn meta(&self) -> FrameMeta {
        self.lease.meta
    }

    pub fn width(&self) -> u32 {
        self.lease.meta.width
    }

    pub fn height(&self) -> u32 {
        self.lease.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.lease.meta.format
    }

    pub fn timestamp(&self) -> u64 {
        self.lease.meta.timestamp
    }

    /// Timestamp converted back to microseconds.
    pub fn pts_micros(&self) -> Option<i64> {
        engine_timestamp_to_micros(self.lease.meta.timestamp)
    }

    pub fn pool_id(&self) -> u64 {
        self.lease.pool.id
    }

    /// Geometry of the pool this slot belongs to.
    pub fn pool_config(&self) -> &PoolConfig {
        &self.lease.pool.config
    }

    pub fn physical(&self) -> &PhysicalBuffer {
        &self.lease.pool.slots[self.lease.index]
    }

    pub fn token(&self) -> BufferToken {
        self.physical().token()
    }

    /// Copy the timestamp of `src`.  Requires exclusive ownership.
    pub fn copy_props_from(&mut self, src: &DecodedBuffer) -> Result<()> {
        let timestamp = src.timestamp();
        self.exclusive()?.meta.timestamp = timestamp;
        Ok(())
    }

    fn exclusive(&mut self) -> Result<&mut SlotLease> {
        let holders = Arc::strong_count(&self.lease);
        Arc::get_mut(&mut self.lease).ok_or(EngineError::SharedBuffer { holders })
    }

    /// Read-only CPU mapping.
    pub fn map(&self) -> Result<MappedFrame<'_>> {
        MappedFrame::new(self.physical().map()?, self.meta(), false)
    }

    /// Writable CPU mapping.  Requires exclusive ownership.
    pub fn map_mut(&mut self) -> Result<MappedFrame<'_>> {
        self.exclusive()?;
        MappedFrame::new(self.physical().map()?, self.meta(), true)
    }

    /// Copy the frame into `dst`.
    ///
    /// `dst` may be smaller than the pool geometry (the top-left region is
    /// copied) but never larger, and must use the buffer's format.
    pub fn download(&self, dst: &mut HostFrame) -> Result<()> {
        self.check_transfer(dst.format, dst.width, dst.height)?;
        let mapped = self.map()?;
        for plane in 0..dst.plane_count() {
            let src_layout = mapped.layout[plane];
            let line = dst.linesize(plane).min(src_layout.linesize);
            let rows = dst.rows(plane).min(src_layout.rows);
            let dst_linesize = dst.linesize(plane);
            let src = mapped.plane(plane).unwrap_or(&[]);
            let out = dst.plane_mut(plane);
            for row in 0..rows {
                let s = row * src_layout.linesize;
                let d = row * dst_linesize;
                out[d..d + line].copy_from_slice(&src[s..s + line]);
            }
        }
        Ok(())
    }

    /// Copy `src` into the buffer.  Requires exclusive ownership.
    pub fn upload(&mut self, src: &HostFrame) -> Result<()> {
        self.check_transfer(src.format, src.width, src.height)?;
        let mut mapped = self.map_mut()?;
        for plane in 0..src.plane_count() {
            let dst_layout = mapped.layout[plane];
            let line = src.linesize(plane).min(dst_layout.linesize);
            let rows = src.rows(plane).min(dst_layout.rows);
            let src_linesize = src.linesize(plane);
            let input = src.plane(plane);
            let Some(out) = mapped.plane_mut(plane) else {
                continue;
            };
            for row in 0..rows {
                let s = row * src_linesize;
                let d = row * dst_layout.linesize;
                out[d..d + line].copy_from_slice(&input[s..s + line]);
            }
        }
        Ok(())
    }

    fn check_transfer(&self, format: PixelFormat, width: u32, height: u32) -> Result<()> {
        let pool = &self.lease.pool.config;
        if width > pool.width || height > pool.height {
            return Err(EngineError::InvalidGeometry {
                width,
                height,
                min_width: 1,
                min_height: 1,
                max_width: pool.width,
                max_height: pool.height,
            });
        }
        if format != pool.format {
            return Err(EngineError::UnsupportedFormat(format));
        }
        Ok(())
    }
}

impl fmt::Debug for DecodedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedBuffer")
            .field("pool", &self.lease.pool.id)
            .field("index", &self.lease.index)
            .field("meta", &self.lease.meta)
            .field("refs", &self.ref_count())
            .finish()
    }
}

// ─── Mapping ─────────────────────────────────────────────────────────────────

/// CPU view of a mapped buffer, split into planes.
pub struct MappedFrame<'a> {
    region: MappedRegion<'a>,
    layout: Vec<PlaneLayout>,
    meta: FrameMeta,
    writable: bool,
}

impl<'a> MappedFrame<'a> {
    fn new(region: MappedRegion<'a>, meta: FrameMeta, writable: bool) -> Result<Self> {
        let layout = meta.format.plane_layout(meta.width, meta.height);
        let needed = layout.last().map(|p| p.offset + p.len()).unwrap_or(0);
        if needed > region.len() {
            return Err(EngineError::InvariantViolation(format!(
                "{}x{} {} needs {needed} B but buffer holds {} B",
                meta.width,
                meta.height,
                meta.format,
                region.len()
            )));
        }
        Ok(Self {
            region,
            layout,
            meta,
            writable,
        })
    }

    pub fn meta(&self) -> FrameMeta {
        self.meta
    }

    pub fn plane_count(&self) -> usize {
        self.layout.len()
    }

    pub fn layout(&self, plane: usize) -> Option<PlaneLayout> {
        self.layout.get(plane).copied()
    }

    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        let p = self.layout.get(plane)?;
        Some(&self.region.as_slice()[p.offset..p.offset + p.len()])
    }

    /// `None` for read-only mappings.
    pub fn plane_mut(&mut self, plane: usize) -> Option<&mut [u8]> {
        if !self.writable {
            return None;
        }
        let p = *self.layout.get(plane)?;
        Some(&mut self.region.as_mut_slice()[p.offset..p.offset + p.len()])
    }
}
