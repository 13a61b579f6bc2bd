//! Physical memory allocator seam.
//!
//! Hardware buffers are identified by an opaque [`BufferToken`] that both the
//! decode engine and the 2D blit engine understand (a shared dma-buf fd on
//! real devices).  [`PhysicalBuffer`] owns one allocation and frees it on
//! drop; [`MappedRegion`] is the RAII process mapping of that buffer.
//!
//! # Mapping exclusivity
//!
//! A buffer is mapped at most once at a time.  The mapped flag lives on the
//! buffer, so a second `map()` fails with [`EngineError::AlreadyMapped`]
//! until the first region is dropped.  Freeing a mapped buffer is impossible
//! because the region borrows the buffer.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Opaque allocator handle, stable for the lifetime of the allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferToken(pub u64);

impl fmt::Display for BufferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Allocator for physically contiguous buffers.
///
/// Called at pool creation and destruction only; the per-frame path never
/// allocates.
pub trait PhysicalAllocator: Send + Sync {
    /// Allocate `size` bytes.
    fn alloc(&self, size: usize) -> Result<BufferToken>;

    /// Release an allocation.  The buffer is never mapped at this point.
    fn free(&self, token: BufferToken, size: usize);

    /// Map the allocation into process memory.
    fn map(&self, token: BufferToken, size: usize) -> Result<NonNull<u8>>;

    /// Undo a [`map`](Self::map).
    fn unmap(&self, token: BufferToken, addr: NonNull<u8>, size: usize);

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

// ─── Physical buffer ─────────────────────────────────────────────────────────

/// One allocation owned for its whole lifetime.
pub struct PhysicalBuffer {
    token: BufferToken,
    size: usize,
    allocator: Arc<dyn PhysicalAllocator>,
    mapped: AtomicBool,
}

impl PhysicalBuffer {
    pub fn allocate(allocator: Arc<dyn PhysicalAllocator>, size: usize) -> Result<Self> {
        let token = allocator.alloc(size)?;
        Ok(Self {
            token,
            size,
            allocator,
            mapped: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn token(&self) -> BufferToken {
        self.token
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Map the buffer for CPU access.
    pub fn map(&self) -> Result<MappedRegion<'_>> {
        if self
            .mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::AlreadyMapped(self.token.0));
        }
        match self.allocator.map(self.token, self.size) {
            Ok(addr) => Ok(MappedRegion { buffer: self, addr }),
            Err(err) => {
                self.mapped.store(false, Ordering::Release);
                Err(err)
            }
        }
    }
}

impl fmt::Debug for PhysicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalBuffer")
            .field("token", &self.token)
            .field("size", &self.size)
            .field("allocator", &self.allocator.name())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

impl Drop for PhysicalBuffer {
    fn drop(&mut self) {
        self.allocator.free(self.token, self.size);
    }
}

/// Process mapping of a [`PhysicalBuffer`], unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion<'a> {
    buffer: &'a PhysicalBuffer,
    addr: NonNull<u8>,
}

impl MappedRegion<'_> {
    pub fn len(&self) -> usize {
        self.buffer.size
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.size == 0
    }

    pub fn token(&self) -> BufferToken {
        self.buffer.token
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocator returned a mapping of `size` bytes that stays
        // valid until `unmap`, and the mapped flag guarantees this is the only
        // live region for the buffer.
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.buffer.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` makes the slice unique.
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.buffer.size) }
    }
}

impl Drop for MappedRegion<'_> {
    fn drop(&mut self) {
        self.buffer
            .allocator
            .unmap(self.buffer.token, self.addr, self.buffer.size);
        self.buffer.mapped.store(false, Ordering::Release);
    }
}

// ─── Heap allocator ──────────────────────────────────────────────────────────

struct HeapBlock {
    ptr: NonNull<u8>,
    len: usize,
    mapped: bool,
}

// SAFETY: the block is plain heap memory owned by the allocator state; access
// is serialized by the state mutex or by the single-mapping rule.
unsafe impl Send for HeapBlock {}

#[derive(Default)]
struct HeapState {
    next_token: u64,
    blocks: HashMap<u64, HeapBlock>,
    live_bytes: usize,
}

/// Process-memory allocator standing in for the ION/CMA heap.
///
/// Software engines reach buffer contents through [`HeapAllocator::with_block`]
/// and [`HeapAllocator::with_blocks`], which refuse buffers that are mapped by
/// a consumer.
pub struct HeapAllocator {
    state: Mutex<HeapState>,
    limit_bytes: Option<usize>,
}

impl HeapAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HeapState::default()),
            limit_bytes: None,
        })
    }

    /// Allocator that fails once `limit_bytes` are live.
    pub fn with_limit(limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HeapState::default()),
            limit_bytes: Some(limit_bytes),
        })
    }

    pub fn live_bytes(&self) -> usize {
        self.state.lock().live_bytes
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Run `f` over the contents of `token`, as a hardware engine would.
    pub fn with_block<R>(&self, token: BufferToken, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let state = self.state.lock();
        let block = engine_block(&state, token)?;
        // SAFETY: the block is live and unmapped; holding the state lock keeps
        // it from being freed or mapped while `f` runs.
        let data = unsafe { std::slice::from_raw_parts_mut(block.ptr.as_ptr(), block.len) };
        Ok(f(data))
    }

    /// Run `f` with `src` readable and `dst` writable.  The tokens must differ.
    pub fn with_blocks<R>(
        &self,
        src: BufferToken,
        dst: BufferToken,
        f: impl FnOnce(&[u8], &mut [u8]) -> R,
    ) -> Result<R> {
        if src == dst {
            return Err(EngineError::InvariantViolation(format!(
                "blit source and destination alias buffer {src}"
            )));
        }
        let state = self.state.lock();
        let s = engine_block(&state, src)?;
        let d = engine_block(&state, dst)?;
        // SAFETY: distinct live unmapped blocks, lock held for the duration.
        let (src_data, dst_data) = unsafe {
            (
                std::slice::from_raw_parts(s.ptr.as_ptr() as *const u8, s.len),
                std::slice::from_raw_parts_mut(d.ptr.as_ptr(), d.len),
            )
        };
        Ok(f(src_data, dst_data))
    }
}

fn engine_block(state: &HeapState, token: BufferToken) -> Result<&HeapBlock> {
    let block = state.blocks.get(&token.0).ok_or_else(|| {
        EngineError::InvariantViolation(format!("engine access to unknown buffer {token}"))
    })?;
    if block.mapped {
        return Err(EngineError::AlreadyMapped(token.0));
    }
    Ok(block)
}

impl PhysicalAllocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<BufferToken> {
        let mut state = self.state.lock();
        if let Some(limit) = self.limit_bytes
            && state.live_bytes.saturating_add(size) > limit
        {
            return Err(EngineError::AllocFailure {
                size,
                reason: format!("heap limit {limit} B reached ({} B live)", state.live_bytes),
            });
        }
        let data: Box<[u8]> = vec![0u8; size.max(1)].into_boxed_slice();
        let len = data.len();
        let ptr = NonNull::from(Box::leak(data)).cast::<u8>();
        state.next_token += 1;
        let token = state.next_token;
        state.blocks.insert(
            token,
            HeapBlock {
                ptr,
                len,
                mapped: false,
            },
        );
        state.live_bytes += size;
        debug!(token, size, "heap buffer allocated");
        Ok(BufferToken(token))
    }

    fn free(&self, token: BufferToken, size: usize) {
        let mut state = self.state.lock();
        let Some(block) = state.blocks.remove(&token.0) else {
            warn!(%token, "free of unknown heap buffer");
            return;
        };
        if block.mapped {
            warn!(%token, "heap buffer freed while mapped");
        }
        state.live_bytes = state.live_bytes.saturating_sub(size);
        // SAFETY: ptr/len came from `Box::leak` in `alloc` and the block was
        // removed from the table, so this is the only reclaim.
        drop(unsafe {
            Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                block.ptr.as_ptr(),
                block.len,
            ))
        });
    }

    fn map(&self, token: BufferToken, size: usize) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let block = state.blocks.get_mut(&token.0).ok_or_else(|| EngineError::MapFailure {
            token: token.0,
            reason: "unknown buffer".into(),
        })?;
        if block.mapped {
            return Err(EngineError::AlreadyMapped(token.0));
        }
        if size > block.len {
            return Err(EngineError::MapFailure {
                token: token.0,
                reason: format!("mapping {size} B exceeds allocation of {} B", block.len),
            });
        }
        block.mapped = true;
        Ok(block.ptr)
    }

    fn unmap(&self, token: BufferToken, _addr: NonNull<u8>, _size: usize) {
        if let Some(block) = self.state.lock().blocks.get_mut(&token.0) {
            block.mapped = false;
        }
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.blocks.is_empty() {
            warn!(
                buffers = state.blocks.len(),
                bytes = state.live_bytes,
                "heap allocator dropped with live buffers"
            );
        }
        for (_, block) in state.blocks.drain() {
            // SAFETY: see `free`.
            drop(unsafe {
                Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    block.ptr.as_ptr(),
                    block.len,
                ))
            });
        }
    }
}
