#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod codec_traits;
pub mod context;
pub mod error;
pub mod host;
pub mod pool;
pub mod types;

pub use alloc::{BufferToken, HeapAllocator, PhysicalAllocator, PhysicalBuffer};
pub use context::{DeviceContext, GeometryLimits};
pub use error::{EngineCode, EngineError, Result};
pub use pool::{BufferPool, DecodedBuffer, PoolConfig, SlotRecycler, SlotState};
pub use types::PixelFormat;
