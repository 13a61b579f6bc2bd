#![doc = include_str!("../README.md")]

pub mod config;
pub mod driver;
pub mod io;
pub mod soft;
pub mod transform;

pub use config::{BackoffConfig, CONFIG_SCHEMA_VERSION, PipelineConfig};
pub use driver::{Backoff, Pipeline, PipelineMetrics, PipelineReport, RunOutcome};
pub use io::{ChecksumSink, MemoryPacketSource, SyntheticPacketSource};
pub use soft::{SoftRun, run_soft};
pub use transform::{FrameTransform, Passthrough};
