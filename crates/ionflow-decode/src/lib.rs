#![doc = include_str!("../README.md")]

pub mod bitreader;
pub mod codec;
pub mod engine;
pub mod header;
pub mod pump;
pub mod soft;

pub use codec::{CodecKind, StreamFormat, StreamType};
pub use engine::{Completion, DecodeEngine, EngineRecycler, SessionParams};
pub use header::HeaderRecipe;
pub use pump::{Completions, DecodePump, DecoderConfig, PollOutput, PumpState, PumpStats};
pub use soft::{SoftDecodeEngine, SoftMode};
