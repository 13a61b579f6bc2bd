//! Per-frame stage between the decode pump and the sink.

use ionflow_core::error::Result;
use ionflow_core::pool::DecodedBuffer;
use ionflow_scale::blit::BlitEngine;
use ionflow_scale::scale::{ScaleSnapshot, ScaleStage, Transformed};

/// A stage that consumes one decoded frame and yields another.
///
/// Implementations own the input handle: it is either released, returned in
/// [`Transformed::WouldBlock`], or carried into the output.
pub trait FrameTransform {
    fn process(&mut self, frame: DecodedBuffer) -> Result<Transformed>;

    fn name(&self) -> &'static str;

    fn snapshot(&self) -> Option<ScaleSnapshot> {
        None
    }
}

impl<B: BlitEngine> FrameTransform for ScaleStage<B> {
    fn process(&mut self, frame: DecodedBuffer) -> Result<Transformed> {
        ScaleStage::process(self, frame)
    }

    fn name(&self) -> &'static str {
        "scale"
    }

    fn snapshot(&self) -> Option<ScaleSnapshot> {
        Some(ScaleStage::snapshot(self))
    }
}

/// Hands every frame through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl FrameTransform for Passthrough {
    fn process(&mut self, frame: DecodedBuffer) -> Result<Transformed> {
        Ok(Transformed::Output(frame))
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}
