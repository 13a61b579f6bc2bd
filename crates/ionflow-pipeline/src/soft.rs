//! Runs a pipeline over the in-process engines.
//!
//! Everything lives on the heap allocator: the decode engine paints a test
//! pattern, the blit engine scales it, and the sink hashes what arrives.

use std::sync::Arc;

use serde::Serialize;

use ionflow_core::alloc::HeapAllocator;
use ionflow_core::codec_traits::PacketSource;
use ionflow_core::context::DeviceContext;
use ionflow_core::error::Result;
use ionflow_decode::pump::DecodePump;
use ionflow_decode::soft::{SoftDecodeEngine, SoftMode};
use ionflow_scale::scale::ScaleStage;
use ionflow_scale::soft::SoftBlitEngine;

use crate::driver::{Pipeline, PipelineReport};
use crate::io::ChecksumSink;
use crate::transform::Passthrough;

#[derive(Clone, Debug, Serialize)]
pub struct SoftRun {
    pub report: PipelineReport,
    /// FNV-1a over every delivered frame, as 16 hex digits.
    pub checksum: String,
}

pub async fn run_soft<S>(pipeline: &Pipeline, source: &mut S) -> Result<SoftRun>
where
    S: PacketSource + ?Sized,
{
    let config = pipeline.config();
    let heap = HeapAllocator::new();
    let ctx = DeviceContext::new(heap.clone());
    config.apply_to(&ctx);
    let engine = Arc::new(SoftDecodeEngine::with_heap(SoftMode::Autonomous, heap.clone()));
    let mut pump = DecodePump::open(&ctx, engine, config.decoder.clone())?;
    let mut sink = ChecksumSink::new();

    let report = match &config.scale {
        Some(scale_config) => {
            let blit = Arc::new(SoftBlitEngine::new(heap));
            let mut scale = ScaleStage::new(&ctx, blit, scale_config.clone())?;
            pipeline.run(&mut pump, &mut scale, source, &mut sink).await?
        }
        None => {
            pipeline
                .run(&mut pump, &mut Passthrough, source, &mut sink)
                .await?
        }
    };
    Ok(SoftRun {
        report,
        checksum: sink.checksum_hex(),
    })
}
