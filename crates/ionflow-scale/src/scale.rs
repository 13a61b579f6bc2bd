//! Zero-copy scale stage.
//!
//! # Session derivation
//!
//! Output geometry is resolved from the width/height expressions against the
//! input frame, then checked against the blit engine limits and the device
//! format table, and only then is the output pool allocated.  The result is
//! cached per input key (pool, size, format) and re-derived when any of them
//! changes, so a mid-stream format change gets a fresh output pool.
//!
//! # Ownership
//!
//! `process` takes the input handle by value.  On success the input is
//! released before the output is returned; on engine failure both are
//! released.  When the output pool has no free slot the input is handed back
//! untouched in [`Transformed::WouldBlock`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use ionflow_core::context::DeviceContext;
use ionflow_core::error::{EngineError, Result};
use ionflow_core::pool::{BufferPool, DecodedBuffer, PoolConfig};
use ionflow_core::types::PixelFormat;

use crate::blit::{BlitEngine, BlitRequest, Rect, Rotation, Surface};
use crate::expr::{Expr, evaluate_dimensions};

fn default_width() -> String {
    "iw".into()
}

fn default_height() -> String {
    "ih".into()
}

fn default_output_pool_capacity() -> usize {
    4
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScaleConfig {
    #[serde(default = "default_width")]
    pub width: String,
    #[serde(default = "default_height")]
    pub height: String,
    /// Output format; the input format when unset.
    #[serde(default)]
    pub format: Option<PixelFormat>,
    #[serde(default = "default_output_pool_capacity")]
    pub output_pool_capacity: usize,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            format: None,
            output_pool_capacity: default_output_pool_capacity(),
        }
    }
}

impl ScaleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.output_pool_capacity == 0 {
            return Err(EngineError::Config(
                "scale output_pool_capacity must be at least 1".into(),
            ));
        }
        Expr::parse(&self.width)?;
        Expr::parse(&self.height)?;
        Ok(())
    }
}

/// Result of [`ScaleStage::process`].
#[derive(Debug)]
pub enum Transformed {
    Output(DecodedBuffer),
    /// Output pool exhausted; the input is returned for a later retry.
    WouldBlock(DecodedBuffer),
}

#[derive(Debug, Default)]
pub struct ScaleStats {
    pub frames: AtomicU64,
    pub would_block: AtomicU64,
    pub engine_failures: AtomicU64,
    pub reconfigurations: AtomicU64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScaleSnapshot {
    pub frames: u64,
    pub would_block: u64,
    pub engine_failures: u64,
    pub reconfigurations: u64,
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
    pub output_format: Option<PixelFormat>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InputKey {
    pool_id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl InputKey {
    fn of(frame: &DecodedBuffer) -> Self {
        Self {
            pool_id: frame.pool_id(),
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
        }
    }
}

struct ScaleSession {
    input: InputKey,
    input_code: u32,
    output_code: u32,
    pool: BufferPool,
}

pub struct ScaleStage<B: BlitEngine> {
    ctx: Arc<DeviceContext>,
    engine: Arc<B>,
    config: ScaleConfig,
    width: Expr,
    height: Expr,
    session: Option<ScaleSession>,
    stats: ScaleStats,
}

impl<B: BlitEngine> ScaleStage<B> {
    pub fn new(ctx: &Arc<DeviceContext>, engine: Arc<B>, config: ScaleConfig) -> Result<Self> {
        config.validate()?;
        let width = Expr::parse(&config.width)?;
        let height = Expr::parse(&config.height)?;
        Ok(Self {
            ctx: ctx.clone(),
            engine,
            config,
            width,
            height,
            session: None,
            stats: ScaleStats::default(),
        })
    }

    /// Replace the output format and size expressions.
    ///
    /// The current session is dropped; the next frame derives a new one.
    pub fn configure(
        &mut self,
        format: Option<PixelFormat>,
        width_expr: &str,
        height_expr: &str,
    ) -> Result<()> {
        let width = Expr::parse(width_expr)?;
        let height = Expr::parse(height_expr)?;
        self.config.format = format;
        self.config.width = width_expr.to_string();
        self.config.height = height_expr.to_string();
        self.width = width;
        self.height = height;
        self.session = None;
        Ok(())
    }

    fn derive_session(&self, input: &DecodedBuffer) -> Result<ScaleSession> {
        let key = InputKey::of(input);
        let (width, height) =
            evaluate_dimensions(&self.width, &self.height, key.width, key.height, key.format)?;

        let constraints = self.ctx.frame_constraints(self.engine.limits());
        constraints.limits.check(width, height)?;
        let format = self.config.format.unwrap_or(key.format);
        constraints.check_format(format)?;

        let input_code = self
            .ctx
            .engine_code(key.format)
            .ok_or(EngineError::UnsupportedFormat(key.format))?;
        let output_code = self
            .ctx
            .engine_code(format)
            .ok_or(EngineError::UnsupportedFormat(format))?;

        let pool = BufferPool::create(
            &self.ctx,
            "scale",
            PoolConfig::new(self.config.output_pool_capacity, width, height, format),
            None,
        )?;
        info!(
            engine = self.engine.name(),
            in_width = key.width,
            in_height = key.height,
            in_format = %key.format,
            out_width = width,
            out_height = height,
            out_format = %format,
            "scale session configured"
        );
        Ok(ScaleSession {
            input: key,
            input_code,
            output_code,
            pool,
        })
    }

    /// Scale `input` into a buffer of the output pool.
    pub fn process(&mut self, input: DecodedBuffer) -> Result<Transformed> {
        let key = InputKey::of(&input);
        if self.session.as_ref().is_none_or(|s| s.input != key) {
            if self.session.take().is_some() {
                self.stats.reconfigurations.fetch_add(1, Ordering::Relaxed);
                debug!(width = key.width, height = key.height, format = %key.format, "input changed; re-deriving scale session");
            }
            self.session = Some(self.derive_session(&input)?);
        }
        let Some(session) = &self.session else {
            return Err(EngineError::InvariantViolation(
                "scale session missing after derivation".into(),
            ));
        };

        let Some(mut output) = session.pool.acquire_free()? else {
            self.stats.would_block.fetch_add(1, Ordering::Relaxed);
            return Ok(Transformed::WouldBlock(input));
        };

        let request = BlitRequest {
            src: Surface {
                token: input.token(),
                canvas_width: input.width(),
                canvas_height: input.height(),
                format_code: session.input_code,
                rect: Rect::full(input.width(), input.height()),
            },
            dst: Surface {
                token: output.token(),
                canvas_width: output.width(),
                canvas_height: output.height(),
                format_code: session.output_code,
                rect: Rect::full(output.width(), output.height()),
            },
            rotation: Rotation::Deg0,
        };

        if let Err(code) = self.engine.stretch_blit(&request) {
            self.stats.engine_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                engine = self.engine.name(),
                code = code.0,
                src_slot = input.index(),
                dst_slot = output.index(),
                "stretch blit failed"
            );
            drop(output);
            drop(input);
            return Err(EngineError::EngineFailure {
                op: "stretch_blit",
                code: code.0,
            });
        }

        output.copy_props_from(&input)?;
        debug!(
            src_slot = input.index(),
            dst_slot = output.index(),
            timestamp = output.timestamp(),
            width = output.width(),
            height = output.height(),
            "frame scaled"
        );
        drop(input);
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        Ok(Transformed::Output(output))
    }

    pub fn config(&self) -> &ScaleConfig {
        &self.config
    }

    pub fn output_pool(&self) -> Option<&BufferPool> {
        self.session.as_ref().map(|s| &s.pool)
    }

    pub fn stats(&self) -> &ScaleStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ScaleSnapshot {
        let pool = self.output_pool();
        ScaleSnapshot {
            frames: self.stats.frames.load(Ordering::Relaxed),
            would_block: self.stats.would_block.load(Ordering::Relaxed),
            engine_failures: self.stats.engine_failures.load(Ordering::Relaxed),
            reconfigurations: self.stats.reconfigurations.load(Ordering::Relaxed),
            output_width: pool.map(BufferPool::width),
            output_height: pool.map(BufferPool::height),
            output_format: pool.map(BufferPool::format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftBlitEngine;
    use ionflow_core::alloc::{HeapAllocator, PhysicalBuffer};
    use ionflow_core::context::GeometryLimits;
    use ionflow_core::host::HostFrame;
    use ionflow_core::pool::{SlotRecycler, SlotState};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<usize>>);

    impl SlotRecycler for Recorder {
        fn recycle(&self, index: usize, _buffer: &PhysicalBuffer) -> Result<()> {
            self.0.lock().push(index);
            Ok(())
        }
    }

    struct Fixture {
        ctx: Arc<DeviceContext>,
        heap: Arc<HeapAllocator>,
        recycled: Arc<Recorder>,
        input: BufferPool,
    }

    fn fixture(width: u32, height: u32, format: PixelFormat) -> Fixture {
        let heap = HeapAllocator::new();
        let ctx = DeviceContext::new(heap.clone());
        let recycled = Arc::new(Recorder::default());
        let input = BufferPool::create(
            &ctx,
            "input",
            PoolConfig::new(2, width, height, format),
            Some(recycled.clone() as Arc<dyn SlotRecycler>),
        )
        .expect("input pool");
        Fixture {
            ctx,
            heap,
            recycled,
            input,
        }
    }

    fn stage(fx: &Fixture, config: ScaleConfig) -> ScaleStage<SoftBlitEngine> {
        let engine = Arc::new(SoftBlitEngine::new(fx.heap.clone()));
        ScaleStage::new(&fx.ctx, engine, config).expect("stage")
    }

    #[test]
    fn identity_scale_preserves_size_and_timestamp() {
        let fx = fixture(1920, 1080, PixelFormat::Nv21);
        let mut config = ScaleConfig::default();
        config.output_pool_capacity = 2;
        let mut stage = stage(&fx, config);

        let input = fx
            .input
            .mark_ready(1, 1920, 1080, 91)
            .expect("mark ready")
            .expect("non-empty");
        let Transformed::Output(output) = stage.process(input).expect("process") else {
            panic!("output pool should have room");
        };

        assert_eq!((output.width(), output.height()), (1920, 1080));
        assert_eq!(output.format(), PixelFormat::Nv21);
        assert_eq!(output.timestamp(), 91);
        assert_ne!(output.pool_id(), fx.input.id());
        assert_eq!(fx.input.slot_state(1), Some(SlotState::FreeWithEngine));
        assert_eq!(*fx.recycled.0.lock(), vec![1]);
    }

    #[test]
    fn pixels_are_scaled_per_plane() {
        let fx = fixture(4, 4, PixelFormat::Gray8);
        let mut config = ScaleConfig::default();
        config.width = "iw/2".into();
        config.height = "ih/2".into();
        let mut stage = stage(&fx, config);

        let mut input = fx.input.mark_ready(0, 4, 4, 5).expect("ready").expect("frame");
        let mut host = HostFrame::new(PixelFormat::Gray8, 4, 4);
        for (i, px) in host.plane_mut(0).iter_mut().enumerate() {
            *px = i as u8;
        }
        input.upload(&host).expect("upload");

        let Transformed::Output(output) = stage.process(input).expect("process") else {
            panic!("expected output");
        };
        let mut out = HostFrame::new(PixelFormat::Gray8, 2, 2);
        output.download(&mut out).expect("download");
        assert_eq!(out.plane(0), &[0, 2, 8, 10]);
    }

    #[test]
    fn out_of_range_geometry_allocates_nothing() {
        let fx = fixture(64, 64, PixelFormat::Nv21);
        let mut config = ScaleConfig::default();
        config.width = "iw*1000".into();
        let mut stage = stage(&fx, config);
        let live = fx.heap.live_buffers();

        let input = fx.input.mark_ready(0, 64, 64, 1).expect("ready").expect("frame");
        let err = stage.process(input).expect_err("too wide");
        assert!(matches!(err, EngineError::InvalidGeometry { width: 64_000, .. }));
        assert!(stage.output_pool().is_none());
        assert_eq!(fx.heap.live_buffers(), live);
        assert_eq!(*fx.recycled.0.lock(), vec![0]);
    }

    #[test]
    fn unsupported_output_format_is_rejected() {
        let fx = fixture(64, 64, PixelFormat::Nv21);
        let mut config = ScaleConfig::default();
        config.format = Some(PixelFormat::Nv12);
        let mut stage = stage(&fx, config);

        let input = fx.input.mark_ready(0, 64, 64, 1).expect("ready").expect("frame");
        let err = stage.process(input).expect_err("nv12 not on device");
        assert!(matches!(err, EngineError::UnsupportedFormat(PixelFormat::Nv12)));
        assert!(stage.output_pool().is_none());
    }

    #[test]
    fn engine_failure_releases_both_handles() {
        let fx = fixture(64, 64, PixelFormat::Nv21);
        let engine = Arc::new(SoftBlitEngine::new(fx.heap.clone()));
        let mut stage = ScaleStage::new(&fx.ctx, engine.clone(), ScaleConfig::default()).expect("stage");
        engine.fail_next(-5);

        let input = fx.input.mark_ready(0, 64, 64, 1).expect("ready").expect("frame");
        let err = stage.process(input).expect_err("blit fails");
        assert!(matches!(err, EngineError::EngineFailure { op: "stretch_blit", code: -5 }));
        assert_eq!(*fx.recycled.0.lock(), vec![0]);
        assert_eq!(stage.output_pool().expect("pool").owned_slots(), 0);
        assert_eq!(stage.snapshot().engine_failures, 1);
    }

    #[test]
    fn exhausted_output_pool_returns_the_input() {
        let fx = fixture(32, 32, PixelFormat::Nv21);
        let mut config = ScaleConfig::default();
        config.output_pool_capacity = 1;
        let mut stage = stage(&fx, config);

        let first = fx.input.mark_ready(0, 32, 32, 1).expect("ready").expect("frame");
        let held = stage.process(first).expect("process");
        let second = fx.input.mark_ready(1, 32, 32, 2).expect("ready").expect("frame");
        let Transformed::WouldBlock(second) = stage.process(second).expect("process") else {
            panic!("output pool should be exhausted");
        };
        assert_eq!(second.timestamp(), 2);

        drop(held);
        assert!(matches!(stage.process(second).expect("retry"), Transformed::Output(_)));
    }

    #[test]
    fn input_change_rederives_the_session() {
        let fx = fixture(64, 64, PixelFormat::Nv21);
        let mut config = ScaleConfig::default();
        config.width = "iw/2".into();
        config.height = "-2".into();
        let mut stage = stage(&fx, config);

        let a = fx.input.mark_ready(0, 64, 64, 1).expect("ready").expect("frame");
        let out_a = stage.process(a).expect("process");
        assert_eq!(stage.snapshot().output_width, Some(32));
        let b = fx.input.mark_ready(1, 48, 32, 2).expect("ready").expect("frame");
        let Transformed::Output(out_b) = stage.process(b).expect("process") else {
            panic!("expected output");
        };
        assert_eq!((out_b.width(), out_b.height()), (24, 16));
        assert_eq!(stage.snapshot().reconfigurations, 1);
        drop(out_a);
    }

    #[test]
    fn configure_replaces_expressions() {
        let fx = fixture(64, 64, PixelFormat::Nv21);
        let mut stage = stage(&fx, ScaleConfig::default());
        assert!(stage.configure(None, "iw+", "ih").is_err());
        stage.configure(Some(PixelFormat::Gray8), "16", "16").expect("configure");

        let input = fx.input.mark_ready(0, 64, 64, 3).expect("ready").expect("frame");
        let err = stage.process(input).expect_err("nv21 to gray needs conversion");
        assert!(matches!(err, EngineError::EngineFailure { .. }));
        assert_eq!(stage.output_pool().map(BufferPool::format), Some(PixelFormat::Gray8));
    }

    #[test]
    fn limits_come_from_the_engine() {
        let fx = fixture(64, 64, PixelFormat::Nv21);
        let engine = Arc::new(SoftBlitEngine::with_limits(
            fx.heap.clone(),
            GeometryLimits {
                min_width: 32,
                min_height: 32,
                max_width: 64,
                max_height: 64,
            },
        ));
        let mut config = ScaleConfig::default();
        config.width = "16".into();
        let mut stage = ScaleStage::new(&fx.ctx, engine, config).expect("stage");
        let input = fx.input.mark_ready(0, 64, 64, 1).expect("ready").expect("frame");
        assert!(matches!(
            stage.process(input),
            Err(EngineError::InvalidGeometry { width: 16, min_width: 32, .. })
        ));
    }

    #[test]
    fn scale_config_json_defaults_to_identity() {
        let config: ScaleConfig = serde_json::from_str("{}").expect("parses");
        assert_eq!(config, ScaleConfig::default());
        assert_eq!((config.width.as_str(), config.height.as_str()), ("iw", "ih"));

        let config: ScaleConfig =
            serde_json::from_str(r#"{"height": "-2", "format": "nv21", "output_pool_capacity": 2}"#)
                .expect("parses");
        assert_eq!(config.width, "iw");
        assert_eq!(config.format, Some(PixelFormat::Nv21));
        assert_eq!(config.output_pool_capacity, 2);
        assert!(serde_json::from_str::<ScaleConfig>(r#"{"scale": "2"}"#).is_err());
    }
}
