//! Cooperative pipeline driver: source → pump → transform → sink.
//!
//! # Scheduling
//!
//! One task drives everything.  The pump and the transform never block; they
//! answer would-block instead, and the driver turns a run of would-block
//! answers into an exponential `tokio::time::sleep` backoff.  Any progress
//! resets the backoff.
//!
//! Each iteration polls the pump first and only feeds the next packet when
//! nothing is ready, so the engine is never handed more work than it can
//! complete into free slots.
//!
//! # Shutdown
//!
//! 1. **End of stream**: the source runs dry, the pump drains, `finish()` is
//!    called on the sink.
//! 2. **Frame limit**: `max_frames` frames reached the sink.
//! 3. **Cancellation**: the token is checked every iteration and wakes any
//!    backoff sleep.  In-flight engine work is not touched; the session is
//!    closed on the way out.
//! 4. **Error**: fatal errors stop the run.  Rejected packets and failed
//!    transforms are counted and skipped.
//!
//! The pump is closed in every case.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use ionflow_core::codec_traits::{FrameSink, Packet, PacketSource};
use ionflow_core::context::DeviceSnapshot;
use ionflow_core::error::{EngineError, Result};
use ionflow_core::pool::DecodedBuffer;
use ionflow_decode::engine::DecodeEngine;
use ionflow_decode::pump::{DecodePump, PollOutput, PumpState, PumpStats, SessionInfo};
use ionflow_scale::scale::{ScaleSnapshot, Transformed};

use crate::config::{BackoffConfig, PipelineConfig};
use crate::transform::FrameTransform;

// ─── Metrics ────────────────────────────────────────────────────────────────

/// Atomic per-stage counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Packets taken from the source (end of stream excluded).
    pub packets_read: AtomicU64,
    /// Packets the engine rejected.
    pub packets_dropped: AtomicU64,
    /// Frames that left the decode pump.
    pub frames_decoded: AtomicU64,
    /// Frames that left the transform.
    pub frames_transformed: AtomicU64,
    /// Frames accepted by the sink.
    pub frames_delivered: AtomicU64,
    pub transform_failures: AtomicU64,
    /// Iterations that made no progress.
    pub idle_polls: AtomicU64,
    /// Cumulative wall-clock time in each stage, microseconds.
    pub decode_total_us: AtomicU64,
    pub transform_total_us: AtomicU64,
    pub sink_total_us: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ordering invariant: decoded ≥ transformed ≥ delivered.
    pub fn validate(&self) -> bool {
        let d = self.frames_decoded.load(Ordering::Acquire);
        let t = self.frames_transformed.load(Ordering::Acquire);
        let s = self.frames_delivered.load(Ordering::Acquire);
        d >= t && t >= s
    }

    pub fn report(&self) {
        let dec = self.frames_decoded.load(Ordering::Relaxed);
        let xf = self.frames_transformed.load(Ordering::Relaxed);
        let out = self.frames_delivered.load(Ordering::Relaxed);

        let avg = |total: &AtomicU64, count: u64| -> u64 {
            if count > 0 {
                total.load(Ordering::Relaxed) / count
            } else {
                0
            }
        };

        info!(
            packets = self.packets_read.load(Ordering::Relaxed),
            dropped = self.packets_dropped.load(Ordering::Relaxed),
            decoded = dec,
            transformed = xf,
            delivered = out,
            transform_failures = self.transform_failures.load(Ordering::Relaxed),
            idle_polls = self.idle_polls.load(Ordering::Relaxed),
            decode_avg_us = avg(&self.decode_total_us, dec),
            transform_avg_us = avg(&self.transform_total_us, xf),
            sink_avg_us = avg(&self.sink_total_us, out),
            "Pipeline metrics"
        );
    }
}

// ─── Backoff ────────────────────────────────────────────────────────────────

/// Exponential delay between idle polls, with stall detection.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    stall_timeout: Option<Duration>,
    current: Duration,
    idle_since: Option<Instant>,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let initial = Duration::from_micros(config.initial_delay_us);
        Self {
            initial,
            max: Duration::from_micros(config.max_delay_us),
            stall_timeout: config.stall_timeout(),
            current: initial,
            idle_since: None,
        }
    }

    /// Progress was made.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.idle_since = None;
    }

    /// Delay before the next poll; doubles on every call until the cap.
    pub fn next_delay(&mut self) -> Duration {
        self.idle_since.get_or_insert_with(Instant::now);
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// How long the driver has been idle, if it is.
    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since.map(|since| since.elapsed())
    }

    pub fn is_stalled(&self) -> bool {
        match (self.stall_timeout, self.idle_for()) {
            (Some(limit), Some(idle)) => idle >= limit,
            _ => false,
        }
    }
}

// ─── Report ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    EndOfStream,
    FrameLimit,
    Cancelled,
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub outcome: RunOutcome,
    pub transform: &'static str,
    pub packets_read: u64,
    pub packets_dropped: u64,
    pub frames_decoded: u64,
    pub frames_transformed: u64,
    pub frames_delivered: u64,
    pub transform_failures: u64,
    pub idle_polls: u64,
    pub elapsed_ms: u64,
    pub session: Option<SessionInfo>,
    pub decode: PumpStats,
    pub scale: Option<ScaleSnapshot>,
    pub device: Option<DeviceSnapshot>,
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

enum Step {
    Frame(DecodedBuffer),
    /// Something moved but no frame is ready yet.
    Progress,
    Idle,
    Drained,
}

pub struct Pipeline {
    config: PipelineConfig,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
            metrics: PipelineMetrics::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Calling `cancel()` on the returned token stops the run at the next
    /// iteration.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Drive `pump` until the stream ends, the frame limit is hit, the run
    /// is cancelled or a fatal error occurs.  The pump is closed on return.
    ///
    /// The memory cap is not installed here; call
    /// [`PipelineConfig::apply_to`] on the context before opening the pump.
    #[instrument(skip_all, name = "pipeline", fields(transform = transform.name()))]
    pub async fn run<E, T, S, K>(
        &self,
        pump: &mut DecodePump<E>,
        transform: &mut T,
        source: &mut S,
        sink: &mut K,
    ) -> Result<PipelineReport>
    where
        E: DecodeEngine + 'static,
        T: FrameTransform + ?Sized,
        S: PacketSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let started = Instant::now();
        let result = self.drive(pump, transform, source, sink).await;
        pump.close();
        let outcome = result?;

        self.metrics.report();
        if !self.metrics.validate() {
            return Err(EngineError::InvariantViolation(format!(
                "Pipeline ordering violation: decoded={} transformed={} delivered={}",
                self.metrics.frames_decoded.load(Ordering::Acquire),
                self.metrics.frames_transformed.load(Ordering::Acquire),
                self.metrics.frames_delivered.load(Ordering::Acquire),
            )));
        }

        let m = &self.metrics;
        let report = PipelineReport {
            outcome,
            transform: transform.name(),
            packets_read: m.packets_read.load(Ordering::Relaxed),
            packets_dropped: m.packets_dropped.load(Ordering::Relaxed),
            frames_decoded: m.frames_decoded.load(Ordering::Relaxed),
            frames_transformed: m.frames_transformed.load(Ordering::Relaxed),
            frames_delivered: m.frames_delivered.load(Ordering::Relaxed),
            transform_failures: m.transform_failures.load(Ordering::Relaxed),
            idle_polls: m.idle_polls.load(Ordering::Relaxed),
            elapsed_ms: started.elapsed().as_millis() as u64,
            session: pump.session().cloned(),
            decode: pump.stats().clone(),
            scale: transform.snapshot(),
            device: pump.pool().map(|pool| pool.context().health_snapshot()),
        };
        info!(outcome = ?report.outcome, frames = report.frames_delivered, elapsed_ms = report.elapsed_ms, "pipeline finished");
        Ok(report)
    }

    async fn drive<E, T, S, K>(
        &self,
        pump: &mut DecodePump<E>,
        transform: &mut T,
        source: &mut S,
        sink: &mut K,
    ) -> Result<RunOutcome>
    where
        E: DecodeEngine + 'static,
        T: FrameTransform + ?Sized,
        S: PacketSource + ?Sized,
        K: FrameSink + ?Sized,
    {
        let mut backoff = Backoff::new(&self.config.backoff);
        // Input handed back by a transform whose output pool was full.
        let mut parked: Option<DecodedBuffer> = None;

        loop {
            if self.cancel.is_cancelled() {
                info!("pipeline cancelled");
                return Ok(RunOutcome::Cancelled);
            }
            if let Some(limit) = self.config.max_frames
                && self.metrics.frames_delivered.load(Ordering::Acquire) >= limit
            {
                info!(limit, "frame limit reached");
                sink.finish()?;
                return Ok(RunOutcome::FrameLimit);
            }

            let step = match parked.take() {
                Some(frame) => Step::Frame(frame),
                None => self.decode_step(pump, source)?,
            };

            let idle = match step {
                Step::Drained => {
                    debug!("decode drained");
                    sink.finish()?;
                    return Ok(RunOutcome::EndOfStream);
                }
                Step::Progress => false,
                Step::Idle => true,
                Step::Frame(frame) => match self.transform_step(transform, sink, frame)? {
                    Some(input) => {
                        parked = Some(input);
                        true
                    }
                    None => false,
                },
            };

            if !idle {
                backoff.reset();
                continue;
            }

            self.metrics.idle_polls.fetch_add(1, Ordering::Relaxed);
            if backoff.is_stalled() {
                return Err(EngineError::Pipeline(format!(
                    "no progress for {} ms (pump {}, frame parked: {})",
                    backoff.idle_for().unwrap_or_default().as_millis(),
                    pump.state(),
                    parked.is_some()
                )));
            }
            let delay = backoff.next_delay();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Poll first; feed one packet only when nothing is ready.
    fn decode_step<E, S>(&self, pump: &mut DecodePump<E>, source: &mut S) -> Result<Step>
    where
        E: DecodeEngine + 'static,
        S: PacketSource + ?Sized,
    {
        let t_decode = Instant::now();
        match pump.poll_output()? {
            PollOutput::Frame(frame) => {
                self.metrics
                    .decode_total_us
                    .fetch_add(t_decode.elapsed().as_micros() as u64, Ordering::Relaxed);
                self.metrics.frames_decoded.fetch_add(1, Ordering::Release);
                return Ok(Step::Frame(frame));
            }
            PollOutput::EndOfStream => return Ok(Step::Drained),
            PollOutput::WouldBlock => {}
        }

        if pump.state() == PumpState::EosDraining {
            return Ok(Step::Idle);
        }

        let packet = match source.read_packet()? {
            Some(packet) => {
                self.metrics.packets_read.fetch_add(1, Ordering::Relaxed);
                packet
            }
            None => Packet::eos(),
        };
        match pump.submit(&packet) {
            Ok(()) => Ok(Step::Progress),
            Err(err) if err.is_recoverable() => {
                self.metrics.packets_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, pts = packet.pts, "packet dropped");
                Ok(Step::Progress)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the input when the transform would block.
    fn transform_step<T, K>(
        &self,
        transform: &mut T,
        sink: &mut K,
        frame: DecodedBuffer,
    ) -> Result<Option<DecodedBuffer>>
    where
        T: FrameTransform + ?Sized,
        K: FrameSink + ?Sized,
    {
        let t_transform = Instant::now();
        let output = match transform.process(frame) {
            Ok(Transformed::Output(output)) => output,
            Ok(Transformed::WouldBlock(input)) => return Ok(Some(input)),
            Err(err) if err.is_recoverable() => {
                self.metrics.transform_failures.fetch_add(1, Ordering::Relaxed);
                warn!(transform = transform.name(), error = %err, "frame dropped by transform");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        self.metrics
            .transform_total_us
            .fetch_add(t_transform.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.metrics.frames_transformed.fetch_add(1, Ordering::Release);

        let t_sink = Instant::now();
        sink.consume(output)?;
        self.metrics
            .sink_total_us
            .fetch_add(t_sink.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.metrics.frames_delivered.fetch_add(1, Ordering::Release);
        Ok(None)
    }
}
