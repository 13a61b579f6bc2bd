//! Decode pump: the session state machine around a [`DecodeEngine`].
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──submit──▶ Running
//!                              │                    │  ▲
//!                              │  submit(EOS)       │  │ flush
//!                              ▼                    ▼  │
//!                         EosDraining ◀───submit(EOS)──┘
//!
//! any initialized state ──close──▶ Closed
//! ```
//!
//! The pump is single-owner (`&mut self`).  Handles it produces are `Send`
//! and may be released from any thread; releasing them is what returns slots
//! to the engine.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use ionflow_core::codec_traits::{Packet, PacketSource};
use ionflow_core::context::DeviceContext;
use ionflow_core::error::{EngineError, Result};
use ionflow_core::pool::{BufferPool, DecodedBuffer, PoolConfig, SlotRecycler};
use ionflow_core::types::{BUFFER_LINE_ALIGN, PixelFormat, align_up, engine_timestamp};

use crate::codec::{CodecKind, engine_rate, parse_fourcc, resolve_stream_format};
use crate::engine::{DecodeEngine, EngineRecycler, SessionParams};
use crate::header::HeaderRecipe;

// ─── Configuration ───────────────────────────────────────────────────────────

fn default_fps_num() -> u32 {
    25
}

fn default_fps_den() -> u32 {
    1
}

fn default_pool_capacity() -> usize {
    16
}

fn default_output_format() -> PixelFormat {
    PixelFormat::Nv21
}

/// Decode session configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecoderConfig {
    pub codec: CodecKind,
    /// Container codec tag, e.g. `"DIV3"`.
    #[serde(default)]
    pub codec_tag: Option<String>,
    /// Coded size; 0 lets an HEVC header supply it.
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default = "default_fps_num")]
    pub fps_num: u32,
    #[serde(default = "default_fps_den")]
    pub fps_den: u32,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    #[serde(default = "default_output_format")]
    pub output_format: PixelFormat,
    /// Codec configuration record from the container.
    #[serde(skip)]
    pub extradata: Bytes,
}

impl DecoderConfig {
    pub fn new(codec: CodecKind, width: u32, height: u32) -> Self {
        Self {
            codec,
            codec_tag: None,
            width,
            height,
            fps_num: default_fps_num(),
            fps_den: default_fps_den(),
            pool_capacity: default_pool_capacity(),
            output_format: default_output_format(),
            extradata: Bytes::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(EngineError::Config(
                "decoder pool_capacity must be at least 1".into(),
            ));
        }
        if self.fps_den == 0 {
            return Err(EngineError::Config("decoder fps_den must be non-zero".into()));
        }
        if !matches!(self.output_format, PixelFormat::Nv12 | PixelFormat::Nv21) {
            return Err(EngineError::UnsupportedFormat(self.output_format));
        }
        if let Some(tag) = &self.codec_tag {
            parse_fourcc(tag)?;
        }
        Ok(())
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpState {
    Uninitialized,
    Initialized,
    Running,
    EosDraining,
    Closed,
}

impl PumpState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::EosDraining => "eos_draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a poll.  Only `Frame` carries a handle.
#[derive(Debug)]
pub enum PollOutput {
    Frame(DecodedBuffer),
    WouldBlock,
    EndOfStream,
}

impl PollOutput {
    pub fn into_frame(self) -> Option<DecodedBuffer> {
        match self {
            Self::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    pub packets_submitted: u64,
    pub submit_failures: u64,
    pub header_writes: u64,
    pub frames_out: u64,
    pub zero_geometry_drops: u64,
    pub flushes: u64,
}

/// What the session was opened with, after header and tag resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub params: SessionParams,
    pub header_kind: &'static str,
    pub header_len: usize,
    pub pool_width: u32,
    pub pool_capacity: usize,
}

// ─── Pump ────────────────────────────────────────────────────────────────────

pub struct DecodePump<E: DecodeEngine> {
    ctx: Arc<DeviceContext>,
    engine: Arc<E>,
    config: DecoderConfig,
    state: PumpState,
    pool: Option<BufferPool>,
    header: Option<Bytes>,
    /// Header must be written before the next non-empty packet.
    header_pending: bool,
    session: Option<SessionInfo>,
    stats: PumpStats,
}

impl<E: DecodeEngine + 'static> DecodePump<E> {
    /// A pump in [`PumpState::Uninitialized`]; nothing is allocated yet.
    pub fn new(ctx: &Arc<DeviceContext>, engine: Arc<E>, config: DecoderConfig) -> Self {
        Self {
            ctx: ctx.clone(),
            engine,
            config,
            state: PumpState::Uninitialized,
            pool: None,
            header: None,
            header_pending: false,
            session: None,
            stats: PumpStats::default(),
        }
    }

    /// [`new`](Self::new) followed by [`init`](Self::init).
    pub fn open(ctx: &Arc<DeviceContext>, engine: Arc<E>, config: DecoderConfig) -> Result<Self> {
        let mut pump = Self::new(ctx, engine, config);
        pump.init()?;
        Ok(pump)
    }

    /// Create the output pool, start the engine and hand it every slot.
    ///
    /// Any failure is fatal: the pump moves to `Closed` and must be
    /// recreated.
    pub fn init(&mut self) -> Result<()> {
        if self.state != PumpState::Uninitialized {
            return Err(self.invalid("init"));
        }
        match self.try_init() {
            Ok(()) => {
                self.state = PumpState::Initialized;
                self.header_pending = true;
                Ok(())
            }
            Err(err) => {
                error!(engine = self.engine.name(), error = %err, "decode session init failed");
                self.pool = None;
                self.state = PumpState::Closed;
                Err(err)
            }
        }
    }

    fn try_init(&mut self) -> Result<()> {
        let cfg = &self.config;
        cfg.validate()?;
        let codec_tag = cfg.codec_tag.as_deref().map(parse_fourcc).transpose()?;

        let recipe = match HeaderRecipe::from_codec_config(
            cfg.codec,
            codec_tag,
            &cfg.extradata,
            cfg.width,
            cfg.height,
        ) {
            Ok(recipe) => recipe,
            Err(err) => {
                warn!(codec = %cfg.codec, error = %err, "header reconstruction failed; continuing without header");
                HeaderRecipe::None
            }
        };

        let (mut width, mut height) = (cfg.width, cfg.height);
        if (width == 0 || height == 0)
            && let Some((w, h)) = recipe.dimensions()
        {
            debug!(width = w, height = h, "session size taken from header");
            (width, height) = (w, h);
        }
        if width == 0 || height == 0 {
            return Err(EngineError::Config(format!(
                "decode size {width}x{height} not supported"
            )));
        }

        let params = SessionParams {
            codec: cfg.codec,
            stream_type: cfg.codec.stream_type(),
            stream_format: resolve_stream_format(cfg.codec, codec_tag),
            width,
            height,
            rate: engine_rate(cfg.fps_num, cfg.fps_den),
            output_format: cfg.output_format,
            extradata: cfg.extradata.clone(),
        };
        let header = recipe.build();

        let pool_width = align_up(width as usize, BUFFER_LINE_ALIGN) as u32;
        let recycler: Arc<dyn SlotRecycler> = Arc::new(EngineRecycler::new(self.engine.clone()));
        let pool = BufferPool::create(
            &self.ctx,
            "decode",
            PoolConfig::new(cfg.pool_capacity, pool_width, height, cfg.output_format),
            Some(recycler),
        )?;

        self.engine
            .init(&params, header.as_deref())
            .map_err(|code| EngineError::EngineInit { code: code.0 })?;
        let attached = (0..pool.capacity()).try_for_each(|index| {
            let buffer = pool.acquire_for_engine(index)?;
            self.engine
                .release(index, buffer)
                .map_err(|code| EngineError::EngineInit { code: code.0 })
        });
        if let Err(err) = attached {
            if let Err(code) = self.engine.reset() {
                warn!(
                    code = code.0,
                    "engine reset failed after init error; in-flight hardware state leaked"
                );
            }
            return Err(err);
        }

        let info = SessionInfo {
            header_kind: recipe.kind(),
            header_len: header.as_ref().map_or(0, Bytes::len),
            pool_width,
            pool_capacity: pool.capacity(),
            params,
        };
        info!(
            engine = self.engine.name(),
            codec = %info.params.codec,
            stream_type = ?info.params.stream_type,
            stream_format = ?info.params.stream_format,
            width,
            height,
            rate = info.params.rate,
            format = %info.params.output_format,
            header = info.header_kind,
            header_len = info.header_len,
            "decode session initialized"
        );
        self.header = header;
        self.pool = Some(pool);
        self.session = Some(info);
        Ok(())
    }

    fn invalid(&self, op: &'static str) -> EngineError {
        EngineError::InvalidState {
            op,
            state: self.state.as_str(),
        }
    }

    /// Submit one packet; an empty packet signals end of stream.
    ///
    /// A rejected packet leaves the state unchanged and is not retried.
    pub fn submit(&mut self, packet: &Packet) -> Result<()> {
        match self.state {
            PumpState::Initialized | PumpState::Running => {}
            PumpState::EosDraining if packet.is_eos() => return Ok(()),
            _ => return Err(self.invalid("submit")),
        }

        if packet.is_eos() {
            debug!("end of stream submitted");
            self.state = PumpState::EosDraining;
            return Ok(());
        }

        if self.header_pending
            && let Some(header) = &self.header
        {
            if let Err(code) = self.engine.write_header(header) {
                self.stats.submit_failures += 1;
                warn!(code = code.0, "failed to write header to decoder");
                return Err(EngineError::EngineSubmit { code: code.0 });
            }
            self.stats.header_writes += 1;
            self.header_pending = false;
            debug!(len = header.len(), "header written");
        }

        let timestamp = engine_timestamp(packet.pts);
        if let Err(code) = self.engine.submit(&packet.data, timestamp) {
            self.stats.submit_failures += 1;
            warn!(code = code.0, len = packet.data.len(), "failed to write data to decoder");
            return Err(EngineError::EngineSubmit { code: code.0 });
        }
        self.stats.packets_submitted += 1;
        if self.state == PumpState::Initialized {
            self.state = PumpState::Running;
        }
        Ok(())
    }

    /// Collect the next decoded picture, without blocking.
    pub fn poll_output(&mut self) -> Result<PollOutput> {
        let pool = match (&self.pool, self.state) {
            (Some(pool), PumpState::Initialized | PumpState::Running | PumpState::EosDraining) => pool,
            _ => return Err(self.invalid("poll_output")),
        };

        let Some(done) = self.engine.poll() else {
            if self.state == PumpState::EosDraining && !self.engine.frames_in_flight() {
                return Ok(PollOutput::EndOfStream);
            }
            return Ok(PollOutput::WouldBlock);
        };

        match pool.mark_ready(done.slot, done.width, done.height, done.timestamp)? {
            Some(frame) => {
                self.stats.frames_out += 1;
                debug!(
                    slot = done.slot,
                    width = done.width,
                    height = done.height,
                    timestamp = done.timestamp,
                    "frame decoded"
                );
                Ok(PollOutput::Frame(frame))
            }
            None => {
                self.stats.zero_geometry_drops += 1;
                Ok(PollOutput::WouldBlock)
            }
        }
    }

    /// One decode step: pull a packet (end of source → EOS), submit it, poll.
    pub fn receive<S: PacketSource + ?Sized>(&mut self, source: &mut S) -> Result<PollOutput> {
        if self.state != PumpState::EosDraining {
            let packet = source.read_packet()?.unwrap_or_else(Packet::eos);
            self.submit(&packet)?;
        }
        self.poll_output()
    }

    /// Drop in-flight work and re-arm the header.
    ///
    /// Handles already given out stay valid.  After a flush from
    /// `EosDraining` the pump accepts packets again.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            PumpState::Initialized | PumpState::Running | PumpState::EosDraining => {}
            _ => return Err(self.invalid("flush")),
        }
        if let Err(code) = self.engine.reset() {
            error!(code = code.0, "failed to reset codec");
            return Err(EngineError::EngineFailure {
                op: "flush",
                code: code.0,
            });
        }
        self.stats.flushes += 1;
        self.header_pending = true;
        if self.state == PumpState::EosDraining {
            self.state = PumpState::Running;
        }
        info!(state = %self.state, "decoder flushed");
        Ok(())
    }

    /// Lazy sequence of decoded pictures; `None` items mean "would block".
    ///
    /// Ends after end of stream or the first error.
    pub fn completions(&mut self) -> Completions<'_, E> {
        Completions {
            pump: self,
            done: false,
        }
    }

    /// Stop the session.  Outstanding handles stay valid and are returned to
    /// the engine when released.
    pub fn close(&mut self) {
        if matches!(self.state, PumpState::Closed | PumpState::Uninitialized) {
            self.state = PumpState::Closed;
            return;
        }
        if let Err(code) = self.engine.reset() {
            warn!(code = code.0, "engine reset failed on close; in-flight hardware state leaked");
        }
        if let Some(pool) = &self.pool {
            info!(
                packets = self.stats.packets_submitted,
                frames = self.stats.frames_out,
                outstanding = pool.owned_slots(),
                "decode session closed"
            );
        }
        self.state = PumpState::Closed;
    }

    pub fn state(&self) -> PumpState {
        self.state
    }

    pub fn stats(&self) -> &PumpStats {
        &self.stats
    }

    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }
}

impl<E: DecodeEngine> Drop for DecodePump<E> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            PumpState::Initialized | PumpState::Running | PumpState::EosDraining
        ) && let Err(code) = self.engine.reset()
        {
            warn!(code = code.0, "engine reset failed on drop; in-flight hardware state leaked");
        }
    }
}

pub struct Completions<'a, E: DecodeEngine> {
    pump: &'a mut DecodePump<E>,
    done: bool,
}

impl<E: DecodeEngine + 'static> Iterator for Completions<'_, E> {
    type Item = Result<Option<DecodedBuffer>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pump.poll_output() {
            Ok(PollOutput::Frame(frame)) => Some(Ok(Some(frame))),
            Ok(PollOutput::WouldBlock) => Some(Ok(None)),
            Ok(PollOutput::EndOfStream) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
