//! Packet sources and frame sinks that need no container or display.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, info};

use ionflow_core::codec_traits::{FrameSink, Packet, PacketSource};
use ionflow_core::error::Result;
use ionflow_core::host::{FNV_OFFSET, fnv1a_extend};
use ionflow_core::pool::DecodedBuffer;

// ─── Sources ─────────────────────────────────────────────────────────────────

/// Replays a fixed list of packets.
#[derive(Debug, Default)]
pub struct MemoryPacketSource {
    packets: VecDeque<Packet>,
}

impl MemoryPacketSource {
    pub fn new(packets: impl IntoIterator<Item = Packet>) -> Self {
        Self {
            packets: packets.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.packets.len()
    }
}

impl PacketSource for MemoryPacketSource {
    fn read_packet(&mut self) -> Result<Option<Packet>> {
        Ok(self.packets.pop_front())
    }
}

/// Generates `count` opaque packets at a fixed frame rate.
///
/// Payloads are deterministic filler; every `gop`-th packet is a keyframe.
#[derive(Debug)]
pub struct SyntheticPacketSource {
    count: u64,
    next: u64,
    fps_num: u32,
    fps_den: u32,
    gop: u64,
    payload_len: usize,
}

impl SyntheticPacketSource {
    pub fn new(count: u64, fps_num: u32, fps_den: u32) -> Self {
        Self {
            count,
            next: 0,
            fps_num: fps_num.max(1),
            fps_den: fps_den.max(1),
            gop: 12,
            payload_len: 256,
        }
    }

    pub fn with_gop(mut self, gop: u64) -> Self {
        self.gop = gop.max(1);
        self
    }

    /// Presentation time of packet `index` in microseconds.
    pub fn pts_of(&self, index: u64) -> i64 {
        (index * 1_000_000 * self.fps_den as u64 / self.fps_num as u64) as i64
    }
}

impl PacketSource for SyntheticPacketSource {
    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.next >= self.count {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        let payload: Vec<u8> = (0..self.payload_len)
            .map(|i| (index as usize).wrapping_add(i) as u8)
            .collect();
        let packet = Packet::new(Bytes::from(payload), self.pts_of(index));
        Ok(Some(if index % self.gop == 0 {
            packet.keyframe()
        } else {
            packet
        }))
    }
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Maps every frame, folds its planes into a running FNV-1a hash and
/// releases it.
#[derive(Debug)]
pub struct ChecksumSink {
    checksum: u64,
    frames: u64,
    timestamps: Vec<u64>,
    finished: bool,
}

impl Default for ChecksumSink {
    fn default() -> Self {
        Self {
            checksum: FNV_OFFSET,
            frames: 0,
            timestamps: Vec::new(),
            finished: false,
        }
    }
}

impl ChecksumSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// The checksum as 16 hex digits.
    pub fn checksum_hex(&self) -> String {
        format!("{:016x}", self.checksum)
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Engine timestamps in arrival order.
    pub fn timestamps(&self) -> &[u64] {
        &self.timestamps
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl FrameSink for ChecksumSink {
    fn consume(&mut self, frame: DecodedBuffer) -> Result<()> {
        {
            let mapped = frame.map()?;
            for plane in 0..mapped.plane_count() {
                if let Some(bytes) = mapped.plane(plane) {
                    self.checksum = fnv1a_extend(self.checksum, bytes);
                }
            }
        }
        self.frames += 1;
        self.timestamps.push(frame.timestamp());
        debug!(
            slot = frame.index(),
            timestamp = frame.timestamp(),
            width = frame.width(),
            height = frame.height(),
            "frame checksummed"
        );
        frame.release();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        info!(frames = self.frames, checksum = %self.checksum_hex(), "checksum sink finished");
        Ok(())
    }
}
