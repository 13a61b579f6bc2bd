//! Stream-side seams shared across crate boundaries.
//!
//! Compressed packets come in through a [`PacketSource`]; finished frames
//! leave through a [`FrameSink`].  Both live here so the decode, scale and
//! pipeline crates agree on them without depending on each other.

use bytes::Bytes;

use crate::error::Result;
use crate::pool::DecodedBuffer;

// ─── Packet source (demuxer → decode pump) ───────────────────────────────────

/// Demuxed compressed packets (host-side, NOT raw pixels).
pub trait PacketSource: Send {
    /// Next packet, or `None` at end-of-stream.
    fn read_packet(&mut self) -> Result<Option<Packet>>;
}

/// One compressed access unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    /// Presentation timestamp in microseconds; negative when unknown.
    pub pts: i64,
    pub is_keyframe: bool,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, pts: i64) -> Self {
        Self {
            data: data.into(),
            pts,
            is_keyframe: false,
        }
    }

    /// The empty packet that signals end-of-stream to the decode pump.
    pub fn eos() -> Self {
        Self {
            data: Bytes::new(),
            pts: -1,
            is_keyframe: false,
        }
    }

    pub fn keyframe(mut self) -> Self {
        self.is_keyframe = true;
        self
    }

    pub fn is_eos(&self) -> bool {
        self.data.is_empty()
    }
}

// ─── Frame sink (pipeline → consumer) ────────────────────────────────────────

/// Receives finished frames.
///
/// Taking the handle by value makes the sink responsible for releasing it
/// exactly once; dropping it is the release.
pub trait FrameSink: Send {
    fn consume(&mut self, frame: DecodedBuffer) -> Result<()>;

    /// Called once after the last frame.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_packet_is_eos() {
        assert!(Packet::eos().is_eos());
        assert!(Packet::new(Vec::new(), 0).is_eos());
        let pkt = Packet::new(vec![0, 0, 1], 40_000).keyframe();
        assert!(!pkt.is_eos());
        assert!(pkt.is_keyframe);
        assert_eq!(pkt.data.len(), 3);
    }
}
