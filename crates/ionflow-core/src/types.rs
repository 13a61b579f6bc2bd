//! Pixel formats, plane geometry and engine timestamps.
//!
//! Buffer layout inside a physical buffer is packed: planes follow each other
//! with no padding between rows (`linesize` is the unaligned line size), and
//! chroma planes use the format's vertical subsampling for their row count.
//! Both software engines and host mappings use this layout.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Line alignment used when sizing pool buffers.
pub const BUFFER_LINE_ALIGN: usize = 32;

/// Fixed clock of the hardware engines (ticks per second).
pub const ENGINE_CLOCK_HZ: u64 = 90_000;

/// Engine timestamp reserved for "unknown".
pub const UNKNOWN_TIMESTAMP: u64 = 0;

// ─── Pixel formats ───────────────────────────────────────────────────────────

/// Pixel formats a device buffer can hold.
///
/// Names follow the ffmpeg convention (`nv21`, `yuv420p`, `gray`, …) for
/// parsing, display and serde.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Y plane + interleaved UV, 4:2:0.
    Nv12,
    /// Y plane + interleaved VU, 4:2:0.  Native decoder output.
    Nv21,
    /// Y plane + interleaved UV, 4:2:2.
    Nv16,
    /// Three planes Y, U, V, 4:2:0.
    Yuv420p,
    /// Packed Y0 U Y1 V, 4:2:2.
    Yuyv422,
    /// Single luma plane.
    #[serde(rename = "gray", alias = "gray8")]
    Gray8,
    Rgba,
    Rgb0,
    Bgra,
    Rgb24,
    Rgb565,
}

/// One plane of a [`PixelFormat`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneDesc {
    /// Horizontal subsampling shift (log2).
    pub h_shift: u8,
    /// Vertical subsampling shift (log2).
    pub v_shift: u8,
    /// Bytes per horizontally subsampled unit.
    pub unit_bytes: usize,
}

const fn plane(h_shift: u8, v_shift: u8, unit_bytes: usize) -> PlaneDesc {
    PlaneDesc {
        h_shift,
        v_shift,
        unit_bytes,
    }
}

const LUMA: PlaneDesc = plane(0, 0, 1);

impl PixelFormat {
    /// Every format known to ionflow, in device-table order (NV12 last).
    pub const ALL: [PixelFormat; 11] = [
        Self::Rgba,
        Self::Rgb0,
        Self::Rgb24,
        Self::Rgb565,
        Self::Bgra,
        Self::Yuv420p,
        Self::Gray8,
        Self::Nv16,
        Self::Nv21,
        Self::Yuyv422,
        Self::Nv12,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Nv12 => "nv12",
            Self::Nv21 => "nv21",
            Self::Nv16 => "nv16",
            Self::Yuv420p => "yuv420p",
            Self::Yuyv422 => "yuyv422",
            Self::Gray8 => "gray",
            Self::Rgba => "rgba",
            Self::Rgb0 => "rgb0",
            Self::Bgra => "bgra",
            Self::Rgb24 => "rgb24",
            Self::Rgb565 => "rgb565",
        }
    }

    pub fn planes(self) -> &'static [PlaneDesc] {
        const NV420: [PlaneDesc; 2] = [LUMA, plane(1, 1, 2)];
        const NV422: [PlaneDesc; 2] = [LUMA, plane(1, 0, 2)];
        const YUV420: [PlaneDesc; 3] = [LUMA, plane(1, 1, 1), plane(1, 1, 1)];
        const PACKED_422: [PlaneDesc; 1] = [plane(1, 0, 4)];
        const GRAY: [PlaneDesc; 1] = [LUMA];
        const BPP4: [PlaneDesc; 1] = [plane(0, 0, 4)];
        const BPP3: [PlaneDesc; 1] = [plane(0, 0, 3)];
        const BPP2: [PlaneDesc; 1] = [plane(0, 0, 2)];
        match self {
            Self::Nv12 | Self::Nv21 => &NV420,
            Self::Nv16 => &NV422,
            Self::Yuv420p => &YUV420,
            Self::Yuyv422 => &PACKED_422,
            Self::Gray8 => &GRAY,
            Self::Rgba | Self::Rgb0 | Self::Bgra => &BPP4,
            Self::Rgb24 => &BPP3,
            Self::Rgb565 => &BPP2,
        }
    }

    /// Chroma subsampling shifts `(h, v)`; zero for formats without chroma planes.
    pub fn chroma_shift(self) -> (u8, u8) {
        match self {
            Self::Nv12 | Self::Nv21 | Self::Yuv420p => (1, 1),
            Self::Nv16 | Self::Yuyv422 => (1, 0),
            _ => (0, 0),
        }
    }

    pub fn is_yuv(self) -> bool {
        !matches!(
            self,
            Self::Rgba | Self::Rgb0 | Self::Bgra | Self::Rgb24 | Self::Rgb565
        )
    }

    /// Unaligned bytes per row of `plane` for a frame `width` pixels wide.
    pub fn linesize(self, plane: usize, width: u32) -> usize {
        self.planes()
            .get(plane)
            .map(|p| ceil_rshift(width, p.h_shift) as usize * p.unit_bytes)
            .unwrap_or(0)
    }

    /// Row count of `plane` for a frame `height` pixels tall.
    pub fn plane_rows(self, plane: usize, height: u32) -> usize {
        self.planes()
            .get(plane)
            .map(|p| ceil_rshift(height, p.v_shift) as usize)
            .unwrap_or(0)
    }

    /// Bytes needed to store one frame with every line aligned to `align`.
    ///
    /// This is how pool buffers are sized; it is always at least
    /// [`packed_size`](Self::packed_size) for the same geometry.
    pub fn buffer_size(self, width: u32, height: u32, align: usize) -> usize {
        (0..self.planes().len())
            .map(|i| align_up(self.linesize(i, width), align) * self.plane_rows(i, height))
            .sum()
    }

    /// Bytes of the packed layout used by mappings and software engines.
    pub fn packed_size(self, width: u32, height: u32) -> usize {
        self.plane_layout(width, height)
            .iter()
            .map(|p| p.linesize * p.rows)
            .sum()
    }

    /// Packed plane layout for a `width`×`height` frame.
    pub fn plane_layout(self, width: u32, height: u32) -> Vec<PlaneLayout> {
        let mut offset = 0;
        (0..self.planes().len())
            .map(|i| {
                let layout = PlaneLayout {
                    offset,
                    linesize: self.linesize(i, width),
                    rows: self.plane_rows(i, height),
                };
                offset += layout.linesize * layout.rows;
                layout
            })
            .collect()
    }
}

/// Placement of one plane inside a packed buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneLayout {
    pub offset: usize,
    pub linesize: usize,
    pub rows: usize,
}

impl PlaneLayout {
    pub fn len(&self) -> usize {
        self.linesize * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "gray8" {
            return Ok(Self::Gray8);
        }
        Self::ALL
            .into_iter()
            .find(|fmt| fmt.name() == lower)
            .ok_or_else(|| EngineError::Config(format!("Invalid output format {s}")))
    }
}

// ─── Geometry helpers ────────────────────────────────────────────────────────

#[inline]
pub fn align_up(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// `ceil(value / 2^shift)`.
#[inline]
pub fn ceil_rshift(value: u32, shift: u8) -> u32 {
    if shift == 0 {
        value
    } else {
        value.div_ceil(1 << shift)
    }
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

/// Rescale a presentation timestamp in microseconds to the engine clock.
///
/// The result is offset by one so that [`UNKNOWN_TIMESTAMP`] stays free;
/// negative (unknown) inputs map to it.
#[inline]
pub fn engine_timestamp(pts_us: i64) -> u64 {
    if pts_us < 0 {
        return UNKNOWN_TIMESTAMP;
    }
    (pts_us as u64).saturating_mul(ENGINE_CLOCK_HZ / 1_000) / 1_000 + 1
}

/// Inverse of [`engine_timestamp`] (truncating); `None` for unknown.
#[inline]
pub fn engine_timestamp_to_micros(ts: u64) -> Option<i64> {
    if ts == UNKNOWN_TIMESTAMP {
        return None;
    }
    Some(((ts - 1).saturating_mul(1_000) / (ENGINE_CLOCK_HZ / 1_000)) as i64)
}
