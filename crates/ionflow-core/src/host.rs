//! Host-memory frames used for uploads and downloads.

use crate::types::PixelFormat;

/// A CPU-side frame with tightly packed planes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    planes: Vec<Vec<u8>>,
}

impl HostFrame {
    /// Zero-filled frame.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let planes = (0..format.planes().len())
            .map(|i| vec![0u8; format.linesize(i, width) * format.plane_rows(i, height)])
            .collect();
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn linesize(&self, plane: usize) -> usize {
        self.format.linesize(plane, self.width)
    }

    pub fn rows(&self, plane: usize) -> usize {
        self.format.plane_rows(plane, self.height)
    }

    pub fn plane(&self, plane: usize) -> &[u8] {
        self.planes.get(plane).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        self.planes
            .get_mut(plane)
            .map(Vec::as_mut_slice)
            .unwrap_or(&mut [])
    }

    pub fn fill_plane(&mut self, plane: usize, value: u8) {
        self.plane_mut(plane).fill(value);
    }

    /// Deterministic FNV-1a 64-bit hash over all planes.
    pub fn checksum(&self) -> u64 {
        self.planes
            .iter()
            .fold(FNV_OFFSET, |hash, plane| fnv1a_extend(hash, plane))
    }
}

pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;

/// Continue an FNV-1a 64-bit hash over `bytes`.
pub fn fnv1a_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
