//! MSB-first bit reader over NAL payloads.

use ionflow_core::error::{EngineError, Result};

/// Strip emulation-prevention bytes (`00 00 03` → `00 00`).
pub fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0usize;
    for &byte in nal {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if byte == 0 { zeros + 1 } else { 0 };
        out.push(byte);
    }
    out
}

pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        if self.pos >= self.data.len() * 8 {
            return Err(EngineError::Header(format!(
                "bitstream truncated at bit {}",
                self.pos
            )));
        }
        let byte = self.data[self.pos / 8];
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read up to 32 bits.
    pub fn read_bits(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as u32;
        }
        Ok(value)
    }

    pub fn skip_bits(&mut self, count: usize) -> Result<()> {
        if count > self.bits_left() {
            return Err(EngineError::Header(format!(
                "cannot skip {count} bits with {} left",
                self.bits_left()
            )));
        }
        self.pos += count;
        Ok(())
    }

    /// Unsigned Exp-Golomb.
    pub fn read_ue(&mut self) -> Result<u32> {
        let mut leading = 0u32;
        while !self.read_bit()? {
            leading += 1;
            if leading > 31 {
                return Err(EngineError::Header("exp-golomb code too long".into()));
            }
        }
        if leading == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading)? as u64;
        Ok(((1u64 << leading) - 1 + suffix) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fixed_and_golomb_fields() {
        // 101 | 1 | 010 | 011 | 00100 | pad
        let data = [0b1011_0100, 0b1100_1000];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bits(3).expect("bits"), 0b101);
        assert_eq!(r.read_ue().expect("ue"), 0);
        assert_eq!(r.read_ue().expect("ue"), 1);
        assert_eq!(r.read_ue().expect("ue"), 2);
        assert_eq!(r.read_ue().expect("ue"), 3);
        assert_eq!(r.bits_left(), 1);
        assert!(r.read_bits(2).is_err());
    }

    #[test]
    fn emulation_prevention_is_removed() {
        assert_eq!(
            unescape_rbsp(&[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03]),
            vec![0x00, 0x00, 0x01, 0x00, 0x00]
        );
        assert_eq!(unescape_rbsp(&[0x00, 0x03, 0x00]), vec![0x00, 0x03, 0x00]);
    }
}
