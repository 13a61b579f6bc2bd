//! Out-of-band header reconstruction.
//!
//! Some engines need the codec configuration in-band, ahead of the first
//! packet.  The container carries it as extradata (`avcC`, `hvcC`) or not at
//! all (DivX 3), so the session rebuilds an Annex-B header blob from it once
//! at init.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use ionflow_core::error::{EngineError, Result};

use crate::bitreader::{BitReader, unescape_rbsp};
use crate::codec::{CodecKind, is_divx3_tag};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;
const HEVC_NAL_PPS: u8 = 34;

/// Header blob recipe, chosen by codec and codec tag.
///
/// Parameter sets are kept ordered by their id, the way the engine expects
/// them to be replayed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum HeaderRecipe {
    #[default]
    None,
    /// H.264 from `avcC`: every PPS, then every SPS.
    Avc { sps: Vec<Bytes>, pps: Vec<Bytes> },
    /// HEVC from `hvcC` or Annex-B extradata: PPS, then SPS, then VPS.
    Hevc {
        vps: Vec<Bytes>,
        sps: Vec<Bytes>,
        pps: Vec<Bytes>,
        /// Cropped size of the SPS referenced by the first PPS.
        dimensions: Option<(u32, u32)>,
    },
    /// DivX 3.11: synthetic 10-byte picture-size header.
    DivX3 { width: u32, height: u32 },
}

impl HeaderRecipe {
    pub fn from_codec_config(
        codec: CodecKind,
        codec_tag: Option<u32>,
        extradata: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Self> {
        match codec {
            CodecKind::H264 if extradata.first() == Some(&1) => parse_avcc(extradata),
            CodecKind::Hevc if !extradata.is_empty() => parse_hevc_extradata(extradata),
            CodecKind::Mpeg4 if codec_tag.is_some_and(is_divx3_tag) => {
                Ok(Self::DivX3 { width, height })
            }
            _ => Ok(Self::None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Avc { .. } => "avc",
            Self::Hevc { .. } => "hevc",
            Self::DivX3 { .. } => "divx3",
        }
    }

    /// Picture size carried by the header, if any.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Self::Hevc { dimensions, .. } => *dimensions,
            _ => None,
        }
    }

    /// The bytes to write ahead of the first packet; `None` when empty.
    pub fn build(&self) -> Option<Bytes> {
        let blob = match self {
            Self::None => return None,
            Self::Avc { sps, pps } => annexb(&[pps, sps]),
            Self::Hevc { vps, sps, pps, .. } => annexb(&[pps, sps, vps]),
            Self::DivX3 { width, height } => {
                let size = (width << 12) | (height & 0xfff);
                let mut buf = BytesMut::with_capacity(10);
                buf.put_slice(&START_CODE);
                buf.put_u8(0x20);
                buf.put_u8((size >> 16) as u8);
                buf.put_u8((size >> 8) as u8);
                buf.put_u8(size as u8);
                buf.put_u16(0);
                buf.freeze()
            }
        };
        (!blob.is_empty()).then_some(blob)
    }
}

fn annexb(groups: &[&Vec<Bytes>]) -> Bytes {
    let len = groups
        .iter()
        .flat_map(|g| g.iter())
        .map(|nal| nal.len() + START_CODE.len())
        .sum();
    let mut buf = BytesMut::with_capacity(len);
    for nal in groups.iter().flat_map(|g| g.iter()) {
        buf.put_slice(&START_CODE);
        buf.put_slice(nal);
    }
    buf.freeze()
}

// ─── Extradata parsing ───────────────────────────────────────────────────────

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            EngineError::Header(format!(
                "extradata truncated: need {len} bytes at offset {} of {}",
                self.pos,
                self.data.len()
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

fn parse_avcc(extradata: &[u8]) -> Result<HeaderRecipe> {
    let mut cur = Cursor::new(extradata);
    cur.take(5)?;
    let sps_count = cur.u8()? & 0x1f;
    let mut sps = BTreeMap::new();
    for _ in 0..sps_count {
        let len = cur.u16()? as usize;
        let nal = cur.take(len)?;
        sps.insert(h264_sps_id(nal)?, Bytes::copy_from_slice(nal));
    }
    let pps_count = cur.u8()?;
    let mut pps = BTreeMap::new();
    for _ in 0..pps_count {
        let len = cur.u16()? as usize;
        let nal = cur.take(len)?;
        pps.insert(h264_pps_id(nal)?, Bytes::copy_from_slice(nal));
    }
    Ok(HeaderRecipe::Avc {
        sps: sps.into_values().collect(),
        pps: pps.into_values().collect(),
    })
}

fn h264_nal_payload(nal: &[u8], expected: u8) -> Result<Vec<u8>> {
    let header = *nal
        .first()
        .ok_or_else(|| EngineError::Header("empty H.264 parameter set".into()))?;
    if header & 0x1f != expected {
        return Err(EngineError::Header(format!(
            "expected H.264 NAL type {expected}, found {}",
            header & 0x1f
        )));
    }
    Ok(unescape_rbsp(&nal[1..]))
}

fn h264_sps_id(nal: &[u8]) -> Result<u32> {
    let rbsp = h264_nal_payload(nal, H264_NAL_SPS)?;
    let mut r = BitReader::new(&rbsp);
    // profile_idc, constraint flags, level_idc
    r.skip_bits(24)?;
    r.read_ue()
}

fn h264_pps_id(nal: &[u8]) -> Result<u32> {
    let rbsp = h264_nal_payload(nal, H264_NAL_PPS)?;
    BitReader::new(&rbsp).read_ue()
}

/// `hvcC` when the first three bytes are not an Annex-B start code.
fn parse_hevc_extradata(extradata: &[u8]) -> Result<HeaderRecipe> {
    let is_hvcc = extradata.len() > 3
        && (extradata[0] != 0 || extradata[1] != 0 || extradata[2] > 1);
    let nals = if is_hvcc {
        hvcc_nals(extradata)?
    } else {
        split_annexb(extradata)
    };

    let mut vps = BTreeMap::new();
    let mut sps = BTreeMap::new();
    let mut pps = BTreeMap::new();
    for nal in nals {
        if nal.len() < 2 {
            continue;
        }
        let rbsp = unescape_rbsp(&nal[2..]);
        match (nal[0] >> 1) & 0x3f {
            HEVC_NAL_VPS => {
                let id = BitReader::new(&rbsp).read_bits(4)?;
                vps.insert(id, Bytes::copy_from_slice(nal));
            }
            HEVC_NAL_SPS => {
                let info = parse_hevc_sps(&rbsp)?;
                sps.insert(info.id, (Bytes::copy_from_slice(nal), info));
            }
            HEVC_NAL_PPS => {
                let mut r = BitReader::new(&rbsp);
                let id = r.read_ue()?;
                let sps_id = r.read_ue()?;
                pps.insert(id, (Bytes::copy_from_slice(nal), sps_id));
            }
            _ => {}
        }
    }

    let dimensions = pps
        .values()
        .next()
        .and_then(|(_, sps_id)| sps.get(sps_id))
        .map(|(_, info)| (info.width, info.height));

    Ok(HeaderRecipe::Hevc {
        vps: vps.into_values().collect(),
        sps: sps.into_values().map(|(nal, _)| nal).collect(),
        pps: pps.into_values().map(|(nal, _)| nal).collect(),
        dimensions,
    })
}

fn hvcc_nals(extradata: &[u8]) -> Result<Vec<&[u8]>> {
    let mut cur = Cursor::new(extradata);
    cur.take(22)?;
    let arrays = cur.u8()?;
    let mut nals = Vec::new();
    for _ in 0..arrays {
        // array_completeness, reserved, NAL_unit_type
        cur.u8()?;
        let count = cur.u16()?;
        for _ in 0..count {
            let len = cur.u16()? as usize;
            nals.push(cur.take(len)?);
        }
    }
    Ok(nals)
}

fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    starts
        .iter()
        .enumerate()
        .map(|(n, &start)| {
            let mut end = starts.get(n + 1).map_or(data.len(), |next| next - 3);
            while end > start && data[end - 1] == 0 {
                end -= 1;
            }
            &data[start..end]
        })
        .filter(|nal| !nal.is_empty())
        .collect()
}

struct HevcSps {
    id: u32,
    width: u32,
    height: u32,
}

fn parse_hevc_sps(rbsp: &[u8]) -> Result<HevcSps> {
    let mut r = BitReader::new(rbsp);
    r.read_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers = r.read_bits(3)? as usize;
    r.read_bit()?; // temporal_id_nesting
    skip_profile_tier_level(&mut r, max_sub_layers)?;

    let id = r.read_ue()?;
    let chroma_format_idc = r.read_ue()?;
    if chroma_format_idc > 3 {
        return Err(EngineError::Header(format!(
            "invalid chroma_format_idc {chroma_format_idc}"
        )));
    }
    let separate_planes = chroma_format_idc == 3 && r.read_bit()?;
    let mut width = r.read_ue()?;
    let mut height = r.read_ue()?;

    if r.read_bit()? {
        let (sub_w, sub_h) = match (chroma_format_idc, separate_planes) {
            (1, _) => (2, 2),
            (2, _) => (2, 1),
            _ => (1, 1),
        };
        let left = r.read_ue()?;
        let right = r.read_ue()?;
        let top = r.read_ue()?;
        let bottom = r.read_ue()?;
        width = width.saturating_sub(sub_w * (left + right));
        height = height.saturating_sub(sub_h * (top + bottom));
    }
    Ok(HevcSps { id, width, height })
}

fn skip_profile_tier_level(r: &mut BitReader<'_>, max_sub_layers: usize) -> Result<()> {
    // general profile (88 bits) + general_level_idc
    r.skip_bits(88 + 8)?;
    let mut present = [(false, false); 8];
    for flags in present.iter_mut().take(max_sub_layers) {
        *flags = (r.read_bit()?, r.read_bit()?);
    }
    if max_sub_layers > 0 {
        r.skip_bits(2 * (8 - max_sub_layers))?;
    }
    for &(profile, level) in present.iter().take(max_sub_layers) {
        if profile {
            r.skip_bits(88)?;
        }
        if level {
            r.skip_bits(8)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fourcc;

    struct BitWriter {
        bytes: Vec<u8>,
        bit: usize,
    }

    impl BitWriter {
        fn new(header: &[u8]) -> Self {
            Self {
                bytes: header.to_vec(),
                bit: header.len() * 8,
            }
        }

        fn put(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                if self.bit % 8 == 0 {
                    self.bytes.push(0);
                }
                if (value >> i) & 1 == 1 {
                    let last = self.bytes.len() - 1;
                    self.bytes[last] |= 0x80 >> (self.bit % 8);
                }
                self.bit += 1;
            }
        }

        fn put_ue(&mut self, value: u32) {
            let v = value as u64 + 1;
            let len = 64 - v.leading_zeros();
            self.put(0, len - 1);
            self.put(v as u32, len);
        }

        /// Stop bit, then emulation prevention.
        fn finish(mut self) -> Vec<u8> {
            self.put(1, 1);
            let mut out = Vec::new();
            let mut zeros = 0;
            for b in self.bytes {
                if zeros >= 2 && b <= 3 {
                    out.push(3);
                    zeros = 0;
                }
                zeros = if b == 0 { zeros + 1 } else { 0 };
                out.push(b);
            }
            out
        }
    }

    fn hevc_sps(id: u32, width: u32, height: u32, crop_bottom: u32) -> Vec<u8> {
        let mut w = BitWriter::new(&[0x42, 0x01]);
        w.put(0, 4);
        w.put(1, 3); // one sub-layer beyond the base
        w.put(1, 1);
        w.put(0, 32);
        w.put(0, 32);
        w.put(0, 24);
        w.put(0, 8); // general_level_idc
        w.put(0b10, 2); // sub-layer profile present, level absent
        w.put(0, 14);
        w.put(0, 32);
        w.put(0, 32);
        w.put(0, 24);
        w.put_ue(id);
        w.put_ue(1);
        w.put_ue(width);
        w.put_ue(height);
        w.put(1, 1);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(0);
        w.put_ue(crop_bottom);
        w.finish()
    }

    fn hevc_pps(id: u32, sps_id: u32) -> Vec<u8> {
        let mut w = BitWriter::new(&[0x44, 0x01]);
        w.put_ue(id);
        w.put_ue(sps_id);
        w.finish()
    }

    const HEVC_VPS: [u8; 6] = [0x40, 0x01, 0x0c, 0x01, 0xff, 0xff];

    fn hvcc(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend_from_slice(&[0; 20]);
        out.push(0x0f);
        out.push(nals.len() as u8);
        for nal in nals {
            out.push(0x80 | ((nal[0] >> 1) & 0x3f));
            out.extend_from_slice(&1u16.to_be_bytes());
            out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            out.extend_from_slice(nal);
        }
        out
    }

    fn concat(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| START_CODE.iter().chain(p.iter())).copied().collect()
    }

    #[test]
    fn avcc_emits_pps_then_sps_in_id_order() {
        let sps1 = [0x67, 0x64, 0x00, 0x1f, 0x40];
        let sps0 = [0x67, 0x64, 0x00, 0x1f, 0xac];
        let pps0 = [0x68, 0xce, 0x3c, 0x80];
        let mut avcc = vec![1, 0x64, 0, 0x1f, 0xff, 0xe2];
        for sps in [&sps1[..], &sps0[..]] {
            avcc.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            avcc.extend_from_slice(sps);
        }
        avcc.push(1);
        avcc.extend_from_slice(&(pps0.len() as u16).to_be_bytes());
        avcc.extend_from_slice(&pps0);

        let recipe = HeaderRecipe::from_codec_config(CodecKind::H264, None, &avcc, 0, 0)
            .expect("avcC parses");
        assert_eq!(recipe.kind(), "avc");
        let blob = recipe.build().expect("header");
        assert_eq!(&blob[..], &concat(&[&pps0, &sps0, &sps1])[..]);
    }

    #[test]
    fn h264_without_avcc_has_no_header() {
        let annexb = [0, 0, 0, 1, 0x67, 0x64];
        let recipe = HeaderRecipe::from_codec_config(CodecKind::H264, None, &annexb, 0, 0)
            .expect("no header");
        assert_eq!(recipe, HeaderRecipe::None);
        assert!(recipe.build().is_none());
    }

    #[test]
    fn truncated_avcc_is_an_error() {
        let err = HeaderRecipe::from_codec_config(CodecKind::H264, None, &[1, 0x64, 0, 0x1f, 0xff, 0xe1, 0, 9], 0, 0)
            .expect_err("truncated");
        assert_eq!(err.error_code(), 404);
    }

    #[test]
    fn hvcc_orders_pps_sps_vps_and_reports_cropped_size() {
        let sps = hevc_sps(0, 1920, 1088, 4);
        let pps = hevc_pps(0, 0);
        let extradata = hvcc(&[&HEVC_VPS, &sps, &pps]);

        let recipe = HeaderRecipe::from_codec_config(CodecKind::Hevc, None, &extradata, 0, 0)
            .expect("hvcC parses");
        assert_eq!(recipe.dimensions(), Some((1920, 1080)));
        let blob = recipe.build().expect("header");
        assert_eq!(&blob[..], &concat(&[&pps, &sps, &HEVC_VPS])[..]);
    }

    #[test]
    fn hevc_dimensions_follow_the_first_pps() {
        let sps0 = hevc_sps(0, 640, 480, 0);
        let sps1 = hevc_sps(1, 1280, 720, 0);
        let pps = hevc_pps(0, 1);
        let extradata = concat(&[&HEVC_VPS, &sps0, &sps1, &pps]);

        let recipe = HeaderRecipe::from_codec_config(CodecKind::Hevc, None, &extradata, 0, 0)
            .expect("annex-b parses");
        assert_eq!(recipe.dimensions(), Some((1280, 720)));
        let HeaderRecipe::Hevc { sps, .. } = &recipe else {
            panic!("expected hevc recipe");
        };
        assert_eq!(sps.len(), 2);
    }

    #[test]
    fn divx3_header_packs_picture_size() {
        let recipe =
            HeaderRecipe::from_codec_config(CodecKind::Mpeg4, Some(fourcc(b"DIV3")), &[], 640, 480)
                .expect("divx3");
        let blob = recipe.build().expect("header");
        assert_eq!(&blob[..], &[0, 0, 0, 1, 0x20, 0x28, 0x01, 0xe0, 0, 0]);

        let xvid =
            HeaderRecipe::from_codec_config(CodecKind::Mpeg4, Some(fourcc(b"XVID")), &[], 640, 480)
                .expect("xvid");
        assert!(xvid.build().is_none());
    }
}
