//! Codec identity → engine stream type and stream format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use ionflow_core::error::{EngineError, Result};

/// Codecs the decode engine accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264,
    #[serde(alias = "h265")]
    Hevc,
    #[serde(alias = "mpeg1video")]
    Mpeg1,
    #[serde(alias = "mpeg2video")]
    Mpeg2,
    Vp9,
    Vc1,
    Wmv3,
    Mpeg4,
    H263,
    #[serde(alias = "flv")]
    Flv1,
}

/// Engine stream type (demux family).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    H264,
    Hevc,
    Mpeg12,
    Vp9,
    Vc1,
    Mpeg4,
}

/// Engine stream format (bitstream variant within a type).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFormat {
    Unknown,
    H264,
    Hevc,
    Vp9,
    Wvc1,
    Wmv3,
    H263,
    /// DivX 3.11 family.
    Mpeg4_3,
    /// DivX 4.
    Mpeg4_4,
    /// DivX 5+, Xvid and ISO MPEG-4 part 2.
    Mpeg4_5,
}

impl CodecKind {
    pub const ALL: [CodecKind; 10] = [
        Self::H264,
        Self::Hevc,
        Self::Mpeg1,
        Self::Mpeg2,
        Self::Vp9,
        Self::Vc1,
        Self::Wmv3,
        Self::Mpeg4,
        Self::H263,
        Self::Flv1,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Mpeg1 => "mpeg1",
            Self::Mpeg2 => "mpeg2",
            Self::Vp9 => "vp9",
            Self::Vc1 => "vc1",
            Self::Wmv3 => "wmv3",
            Self::Mpeg4 => "mpeg4",
            Self::H263 => "h263",
            Self::Flv1 => "flv1",
        }
    }

    pub fn stream_type(self) -> StreamType {
        match self {
            Self::H264 => StreamType::H264,
            Self::Hevc => StreamType::Hevc,
            Self::Mpeg1 | Self::Mpeg2 => StreamType::Mpeg12,
            Self::Vp9 => StreamType::Vp9,
            Self::Vc1 | Self::Wmv3 => StreamType::Vc1,
            Self::Mpeg4 | Self::H263 | Self::Flv1 => StreamType::Mpeg4,
        }
    }

    /// Stream format before codec-tag refinement.
    pub fn default_format(self) -> StreamFormat {
        match self {
            Self::H264 => StreamFormat::H264,
            Self::Hevc => StreamFormat::Hevc,
            Self::Vp9 => StreamFormat::Vp9,
            Self::Vc1 => StreamFormat::Wvc1,
            Self::Wmv3 => StreamFormat::Wmv3,
            Self::H263 | Self::Flv1 => StreamFormat::H263,
            Self::Mpeg1 | Self::Mpeg2 | Self::Mpeg4 => StreamFormat::Unknown,
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodecKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let alias = match lower.as_str() {
            "h265" => Some(Self::Hevc),
            "mpeg1video" => Some(Self::Mpeg1),
            "mpeg2video" => Some(Self::Mpeg2),
            "flv" => Some(Self::Flv1),
            _ => None,
        };
        alias
            .or_else(|| Self::ALL.into_iter().find(|c| c.name() == lower))
            .ok_or_else(|| EngineError::UnsupportedCodec(s.to_string()))
    }
}

// ─── Codec tags ──────────────────────────────────────────────────────────────

/// Little-endian FourCC, as stored in container codec tags.
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    (tag[0] as u32) | ((tag[1] as u32) << 8) | ((tag[2] as u32) << 16) | ((tag[3] as u32) << 24)
}

/// Parse a four-character tag such as `"DIV3"`.
pub fn parse_fourcc(s: &str) -> Result<u32> {
    let bytes: [u8; 4] = s
        .as_bytes()
        .try_into()
        .map_err(|_| EngineError::Config(format!("codec tag '{s}' must be four ASCII characters")))?;
    Ok(fourcc(&bytes))
}

const TAG_FORMATS: [(&[u8; 4], StreamFormat); 21] = [
    (b"MP4V", StreamFormat::Mpeg4_5),
    (b"mp4v", StreamFormat::Mpeg4_5),
    (b"RMP4", StreamFormat::Mpeg4_5),
    (b"MPG4", StreamFormat::Mpeg4_5),
    (b"DIV6", StreamFormat::Mpeg4_5),
    (b"DIV5", StreamFormat::Mpeg4_5),
    (b"DX50", StreamFormat::Mpeg4_5),
    (b"M4S2", StreamFormat::Mpeg4_5),
    (b"FMP4", StreamFormat::Mpeg4_5),
    (b"FVFW", StreamFormat::Mpeg4_5),
    (b"XVID", StreamFormat::Mpeg4_5),
    (b"xvid", StreamFormat::Mpeg4_5),
    (b"XVIX", StreamFormat::Mpeg4_5),
    (b"3IV2", StreamFormat::Mpeg4_5),
    (b"3iv2", StreamFormat::Mpeg4_5),
    (b"DIV4", StreamFormat::Mpeg4_4),
    (b"DIVX", StreamFormat::Mpeg4_4),
    (b"divx", StreamFormat::Mpeg4_4),
    (b"COL1", StreamFormat::Mpeg4_3),
    (b"DIV3", StreamFormat::Mpeg4_3),
    (b"MP43", StreamFormat::Mpeg4_3),
];

pub fn format_for_tag(tag: u32) -> Option<StreamFormat> {
    TAG_FORMATS
        .iter()
        .find(|(t, _)| fourcc(t) == tag)
        .map(|(_, f)| *f)
}

/// Whether `tag` selects the DivX 3 family, which needs a synthetic header.
pub fn is_divx3_tag(tag: u32) -> bool {
    format_for_tag(tag) == Some(StreamFormat::Mpeg4_3)
}

/// Final stream format: the codec default, refined by the tag when unknown.
pub fn resolve_stream_format(codec: CodecKind, codec_tag: Option<u32>) -> StreamFormat {
    match (codec.default_format(), codec_tag) {
        (StreamFormat::Unknown, Some(tag)) => format_for_tag(tag).unwrap_or(StreamFormat::Unknown),
        (format, _) => format,
    }
}

/// Engine frame duration in 90 kHz ticks, rounded to nearest; 0 if unknown.
pub fn engine_rate(fps_num: u32, fps_den: u32) -> u32 {
    if fps_num == 0 {
        return 0;
    }
    let num = fps_num as u64;
    ((90_000 * fps_den as u64 + num / 2) / num) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_map_matches_engine_families() {
        assert_eq!(CodecKind::Mpeg2.stream_type(), StreamType::Mpeg12);
        assert_eq!(CodecKind::Wmv3.stream_type(), StreamType::Vc1);
        assert_eq!(CodecKind::Wmv3.default_format(), StreamFormat::Wmv3);
        assert_eq!(CodecKind::Vc1.default_format(), StreamFormat::Wvc1);
        assert_eq!(CodecKind::Flv1.stream_type(), StreamType::Mpeg4);
        assert_eq!(CodecKind::Flv1.default_format(), StreamFormat::H263);
    }

    #[test]
    fn mpeg4_tags_refine_unknown_format() {
        assert_eq!(
            resolve_stream_format(CodecKind::Mpeg4, Some(fourcc(b"XVID"))),
            StreamFormat::Mpeg4_5
        );
        assert_eq!(
            resolve_stream_format(CodecKind::Mpeg4, Some(fourcc(b"DIVX"))),
            StreamFormat::Mpeg4_4
        );
        assert_eq!(
            resolve_stream_format(CodecKind::Mpeg4, Some(fourcc(b"MP43"))),
            StreamFormat::Mpeg4_3
        );
        assert_eq!(
            resolve_stream_format(CodecKind::Mpeg4, Some(fourcc(b"ABCD"))),
            StreamFormat::Unknown
        );
        // Known defaults are never overridden by the tag.
        assert_eq!(
            resolve_stream_format(CodecKind::H264, Some(fourcc(b"DIV3"))),
            StreamFormat::H264
        );
        assert!(is_divx3_tag(fourcc(b"COL1")));
        assert!(!is_divx3_tag(fourcc(b"DX50")));
    }

    #[test]
    fn fourcc_is_little_endian() {
        assert_eq!(fourcc(b"DIV3"), 0x3356_4944);
        assert_eq!(parse_fourcc("DIV3").expect("tag"), fourcc(b"DIV3"));
        assert!(parse_fourcc("DIV").is_err());
    }

    #[test]
    fn rate_rounds_to_nearest_tick() {
        assert_eq!(engine_rate(25, 1), 3_600);
        assert_eq!(engine_rate(30_000, 1_001), 3_003);
        assert_eq!(engine_rate(24_000, 1_001), 3_754);
        assert_eq!(engine_rate(0, 1), 0);
    }

    #[test]
    fn codec_names_parse_with_aliases() {
        assert_eq!("h265".parse::<CodecKind>().ok(), Some(CodecKind::Hevc));
        assert_eq!("MPEG2VIDEO".parse::<CodecKind>().ok(), Some(CodecKind::Mpeg2));
        for codec in CodecKind::ALL {
            assert_eq!(codec.name().parse::<CodecKind>().ok(), Some(codec));
        }
        let err = "av1".parse::<CodecKind>().expect_err("unsupported");
        assert_eq!(err.error_code(), 402);
    }
}
