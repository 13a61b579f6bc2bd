//! Pipeline configuration, loaded from schema-versioned JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ionflow_core::context::DeviceContext;
use ionflow_core::error::{EngineError, Result};
use ionflow_decode::pump::DecoderConfig;
use ionflow_scale::scale::ScaleConfig;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

fn default_initial_delay_us() -> u64 {
    100
}

fn default_max_delay_us() -> u64 {
    10_000
}

fn default_stall_timeout_ms() -> u64 {
    5_000
}

/// Retry policy for would-block outcomes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    /// First sleep after an idle poll.
    #[serde(default = "default_initial_delay_us")]
    pub initial_delay_us: u64,
    /// Sleeps double up to this cap.
    #[serde(default = "default_max_delay_us")]
    pub max_delay_us: u64,
    /// Consecutive idle time after which the run fails as stalled.  0 disables.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_us: default_initial_delay_us(),
            max_delay_us: default_max_delay_us(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_us == 0 {
            return Err(EngineError::Config(
                "backoff initial_delay_us must be at least 1".into(),
            ));
        }
        if self.max_delay_us < self.initial_delay_us {
            return Err(EngineError::Config(format!(
                "backoff max_delay_us ({}) is below initial_delay_us ({})",
                self.max_delay_us, self.initial_delay_us
            )));
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        match self.stall_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub config_schema_version: u32,
    pub decoder: DecoderConfig,
    /// Scale stage; frames pass through untouched when absent.
    #[serde(default)]
    pub scale: Option<ScaleConfig>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Stop after this many frames reach the sink.
    #[serde(default)]
    pub max_frames: Option<u64>,
    /// Device memory cap in bytes.  0 = unlimited.
    #[serde(default)]
    pub memory_limit_bytes: usize,
    /// Fail allocations over the cap instead of warning.
    #[serde(default)]
    pub strict_memory_limit: bool,
}

impl PipelineConfig {
    pub fn new(decoder: DecoderConfig) -> Self {
        Self {
            config_schema_version: CONFIG_SCHEMA_VERSION,
            decoder,
            scale: None,
            backoff: BackoffConfig::default(),
            max_frames: None,
            memory_limit_bytes: 0,
            strict_memory_limit: false,
        }
    }

    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| EngineError::Config(format!("Invalid pipeline config JSON: {err}")))?;

        let Some(version_value) = value.get("config_schema_version") else {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got missing"
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got non-integer"
            )));
        };
        if version != CONFIG_SCHEMA_VERSION as u64 {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {version}"
            )));
        }

        serde_json::from_value(value)
            .map_err(|err| EngineError::Config(format!("Invalid pipeline config JSON: {err}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Config(format!(
                "Failed to read pipeline config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    /// Install the memory cap on `ctx`.  Must run before the first pool is
    /// created on it.
    pub fn apply_to(&self, ctx: &DeviceContext) {
        if self.memory_limit_bytes > 0 {
            ctx.set_memory_limit(self.memory_limit_bytes);
            ctx.set_strict_memory_limit(self.strict_memory_limit);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.config_schema_version != CONFIG_SCHEMA_VERSION {
            return Err(EngineError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {}",
                self.config_schema_version
            )));
        }
        self.decoder.validate()?;
        if let Some(scale) = &self.scale {
            scale.validate()?;
        }
        self.backoff.validate()?;
        if self.max_frames == Some(0) {
            return Err(EngineError::Config(
                "max_frames must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionflow_core::types::PixelFormat;
    use ionflow_decode::codec::CodecKind;

    const MINIMAL: &str = r#"{
        "config_schema_version": 1,
        "decoder": { "codec": "h264", "width": 1920, "height": 1080 }
    }"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = PipelineConfig::from_json_str(MINIMAL).expect("parses");
        cfg.validate().expect("valid");
        assert_eq!(cfg.decoder.codec, CodecKind::H264);
        assert_eq!(cfg.decoder.pool_capacity, 16);
        assert_eq!(cfg.decoder.output_format, PixelFormat::Nv21);
        assert!(cfg.scale.is_none());
        assert_eq!(cfg.backoff, BackoffConfig::default());
    }

    #[test]
    fn scale_section_is_parsed() {
        let raw = r#"{
            "config_schema_version": 1,
            "decoder": { "codec": "hevc", "width": 1280, "height": 720, "output_format": "nv12" },
            "scale": { "width": "iw/2", "height": "-2", "format": "nv21" },
            "max_frames": 10
        }"#;
        let cfg = PipelineConfig::from_json_str(raw).expect("parses");
        cfg.validate().expect("valid");
        let scale = cfg.scale.expect("scale");
        assert_eq!(scale.width, "iw/2");
        assert_eq!(scale.format, Some(PixelFormat::Nv21));
        assert_eq!(scale.output_pool_capacity, 4);
        assert_eq!(cfg.max_frames, Some(10));
    }

    #[test]
    fn from_json_rejects_missing_schema_version() {
        let raw = r#"{"decoder":{"codec":"h264","width":64,"height":64}}"#;
        let err = PipelineConfig::from_json_str(raw).expect_err("missing schema must fail");
        assert!(err.to_string().contains("Config schema mismatch"));
    }

    #[test]
    fn from_json_rejects_schema_version_mismatch() {
        let raw = format!(
            "{{\"config_schema_version\":{},\"decoder\":{{\"codec\":\"h264\",\"width\":64,\"height\":64}}}}",
            CONFIG_SCHEMA_VERSION + 1
        );
        let err = PipelineConfig::from_json_str(&raw).expect_err("mismatch must fail");
        assert!(err.to_string().contains("got 2"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = r#"{
            "config_schema_version": 1,
            "decoder": { "codec": "h264", "width": 64, "height": 64, "bitrate": 5 }
        }"#;
        assert!(PipelineConfig::from_json_str(raw).is_err());
    }

    #[test]
    fn validation_reports_the_offending_section() {
        let mut cfg = PipelineConfig::from_json_str(MINIMAL).expect("parses");
        cfg.backoff.max_delay_us = 1;
        let err = cfg.validate().expect_err("max below initial");
        assert!(err.to_string().contains("max_delay_us"));

        let mut cfg = PipelineConfig::from_json_str(MINIMAL).expect("parses");
        cfg.scale = Some(ScaleConfig {
            width: "iw*".into(),
            ..ScaleConfig::default()
        });
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::InvalidExpression { .. })
        ));

        let mut cfg = PipelineConfig::from_json_str(MINIMAL).expect("parses");
        cfg.decoder.output_format = PixelFormat::Rgba;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stall_timeout_zero_disables() {
        let backoff = BackoffConfig {
            stall_timeout_ms: 0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.stall_timeout(), None);
        assert_eq!(
            BackoffConfig::default().stall_timeout(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn apply_to_installs_the_cap_only_when_set() {
        use ionflow_core::alloc::HeapAllocator;

        let ctx = DeviceContext::new(HeapAllocator::new());
        let mut cfg = PipelineConfig::from_json_str(MINIMAL).expect("parses");
        cfg.apply_to(&ctx);
        assert_eq!(ctx.health_snapshot().memory_limit_bytes, 0);

        cfg.memory_limit_bytes = 4096;
        cfg.strict_memory_limit = true;
        cfg.apply_to(&ctx);
        assert_eq!(ctx.health_snapshot().memory_limit_bytes, 4096);
    }
}
