//! Typed error hierarchy shared by every ionflow crate.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`EngineError::error_code`]
//! for structured telemetry without string parsing.
//!
//! Flow-control outcomes (would-block, not-ready, end-of-stream) are not
//! errors and never appear here; they are modelled as enum results by the
//! pump and the scale stage.

use crate::types::PixelFormat;

/// All errors originating from the ionflow engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ── Memory ───────────────────────────────────────────────────────
    #[error("Allocation failed: {size} bytes ({reason})")]
    AllocFailure { size: usize, reason: String },

    #[error(
        "Memory limit exceeded: current {current_bytes} B + request {requested_bytes} B > limit {limit_bytes} B"
    )]
    MemoryLimitExceeded {
        limit_bytes: usize,
        current_bytes: usize,
        requested_bytes: usize,
    },

    #[error("Map failed for buffer {token}: {reason}")]
    MapFailure { token: u64, reason: String },

    #[error("Buffer {0} is already mapped")]
    AlreadyMapped(u64),

    #[error("Buffer is shared by {holders} handles; exclusive access required")]
    SharedBuffer { holders: usize },

    // ── Hardware engines ─────────────────────────────────────────────
    #[error("Decode engine initialization failed (code {code})")]
    EngineInit { code: i32 },

    #[error("Decode engine rejected packet (code {code})")]
    EngineSubmit { code: i32 },

    #[error("{op} failed with engine code {code}")]
    EngineFailure { op: &'static str, code: i32 },

    // ── Pool / ownership ─────────────────────────────────────────────
    #[error("Slot {index} out of range for pool of capacity {capacity}")]
    SlotOutOfRange { index: usize, capacity: usize },

    #[error("Slot {0} is owned by a live handle")]
    SlotBusy(usize),

    // ── Configuration ────────────────────────────────────────────────
    #[error(
        "Invalid geometry {width}x{height}: allowed {min_width}x{min_height} to {max_width}x{max_height}"
    )]
    InvalidGeometry {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
        max_width: u32,
        max_height: u32,
    },

    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(PixelFormat),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("Header reconstruction failed: {0}")]
    Header(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Pipeline / state ─────────────────────────────────────────────
    #[error("{op} is not allowed in state {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Pipeline cancelled")]
    Cancelled,

    // ── Invariants ───────────────────────────────────────────────────
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: memory and allocator
    /// - 2xx: hardware engines
    /// - 3xx: pool and ownership
    /// - 4xx: configuration
    /// - 5xx: pipeline and state machine
    /// - 6xx: invariants
    pub fn error_code(&self) -> u32 {
        match self {
            Self::AllocFailure { .. } => 100,
            Self::MemoryLimitExceeded { .. } => 101,
            Self::MapFailure { .. } => 102,
            Self::AlreadyMapped(_) => 103,
            Self::SharedBuffer { .. } => 104,
            Self::EngineInit { .. } => 200,
            Self::EngineSubmit { .. } => 201,
            Self::EngineFailure { .. } => 202,
            Self::SlotOutOfRange { .. } => 300,
            Self::SlotBusy(_) => 301,
            Self::InvalidGeometry { .. } => 400,
            Self::UnsupportedFormat(_) => 401,
            Self::UnsupportedCodec(_) => 402,
            Self::InvalidExpression { .. } => 403,
            Self::Header(_) => 404,
            Self::Config(_) => 405,
            Self::InvalidState { .. } => 500,
            Self::Pipeline(_) => 501,
            Self::Cancelled => 502,
            Self::InvariantViolation(_) => 600,
        }
    }

    /// Whether this error unwinds the owning session.
    ///
    /// The caller must tear the session down and may recreate it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AllocFailure { .. } | Self::MemoryLimitExceeded { .. } | Self::EngineInit { .. }
        )
    }

    /// Whether this error is local to one call (the session stays usable).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EngineSubmit { .. } | Self::EngineFailure { .. }
        )
    }
}

/// Convenience alias used throughout the ionflow crates.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Opaque status returned by a hardware engine call.
///
/// Engines only report these; callers map them into [`EngineError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EngineCode(pub i32);

impl std::fmt::Display for EngineCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped_by_category() {
        let alloc = EngineError::AllocFailure {
            size: 64,
            reason: "exhausted".into(),
        };
        assert_eq!(alloc.error_code() / 100, 1);
        assert_eq!(EngineError::EngineSubmit { code: -5 }.error_code(), 201);
        assert_eq!(EngineError::SlotBusy(3).error_code() / 100, 3);
        assert_eq!(
            EngineError::UnsupportedFormat(PixelFormat::Nv12).error_code(),
            401
        );
        assert_eq!(
            EngineError::InvalidState {
                op: "flush",
                state: "closed"
            }
            .error_code(),
            500
        );
    }

    #[test]
    fn fatal_and_recoverable_are_disjoint() {
        let cases = [
            EngineError::AllocFailure {
                size: 1,
                reason: String::new(),
            },
            EngineError::EngineInit { code: -1 },
            EngineError::EngineSubmit { code: -1 },
            EngineError::EngineFailure {
                op: "stretch_blit",
                code: -1,
            },
            EngineError::Config("bad".into()),
        ];
        for err in &cases {
            assert!(
                !(err.is_fatal() && err.is_recoverable()),
                "{err} classified as both fatal and recoverable"
            );
        }
        assert!(cases[0].is_fatal());
        assert!(cases[1].is_fatal());
        assert!(cases[2].is_recoverable());
        assert!(cases[3].is_recoverable());
        assert!(!cases[4].is_fatal() && !cases[4].is_recoverable());
    }

    #[test]
    fn geometry_message_names_bounds() {
        let err = EngineError::InvalidGeometry {
            width: 1,
            height: 1,
            min_width: 2,
            min_height: 2,
            max_width: 8192,
            max_height: 8192,
        };
        let msg = err.to_string();
        assert!(msg.contains("1x1"), "{msg}");
        assert!(msg.contains("8192x8192"), "{msg}");
    }
}
