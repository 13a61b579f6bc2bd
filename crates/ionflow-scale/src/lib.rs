#![doc = include_str!("../README.md")]

pub mod blit;
pub mod expr;
pub mod scale;
pub mod soft;

pub use blit::{BlitEngine, BlitRequest, BlitResult, Rect, Rotation, Surface};
pub use expr::{Expr, ScaleVars, evaluate_dimensions};
pub use scale::{ScaleConfig, ScaleSnapshot, ScaleStage, ScaleStats, Transformed};
pub use soft::SoftBlitEngine;
