//! Viewport policy: pure sizing decisions for the adaptive capture protocol
//!
//! Everything here is a function of its arguments. The session manager and the
//! capture loop own all the state; this module only answers two questions:
//! what viewport does a size hint map to, and what do we do when the measured
//! content height disagrees with the requested one.

use crate::Viewport;

/// Slack allowed between requested and measured height before the overflow
/// policy switches from pinning to relaxing. Sub-pixel rounding and scrollbar
/// arithmetic routinely produce a few pixels of disagreement.
pub const OVERFLOW_EPSILON_PX: u32 = 5;

/// Smallest accepted viewport axis
pub const MIN_DIMENSION_PX: u32 = 1;

/// Largest accepted viewport axis. Past this point Chromium-family engines
/// start tiling captures and the output is no longer a single clean raster.
pub const MAX_DIMENSION_PX: u32 = 10_000;

/// What to do with the root container once content height is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Content fits (within epsilon): force the root container to exactly the
    /// requested height so background styling fills the canvas with no blank
    /// trailing space.
    PinToRequested,
    /// Content overflows: relax the root container's height/overflow
    /// constraints so nothing is clipped, then grow the viewport to match.
    RelaxAndGrow,
}

/// Clamp a requested size hint into the supported viewport range.
pub fn requested_viewport(width: u32, height: u32) -> Viewport {
    Viewport {
        width: width.clamp(MIN_DIMENSION_PX, MAX_DIMENSION_PX),
        height: height.clamp(MIN_DIMENSION_PX, MAX_DIMENSION_PX),
    }
}

/// Decide the overflow policy for a measured content height.
///
/// Always relaxing would be simpler, but `height: 100%`-style content
/// collapses when the container stops having a definite height, so short
/// content must be pinned instead.
pub fn overflow_policy(requested_height: u32, measured_height: u32) -> OverflowPolicy {
    if measured_height > requested_height.saturating_add(OVERFLOW_EPSILON_PX) {
        OverflowPolicy::RelaxAndGrow
    } else {
        OverflowPolicy::PinToRequested
    }
}

/// Final viewport height once content has been re-measured.
///
/// Monotonic: never below the requested height, never above the axis cap.
/// Width is never grown; only height adapts to content.
pub fn grown_height(requested_height: u32, measured_height: u32) -> u32 {
    measured_height
        .max(requested_height)
        .min(MAX_DIMENSION_PX)
}
