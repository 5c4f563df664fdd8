//! Adaptive capture protocol
//!
//! Executes one render against a leased surface: load, wait for quiescence
//! and image settle, measure, apply the overflow policy, grow the viewport if
//! content demands it, and capture the full area. Soft failures (quiescence
//! timeout, broken or late images) are logged and the render proceeds;
//! partial content beats no response. Hard failures abort with the error
//! propagated, and the caller's scoped release still runs.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::driver::SurfaceDriver;
use crate::lease::PageLease;
use crate::policy::{self, OverflowPolicy};
use crate::{EngineConfig, Error, RenderRequest, RenderResult, Result};

pub(crate) async fn run(
    lease: &PageLease,
    request: &RenderRequest,
    config: &EngineConfig,
) -> Result<RenderResult> {
    let surface = lease.surface();
    let id = lease.id();
    let vp = policy::requested_viewport(request.width, request.height);

    // 1. Layout happens at the requested canvas size first.
    blocking(&surface, move |s| s.set_viewport(vp.width, vp.height)).await?;

    // 2. Load the document.
    let html = request.html.clone();
    blocking(&surface, move |s| s.set_content(&html)).await?;

    // 3. Network quiescence, best-effort.
    let bound = Duration::from_millis(config.load_timeout_ms);
    match blocking(&surface, move |s| s.wait_network_idle(bound)).await {
        Ok(()) => {}
        Err(err @ Error::ContentLoadTimeout(_)) => {
            warn!("render {id}: {err}; proceeding with partial content");
        }
        Err(err) => return Err(err),
    }

    // 4. Every image settles (load or error) before measurement. The page's
    // aggregate load event can fire before images decode, so each image is
    // raced individually.
    let bound = Duration::from_millis(config.image_settle_timeout_ms);
    match blocking(&surface, move |s| s.wait_images_settled(bound)).await {
        Ok(report) => {
            for src in &report.broken {
                warn!("render {id}: image failed to load: {src}");
            }
            if !report.timed_out.is_empty() {
                warn!(
                    "render {id}: {}",
                    Error::ImageSettleTimeout(
                        report.timed_out.len(),
                        config.image_settle_timeout_ms
                    )
                );
            }
            debug!("render {id}: {} image(s) settled", report.settled);
        }
        Err(err @ Error::ImageSettleTimeout(..)) => {
            warn!("render {id}: {err}; proceeding");
        }
        Err(err) => return Err(err),
    }

    // 5.-6. Measure content height and decide the overflow policy.
    let measured = blocking(&surface, |s| s.measure_scroll_height()).await?;
    match policy::overflow_policy(vp.height, measured) {
        OverflowPolicy::PinToRequested => {
            debug!(
                "render {id}: content height {measured} fits requested {}; pinning",
                vp.height
            );
            let height = vp.height;
            blocking(&surface, move |s| s.pin_height(height)).await?;
        }
        OverflowPolicy::RelaxAndGrow => {
            debug!(
                "render {id}: content height {measured} overflows requested {}; relaxing",
                vp.height
            );
            blocking(&surface, |s| s.relax_overflow()).await?;
        }
    }

    // 7. Relaxing can change layout, so measure again, then grow the
    // viewport to the final height. Width never changes here.
    let remeasured = blocking(&surface, |s| s.measure_scroll_height()).await?;
    let final_height = policy::grown_height(vp.height, remeasured);
    if final_height > vp.height {
        blocking(&surface, move |s| s.set_viewport(vp.width, final_height)).await?;
    }

    // 8. Absorb asynchronous layout/paint work the signals above miss.
    tokio::time::sleep(Duration::from_millis(config.settle_delay_ms)).await;

    // 9. Capture the full area at the final dimensions.
    let (format, quality) = (config.format, config.jpeg_quality);
    let bytes = blocking(&surface, move |s| {
        s.capture(format, quality, vp.width, final_height)
    })
    .await?;

    debug!(
        "render {id}: captured {} byte(s) at {}x{final_height}",
        bytes.len(),
        vp.width
    );
    Ok(RenderResult {
        bytes,
        format,
        width: vp.width,
        height: final_height,
    })
}

/// Run one synchronous surface operation on the blocking pool. A vanished
/// task means the surface is gone with it, which is a hard render failure.
async fn blocking<T, F>(surface: &Arc<dyn SurfaceDriver>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn SurfaceDriver) -> Result<T> + Send + 'static,
{
    let surface = Arc::clone(surface);
    match tokio::task::spawn_blocking(move || op(surface.as_ref())).await {
        Ok(result) => result,
        Err(err) => Err(Error::RenderFailed(format!("capture step aborted: {err}"))),
    }
}
