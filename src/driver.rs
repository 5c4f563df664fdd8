//! Backend seam: traits that a rendering engine must implement
//!
//! The session manager and the capture protocol are written entirely against
//! these traits, so backends are swappable: the `cdp` feature provides a
//! headless-Chrome driver, and [`crate::mock`] provides a deterministic
//! in-process double.
//!
//! All methods are synchronous. The async layer bridges every call across
//! `spawn_blocking`, which keeps backends free to do blocking protocol I/O.

use std::sync::Arc;
use std::time::Duration;

use crate::{EngineConfig, ImageFormat, Result};

/// Constructor for a browser driver, invoked by the session manager's launch
/// strategy.
///
/// A factory must clean up any partially created resources before returning
/// an error: the manager treats a failed factory call as fully rolled back
/// and leaves its own state as "not started" so a later call can retry.
pub type DriverFactory =
    Arc<dyn Fn(&EngineConfig) -> Result<Box<dyn BrowserDriver>> + Send + Sync>;

/// The shared browser process.
///
/// At most one live driver exists per session manager; it is either fully
/// initialized and able to issue surfaces, or absent.
pub trait BrowserDriver: Send + Sync {
    /// Open a new isolated rendering surface.
    fn new_surface(&self) -> Result<Arc<dyn SurfaceDriver>>;

    /// Close the underlying process. Called once during shutdown; must be
    /// safe to call when the process already died.
    fn close(&self) -> Result<()>;
}

/// One isolated rendering surface (a page/tab) leased for a single render.
pub trait SurfaceDriver: Send + Sync {
    /// Resize the surface's layout viewport.
    fn set_viewport(&self, width: u32, height: u32) -> Result<()>;

    /// Load an HTML document into the surface.
    fn set_content(&self, html: &str) -> Result<()>;

    /// Wait until no resource fetches are in flight.
    ///
    /// Returns `Err(Error::ContentLoadTimeout)` when the bound expires; the
    /// caller treats that as soft and proceeds.
    fn wait_network_idle(&self, timeout: Duration) -> Result<()>;

    /// Wait for every image element to report load or error, racing each
    /// image's own settle signal against the bound.
    fn wait_images_settled(&self, timeout: Duration) -> Result<ImageSettleReport>;

    /// Scrollable height of the root content container, in CSS pixels.
    fn measure_scroll_height(&self) -> Result<u32>;

    /// Force the root container to exactly `height` so background styling
    /// fills the canvas.
    fn pin_height(&self, height: u32) -> Result<()>;

    /// Relax the root container's height/overflow constraints to
    /// `auto`/`visible` so content is not clipped.
    fn relax_overflow(&self) -> Result<()>;

    /// Capture the full `width` x `height` area as encoded image bytes.
    fn capture(
        &self,
        format: ImageFormat,
        quality: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>>;

    /// Dispose the surface. Must be safe to call on a broken surface.
    fn close(&self) -> Result<()>;
}

/// Outcome of the image settle wait.
#[derive(Debug, Clone, Default)]
pub struct ImageSettleReport {
    /// Images that loaded successfully
    pub settled: usize,
    /// Sources that reported a load error
    pub broken: Vec<String>,
    /// Sources that signaled neither load nor error within the bound
    pub timed_out: Vec<String>,
}

impl ImageSettleReport {
    /// True when every image loaded cleanly.
    pub fn is_clean(&self) -> bool {
        self.broken.is_empty() && self.timed_out.is_empty()
    }
}
