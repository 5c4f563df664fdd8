//! htmlshot
//!
//! A session manager for rendering HTML documents to raster images over a
//! single shared headless-browser process.
//!
//! The expensive resource here is the browser process, not the screenshot: the
//! crate guarantees exactly-once lazy startup under concurrent callers, leases
//! an isolated page per render, adapts the capture viewport to the measured
//! content height so nothing is clipped, and tears the process down within a
//! bounded time budget.
//!
//! # Features
//!
//! - **CDP Backend** (`cdp` feature): drives headless Chrome via the
//!   DevTools Protocol
//! - **Mock Backend** (always available): deterministic in-process double for
//!   hermetic tests and downstream consumers without a browser
//!
//! # Example
//!
//! ```
//! use htmlshot::{mock, EngineConfig, RenderRequest, SessionManager};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> htmlshot::Result<()> {
//! let backend = mock::MockBackend::new();
//! let manager = SessionManager::new(EngineConfig::default(), backend.factory());
//!
//! let result = manager
//!     .render(RenderRequest::new("<h1>hello</h1>", 800, 600))
//!     .await?;
//! assert_eq!((result.width, result.height), (800, 600));
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod driver;
pub mod policy;

mod capture;
mod lease;
mod session;

pub use lease::PageLease;
pub use session::{SessionManager, ShutdownReport};

// CDP backend (feature-gated)
#[cfg(feature = "cdp")]
pub mod cdp;

// Deterministic in-process backend used by the test suite and by consumers
// that need a hermetic double.
pub mod mock;

/// Configuration for the rendering engine and the capture protocol
///
/// The defaults are chosen to be conservative: generous load bounds, a small
/// lease cap, and PNG output. Every timeout is step-local; no single stuck
/// step can block a render or a shutdown indefinitely.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// User agent string applied to each leased page
    pub user_agent: String,
    /// Fallback viewport for pages before a render sets its own
    pub viewport: Viewport,
    /// Bound on the network-quiescence wait, in milliseconds (soft on expiry)
    pub load_timeout_ms: u64,
    /// Bound on the per-image settle wait, in milliseconds (soft on expiry)
    pub image_settle_timeout_ms: u64,
    /// Fixed delay before capture to absorb asynchronous layout/paint work
    pub settle_delay_ms: u64,
    /// Per-step bound for the teardown sequence, in milliseconds
    pub shutdown_step_timeout_ms: u64,
    /// Maximum number of concurrently leased pages
    pub max_pages: usize,
    /// How long `acquire_page` waits for a free page slot, in milliseconds
    pub lease_timeout_ms: u64,
    /// Output encoding for captured images
    pub format: ImageFormat,
    /// Encoding quality for lossy formats (ignored for PNG)
    pub jpeg_quality: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 htmlshot/0.1"
                .to_string(),
            viewport: Viewport::default(),
            load_timeout_ms: 10_000,
            image_settle_timeout_ms: 5_000,
            settle_delay_ms: 500,
            shutdown_step_timeout_ms: 5_000,
            max_pages: 8,
            lease_timeout_ms: 30_000,
            format: ImageFormat::Png,
            jpeg_quality: 90,
        }
    }
}

/// Viewport dimensions in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Output encoding for captured images
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl std::fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageFormat::Png => write!(f, "png"),
            ImageFormat::Jpeg => write!(f, "jpeg"),
        }
    }
}

/// One render request: an HTML document plus the requested canvas size.
///
/// Immutable once constructed; dimensions are validated by
/// [`SessionManager::render`] before any engine work happens.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub html: String,
    pub width: u32,
    pub height: u32,
}

impl RenderRequest {
    pub fn new(html: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            html: html.into(),
            width,
            height,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidRequest(format!(
                "dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.html.trim().is_empty() {
            return Err(Error::InvalidRequest("document is empty".into()));
        }
        Ok(())
    }
}

/// Encoded image bytes plus the final (possibly grown) dimensions
#[derive(Debug, Clone)]
pub struct RenderResult {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}
