//! Deterministic in-process backend
//!
//! A hermetic double for the browser driver, used by the test suite and by
//! consumers that want to exercise the session manager without a browser.
//! It models just enough layout to drive the adaptive capture protocol: a
//! configurable natural content height, pin/relax semantics for the root
//! container, and image sources under the reserved `.invalid` TLD settling
//! as broken.
//!
//! Captures are ASCII records of the form
//! `MOCKSHOT <format> <width>x<height> <sha256-of-html>`, so tests can assert
//! on dimensions and content identity without decoding an image.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use sha2::{Digest, Sha256};

use crate::driver::{BrowserDriver, DriverFactory, ImageSettleReport, SurfaceDriver};
use crate::{Error, ImageFormat, Result, Viewport};

/// Shared state behind a mock backend and every driver/surface it produces.
#[derive(Default)]
struct MockState {
    launches: AtomicUsize,
    live_surfaces: AtomicUsize,
    remaining_launch_failures: AtomicUsize,
    launch_delay_ms: AtomicU64,
    close_hang_ms: AtomicU64,
    content_height: AtomicU32,
    fail_content_load: AtomicBool,
    time_out_quiescence: AtomicBool,
    crash_on_capture: AtomicBool,
    // Record of the most recent overflow decision, observable from tests.
    last_pinned_height: Mutex<Option<u32>>,
    overflow_relaxed: AtomicBool,
}

/// Handle for configuring the mock and observing engine activity from tests.
///
/// Cloning the backend shares the underlying counters, so a test can keep a
/// handle while the session manager owns the factory.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver factory to hand to [`crate::SessionManager::new`].
    pub fn factory(&self) -> DriverFactory {
        let state = self.state.clone();
        Arc::new(move |_config: &crate::EngineConfig| {
            let delay = state.launch_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
            state.launches.fetch_add(1, Ordering::SeqCst);
            if state
                .remaining_launch_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::EngineLaunchFailed(
                    "mock launch refused by test configuration".into(),
                ));
            }
            Ok(Box::new(MockDriver {
                state: state.clone(),
                closed: AtomicBool::new(false),
            }) as Box<dyn BrowserDriver>)
        })
    }

    /// Number of launch attempts observed so far.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Number of surfaces currently open (leased but not yet disposed).
    pub fn live_surfaces(&self) -> usize {
        self.state.live_surfaces.load(Ordering::SeqCst)
    }

    /// Make the next `n` launch attempts fail.
    pub fn fail_next_launches(&self, n: usize) {
        self.state
            .remaining_launch_failures
            .store(n, Ordering::SeqCst);
    }

    /// Widen the launch race window by sleeping inside the factory.
    pub fn delay_launch(&self, delay: Duration) {
        self.state
            .launch_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Natural layout height of subsequently loaded content, in pixels.
    /// Zero (the default) means content that stretches to fill the viewport.
    pub fn set_content_height(&self, px: u32) {
        self.state.content_height.store(px, Ordering::SeqCst);
    }

    /// Make the driver's close call block for `hang`, simulating a process
    /// that never responds to its close signal.
    pub fn hang_on_close(&self, hang: Duration) {
        self.state
            .close_hang_ms
            .store(hang.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make content loads fail hard, as if navigation crashed.
    pub fn fail_content_load(&self, on: bool) {
        self.state.fail_content_load.store(on, Ordering::SeqCst);
    }

    /// Make the network-quiescence wait expire.
    pub fn time_out_quiescence(&self, on: bool) {
        self.state.time_out_quiescence.store(on, Ordering::SeqCst);
    }

    /// Make screenshot capture fail hard, as if the target crashed.
    pub fn crash_on_capture(&self, on: bool) {
        self.state.crash_on_capture.store(on, Ordering::SeqCst);
    }

    /// Height of the most recent root-container pin, or `None` when the last
    /// decision relaxed the container (or no decision has been made yet).
    pub fn last_pinned_height(&self) -> Option<u32> {
        *self
            .state
            .last_pinned_height
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether the most recent overflow decision relaxed the root container's
    /// height/overflow constraints.
    pub fn last_overflow_relaxed(&self) -> bool {
        self.state.overflow_relaxed.load(Ordering::SeqCst)
    }
}

struct MockDriver {
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl BrowserDriver for MockDriver {
    fn new_surface(&self) -> Result<Arc<dyn SurfaceDriver>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ProcessUnavailable("mock driver closed".into()));
        }
        self.state.live_surfaces.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSurface {
            state: self.state.clone(),
            viewport: Mutex::new(Viewport::default()),
            html: Mutex::new(String::new()),
            pinned: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn close(&self) -> Result<()> {
        let hang = self.state.close_hang_ms.load(Ordering::SeqCst);
        if hang > 0 {
            std::thread::sleep(Duration::from_millis(hang));
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSurface {
    state: Arc<MockState>,
    viewport: Mutex<Viewport>,
    html: Mutex<String>,
    pinned: Mutex<Option<u32>>,
    closed: AtomicBool,
}

impl MockSurface {
    fn viewport_height(&self) -> u32 {
        self.viewport.lock().map(|vp| vp.height).unwrap_or(0)
    }

    /// Image sources found in the loaded document. Good enough for a mock:
    /// scans `src="..."` attributes without a real parser.
    fn image_sources(&self) -> Vec<String> {
        let html = self.html.lock().map(|h| h.clone()).unwrap_or_default();
        let mut sources = Vec::new();
        for chunk in html.split("<img").skip(1) {
            if let Some(rest) = chunk.split("src=\"").nth(1) {
                if let Some(src) = rest.split('"').next() {
                    sources.push(src.to_string());
                }
            }
        }
        sources
    }
}

impl SurfaceDriver for MockSurface {
    fn set_viewport(&self, width: u32, height: u32) -> Result<()> {
        let mut vp = self
            .viewport
            .lock()
            .map_err(|_| Error::RenderFailed("mock surface poisoned".into()))?;
        *vp = Viewport { width, height };
        Ok(())
    }

    fn set_content(&self, html: &str) -> Result<()> {
        if self.state.fail_content_load.load(Ordering::SeqCst) {
            return Err(Error::RenderFailed("mock navigation failed".into()));
        }
        let mut slot = self
            .html
            .lock()
            .map_err(|_| Error::RenderFailed("mock surface poisoned".into()))?;
        *slot = html.to_string();
        Ok(())
    }

    fn wait_network_idle(&self, timeout: Duration) -> Result<()> {
        if self.state.time_out_quiescence.load(Ordering::SeqCst) {
            return Err(Error::ContentLoadTimeout(timeout.as_millis() as u64));
        }
        Ok(())
    }

    fn wait_images_settled(&self, _timeout: Duration) -> Result<ImageSettleReport> {
        let sources = self.image_sources();
        let mut report = ImageSettleReport::default();
        for src in sources {
            if src.contains(".invalid") {
                report.broken.push(src);
            } else {
                report.settled += 1;
            }
        }
        Ok(report)
    }

    fn measure_scroll_height(&self) -> Result<u32> {
        if let Some(pinned) = *self
            .pinned
            .lock()
            .map_err(|_| Error::RenderFailed("mock surface poisoned".into()))?
        {
            return Ok(pinned);
        }
        let natural = self.state.content_height.load(Ordering::SeqCst);
        let vp = self.viewport_height();
        // scrollHeight never reports less than the viewport itself
        Ok(if natural == 0 { vp } else { natural.max(vp) })
    }

    fn pin_height(&self, height: u32) -> Result<()> {
        let mut pinned = self
            .pinned
            .lock()
            .map_err(|_| Error::RenderFailed("mock surface poisoned".into()))?;
        *pinned = Some(height);
        if let Ok(mut record) = self.state.last_pinned_height.lock() {
            *record = Some(height);
        }
        self.state.overflow_relaxed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn relax_overflow(&self) -> Result<()> {
        let mut pinned = self
            .pinned
            .lock()
            .map_err(|_| Error::RenderFailed("mock surface poisoned".into()))?;
        *pinned = None;
        if let Ok(mut record) = self.state.last_pinned_height.lock() {
            *record = None;
        }
        self.state.overflow_relaxed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn capture(
        &self,
        format: ImageFormat,
        _quality: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        if self.state.crash_on_capture.load(Ordering::SeqCst) {
            return Err(Error::RenderFailed("mock renderer target crashed".into()));
        }
        let html = self
            .html
            .lock()
            .map_err(|_| Error::RenderFailed("mock surface poisoned".into()))?;
        let digest = hex::encode(Sha256::digest(html.as_bytes()));
        Ok(format!("MOCKSHOT {format} {width}x{height} {digest}").into_bytes())
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.live_surfaces.fetch_sub(1, Ordering::SeqCst);
            debug!("mock surface disposed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_accounting_is_idempotent_on_close() {
        let backend = MockBackend::new();
        let driver = (backend.factory())(&crate::EngineConfig::default()).unwrap();
        let surface = driver.new_surface().unwrap();
        assert_eq!(backend.live_surfaces(), 1);
        surface.close().unwrap();
        surface.close().unwrap();
        assert_eq!(backend.live_surfaces(), 0);
    }

    #[test]
    fn capture_records_are_deterministic() {
        let backend = MockBackend::new();
        let driver = (backend.factory())(&crate::EngineConfig::default()).unwrap();
        let surface = driver.new_surface().unwrap();
        surface.set_content("<h1>poster</h1>").unwrap();
        let a = surface.capture(ImageFormat::Png, 90, 800, 600).unwrap();
        let b = surface.capture(ImageFormat::Png, 90, 800, 600).unwrap();
        assert_eq!(a, b);
        assert!(String::from_utf8(a).unwrap().starts_with("MOCKSHOT png 800x600 "));
    }

    #[test]
    fn invalid_tld_images_settle_broken() {
        let backend = MockBackend::new();
        let driver = (backend.factory())(&crate::EngineConfig::default()).unwrap();
        let surface = driver.new_surface().unwrap();
        surface
            .set_content(
                r#"<img src="https://cdn.example.com/a.png">
                   <img src="https://assets.invalid/missing.png">"#,
            )
            .unwrap();
        let report = surface
            .wait_images_settled(Duration::from_millis(100))
            .unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(report.broken, vec!["https://assets.invalid/missing.png"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn measurement_tracks_pin_and_relax() {
        let backend = MockBackend::new();
        backend.set_content_height(1850);
        let driver = (backend.factory())(&crate::EngineConfig::default()).unwrap();
        let surface = driver.new_surface().unwrap();
        surface.set_viewport(800, 1200).unwrap();
        assert_eq!(surface.measure_scroll_height().unwrap(), 1850);
        surface.pin_height(1200).unwrap();
        assert_eq!(surface.measure_scroll_height().unwrap(), 1200);
        assert_eq!(backend.last_pinned_height(), Some(1200));
        assert!(!backend.last_overflow_relaxed());
        surface.relax_overflow().unwrap();
        assert_eq!(surface.measure_scroll_height().unwrap(), 1850);
        assert_eq!(backend.last_pinned_height(), None);
        assert!(backend.last_overflow_relaxed());
    }
}
