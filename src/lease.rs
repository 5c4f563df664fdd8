//! Scoped page leases
//!
//! Every surface handed out by the session manager travels inside a
//! [`PageLease`]. The lease pairs the surface with the semaphore permit that
//! bounds concurrent leases, and enforces release-exactly-once: the normal
//! path goes through [`crate::SessionManager::release_page`], and a lease
//! that gets dropped without it (a panic, an early return that bypassed the
//! manager) disposes its surface on a background thread so the shared
//! process does not accumulate dead pages.

use std::sync::Arc;

use log::warn;
use tokio::sync::OwnedSemaphorePermit;

use crate::driver::SurfaceDriver;

/// One isolated rendering surface borrowed from the shared process for the
/// duration of a single render.
pub struct PageLease {
    surface: Option<Arc<dyn SurfaceDriver>>,
    permit: Option<OwnedSemaphorePermit>,
    id: u64,
}

impl std::fmt::Debug for PageLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageLease")
            .field("id", &self.id)
            .field("active", &self.surface.is_some())
            .finish()
    }
}

impl PageLease {
    pub(crate) fn new(
        surface: Arc<dyn SurfaceDriver>,
        permit: OwnedSemaphorePermit,
        id: u64,
    ) -> Self {
        Self {
            surface: Some(surface),
            permit: Some(permit),
            id,
        }
    }

    /// Identifier for log correlation across the capture steps.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The leased surface. Only callable while the lease is active; release
    /// consumes the lease, so an active lease always holds a surface.
    pub(crate) fn surface(&self) -> Arc<dyn SurfaceDriver> {
        self.surface
            .as_ref()
            .map(Arc::clone)
            .expect("active page lease holds a surface")
    }

    pub(crate) fn take_surface(&mut self) -> Option<Arc<dyn SurfaceDriver>> {
        self.surface.take()
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(surface) = self.surface.take() {
            // Leaked lease: dispose off-thread so drop never blocks an
            // executor. The permit moves with the surface so the lease slot
            // stays occupied until disposal finishes.
            warn!(
                "page lease {} dropped without release; disposing surface in the background",
                self.id
            );
            let permit = self.permit.take();
            std::thread::spawn(move || {
                if let Err(err) = surface.close() {
                    warn!("background surface disposal failed: {err}");
                }
                drop(permit);
            });
        }
    }
}
