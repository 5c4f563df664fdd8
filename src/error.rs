//! Error types for the rendering session manager

use thiserror::Error;

/// Result type alias for rendering operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing the shared rendering process or
/// executing a render.
///
/// Hard failures (`EngineLaunchFailed`, `ProcessUnavailable`, `RenderFailed`)
/// abort the operation that produced them. Soft failures
/// (`ContentLoadTimeout`, `ImageSettleTimeout`, `ShutdownTimeout`) are logged
/// by the component that observes them and never abort a render or a shutdown.
#[derive(Error, Debug)]
pub enum Error {
    /// The shared browser process could not be launched. Fatal to the
    /// `ensure_started` attempt that triggered it and to every caller waiting
    /// on that attempt; a later call is free to retry.
    #[error("Engine launch failed: {0}")]
    EngineLaunchFailed(String),

    /// A page was requested after shutdown or after an unrecovered launch
    /// failure.
    #[error("Rendering process unavailable: {0}")]
    ProcessUnavailable(String),

    /// The render request failed validation before touching the engine.
    #[error("Invalid render request: {0}")]
    InvalidRequest(String),

    /// No free page slot became available within the lease timeout.
    #[error("No free page slot after {0}ms")]
    LeaseTimeout(u64),

    /// Network quiescence was not reached within the bound. Soft: the render
    /// proceeds with whatever content has loaded.
    #[error("Content did not reach network quiescence within {0}ms")]
    ContentLoadTimeout(u64),

    /// One or more images never signaled load or error within the bound.
    /// Soft: the render proceeds.
    #[error("{0} image(s) did not settle within {1}ms")]
    ImageSettleTimeout(usize, u64),

    /// The surface became unusable mid-render (engine crash, disconnect,
    /// failed navigation). Fatal to that render only; the lease is still
    /// released through the guaranteed cleanup path.
    #[error("Render failed: {0}")]
    RenderFailed(String),

    /// A teardown step exceeded its bound. Logged as a warning by
    /// `shutdown`; never surfaced to its caller.
    #[error("Shutdown step '{0}' exceeded {1}ms")]
    ShutdownTimeout(&'static str, u64),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    Cdp(String),
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Cdp(err.to_string())
    }
}
