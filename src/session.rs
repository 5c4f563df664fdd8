//! Rendering session manager
//!
//! Owns the single shared browser process: exactly-once lazy startup under
//! concurrent callers, bounded page leasing, and bounded-time shutdown. This
//! is the only component in the crate with cross-render mutable state, and
//! the only one that synchronizes.
//!
//! Startup runs through a launch strategy selected once at construction. The
//! driver's transport does its own blocking I/O on dedicated threads; on a
//! multi-thread runtime the launch itself can share tokio's blocking pool,
//! while current-thread runtimes (and managers built outside a runtime) get a
//! dedicated launch thread with the result bridged back over a oneshot
//! channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::time::timeout;

use crate::capture;
use crate::driver::{BrowserDriver, DriverFactory};
use crate::lease::PageLease;
use crate::{EngineConfig, Error, RenderRequest, RenderResult, Result};

type LaunchOutcome = Result<Box<dyn BrowserDriver>>;

/// Message published to everyone waiting on an in-flight launch. `None`
/// while the launch runs; errors travel as strings so the message is `Clone`.
type LaunchMessage = Option<std::result::Result<(), String>>;

enum LaunchState {
    Stopped,
    Starting {
        attempt: u64,
        rx: watch::Receiver<LaunchMessage>,
    },
    Running(Arc<dyn BrowserDriver>),
}

/// Outcome of [`SessionManager::shutdown`]: how many teardown steps ran and
/// how many exceeded their bound. Timeouts are warnings, never errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShutdownReport {
    pub steps_run: usize,
    pub steps_timed_out: usize,
}

/// Manages the shared rendering process and serves page leases to concurrent
/// renders.
///
/// Construct one per application and share it by reference (or `Arc`); there
/// is no ambient global. The process is launched lazily on first use and can
/// be relaunched after [`SessionManager::shutdown`], which makes recovery
/// from a crashed engine a matter of calling [`SessionManager::ensure_started`]
/// again.
pub struct SessionManager {
    config: EngineConfig,
    factory: DriverFactory,
    strategy: Box<dyn LaunchStrategy>,
    // Fast path for ensure_started; the state mutex is the source of truth.
    started: AtomicBool,
    state: Mutex<LaunchState>,
    pages: Arc<Semaphore>,
    next_lease_id: AtomicU64,
    next_attempt: AtomicU64,
}

impl SessionManager {
    /// Create a manager over the given driver factory. The launch strategy is
    /// probed once here and never re-selected.
    pub fn new(config: EngineConfig, factory: DriverFactory) -> Self {
        let strategy = probe_strategy();
        debug!("selected '{}' launch strategy", strategy.label());
        let pages = Arc::new(Semaphore::new(config.max_pages.max(1)));
        Self {
            config,
            factory,
            strategy,
            started: AtomicBool::new(false),
            state: Mutex::new(LaunchState::Stopped),
            pages,
            next_lease_id: AtomicU64::new(1),
            next_attempt: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, LaunchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the shared rendering process if it is not already running.
    ///
    /// Idempotent and safe under unbounded concurrent callers: at most one
    /// launch runs per attempt. Callers that arrive while a launch is in
    /// flight wait for it and observe the same outcome, success or failure.
    /// After a failed attempt the state rolls back to stopped, so a later
    /// call retries with a fresh launch.
    pub async fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        enum Role {
            Wait {
                attempt: u64,
                rx: watch::Receiver<LaunchMessage>,
            },
            Launch {
                tx: watch::Sender<LaunchMessage>,
            },
        }

        loop {
            let role = {
                let mut state = self.lock_state();
                match &*state {
                    LaunchState::Running(_) => return Ok(()),
                    LaunchState::Starting { attempt, rx } => Role::Wait {
                        attempt: *attempt,
                        rx: rx.clone(),
                    },
                    LaunchState::Stopped => {
                        let (tx, rx) = watch::channel(None);
                        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
                        *state = LaunchState::Starting { attempt, rx };
                        Role::Launch { tx }
                    }
                }
            };

            match role {
                Role::Wait { attempt, mut rx } => {
                    let settled = loop {
                        let current = rx.borrow().clone();
                        if let Some(outcome) = current {
                            break Some(outcome);
                        }
                        if rx.changed().await.is_err() {
                            break None;
                        }
                    };
                    match settled {
                        Some(Ok(())) => return Ok(()),
                        Some(Err(msg)) => return Err(Error::EngineLaunchFailed(msg)),
                        None => {
                            // The launching task went away without reporting
                            // (cancelled mid-launch). Clear the stale marker,
                            // unless someone already moved the state on, and
                            // retry from the top.
                            let mut state = self.lock_state();
                            if matches!(&*state,
                                LaunchState::Starting { attempt: a, .. } if *a == attempt)
                            {
                                *state = LaunchState::Stopped;
                            }
                        }
                    }
                }
                Role::Launch { tx } => {
                    info!(
                        "launching shared rendering process ('{}' strategy)",
                        self.strategy.label()
                    );
                    let launch = self
                        .strategy
                        .begin(self.factory.clone(), self.config.clone());
                    let outcome = match launch.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::EngineLaunchFailed(
                            "launch worker terminated before reporting".into(),
                        )),
                    };
                    return match outcome {
                        Ok(driver) => {
                            {
                                // Flag and state flip together under the lock
                                // so shutdown never observes them split.
                                let mut state = self.lock_state();
                                *state = LaunchState::Running(Arc::from(driver));
                                self.started.store(true, Ordering::Release);
                            }
                            let _ = tx.send(Some(Ok(())));
                            info!("shared rendering process started");
                            Ok(())
                        }
                        Err(err) => {
                            // The factory rolls back its own partial
                            // resources; all that is left is to reset our
                            // state so a later call can retry.
                            *self.lock_state() = LaunchState::Stopped;
                            let _ = tx.send(Some(Err(err.to_string())));
                            warn!("engine launch failed: {err}");
                            Err(err)
                        }
                    };
                }
            }
        }
    }

    /// Lease a fresh isolated page from the running process, starting the
    /// process first if needed.
    ///
    /// Leases are bounded by `max_pages`; when every slot is taken this waits
    /// up to `lease_timeout_ms` for one to free up.
    pub async fn acquire_page(&self) -> Result<PageLease> {
        self.ensure_started().await?;

        let wait = Duration::from_millis(self.config.lease_timeout_ms);
        let permit = match timeout(wait, self.pages.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::ProcessUnavailable("lease pool closed".into()));
            }
            Err(_) => return Err(Error::LeaseTimeout(self.config.lease_timeout_ms)),
        };

        let driver = match &*self.lock_state() {
            LaunchState::Running(driver) => Arc::clone(driver),
            _ => {
                return Err(Error::ProcessUnavailable(
                    "rendering process is not running".into(),
                ));
            }
        };

        let surface = tokio::task::spawn_blocking(move || driver.new_surface())
            .await
            .map_err(|err| Error::ProcessUnavailable(format!("page open task failed: {err}")))?
            .map_err(|err| Error::ProcessUnavailable(format!("could not open page: {err}")))?;

        let id = self.next_lease_id.fetch_add(1, Ordering::Relaxed);
        debug!("page lease {id} acquired");
        Ok(PageLease::new(surface, permit, id))
    }

    /// Dispose a leased page. Always safe, even when the surface is already
    /// broken: disposal errors are logged and never propagated, because
    /// release happens on guaranteed-cleanup paths.
    pub async fn release_page(&self, mut lease: PageLease) {
        let id = lease.id();
        if let Some(surface) = lease.take_surface() {
            match tokio::task::spawn_blocking(move || surface.close()).await {
                Ok(Ok(())) => debug!("page lease {id} released"),
                Ok(Err(err)) => warn!("disposing page lease {id} failed: {err}"),
                Err(err) => warn!("disposal task for page lease {id} failed: {err}"),
            }
        }
        // The semaphore permit drops with the lease here.
    }

    /// Render one request end to end: acquire a page, run the adaptive
    /// capture protocol, and release the page on every exit path.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderResult> {
        request.validate()?;
        let lease = self.acquire_page().await?;
        let outcome = capture::run(&lease, &request, &self.config).await;
        self.release_page(lease).await;
        outcome
    }

    /// Stop the shared process: refuse new leases, wait out any in-flight
    /// launch, then run each teardown step under its own time bound. A step
    /// that exceeds its bound is logged and skipped, never re-raised; the
    /// state afterwards is stopped, so `ensure_started` can bring up a fresh
    /// process.
    pub async fn shutdown(&self) -> ShutdownReport {
        let driver = loop {
            let (attempt, pending) = {
                let mut state = self.lock_state();
                match &*state {
                    LaunchState::Stopped => return ShutdownReport::default(),
                    LaunchState::Starting { attempt, rx } => (*attempt, rx.clone()),
                    LaunchState::Running(driver) => {
                        let driver = Arc::clone(driver);
                        *state = LaunchState::Stopped;
                        // Flag and state flip together under the lock,
                        // mirroring the launch path: ensure_started's fast
                        // path must never see the flag after the state is
                        // stopped.
                        self.started.store(false, Ordering::Release);
                        break driver;
                    }
                }
            };
            let mut rx = pending;
            let settled = loop {
                if rx.borrow().clone().is_some() {
                    break true;
                }
                if rx.changed().await.is_err() {
                    break false;
                }
            };
            if !settled {
                // The launching task was cancelled mid-launch and left its
                // marker behind; clear it so the match above can terminate.
                let mut state = self.lock_state();
                if matches!(&*state,
                    LaunchState::Starting { attempt: a, .. } if *a == attempt)
                {
                    *state = LaunchState::Stopped;
                }
            }
        };

        let mut report = ShutdownReport::default();
        let bound = Duration::from_millis(self.config.shutdown_step_timeout_ms);

        let closer = Arc::clone(&driver);
        run_step("close rendering process", bound, &mut report, move || {
            closer.close()
        })
        .await;

        run_step("release engine handle", bound, &mut report, move || {
            drop(driver);
            Ok(())
        })
        .await;

        info!(
            "engine shutdown complete: {} step(s) run, {} timed out",
            report.steps_run, report.steps_timed_out
        );
        report
    }
}

/// Run one teardown step on the blocking pool under a time bound. Timeouts
/// and errors are recorded and logged; the next step always gets its turn.
async fn run_step<F>(name: &'static str, bound: Duration, report: &mut ShutdownReport, step: F)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    report.steps_run += 1;
    match timeout(bound, tokio::task::spawn_blocking(step)).await {
        Ok(Ok(Ok(()))) => debug!("shutdown step '{name}' completed"),
        Ok(Ok(Err(err))) => warn!("shutdown step '{name}' failed: {err}"),
        Ok(Err(err)) => warn!("shutdown step '{name}' task failed: {err}"),
        Err(_) => {
            report.steps_timed_out += 1;
            warn!("{}", Error::ShutdownTimeout(name, bound.as_millis() as u64));
        }
    }
}

/// How the blocking launch of the browser process is scheduled.
trait LaunchStrategy: Send + Sync {
    fn label(&self) -> &'static str;

    /// Start the launch and return the channel that will carry its outcome.
    /// Dropping the returned receiver does not cancel the launch.
    fn begin(&self, factory: DriverFactory, config: EngineConfig)
        -> oneshot::Receiver<LaunchOutcome>;
}

/// Launch on tokio's blocking pool. Requires a multi-thread runtime.
struct BlockingPoolLaunch;

impl LaunchStrategy for BlockingPoolLaunch {
    fn label(&self) -> &'static str {
        "blocking-pool"
    }

    fn begin(
        &self,
        factory: DriverFactory,
        config: EngineConfig,
    ) -> oneshot::Receiver<LaunchOutcome> {
        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let _ = tx.send(factory(&config));
        });
        rx
    }
}

/// Launch on a dedicated worker thread, bridging the result back into the
/// caller's async context.
struct DedicatedThreadLaunch;

impl LaunchStrategy for DedicatedThreadLaunch {
    fn label(&self) -> &'static str {
        "dedicated-thread"
    }

    fn begin(
        &self,
        factory: DriverFactory,
        config: EngineConfig,
    ) -> oneshot::Receiver<LaunchOutcome> {
        let (tx, rx) = oneshot::channel();
        let spawned = std::thread::Builder::new()
            .name("htmlshot-launch".into())
            .spawn(move || {
                let _ = tx.send(factory(&config));
            });
        if let Err(err) = spawned {
            // The closure (and the sender with it) was dropped; the caller
            // sees a closed channel and maps it to a launch failure.
            warn!("could not spawn launch thread: {err}");
        }
        rx
    }
}

/// Capability probe, run once at manager construction. The driver's launch
/// sequence blocks on process spawn and protocol handshake; a current-thread
/// runtime shares one blocking pool with the driver's own transport threads,
/// so launching there gets a dedicated thread instead.
fn probe_strategy() -> Box<dyn LaunchStrategy> {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            Box::new(BlockingPoolLaunch)
        }
        _ => Box::new(DedicatedThreadLaunch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn manager(backend: &MockBackend) -> SessionManager {
        SessionManager::new(EngineConfig::default(), backend.factory())
    }

    #[tokio::test]
    async fn ensure_started_is_idempotent() {
        let backend = MockBackend::new();
        let mgr = manager(&backend);
        mgr.ensure_started().await.unwrap();
        mgr.ensure_started().await.unwrap();
        mgr.ensure_started().await.unwrap();
        assert_eq!(backend.launches(), 1);
    }

    #[tokio::test]
    async fn failed_launch_rolls_back_and_retries() {
        let backend = MockBackend::new();
        backend.fail_next_launches(1);
        let mgr = manager(&backend);

        let err = mgr.ensure_started().await.unwrap_err();
        assert!(matches!(err, Error::EngineLaunchFailed(_)));

        // State rolled back to stopped; the next call launches fresh.
        mgr.ensure_started().await.unwrap();
        assert_eq!(backend.launches(), 2);
    }

    #[tokio::test]
    async fn acquire_after_shutdown_restarts_lazily() {
        let backend = MockBackend::new();
        let mgr = manager(&backend);
        mgr.ensure_started().await.unwrap();
        mgr.shutdown().await;

        // acquire_page goes through ensure_started, so this is a relaunch,
        // not a ProcessUnavailable.
        let lease = mgr.acquire_page().await.unwrap();
        mgr.release_page(lease).await;
        assert_eq!(backend.launches(), 2);
    }

    #[tokio::test]
    async fn shutdown_without_start_is_a_noop() {
        let backend = MockBackend::new();
        let mgr = manager(&backend);
        let report = mgr.shutdown().await;
        assert_eq!(report.steps_run, 0);
        assert_eq!(backend.launches(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn multi_thread_runtime_uses_blocking_pool_strategy() {
        let backend = MockBackend::new();
        let mgr = manager(&backend);
        assert_eq!(mgr.strategy.label(), "blocking-pool");
        mgr.ensure_started().await.unwrap();
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn current_thread_runtime_uses_dedicated_thread_strategy() {
        let backend = MockBackend::new();
        let mgr = manager(&backend);
        assert_eq!(mgr.strategy.label(), "dedicated-thread");
        mgr.ensure_started().await.unwrap();
        mgr.shutdown().await;
    }
}
