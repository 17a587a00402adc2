//! Lazy-initialization state machine for the CUDA runtime.
//!
//! Nothing touches the GPU at load time: runtime-bound work requested before
//! first use is queued and replayed, in order, once `ensure_initialized`
//! succeeds. A fork after initialization poisons the state permanently —
//! native runtime handles are not valid in the child.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::driver::{CudaStatus, DriverApi, HostAllocator, RawResult, RuntimeHandle};
use crate::error::{check, CudaError};
use crate::ffi::DlDriver;
use crate::{driver::UnsupportedDriver, Result};

/// A unit of work requested before the runtime was confirmed usable.
struct DeferredCall {
    action: Box<dyn FnOnce() -> Result<()> + Send>,
    /// Where the call was enqueued; error-message content only.
    origin: String,
}

/// Process-wide runtime state.
///
/// Production code uses the [`state`] singleton; tests construct isolated
/// instances around fake drivers via [`RuntimeState::new`].
pub struct RuntimeState {
    driver: Arc<dyn DriverApi>,
    initialized: AtomicBool,
    in_bad_fork: AtomicBool,
    original_pid: AtomicU32,
    queue: Mutex<Vec<DeferredCall>>,
    runtime: Mutex<Option<RuntimeHandle>>,
    // Serializes first-use setup; the fast path never takes it.
    init_lock: Mutex<()>,
}

impl RuntimeState {
    pub fn new(driver: Arc<dyn DriverApi>) -> Self {
        RuntimeState {
            driver,
            initialized: AtomicBool::new(false),
            in_bad_fork: AtomicBool::new(false),
            original_pid: AtomicU32::new(0),
            queue: Mutex::new(Vec::new()),
            runtime: Mutex::new(None),
            init_lock: Mutex::new(()),
        }
    }

    pub(crate) fn driver(&self) -> &dyn DriverApi {
        &*self.driver
    }

    /// Whether one-time setup has completed (and no fork invalidated it).
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// True iff the driver can serve this runtime and at least one device is
    /// present. Never errors and never triggers initialization.
    pub fn is_available(&self) -> bool {
        if !self.driver.supported() || !self.driver.driver_is_sufficient() {
            return false;
        }
        self.driver.device_count().map(|n| n > 0).unwrap_or(false)
    }

    /// Run `action` now if the runtime is ready, otherwise queue it for the
    /// drain step of [`ensure_initialized`](Self::ensure_initialized).
    ///
    /// Queued actions run in strict submission order, on whichever thread
    /// first completes initialization.
    pub fn lazy_call<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if self.is_initialized() {
            return action();
        }
        let mut queue = self.queue.lock();
        // Initialization may have completed while we were acquiring the lock.
        if self.is_initialized() {
            drop(queue);
            return action();
        }
        queue.push(DeferredCall {
            action: Box::new(action),
            origin: Backtrace::force_capture().to_string(),
        });
        Ok(())
    }

    /// Perform one-time runtime setup, then drain the deferred queue in FIFO
    /// order. Idempotent: a no-op once the state is ready.
    ///
    /// All failure branches before the drain leave the state uninitialized.
    /// If a drained action fails, draining stops there, the failure is
    /// wrapped as [`CudaError::DeferredCall`], and the state stays ready —
    /// the runtime is live but the remaining deferred work was abandoned.
    pub fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let _guard = self.init_lock.lock();
        if self.is_initialized() {
            return Ok(());
        }
        if self.in_bad_fork.load(Ordering::Acquire) {
            return Err(CudaError::BadFork);
        }

        self.check_driver()?;
        self.check(self.driver.init())?;
        self.check(self.driver.sparse_init())?;
        let runtime = self.driver.resolve_runtime()?;
        *self.runtime.lock() = Some(runtime);

        self.original_pid.store(std::process::id(), Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        debug!("CUDA runtime initialized");

        let queued = std::mem::take(&mut *self.queue.lock());
        for call in queued {
            if let Err(source) = (call.action)() {
                return Err(CudaError::DeferredCall {
                    source: Box::new(source),
                    origin: call.origin,
                });
            }
        }
        Ok(())
    }

    fn check_driver(&self) -> Result<()> {
        if !self.driver.supported() {
            return Err(CudaError::Configuration);
        }
        if !self.driver.driver_is_sufficient() {
            let version = self.driver.driver_version();
            if version == 0 {
                return Err(CudaError::NoDriver);
            }
            return Err(CudaError::DriverTooOld { version });
        }
        Ok(())
    }

    /// Translate the outcome of a raw shim call.
    pub(crate) fn check<T>(&self, result: RawResult<T>) -> Result<T> {
        result.map_err(|code| self.translate(code))
    }

    fn translate(&self, code: CudaStatus) -> CudaError {
        let runtime = self.runtime.lock();
        match check(code, runtime.as_ref()) {
            Err(err) => err,
            // A shim handed back the success code in the error position.
            Ok(()) => CudaError::Status {
                code,
                message: "unexpected status".to_string(),
            },
        }
    }

    /// Fork-completion hook. Fires in every child; a pure no-op unless the
    /// state was ready in the parent and the pid actually changed.
    ///
    /// Atomics only — this may run inside a `pthread_atfork` child handler.
    pub fn note_fork(&self, current_pid: u32) {
        if self.is_initialized() && self.original_pid.load(Ordering::Acquire) != current_pid {
            // Clearing `initialized` forces every construction fast path back
            // through `ensure_initialized`, which now fails with BadFork.
            self.initialized.store(false, Ordering::Release);
            self.in_bad_fork.store(true, Ordering::Release);
        }
    }

    /// Handle to the runtime's pinned host-memory allocator.
    pub fn host_allocator(&self) -> Result<HostAllocator> {
        self.ensure_initialized()?;
        self.check(self.driver.host_allocator())
    }

    /// Number of visible devices; 0 when CUDA is unavailable.
    pub fn device_count(&self) -> Result<i32> {
        if !self.is_available() {
            return Ok(0);
        }
        self.ensure_initialized()?;
        self.check(self.driver.device_count())
    }

    /// Index of the currently selected device.
    pub fn current_device(&self) -> Result<i32> {
        self.ensure_initialized()?;
        self.check(self.driver.get_device())
    }

    /// Select `index` as the current device; a no-op when `index` is
    /// negative. Prefer the scoped [`device_guard`](Self::device_guard).
    pub fn set_device(&self, index: i32) -> Result<()> {
        if index < 0 {
            return Ok(());
        }
        self.ensure_initialized()?;
        self.check(self.driver.set_device(index))
    }

    /// Name of the device at `index`.
    pub fn device_name(&self, index: i32) -> Result<String> {
        self.ensure_initialized()?;
        self.check(self.driver.device_name(index))
    }

    /// Wait for all kernels on the current device to complete.
    pub fn synchronize(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.check(self.driver.synchronize())
    }
}

impl std::fmt::Debug for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeState")
            .field("initialized", &self.is_initialized())
            .field("in_bad_fork", &self.in_bad_fork.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

static STATE: OnceLock<RuntimeState> = OnceLock::new();

/// The process-wide runtime state used by the module-level API.
pub fn state() -> &'static RuntimeState {
    STATE.get_or_init(|| {
        register_fork_hook();
        let driver: Arc<dyn DriverApi> = match DlDriver::try_load() {
            Some(driver) => Arc::new(driver),
            None => Arc::new(UnsupportedDriver),
        };
        RuntimeState::new(driver)
    })
}

#[cfg(unix)]
fn register_fork_hook() {
    extern "C" fn after_fork_in_child() {
        if let Some(state) = STATE.get() {
            state.note_fork(std::process::id());
        }
    }
    // Registration failure (resource exhaustion) just means fork detection is
    // off; nothing to do about it at this point.
    unsafe {
        libc::pthread_atfork(None, None, Some(after_fork_in_child));
    }
}

#[cfg(not(unix))]
fn register_fork_hook() {}

#[cfg(test)]
mod tests {
    use crate::driver::fake::FakeDriver;
    use crate::driver::CUDA_ERROR_NOT_READY;

    use super::*;

    fn ready_state() -> (Arc<FakeDriver>, RuntimeState) {
        let driver = Arc::new(FakeDriver::healthy());
        let state = RuntimeState::new(driver.clone());
        (driver, state)
    }

    #[test]
    fn test_deferred_calls_run_in_fifo_order() {
        let (_, state) = ready_state();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            state
                .lazy_call(move || {
                    order.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }
        assert!(order.lock().is_empty());

        state.ensure_initialized().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_lazy_call_runs_immediately_once_ready() {
        let (_, state) = ready_state();
        state.ensure_initialized().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        state
            .lazy_call(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drain_stops_at_first_failure() {
        let (_, state) = ready_state();
        let ran_after = Arc::new(AtomicBool::new(false));

        state.lazy_call(|| Ok(())).unwrap();
        state
            .lazy_call(|| Err(CudaError::Status { code: 2, message: "boom".into() }))
            .unwrap();
        let flag = ran_after.clone();
        state
            .lazy_call(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let err = state.ensure_initialized().unwrap_err();
        match err {
            CudaError::DeferredCall { source, origin } => {
                assert!(matches!(*source, CudaError::Status { code: 2, .. }));
                assert!(!origin.is_empty());
            }
            other => panic!("expected DeferredCall, got {other}"),
        }
        assert!(!ran_after.load(Ordering::SeqCst));
        // The machine stays live; the failure was surfaced, not retried.
        assert!(state.is_initialized());
        assert!(state.ensure_initialized().is_ok());
    }

    #[test]
    fn test_ensure_initialized_is_idempotent() {
        let (driver, state) = ready_state();
        state.ensure_initialized().unwrap();
        state.ensure_initialized().unwrap();
        assert_eq!(driver.call_count("init"), 1);
        assert_eq!(driver.call_count("sparse_init"), 1);
        assert_eq!(driver.call_count("resolve_runtime"), 1);
    }

    #[test]
    fn test_fork_after_init_poisons_the_state() {
        let (_, state) = ready_state();
        state.ensure_initialized().unwrap();

        state.note_fork(std::process::id().wrapping_add(1));
        assert!(!state.is_initialized());
        assert!(matches!(state.ensure_initialized(), Err(CudaError::BadFork)));
        // Absorbing: still failing on the next attempt.
        assert!(matches!(state.ensure_initialized(), Err(CudaError::BadFork)));
    }

    #[test]
    fn test_fork_hook_is_noop_before_init() {
        let (_, state) = ready_state();
        state.note_fork(std::process::id().wrapping_add(1));
        assert!(!state.is_initialized());
        assert!(state.ensure_initialized().is_ok());
    }

    #[test]
    fn test_fork_hook_is_noop_for_same_pid() {
        let (_, state) = ready_state();
        state.ensure_initialized().unwrap();
        state.note_fork(std::process::id());
        assert!(state.is_initialized());
    }

    #[test]
    fn test_is_available_without_support() {
        let state = RuntimeState::new(Arc::new(UnsupportedDriver));
        assert!(!state.is_available());
        assert!(!state.is_initialized());
        assert!(matches!(state.ensure_initialized(), Err(CudaError::Configuration)));
    }

    #[test]
    fn test_is_available_does_not_initialize() {
        let (driver, state) = ready_state();
        assert!(state.is_available());
        assert!(!state.is_initialized());
        assert_eq!(driver.call_count("init"), 0);
    }

    #[test]
    fn test_is_available_with_zero_devices() {
        let driver = Arc::new(FakeDriver { devices: 0, ..FakeDriver::healthy() });
        let state = RuntimeState::new(driver);
        assert!(!state.is_available());
    }

    #[test]
    fn test_no_driver_message_variant() {
        let driver = Arc::new(FakeDriver {
            driver_version: 0,
            sufficient: false,
            ..FakeDriver::healthy()
        });
        let state = RuntimeState::new(driver);
        let err = state.ensure_initialized().unwrap_err();
        assert!(matches!(err, CudaError::NoDriver));
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_driver_too_old_message_variant() {
        let driver = Arc::new(FakeDriver {
            driver_version: 9010,
            sufficient: false,
            ..FakeDriver::healthy()
        });
        let state = RuntimeState::new(driver);
        let err = state.ensure_initialized().unwrap_err();
        assert!(matches!(err, CudaError::DriverTooOld { version: 9010 }));
        assert!(err.to_string().contains("9010"));
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_failed_init_leaves_state_uninitialized() {
        let driver = Arc::new(FakeDriver {
            fail_init_with: Some(2),
            ..FakeDriver::healthy()
        });
        let state = RuntimeState::new(driver.clone());
        assert!(matches!(
            state.ensure_initialized(),
            Err(CudaError::Status { code: 2, .. })
        ));
        assert!(!state.is_initialized());

        // Not latched: a later attempt runs the setup again.
        assert!(state.ensure_initialized().is_err());
        assert_eq!(driver.call_count("init"), 2);
    }

    #[test]
    fn test_check_translates_not_ready() {
        let (_, state) = ready_state();
        state.ensure_initialized().unwrap();
        let err = state.check::<()>(Err(CUDA_ERROR_NOT_READY)).unwrap_err();
        assert!(err.is_not_ready());
    }

    #[test]
    fn test_check_uses_runtime_error_strings() {
        let (_, state) = ready_state();
        state.ensure_initialized().unwrap();
        let err = state.check::<()>(Err(2)).unwrap_err();
        assert_eq!(err.to_string(), "fakeError2: fake runtime failure (2)");
    }

    #[test]
    fn test_device_count_is_zero_when_unavailable() {
        let state = RuntimeState::new(Arc::new(UnsupportedDriver));
        assert_eq!(state.device_count().unwrap(), 0);
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_counters_after_init() {
        let (driver, state) = ready_state();
        assert_eq!(state.device_count().unwrap(), 2);
        assert!(state.is_initialized());
        assert_eq!(state.current_device().unwrap(), 0);
        state.set_device(1).unwrap();
        assert_eq!(state.current_device().unwrap(), 1);
        state.set_device(-1).unwrap();
        assert_eq!(state.current_device().unwrap(), 1);
        assert_eq!(state.device_name(0).unwrap(), "Fake GPU 0");
        state.synchronize().unwrap();
        assert_eq!(driver.call_count("synchronize"), 1);
    }
}
