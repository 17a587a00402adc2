//! Capability boundary to the native CUDA runtime.
//!
//! Everything this crate does with the GPU goes through [`DriverApi`]. The
//! production implementation (`ffi::DlDriver`) forwards to runtime-loaded
//! function pointers; [`UnsupportedDriver`] stands in when no runtime library
//! can be loaded, so the crate stays usable (and `is_available()` returns
//! false) on machines without CUDA.

use crate::error::CudaError;

/// Raw status code returned by the native runtime (`cudaError_t`).
pub type CudaStatus = i32;

/// Distinguished success code.
pub const CUDA_SUCCESS: CudaStatus = 0;

/// "Operation pending, poll again" — non-fatal, must stay distinguishable
/// from real failures for polling callers.
pub const CUDA_ERROR_NOT_READY: CudaStatus = 34;

/// Sentinel reported by [`UnsupportedDriver`]; translated to
/// [`CudaError::Configuration`] rather than a status error.
pub const CUDA_ERROR_NOT_SUPPORTED: CudaStatus = 801;

/// Result of a raw shim call, before status translation.
pub type RawResult<T> = std::result::Result<T, CudaStatus>;

/// Opaque handle to an execution stream (the runtime's `cudaStream_t`,
/// carried as an address so it stays `Send`/`Sync` and test-constructible).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(usize);

impl Default for StreamHandle {
    fn default() -> Self {
        StreamHandle::DEFAULT
    }
}

impl StreamHandle {
    /// The default (null) stream.
    pub const DEFAULT: StreamHandle = StreamHandle(0);

    pub fn from_raw(raw: usize) -> Self {
        StreamHandle(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }

    /// Whether this is the default stream.
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// Opaque handle to the runtime's pinned host-memory allocator.
///
/// This layer only exposes the handle; allocation policy lives elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostAllocator(usize);

impl HostAllocator {
    pub fn from_raw(raw: usize) -> Self {
        HostAllocator(raw)
    }

    pub fn as_raw(&self) -> usize {
        self.0
    }
}

/// Resolved runtime library used for error-string lookups.
///
/// Owned exclusively by `RuntimeState` once initialization succeeds; valid
/// only in the process that resolved it.
pub struct RuntimeHandle {
    name: Box<dyn Fn(CudaStatus) -> String + Send + Sync>,
    describe: Box<dyn Fn(CudaStatus) -> String + Send + Sync>,
    // Keeps the dlopen'd library alive for as long as the lookups are usable.
    _keepalive: Option<libloading::Library>,
}

impl RuntimeHandle {
    pub(crate) fn new(
        name: Box<dyn Fn(CudaStatus) -> String + Send + Sync>,
        describe: Box<dyn Fn(CudaStatus) -> String + Send + Sync>,
        keepalive: Option<libloading::Library>,
    ) -> Self {
        RuntimeHandle { name, describe, _keepalive: keepalive }
    }

    /// Build a handle from plain lookup closures (fake/embedded runtimes).
    pub fn from_fns(
        name: impl Fn(CudaStatus) -> String + Send + Sync + 'static,
        describe: impl Fn(CudaStatus) -> String + Send + Sync + 'static,
    ) -> Self {
        RuntimeHandle::new(Box::new(name), Box::new(describe), None)
    }

    /// Symbolic error name for a status code (e.g. `cudaErrorMemoryAllocation`).
    pub fn error_name(&self, code: CudaStatus) -> String {
        (self.name)(code)
    }

    /// Human-readable description for a status code.
    pub fn error_string(&self, code: CudaStatus) -> String {
        (self.describe)(code)
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle").finish_non_exhaustive()
    }
}

/// Abstract surface of the native runtime consumed by this crate.
///
/// Raw methods return untranslated status codes; `RuntimeState::check` maps
/// them to [`CudaError`]. Implementations must be callable from any thread
/// (the runtime is internally synchronized).
pub trait DriverApi: Send + Sync {
    /// Whether runtime support exists at all. The probe and the init path
    /// treat `false` as "unavailable", never as a panic.
    fn supported(&self) -> bool {
        true
    }

    /// Installed driver version, 0 when no driver was found.
    fn driver_version(&self) -> i32;

    /// Whether the installed driver can serve this runtime.
    fn driver_is_sufficient(&self) -> bool;

    fn device_count(&self) -> RawResult<i32>;

    fn get_device(&self) -> RawResult<i32>;

    fn set_device(&self, index: i32) -> RawResult<()>;

    fn get_stream(&self) -> RawResult<StreamHandle>;

    fn set_stream(&self, stream: StreamHandle) -> RawResult<()>;

    /// Wait for all pending work on the current device.
    fn synchronize(&self) -> RawResult<()>;

    /// One-time runtime initialization.
    fn init(&self) -> RawResult<()>;

    /// One-time sparse-subsystem initialization.
    fn sparse_init(&self) -> RawResult<()>;

    /// Acquire the process-wide runtime mutex. Paired with `unlock_mutex`;
    /// not re-entrant.
    fn lock_mutex(&self);

    fn unlock_mutex(&self);

    fn device_name(&self, index: i32) -> RawResult<String>;

    fn host_allocator(&self) -> RawResult<HostAllocator>;

    /// Resolve the dynamic runtime library backing error-string lookups.
    /// Called once during initialization; the handle is owned by
    /// `RuntimeState` afterwards.
    fn resolve_runtime(&self) -> Result<RuntimeHandle, CudaError>;
}

/// Stand-in driver for builds/hosts without any CUDA runtime.
///
/// Every operation fails: raw calls report [`CUDA_ERROR_NOT_SUPPORTED`]
/// (translated to [`CudaError::Configuration`]), and `supported()` is false
/// so the availability probe short-circuits without touching anything.
#[derive(Debug, Default)]
pub struct UnsupportedDriver;

impl DriverApi for UnsupportedDriver {
    fn supported(&self) -> bool {
        false
    }

    fn driver_version(&self) -> i32 {
        0
    }

    fn driver_is_sufficient(&self) -> bool {
        false
    }

    fn device_count(&self) -> RawResult<i32> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn get_device(&self) -> RawResult<i32> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn set_device(&self, _index: i32) -> RawResult<()> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn get_stream(&self) -> RawResult<StreamHandle> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn set_stream(&self, _stream: StreamHandle) -> RawResult<()> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn synchronize(&self) -> RawResult<()> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn init(&self) -> RawResult<()> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn sparse_init(&self) -> RawResult<()> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn lock_mutex(&self) {}

    fn unlock_mutex(&self) {}

    fn device_name(&self, _index: i32) -> RawResult<String> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn host_allocator(&self) -> RawResult<HostAllocator> {
        Err(CUDA_ERROR_NOT_SUPPORTED)
    }

    fn resolve_runtime(&self) -> Result<RuntimeHandle, CudaError> {
        Err(CudaError::Configuration)
    }
}
