//! # lumen-cuda
//!
//! Lazy CUDA runtime initialization and device-context management for Lumen.
//!
//! The crate can always be loaded; nothing touches the GPU until first real
//! use. Check [`is_available()`] to find out whether CUDA is usable.
//!
//! Provides:
//! - A lazy-init state machine with a FIFO deferred-call queue
//! - Fork-after-init detection (native handles are invalid in the child)
//! - RAII scopes for the current device, current stream, and runtime mutex
//! - Structured errors translated from native status codes
//!
//! The runtime itself is reached through the [`driver::DriverApi`] boundary:
//! dlopen-backed in production, fake-backed in tests.

pub mod device;
pub mod driver;
pub mod error;
pub mod ffi;
pub mod init;
pub mod lock;
pub mod stream;

pub use device::{Device, DeviceGuard, DeviceResident};
pub use driver::{CudaStatus, HostAllocator, StreamHandle};
pub use error::CudaError;
pub use init::{state, RuntimeState};
pub use lock::FreeMutexGuard;
pub use stream::StreamGuard;

pub type Result<T> = std::result::Result<T, CudaError>;

/// Whether CUDA is currently usable: driver support present, sufficient, and
/// at least one device visible. Never errors, never initializes the runtime.
pub fn is_available() -> bool {
    state().is_available()
}

/// Perform one-time runtime setup if it has not happened yet.
pub fn ensure_initialized() -> Result<()> {
    state().ensure_initialized()
}

/// Run `action` now if the runtime is ready, else queue it until it is.
pub fn lazy_call<F>(action: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    state().lazy_call(action)
}

/// Number of GPUs available; 0 when CUDA is unavailable.
pub fn device_count() -> Result<i32> {
    state().device_count()
}

/// Index of the currently selected device.
pub fn current_device() -> Result<i32> {
    state().current_device()
}

/// Set the current device; a no-op for negative indices.
///
/// Prefer the scoped [`device()`] guard, which restores the previous
/// selection on exit.
pub fn set_device(index: i32) -> Result<()> {
    state().set_device(index)
}

/// Name of the device at `index`.
pub fn get_device_name(index: i32) -> Result<String> {
    state().device_name(index)
}

/// Wait for all kernels in all streams on the current device to complete.
pub fn synchronize() -> Result<()> {
    state().synchronize()
}

/// The currently selected stream.
pub fn current_stream() -> Result<StreamHandle> {
    state().current_stream()
}

/// Handle to the runtime's pinned host-memory allocator.
pub fn host_allocator() -> Result<HostAllocator> {
    state().host_allocator()
}

/// Scoped switch to device `index` (negative = no-op scope).
pub fn device(index: i32) -> Result<DeviceGuard<'static>> {
    state().device_guard(index)
}

/// Scoped switch to the device `obj` lives on (no-op for CPU residents).
pub fn device_of<T: DeviceResident>(obj: &T) -> Result<DeviceGuard<'static>> {
    state().device_guard_of(obj)
}

/// Scoped switch of the current stream (`None` = no-op scope).
pub fn stream(stream: Option<StreamHandle>) -> Result<StreamGuard<'static>> {
    state().stream_guard(stream)
}

/// Scoped hold of the process-wide runtime mutex.
pub fn free_mutex() -> FreeMutexGuard<'static> {
    state().free_mutex()
}
