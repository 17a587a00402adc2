//! Runtime-loaded CUDA runtime function pointers via dlopen.
//!
//! This avoids pinning to a specific CUDA toolkit version — works with any
//! install that provides a loadable `libcudart`. Hosts without one fall back
//! to [`UnsupportedDriver`](crate::driver::UnsupportedDriver).

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};

use libloading::Library;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use tracing::debug;

use crate::driver::{
    DriverApi, HostAllocator, RawResult, RuntimeHandle, StreamHandle, CUDA_SUCCESS,
};
use crate::error::CudaError;

/// Candidate library names, tried in order.
#[cfg(target_os = "macos")]
const CUDART_NAMES: &[&str] = &["libcudart.dylib"];
#[cfg(not(target_os = "macos"))]
const CUDART_NAMES: &[&str] = &["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"];

/// Library-search-path variable named in resolution failures.
#[cfg(target_os = "macos")]
pub(crate) const SEARCH_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub(crate) const SEARCH_PATH_VAR: &str = "LD_LIBRARY_PATH";

type FnDriverGetVersion = unsafe extern "C" fn(*mut c_int) -> c_int;
type FnRuntimeGetVersion = unsafe extern "C" fn(*mut c_int) -> c_int;
type FnGetDeviceCount = unsafe extern "C" fn(*mut c_int) -> c_int;
type FnGetDevice = unsafe extern "C" fn(*mut c_int) -> c_int;
type FnSetDevice = unsafe extern "C" fn(c_int) -> c_int;
type FnDeviceSynchronize = unsafe extern "C" fn() -> c_int;
type FnFree = unsafe extern "C" fn(*mut c_void) -> c_int;
type FnGetDeviceProperties = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type FnHostAlloc = unsafe extern "C" fn(*mut *mut c_void, usize, c_int) -> c_int;
type FnGetErrorName = unsafe extern "C" fn(c_int) -> *const c_char;
type FnGetErrorString = unsafe extern "C" fn(c_int) -> *const c_char;

/// Runtime-loaded CUDA runtime API.
///
/// The "current stream" selector is process-global state owned by this layer
/// (the runtime itself has no such global); kernels submitted by consumers
/// read it through `get_stream`.
pub struct DlDriver {
    _lib: Library,
    lib_name: &'static str,
    driver_get_version: FnDriverGetVersion,
    runtime_get_version: FnRuntimeGetVersion,
    get_device_count: FnGetDeviceCount,
    get_device: FnGetDevice,
    set_device: FnSetDevice,
    device_synchronize: FnDeviceSynchronize,
    free: FnFree,
    get_device_properties: FnGetDeviceProperties,
    host_alloc: FnHostAlloc,
    current_stream: AtomicUsize,
    free_mutex: RawMutex,
}

// Safety: the loaded function pointers are process-global and the CUDA
// runtime is internally synchronized.
unsafe impl Send for DlDriver {}
unsafe impl Sync for DlDriver {}

fn raw(code: c_int) -> RawResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(code)
    }
}

impl DlDriver {
    /// Load the runtime library and resolve the symbol set this layer needs.
    /// Returns `None` if no candidate library loads or a symbol is missing.
    pub fn try_load() -> Option<Self> {
        for &name in CUDART_NAMES {
            if let Some(driver) = Self::try_load_from(name) {
                debug!(library = name, "loaded CUDA runtime");
                return Some(driver);
            }
        }
        None
    }

    fn try_load_from(name: &'static str) -> Option<Self> {
        let lib = unsafe { Library::new(name) }.ok()?;
        unsafe {
            let driver = DlDriver {
                driver_get_version: *lib.get::<FnDriverGetVersion>(b"cudaDriverGetVersion\0").ok()?,
                runtime_get_version: *lib.get::<FnRuntimeGetVersion>(b"cudaRuntimeGetVersion\0").ok()?,
                get_device_count: *lib.get::<FnGetDeviceCount>(b"cudaGetDeviceCount\0").ok()?,
                get_device: *lib.get::<FnGetDevice>(b"cudaGetDevice\0").ok()?,
                set_device: *lib.get::<FnSetDevice>(b"cudaSetDevice\0").ok()?,
                device_synchronize: *lib.get::<FnDeviceSynchronize>(b"cudaDeviceSynchronize\0").ok()?,
                free: *lib.get::<FnFree>(b"cudaFree\0").ok()?,
                get_device_properties: *lib
                    .get::<FnGetDeviceProperties>(b"cudaGetDeviceProperties_v2\0")
                    .or_else(|_| lib.get::<FnGetDeviceProperties>(b"cudaGetDeviceProperties\0"))
                    .ok()?,
                host_alloc: *lib.get::<FnHostAlloc>(b"cudaHostAlloc\0").ok()?,
                current_stream: AtomicUsize::new(StreamHandle::DEFAULT.as_raw()),
                free_mutex: RawMutex::INIT,
                lib_name: name,
                _lib: lib,
            };
            Some(driver)
        }
    }

    fn runtime_version(&self) -> i32 {
        let mut version: c_int = 0;
        if unsafe { (self.runtime_get_version)(&mut version) } != CUDA_SUCCESS {
            return 0;
        }
        version
    }
}

impl DriverApi for DlDriver {
    fn driver_version(&self) -> i32 {
        let mut version: c_int = 0;
        if unsafe { (self.driver_get_version)(&mut version) } != CUDA_SUCCESS {
            return 0;
        }
        version
    }

    fn driver_is_sufficient(&self) -> bool {
        let driver = self.driver_version();
        driver > 0 && driver >= self.runtime_version()
    }

    fn device_count(&self) -> RawResult<i32> {
        let mut count: c_int = 0;
        raw(unsafe { (self.get_device_count)(&mut count) })?;
        Ok(count)
    }

    fn get_device(&self) -> RawResult<i32> {
        let mut index: c_int = 0;
        raw(unsafe { (self.get_device)(&mut index) })?;
        Ok(index)
    }

    fn set_device(&self, index: i32) -> RawResult<()> {
        raw(unsafe { (self.set_device)(index) })
    }

    fn get_stream(&self) -> RawResult<StreamHandle> {
        Ok(StreamHandle::from_raw(self.current_stream.load(Ordering::Acquire)))
    }

    fn set_stream(&self, stream: StreamHandle) -> RawResult<()> {
        self.current_stream.store(stream.as_raw(), Ordering::Release);
        Ok(())
    }

    fn synchronize(&self) -> RawResult<()> {
        raw(unsafe { (self.device_synchronize)() })
    }

    fn init(&self) -> RawResult<()> {
        // cudaFree(NULL) forces runtime context creation without allocating.
        raw(unsafe { (self.free)(std::ptr::null_mut()) })
    }

    fn sparse_init(&self) -> RawResult<()> {
        // cuSPARSE handles are created by the sparse consumers on first use;
        // nothing to do at the runtime level.
        Ok(())
    }

    fn lock_mutex(&self) {
        self.free_mutex.lock();
    }

    fn unlock_mutex(&self) {
        // Safety: callers pair this with `lock_mutex` via `FreeMutexGuard`.
        unsafe { self.free_mutex.unlock() };
    }

    fn device_name(&self, index: i32) -> RawResult<String> {
        // cudaDeviceProp starts with a NUL-terminated `name` field; the rest
        // of the struct is layout-opaque to us, so give it generous room.
        let mut prop = [0u8; 2048];
        raw(unsafe { (self.get_device_properties)(prop.as_mut_ptr().cast(), index) })?;
        let name = unsafe { CStr::from_ptr(prop.as_ptr().cast()) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn host_allocator(&self) -> RawResult<HostAllocator> {
        // Opaque cookie: the pinned-allocation entry point itself.
        Ok(HostAllocator::from_raw(self.host_alloc as usize))
    }

    fn resolve_runtime(&self) -> Result<RuntimeHandle, CudaError> {
        let lib = unsafe { Library::new(self.lib_name) }.map_err(|_| {
            CudaError::LibraryResolution {
                library: self.lib_name.to_string(),
                search_path_var: SEARCH_PATH_VAR,
            }
        })?;
        let missing = |_| CudaError::LibraryResolution {
            library: self.lib_name.to_string(),
            search_path_var: SEARCH_PATH_VAR,
        };
        let error_name: FnGetErrorName =
            unsafe { *lib.get::<FnGetErrorName>(b"cudaGetErrorName\0").map_err(missing)? };
        let error_string: FnGetErrorString =
            unsafe { *lib.get::<FnGetErrorString>(b"cudaGetErrorString\0").map_err(missing)? };

        let lookup = move |f: FnGetErrorName, code: c_int| -> String {
            let ptr = unsafe { f(code) };
            if ptr.is_null() {
                return format!("cuda error {code}");
            }
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
        };
        Ok(RuntimeHandle::new(
            Box::new(move |code| lookup(error_name, code)),
            Box::new(move |code| lookup(error_string, code)),
            Some(lib),
        ))
    }
}
