//! Error taxonomy and native-status translation.

use crate::driver::{
    CudaStatus, RuntimeHandle, CUDA_ERROR_NOT_READY, CUDA_ERROR_NOT_SUPPORTED, CUDA_SUCCESS,
};

/// Failures surfaced by the CUDA runtime layer.
///
/// Nothing here is retried automatically; every failure propagates to the
/// immediate caller.
#[derive(Debug, thiserror::Error)]
pub enum CudaError {
    /// Runtime support is not present at all (no loadable runtime library).
    #[error("lumen was not able to load CUDA runtime support on this system")]
    Configuration,

    /// No driver installed.
    #[error(
        "found no NVIDIA driver on your system; check that you have an \
         NVIDIA GPU and a driver installed"
    )]
    NoDriver,

    /// Driver present but older than the runtime requires.
    #[error(
        "the NVIDIA driver on your system is too old (found version {version}); \
         update the GPU driver or install a build matching your driver"
    )]
    DriverTooOld { version: i32 },

    /// The dynamic runtime library could not be resolved.
    #[error(
        "couldn't load {library}; make sure CUDA libraries are installed in a \
         default location, or add their directory to {search_path_var}"
    )]
    LibraryResolution {
        library: String,
        search_path_var: &'static str,
    },

    /// Use after a detected fork while the runtime was initialized.
    #[error(
        "cannot re-initialize CUDA in a forked subprocess; start worker \
         processes with a spawn-based start method instead of fork"
    )]
    BadFork,

    /// A queued action failed while the deferred queue was drained.
    #[error(
        "CUDA call failed lazily at initialization with error: {source}\n\n\
         CUDA call was originally enqueued at:\n{origin}"
    )]
    DeferredCall {
        source: Box<CudaError>,
        origin: String,
    },

    /// Non-success, non-not-ready status from a runtime call.
    #[error("{message} ({code})")]
    Status { code: CudaStatus, message: String },

    /// Distinguished "operation pending, poll again" status. Not fatal;
    /// polling callers branch on this variant.
    #[error("CUDA operation not ready")]
    NotReady,
}

impl CudaError {
    /// Whether this is the pollable not-ready outcome rather than a failure.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, CudaError::NotReady)
    }
}

/// Translate a raw status code into a structured outcome.
///
/// Name/description lookups go through `runtime` and therefore only happen
/// once the runtime library has been resolved; before that (or for fake
/// states without one) a generic message is used.
pub(crate) fn check(code: CudaStatus, runtime: Option<&RuntimeHandle>) -> Result<(), CudaError> {
    match code {
        CUDA_SUCCESS => Ok(()),
        CUDA_ERROR_NOT_READY => Err(CudaError::NotReady),
        CUDA_ERROR_NOT_SUPPORTED => Err(CudaError::Configuration),
        code => {
            let message = match runtime {
                Some(rt) => format!("{}: {}", rt.error_name(code), rt.error_string(code)),
                None => "unrecognized CUDA runtime error".to_string(),
            };
            Err(CudaError::Status { code, message })
        }
    }
}
