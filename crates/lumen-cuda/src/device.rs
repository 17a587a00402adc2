//! Device selection: the `Device` placement type and scoped switching of the
//! current-device global.

use std::fmt;

use tracing::error;

use crate::init::RuntimeState;
use crate::Result;

/// Compute device a piece of data lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory.
    #[default]
    Cpu,
    /// CUDA GPU with device index.
    Cuda(usize),
}

impl Device {
    /// Whether this is the CPU.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Get the CUDA device index, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Anything with a device placement (tensors, storages, buffers).
pub trait DeviceResident {
    fn device(&self) -> Device;
}

/// Scoped switch of the current device, restored on drop.
///
/// Created with a negative index the guard is a no-op: no initialization, no
/// runtime calls, nothing restored on exit.
#[derive(Debug)]
pub struct DeviceGuard<'a> {
    state: &'a RuntimeState,
    target: i32,
    prev: i32,
    active: bool,
}

impl RuntimeState {
    /// Enter a device scope targeting `index` (negative = no-op scope).
    ///
    /// The previous device index is recorded even when it already equals
    /// `index`; `set_device` is only issued when they differ.
    pub fn device_guard(&self, index: i32) -> Result<DeviceGuard<'_>> {
        if index < 0 {
            return Ok(DeviceGuard { state: self, target: index, prev: -1, active: false });
        }
        self.ensure_initialized()?;
        let prev = self.check(self.driver().get_device())?;
        if prev != index {
            self.check(self.driver().set_device(index))?;
        }
        Ok(DeviceGuard { state: self, target: index, prev, active: true })
    }

    /// Enter a device scope matching where `obj` lives. A no-op scope when
    /// the object is not on a CUDA device.
    pub fn device_guard_of<T: DeviceResident>(&self, obj: &T) -> Result<DeviceGuard<'_>> {
        let index = match obj.device() {
            Device::Cuda(idx) => idx as i32,
            Device::Cpu => -1,
        };
        self.device_guard(index)
    }
}

impl DeviceGuard<'_> {
    /// The device index recorded at entry, if the scope is active.
    pub fn previous_index(&self) -> Option<i32> {
        self.active.then_some(self.prev)
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if !self.active || self.prev == self.target {
            return;
        }
        if let Err(err) = self.state.check(self.state.driver().set_device(self.prev)) {
            // Failing to restore the device global leaves the process with
            // corrupted placement state; continuing would misdirect every
            // subsequent kernel.
            error!(error = %err, prev = self.prev, "failed to restore previous CUDA device");
            std::process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::driver::fake::FakeDriver;

    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_cuda());
        assert!(Device::Cuda(0).is_cuda());
        assert_eq!(Device::Cuda(1).cuda_index(), Some(1));
        assert_eq!(Device::Cpu.cuda_index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Cpu), "cpu");
        assert_eq!(format!("{}", Device::Cuda(3)), "cuda:3");
    }

    #[test]
    fn test_sentinel_guard_touches_nothing() {
        let driver = Arc::new(FakeDriver::healthy());
        let state = RuntimeState::new(driver.clone());
        {
            let guard = state.device_guard(-1).unwrap();
            assert_eq!(guard.previous_index(), None);
        }
        assert!(driver.calls.lock().is_empty());
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_guard_switches_and_restores() {
        let driver = Arc::new(FakeDriver::healthy());
        let state = RuntimeState::new(driver.clone());
        {
            let guard = state.device_guard(1).unwrap();
            assert_eq!(guard.previous_index(), Some(0));
            assert_eq!(*driver.current_device.lock(), 1);
        }
        assert_eq!(*driver.current_device.lock(), 0);
    }

    #[test]
    fn test_guard_on_current_device_skips_set() {
        let driver = Arc::new(FakeDriver::healthy());
        let state = RuntimeState::new(driver.clone());
        state.ensure_initialized().unwrap();
        driver.calls.lock().clear();
        {
            let guard = state.device_guard(0).unwrap();
            assert_eq!(guard.previous_index(), Some(0));
        }
        assert_eq!(driver.call_count("set_device"), 0);
        assert_eq!(driver.call_count("get_device"), 1);
    }

    #[test]
    fn test_guard_restores_on_early_exit() {
        let driver = Arc::new(FakeDriver::healthy());
        let state = RuntimeState::new(driver.clone());

        fn bail(state: &RuntimeState) -> Result<()> {
            let _guard = state.device_guard(1)?;
            Err(crate::CudaError::NotReady)
        }
        assert!(bail(&state).is_err());
        assert_eq!(*driver.current_device.lock(), 0);
    }

    #[test]
    fn test_guard_of_resident_object() {
        struct Blob(Device);
        impl DeviceResident for Blob {
            fn device(&self) -> Device {
                self.0
            }
        }

        let driver = Arc::new(FakeDriver::healthy());
        let state = RuntimeState::new(driver.clone());

        {
            let _guard = state.device_guard_of(&Blob(Device::Cuda(1))).unwrap();
            assert_eq!(*driver.current_device.lock(), 1);
        }
        assert_eq!(*driver.current_device.lock(), 0);

        driver.calls.lock().clear();
        let _noop = state.device_guard_of(&Blob(Device::Cpu)).unwrap();
        assert!(driver.calls.lock().is_empty());
    }
}
