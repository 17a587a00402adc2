//! Scoped switching of the current-stream global.

use tracing::error;

use crate::driver::StreamHandle;
use crate::init::RuntimeState;
use crate::Result;

/// Scoped switch of the current execution stream.
///
/// Built with `None` the whole scope is a no-op. Otherwise the stream that
/// was current at entry is restored on drop, unconditionally.
#[derive(Debug)]
pub struct StreamGuard<'a> {
    state: &'a RuntimeState,
    prev: StreamHandle,
    active: bool,
}

impl RuntimeState {
    /// Enter a stream scope; all work submitted inside it targets `stream`.
    pub fn stream_guard(&self, stream: Option<StreamHandle>) -> Result<StreamGuard<'_>> {
        let Some(stream) = stream else {
            return Ok(StreamGuard { state: self, prev: StreamHandle::DEFAULT, active: false });
        };
        self.ensure_initialized()?;
        let prev = self.check(self.driver().get_stream())?;
        self.check(self.driver().set_stream(stream))?;
        Ok(StreamGuard { state: self, prev, active: true })
    }

    /// The currently selected stream.
    pub fn current_stream(&self) -> Result<StreamHandle> {
        self.ensure_initialized()?;
        self.check(self.driver().get_stream())
    }
}

impl StreamGuard<'_> {
    /// The stream recorded at entry, if the scope is active.
    pub fn previous_stream(&self) -> Option<StreamHandle> {
        self.active.then_some(self.prev)
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.state.check(self.state.driver().set_stream(self.prev)) {
            error!(error = %err, "failed to restore previous CUDA stream");
            std::process::abort();
        }
    }
}
