use tokio::runtime::{self, Handle, Runtime};

use crate::common::StaterError;

/// A handle to the Tokio runtime background work is spawned on.
///
/// When created from within a Tokio runtime, that runtime is reused. Otherwise a small
/// multi-threaded runtime is created and owned by the executor, and torn down with it.
pub(crate) struct Executor {
    handle: Handle,
    owned: Option<Runtime>,
}

impl Executor {
    pub(crate) fn acquire(thread_name: &str) -> Result<Self, StaterError> {
        if let Ok(handle) = Handle::try_current() {
            return Ok(Executor {
                handle,
                owned: None,
            });
        }

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(thread_name)
            .enable_all()
            .build()
            .map_err(|e| StaterError::FailedToCreateRuntime(e.to_string()))?;

        Ok(Executor {
            handle: runtime.handle().clone(),
            owned: Some(runtime),
        })
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Some(runtime) = self.owned.take() {
            // don't wait on tasks that may be blocked on the network
            runtime.shutdown_background();
        }
    }
}
