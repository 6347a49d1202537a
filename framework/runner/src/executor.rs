use std::future::Future;

use squall_core::prelude::{ShutdownHandle, ShutdownSignalError};

/// Lets the synchronous hooks drive async code.
///
/// A single multi-threaded runtime serves setup, teardown and every worker thread. Each caller
/// blocks its own thread on the future it hands over.
#[derive(Debug)]
pub struct Executor {
    runtime: tokio::runtime::Runtime,
    shutdown_handle: ShutdownHandle,
}

impl Executor {
    pub(crate) fn new(runtime: tokio::runtime::Runtime, shutdown_handle: ShutdownHandle) -> Self {
        Self {
            runtime,
            shutdown_handle,
        }
    }

    /// Block the calling hook on `fut` and return its result.
    ///
    /// On a hard stop (Ctrl-C, or workers outliving the grace period) `fut` is dropped at its next
    /// await point and a [ShutdownSignalError] is returned instead. Work between await points is
    /// not interrupted.
    pub fn execute_in_place<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        let mut stop = self.shutdown_handle.new_listener();
        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = stop.wait_for_shutdown() => {
                    log::debug!("Hard stop requested, dropping in-flight hook work");
                    Err(anyhow::anyhow!(ShutdownSignalError::default()))
                },
                result = fut => result,
            }
        })
    }
}
