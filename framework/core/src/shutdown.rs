use std::sync::Arc;

use tokio::sync::watch::{Receiver, Sender};

/// Broadcasts the hard stop of a run.
///
/// Unlike an abort, which only stops new workers from being started, a shutdown cancels any work
/// that is waiting in [DelegatedShutdownListener::wait_for_shutdown]. The signal is level
/// triggered so that listeners created after the shutdown still observe it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(tokio::sync::watch::channel(false).0),
        }
    }

    /// Trigger the shutdown. Returns `true` if this call was the one that triggered it.
    pub fn shutdown(&self) -> bool {
        let triggered = self.sender.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });

        if triggered {
            log::debug!("Shutdown signal sent");
        }

        triggered
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn new_listener(&self) -> DelegatedShutdownListener {
        DelegatedShutdownListener::new(self.sender.subscribe())
    }
}

#[derive(Clone, Debug)]
pub struct DelegatedShutdownListener {
    receiver: Receiver<bool>,
}

impl DelegatedShutdownListener {
    pub(crate) fn new(receiver: Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// Point in time check if the shutdown signal has been received. If this returns true then work
    /// should be stopped so that the run can shut down.
    pub fn should_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for the shutdown signal to be received. It is safe to race this with another future so
    /// that the shutdown signal can be used to cancel other work in progress.
    pub async fn wait_for_shutdown(&mut self) {
        // A dropped sender means the run is gone, which is as good as a shutdown.
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct ShutdownSignalError {
    msg: String,
}

impl Default for ShutdownSignalError {
    fn default() -> Self {
        Self {
            msg: "Execution cancelled by shutdown signal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_listener_sees_shutdown() {
        let handle = ShutdownHandle::new();
        assert!(handle.shutdown());

        let listener = handle.new_listener();
        assert!(listener.should_shutdown());
    }

    #[test]
    fn shutdown_is_triggered_once() {
        let handle = ShutdownHandle::new();
        assert!(handle.shutdown());
        assert!(!handle.shutdown());
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn wait_for_shutdown_returns_after_signal() {
        let handle = ShutdownHandle::new();
        let mut listener = handle.new_listener();

        let waiter = tokio::spawn(async move {
            listener.wait_for_shutdown().await;
        });

        handle.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("listener did not observe shutdown")
            .expect("waiter panicked");
    }
}
