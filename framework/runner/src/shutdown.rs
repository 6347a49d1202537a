use squall_core::prelude::ShutdownHandle;
use tokio::signal;

/// Listen for Ctrl-C and turn it into a hard shutdown of the run.
pub(crate) fn start_shutdown_listener(runtime: &tokio::runtime::Runtime) -> ShutdownHandle {
    let handle = ShutdownHandle::new();

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                if listener_handle.shutdown() {
                    println!("Received shutdown signal, shutting down...");
                }
            }
            Err(e) => log::error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    handle
}
