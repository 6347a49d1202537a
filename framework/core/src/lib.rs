mod abort;
mod bail;
mod shutdown;

pub mod prelude {
    pub use crate::abort::AbortSignal;
    pub use crate::bail::WorkerBailError;
    pub use crate::shutdown::{DelegatedShutdownListener, ShutdownHandle, ShutdownSignalError};
}
