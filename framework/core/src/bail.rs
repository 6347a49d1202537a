/// Return this error from a worker's behaviour function to stop that worker for the rest of the run.
///
/// The worker's thread exits but it keeps its slot in the active set, so it still counts toward
/// the stage target and no replacement is spawned for it. The slot is released when the stage
/// curve retires it or the run drains.
#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct WorkerBailError {
    msg: String,
}

impl WorkerBailError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl Default for WorkerBailError {
    fn default() -> Self {
        Self::new("Worker is bailing")
    }
}
