use std::{fmt::Debug, sync::Arc};

use squall_core::prelude::{AbortSignal, DelegatedShutdownListener, ShutdownHandle};
use squall_instruments::{builtin, tags, MetricsCollector};

use crate::executor::Executor;

pub trait UserValuesConstraint: Default + Debug + Send + Sync + 'static {}

/// State that is shared by every worker in a run.
///
/// The setup hook gets mutable access to this context. After setup it is wrapped in an [Arc] and
/// is read-only for the rest of the run.
#[derive(Debug)]
pub struct RunnerContext<RV: UserValuesConstraint> {
    executor: Arc<Executor>,
    metrics: Arc<MetricsCollector>,
    abort: AbortSignal,
    shutdown_handle: ShutdownHandle,
    connection_string: Option<String>,
    value: RV,
}

impl<RV: UserValuesConstraint> RunnerContext<RV> {
    pub(crate) fn new(
        executor: Arc<Executor>,
        metrics: Arc<MetricsCollector>,
        abort: AbortSignal,
        shutdown_handle: ShutdownHandle,
        connection_string: Option<String>,
        value: RV,
    ) -> Self {
        Self {
            executor,
            metrics,
            abort,
            shutdown_handle,
            connection_string,
            value,
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    /// The base URL of the application under test, if one was given.
    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string.as_deref()
    }

    pub fn new_shutdown_listener(&self) -> DelegatedShutdownListener {
        self.shutdown_handle.new_listener()
    }

    /// Stop the run immediately, cancelling in-flight work. The outcome is reported as interrupted.
    pub fn force_stop_scenario(&self) {
        self.shutdown_handle.shutdown();
    }

    pub fn get_mut(&mut self) -> &mut RV {
        &mut self.value
    }

    pub fn get(&self) -> &RV {
        &self.value
    }
}

/// The context for a single worker, alive from its setup through to its teardown.
pub struct WorkerContext<RV: UserValuesConstraint, V: UserValuesConstraint> {
    worker_id: String,
    runner_context: Arc<RunnerContext<RV>>,
    shutdown_listener: DelegatedShutdownListener,
    value: V,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> WorkerContext<RV, V> {
    pub(crate) fn new(
        worker_id: String,
        runner_context: Arc<RunnerContext<RV>>,
        shutdown_listener: DelegatedShutdownListener,
    ) -> Self {
        Self {
            worker_id,
            runner_context,
            shutdown_listener,
            value: Default::default(),
        }
    }

    /// A unique identifier for this worker within the run, such as `worker-3`.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn runner_context(&self) -> &Arc<RunnerContext<RV>> {
        &self.runner_context
    }

    pub fn shutdown_listener(&mut self) -> &mut DelegatedShutdownListener {
        &mut self.shutdown_listener
    }

    /// Record the outcome of a business assertion.
    ///
    /// A failed check never stops the worker. It is counted in the `checks` and
    /// `check_failure_rate` metrics, both tagged with `check:<label>`. Returns `passed` so that the
    /// caller can branch on it.
    pub fn check(&self, label: &str, passed: bool) -> bool {
        let metrics = self.runner_context.metrics();
        let tags = tags([("check", label)]);

        metrics.add_rate(builtin::CHECKS, passed, &tags);
        metrics.add_rate(builtin::CHECK_FAILURE_RATE, !passed, &tags);

        if !passed {
            log::debug!("Check [{label}] failed for {}", self.worker_id);
        }

        passed
    }

    pub fn get_mut(&mut self) -> &mut V {
        &mut self.value
    }

    pub fn get(&self) -> &V {
        &self.value
    }
}
