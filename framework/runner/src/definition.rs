use std::sync::Arc;

use squall_instruments::{MetricKind, ThresholdPolicy};

use crate::cli::SquallScenarioCli;
use crate::config::{ConfigError, RunConfigFile, RunSettings, ScenarioDefaults, Stage};
use crate::context::{RunnerContext, UserValuesConstraint, WorkerContext};
use crate::init::init;

pub type HookResult = anyhow::Result<()>;

pub type GlobalHookMut<RV> = fn(&mut RunnerContext<RV>) -> HookResult;
pub type GlobalHook<RV> = fn(Arc<RunnerContext<RV>>) -> HookResult;
pub type WorkerHookMut<RV, V> = fn(&mut WorkerContext<RV, V>) -> HookResult;

/// The builder for a scenario definition.
///
/// This must be used at the start of a scenario to define what each worker does and how the load
/// is shaped.
pub struct ScenarioDefinitionBuilder<RV: UserValuesConstraint, V: UserValuesConstraint> {
    /// The name of the scenario.
    ///
    /// Recommended value is `env!("CARGO_PKG_NAME")`.
    name: String,
    /// This value is initialised for you and you cannot change it.
    #[doc(hidden)]
    cli: SquallScenarioCli,
    /// Starting value for the shared runner context, handed to the setup hook.
    runner_value: RV,
    /// Global setup hook for this scenario. It will be run once, before any workers are started.
    /// An error from this hook stops the run before any load is generated.
    setup_fn: Option<GlobalHookMut<RV>>,
    /// Setup hook for a worker, which will be run once for each worker as it starts.
    setup_worker_fn: Option<WorkerHookMut<RV, V>>,
    /// The behaviour that each worker repeats until it is retired. One call is one iteration.
    worker_behaviour: Option<WorkerHookMut<RV, V>>,
    /// Teardown hook for a worker, run once when the worker stops. Errors are logged.
    teardown_worker_fn: Option<WorkerHookMut<RV, V>>,
    /// Global teardown hook, run once after every worker has stopped. Errors are logged.
    teardown_fn: Option<GlobalHook<RV>>,
    /// Stages and thresholds used when neither the CLI nor a config file provide them.
    defaults: ScenarioDefaults,
    /// Custom metrics that the scenario records on top of the built-in ones.
    metrics: Vec<(String, MetricKind)>,
}

pub struct ScenarioDefinition<RV: UserValuesConstraint, V: UserValuesConstraint> {
    pub name: String,
    pub connection_string: Option<String>,
    pub no_progress: bool,
    pub json_summary: bool,
    pub settings: RunSettings,
    pub metrics: Vec<(String, MetricKind)>,
    pub runner_value: RV,
    pub setup_fn: Option<GlobalHookMut<RV>>,
    pub setup_worker_fn: Option<WorkerHookMut<RV, V>>,
    pub worker_behaviour: Option<WorkerHookMut<RV, V>>,
    pub teardown_worker_fn: Option<WorkerHookMut<RV, V>>,
    pub teardown_fn: Option<GlobalHook<RV>>,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> ScenarioDefinitionBuilder<RV, V> {
    /// Initialise a new scenario definition from the scenario name and parsed command line.
    pub fn new(name: &str, cli: SquallScenarioCli) -> Self {
        Self {
            name: name.to_string(),
            cli,
            runner_value: Default::default(),
            setup_fn: None,
            setup_worker_fn: None,
            worker_behaviour: None,
            teardown_worker_fn: None,
            teardown_fn: None,
            defaults: ScenarioDefaults::default(),
            metrics: Vec::new(),
        }
    }

    /// Initialise logging, parse the command line and create the builder from it.
    pub fn new_with_init(name: &str) -> Self {
        Self::new(name, init())
    }

    /// Seed the runner context value, for example with settings the scenario parsed itself.
    pub fn with_runner_value(mut self, value: RV) -> Self {
        self.runner_value = value;
        self
    }

    /// Set the global setup hook for this scenario.
    pub fn use_setup(mut self, setup_fn: GlobalHookMut<RV>) -> Self {
        self.setup_fn = Some(setup_fn);
        self
    }

    /// Set the worker setup hook for this scenario.
    pub fn use_worker_setup(mut self, setup_worker_fn: WorkerHookMut<RV, V>) -> Self {
        self.setup_worker_fn = Some(setup_worker_fn);
        self
    }

    /// Set the behaviour that every worker runs in a loop.
    pub fn use_worker_behaviour(mut self, behaviour: WorkerHookMut<RV, V>) -> Self {
        self.worker_behaviour = Some(behaviour);
        self
    }

    /// Set the worker teardown hook for this scenario.
    pub fn use_worker_teardown(mut self, teardown_worker_fn: WorkerHookMut<RV, V>) -> Self {
        self.teardown_worker_fn = Some(teardown_worker_fn);
        self
    }

    /// Set the global teardown hook for this scenario.
    pub fn use_teardown(mut self, teardown_fn: GlobalHook<RV>) -> Self {
        self.teardown_fn = Some(teardown_fn);
        self
    }

    /// Stages to use when none are given on the command line or in a config file.
    pub fn with_default_stages(mut self, stages: Vec<Stage>) -> Self {
        self.defaults.stages = stages;
        self
    }

    /// Add a threshold that is reported on but never stops the run.
    pub fn with_threshold(mut self, selector: &str, expression: &str) -> Self {
        self.defaults.thresholds.push((
            selector.to_string(),
            expression.to_string(),
            ThresholdPolicy::Advisory,
        ));
        self
    }

    /// Add a threshold that aborts the run when it is breached.
    pub fn with_abort_threshold(mut self, selector: &str, expression: &str) -> Self {
        self.defaults.thresholds.push((
            selector.to_string(),
            expression.to_string(),
            ThresholdPolicy::Abort,
        ));
        self
    }

    /// Declare a custom metric so that samples for it are kept and thresholds can refer to it.
    pub fn use_metric(mut self, name: &str, kind: MetricKind) -> Self {
        self.metrics.push((name.to_string(), kind));
        self
    }

    pub(crate) fn build(self) -> Result<ScenarioDefinition<RV, V>, ConfigError> {
        let file = match &self.cli.config {
            Some(path) => RunConfigFile::load(path)?,
            None => RunConfigFile::default(),
        };
        let settings = RunSettings::resolve(&self.cli, file, self.defaults)?;

        Ok(ScenarioDefinition {
            name: self.name,
            connection_string: self.cli.connection_string,
            no_progress: self.cli.no_progress,
            json_summary: self.cli.json_summary,
            settings,
            metrics: self.metrics,
            runner_value: self.runner_value,
            setup_fn: self.setup_fn,
            setup_worker_fn: self.setup_worker_fn,
            worker_behaviour: self.worker_behaviour,
            teardown_worker_fn: self.teardown_worker_fn,
            teardown_fn: self.teardown_fn,
        })
    }
}
