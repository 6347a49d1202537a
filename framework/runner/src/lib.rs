mod cli;
mod config;
mod context;
mod definition;
mod executor;
mod init;
mod monitor;
mod progress;
mod run;
mod scheduler;
mod shutdown;
mod types;

pub mod prelude {
    pub use crate::cli::SquallScenarioCli;
    pub use crate::config::{
        parse_duration, ConfigError, RunConfigFile, RunSettings, ScenarioDefaults, Stage,
    };
    pub use crate::context::UserValuesConstraint;
    pub use crate::context::{RunnerContext, WorkerContext};
    pub use crate::definition::{HookResult, ScenarioDefinitionBuilder};
    pub use crate::executor::Executor;
    pub use crate::init::{init, init_logging};
    pub use crate::run::run;
    pub use crate::scheduler::{RunOutcome, SchedulerReport, StagePlan, StageScheduler, WorkerToken};
    pub use crate::types::SquallResult;

    pub use squall_core::prelude::*;
    pub use squall_instruments::{
        builtin, tags, Aggregation, MetricKind, MetricValues, MetricsCollector, Tags,
    };
    pub use squall_summary_model::{RunStatus, RunSummary};
}
