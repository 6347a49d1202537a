use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use squall_instruments::{MetricError, Threshold, ThresholdError, ThresholdPolicy};

use crate::cli::SquallScenarioCli;

pub const DEFAULT_INITIAL_WORKERS: u32 = 1;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_EVALUATION_INTERVAL: Duration = Duration::from_secs(1);

/// Malformed stage or threshold input. The run never starts when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid duration [{0}], expected something like `30s`, `1m` or `3m30s`")]
    InvalidDuration(String),
    #[error("Invalid stage [{0}], expected `<duration>:<target>` such as `1m:10`")]
    InvalidStage(String),
    #[error("Invalid threshold [{0}], expected `<metric>=<expression>` such as `http_req_duration=p(95)<500`")]
    InvalidThresholdArg(String),
    #[error("No stages configured, at least one stage is required")]
    NoStages,
    #[error("The stages add up to more time than can be scheduled")]
    StagesTooLong,
    #[error("Setting [{name}] must be greater than zero")]
    ZeroSetting { name: &'static str },
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error("Failed to read run configuration from {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse run configuration")]
    Parse(#[from] toml::de::Error),
}

/// A time-bounded target concurrency.
///
/// The scheduler ramps linearly from the previous stage's target (or the initial worker count for
/// the first stage) to `target` over `duration`. A zero duration jumps straight to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u32,
}

impl Stage {
    pub fn new(duration: Duration, target: u32) -> Self {
        Self { duration, target }
    }
}

impl FromStr for Stage {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (duration, target) = s
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidStage(s.to_string()))?;
        let target = target
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidStage(s.to_string()))?;

        Ok(Stage::new(parse_duration(duration.trim())?, target))
    }
}

/// Parse a human readable duration such as `30s`, `1m` or `3m30s`.
///
/// Values too large for a [Duration] are rejected rather than wrapped.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(s.trim()).map_err(|e| {
        log::debug!("Rejected duration [{s}]: {e}");
        ConfigError::InvalidDuration(s.to_string())
    })
}

/// Split `selector=expression` as given on the command line.
pub fn parse_threshold_arg(s: &str) -> Result<(String, String), ConfigError> {
    s.split_once('=')
        .map(|(selector, expression)| (selector.trim().to_string(), expression.trim().to_string()))
        .filter(|(selector, expression)| !selector.is_empty() && !expression.is_empty())
        .ok_or_else(|| ConfigError::InvalidThresholdArg(s.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageEntry {
    target: u32,
    duration: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdEntry {
    metric: String,
    expression: String,
    #[serde(default)]
    abort: bool,
}

/// Run configuration as it is written in a TOML file.
///
/// ```toml
/// initial_workers = 1
/// grace_period = "30s"
///
/// [[stages]]
/// target = 10
/// duration = "1m"
///
/// [[thresholds]]
/// metric = "check_failure_rate"
/// expression = "rate<=0.05"
/// abort = true
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfigFile {
    initial_workers: Option<u32>,
    grace_period: Option<String>,
    tick: Option<String>,
    evaluation_interval: Option<String>,
    #[serde(default)]
    stages: Vec<StageEntry>,
    #[serde(default)]
    thresholds: Vec<ThresholdEntry>,
}

impl RunConfigFile {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }
}

/// Defaults that a scenario ships with, used when neither the CLI nor a config file says otherwise.
#[derive(Debug, Clone, Default)]
pub struct ScenarioDefaults {
    pub stages: Vec<Stage>,
    /// `(selector, expression, policy)`
    pub thresholds: Vec<(String, String, ThresholdPolicy)>,
}

/// Fully resolved, validated settings for a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub stages: Vec<Stage>,
    pub thresholds: Vec<Threshold>,
    pub initial_workers: u32,
    pub grace_period: Duration,
    pub tick: Duration,
    pub evaluation_interval: Duration,
}

impl RunSettings {
    /// Merge the sources in order of precedence: CLI, then config file, then scenario defaults.
    ///
    /// Stages come from the first source that defines any. Thresholds from every source apply.
    pub fn resolve(
        cli: &SquallScenarioCli,
        file: RunConfigFile,
        defaults: ScenarioDefaults,
    ) -> Result<Self, ConfigError> {
        let file_stages = file
            .stages
            .iter()
            .map(|s| Ok(Stage::new(parse_duration(&s.duration)?, s.target)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let stages = if !cli.stage.is_empty() {
            cli.stage.clone()
        } else if !file_stages.is_empty() {
            file_stages
        } else {
            defaults.stages
        };
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        stages
            .iter()
            .try_fold(Duration::ZERO, |total, stage| total.checked_add(stage.duration))
            .ok_or(ConfigError::StagesTooLong)?;

        let mut thresholds = defaults
            .thresholds
            .iter()
            .map(|(selector, expression, policy)| Threshold::parse(selector, expression, *policy))
            .collect::<Result<Vec<_>, _>>()?;
        for entry in &file.thresholds {
            let policy = if entry.abort {
                ThresholdPolicy::Abort
            } else {
                ThresholdPolicy::Advisory
            };
            thresholds.push(Threshold::parse(&entry.metric, &entry.expression, policy)?);
        }
        for (selector, expression) in &cli.threshold {
            thresholds.push(Threshold::parse(
                selector,
                expression,
                ThresholdPolicy::Advisory,
            )?);
        }
        for (selector, expression) in &cli.abort_threshold {
            thresholds.push(Threshold::parse(selector, expression, ThresholdPolicy::Abort)?);
        }

        let optional_duration = |value: &Option<String>| -> Result<Option<Duration>, ConfigError> {
            value.as_deref().map(parse_duration).transpose()
        };

        let grace_period = cli
            .grace_period
            .or(optional_duration(&file.grace_period)?)
            .unwrap_or(DEFAULT_GRACE_PERIOD);
        let tick = optional_duration(&file.tick)?.unwrap_or(DEFAULT_TICK);
        let evaluation_interval =
            optional_duration(&file.evaluation_interval)?.unwrap_or(DEFAULT_EVALUATION_INTERVAL);

        if tick.is_zero() {
            return Err(ConfigError::ZeroSetting { name: "tick" });
        }
        if evaluation_interval.is_zero() {
            return Err(ConfigError::ZeroSetting {
                name: "evaluation_interval",
            });
        }

        Ok(Self {
            stages,
            thresholds,
            initial_workers: cli
                .initial_workers
                .or(file.initial_workers)
                .unwrap_or(DEFAULT_INITIAL_WORKERS),
            grace_period,
            tick,
            evaluation_interval,
        })
    }
}
