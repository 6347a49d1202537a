use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{parse_duration, parse_threshold_arg, ConfigError, Stage};

#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None)]
pub struct SquallScenarioCli {
    /// Base URL of the application under test
    #[clap(short, long)]
    pub connection_string: Option<String>,

    /// Add a stage to the concurrency curve in the format `<duration>:<target>`. For example
    /// `--stage 1m:10 --stage 3m30s:10 --stage 30s:0` ramps up to 10 workers over a minute, holds
    /// for three and a half minutes and ramps back down over 30 seconds.
    ///
    /// Stages given here replace the stages from the config file and the scenario's defaults.
    #[clap(long, value_parser = parse_stage)]
    pub stage: Vec<Stage>,

    /// Add an advisory threshold in the format `<metric>=<expression>`, for example
    /// `--threshold 'http_req_duration{staticAsset:yes}=p(99)<250'`. A breach is reported but the
    /// run carries on.
    #[clap(long, value_parser = parse_threshold)]
    pub threshold: Vec<(String, String)>,

    /// Add a threshold that stops the run early when it is breached, in the same format as
    /// `--threshold`.
    #[clap(long, value_parser = parse_threshold)]
    pub abort_threshold: Vec<(String, String)>,

    /// Path to a TOML file with stages, thresholds and scheduler settings
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// The number of workers that the first stage ramps from
    #[clap(long)]
    pub initial_workers: Option<u32>,

    /// How long in-flight workers may keep running once the run is over or aborted, e.g. `30s`
    #[clap(long, value_parser = parse_grace_period)]
    pub grace_period: Option<Duration>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,

    /// Print the run summary as JSON to stdout once the run is over
    #[clap(long, default_value = "false")]
    pub json_summary: bool,
}

fn parse_stage(s: &str) -> Result<Stage, ConfigError> {
    s.parse()
}

fn parse_threshold(s: &str) -> Result<(String, String), ConfigError> {
    parse_threshold_arg(s)
}

fn parse_grace_period(s: &str) -> Result<Duration, ConfigError> {
    parse_duration(s)
}
