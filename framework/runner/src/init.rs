use crate::cli::SquallScenarioCli;
use clap::Parser;

/// Initialise logging for the squall runner.
///
/// Logging is configured through `RUST_LOG`, for example `RUST_LOG=info`.
pub fn init_logging() {
    env_logger::init();
}

/// Initialise the CLI and logging for the squall runner.
pub fn init() -> SquallScenarioCli {
    init_logging();

    SquallScenarioCli::parse()
}
