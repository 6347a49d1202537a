use std::cmp::min;
use std::fmt::Write;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use squall_core::prelude::DelegatedShutdownListener;

/// Displays a progress bar while the stages are running to show the user how long is left.
pub(crate) fn start_progress(planned_runtime: Duration, shutdown_listener: DelegatedShutdownListener) {
    let spawned = std::thread::Builder::new()
        .name("progress".to_string())
        .spawn(move || {
            let start_time = Instant::now();
            let pb = ProgressBar::new(planned_runtime.as_secs());

            let planned = format_hms(planned_runtime);
            match ProgressStyle::with_template(
                "{spinner:.green} [{wide_bar:.cyan/blue}] [{elapsed_precise} / {planned_runtime}]",
            ) {
                Ok(style) => pb.set_style(
                    style
                        .with_key(
                            "planned_runtime",
                            move |_state: &ProgressState, w: &mut dyn Write| {
                                let _ = w.write_str(&planned);
                            },
                        )
                        .progress_chars("#>-"),
                ),
                Err(e) => log::debug!("Using the default progress style: {e}"),
            }

            loop {
                if shutdown_listener.should_shutdown() {
                    log::trace!("Progress thread shutting down");
                    pb.finish_and_clear();
                    break;
                }

                let new = min(start_time.elapsed().as_secs(), planned_runtime.as_secs());
                pb.set_position(new);
                std::thread::sleep(Duration::from_secs(1));
            }
        });

    if let Err(e) = spawned {
        log::warn!("Failed to start the progress bar: {e}");
    }
}

fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
