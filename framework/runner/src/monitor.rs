use squall_core::prelude::DelegatedShutdownListener;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Share of the machine's total CPU, in percent, above which the load generator may be slowing
/// down its own requests.
const HIGH_CPU_SHARE: f32 = 10.0;

/// Watch the CPU used by this process for the length of the run.
///
/// A warning is logged when the share of the machine crosses [HIGH_CPU_SHARE] and an info line when
/// it drops back, so a busy run does not repeat the warning every sample. Latencies measured while
/// the warning stands are suspect. The run itself is never stopped.
pub(crate) fn start_monitor(shutdown_listener: DelegatedShutdownListener) {
    let spawned = std::thread::Builder::new()
        .name("cpu-monitor".to_string())
        .spawn(move || {
            let pid = Pid::from_u32(std::process::id());
            let mut sys = System::new();

            sys.refresh_cpu_all();
            let cores = sys.cpus().len();
            let mut high = false;

            while !shutdown_listener.should_shutdown() {
                sys.refresh_processes_specifics(
                    ProcessesToUpdate::Some(&[pid]),
                    true,
                    ProcessRefreshKind::nothing().with_cpu(),
                );

                let Some(process) = sys.process(pid) else {
                    log::warn!("Cannot read CPU usage for process {pid}, CPU monitoring is off");
                    break;
                };

                let share = machine_share(process.cpu_usage(), cores);
                if share > HIGH_CPU_SHARE && !high {
                    log::warn!(
                        "Squall is using {share:.2}% of {cores} cores, measured latencies may include time spent waiting for CPU"
                    );
                } else if share <= HIGH_CPU_SHARE && high {
                    log::info!("Squall CPU usage is back down to {share:.2}% of {cores} cores");
                }
                high = share > HIGH_CPU_SHARE;

                std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
            }

            log::trace!("CPU monitor stopped");
        });

    if let Err(e) = spawned {
        log::warn!("Failed to start the CPU monitor: {e}");
    }
}

/// sysinfo reports process usage as a percentage of one core, turn it into a share of all cores.
fn machine_share(process_usage: f32, cores: usize) -> f32 {
    process_usage / cores.max(1) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_spread_over_every_core() {
        assert_eq!(machine_share(200.0, 8), 25.0);
        assert_eq!(machine_share(50.0, 1), 50.0);
        assert_eq!(machine_share(50.0, 0), 50.0);
        assert!(machine_share(70.0, 8) < HIGH_CPU_SHARE);
    }
}
