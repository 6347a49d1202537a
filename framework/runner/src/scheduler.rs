use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context;
use squall_core::prelude::{AbortSignal, DelegatedShutdownListener, ShutdownHandle};

use crate::config::Stage;

/// How long to wait for workers to notice a hard shutdown before leaving them behind.
const HARD_SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The piecewise-linear concurrency curve described by a list of stages.
#[derive(Debug, Clone)]
pub struct StagePlan {
    initial: u32,
    stages: Vec<Stage>,
}

impl StagePlan {
    pub fn new(initial: u32, stages: Vec<Stage>) -> Self {
        Self { initial, stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Saturates at [Duration::MAX] for stages that add up to more than that.
    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |total, s| total.saturating_add(s.duration))
    }

    /// Interpolated target concurrency at `elapsed`, or `None` once every stage has run.
    pub fn target_at(&self, elapsed: Duration) -> Option<f64> {
        let mut start = self.initial as f64;
        let mut stage_start = Duration::ZERO;

        for stage in &self.stages {
            let end = stage.target as f64;
            // A zero length stage is a jump to its target.
            if stage.duration.is_zero() {
                start = end;
                continue;
            }

            let stage_end = stage_start.saturating_add(stage.duration);
            if elapsed < stage_end {
                let t = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                return Some(start + (end - start) * t);
            }

            stage_start = stage_end;
            start = end;
        }

        None
    }

    /// Index of the stage that is running at `elapsed`. Zero length stages are never running.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut stage_end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            stage_end = stage_end.saturating_add(stage.duration);
            if elapsed < stage_end {
                return Some(index);
            }
        }

        None
    }

    /// Whole number of workers that should be active at `elapsed`.
    pub fn workers_at(&self, elapsed: Duration) -> Option<usize> {
        self.target_at(elapsed).map(|t| t.round().max(0.0) as usize)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    AbortedByThreshold { reason: String },
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SchedulerReport {
    pub outcome: RunOutcome,
    pub peak_workers: usize,
    pub workers_started: usize,
    pub elapsed: Duration,
}

/// Handed to each worker so that it knows when to stop looping.
#[derive(Debug)]
pub struct WorkerToken {
    id: usize,
    retire: Arc<AtomicBool>,
    shutdown_listener: DelegatedShutdownListener,
}

impl WorkerToken {
    pub fn id(&self) -> usize {
        self.id
    }

    /// True once the scheduler has retired this worker or the run is shutting down. Checked
    /// between iterations, an iteration in progress is never interrupted by retirement.
    pub fn should_stop(&self) -> bool {
        self.retire.load(Ordering::Acquire) || self.shutdown_listener.should_shutdown()
    }

    pub fn shutdown_listener(&self) -> DelegatedShutdownListener {
        self.shutdown_listener.clone()
    }
}

struct WorkerSlot {
    id: usize,
    retire: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WorkerSlot {
    fn retire(&self) {
        self.retire.store(true, Ordering::Release);
    }

    fn join(self) {
        if self.handle.join().is_err() {
            log::error!("Worker {} panicked", self.id);
        }
    }
}

/// Drives the number of running workers along a [StagePlan].
///
/// On every tick the scheduler compares the workers it has running against the plan. Missing
/// workers are spawned, one thread each, unless the [AbortSignal] has been raised. Surplus workers
/// are retired newest first and stop after their current iteration. Once the plan is done, or the
/// run is aborted or interrupted, all workers are retired and given the grace period to finish
/// before the hard shutdown is broadcast.
pub struct StageScheduler {
    plan: StagePlan,
    tick: Duration,
    grace_period: Duration,
    abort: AbortSignal,
    shutdown: ShutdownHandle,
}

impl StageScheduler {
    pub fn new(
        plan: StagePlan,
        tick: Duration,
        grace_period: Duration,
        abort: AbortSignal,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            plan,
            tick,
            grace_period,
            abort,
            shutdown,
        }
    }

    pub fn run<F>(&self, worker_factory: F) -> anyhow::Result<SchedulerReport>
    where
        F: Fn(WorkerToken) + Send + Sync + 'static,
    {
        let factory = Arc::new(worker_factory);
        let started = Instant::now();
        let mut next_tick = started;

        let mut active: Vec<WorkerSlot> = Vec::new();
        let mut retiring: Vec<WorkerSlot> = Vec::new();
        let mut workers_started = 0;
        let mut peak_workers = 0;
        let mut last_target = None;
        let mut last_stage = None;
        let mut spawn_error = None;

        let outcome = 'schedule: loop {
            if self.shutdown.is_shutdown() {
                break RunOutcome::Interrupted;
            }
            if self.abort.is_aborted() {
                break RunOutcome::AbortedByThreshold {
                    reason: self.abort.reason().unwrap_or_default(),
                };
            }

            // Workers that exit on their own, for example after bailing, keep their slot until
            // they are retired so that they are not replaced straight away.
            reap(&mut retiring);

            let elapsed = started.elapsed();
            let Some(target) = self.plan.workers_at(elapsed) else {
                break RunOutcome::Completed;
            };
            let stage = self.plan.stage_at(elapsed);
            if stage != last_stage {
                if let Some(index) = stage {
                    let s = &self.plan.stages[index];
                    log::info!(
                        "Starting stage {} of {}: {} workers over {:?}",
                        index + 1,
                        self.plan.stages.len(),
                        s.target,
                        s.duration
                    );
                }
                last_stage = stage;
            }
            if last_target != Some(target) {
                log::debug!("Target concurrency is now {target}");
                last_target = Some(target);
            }

            while active.len() < target {
                if self.abort.is_aborted() {
                    continue 'schedule;
                }

                let token = WorkerToken {
                    id: workers_started,
                    retire: Arc::new(AtomicBool::new(false)),
                    shutdown_listener: self.shutdown.new_listener(),
                };
                let retire = token.retire.clone();
                let factory = factory.clone();

                match std::thread::Builder::new()
                    .name(format!("worker-{}", token.id))
                    .spawn(move || factory(token))
                {
                    Ok(handle) => {
                        log::trace!("Spawned worker {workers_started}");
                        active.push(WorkerSlot {
                            id: workers_started,
                            retire,
                            handle,
                        });
                        workers_started += 1;
                    }
                    Err(e) => {
                        spawn_error = Some(e);
                        break 'schedule RunOutcome::Interrupted;
                    }
                }
            }

            while active.len() > target {
                if let Some(slot) = active.pop() {
                    log::trace!("Retiring worker {}", slot.id);
                    slot.retire();
                    retiring.push(slot);
                }
            }

            peak_workers = peak_workers.max(active.len() + retiring.len());

            next_tick += self.tick;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        };

        log::info!("Stopping workers, outcome: {outcome:?}");
        retiring.append(&mut active);
        self.drain(retiring);

        if let Some(e) = spawn_error {
            return Err(e).context("Failed to spawn worker thread");
        }

        Ok(SchedulerReport {
            outcome,
            peak_workers,
            workers_started,
            elapsed: started.elapsed(),
        })
    }

    /// Let in-flight workers finish within the grace period, then force the rest to stop.
    fn drain(&self, mut workers: Vec<WorkerSlot>) {
        workers.iter().for_each(WorkerSlot::retire);

        let deadline = Instant::now() + self.grace_period;
        while !workers.is_empty() && Instant::now() < deadline {
            reap(&mut workers);
            std::thread::sleep(self.tick.min(Duration::from_millis(50)));
        }

        if workers.is_empty() {
            return;
        }

        log::warn!(
            "{} workers still running after the grace period, forcing shutdown",
            workers.len()
        );
        self.shutdown.shutdown();

        let deadline = Instant::now() + HARD_SHUTDOWN_JOIN_TIMEOUT;
        while !workers.is_empty() && Instant::now() < deadline {
            reap(&mut workers);
            std::thread::sleep(Duration::from_millis(10));
        }

        if !workers.is_empty() {
            log::error!("Leaving {} unresponsive workers behind", workers.len());
        }
    }
}

/// Join and remove every worker whose thread has exited.
fn reap(workers: &mut Vec<WorkerSlot>) {
    let mut i = 0;
    while i < workers.len() {
        if workers[i].handle.is_finished() {
            workers.swap_remove(i).join();
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn ramp_hold_ramp_down() {
        let plan = StagePlan::new(
            1,
            vec![
                Stage::new(secs(60), 10),
                Stage::new(secs(210), 10),
                Stage::new(secs(30), 0),
            ],
        );

        assert_eq!(plan.total_duration(), secs(300));
        assert_eq!(plan.target_at(Duration::ZERO), Some(1.0));
        assert_eq!(plan.target_at(secs(30)), Some(5.5));
        assert_eq!(plan.target_at(secs(60)), Some(10.0));
        assert_eq!(plan.target_at(secs(200)), Some(10.0));
        assert_eq!(plan.target_at(secs(285)), Some(5.0));
        assert_eq!(plan.target_at(secs(300)), None);
    }

    #[test]
    fn huge_stages_saturate() {
        let plan = StagePlan::new(
            0,
            vec![Stage::new(secs(u64::MAX), 10), Stage::new(secs(u64::MAX), 0)],
        );

        assert_eq!(plan.total_duration(), Duration::MAX);
        assert_eq!(plan.stage_at(secs(u64::MAX)), Some(1));
        assert_eq!(plan.target_at(Duration::ZERO), Some(0.0));
        assert!(plan.target_at(secs(u64::MAX)).is_some());
    }

    #[test]
    fn zero_duration_stage_jumps() {
        let plan = StagePlan::new(0, vec![Stage::new(Duration::ZERO, 8), Stage::new(secs(10), 8)]);
        assert_eq!(plan.target_at(Duration::ZERO), Some(8.0));
        assert_eq!(plan.target_at(secs(9)), Some(8.0));
    }

    #[test]
    fn stage_index_skips_zero_length_stages() {
        let plan = StagePlan::new(
            0,
            vec![
                Stage::new(secs(10), 5),
                Stage::new(Duration::ZERO, 1),
                Stage::new(secs(10), 1),
            ],
        );

        assert_eq!(plan.stage_at(secs(9)), Some(0));
        assert_eq!(plan.stage_at(secs(10)), Some(2));
        assert_eq!(plan.stage_at(secs(20)), None);
    }

    #[test]
    fn stage_boundaries_are_continuous() {
        let plan = StagePlan::new(
            0,
            vec![
                Stage::new(secs(10), 6),
                Stage::new(secs(5), 2),
                Stage::new(secs(7), 9),
            ],
        );

        for boundary in [secs(10), secs(15)] {
            let before = plan.target_at(boundary - Duration::from_millis(1)).unwrap();
            let at = plan.target_at(boundary).unwrap();
            assert!((before - at).abs() < 0.01, "gap at {boundary:?}");
        }
    }

    #[test]
    fn workers_stay_within_one_of_curve() {
        let plan = StagePlan::new(
            1,
            vec![
                Stage::new(secs(13), 17),
                Stage::new(secs(4), 17),
                Stage::new(secs(9), 3),
                Stage::new(Duration::ZERO, 12),
                Stage::new(secs(6), 0),
            ],
        );

        let mut elapsed = Duration::ZERO;
        while let Some(target) = plan.target_at(elapsed) {
            let workers = plan.workers_at(elapsed).unwrap() as f64;
            assert!((workers - target).abs() <= 1.0, "at {elapsed:?}");
            elapsed += Duration::from_millis(250);
        }
    }

    fn scheduler(stages: Vec<Stage>, abort: AbortSignal) -> StageScheduler {
        StageScheduler::new(
            StagePlan::new(0, stages),
            Duration::from_millis(10),
            Duration::from_secs(5),
            abort,
            ShutdownHandle::new(),
        )
    }

    #[test]
    fn run_reaches_target_and_completes() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let report = {
            let running = running.clone();
            let peak = peak.clone();
            scheduler(
                vec![
                    Stage::new(Duration::ZERO, 3),
                    Stage::new(Duration::from_millis(300), 3),
                ],
                AbortSignal::new(),
            )
            .run(move |token| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                while !token.should_stop() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.workers_started, 3);
        assert_eq!(report.peak_workers, 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_before_start_spawns_nothing() {
        let abort = AbortSignal::new();
        abort.abort("threshold [check_failure_rate rate<=0.05] breached");

        let spawned = Arc::new(AtomicUsize::new(0));
        let report = {
            let spawned = spawned.clone();
            scheduler(vec![Stage::new(Duration::from_secs(10), 5)], abort)
                .run(move |_| {
                    spawned.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        assert_eq!(spawned.load(Ordering::SeqCst), 0);
        assert_eq!(
            report.outcome,
            RunOutcome::AbortedByThreshold {
                reason: "threshold [check_failure_rate rate<=0.05] breached".to_string()
            }
        );
    }

    #[test]
    fn abort_lets_in_flight_iterations_finish() {
        let abort = AbortSignal::new();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let report = {
            let abort_from_worker = abort.clone();
            let started = started.clone();
            let finished = finished.clone();
            scheduler(
                vec![
                    Stage::new(Duration::ZERO, 2),
                    Stage::new(Duration::from_secs(30), 2),
                ],
                abort,
            )
            .run(move |token| {
                while !token.should_stop() {
                    started.fetch_add(1, Ordering::SeqCst);
                    abort_from_worker.abort("breach");
                    // An iteration that is still running when the abort lands.
                    std::thread::sleep(Duration::from_millis(100));
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            })
        }
        .unwrap();

        assert!(matches!(
            report.outcome,
            RunOutcome::AbortedByThreshold { .. }
        ));
        assert!(report.elapsed < Duration::from_secs(5));
        assert_eq!(
            started.load(Ordering::SeqCst),
            finished.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn ramp_down_retires_newest_workers_first() {
        let origin = Instant::now();
        let stopped = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let report = {
            let stopped = stopped.clone();
            scheduler(
                vec![
                    Stage::new(Duration::ZERO, 4),
                    Stage::new(Duration::from_millis(200), 4),
                    Stage::new(Duration::ZERO, 1),
                    Stage::new(Duration::from_millis(400), 1),
                ],
                AbortSignal::new(),
            )
            .run(move |token| {
                while !token.should_stop() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                stopped.lock().push((token.id(), origin.elapsed()));
            })
            .unwrap()
        };

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.workers_started, 4);
        assert_eq!(report.peak_workers, 4);

        let stopped = stopped.lock();
        assert_eq!(stopped.len(), 4);
        // The first worker survives the ramp down, everyone else left well before the end.
        for (id, at) in stopped.iter() {
            if *id != 0 {
                assert!(*at < Duration::from_millis(500), "worker {id} stopped at {at:?}");
            }
        }
    }

    #[test]
    fn grace_period_expiry_forces_shutdown() {
        let shutdown = ShutdownHandle::new();
        let scheduler = StageScheduler::new(
            StagePlan::new(0, vec![Stage::new(Duration::ZERO, 1), Stage::new(Duration::from_millis(50), 1)]),
            Duration::from_millis(10),
            Duration::from_millis(100),
            AbortSignal::new(),
            shutdown.clone(),
        );

        let report = scheduler
            .run(|token| {
                // Ignores retirement, only the hard shutdown gets it out.
                let listener = token.shutdown_listener();
                while !listener.should_shutdown() {
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(shutdown.is_shutdown());
    }
}
