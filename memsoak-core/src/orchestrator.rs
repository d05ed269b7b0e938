//! The soak run loop.
//!
//! A single task owns every decision. Each iteration services exactly one of:
//!
//! - the run deadline: stop, the run passed
//! - the sample tick: memory ceiling check, then progress check
//! - a pending reconnect: terminate the next active tunnel
//! - a pending restart: stop the controller, then start a new one
//!
//! The controller is stopped before `run` returns on every path, pass or
//! fail.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, error, info, info_span};

use crate::config::{RunConfig, TestMode};
use crate::controller::ControllerFactory;
use crate::dispatcher::{ActionReceivers, EventDispatcher, NoticeReceiver};
use crate::error::{Error, Result};
use crate::lifecycle::ControllerLifecycle;
use crate::memory::{MemoryProbe, MemorySample, format_byte_count};
use crate::progress::{ProgressTracker, StallDetector};

/// What one sample tick saw. Handed to the status observer.
#[derive(Debug, Clone, Copy)]
pub struct SampleStatus {
    pub tick: u64,
    pub tunnels_established: u64,
    pub sample: MemorySample,
}

/// Summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub mode: TestMode,
    pub tunnels_established: u64,
    pub reconnects: u64,
    pub restarts: u64,
    pub samples: u64,
    pub peak_system_memory: u64,
    pub last_cumulative_allocated: u64,
    pub elapsed: Duration,
}

impl RunReport {
    fn new(mode: TestMode) -> Self {
        Self {
            mode,
            tunnels_established: 0,
            reconnects: 0,
            restarts: 0,
            samples: 0,
            peak_system_memory: 0,
            last_cumulative_allocated: 0,
            elapsed: Duration::ZERO,
        }
    }
}

type StatusObserver = Box<dyn Fn(&SampleStatus) + Send + Sync>;

/// Drives a controller through reconnect/restart cycles and judges it.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    factory: Arc<dyn ControllerFactory>,
    probe: Arc<dyn MemoryProbe>,
    on_sample: Option<StatusObserver>,
}

impl Orchestrator {
    pub fn new(
        config: RunConfig,
        factory: Arc<dyn ControllerFactory>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            probe,
            on_sample: None,
        }
    }

    /// Called on every tick whose memory check passed, before the progress
    /// check.
    pub fn on_sample(mut self, observer: impl Fn(&SampleStatus) + Send + Sync + 'static) -> Self {
        self.on_sample = Some(Box::new(observer));
        self
    }

    /// Run until the configured duration elapses or a check fails.
    pub async fn run(&self) -> Result<RunReport> {
        let span = info_span!("soak_run", mode = %self.config.mode);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<RunReport> {
        self.config.validate()?;

        let started = Instant::now();
        let mut report = RunReport::new(self.config.mode);

        let tracker = Arc::new(ProgressTracker::new());
        let (dispatcher, mut actions) =
            EventDispatcher::new(self.config.mode, self.config.settle_delay(), tracker.clone());
        let mut lifecycle = ControllerLifecycle::new(
            Arc::clone(&self.factory),
            Arc::clone(&self.config),
            NoticeReceiver::new(Arc::new(dispatcher)),
        );

        info!(
            duration_secs = self.config.duration_secs,
            sample_interval_secs = self.config.sample_interval_secs,
            max_sys_memory = %format_byte_count(self.config.max_sys_memory),
            "starting soak run"
        );

        lifecycle.start()?;

        let outcome = self
            .drive(&mut lifecycle, &tracker, &mut actions, &mut report)
            .await;
        let stopped = lifecycle.stop().await;

        report.tunnels_established = tracker.snapshot();
        report.elapsed = started.elapsed();

        match outcome.and(stopped) {
            Ok(()) => {
                info!(
                    tunnels = report.tunnels_established,
                    reconnects = report.reconnects,
                    restarts = report.restarts,
                    peak_sys = %format_byte_count(report.peak_system_memory),
                    "soak run passed"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    cause = %e,
                    tunnels = report.tunnels_established,
                    samples = report.samples,
                    "soak run failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        lifecycle: &mut ControllerLifecycle,
        tracker: &ProgressTracker,
        actions: &mut ActionReceivers,
        report: &mut RunReport,
    ) -> Result<()> {
        let deadline = tokio::time::sleep(self.config.duration());
        tokio::pin!(deadline);

        let interval = self.config.sample_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut stall = StallDetector::new();

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("test duration elapsed");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    self.inspect(tracker, &mut stall, report)?;
                }

                Some(()) = actions.reconnect.recv() => {
                    lifecycle.terminate_next_active_tunnel();
                    report.reconnects += 1;
                }

                Some(()) = actions.restart.recv() => {
                    lifecycle.restart().await?;
                    report.restarts += 1;
                }
            }
        }
    }

    /// Sample-tick checks: memory ceiling first, then forward progress.
    fn inspect(
        &self,
        tracker: &ProgressTracker,
        stall: &mut StallDetector,
        report: &mut RunReport,
    ) -> Result<()> {
        let sample = self.probe.sample();
        report.samples += 1;
        report.peak_system_memory = report.peak_system_memory.max(sample.system_memory_in_use);
        report.last_cumulative_allocated = sample.cumulative_allocated;

        if sample.system_memory_in_use > self.config.max_sys_memory {
            return Err(Error::MemoryCeilingExceeded {
                sampled: sample.system_memory_in_use,
                limit: self.config.max_sys_memory,
            });
        }

        let established = tracker.snapshot();
        info!(
            tunnels = established,
            sys = %format_byte_count(sample.system_memory_in_use),
            total_alloc = %format_byte_count(sample.cumulative_allocated),
            "memory sample"
        );
        if let Some(observer) = &self.on_sample {
            observer(&SampleStatus {
                tick: report.samples,
                tunnels_established: established,
                sample,
            });
        }

        stall.observe(established)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::notice::Notice;
    use crate::simulated::{SimulatedControllerFactory, SimulationSettings};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    const MIB: u64 = 1024 * 1024;

    /// Replays scripted readings, repeating the last one.
    struct ScriptedProbe {
        readings: Mutex<VecDeque<u64>>,
        last: AtomicU64,
    }

    impl ScriptedProbe {
        fn new(readings: &[u64]) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings.iter().copied().collect()),
                last: AtomicU64::new(readings.last().copied().unwrap_or(0)),
            })
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn sample(&self) -> MemorySample {
            let next = self.readings.lock().unwrap().pop_front();
            let sys = next.unwrap_or_else(|| self.last.load(Ordering::SeqCst));
            MemorySample::new(sys, sys * 4)
        }
    }

    /// Emits a fixed burst of establishments, then idles until cancelled.
    struct BurstController {
        burst: usize,
        notices: NoticeReceiver,
    }

    #[async_trait]
    impl Controller for BurstController {
        async fn run(&self, cancel: CancellationToken) {
            for _ in 0..self.burst {
                let bytes = Notice::tunnels(1).to_bytes().unwrap();
                self.notices.receive(&bytes).await;
            }
            cancel.cancelled().await;
        }

        fn terminate_next_active_tunnel(&self) {}
    }

    struct BurstFactory(usize);

    impl ControllerFactory for BurstFactory {
        fn construct(
            &self,
            _config: &RunConfig,
            notices: NoticeReceiver,
        ) -> Result<Arc<dyn Controller>> {
            Ok(Arc::new(BurstController {
                burst: self.0,
                notices,
            }))
        }
    }

    fn config(mode: TestMode) -> RunConfig {
        RunConfig {
            mode,
            // not a multiple of the interval, so the deadline never ties a tick
            duration_secs: 65,
            sample_interval_secs: 10,
            settle_delay_ms: 250,
            max_sys_memory: 11 * MIB,
            ..RunConfig::default()
        }
    }

    fn simulated(establish_ms: u64) -> Arc<SimulatedControllerFactory> {
        Arc::new(SimulatedControllerFactory::new(SimulationSettings {
            establish_ms,
            ..SimulationSettings::default()
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_mode_passes() {
        let factory = simulated(100);
        let orchestrator =
            Orchestrator::new(config(TestMode::ReconnectTunnel), factory.clone(), ScriptedProbe::new(&[MIB]));

        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.samples, 6);
        assert!(report.reconnects > 0);
        assert_eq!(report.restarts, 0);
        assert_eq!(factory.constructed(), 1);
        assert_eq!(factory.live(), 0);
        assert!(report.tunnels_established > report.samples);
        assert_eq!(report.peak_system_memory, MIB);
        // stop may wait out one settle delay
        assert!(report.elapsed >= Duration::from_secs(65));
        assert!(report.elapsed < Duration::from_secs(66));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_mode_passes_without_overlap() {
        let factory = simulated(100);
        let orchestrator = Orchestrator::new(
            config(TestMode::RestartController),
            factory.clone(),
            ScriptedProbe::new(&[MIB]),
        );

        let report = orchestrator.run().await.unwrap();

        assert!(report.restarts > 0);
        assert_eq!(report.reconnects, 0);
        assert_eq!(factory.constructed(), report.restarts + 1);
        assert_eq!(factory.peak_live(), 1);
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_mode_does_both() {
        let factory = simulated(100);
        let mut config = config(TestMode::ReconnectAndRestart);
        config.duration_secs = 125;
        let orchestrator = Orchestrator::new(config, factory.clone(), ScriptedProbe::new(&[MIB]));

        let report = orchestrator.run().await.unwrap();

        assert!(report.reconnects > 0);
        assert!(report.restarts > 0);
        assert_eq!(factory.peak_live(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ceiling_fails_at_offending_tick() {
        let factory = simulated(100);
        let orchestrator = Orchestrator::new(
            config(TestMode::ReconnectTunnel),
            factory.clone(),
            ScriptedProbe::new(&[MIB, MIB, 12 * MIB]),
        );

        let started = Instant::now();
        let err = orchestrator.run().await.unwrap_err();

        match err {
            Error::MemoryCeilingExceeded { sampled, limit } => {
                assert_eq!(sampled, 12 * MIB);
                assert_eq!(limit, 11 * MIB);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_ceiling_on_first_tick() {
        let orchestrator = Orchestrator::new(
            config(TestMode::RestartController),
            simulated(100),
            ScriptedProbe::new(&[12 * MIB]),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("12582912"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_count_between_ticks_fails() {
        let orchestrator = Orchestrator::new(
            config(TestMode::ReconnectTunnel),
            Arc::new(BurstFactory(5)),
            ScriptedProbe::new(&[MIB]),
        );

        let started = Instant::now();
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(
            err,
            Error::ProgressStalled {
                previous: 5,
                current: 5
            }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_tunnel_before_first_tick_fails() {
        let factory = simulated(15_000);
        let orchestrator = Orchestrator::new(
            config(TestMode::ReconnectTunnel),
            factory.clone(),
            ScriptedProbe::new(&[MIB]),
        );

        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(
            err,
            Error::ProgressStalled {
                previous: 0,
                current: 0
            }
        ));
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn test_construction_failure_is_fatal() {
        let factory = Arc::new(SimulatedControllerFactory::new(SimulationSettings {
            fail_construction: true,
            ..SimulationSettings::default()
        }));
        let orchestrator = Orchestrator::new(
            config(TestMode::ReconnectTunnel),
            factory,
            ScriptedProbe::new(&[MIB]),
        );

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, Error::ControllerConstruction(_)));
        assert!(!err.is_fatal_check());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_start() {
        let factory = simulated(100);
        let mut config = config(TestMode::ReconnectTunnel);
        config.sample_interval_secs = 0;
        let orchestrator = Orchestrator::new(config, factory.clone(), ScriptedProbe::new(&[MIB]));

        assert!(matches!(
            orchestrator.run().await,
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(factory.constructed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_non_decreasing_counts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new(
            config(TestMode::ReconnectAndRestart),
            simulated(100),
            ScriptedProbe::new(&[MIB, 2 * MIB, 3 * MIB]),
        )
        .on_sample({
            let seen = Arc::clone(&seen);
            move |status| seen.lock().unwrap().push(*status)
        });

        let report = orchestrator.run().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|w| w[0].tunnels_established < w[1].tunnels_established));
        assert_eq!(seen[0].tick, 1);
        assert_eq!(seen[2].sample.system_memory_in_use, 3 * MIB);
        assert_eq!(report.peak_system_memory, 3 * MIB);
        assert_eq!(report.last_cumulative_allocated, 12 * MIB);
    }
}
