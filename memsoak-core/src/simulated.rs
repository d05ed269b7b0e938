//! In-process stand-in for the tunnel controller.
//!
//! Honours the controller contract closely enough to rehearse a soak run
//! end to end: each instance establishes one tunnel after a delay, reports it
//! with `Tunnels` notices, re-establishes after a termination request, and
//! reports peak concurrency on shutdown. The factory keeps counters so
//! callers can check that instances never overlap.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::controller::{Controller, ControllerFactory};
use crate::dispatcher::NoticeReceiver;
use crate::error::{Error, Result};
use crate::notice::{Notice, PEAK_ESTABLISH_TUNNELS, PEAK_MEEK_ESTABLISH_TUNNELS};

/// Behaviour knobs for the simulated controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    /// Time from start (or termination) to an established tunnel, in ms
    #[serde(default = "default_establish_ms")]
    pub establish_ms: u64,

    /// Bytes retained forever on every establishment
    #[serde(default)]
    pub leak_bytes_per_tunnel: usize,

    /// Make every construction fail
    #[serde(default)]
    pub fail_construction: bool,
}

fn default_establish_ms() -> u64 {
    500
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            establish_ms: default_establish_ms(),
            leak_bytes_per_tunnel: 0,
            fail_construction: false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    constructed: AtomicU64,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    established: AtomicU64,
    terminations: AtomicU64,
}

/// Factory for [`SimulatedController`].
#[derive(Debug, Default)]
pub struct SimulatedControllerFactory {
    settings: SimulationSettings,
    counters: Arc<Counters>,
    leaked: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl SimulatedControllerFactory {
    pub fn new(settings: SimulationSettings) -> Self {
        Self {
            settings,
            counters: Arc::new(Counters::default()),
            leaked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Instances constructed so far.
    pub fn constructed(&self) -> u64 {
        self.counters.constructed.load(Ordering::Acquire)
    }

    /// Instances currently inside `run`.
    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::Acquire)
    }

    /// Most instances ever inside `run` at once.
    pub fn peak_live(&self) -> usize {
        self.counters.peak_live.load(Ordering::Acquire)
    }

    /// Tunnels established across all instances.
    pub fn established(&self) -> u64 {
        self.counters.established.load(Ordering::Acquire)
    }

    /// Terminations that actually dropped a tunnel.
    pub fn terminations(&self) -> u64 {
        self.counters.terminations.load(Ordering::Acquire)
    }
}

impl ControllerFactory for SimulatedControllerFactory {
    fn construct(&self, _config: &RunConfig, notices: NoticeReceiver) -> Result<Arc<dyn Controller>> {
        if self.settings.fail_construction {
            return Err(Error::construction("simulated construction failure"));
        }

        let id = self.counters.constructed.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Arc::new(SimulatedController {
            id,
            establish_delay: Duration::from_millis(self.settings.establish_ms),
            leak_bytes: self.settings.leak_bytes_per_tunnel,
            notices,
            counters: Arc::clone(&self.counters),
            leaked: Arc::clone(&self.leaked),
            active: AtomicBool::new(false),
            terminate: Notify::new(),
        }))
    }
}

/// One simulated controller instance. See the module docs.
pub struct SimulatedController {
    id: u64,
    establish_delay: Duration,
    leak_bytes: usize,
    notices: NoticeReceiver,
    counters: Arc<Counters>,
    leaked: Arc<Mutex<Vec<Vec<u8>>>>,
    active: AtomicBool,
    terminate: Notify,
}

impl SimulatedController {
    async fn emit(&self, notice: Notice) {
        match notice.to_bytes() {
            Ok(bytes) => {
                self.notices.receive(&bytes).await;
            }
            Err(e) => warn!(error = %e, "failed to encode notice"),
        }
    }

    fn leak(&self) {
        if self.leak_bytes == 0 {
            return;
        }
        // Touch every byte so the allocation is actually resident.
        let block = vec![0xA5u8; self.leak_bytes];
        if let Ok(mut leaked) = self.leaked.lock() {
            leaked.push(block);
        }
    }
}

#[async_trait]
impl Controller for SimulatedController {
    async fn run(&self, cancel: CancellationToken) {
        let live = self.counters.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::AcqRel);
        debug!(controller = self.id, "simulated controller running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.establish_delay) => {}
            }

            self.counters.established.fetch_add(1, Ordering::AcqRel);
            self.leak();
            self.active.store(true, Ordering::Release);
            self.emit(Notice::tunnels(1)).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.terminate.notified() => {
                    self.active.store(false, Ordering::Release);
                    self.counters.terminations.fetch_add(1, Ordering::AcqRel);
                    self.emit(Notice::tunnels(0)).await;
                }
            }
        }

        self.active.store(false, Ordering::Release);
        self.emit(Notice::info(format!("{}: 1", PEAK_ESTABLISH_TUNNELS)))
            .await;
        self.emit(Notice::info(format!("{}: 0", PEAK_MEEK_ESTABLISH_TUNNELS)))
            .await;

        self.counters.live.fetch_sub(1, Ordering::AcqRel);
        debug!(controller = self.id, "simulated controller exited");
    }

    fn terminate_next_active_tunnel(&self) {
        // No active tunnel, nothing to terminate.
        if self.active.load(Ordering::Acquire) {
            self.terminate.notify_one();
        }
    }
}
