//! Controller lifecycle management.
//!
//! Owns at most one running controller. `start` constructs and spawns,
//! `stop` cancels and waits for the background task to finish, so a restart
//! never has two controllers alive at once.
//!
//! ```text
//! Stopped ──start──▶ Starting ──spawned──▶ Running ──stop──▶ Stopping ──joined──▶ Stopped
//!    ▲                  │
//!    └──construct error─┘
//! ```

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};

use crate::config::RunConfig;
use crate::controller::{Controller, ControllerFactory};
use crate::dispatcher::NoticeReceiver;
use crate::error::{Error, Result};

/// Lifecycle state of the managed controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// A running controller, its cancellation token and its background task.
struct ControllerHandle {
    controller: Arc<dyn Controller>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Starts, stops and restarts the controller.
pub struct ControllerLifecycle {
    factory: Arc<dyn ControllerFactory>,
    config: Arc<RunConfig>,
    notices: NoticeReceiver,
    handle: Option<ControllerHandle>,
    state: LifecycleState,
    starts: u64,
}

impl ControllerLifecycle {
    pub fn new(
        factory: Arc<dyn ControllerFactory>,
        config: Arc<RunConfig>,
        notices: NoticeReceiver,
    ) -> Self {
        Self {
            factory,
            config,
            notices,
            handle: None,
            state: LifecycleState::Stopped,
            starts: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Number of successful starts.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    /// Construct a controller and run it on a background task.
    ///
    /// Fails if a controller is already running or construction fails.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::ControllerAlreadyRunning);
        }

        self.state = LifecycleState::Starting;
        let controller = match self.factory.construct(&self.config, self.notices.clone()) {
            Ok(controller) => controller,
            Err(e) => {
                self.state = LifecycleState::Stopped;
                error!(error = %e, "controller construction failed");
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            // notices are dispatched on this task; keep the run's span
            async move { controller.run(cancel).await }.in_current_span()
        });

        self.handle = Some(ControllerHandle {
            controller,
            cancel,
            task,
        });
        self.starts += 1;
        self.state = LifecycleState::Running;
        info!(start = self.starts, "controller started");
        Ok(())
    }

    /// Cancel the running controller and wait for its task to exit.
    /// A no-op when nothing is running.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        self.state = LifecycleState::Stopping;
        handle.cancel.cancel();
        let joined = handle.task.await;
        self.state = LifecycleState::Stopped;

        match joined {
            Ok(()) => {
                debug!("controller stopped");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "controller task did not exit cleanly");
                Err(Error::ControllerTask(e.to_string()))
            }
        }
    }

    /// Stop, then start a fresh controller.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await?;
        self.start()
    }

    /// Ask the running controller to drop one tunnel. Returns false when no
    /// controller is running.
    pub fn terminate_next_active_tunnel(&self) -> bool {
        match &self.handle {
            Some(handle) => {
                handle.controller.terminate_next_active_tunnel();
                true
            }
            None => false,
        }
    }
}
