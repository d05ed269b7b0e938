//! Controller contract.
//!
//! The tunnel controller under test is external. A soak run only needs to
//! construct it, run it until cancelled, ask it to drop a tunnel, and receive
//! its notices. Implementations emit every notice through the
//! [`NoticeReceiver`] handed to [`ControllerFactory::construct`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::dispatcher::NoticeReceiver;
use crate::error::Result;

/// A running tunnel controller.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Run until `cancel` fires. Called once per instance, on a background
    /// task whose completion the lifecycle manager awaits.
    async fn run(&self, cancel: CancellationToken);

    /// Drop one active tunnel so the controller has to establish another.
    fn terminate_next_active_tunnel(&self);
}

/// Builds controllers from the run configuration.
pub trait ControllerFactory: Send + Sync {
    /// Construct a new controller. Errors are configuration errors and are
    /// not retried.
    fn construct(&self, config: &RunConfig, notices: NoticeReceiver) -> Result<Arc<dyn Controller>>;
}
