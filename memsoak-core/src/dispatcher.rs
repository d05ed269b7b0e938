//! Notice dispatch.
//!
//! The dispatcher runs on whatever context the controller emits notices
//! from. It never waits on the orchestration loop: the only things it
//! touches are the progress counter and two capacity-1 action slots, posted
//! to with `try_send`. A post while the slot is full is dropped, so a burst
//! of establishment notices coalesces into at most one pending action of
//! each kind.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver, Sender, error::TrySendError};
use tracing::{debug, info};

use crate::config::TestMode;
use crate::notice::{NoticeKind, classify, is_peak_concurrency_message};
use crate::progress::ProgressTracker;

/// Action requested of the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingAction {
    /// Terminate one active tunnel.
    Reconnect,
    /// Stop and start the controller.
    Restart,
}

impl PendingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAction::Reconnect => "reconnect",
            PendingAction::Restart => "restart",
        }
    }
}

/// Outcome of dispatching one notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// Malformed, unrecognised, or `Tunnels{count <= 0}`.
    Ignored,
    /// Diagnostic `Info` message shown to the operator.
    Surfaced,
    /// Action placed in its slot.
    Posted(PendingAction),
    /// Slot already full (or the loop is gone); request dropped.
    Dropped(PendingAction),
}

/// Loop-side ends of the action slots.
#[derive(Debug)]
pub struct ActionReceivers {
    pub reconnect: Receiver<()>,
    pub restart: Receiver<()>,
}

#[derive(Debug, Clone)]
struct ActionSlots {
    reconnect: Sender<()>,
    restart: Sender<()>,
}

impl ActionSlots {
    fn new() -> (Self, ActionReceivers) {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (restart_tx, restart_rx) = mpsc::channel(1);
        (
            Self {
                reconnect: reconnect_tx,
                restart: restart_tx,
            },
            ActionReceivers {
                reconnect: reconnect_rx,
                restart: restart_rx,
            },
        )
    }

    /// Non-blocking post. Returns false if the request was dropped.
    fn post(&self, action: PendingAction) -> bool {
        let slot = match action {
            PendingAction::Reconnect => &self.reconnect,
            PendingAction::Restart => &self.restart,
        };
        match slot.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            // Loop already gone; nothing left to act on the request.
            Err(TrySendError::Closed(())) => false,
        }
    }
}

type CoinFlip = Arc<dyn Fn() -> bool + Send + Sync>;

/// Classifies controller notices and turns establishments into actions.
pub struct EventDispatcher {
    mode: TestMode,
    settle_delay: Duration,
    tracker: Arc<ProgressTracker>,
    slots: ActionSlots,
    coin: CoinFlip,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("mode", &self.mode)
            .field("settle_delay", &self.settle_delay)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl EventDispatcher {
    /// Create a dispatcher and the receiving ends of its action slots.
    pub fn new(
        mode: TestMode,
        settle_delay: Duration,
        tracker: Arc<ProgressTracker>,
    ) -> (Self, ActionReceivers) {
        let (slots, receivers) = ActionSlots::new();
        let dispatcher = Self {
            mode,
            settle_delay,
            tracker,
            slots,
            coin: Arc::new(rand::random::<bool>),
        };
        (dispatcher, receivers)
    }

    /// Replace the coin used by `ReconnectAndRestart`. `true` means restart.
    pub fn with_coin(mut self, coin: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.coin = Arc::new(coin);
        self
    }

    /// Handle one raw notice.
    pub async fn dispatch(&self, raw: &[u8]) -> Dispatched {
        let Some(kind) = classify(raw) else {
            debug!(len = raw.len(), "dropping malformed notice");
            return Dispatched::Ignored;
        };

        match kind {
            NoticeKind::Tunnels { count } if count > 0 => self.on_established().await,
            NoticeKind::Tunnels { .. } => Dispatched::Ignored,
            NoticeKind::Info { message } if is_peak_concurrency_message(&message) => {
                info!(message = %message, "controller diagnostic");
                Dispatched::Surfaced
            }
            NoticeKind::Info { .. } | NoticeKind::Other(_) => Dispatched::Ignored,
        }
    }

    async fn on_established(&self) -> Dispatched {
        let established = self.tracker.increment();

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let action = self.choose_action();
        if self.slots.post(action) {
            debug!(established, action = action.as_str(), "posted action");
            Dispatched::Posted(action)
        } else {
            debug!(established, action = action.as_str(), "action already pending");
            Dispatched::Dropped(action)
        }
    }

    fn choose_action(&self) -> PendingAction {
        let restart = match self.mode {
            TestMode::ReconnectTunnel => false,
            TestMode::RestartController => true,
            TestMode::ReconnectAndRestart => (self.coin)(),
        };
        if restart {
            PendingAction::Restart
        } else {
            PendingAction::Reconnect
        }
    }
}

/// Handle given to each controller for emitting notices.
#[derive(Debug, Clone)]
pub struct NoticeReceiver {
    dispatcher: Arc<EventDispatcher>,
}

impl NoticeReceiver {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Deliver one encoded notice.
    pub async fn receive(&self, raw: &[u8]) -> Dispatched {
        self.dispatcher.dispatch(raw).await
    }
}
