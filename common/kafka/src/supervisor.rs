//! Background loop keeping a client joined to its consumer group.
//!
//! ```text
//! Idle -> Joining -> Active -> Rebalancing -> Active -> ... -> Stopped
//! ```
//!
//! Each pass through the loop runs one group session. Sessions end on
//! rebalance or on error and are simply joined again; only cancellation of
//! the supervisor's token reaches `Stopped`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::broker::{ConsumerGroup, GroupHandler, GroupSession, PartitionClaim};
use crate::claim::process_claim;
use crate::error::{ConsumeError, SessionError};
use crate::message::MessageHandler;
use crate::metrics_consts::{SESSIONS_STARTED, SESSION_ERRORS};
use crate::signal::{OnceSignal, ReadinessSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Joining,
    Active,
    Rebalancing,
    Stopped,
}

pub struct Supervisor {
    group: Arc<dyn ConsumerGroup>,
    cancel: CancellationToken,
    state: watch::Receiver<SupervisorState>,
    first_ready: OnceSignal,
    stopped: OnceSignal,
}

impl Supervisor {
    /// Spawns the rebalance loop on `tracker` and returns immediately.
    pub fn start(
        group: Arc<dyn ConsumerGroup>,
        topics: Vec<String>,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let (state_tx, state) = watch::channel(SupervisorState::Idle);
        let first_ready = OnceSignal::new();
        let stopped = OnceSignal::new();

        let session_handler = Arc::new(SessionHandler {
            handler,
            readiness: Mutex::new(ReadinessSignal::new()),
            first_ready: first_ready.clone(),
            state: state_tx,
        });

        tracker.spawn(run(
            group.clone(),
            topics,
            session_handler,
            cancel.clone(),
            StopGuard(stopped.clone()),
        ));

        Self {
            group,
            cancel,
            state,
            first_ready,
            stopped,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    pub fn group(&self) -> &Arc<dyn ConsumerGroup> {
        &self.group
    }

    /// Resolves once the first session became active, or fails if the loop
    /// stopped before that happened.
    ///
    /// Only the first readiness signal matters here: later ones belong to
    /// rebalances the caller never waits on.
    pub async fn wait_ready(&self) -> Result<(), ConsumeError> {
        tokio::select! {
            biased;
            _ = self.first_ready.wait() => Ok(()),
            _ = self.stopped.wait() => {
                if self.first_ready.is_fired() {
                    Ok(())
                } else {
                    Err(ConsumeError::Cancelled)
                }
            }
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn run(
    group: Arc<dyn ConsumerGroup>,
    topics: Vec<String>,
    session_handler: Arc<SessionHandler>,
    cancel: CancellationToken,
    _stop_guard: StopGuard,
) {
    let group_handler: Arc<dyn GroupHandler> = session_handler.clone();
    session_handler.set_state(SupervisorState::Joining);

    while !cancel.is_cancelled() {
        let result = group
            .consume(&topics, group_handler.clone(), cancel.clone())
            .await;

        if cancel.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => debug!("Consumer group session ended, rejoining"),
            Err(e) => {
                error!("Consumer error: {e}");
                metrics::counter!(SESSION_ERRORS).increment(1);
            }
        }

        session_handler.set_state(SupervisorState::Rebalancing);
        session_handler.renew_readiness();
        tokio::task::yield_now().await;
    }

    session_handler.set_state(SupervisorState::Stopped);
    info!("Consumer context cancelled, stopping consumption");
}

/// Marks the loop as stopped however its task ends.
struct StopGuard(OnceSignal);

impl Drop for StopGuard {
    fn drop(&mut self) {
        self.0.fire();
    }
}

struct SessionHandler {
    handler: Arc<dyn MessageHandler>,
    readiness: Mutex<ReadinessSignal>,
    first_ready: OnceSignal,
    state: watch::Sender<SupervisorState>,
}

impl SessionHandler {
    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }

    fn renew_readiness(&self) -> ReadinessSignal {
        let fresh = ReadinessSignal::new();
        *self.readiness.lock() = fresh.clone();
        fresh
    }
}

#[async_trait]
impl GroupHandler for SessionHandler {
    fn setup(&self, session: &dyn GroupSession) -> Result<(), SessionError> {
        let readiness = self.readiness.lock().clone();
        if readiness.fire() {
            info!(generation = session.generation(), "Consumer group session started");
            metrics::counter!(SESSIONS_STARTED).increment(1);
        }
        self.first_ready.fire();
        self.set_state(SupervisorState::Active);
        Ok(())
    }

    fn cleanup(&self, session: &dyn GroupSession) -> Result<(), SessionError> {
        debug!(generation = session.generation(), "Consumer group session ending");
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> Result<(), SessionError> {
        process_claim(self.handler.as_ref(), session.as_ref(), claim).await;
        Ok(())
    }
}
