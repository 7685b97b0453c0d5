//! Routes inbound bus traffic to agent runs.
//!
//! Each session gets a lane: a FIFO of pending messages drained by one
//! worker task, so runs for a session happen one at a time in arrival order
//! while different sessions run concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use nimbot_core::error::BusError;
use nimbot_core::event::{InboundMessage, SessionKey};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::loop_runner::AgentLoop;

type Lanes = Arc<Mutex<HashMap<SessionKey, VecDeque<InboundMessage>>>>;

pub struct SessionRouter {
    agent: Arc<AgentLoop>,
    lanes: Lanes,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl SessionRouter {
    pub fn new(agent: Arc<AgentLoop>) -> Self {
        Self {
            agent,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn agent(&self) -> &Arc<AgentLoop> {
        &self.agent
    }

    /// Token whose cancellation aborts every in-flight and queued run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sessions with queued or running work.
    pub fn active_sessions(&self) -> usize {
        lock(&self.lanes).len()
    }

    /// Queue `msg` on its session lane, starting a worker if the lane was idle.
    pub fn dispatch(&self, msg: InboundMessage) {
        let key = msg.session_key.clone();
        let start_worker = {
            let mut lanes = lock(&self.lanes);
            match lanes.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(msg);
                    debug!(session = %key, queued = queue.len(), "Queued behind running session");
                    false
                }
                None => {
                    lanes.insert(key.clone(), VecDeque::from([msg]));
                    true
                }
            }
        };
        if start_worker {
            self.tracker.spawn(drain_lane(
                self.agent.clone(),
                self.lanes.clone(),
                key,
                self.cancel.child_token(),
            ));
        }
    }

    /// Consume the inbound topic until the bus closes or `stop` fires, then
    /// wait for every lane to drain.
    ///
    /// Stopping only refuses new messages; cancel [`Self::cancel_token`] to
    /// abort the runs still in flight.
    pub fn spawn(self, stop: CancellationToken) -> Result<JoinHandle<()>, BusError> {
        let mut inbound = self.agent.bus().subscribe_inbound(|_| true)?;
        Ok(tokio::spawn(async move {
            info!("Session router started");
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    next = inbound.recv() => match next {
                        Some(msg) => self.dispatch(msg),
                        None => break,
                    },
                }
            }
            drop(inbound);
            self.tracker.close();
            self.tracker.wait().await;
            info!("Session router stopped");
        }))
    }
}

async fn drain_lane(agent: Arc<AgentLoop>, lanes: Lanes, key: SessionKey, cancel: CancellationToken) {
    loop {
        let next = {
            let mut lanes = lock(&lanes);
            let Some(queue) = lanes.get_mut(&key) else {
                return;
            };
            match queue.pop_front() {
                Some(msg) => msg,
                None => {
                    lanes.remove(&key);
                    return;
                }
            }
        };
        agent.process(next, cancel.clone()).await;
    }
}

fn lock(lanes: &Lanes) -> MutexGuard<'_, HashMap<SessionKey, VecDeque<InboundMessage>>> {
    lanes.lock().unwrap_or_else(|e| e.into_inner())
}
