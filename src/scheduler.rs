//! Liveness scheduler driving [`RingNode::on_tick`] on a fixed period.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::debug;

use crate::core::{RingNetwork, RingNode};

/// Handle to the background probing task.
///
/// Ticks run one at a time on a single task; a tick that overruns its period
/// delays the next one instead of overlapping with it. The first tick fires
/// immediately.
pub struct LivenessScheduler {
    handle: JoinHandle<()>,
}

impl LivenessScheduler {
    pub fn spawn<N: RingNetwork>(node: Arc<RingNode<N>>, period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                node.on_tick().await;
            }
        });
        debug!(?period, "liveness scheduler started");
        Self { handle }
    }

    /// Cancel the timer. Safe to call more than once.
    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LivenessScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
