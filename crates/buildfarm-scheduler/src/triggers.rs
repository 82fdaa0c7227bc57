//! Wake-ups for the dispatch loops.

use buildfarm_core::QueueKind;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

/// One trigger per queue. A trigger fired while its loop is busy is kept
/// and consumed by the loop's next wait.
#[derive(Debug, Default)]
pub struct QueueTriggers {
    unclaimed: Notify,
    paused: Notify,
}

impl QueueTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, queue: QueueKind) -> &Notify {
        match queue {
            QueueKind::Unclaimed => &self.unclaimed,
            QueueKind::Paused => &self.paused,
        }
    }

    pub fn notify(&self, queue: QueueKind) {
        self.get(queue).notify_one();
    }

    /// Wake both queues, e.g. when a worker frees up.
    pub fn notify_all(&self) {
        self.notify(QueueKind::Unclaimed);
        self.notify(QueueKind::Paused);
    }

    pub fn notified(&self, queue: QueueKind) -> Notified<'_> {
        self.get(queue).notified()
    }
}
