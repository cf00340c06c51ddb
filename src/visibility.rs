use std::sync::Arc;

use tokio::sync::watch;

/// Document-visibility feed for embedders that have one.
///
/// The host flips this when its document hides or shows; headless
/// hosts simply never construct it. The poller subscribes once and
/// suspends `pause_when_hidden` subscriptions while hidden.
#[derive(Debug, Clone)]
pub struct VisibilitySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl VisibilitySignal {
    pub fn new(initially_visible: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_visible);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_visible(&self, visible: bool) {
        self.tx.send_replace(visible);
    }

    pub fn is_visible(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for VisibilitySignal {
    fn default() -> Self {
        Self::new(true)
    }
}
