use ipwatch_engine::notify::{ConflictEvent, ConflictNotifier, LogNotifier};
use tokio::sync::mpsc::UnboundedSender;

/// Logs every event and forwards it out of the capture thread to the async
/// side of the daemon.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: UnboundedSender<ConflictEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: UnboundedSender<ConflictEvent>) -> Self {
        Self { tx }
    }
}

impl ConflictNotifier for ChannelNotifier {
    fn notify(&self, event: ConflictEvent) {
        LogNotifier.notify(event.clone());
        if self.tx.send(event).is_err() {
            tracing::debug!("event pump is gone, dropping conflict event");
        }
    }
}
