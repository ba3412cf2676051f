use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::ScanStatus;

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanEventKind {
    Scheduled,
    Started,
    Progress,
    Completed,
}

/// A lifecycle transition together with the status right after it.
#[derive(Clone, Debug, Serialize)]
pub struct ScanEvent {
    pub kind: ScanEventKind,
    pub status: ScanStatus,
}

/// Fan-out of scan events. Subscribers that fall behind lose the oldest events.
#[derive(Clone)]
pub struct EventNotifier {
    sender: broadcast::Sender<ScanEvent>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, kind: ScanEventKind, status: ScanStatus) {
        // No subscribers is fine.
        let _ = self.sender.send(ScanEvent { kind, status });
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::{EventNotifier, ScanEventKind};
    use crate::state::{ScanState, ScanStatus};
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn lagging_subscriber_keeps_latest_events() {
        let notifier = EventNotifier::new(2);
        let mut rx = notifier.subscribe();
        for _ in 0..5 {
            notifier.emit(ScanEventKind::Progress, ScanStatus::default());
        }
        notifier.emit(ScanEventKind::Completed, ScanStatus::default());

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(_))));
        assert_eq!(rx.try_recv().unwrap().kind, ScanEventKind::Progress);
        let last = rx.try_recv().unwrap();
        assert_eq!(last.kind, ScanEventKind::Completed);
        assert_eq!(last.status.state, ScanState::NotScheduled);
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        let notifier = EventNotifier::default();
        notifier.emit(ScanEventKind::Started, ScanStatus::default());
    }
}
