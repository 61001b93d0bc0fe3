use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::{
    model::{ClipId, DocumentId, MarkerKind, OperationKind, TrackId},
    pipeline::SaveResult,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    New {
        user_created: bool,
    },
    Activated,
    Closed,
    DirtyChanged {
        dirty: bool,
    },
    BusyChanged {
        busy: bool,
        progress: Option<u8>,
    },
    Saved,
    Exported,
    OperationFailed {
        operation: OperationKind,
        result: SaveResult,
    },
    TrackAdded {
        track_id: TrackId,
        name: String,
    },
    TrackRemoved {
        track_id: TrackId,
        name: String,
    },
    TrackSelection {
        track_id: TrackId,
        selected: bool,
    },
    ClipAdded {
        track_id: TrackId,
        clip_id: ClipId,
    },
    ClipRemoved {
        track_id: TrackId,
        clip_id: ClipId,
    },
    ClipMoved {
        from_track: TrackId,
        to_track: TrackId,
        clip_id: ClipId,
        start: u64,
    },
    ClipSelection {
        track_id: TrackId,
        clip_id: ClipId,
        selected: bool,
    },
    MarkerAdded {
        name: String,
        kind: MarkerKind,
    },
    EncodeQueued {
        message: String,
    },
    EncodeFailed {
        message: String,
    },
}

impl EventKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::New { .. } => "new",
            Self::Activated => "activated",
            Self::Closed => "closed",
            Self::DirtyChanged { .. } => "dirty_changed",
            Self::BusyChanged { .. } => "busy_changed",
            Self::Saved => "saved",
            Self::Exported => "exported",
            Self::OperationFailed { .. } => "operation_failed",
            Self::TrackAdded { .. } => "track_added",
            Self::TrackRemoved { .. } => "track_removed",
            Self::TrackSelection { .. } => "track_selection",
            Self::ClipAdded { .. } => "clip_added",
            Self::ClipRemoved { .. } => "clip_removed",
            Self::ClipMoved { .. } => "clip_moved",
            Self::ClipSelection { .. } => "clip_selection",
            Self::MarkerAdded { .. } => "marker_added",
            Self::EncodeQueued { .. } => "encode_queued",
            Self::EncodeFailed { .. } => "encode_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub sequence: u64,
    pub document_id: DocumentId,
    /// Path of the document at emission time, empty if never persisted.
    pub path: String,
    pub kind: EventKind,
}

#[derive(Debug, Default)]
struct BusState {
    next_sequence: u64,
    subscribers: Vec<Sender<Event>>,
}

/// Ordered fan-out of document events to every subscriber.
#[derive(Debug, Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (sender, receiver) = unbounded();
        self.state.lock().subscribers.push(sender);
        receiver
    }

    pub fn publish(&self, document_id: DocumentId, path: impl Into<String>, kind: EventKind) -> u64 {
        let mut state = self.state.lock();
        state.next_sequence += 1;
        let event = Event {
            sequence: state.next_sequence,
            document_id,
            path: path.into(),
            kind,
        };
        trace!(
            sequence = event.sequence,
            document_id = %event.document_id,
            event = event.kind.name(),
            "event published"
        );
        state
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
        event.sequence
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_increase_and_reach_every_subscriber() {
        let bus = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();
        let document_id = DocumentId::new();

        bus.publish(document_id, "", EventKind::Activated);
        bus.publish(document_id, "/tmp/a.wlsx", EventKind::Saved);

        for receiver in [first, second] {
            let events: Vec<_> = receiver.try_iter().collect();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].sequence + 1, events[1].sequence);
            assert_eq!(events[1].path, "/tmp/a.wlsx");
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(DocumentId::new(), "", EventKind::Closed);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_iter().count(), 1);
    }
}
