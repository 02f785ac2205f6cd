//! Event bus (C9, spec §4.9): ordered delivery of a closed set of UI events.
//!
//! Delivery is ordered per emitter (§4.9); `transfer:progress` is never
//! coalesced. Modeled as a thin `mpsc` sink so the bus has no fan-out
//! semantics of its own — the UI adapter, which is out of scope here, owns
//! the receiving end (§9 "Event bus is a sink").

use tokio::sync::mpsc;

use crate::models::{DeviceId, Peer, ReactionEmoji};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayConnectionState {
    Idle,
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    PeersUpdated(Vec<Peer>),
    RelayConnection(RelayConnectionState),
    SyncStatus { peer_id: DeviceId, in_progress: bool },
    MessageReceived { conversation_id: String, message_id: String },
    MessageUpdated { conversation_id: String, message_id: String },
    MessageRemoved { conversation_id: String, message_id: String },
    ConversationCleared { conversation_id: String },
    MessageStatus { message_id: String, status: crate::models::MessageStatus },
    TypingUpdate { peer_id: DeviceId, is_typing: bool },
    UiToast { message: String },
    TransferProgress {
        direction: TransferDirection,
        file_id: String,
        message_id: String,
        peer_id: DeviceId,
        transferred: u64,
        total: u64,
    },
    Navigate { conversation_id: String },
    MessageReactions {
        message_id: String,
        reactions: Vec<(DeviceId, ReactionEmoji)>,
    },
    AnnouncementReactions {
        message_id: String,
        reactions: Vec<(DeviceId, ReactionEmoji)>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<UiEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: UiEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_received_in_emission_order() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(UiEvent::UiToast { message: "a".to_string() });
        bus.emit(UiEvent::UiToast { message: "b".to_string() });
        assert_eq!(rx.try_recv().unwrap(), UiEvent::UiToast { message: "a".to_string() });
        assert_eq!(rx.try_recv().unwrap(), UiEvent::UiToast { message: "b".to_string() });
    }
}
