//! The Lantern client: local store, Relay connection, and the services
//! built on top of it (C2–C10, spec §4).

pub mod connection;
pub mod control;
pub mod events;
pub mod messages;
pub mod presence;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::models::Profile;
use crate::store::Store;

pub use events::{EventBus, RelayConnectionState, TransferDirection, UiEvent};

/// Wires the store, connection manager, message service, and control loop
/// together. This is the composition root the `lantern-client` binary and
/// integration tests build against.
pub struct Client {
    pub store: Arc<Store>,
    pub transport: connection::RelayClientHandle,
    pub messages: messages::MessageService,
    pub events: EventBus,
    pub control: control::ControlHandle,
}

impl Client {
    pub async fn start(config: &Config) -> Result<(Self, tokio::sync::mpsc::UnboundedReceiver<UiEvent>), crate::error::StoreError> {
        let store = Arc::new(Store::open(&config.database_path)?);

        let now = messages::now_ms();
        let profile = match store.get_profile()? {
            Some(p) => p,
            None => {
                let generated = Profile::new_local("Anonymous", now);
                store.save_profile(&generated)?;
                generated
            }
        };

        let (events, events_rx) = EventBus::new();
        let (client_events_tx, client_events_rx) = tokio::sync::mpsc::unbounded_channel();

        let transport = connection::spawn(
            profile.clone(),
            connection::EndpointConfig {
                relay_url: config.relay_url.clone(),
                manual_endpoint: None,
                relay_port: config.relay_port,
            },
            client_events_tx,
        );

        let attachments_root: PathBuf = config.attachments_dir.clone();
        let messages = messages::MessageService::new(
            store.clone(),
            transport.clone(),
            events.clone(),
            profile.device_id.clone(),
            attachments_root.clone(),
        );

        let control = control::spawn(
            store.clone(),
            messages.clone(),
            transport.clone(),
            events.clone(),
            profile.device_id.clone(),
            attachments_root,
            client_events_rx,
        );

        Ok((
            Self {
                store,
                transport,
                messages,
                events,
                control,
            },
            events_rx,
        ))
    }
}
