//! Relay client (C5, spec §4.5).
//!
//! A single cooperative state machine (`IDLE -> CONNECTING -> READY ->
//! CLOSED -> IDLE`) owns all mutable state — pending acks, ready waiters,
//! backoff, heartbeat — and is driven by one spawned task, matching the
//! inversion-of-dependencies redesign flag in spec §9: callers never touch
//! the socket directly, only the command/event channels exposed by
//! [`RelayClientHandle`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::discovery::{self, EndpointRegistry};
use crate::error::TransportError;
use crate::frame::{Envelope, Frame, FrameId, HelloPayload, PresenceDeltaPayload, PresenceSnapshotPayload};
use crate::models::{DeviceId, Profile};

const READY_TIMEOUT: Duration = Duration::from_secs(8);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const BACKOFF_INITIAL: Duration = Duration::from_millis(1200);
const BACKOFF_MAX: Duration = Duration::from_secs(10);
const PRESENCE_STALE: Duration = Duration::from_secs(25);
const PRESENCE_DEAD: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionState(Phase),
    Deliver(Frame),
    PresenceSnapshot(PresenceSnapshotPayload),
    PresenceDelta(PresenceDeltaPayload),
    AnnouncementSnapshot(crate::frame::AnnouncementSnapshotPayload),
    AnnouncementExpired(crate::frame::AnnouncementExpiredPayload),
}

type AckResult = Result<Vec<DeviceId>, TransportError>;

enum Command {
    SendFrame {
        frame: Frame,
        respond: oneshot::Sender<AckResult>,
    },
    WaitReady {
        respond: oneshot::Sender<Result<(), TransportError>>,
    },
    ObserveEndpoint {
        host: String,
        port: u16,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct RelayClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl RelayClientHandle {
    /// Public `sendFrame` API (§4.5): awaits READY (or times out), writes
    /// the frame, and resolves with the ack's `deliveredTo` list.
    pub async fn send_frame(&self, frame: Frame) -> AckResult {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::SendFrame { frame, respond })
            .map_err(|_| TransportError::ShuttingDown)?;
        rx.await.map_err(|_| TransportError::ShuttingDown)?
    }

    pub async fn wait_ready(&self) -> Result<(), TransportError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(Command::WaitReady { respond })
            .map_err(|_| TransportError::ShuttingDown)?;
        rx.await.map_err(|_| TransportError::ShuttingDown)?
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Feeds an mDNS browse observation into the connection manager's
    /// endpoint registry (§4.5 step 3). Fire-and-forget: a dropped manager
    /// task simply means discovery stops mattering.
    pub fn observe_endpoint(&self, host: String, port: u16) {
        let _ = self.commands.send(Command::ObserveEndpoint { host, port });
    }
}

struct DeferredSend {
    frame: Frame,
    deadline: Instant,
    respond: oneshot::Sender<AckResult>,
}

struct PendingAck {
    deadline: Instant,
    respond: oneshot::Sender<AckResult>,
}

struct ReadyWaiter {
    deadline: Instant,
    respond: oneshot::Sender<Result<(), TransportError>>,
}

pub struct EndpointConfig {
    pub relay_url: Option<String>,
    pub manual_endpoint: Option<String>,
    pub relay_port: u16,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Machine {
    phase: Phase,
    profile: Profile,
    endpoint_config: EndpointConfig,
    registry: EndpointRegistry,
    backoff: Duration,
    deferred: Vec<DeferredSend>,
    pending_acks: HashMap<FrameId, PendingAck>,
    ready_waiters: Vec<ReadyWaiter>,
    last_seen_at: Instant,
    last_beat: Instant,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// Spawns the connection manager task and returns the handle used to drive
/// it from the rest of the client.
pub fn spawn(
    profile: Profile,
    endpoint_config: EndpointConfig,
    events: mpsc::UnboundedSender<ClientEvent>,
) -> RelayClientHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(
        Machine {
            phase: Phase::Idle,
            profile,
            endpoint_config,
            registry: EndpointRegistry::new(),
            backoff: BACKOFF_INITIAL,
            deferred: Vec::new(),
            pending_acks: HashMap::new(),
            ready_waiters: Vec::new(),
            last_seen_at: Instant::now(),
            last_beat: Instant::now(),
            events,
        },
        commands_rx,
    ));
    RelayClientHandle { commands: commands_tx }
}

fn resolve_endpoint(machine: &Machine) -> (String, Option<(String, u16)>) {
    if let Some(url) = &machine.endpoint_config.relay_url {
        return (url.clone(), None);
    }
    if let Some(manual) = &machine.endpoint_config.manual_endpoint {
        return (manual.clone(), None);
    }
    if let Some(best) = machine.registry.best() {
        return (
            format!("ws://{}:{}", best.host, best.port),
            Some((best.host.clone(), best.port)),
        );
    }
    (format!("ws://127.0.0.1:{}", machine.endpoint_config.relay_port), None)
}

async fn run(mut machine: Machine, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut socket: Option<WsStream> = None;
    let mut reconnect_at = Instant::now();

    loop {
        // Reject anything past its deadline before doing more work.
        reap_deadlines(&mut machine);

        if socket.is_none() && machine.phase != Phase::Closed && Instant::now() >= reconnect_at {
            set_phase(&mut machine, Phase::Connecting);
            match connect_and_handshake(&mut machine).await {
                Ok(s) => {
                    socket = Some(s);
                    machine.backoff = BACKOFF_INITIAL;
                    machine.last_seen_at = Instant::now();
                    set_phase(&mut machine, Phase::Ready);
                    flush_deferred(&mut machine, socket.as_mut().unwrap()).await;
                    drain_ready_waiters(&mut machine, Ok(()));
                }
                Err(err) => {
                    warn!(%err, "relay connect failed, backing off");
                    reconnect_at = Instant::now() + machine.backoff;
                    machine.backoff = (machine.backoff * 2).min(BACKOFF_MAX);
                }
            }
        }

        let tick = tokio::time::sleep(Duration::from_millis(250));
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(Command::SendFrame { frame, respond }) => {
                        handle_send_frame(&mut machine, &mut socket, frame, respond).await;
                    }
                    Some(Command::WaitReady { respond }) => {
                        if machine.phase == Phase::Ready {
                            let _ = respond.send(Ok(()));
                        } else {
                            machine.ready_waiters.push(ReadyWaiter {
                                deadline: Instant::now() + READY_TIMEOUT,
                                respond,
                            });
                        }
                    }
                    Some(Command::ObserveEndpoint { host, port }) => {
                        observe_discovered(&mut machine.registry, host, port);
                    }
                    Some(Command::Shutdown) | None => {
                        reject_all(&mut machine, TransportError::ShuttingDown);
                        set_phase(&mut machine, Phase::Closed);
                        return;
                    }
                }
            }
            incoming = read_next(&mut socket), if socket.is_some() => {
                match incoming {
                    Some(Ok(envelope)) => {
                        machine.last_seen_at = Instant::now();
                        handle_envelope(&mut machine, envelope);
                    }
                    _ => {
                        warn!("relay connection lost");
                        socket = None;
                        reject_all(&mut machine, TransportError::ConnectionLost);
                        set_phase(&mut machine, Phase::Idle);
                        reconnect_at = Instant::now();
                    }
                }
            }
            _ = tick => {
                if machine.phase == Phase::Ready {
                    run_heartbeat(&mut machine, &mut socket).await;
                }
            }
        }
    }
}

fn reap_deadlines(machine: &mut Machine) {
    let now = Instant::now();
    let (expired, kept): (Vec<_>, Vec<_>) = machine.deferred.drain(..).partition(|d| now >= d.deadline);
    machine.deferred = kept;
    for d in expired {
        let _ = d.respond.send(Err(TransportError::ReadyTimeout));
    }

    let expired_acks: Vec<FrameId> = machine
        .pending_acks
        .iter()
        .filter(|(_, p)| now >= p.deadline)
        .map(|(id, _)| id.clone())
        .collect();
    for id in expired_acks {
        if let Some(p) = machine.pending_acks.remove(&id) {
            let _ = p.respond.send(Err(TransportError::AckTimeout));
        }
    }

    let (expired_waiters, kept_waiters): (Vec<_>, Vec<_>) =
        machine.ready_waiters.drain(..).partition(|w| now >= w.deadline);
    machine.ready_waiters = kept_waiters;
    for w in expired_waiters {
        let _ = w.respond.send(Err(TransportError::ReadyTimeout));
    }
}

fn reject_all(machine: &mut Machine, err_factory: TransportError) {
    for d in machine.deferred.drain(..) {
        let _ = d.respond.send(Err(clone_err(&err_factory)));
    }
    for (_, p) in machine.pending_acks.drain() {
        let _ = p.respond.send(Err(clone_err(&err_factory)));
    }
    for w in machine.ready_waiters.drain(..) {
        let _ = w.respond.send(Err(clone_err(&err_factory)));
    }
}

fn clone_err(err: &TransportError) -> TransportError {
    match err {
        TransportError::RelayOffline => TransportError::RelayOffline,
        TransportError::ReadyTimeout => TransportError::ReadyTimeout,
        TransportError::AckTimeout => TransportError::AckTimeout,
        TransportError::TargetUnreachable => TransportError::TargetUnreachable,
        TransportError::ConnectionLost => TransportError::ConnectionLost,
        TransportError::ShuttingDown => TransportError::ShuttingDown,
    }
}

fn drain_ready_waiters(machine: &mut Machine, result: Result<(), TransportError>) {
    for w in machine.ready_waiters.drain(..) {
        let _ = w.respond.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(clone_err(e)),
        });
    }
}

fn set_phase(machine: &mut Machine, phase: Phase) {
    machine.phase = phase;
    let _ = machine.events.send(ClientEvent::ConnectionState(phase));
}

async fn handle_send_frame(
    machine: &mut Machine,
    socket: &mut Option<WsStream>,
    frame: Frame,
    respond: oneshot::Sender<AckResult>,
) {
    if machine.phase == Phase::Ready {
        if let Some(s) = socket.as_mut() {
            if write_envelope(s, &Envelope::Send(frame.clone())).await.is_ok() {
                machine.pending_acks.insert(
                    frame.message_id.clone(),
                    PendingAck {
                        deadline: Instant::now() + ACK_TIMEOUT,
                        respond,
                    },
                );
                return;
            }
        }
    }
    machine.deferred.push(DeferredSend {
        frame,
        deadline: Instant::now() + READY_TIMEOUT,
        respond,
    });
}

async fn flush_deferred(machine: &mut Machine, socket: &mut WsStream) {
    let deferred = std::mem::take(&mut machine.deferred);
    for d in deferred {
        if write_envelope(socket, &Envelope::Send(d.frame.clone())).await.is_ok() {
            machine.pending_acks.insert(
                d.frame.message_id.clone(),
                PendingAck {
                    deadline: Instant::now() + ACK_TIMEOUT,
                    respond: d.respond,
                },
            );
        } else {
            let _ = d.respond.send(Err(TransportError::ConnectionLost));
        }
    }
}

fn handle_envelope(machine: &mut Machine, envelope: Envelope) {
    match envelope {
        Envelope::SendAck(ack) => {
            if let Some(p) = machine.pending_acks.remove(&ack.frame_message_id) {
                let _ = p.respond.send(Ok(ack.delivered_to));
            }
        }
        Envelope::Deliver(frame) => {
            let _ = machine.events.send(ClientEvent::Deliver(frame));
        }
        Envelope::Presence(snapshot) => {
            let _ = machine.events.send(ClientEvent::PresenceSnapshot(snapshot));
        }
        Envelope::PresenceDelta(delta) => {
            let _ = machine.events.send(ClientEvent::PresenceDelta(delta));
        }
        Envelope::AnnouncementSnapshot(snapshot) => {
            let _ = machine.events.send(ClientEvent::AnnouncementSnapshot(snapshot));
        }
        Envelope::AnnouncementExpired(expired) => {
            let _ = machine.events.send(ClientEvent::AnnouncementExpired(expired));
        }
        Envelope::Pong | Envelope::HelloOk => {}
        Envelope::Error(err) => {
            debug!(code = ?err.code, message = %err.message, "relay:error");
        }
        _ => {}
    }
}

async fn run_heartbeat(machine: &mut Machine, socket: &mut Option<WsStream>) {
    let Some(s) = socket.as_mut() else { return };
    let idle = machine.last_seen_at.elapsed();
    if idle > PRESENCE_DEAD {
        warn!("relay heartbeat lost, terminating socket");
        *socket = None;
        reject_all(machine, TransportError::ConnectionLost);
        set_phase(machine, Phase::Idle);
        return;
    }
    if idle > PRESENCE_STALE {
        let _ = write_envelope(s, &Envelope::PresenceRequest).await;
    }
    if machine.last_beat.elapsed() >= HEARTBEAT_INTERVAL {
        let _ = write_envelope(s, &Envelope::Heartbeat).await;
        machine.last_beat = Instant::now();
    }
}

async fn connect_and_handshake(machine: &mut Machine) -> Result<WsStream, TransportError> {
    let (url, discovered) = resolve_endpoint(machine);
    let connect = tokio_tungstenite::connect_async(format!("{url}/ws"));
    let (mut stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| TransportError::ReadyTimeout)?
        .map_err(|_| TransportError::RelayOffline)?;

    write_envelope(
        &mut stream,
        &Envelope::Hello(HelloPayload {
            profile: machine.profile.clone(),
        }),
    )
    .await
    .map_err(|_| TransportError::RelayOffline)?;

    let ok = tokio::time::timeout(CONNECT_TIMEOUT, read_envelope(&mut stream))
        .await
        .map_err(|_| TransportError::ReadyTimeout)?;
    match ok {
        Some(Ok(Envelope::HelloOk)) => {
            info!("relay hello:ok");
            if let Some((host, port)) = discovered {
                machine.registry.mark_handshook(&host, port);
            }
            Ok(stream)
        }
        _ => Err(TransportError::RelayOffline),
    }
}

async fn write_envelope(socket: &mut WsStream, envelope: &Envelope) -> Result<(), ()> {
    let text = serde_json::to_string(envelope).map_err(|_| ())?;
    socket.send(WsMessage::Text(text.into())).await.map_err(|_| ())
}

async fn read_envelope(socket: &mut WsStream) -> Option<Result<Envelope, ()>> {
    loop {
        match socket.next().await? {
            Ok(WsMessage::Text(text)) => {
                return Some(serde_json::from_str(text.as_str()).map_err(|_| ()));
            }
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return Some(Err(())),
        }
    }
}

async fn read_next(socket: &mut Option<WsStream>) -> Option<Result<Envelope, ()>> {
    match socket.as_mut() {
        Some(s) => read_envelope(s).await,
        None => std::future::pending().await,
    }
}

/// Seeds the endpoint registry from an mDNS browse event (§4.5 step 3).
pub fn observe_discovered(registry: &mut EndpointRegistry, host: String, port: u16) {
    registry.observe(host, port);
    registry.prune_stale();
}

pub const DEFAULT_FALLBACK: &str = discovery::DEFAULT_FALLBACK;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_endpoint_is_localhost() {
        assert_eq!(DEFAULT_FALLBACK, "ws://127.0.0.1:43190");
    }
}
