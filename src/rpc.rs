//! The BTP RPC engine: socket registry, auth handshake, request/response
//! correlation and handler dispatch.
//!
//! Each socket lives in a slot addressed by an index that is never reused for
//! the lifetime of the engine. A server-accepted socket starts unauthenticated
//! and must complete the `auth` handshake within the auth timeout; a socket
//! the engine dials out on authenticates proactively. Outgoing requests are
//! correlated by a crypto-random 32-bit id and resolved by exactly one of
//! RESPONSE, ERROR or timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::oneshot;

use crate::btp::codec;
use crate::btp::protocol_data::{to_side_data, SideData};
use crate::btp::{
    BtpData, BtpError, BtpFulfill, BtpPacket, BtpPrepare, BtpReject, ProtocolData, PROTOCOL_AUTH,
    PROTOCOL_AUTH_TOKEN, PROTOCOL_AUTH_USERNAME,
};
use crate::config::Role;
use crate::errors::{IlpError, PluginError};
use crate::socket::BtpSocket;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(2000);

/// Dispatch target for inbound packets on authenticated sockets. The plugin
/// core implements this; returned protocol data goes back in the RESPONSE.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle_prepare(&self, prepare: BtpPrepare) -> Result<(), PluginError>;

    async fn handle_fulfill(&self, fulfill: BtpFulfill) -> Result<Vec<ProtocolData>, PluginError>;

    async fn handle_reject(&self, reject: BtpReject) -> Result<(), PluginError>;

    async fn handle_message(&self, parts: Vec<ProtocolData>)
        -> Result<Vec<ProtocolData>, PluginError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Unauth,
    Auth,
}

struct SocketSlot {
    socket: Arc<dyn BtpSocket>,
    state: SlotState,
}

type PendingSender = oneshot::Sender<Result<SideData, PluginError>>;

pub struct RpcConfig {
    pub role: Role,
    pub request_timeout: Duration,
    pub auth_timeout: Duration,
}

struct RpcInner {
    config: RpcConfig,
    slots: Mutex<HashMap<usize, SocketSlot>>,
    next_slot: AtomicUsize,
    pending: Mutex<HashMap<u32, PendingSender>>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    rng: SystemRandom,
}

#[derive(Clone)]
pub struct RpcEngine {
    inner: Arc<RpcInner>,
}

impl RpcEngine {
    pub fn new(config: RpcConfig) -> Self {
        RpcEngine {
            inner: Arc::new(RpcInner {
                config,
                slots: Mutex::new(HashMap::new()),
                next_slot: AtomicUsize::new(0),
                pending: Mutex::new(HashMap::new()),
                handler: RwLock::new(None),
                rng: SystemRandom::new(),
            }),
        }
    }

    /// Must be called before any socket is added.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn authenticated_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.state == SlotState::Auth)
            .count()
    }

    /// Registers a socket this engine dialed out on. The engine considers its
    /// own side authenticated immediately and opens with the `auth` message,
    /// awaiting the peer's RESPONSE.
    pub async fn add_client_socket(
        &self,
        socket: Arc<dyn BtpSocket>,
    ) -> Result<usize, PluginError> {
        let (username, token) = match &self.inner.config.role {
            Role::Client { username, token } => (username.clone(), token.clone()),
            Role::Server { .. } => {
                return Err(PluginError::InvalidFields(
                    "server-role engines do not dial out".to_string(),
                ))
            }
        };
        let index = self.insert_slot(socket.clone(), SlotState::Auth);
        self.spawn_reader(index, socket.clone());
        let auth = BtpData::Message(vec![
            ProtocolData::octet(PROTOCOL_AUTH, Vec::new()),
            ProtocolData::text(PROTOCOL_AUTH_USERNAME, &username),
            ProtocolData::text(PROTOCOL_AUTH_TOKEN, &token),
        ]);
        match self.call_on(vec![socket.clone()], auth).await {
            Ok(_) => {
                debug!("socket {} authenticated with peer", index);
                Ok(index)
            }
            Err(err) => {
                error!("auth handshake on socket {} failed: {}", index, err);
                self.remove_slot(index);
                socket.close().await;
                Err(err)
            }
        }
    }

    /// Registers a server-accepted socket. It must authenticate within the
    /// auth timeout or it is closed.
    pub fn add_server_socket(&self, socket: Arc<dyn BtpSocket>) -> usize {
        let index = self.insert_slot(socket.clone(), SlotState::Unauth);
        self.spawn_reader(index, socket);
        let engine = self.clone();
        let auth_timeout = self.inner.config.auth_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(auth_timeout).await;
            let expired = {
                let slots = engine.inner.slots.lock();
                matches!(slots.get(&index), Some(slot) if slot.state == SlotState::Unauth)
            };
            if expired {
                error!("socket {} did not authenticate in time, closing", index);
                if let Some(slot) = engine.remove_slot(index) {
                    slot.socket.close().await;
                }
            }
        });
        index
    }

    /// Sends a request to every authenticated socket and awaits the first
    /// matching RESPONSE, an ERROR, or the request timeout.
    pub async fn call(&self, data: BtpData) -> Result<SideData, PluginError> {
        let targets: Vec<Arc<dyn BtpSocket>> = self
            .inner
            .slots
            .lock()
            .values()
            .filter(|slot| slot.state == SlotState::Auth)
            .map(|slot| slot.socket.clone())
            .collect();
        self.call_on(targets, data).await
    }

    async fn call_on(
        &self,
        targets: Vec<Arc<dyn BtpSocket>>,
        data: BtpData,
    ) -> Result<SideData, PluginError> {
        if targets.is_empty() {
            return Err(PluginError::Unreachable(
                "no authenticated socket to the peer".to_string(),
            ));
        }
        let request_id = self.next_request_id()?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, tx);

        let frame = codec::serialize(&BtpPacket { request_id, data });
        let sends = targets
            .iter()
            .map(|socket| socket.send(frame.clone()))
            .collect::<Vec<_>>();
        let delivered = join_all(sends)
            .await
            .into_iter()
            .filter(|result| result.is_ok())
            .count();
        if delivered == 0 {
            self.inner.pending.lock().remove(&request_id);
            return Err(PluginError::Unreachable(
                "could not deliver the request on any socket".to_string(),
            ));
        }
        trace!("request {} sent on {} socket(s)", request_id, delivered);

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(PluginError::RequestTimeout(
                    request_id,
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Closes every socket and resolves every in-flight request with a
    /// connection-closed error.
    pub async fn close_all(&self) {
        let slots: Vec<SocketSlot> = {
            let mut slots = self.inner.slots.lock();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.socket.close().await;
        }
        let pending: Vec<PendingSender> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, sender)| sender).collect()
        };
        for sender in pending {
            let _ = sender.send(Err(PluginError::ConnectionClosed));
        }
    }

    fn insert_slot(&self, socket: Arc<dyn BtpSocket>, state: SlotState) -> usize {
        let index = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        self.inner
            .slots
            .lock()
            .insert(index, SocketSlot { socket, state });
        index
    }

    fn remove_slot(&self, index: usize) -> Option<SocketSlot> {
        self.inner.slots.lock().remove(&index)
    }

    fn next_request_id(&self) -> Result<u32, PluginError> {
        loop {
            let mut buf = [0u8; 4];
            self.inner
                .rng
                .fill(&mut buf)
                .map_err(|_| PluginError::Unreachable("system rng failure".to_string()))?;
            let id = u32::from_be_bytes(buf);
            if !self.inner.pending.lock().contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn spawn_reader(&self, index: usize, socket: Arc<dyn BtpSocket>) {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = socket.recv().await {
                engine.handle_frame(index, &socket, &frame).await;
                // the frame handler may have closed this slot
                if !engine.inner.slots.lock().contains_key(&index) {
                    return;
                }
            }
            trace!("socket {} closed by peer", index);
            engine.remove_slot(index);
        });
    }

    async fn handle_frame(&self, index: usize, socket: &Arc<dyn BtpSocket>, frame: &[u8]) {
        let packet = match codec::deserialize(frame) {
            Ok(packet) => packet,
            Err(err) => {
                error!("malformed packet on socket {}: {}, closing", index, err);
                if let Some(slot) = self.remove_slot(index) {
                    slot.socket.close().await;
                }
                return;
            }
        };
        let state = match self.inner.slots.lock().get(&index) {
            Some(slot) => slot.state,
            None => return,
        };
        match state {
            SlotState::Unauth => self.handle_auth(index, socket, packet).await,
            SlotState::Auth => self.dispatch(socket, packet).await,
        }
    }

    /// First message on a server-accepted socket: MESSAGE with primary
    /// sub-protocol `auth` plus `auth_username` and `auth_token` text parts.
    async fn handle_auth(&self, index: usize, socket: &Arc<dyn BtpSocket>, packet: BtpPacket) {
        let auth_check = match &self.inner.config.role {
            Role::Server { auth_check } => auth_check.clone(),
            Role::Client { .. } => {
                error!("client-role engine got an unauthenticated inbound socket, closing");
                self.close_slot(index).await;
                return;
            }
        };
        let request_id = packet.request_id;
        let credentials = match parse_auth_message(&packet) {
            Ok(credentials) => credentials,
            Err(err) => {
                warn!("bad auth on socket {}: {}", index, err);
                self.send_error(socket, request_id, &err).await;
                self.close_slot(index).await;
                return;
            }
        };
        let (username, token) = credentials;
        if !auth_check(&username, &token) {
            warn!("auth check refused username {:?} on socket {}", username, index);
            let err = PluginError::NotAccepted("invalid auth credentials".to_string());
            self.send_error(socket, request_id, &err).await;
            self.close_slot(index).await;
            return;
        }
        if let Some(slot) = self.inner.slots.lock().get_mut(&index) {
            slot.state = SlotState::Auth;
        }
        debug!("socket {} authenticated as {:?}", index, username);
        self.send_packet(
            socket,
            BtpPacket {
                request_id,
                data: BtpData::Response(Vec::new()),
            },
        )
        .await;
    }

    async fn dispatch(&self, socket: &Arc<dyn BtpSocket>, packet: BtpPacket) {
        let request_id = packet.request_id;
        match packet.data {
            BtpData::Response(parts) => {
                self.resolve_pending(request_id, to_side_data(&parts));
            }
            BtpData::Error(err) => {
                self.resolve_pending(request_id, Err(PluginError::Peer(btp_error_to_ilp(err))));
            }
            BtpData::Prepare(prepare) => {
                let result = match self.handler() {
                    Some(handler) => handler.handle_prepare(prepare).await.map(|_| Vec::new()),
                    None => Err(no_handler()),
                };
                self.respond(socket, request_id, result).await;
            }
            BtpData::Fulfill(fulfill) => {
                let result = match self.handler() {
                    Some(handler) => handler.handle_fulfill(fulfill).await,
                    None => Err(no_handler()),
                };
                self.respond(socket, request_id, result).await;
            }
            BtpData::Reject(reject) => {
                let result = match self.handler() {
                    Some(handler) => handler.handle_reject(reject).await.map(|_| Vec::new()),
                    None => Err(no_handler()),
                };
                self.respond(socket, request_id, result).await;
            }
            BtpData::Message(parts) => {
                let result = match self.handler() {
                    Some(handler) => handler.handle_message(parts).await,
                    None => Err(no_handler()),
                };
                self.respond(socket, request_id, result).await;
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn MessageHandler>> {
        self.inner.handler.read().clone()
    }

    fn resolve_pending(&self, request_id: u32, result: Result<SideData, PluginError>) {
        match self.inner.pending.lock().remove(&request_id) {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                // a late or duplicate resolution after timeout or broadcast
                debug!("discarding response for unknown request {}", request_id);
            }
        }
    }

    async fn respond(
        &self,
        socket: &Arc<dyn BtpSocket>,
        request_id: u32,
        result: Result<Vec<ProtocolData>, PluginError>,
    ) {
        match result {
            Ok(parts) => {
                self.send_packet(
                    socket,
                    BtpPacket {
                        request_id,
                        data: BtpData::Response(parts),
                    },
                )
                .await;
            }
            Err(err) => {
                error!("handler failed for request {}: {}", request_id, err);
                self.send_error(socket, request_id, &err).await;
            }
        }
    }

    async fn send_error(&self, socket: &Arc<dyn BtpSocket>, request_id: u32, err: &PluginError) {
        let ilp = err.to_ilp();
        self.send_packet(
            socket,
            BtpPacket {
                request_id,
                data: BtpData::Error(BtpError {
                    code: ilp.code.clone(),
                    name: ilp.name.clone(),
                    triggered_at: ilp.triggered_at,
                    data: ilp.data.clone().into_bytes(),
                    protocol_data: Vec::new(),
                }),
            },
        )
        .await;
    }

    async fn send_packet(&self, socket: &Arc<dyn BtpSocket>, packet: BtpPacket) {
        if let Err(err) = socket.send(codec::serialize(&packet)).await {
            warn!("could not send packet: {}", err);
        }
    }

    async fn close_slot(&self, index: usize) {
        if let Some(slot) = self.remove_slot(index) {
            slot.socket.close().await;
        }
    }
}

fn no_handler() -> PluginError {
    PluginError::NotAccepted("no message handler registered".to_string())
}

fn btp_error_to_ilp(err: BtpError) -> IlpError {
    IlpError {
        code: err.code,
        name: err.name,
        triggered_at: err.triggered_at,
        data: String::from_utf8_lossy(&err.data).into_owned(),
    }
}

fn parse_auth_message(packet: &BtpPacket) -> Result<(String, String), PluginError> {
    let parts = match &packet.data {
        BtpData::Message(parts) => parts,
        other => {
            return Err(PluginError::InvalidFields(format!(
                "expected MESSAGE as the first packet, got {:?}",
                other.packet_type()
            )))
        }
    };
    let primary = parts
        .first()
        .ok_or_else(|| PluginError::InvalidFields("empty auth message".to_string()))?;
    if primary.name != PROTOCOL_AUTH {
        return Err(PluginError::InvalidFields(format!(
            "first sub-protocol must be {:?}, got {:?}",
            PROTOCOL_AUTH, primary.name
        )));
    }
    let text_part = |name: &str| -> Result<String, PluginError> {
        let part = parts.iter().find(|part| part.name == name).ok_or_else(|| {
            PluginError::InvalidFields(format!("auth message is missing {:?}", name))
        })?;
        String::from_utf8(part.data.clone())
            .map_err(|_| PluginError::InvalidFields(format!("{:?} is not valid UTF-8", name)))
    };
    Ok((
        text_part(PROTOCOL_AUTH_USERNAME)?,
        text_part(PROTOCOL_AUTH_TOKEN)?,
    ))
}
