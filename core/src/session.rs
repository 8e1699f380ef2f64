//! Session controller
//!
//! Owns one control adapter and one or more data adapters, drives their
//! connection machines through establishment with bounded retry, runs the
//! control-message loop and the data-receive workers, and exposes the
//! application-facing send/receive surface.

use crate::adapter::{AdapterState, TransportAdapter};
use crate::config::{ConfigError, SessionConfig};
use crate::control::{ControlError, ControlMessage, PrivType, CONTROL_PAYLOAD_LIMIT};
use crate::protocol::{ProtocolCodec, PROTOCOL_HEADER_SIZE};
use crate::segment::{split, Reassembler, ReassembledPacket, SegmentError};
use crate::transaction::{
    ConnectionMachine, DiscoverOutcome, LinkMonitor, TransactionError, TransactionTimings,
};
use futures::future::join_all;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

const INBOUND_DEPTH: usize = 64;
const HANDOFF_DEPTH: usize = 16;
const ACK_DEPTH: usize = 64;
/// Opcode, adapter id, Priv sub-type and length fields around a Priv payload
const CONTROL_FRAME_OVERHEAD: usize = 9;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Starting => write!(f, "Starting"),
            SessionState::Ready => write!(f, "Ready"),
            SessionState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// A Priv control payload fanned out to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffNotice {
    pub adapter_id: u16,
    pub priv_type: PrivType,
    pub payload: Vec<u8>,
}

/// Errors for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is {0}, operation needs Idle")]
    NotIdle(SessionState),

    #[error("Session is {0}, operation needs Ready")]
    NotReady(SessionState),

    #[error("Session establishment exhausted after {attempts} attempts")]
    StartExhausted { attempts: u32 },

    #[error("Session needs at least one data adapter")]
    NoDataAdapter,

    #[error("No data adapter with id {0}")]
    UnknownAdapter(u16),

    #[error("Control frame of {len} bytes exceeds the control adapter MTU of {mtu}")]
    ControlFrameTooLarge { len: usize, mtu: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// The session controller
///
/// All methods take `&self`; concurrent send and receive are supported. The
/// active data adapter is written only by the controller itself and read
/// through an atomic index, so a switch never races an in-flight send.
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: SessionConfig,
    control: ConnectionMachine,
    data: Vec<ConnectionMachine>,
    receive_running: Vec<AtomicBool>,
    codec: ProtocolCodec,
    state: RwLock<SessionState>,
    active_data: AtomicUsize,
    /// Serializes adapter switches; the active index has a single writer
    switch_gate: tokio::sync::Mutex<()>,
    paused_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    inbound_tx: mpsc::Sender<ReassembledPacket>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<ReassembledPacket>>,
    handoff_tx: broadcast::Sender<HandoffNotice>,
    ack_tx: broadcast::Sender<u16>,
    disconnect_ack: Notify,
}

impl SessionController {
    /// Build a controller over one control adapter and the configured data
    /// adapters; the first data adapter starts as the active one.
    pub fn new(
        config: SessionConfig,
        control: Arc<dyn TransportAdapter>,
        data: Vec<Arc<dyn TransportAdapter>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        if data.is_empty() {
            return Err(SessionError::NoDataAdapter);
        }
        let timings = TransactionTimings::from(&config);
        let (paused_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
        let (handoff_tx, _) = broadcast::channel(HANDOFF_DEPTH);
        let (ack_tx, _) = broadcast::channel(ACK_DEPTH);
        let receive_running = data.iter().map(|_| AtomicBool::new(false)).collect();
        let data = data
            .into_iter()
            .map(|adapter| ConnectionMachine::new(adapter, timings))
            .collect();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                control: ConnectionMachine::new(control, timings),
                data,
                receive_running,
                codec: ProtocolCodec::new(),
                state: RwLock::new(SessionState::Idle),
                active_data: AtomicUsize::new(0),
                switch_gate: tokio::sync::Mutex::new(()),
                paused_tx,
                shutdown_tx,
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                handoff_tx,
                ack_tx,
                disconnect_ack: Notify::new(),
            }),
        })
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Id of the currently active data adapter
    pub fn active_adapter_id(&self) -> u16 {
        let index = self.inner.active_data.load(Ordering::SeqCst);
        self.inner.data[index].adapter().identity().adapter_id
    }

    /// Subscribe to Priv handoff payloads arriving on the control channel
    pub fn subscribe_handoffs(&self) -> broadcast::Receiver<HandoffNotice> {
        self.inner.handoff_tx.subscribe()
    }

    /// Subscribe to delivery acknowledgements from the peer
    ///
    /// Each value is the id of a packet the peer has received and delivered.
    /// Acks travel on the control channel and never appear in `receive`.
    pub fn subscribe_acks(&self) -> broadcast::Receiver<u16> {
        self.inner.ack_tx.subscribe()
    }

    /// Connection machine backing the control adapter, for observation
    pub fn control_machine(&self) -> &ConnectionMachine {
        &self.inner.control
    }

    /// Establish the session: control adapter first, then every data adapter
    ///
    /// The whole sequence is retried up to the configured bound with the
    /// configured delay between attempts; the delay is a timer, not a blocked
    /// thread, so transport callbacks keep flowing. After exhausting retries
    /// the failure is reported once and the session returns to Idle.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.inner
            .transition(SessionState::Idle, SessionState::Starting)
            .map_err(SessionError::NotIdle)?;

        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            info!(attempt, peer = %self.inner.config.peer_name, "establishing session");
            match self.inner.establish().await {
                Ok(monitor) => break Ok(monitor),
                Err(err) => {
                    warn!(attempt, %err, "establishment attempt failed");
                    if attempt >= self.inner.config.max_start_attempts {
                        break Err(SessionError::StartExhausted { attempts: attempt });
                    }
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                }
            }
        };

        match outcome {
            Ok(control_monitor) => {
                self.inner.shutdown_tx.send_replace(false);
                self.inner.paused_tx.send_replace(false);
                tokio::spawn(control_loop(self.inner.clone(), control_monitor));
                for index in 0..self.inner.data.len() {
                    self.inner.spawn_receive_loop(index);
                }
                *self.inner.state.write() = SessionState::Ready;
                info!("session ready");
                Ok(())
            }
            Err(err) => {
                *self.inner.state.write() = SessionState::Idle;
                Err(err)
            }
        }
    }

    /// Stop the session gracefully
    ///
    /// Sends Disconnect on the control channel and waits a bounded time for
    /// the peer's DisconnectAck before forcing teardown. Success means every
    /// adapter reported a clean teardown.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.inner
            .transition(SessionState::Ready, SessionState::Stopping)
            .map_err(SessionError::NotReady)?;

        let handshake = async {
            let request = ControlMessage::Disconnect {
                adapter_id: self.inner.control_id(),
            };
            self.inner.send_control(&request).await?;
            self.inner.disconnect_ack.notified().await;
            Ok::<(), SessionError>(())
        };
        match tokio::time::timeout(self.inner.config.disconnect_ack_wait, handshake).await {
            Ok(Ok(())) => debug!("disconnect acknowledged by peer"),
            Ok(Err(err)) => warn!(%err, "disconnect handshake failed, forcing teardown"),
            Err(_) => warn!("disconnect ack wait elapsed, forcing teardown"),
        }

        self.inner.shutdown_tx.send_replace(true);
        let results = self.inner.teardown_all().await;
        *self.inner.state.write() = SessionState::Idle;

        let mut first_failure = None;
        for result in results {
            if let Err(err) = result {
                warn!(%err, "adapter teardown failed");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            None => {
                info!("session stopped");
                Ok(())
            }
            Some(err) => Err(err.into()),
        }
    }

    /// Send one application payload over the active data adapter
    ///
    /// The payload is framed, serialized and segmented by the active
    /// adapter's MTU. A return value smaller than `payload.len()` means the
    /// send failed partway and must be treated as a failed send. Blocks
    /// while the peer has paused the data path with Sleep.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, SessionError> {
        let state = self.inner.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state));
        }
        self.inner.wait_resumed().await;
        self.inner.send_on_active(payload).await
    }

    /// Receive one application payload
    ///
    /// Blocks until a reassembled packet arrives, then copies up to
    /// `buf.len()` bytes. Returns `Ok(0)` once the session has torn down.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let mut rx = self.inner.inbound_rx.lock().await;
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return Ok(0);
            }
            let state = self.inner.state();
            if state != SessionState::Ready && state != SessionState::Stopping {
                return Err(SessionError::NotReady(state));
            }
            tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        let n = buf.len().min(packet.payload.len());
                        buf[..n].copy_from_slice(&packet.payload[..n]);
                        return Ok(n);
                    }
                    None => return Ok(0),
                },
                _ = shutdown.changed() => continue,
            }
        }
    }

    /// Switch the active data adapter
    ///
    /// Asks the peer to bring its counterpart up, then performs the local
    /// switch: the next adapter is connected and woken before the previous
    /// one is put to sleep, and the active index is republished last.
    pub async fn switch_adapter(&self, adapter_id: u16) -> Result<(), SessionError> {
        let state = self.inner.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state));
        }
        let index = self
            .inner
            .data_index(adapter_id)
            .ok_or(SessionError::UnknownAdapter(adapter_id))?;
        self.inner
            .send_control(&ControlMessage::Connect { adapter_id })
            .await?;
        self.inner.switch_to(index).await
    }

    /// Ask the peer to pause its data path
    pub async fn request_data_pause(&self) -> Result<(), SessionError> {
        self.inner
            .send_control(&ControlMessage::Sleep {
                adapter_id: self.active_adapter_id(),
            })
            .await
    }

    /// Ask the peer to resume its data path
    pub async fn request_data_resume(&self) -> Result<(), SessionError> {
        self.inner
            .send_control(&ControlMessage::Wakeup {
                adapter_id: self.active_adapter_id(),
            })
            .await
    }

    /// Send a typed handoff payload over the control channel
    pub async fn send_handoff(
        &self,
        adapter_id: u16,
        priv_type: PrivType,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        self.inner
            .send_control(&ControlMessage::Priv {
                adapter_id,
                priv_type,
                payload: payload.to_vec(),
            })
            .await
    }
}

impl Inner {
    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn transition(&self, from: SessionState, to: SessionState) -> Result<(), SessionState> {
        let mut state = self.state.write();
        if *state != from {
            return Err(*state);
        }
        debug!(from = %*state, to = %to, "session state");
        *state = to;
        Ok(())
    }

    fn control_id(&self) -> u16 {
        self.control.adapter().identity().adapter_id
    }

    fn data_index(&self, adapter_id: u16) -> Option<usize> {
        self.data
            .iter()
            .position(|machine| machine.adapter().identity().adapter_id == adapter_id)
    }

    async fn establish(self: &Arc<Self>) -> Result<LinkMonitor, SessionError> {
        let monitor = self.bring_up(&self.control).await?;
        for machine in &self.data {
            self.bring_up(machine).await?;
        }
        self.active_data.store(0, Ordering::SeqCst);
        Ok(monitor)
    }

    async fn bring_up(&self, machine: &ConnectionMachine) -> Result<LinkMonitor, SessionError> {
        match machine.discover(&self.config.peer_name).await? {
            DiscoverOutcome::Matched(_) => {}
            DiscoverOutcome::NotFound => {
                machine.mark_failed();
                return Err(TransactionError::PeerNotFound.into());
            }
        }
        Ok(machine.connect().await?)
    }

    async fn wait_resumed(&self) {
        let mut paused = self.paused_tx.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                break;
            }
        }
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), SessionError> {
        let bytes = message.encode()?;
        // Control frames go out as one chunk, so they must fit the control
        // adapter's MTU.
        let mtu = self.control.adapter().mtu();
        if bytes.len() > mtu {
            return Err(SessionError::ControlFrameTooLarge {
                len: bytes.len(),
                mtu,
            });
        }
        debug!(%message, "sending control message");
        self.control
            .adapter()
            .send_chunk(&bytes)
            .await
            .map_err(TransactionError::from)?;
        Ok(())
    }

    async fn send_on_active(&self, payload: &[u8]) -> Result<usize, SessionError> {
        let index = self.active_data.load(Ordering::SeqCst);
        let adapter = self.data[index].adapter().clone();
        let packet = self.codec.frame(payload);
        let bytes = self.codec.serialize(&packet);
        let segments = split(&bytes, adapter.mtu())?;

        let mut wire_sent = 0usize;
        for segment in &segments {
            match adapter.send_chunk(segment.chunk).await {
                Ok(n) => wire_sent += n,
                Err(err) => {
                    warn!(%err, offset = segment.offset, "chunk send failed");
                    break;
                }
            }
        }
        // A short count tells the caller the whole send failed.
        Ok(wire_sent
            .saturating_sub(PROTOCOL_HEADER_SIZE)
            .min(payload.len()))
    }

    /// Bring the target data adapter up and make it active; the previous
    /// adapter goes to sleep only after the next link is live.
    async fn switch_to(self: &Arc<Self>, index: usize) -> Result<(), SessionError> {
        // A switch can come from the application or from a peer Connect on the
        // control channel. Serialize them so the previous link read below
        // matches the link actually left active.
        let _gate = self.switch_gate.lock().await;
        let prev = self.active_data.load(Ordering::SeqCst);
        if prev == index {
            return Ok(());
        }
        let next = &self.data[index];
        if next.state() != AdapterState::Connected {
            let _monitor = self.bring_up(next).await?;
        }
        next.adapter()
            .wake_link()
            .await
            .map_err(TransactionError::from)?;
        self.spawn_receive_loop(index);

        let previous = &self.data[prev];
        if previous.state() == AdapterState::Connected {
            if let Err(err) = previous.adapter().sleep_link().await {
                warn!(%err, "could not sleep previous adapter");
            }
        }
        self.active_data.store(index, Ordering::SeqCst);
        info!(
            from = %previous.adapter().identity(),
            to = %next.adapter().identity(),
            "active data adapter switched"
        );
        Ok(())
    }

    fn spawn_receive_loop(self: &Arc<Self>, index: usize) {
        if self.receive_running[index].swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(receive_loop(self.clone(), index));
    }

    async fn teardown_all(&self) -> Vec<Result<(), TransactionError>> {
        let mut teardowns = vec![self.control.disconnect()];
        for machine in &self.data {
            teardowns.push(machine.disconnect());
        }
        join_all(teardowns).await
    }

    async fn handle_control(self: &Arc<Self>, bytes: &[u8]) {
        let message = match ControlMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "discarding malformed control message");
                return;
            }
        };
        debug!(%message, "control message received");
        match message {
            ControlMessage::Connect { adapter_id } => match self.data_index(adapter_id) {
                Some(index) => {
                    if let Err(err) = self.switch_to(index).await {
                        warn!(adapter_id, %err, "peer-requested switch failed");
                    }
                }
                None => warn!(adapter_id, "peer requested unknown data adapter"),
            },
            ControlMessage::Sleep { .. } => {
                info!("data path paused by peer");
                self.paused_tx.send_replace(true);
            }
            ControlMessage::Wakeup { .. } => {
                info!("data path resumed by peer");
                self.paused_tx.send_replace(false);
            }
            ControlMessage::Disconnect { adapter_id } => {
                // Acknowledge before tearing down so the peer can finalize.
                let ack = ControlMessage::DisconnectAck { adapter_id };
                if let Err(err) = self.send_control(&ack).await {
                    warn!(%err, "could not acknowledge disconnect");
                }
                info!("peer requested disconnect, tearing down");
                *self.state.write() = SessionState::Stopping;
                self.shutdown_tx.send_replace(true);
                for result in self.teardown_all().await {
                    if let Err(err) = result {
                        warn!(%err, "adapter teardown failed");
                    }
                }
                *self.state.write() = SessionState::Idle;
            }
            ControlMessage::DisconnectAck { .. } => {
                self.disconnect_ack.notify_one();
            }
            ControlMessage::Priv {
                adapter_id,
                priv_type,
                payload,
            } => {
                if priv_type == PrivType::DeliveryAck {
                    match payload.as_slice() {
                        [hi, lo, ..] => {
                            let _ = self.ack_tx.send(u16::from_be_bytes([*hi, *lo]));
                        }
                        _ => warn!("delivery ack with short payload dropped"),
                    }
                } else {
                    let _ = self.handoff_tx.send(HandoffNotice {
                        adapter_id,
                        priv_type,
                        payload,
                    });
                }
            }
        }
    }

    /// Bounded reconnect of the control adapter after a dead link.
    async fn reconnect_control(self: &Arc<Self>) -> Option<LinkMonitor> {
        for attempt in 1..=self.config.max_start_attempts {
            match self.bring_up(&self.control).await {
                Ok(monitor) => {
                    info!(attempt, "control link re-established");
                    return Some(monitor);
                }
                Err(err) => {
                    warn!(attempt, %err, "control reconnect failed");
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
        None
    }
}

/// Long-lived worker decoding control messages and watching the control link
async fn control_loop(inner: Arc<Inner>, mut monitor: LinkMonitor) {
    let mut buf = vec![0u8; CONTROL_PAYLOAD_LIMIT + CONTROL_FRAME_OVERHEAD];
    loop {
        let adapter = inner.control.adapter().clone();
        let link_down = tokio::select! {
            _ = monitor.wait_disconnected() => true,
            received = adapter.recv_chunk(&mut buf) => match received {
                Ok(0) => true,
                Ok(n) => {
                    inner.handle_control(&buf[..n]).await;
                    false
                }
                Err(err) => {
                    warn!(%err, "control receive failed");
                    true
                }
            },
        };
        if !link_down {
            continue;
        }
        if matches!(inner.state(), SessionState::Stopping | SessionState::Idle) {
            break;
        }
        warn!("control link down, attempting reconnect");
        match inner.reconnect_control().await {
            Some(next_monitor) => monitor = next_monitor,
            None => {
                error!("control link lost, session ends");
                inner.shutdown_tx.send_replace(true);
                *inner.state.write() = SessionState::Idle;
                break;
            }
        }
    }
    debug!("control loop ended");
}

/// Long-lived worker reassembling packets from one data adapter
///
/// Each delivered packet is acknowledged with a `DeliveryAck` private
/// control message carrying the packet id, so acks never mingle with
/// payload traffic. A reassembly error is fatal only to the packet in
/// flight.
async fn receive_loop(inner: Arc<Inner>, index: usize) {
    let adapter = inner.data[index].adapter().clone();
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; inner.config.receive_buffer_size];
    loop {
        let n = match adapter.recv_chunk(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(adapter = %adapter.identity(), %err, "data receive failed");
                break;
            }
        };
        match reassembler.push(&buf[..n]) {
            Ok(Some(packet)) => {
                debug!(
                    id = packet.header.id,
                    len = packet.header.len,
                    "packet reassembled"
                );
                let packet_id = packet.header.id;
                if inner.inbound_tx.send(packet).await.is_err() {
                    break;
                }
                if inner.config.auto_ack {
                    let ack = ControlMessage::Priv {
                        adapter_id: adapter.identity().adapter_id,
                        priv_type: PrivType::DeliveryAck,
                        payload: packet_id.to_be_bytes().to_vec(),
                    };
                    if let Err(err) = inner.send_control(&ack).await {
                        debug!(%err, "delivery ack send failed");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "packet discarded after reassembly failure");
            }
        }
    }
    inner.receive_running[index].store(false, Ordering::SeqCst);
    debug!(adapter = %adapter.identity(), "data receive loop ended");
}
