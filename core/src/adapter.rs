//! Transport adapter contract for Selective Connection
//!
//! Defines the capability surface the session core consumes from concrete
//! radio bindings. The core never talks to a radio directly; pairing-based
//! links, peer-discovery links and plain sockets all plug in behind
//! [`TransportAdapter`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

/// Transport technologies an adapter can be backed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Classic short-range pairing link (e.g. RFCOMM)
    Bluetooth,
    /// Peer-to-peer wireless discovery link (e.g. Wi-Fi Direct)
    WifiDirect,
    /// Plain IP socket
    Tcp,
    /// In-process transport for testing
    Loopback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Bluetooth => write!(f, "Bluetooth"),
            TransportKind::WifiDirect => write!(f, "WifiDirect"),
            TransportKind::Tcp => write!(f, "Tcp"),
            TransportKind::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Role an adapter plays within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterRole {
    /// Carries session-management opcodes; exactly one per session
    Control,
    /// Carries framed application payload; one or more per session
    Data,
}

impl fmt::Display for AdapterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterRole::Control => write!(f, "control"),
            AdapterRole::Data => write!(f, "data"),
        }
    }
}

/// Identity tuple an adapter exposes to the session core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterIdentity {
    /// Logical name, used in logs and peer matching
    pub name: String,
    /// Short numeric id; also the id control messages address adapters by
    pub adapter_id: u16,
    /// Transport address (device address, host:port, ...)
    pub address: String,
    /// Transport service identifier (UUID, service name, ...)
    pub service_id: String,
    /// Backing transport technology
    pub kind: TransportKind,
    /// Control or data role
    pub role: AdapterRole,
}

impl fmt::Display for AdapterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} ({}, {})",
            self.name, self.adapter_id, self.kind, self.role
        )
    }
}

/// Lifecycle state of an adapter, driven by the connection machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    Idle,
    Discovering,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Idle => write!(f, "Idle"),
            AdapterState::Discovering => write!(f, "Discovering"),
            AdapterState::Connecting => write!(f, "Connecting"),
            AdapterState::Connected => write!(f, "Connected"),
            AdapterState::Disconnecting => write!(f, "Disconnecting"),
            AdapterState::Failed => write!(f, "Failed"),
        }
    }
}

/// Connection negotiation methods a peer can advertise
///
/// Modeled after WPS setup methods; the session supports push-button and
/// keypad negotiation, display-only peers cannot be connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationMethod {
    PushButton,
    Keypad,
    Display,
}

impl NegotiationMethod {
    /// Fixed priority order over supported methods; first match wins.
    pub const PRIORITY: [NegotiationMethod; 2] =
        [NegotiationMethod::PushButton, NegotiationMethod::Keypad];

    /// Pick the negotiation method for a peer's advertised set, or `None`
    /// when the peer offers nothing the session supports.
    pub fn select(advertised: &[NegotiationMethod]) -> Option<NegotiationMethod> {
        Self::PRIORITY
            .iter()
            .copied()
            .find(|method| advertised.contains(method))
    }
}

impl fmt::Display for NegotiationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationMethod::PushButton => write!(f, "PushButton"),
            NegotiationMethod::Keypad => write!(f, "Keypad"),
            NegotiationMethod::Display => write!(f, "Display"),
        }
    }
}

/// A peer reported by a discovery round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Name the peer advertises; matched case-sensitively against the target
    pub name: String,
    /// Transport-specific address of the peer
    pub address: String,
    /// Negotiation methods the peer advertises
    pub methods: Vec<NegotiationMethod>,
}

/// A matched peer, produced by Discover and consumed by Connect
///
/// At most one live descriptor exists per adapter; it is invalidated on
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// The peer as discovery reported it
    pub peer: PeerInfo,
    /// The target name it was matched against
    pub target_name: String,
}

/// Link-level state change reported by an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkEvent {
    /// Transport reports a connection to the named peer
    Connected { peer_name: String },
    /// Transport reports the link to the named peer went down
    Disconnected { peer_name: String },
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Connected { peer_name } => write!(f, "Connected {{ {} }}", peer_name),
            LinkEvent::Disconnected { peer_name } => write!(f, "Disconnected {{ {} }}", peer_name),
        }
    }
}

/// Errors surfaced by concrete transport bindings
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum AdapterError {
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Connection request failed: {0}")]
    ConnectFailed(String),

    #[error("Teardown failed: {0}")]
    TeardownFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Link not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    TransportIoError(String),
}

/// Capability contract every concrete transport implements
///
/// All completions are asynchronous and may resolve on arbitrary runtime
/// threads; callers must not assume the issuing task. Discovery results and
/// link state changes arrive as broadcast events, so a caller can subscribe
/// before issuing the request that will produce them.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Identity tuple of this adapter
    fn identity(&self) -> AdapterIdentity;

    /// Maximum chunk size a single `send_chunk` call accepts
    fn mtu(&self) -> usize;

    /// Stop any discovery session left over from a previous transaction
    async fn stop_discovery(&self) -> Result<(), AdapterError>;

    /// Start a discovery session; peers surface via `peers_changed`
    async fn start_discovery(&self) -> Result<(), AdapterError>;

    /// Notification stream fired when the visible peer set changes
    fn peers_changed(&self) -> broadcast::Receiver<()>;

    /// Snapshot of the currently visible peers
    async fn request_peers(&self) -> Result<Vec<PeerInfo>, AdapterError>;

    /// Link state change stream; subscribe before `request_connect`
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Issue the transport-level connect request; the outcome arrives as a
    /// `LinkEvent`, not as this future's resolution
    async fn request_connect(
        &self,
        peer: &PeerDescriptor,
        method: NegotiationMethod,
    ) -> Result<(), AdapterError>;

    /// Transport-level teardown; resolution is the transport's own outcome
    async fn teardown(&self) -> Result<(), AdapterError>;

    /// Pause the link without tearing it down
    async fn sleep_link(&self) -> Result<(), AdapterError>;

    /// Resume a paused link
    async fn wake_link(&self) -> Result<(), AdapterError>;

    /// Hand one MTU-bounded chunk to the transport; returns bytes accepted
    async fn send_chunk(&self, chunk: &[u8]) -> Result<usize, AdapterError>;

    /// Block until the transport delivers a chunk; returns bytes written
    /// into `buf`, or 0 when the link closed
    async fn recv_chunk(&self, buf: &mut [u8]) -> Result<usize, AdapterError>;
}
