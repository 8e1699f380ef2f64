//! Connection transaction state machine
//!
//! Generic discover/connect/disconnect sequencing every concrete transport
//! goes through. Each transaction is a single async continuation with named
//! phases; completions from the transport arrive as awaited futures or
//! broadcast events, never on a thread the caller controls. Retry policy
//! lives entirely in the session controller — a failed step here resolves
//! the transaction and nothing more.

use crate::adapter::{
    AdapterError, AdapterState, LinkEvent, NegotiationMethod, PeerDescriptor, TransportAdapter,
};
use crate::config::SessionConfig;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Errors for connection transactions
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("Discovery already in progress")]
    DiscoveryInProgress,

    #[error("No matched peer: run Discover first")]
    PeerNotFound,

    #[error("Peer offers no supported negotiation method")]
    UnsupportedNegotiationMethod,

    #[error("Transaction timed out during {0}")]
    Timeout(&'static str),

    #[error("Transport teardown failure: {0}")]
    TeardownFailure(AdapterError),

    #[error("Notification channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Outcome of a Discover transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoverOutcome {
    /// A peer advertising the target name was found and stored
    Matched(PeerDescriptor),
    /// Discovery completed but no peer matched the target name
    NotFound,
}

/// Named phases of a Discover transaction, exposed for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverPhase {
    Idle,
    StoppingPriorDiscovery,
    AwaitingStart,
    Listening,
    PeersRequested,
    Matched,
    NotFound,
}

/// Timing bounds a machine applies to its transactions
#[derive(Debug, Clone, Copy)]
pub struct TransactionTimings {
    /// Settle time after stopping a prior discovery session
    pub settle_delay: Duration,
    /// Bound on one Discover transaction; `None` waits indefinitely
    pub discover_timeout: Option<Duration>,
    /// Bound on one Connect transaction; `None` waits indefinitely
    pub connect_timeout: Option<Duration>,
}

impl From<&SessionConfig> for TransactionTimings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            settle_delay: config.discovery_settle_delay,
            discover_timeout: config.discover_timeout,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// The retained link-state subscription after a successful Connect
///
/// Connect keeps its subscription alive past success so later disconnection
/// is observed; this type makes that observer an owned resource with a clear
/// unsubscription point — dropping the monitor drops the subscription.
#[derive(Debug)]
pub struct LinkMonitor {
    events: broadcast::Receiver<LinkEvent>,
    peer_name: String,
}

impl LinkMonitor {
    fn new(events: broadcast::Receiver<LinkEvent>, peer_name: String) -> Self {
        Self { events, peer_name }
    }

    /// Name of the peer this monitor watches
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Resolve once the transport reports the monitored link down
    pub async fn wait_disconnected(&mut self) -> Result<(), TransactionError> {
        loop {
            match self.events.recv().await {
                Ok(LinkEvent::Disconnected { peer_name }) if peer_name == self.peer_name => {
                    return Ok(())
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(TransactionError::ChannelClosed)
                }
            }
        }
    }
}

/// Drives one adapter through discover, connect and disconnect
///
/// Owns the adapter's lifecycle state and the matched peer descriptor. At
/// most one Discover runs at a time per machine; a concurrent caller is
/// rejected with [`TransactionError::DiscoveryInProgress`], never queued.
pub struct ConnectionMachine {
    adapter: Arc<dyn TransportAdapter>,
    state: RwLock<AdapterState>,
    discover_phase: RwLock<DiscoverPhase>,
    peer: Mutex<Option<PeerDescriptor>>,
    discover_gate: tokio::sync::Mutex<()>,
    timings: TransactionTimings,
}

impl ConnectionMachine {
    pub fn new(adapter: Arc<dyn TransportAdapter>, timings: TransactionTimings) -> Self {
        Self {
            adapter,
            state: RwLock::new(AdapterState::Idle),
            discover_phase: RwLock::new(DiscoverPhase::Idle),
            peer: Mutex::new(None),
            discover_gate: tokio::sync::Mutex::new(()),
            timings,
        }
    }

    /// The adapter this machine drives
    pub fn adapter(&self) -> &Arc<dyn TransportAdapter> {
        &self.adapter
    }

    /// Current adapter lifecycle state
    pub fn state(&self) -> AdapterState {
        *self.state.read()
    }

    /// Current Discover phase
    pub fn discover_phase(&self) -> DiscoverPhase {
        *self.discover_phase.read()
    }

    /// The live peer descriptor, if a Discover matched
    pub fn peer_descriptor(&self) -> Option<PeerDescriptor> {
        self.peer.lock().clone()
    }

    fn set_state(&self, next: AdapterState) {
        let mut state = self.state.write();
        debug!(adapter = %self.adapter.identity(), from = %*state, to = %next, "adapter state");
        *state = next;
    }

    fn set_phase(&self, next: DiscoverPhase) {
        *self.discover_phase.write() = next;
    }

    /// Mark the adapter failed; used by the session controller when an
    /// establishment attempt dies on this adapter.
    pub(crate) fn mark_failed(&self) {
        self.set_state(AdapterState::Failed);
    }

    /// Run a Discover transaction against the target name
    ///
    /// Sequence: stop any prior discovery, wait the settle delay, subscribe
    /// to peer-list notifications, start discovery, and on the first
    /// notification request the peer list exactly once. The first peer whose
    /// advertised name equals the target (case-sensitive) wins.
    pub async fn discover(&self, target: &str) -> Result<DiscoverOutcome, TransactionError> {
        let _flight = self
            .discover_gate
            .try_lock()
            .map_err(|_| TransactionError::DiscoveryInProgress)?;

        self.set_state(AdapterState::Discovering);

        // The discovery service needs a prior session fully settled before a
        // new one is reliable.
        self.set_phase(DiscoverPhase::StoppingPriorDiscovery);
        if let Err(err) = self.adapter.stop_discovery().await {
            warn!(adapter = %self.adapter.identity(), %err, "stopping prior discovery failed");
        }

        self.set_phase(DiscoverPhase::AwaitingStart);
        tokio::time::sleep(self.timings.settle_delay).await;

        // Subscribe before starting so the first notification cannot be lost.
        let mut peers_rx = self.adapter.peers_changed();

        self.set_phase(DiscoverPhase::Listening);
        if let Err(err) = self.adapter.start_discovery().await {
            self.set_phase(DiscoverPhase::Idle);
            self.set_state(AdapterState::Failed);
            return Err(err.into());
        }

        let waited = with_timeout(
            async {
                loop {
                    match peers_rx.recv().await {
                        Ok(()) => return Ok(()),
                        Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(TransactionError::ChannelClosed)
                        }
                    }
                }
            },
            self.timings.discover_timeout,
            "discover",
        )
        .await;
        // Unsubscribe immediately so a second notification cannot trigger a
        // duplicate peer-list request.
        drop(peers_rx);
        if let Err(err) = waited {
            self.set_phase(DiscoverPhase::Idle);
            self.set_state(AdapterState::Failed);
            return Err(err);
        }

        self.set_phase(DiscoverPhase::PeersRequested);
        let peers = match self.adapter.request_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                self.set_phase(DiscoverPhase::Idle);
                self.set_state(AdapterState::Failed);
                return Err(err.into());
            }
        };

        let matched = peers.into_iter().find(|peer| peer.name == target);
        self.set_state(AdapterState::Idle);
        match matched {
            Some(peer) => {
                debug!(adapter = %self.adapter.identity(), peer = %peer.name, "peer matched");
                let descriptor = PeerDescriptor {
                    peer,
                    target_name: target.to_string(),
                };
                *self.peer.lock() = Some(descriptor.clone());
                self.set_phase(DiscoverPhase::Matched);
                Ok(DiscoverOutcome::Matched(descriptor))
            }
            None => {
                debug!(adapter = %self.adapter.identity(), target, "no peer matched");
                self.set_phase(DiscoverPhase::NotFound);
                Ok(DiscoverOutcome::NotFound)
            }
        }
    }

    /// Run a Connect transaction against the previously matched peer
    ///
    /// Fails immediately, without touching the transport, when no descriptor
    /// exists or the peer advertises no supported negotiation method. The
    /// link-state subscription is taken strictly before the connect request
    /// is issued so an early notification cannot be missed; on success it is
    /// returned to the caller as a [`LinkMonitor`].
    pub async fn connect(&self) -> Result<LinkMonitor, TransactionError> {
        let descriptor = self
            .peer
            .lock()
            .clone()
            .ok_or(TransactionError::PeerNotFound)?;

        let method = NegotiationMethod::select(&descriptor.peer.methods)
            .ok_or(TransactionError::UnsupportedNegotiationMethod)?;

        let mut events = self.adapter.link_events();
        self.set_state(AdapterState::Connecting);

        debug!(
            adapter = %self.adapter.identity(),
            peer = %descriptor.peer.name,
            %method,
            "issuing connect request"
        );
        if let Err(err) = self.adapter.request_connect(&descriptor, method).await {
            self.set_state(AdapterState::Failed);
            return Err(err.into());
        }

        let expected = descriptor.target_name.clone();
        let waited = with_timeout(
            async {
                loop {
                    match events.recv().await {
                        // Only a connection to the expected peer is terminal;
                        // anything else is ignored.
                        Ok(LinkEvent::Connected { peer_name }) if peer_name == expected => {
                            return Ok(())
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(TransactionError::ChannelClosed)
                        }
                    }
                }
            },
            self.timings.connect_timeout,
            "connect",
        )
        .await;
        if let Err(err) = waited {
            self.set_state(AdapterState::Failed);
            return Err(err);
        }

        self.set_state(AdapterState::Connected);
        Ok(LinkMonitor::new(events, descriptor.peer.name))
    }

    /// Run a Disconnect transaction
    ///
    /// Resolution is purely the transport's own teardown outcome; the
    /// session-level Disconnect/DisconnectAck handshake is a separate layer.
    /// The peer descriptor is invalidated on success.
    pub async fn disconnect(&self) -> Result<(), TransactionError> {
        self.set_state(AdapterState::Disconnecting);
        match self.adapter.teardown().await {
            Ok(()) => {
                *self.peer.lock() = None;
                self.set_phase(DiscoverPhase::Idle);
                self.set_state(AdapterState::Idle);
                Ok(())
            }
            Err(err) => {
                self.set_state(AdapterState::Failed);
                Err(TransactionError::TeardownFailure(err))
            }
        }
    }
}

async fn with_timeout<T>(
    fut: impl Future<Output = Result<T, TransactionError>>,
    limit: Option<Duration>,
    what: &'static str,
) -> Result<T, TransactionError> {
    match limit {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| TransactionError::Timeout(what))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterIdentity, AdapterRole, PeerInfo, TransportKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn timings() -> TransactionTimings {
        TransactionTimings {
            settle_delay: Duration::from_millis(0),
            discover_timeout: Some(Duration::from_millis(200)),
            connect_timeout: Some(Duration::from_millis(200)),
        }
    }

    /// Scriptable in-memory adapter for exercising transactions
    struct MockAdapter {
        identity: AdapterIdentity,
        peers: Mutex<Vec<PeerInfo>>,
        peers_tx: broadcast::Sender<()>,
        link_tx: broadcast::Sender<LinkEvent>,
        notify_on_start: bool,
        connect_emits: Vec<LinkEvent>,
        fail_teardown: AtomicBool,
        connect_requests: AtomicUsize,
    }

    impl MockAdapter {
        fn new() -> Self {
            let (peers_tx, _) = broadcast::channel(8);
            let (link_tx, _) = broadcast::channel(8);
            Self {
                identity: AdapterIdentity {
                    name: "mock0".to_string(),
                    adapter_id: 1,
                    address: "00:00:00:00:00:01".to_string(),
                    service_id: "sc-test".to_string(),
                    kind: TransportKind::Bluetooth,
                    role: AdapterRole::Control,
                },
                peers: Mutex::new(Vec::new()),
                peers_tx,
                link_tx,
                notify_on_start: true,
                connect_emits: Vec::new(),
                fail_teardown: AtomicBool::new(false),
                connect_requests: AtomicUsize::new(0),
            }
        }

        fn with_peer(self, name: &str, methods: Vec<NegotiationMethod>) -> Self {
            self.peers.lock().push(PeerInfo {
                name: name.to_string(),
                address: "peer-addr".to_string(),
                methods,
            });
            self
        }

        fn with_connect_emits(mut self, events: Vec<LinkEvent>) -> Self {
            self.connect_emits = events;
            self
        }

        fn silent(mut self) -> Self {
            self.notify_on_start = false;
            self
        }
    }

    #[async_trait]
    impl TransportAdapter for MockAdapter {
        fn identity(&self) -> AdapterIdentity {
            self.identity.clone()
        }

        fn mtu(&self) -> usize {
            512
        }

        async fn stop_discovery(&self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn start_discovery(&self) -> Result<(), AdapterError> {
            if self.notify_on_start {
                let _ = self.peers_tx.send(());
            }
            Ok(())
        }

        fn peers_changed(&self) -> broadcast::Receiver<()> {
            self.peers_tx.subscribe()
        }

        async fn request_peers(&self) -> Result<Vec<PeerInfo>, AdapterError> {
            Ok(self.peers.lock().clone())
        }

        fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
            self.link_tx.subscribe()
        }

        async fn request_connect(
            &self,
            _peer: &PeerDescriptor,
            _method: NegotiationMethod,
        ) -> Result<(), AdapterError> {
            self.connect_requests.fetch_add(1, Ordering::SeqCst);
            for event in &self.connect_emits {
                let _ = self.link_tx.send(event.clone());
            }
            Ok(())
        }

        async fn teardown(&self) -> Result<(), AdapterError> {
            if self.fail_teardown.load(Ordering::SeqCst) {
                return Err(AdapterError::TeardownFailed("radio busy".to_string()));
            }
            let _ = self.link_tx.send(LinkEvent::Disconnected {
                peer_name: "peer-b".to_string(),
            });
            Ok(())
        }

        async fn sleep_link(&self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn wake_link(&self) -> Result<(), AdapterError> {
            Ok(())
        }

        async fn send_chunk(&self, chunk: &[u8]) -> Result<usize, AdapterError> {
            Ok(chunk.len())
        }

        async fn recv_chunk(&self, _buf: &mut [u8]) -> Result<usize, AdapterError> {
            Err(AdapterError::NotConnected)
        }
    }

    #[tokio::test]
    async fn test_discover_matches_target() {
        let adapter = Arc::new(
            MockAdapter::new().with_peer("peer-b", vec![NegotiationMethod::PushButton]),
        );
        let machine = ConnectionMachine::new(adapter, timings());

        let outcome = machine.discover("peer-b").await.unwrap();
        match outcome {
            DiscoverOutcome::Matched(descriptor) => {
                assert_eq!(descriptor.peer.name, "peer-b");
                assert_eq!(descriptor.target_name, "peer-b");
            }
            DiscoverOutcome::NotFound => panic!("expected a match"),
        }
        assert!(machine.peer_descriptor().is_some());
        assert_eq!(machine.state(), AdapterState::Idle);
        assert_eq!(machine.discover_phase(), DiscoverPhase::Matched);
    }

    #[tokio::test]
    async fn test_discover_not_found_leaves_descriptor_unset() {
        let adapter = Arc::new(
            MockAdapter::new().with_peer("someone-else", vec![NegotiationMethod::PushButton]),
        );
        let machine = ConnectionMachine::new(adapter, timings());

        let outcome = machine.discover("peer-b").await.unwrap();
        assert_eq!(outcome, DiscoverOutcome::NotFound);
        assert!(machine.peer_descriptor().is_none());
        assert_eq!(machine.discover_phase(), DiscoverPhase::NotFound);

        // Connect after NotFound fails up front.
        let err = machine.connect().await.unwrap_err();
        assert!(matches!(err, TransactionError::PeerNotFound));
    }

    #[tokio::test]
    async fn test_discover_match_is_case_sensitive() {
        let adapter = Arc::new(
            MockAdapter::new().with_peer("PEER-B", vec![NegotiationMethod::PushButton]),
        );
        let machine = ConnectionMachine::new(adapter, timings());
        let outcome = machine.discover("peer-b").await.unwrap();
        assert_eq!(outcome, DiscoverOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_concurrent_discover_rejected_not_queued() {
        let adapter = Arc::new(
            MockAdapter::new()
                .silent()
                .with_peer("peer-b", vec![NegotiationMethod::PushButton]),
        );
        let machine = Arc::new(ConnectionMachine::new(adapter.clone(), TransactionTimings {
            settle_delay: Duration::from_millis(0),
            discover_timeout: Some(Duration::from_secs(5)),
            connect_timeout: None,
        }));

        let first = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.discover("peer-b").await })
        };
        // Let the first transaction reach its listening phase.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = machine.discover("peer-b").await;
        assert!(matches!(
            second.unwrap_err(),
            TransactionError::DiscoveryInProgress
        ));

        // The rejected call must not alter the first call's eventual result.
        let _ = adapter.peers_tx.send(());
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, DiscoverOutcome::Matched(_)));
    }

    #[tokio::test]
    async fn test_discover_timeout_without_notification() {
        let adapter = Arc::new(MockAdapter::new().silent());
        let machine = ConnectionMachine::new(adapter, timings());

        let err = machine.discover("peer-b").await.unwrap_err();
        assert!(matches!(err, TransactionError::Timeout("discover")));
        assert_eq!(machine.state(), AdapterState::Failed);
    }

    #[tokio::test]
    async fn test_connect_without_discover_issues_no_request() {
        let adapter = Arc::new(MockAdapter::new());
        let machine = ConnectionMachine::new(adapter.clone(), timings());

        let err = machine.connect().await.unwrap_err();
        assert!(matches!(err, TransactionError::PeerNotFound));
        assert_eq!(adapter.connect_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_unsupported_method_issues_no_request() {
        let adapter = Arc::new(
            MockAdapter::new().with_peer("peer-b", vec![NegotiationMethod::Display]),
        );
        let machine = ConnectionMachine::new(adapter.clone(), timings());
        machine.discover("peer-b").await.unwrap();

        let err = machine.connect().await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::UnsupportedNegotiationMethod
        ));
        assert_eq!(adapter.connect_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_verifies_peer_identity() {
        let adapter = Arc::new(
            MockAdapter::new()
                .with_peer("peer-b", vec![NegotiationMethod::PushButton])
                .with_connect_emits(vec![
                    // A stray connection to another peer is not terminal.
                    LinkEvent::Connected {
                        peer_name: "intruder".to_string(),
                    },
                    LinkEvent::Connected {
                        peer_name: "peer-b".to_string(),
                    },
                ]),
        );
        let machine = ConnectionMachine::new(adapter, timings());
        machine.discover("peer-b").await.unwrap();

        let monitor = machine.connect().await.unwrap();
        assert_eq!(monitor.peer_name(), "peer-b");
        assert_eq!(machine.state(), AdapterState::Connected);
    }

    #[tokio::test]
    async fn test_connect_timeout_marks_failed() {
        let adapter = Arc::new(
            MockAdapter::new().with_peer("peer-b", vec![NegotiationMethod::PushButton]),
        );
        let machine = ConnectionMachine::new(adapter, timings());
        machine.discover("peer-b").await.unwrap();

        // No Connected event is ever emitted.
        let err = machine.connect().await.unwrap_err();
        assert!(matches!(err, TransactionError::Timeout("connect")));
        assert_eq!(machine.state(), AdapterState::Failed);
    }

    #[tokio::test]
    async fn test_monitor_observes_disconnection() {
        let adapter = Arc::new(
            MockAdapter::new()
                .with_peer("peer-b", vec![NegotiationMethod::PushButton])
                .with_connect_emits(vec![LinkEvent::Connected {
                    peer_name: "peer-b".to_string(),
                }]),
        );
        let machine = ConnectionMachine::new(adapter.clone(), timings());
        machine.discover("peer-b").await.unwrap();
        let mut monitor = machine.connect().await.unwrap();

        let _ = adapter.link_tx.send(LinkEvent::Disconnected {
            peer_name: "peer-b".to_string(),
        });
        monitor.wait_disconnected().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_invalidates_descriptor() {
        let adapter = Arc::new(
            MockAdapter::new()
                .with_peer("peer-b", vec![NegotiationMethod::PushButton])
                .with_connect_emits(vec![LinkEvent::Connected {
                    peer_name: "peer-b".to_string(),
                }]),
        );
        let machine = ConnectionMachine::new(adapter, timings());
        machine.discover("peer-b").await.unwrap();
        let _monitor = machine.connect().await.unwrap();

        machine.disconnect().await.unwrap();
        assert_eq!(machine.state(), AdapterState::Idle);
        assert!(machine.peer_descriptor().is_none());

        // Connect again without a fresh Discover fails.
        let err = machine.connect().await.unwrap_err();
        assert!(matches!(err, TransactionError::PeerNotFound));
    }

    #[tokio::test]
    async fn test_teardown_failure_marks_failed() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_teardown.store(true, Ordering::SeqCst);
        let machine = ConnectionMachine::new(adapter, timings());

        let err = machine.disconnect().await.unwrap_err();
        assert!(matches!(err, TransactionError::TeardownFailure(_)));
        assert_eq!(machine.state(), AdapterState::Failed);
    }
}
