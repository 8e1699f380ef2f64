//! In-process loopback transport
//!
//! A pair of adapters joined by in-memory channels. Discovery always finds
//! the opposite endpoint and connect succeeds immediately, which makes it
//! the transport of choice for exercising the session layer end to end
//! without any radio underneath.

use crate::adapter::{
    AdapterError, AdapterIdentity, AdapterRole, LinkEvent, NegotiationMethod, PeerDescriptor,
    PeerInfo, TransportAdapter, TransportKind,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

const CHANNEL_DEPTH: usize = 64;

struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    /// Bytes from a received chunk that did not fit the caller's buffer
    pending: VecDeque<u8>,
}

/// One endpoint of a loopback link
pub struct LoopbackAdapter {
    identity: AdapterIdentity,
    mtu: usize,
    remote_name: String,
    methods: Vec<NegotiationMethod>,
    peers_tx: broadcast::Sender<()>,
    link_tx: broadcast::Sender<LinkEvent>,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    inbound: tokio::sync::Mutex<Inbound>,
    connected: AtomicBool,
    asleep: AtomicBool,
}

impl LoopbackAdapter {
    /// Build two endpoints joined back to back
    pub fn pair(
        local: &str,
        remote: &str,
        adapter_id: u16,
        role: AdapterRole,
        mtu: usize,
    ) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        let a = Self::endpoint(local, remote, adapter_id, role, mtu, b_tx, a_rx);
        let b = Self::endpoint(remote, local, adapter_id, role, mtu, a_tx, b_rx);
        (a, b)
    }

    fn endpoint(
        local: &str,
        remote: &str,
        adapter_id: u16,
        role: AdapterRole,
        mtu: usize,
        tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let (peers_tx, _) = broadcast::channel(CHANNEL_DEPTH);
        let (link_tx, _) = broadcast::channel(CHANNEL_DEPTH);
        Self {
            identity: AdapterIdentity {
                name: format!("loopback-{local}"),
                adapter_id,
                address: format!("loop://{local}"),
                service_id: "sc-loopback".to_string(),
                kind: TransportKind::Loopback,
                role,
            },
            mtu,
            remote_name: remote.to_string(),
            methods: vec![NegotiationMethod::PushButton],
            peers_tx,
            link_tx,
            outbound: parking_lot::Mutex::new(Some(tx)),
            inbound: tokio::sync::Mutex::new(Inbound {
                rx,
                pending: VecDeque::new(),
            }),
            connected: AtomicBool::new(false),
            asleep: AtomicBool::new(false),
        }
    }

    /// Whether the link is currently paused by `sleep_link`
    pub fn is_asleep(&self) -> bool {
        self.asleep.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportAdapter for LoopbackAdapter {
    fn identity(&self) -> AdapterIdentity {
        self.identity.clone()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn stop_discovery(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn start_discovery(&self) -> Result<(), AdapterError> {
        // The opposite endpoint is always present, so the peer list is
        // ready the moment discovery starts.
        let _ = self.peers_tx.send(());
        Ok(())
    }

    fn peers_changed(&self) -> broadcast::Receiver<()> {
        self.peers_tx.subscribe()
    }

    async fn request_peers(&self) -> Result<Vec<PeerInfo>, AdapterError> {
        Ok(vec![PeerInfo {
            name: self.remote_name.clone(),
            address: format!("loop://{}", self.remote_name),
            methods: self.methods.clone(),
        }])
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }

    async fn request_connect(
        &self,
        peer: &PeerDescriptor,
        _method: NegotiationMethod,
    ) -> Result<(), AdapterError> {
        if peer.peer.name != self.remote_name {
            return Err(AdapterError::ConnectFailed(format!(
                "unknown peer {}",
                peer.peer.name
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.link_tx.send(LinkEvent::Connected {
            peer_name: self.remote_name.clone(),
        });
        Ok(())
    }

    async fn teardown(&self) -> Result<(), AdapterError> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender lets the remote's receive resolve with 0.
        *self.outbound.lock() = None;
        let _ = self.link_tx.send(LinkEvent::Disconnected {
            peer_name: self.remote_name.clone(),
        });
        Ok(())
    }

    async fn sleep_link(&self) -> Result<(), AdapterError> {
        self.asleep.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wake_link(&self) -> Result<(), AdapterError> {
        self.asleep.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_chunk(&self, chunk: &[u8]) -> Result<usize, AdapterError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(AdapterError::NotConnected);
        }
        let tx = match self.outbound.lock().clone() {
            Some(tx) => tx,
            None => return Err(AdapterError::NotConnected),
        };
        trace!(adapter = %self.identity, len = chunk.len(), "loopback send");
        tx.send(chunk.to_vec())
            .await
            .map_err(|_| AdapterError::SendFailed("remote endpoint gone".to_string()))?;
        Ok(chunk.len())
    }

    async fn recv_chunk(&self, buf: &mut [u8]) -> Result<usize, AdapterError> {
        let mut inbound = self.inbound.lock().await;
        if inbound.pending.is_empty() {
            match inbound.rx.recv().await {
                Some(chunk) => inbound.pending.extend(chunk),
                // Remote side tore the link down.
                None => return Ok(0),
            }
        }
        let n = buf.len().min(inbound.pending.len());
        for slot in buf.iter_mut().take(n) {
            // VecDeque is never empty here while i < n
            *slot = inbound.pending.pop_front().unwrap_or(0);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_discovers_each_other() {
        let (a, b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Control, 128);
        let peers = a.request_peers().await.unwrap();
        assert_eq!(peers[0].name, "bob");
        let peers = b.request_peers().await.unwrap();
        assert_eq!(peers[0].name, "alice");
    }

    #[tokio::test]
    async fn test_discovery_notifies_subscriber() {
        let (a, _b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Control, 128);
        let mut rx = a.peers_changed();
        a.start_discovery().await.unwrap();
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (a, _b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Data, 128);
        let err = a.send_chunk(b"hi").await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected));
    }

    async fn connect(side: &LoopbackAdapter) {
        let peer = PeerDescriptor {
            peer: side.request_peers().await.unwrap().remove(0),
            target_name: side.remote_name.clone(),
        };
        side.request_connect(&peer, NegotiationMethod::PushButton)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_chunks_cross_the_link() {
        let (a, b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Data, 128);
        connect(&a).await;
        connect(&b).await;

        a.send_chunk(b"HELLO WORLD").await.unwrap();
        let mut buf = [0u8; 32];
        let n = b.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HELLO WORLD");
    }

    #[tokio::test]
    async fn test_small_buffer_keeps_remainder() {
        let (a, b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Data, 128);
        connect(&a).await;
        connect(&b).await;

        a.send_chunk(b"HELLO WORLD").await.unwrap();
        let mut buf = [0u8; 5];
        let n = b.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HELLO");
        let n = b.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b" WORL");
        let n = b.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"D");
    }

    #[tokio::test]
    async fn test_teardown_closes_remote_receive() {
        let (a, b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Data, 128);
        connect(&a).await;
        connect(&b).await;

        a.teardown().await.unwrap();
        let mut buf = [0u8; 8];
        let n = b.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_sleep_and_wake_toggle() {
        let (a, _b) = LoopbackAdapter::pair("alice", "bob", 7, AdapterRole::Data, 128);
        assert!(!a.is_asleep());
        a.sleep_link().await.unwrap();
        assert!(a.is_asleep());
        a.wake_link().await.unwrap();
        assert!(!a.is_asleep());
    }
}
