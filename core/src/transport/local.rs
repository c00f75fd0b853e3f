//! In-process transport hub
//!
//! Nodes register on a shared [`LocalHub`] and are linked pairwise to model
//! radio range. Frames are delivered synchronously into the receiver's
//! callback, which makes multi-hop scenarios deterministic in tests and in
//! the CLI simulator.

use super::abstraction::{BytesCallback, MeshTransport, TransportError};
use crate::scheduler::DutyCycle;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

#[derive(Default)]
struct NodeSlot {
    callback: Option<Arc<dyn Fn(String, Vec<u8>) + Send + Sync>>,
    scanning: bool,
    advertising: bool,
    duty_cycle: DutyCycle,
    failing: bool,
    frames_sent: u64,
    frames_received: u64,
    burst_requests: u64,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<String, NodeSlot>,
    links: BTreeSet<(String, String)>,
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared medium for [`LocalTransport`]s.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<RwLock<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its transport handle.
    pub fn join(&self, node_id: &str) -> LocalTransport {
        self.state
            .write()
            .nodes
            .entry(node_id.to_string())
            .or_default();
        LocalTransport {
            node_id: node_id.to_string(),
            hub: self.clone(),
        }
    }

    /// Put two nodes in range of each other.
    pub fn link(&self, a: &str, b: &str) {
        if a != b {
            self.state.write().links.insert(link_key(a, b));
        }
    }

    pub fn unlink(&self, a: &str, b: &str) {
        self.state.write().links.remove(&link_key(a, b));
    }

    /// Link every registered node with every other.
    pub fn link_all(&self) {
        let mut state = self.state.write();
        let ids: Vec<String> = state.nodes.keys().cloned().collect();
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                state.links.insert(link_key(a, b));
            }
        }
    }

    pub fn neighbors(&self, node_id: &str) -> Vec<String> {
        let state = self.state.read();
        state
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == node_id {
                    Some(b.clone())
                } else if b == node_id {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Make every send from this node fail, to exercise retry paths.
    pub fn set_failing(&self, node_id: &str, failing: bool) {
        if let Some(slot) = self.state.write().nodes.get_mut(node_id) {
            slot.failing = failing;
        }
    }

    pub fn frames_sent(&self, node_id: &str) -> u64 {
        self.state
            .read()
            .nodes
            .get(node_id)
            .map_or(0, |s| s.frames_sent)
    }

    pub fn frames_received(&self, node_id: &str) -> u64 {
        self.state
            .read()
            .nodes
            .get(node_id)
            .map_or(0, |s| s.frames_received)
    }

    pub fn duty_cycle(&self, node_id: &str) -> DutyCycle {
        self.state
            .read()
            .nodes
            .get(node_id)
            .map_or(DutyCycle::Normal, |s| s.duty_cycle)
    }

    pub fn burst_requests(&self, node_id: &str) -> u64 {
        self.state
            .read()
            .nodes
            .get(node_id)
            .map_or(0, |s| s.burst_requests)
    }

    pub fn is_scanning(&self, node_id: &str) -> bool {
        self.state
            .read()
            .nodes
            .get(node_id)
            .is_some_and(|s| s.scanning)
    }

    pub fn is_advertising(&self, node_id: &str) -> bool {
        self.state
            .read()
            .nodes
            .get(node_id)
            .is_some_and(|s| s.advertising)
    }

    fn with_slot<R>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeSlot) -> R,
    ) -> Result<R, TransportError> {
        let mut state = self.state.write();
        let slot = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| TransportError::NotAvailable(node_id.to_string()))?;
        Ok(f(slot))
    }

    // Callbacks run after the hub lock is released so a receiver may send
    // from inside its callback.
    fn deliver(&self, from: &str, targets: &[String], bytes: &[u8]) -> Result<usize, TransportError> {
        let callbacks: Vec<_> = {
            let mut state = self.state.write();
            let sender = state
                .nodes
                .get_mut(from)
                .ok_or_else(|| TransportError::NotAvailable(from.to_string()))?;
            if sender.failing {
                return Err(TransportError::SendFailed(format!("{} radio failure", from)));
            }
            sender.frames_sent += 1;

            targets
                .iter()
                .filter_map(|target| {
                    let slot = state.nodes.get_mut(target)?;
                    slot.frames_received += 1;
                    slot.callback.clone()
                })
                .collect()
        };

        for callback in &callbacks {
            callback(from.to_string(), bytes.to_vec());
        }
        trace!(from, delivered = callbacks.len(), "local frame delivered");
        Ok(callbacks.len())
    }
}

/// One node's handle on a [`LocalHub`].
#[derive(Clone)]
pub struct LocalTransport {
    node_id: String,
    hub: LocalHub,
}

impl LocalTransport {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

#[async_trait]
impl MeshTransport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn scan(&self) -> Result<(), TransportError> {
        self.hub.with_slot(&self.node_id, |s| s.scanning = true)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.hub.with_slot(&self.node_id, |s| s.scanning = false)
    }

    async fn advertise(&self) -> Result<(), TransportError> {
        self.hub.with_slot(&self.node_id, |s| s.advertising = true)
    }

    async fn stop_advertise(&self) -> Result<(), TransportError> {
        self.hub.with_slot(&self.node_id, |s| s.advertising = false)
    }

    async fn send(&self, peer_id: &str, bytes: &[u8]) -> Result<bool, TransportError> {
        if !self.hub.neighbors(&self.node_id).iter().any(|n| n == peer_id) {
            return Ok(false);
        }
        let delivered = self.hub.deliver(&self.node_id, &[peer_id.to_string()], bytes)?;
        Ok(delivered > 0)
    }

    async fn broadcast(&self, bytes: &[u8]) -> Result<usize, TransportError> {
        let neighbors = self.hub.neighbors(&self.node_id);
        self.hub.deliver(&self.node_id, &neighbors, bytes)
    }

    async fn set_duty_cycle(&self, duty_cycle: DutyCycle) -> Result<(), TransportError> {
        self.hub.with_slot(&self.node_id, |s| {
            if duty_cycle == DutyCycle::Burst {
                s.burst_requests += 1;
            }
            s.duty_cycle = duty_cycle;
        })
    }

    fn peer_count(&self) -> usize {
        self.hub.neighbors(&self.node_id).len()
    }

    fn set_on_bytes_received(&self, callback: BytesCallback) {
        let callback: Arc<dyn Fn(String, Vec<u8>) + Send + Sync> = Arc::from(callback);
        let _ = self.hub.with_slot(&self.node_id, |s| s.callback = Some(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder(transport: &LocalTransport) -> Arc<Mutex<Vec<(String, Vec<u8>)>>> {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        transport.set_on_bytes_received(Box::new(move |peer, bytes| {
            sink.lock().push((peer, bytes));
        }));
        inbox
    }

    #[tokio::test]
    async fn test_broadcast_reaches_linked_nodes_only() {
        let hub = LocalHub::new();
        let a = hub.join("a");
        let b = hub.join("b");
        let c = hub.join("c");
        hub.link("a", "b");

        let b_inbox = recorder(&b);
        let c_inbox = recorder(&c);

        assert_eq!(a.broadcast(b"frame").await.unwrap(), 1);
        assert_eq!(b_inbox.lock().as_slice(), &[("a".to_string(), b"frame".to_vec())]);
        assert!(c_inbox.lock().is_empty());
        assert_eq!(a.peer_count(), 1);
        assert_eq!(hub.frames_sent("a"), 1);
        assert_eq!(hub.frames_received("b"), 1);
    }

    #[tokio::test]
    async fn test_unicast_out_of_range() {
        let hub = LocalHub::new();
        let a = hub.join("a");
        let _b = hub.join("b");
        assert!(!a.send("b", b"x").await.unwrap());
        hub.link("a", "b");
        assert!(a.send("b", b"x").await.unwrap());
    }

    #[tokio::test]
    async fn test_failing_node() {
        let hub = LocalHub::new();
        let a = hub.join("a");
        hub.join("b");
        hub.link_all();
        hub.set_failing("a", true);
        assert!(matches!(
            a.broadcast(b"x").await,
            Err(TransportError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_advertise_and_duty_cycle() {
        let hub = LocalHub::new();
        let a = hub.join("a");
        a.scan().await.unwrap();
        a.advertise().await.unwrap();
        assert!(hub.is_scanning("a"));
        assert!(hub.is_advertising("a"));

        a.set_duty_cycle(DutyCycle::Burst).await.unwrap();
        assert_eq!(hub.duty_cycle("a"), DutyCycle::Burst);
        a.set_duty_cycle(DutyCycle::Normal).await.unwrap();
        assert_eq!(hub.burst_requests("a"), 1);

        a.stop_scan().await.unwrap();
        a.stop_advertise().await.unwrap();
        assert!(!hub.is_scanning("a"));
        assert!(!hub.is_advertising("a"));
    }
}
