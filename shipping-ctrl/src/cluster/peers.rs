//! Connected satellites and request/response messaging with them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub struct PeerConnection {
    pub node_name: String,
    pub version: String,
    pub tx: mpsc::UnboundedSender<String>,
}

/// Answer of one node to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResponse {
    #[serde(default)]
    pub node_name: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl NodeResponse {
    pub fn failed(node_name: &str, message: impl Into<String>) -> Self {
        Self {
            node_name: node_name.to_string(),
            success: false,
            message: message.into(),
        }
    }
}

pub struct PeerRegistry {
    peers: DashMap<String, PeerConnection>,
    pending_requests: DashMap<String, oneshot::Sender<Value>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            pending_requests: DashMap::new(),
        }
    }

    pub fn register(&self, node_name: String, version: String, tx: mpsc::UnboundedSender<String>) {
        // Replacing the entry drops the old sender, closing that connection.
        self.peers.insert(
            node_name.to_ascii_lowercase(),
            PeerConnection {
                node_name,
                version,
                tx,
            },
        );
    }

    pub fn unregister(&self, node_name: &str) {
        self.peers.remove(&node_name.to_ascii_lowercase());
    }

    pub fn is_connected(&self, node_name: &str) -> bool {
        self.peers.contains_key(&node_name.to_ascii_lowercase())
    }

    pub fn connected_peers(&self) -> Vec<(String, String)> {
        self.peers
            .iter()
            .map(|entry| {
                let conn = entry.value();
                (conn.node_name.clone(), conn.version.clone())
            })
            .collect()
    }

    pub fn send_to_peer(&self, node_name: &str, message: Value) -> bool {
        if let Some(peer) = self.peers.get(&node_name.to_ascii_lowercase()) {
            peer.tx.send(message.to_string()).is_ok()
        } else {
            false
        }
    }

    /// Send `{"type", "payload"}` with a fresh `request_id` in the payload and
    /// wait for the matching response.
    pub async fn request_from_peer(
        &self,
        node_name: &str,
        mut message: Value,
        timeout: Duration,
    ) -> anyhow::Result<Value> {
        let request_id = uuid::Uuid::new_v4().to_string();

        if let Some(obj) = message.get_mut("payload").and_then(Value::as_object_mut) {
            obj.insert("request_id".into(), Value::String(request_id.clone()));
        }

        let (tx, rx) = oneshot::channel();
        self.pending_requests.insert(request_id.clone(), tx);

        if !self.send_to_peer(node_name, message) {
            self.pending_requests.remove(&request_id);
            anyhow::bail!("Node {} is not connected", node_name);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending_requests.remove(&request_id);
                anyhow::bail!("Request to {} cancelled", node_name)
            }
            Err(_) => {
                self.pending_requests.remove(&request_id);
                anyhow::bail!("Request to {} timed out", node_name)
            }
        }
    }

    pub fn resolve_request(&self, request_id: &str, response: Value) {
        if let Some((_, tx)) = self.pending_requests.remove(request_id) {
            let _ = tx.send(response);
        }
    }

    /// Route one inbound message. Responses resolve their pending request;
    /// anything else is handed back as `(type, payload)`.
    pub fn handle_message(&self, text: &str) -> Option<(String, Value)> {
        let parsed: Value = serde_json::from_str(text).ok()?;
        let msg_type = parsed.get("type").and_then(Value::as_str)?.to_string();
        let payload = parsed.get("payload").cloned().unwrap_or_default();

        if let Some(request_id) = payload.get("request_id").and_then(Value::as_str) {
            self.resolve_request(request_id, payload.clone());
            return None;
        }
        Some((msg_type, payload))
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
