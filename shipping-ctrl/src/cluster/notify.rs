//! Control messages from the controller to satellites.
//!
//! Every call is made after the triggering transaction committed. Failed
//! or missing answers are reported to the caller and never roll anything
//! back.

use super::peers::{NodeResponse, PeerRegistry};
use crate::model::{Remote, SnapshotDefinition};
use futures_util::future::join_all;
use serde_json::{json, Value};
use shipping_agent::shipping::ShipCommand;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const API_UPDATE_SNAPSHOT: &str = "snapshot:update";
pub const API_SNAPSHOT_DELETED: &str = "snapshot:deleted";
pub const API_UPDATE_REMOTE: &str = "remote:update";

#[derive(Clone)]
pub struct Notifier {
    peers: Arc<PeerRegistry>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(peers: Arc<PeerRegistry>, timeout: Duration) -> Self {
        Self { peers, timeout }
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub async fn call(&self, node_name: &str, message: Value) -> NodeResponse {
        let method = message
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let response = match self
            .peers
            .request_from_peer(node_name, message, self.timeout)
            .await
        {
            Ok(payload) => match serde_json::from_value::<NodeResponse>(payload) {
                Ok(mut response) => {
                    response.node_name = node_name.to_string();
                    response
                }
                Err(e) => NodeResponse::failed(node_name, format!("Malformed response: {e}")),
            },
            Err(e) => NodeResponse::failed(node_name, e.to_string()),
        };
        if response.success {
            debug!("{} on {} succeeded", method, node_name);
        } else {
            warn!("{} on {} failed: {}", method, node_name, response.message);
        }
        response
    }

    /// Send the same message to every node, concurrently.
    pub async fn call_nodes(&self, node_names: &[String], message: &Value) -> Vec<NodeResponse> {
        join_all(
            node_names
                .iter()
                .map(|node| self.call(node, message.clone())),
        )
        .await
    }

    pub async fn send_command(&self, node_names: &[String], command: &ShipCommand) -> Vec<NodeResponse> {
        match serde_json::to_value(command) {
            Ok(message) => self.call_nodes(node_names, &message).await,
            Err(e) => node_names
                .iter()
                .map(|node| NodeResponse::failed(node, e.to_string()))
                .collect(),
        }
    }

    /// Push the current state of a snapshot definition to its nodes.
    pub async fn update_snapshot(&self, snap_dfn: &SnapshotDefinition) -> Vec<NodeResponse> {
        let message = json!({
            "type": API_UPDATE_SNAPSHOT,
            "payload": {
                "rsc_name": snap_dfn.rsc_name,
                "snap_name": snap_dfn.snap_name,
                "uuid": snap_dfn.uuid,
                "flags": snap_dfn.flags.iter().map(|f| f.name()).collect::<Vec<_>>(),
            }
        });
        self.call_nodes(&snap_dfn.node_names(), &message).await
    }

    pub async fn snapshot_deleted(&self, node_names: &[String], rsc_name: &str, snap_name: &str) -> Vec<NodeResponse> {
        let message = json!({
            "type": API_SNAPSHOT_DELETED,
            "payload": {"rsc_name": rsc_name, "snap_name": snap_name}
        });
        self.call_nodes(node_names, &message).await
    }

    pub async fn update_remote(&self, node_names: &[String], remote: &Remote) -> Vec<NodeResponse> {
        let message = json!({
            "type": API_UPDATE_REMOTE,
            "payload": {"remote_name": remote.name, "deleting": remote.deleting}
        });
        self.call_nodes(node_names, &message).await
    }
}

/// Responses that did not succeed.
pub fn failures(responses: &[NodeResponse]) -> Vec<&NodeResponse> {
    responses.iter().filter(|r| !r.success).collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_responses_are_collected_per_node() {
        let peers = Arc::new(PeerRegistry::new());
        let seen = connect_satellite(&peers, "n1", true);
        connect_satellite(&peers, "n2", false);
        let notifier = Notifier::new(peers, Duration::from_secs(5));

        let responses = notifier
            .send_command(
                &["n1".to_string(), "n2".to_string(), "n3".to_string()],
                &ShipCommand::ShippingFinished {
                    rsc_name: "r".into(),
                    snap_name: "s".into(),
                },
            )
            .await;
        assert_eq!(responses.len(), 3);
        assert!(responses[0].success);
        assert_eq!(responses[1].node_name, "n2");
        assert!(!responses[1].success);
        assert!(responses[2].message.contains("not connected"));
        assert_eq!(failures(&responses).len(), 2);
        assert_eq!(types(&seen), vec!["backup:shipping-finished"]);
    }
}
