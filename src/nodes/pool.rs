use dashmap::DashMap;
use std::sync::Arc;

use super::Node;
use crate::error::{Error, Result};

/// The registered nodes, keyed by identifier.
#[derive(Clone, Default)]
pub struct NodePool {
    nodes: Arc<DashMap<String, Node>>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &str) -> Option<Node> {
        self.nodes.get(identifier).map(|n| n.value().clone())
    }

    /// Inserts the node built by `create` unless the identifier is taken, in
    /// which case the existing node is returned. The second value tells
    /// whether a new node was inserted.
    pub fn get_or_insert_with(&self, identifier: &str, create: impl FnOnce() -> Node) -> (Node, bool) {
        let mut created = false;
        let node = self
            .nodes
            .entry(identifier.to_string())
            .or_insert_with(|| {
                created = true;
                create()
            })
            .value()
            .clone();
        (node, created)
    }

    pub fn remove(&self, identifier: &str) -> Option<Node> {
        self.nodes.remove(identifier).map(|(_, node)| node)
    }

    pub fn all(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn connected(&self) -> Result<Vec<Node>> {
        let nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.is_connected())
            .map(|n| n.value().clone())
            .collect();

        if nodes.is_empty() {
            return Err(Error::NoAvailableNodes);
        }

        Ok(nodes)
    }

    /// Connected nodes ordered by ascending REST call count.
    pub fn least_used(&self) -> Result<Vec<Node>> {
        let mut nodes = self.connected()?;
        nodes.sort_by_key(Node::calls);
        Ok(nodes)
    }

    /// Connected nodes ordered by ascending CPU load. Nodes that have not
    /// reported stats yet count as idle.
    pub fn least_load(&self) -> Result<Vec<Node>> {
        let mut nodes: Vec<(f64, Node)> = self
            .connected()?
            .into_iter()
            .map(|n| (n.load(), n))
            .collect();
        nodes.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(nodes.into_iter().map(|(_, n)| n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{connected_node, node_options, wait_until, MockTransport, RecordingHandler};
    use crate::nodes::RestRequest;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stats(cores: u32, system_load: f64) -> serde_json::Value {
        json!({
            "op": "stats", "players": 0, "playingPlayers": 0, "uptime": 1,
            "memory": { "free": 0, "used": 0, "allocated": 0, "reservable": 0 },
            "cpu": { "cores": cores, "systemLoad": system_load, "lavalinkLoad": 0.0 }
        })
    }

    fn ids(nodes: &[Node]) -> Vec<&str> {
        nodes.iter().map(Node::identifier).collect()
    }

    #[test]
    fn test_selection_fails_without_connected_nodes() {
        let pool = NodePool::new();
        assert!(matches!(pool.least_used(), Err(Error::NoAvailableNodes)));

        let node = Node::new(
            node_options("idle"),
            Arc::new(MockTransport::new()),
            Arc::new(RecordingHandler::default()),
        );
        pool.get_or_insert_with("idle", || node);
        assert!(matches!(pool.least_load(), Err(Error::NoAvailableNodes)));
    }

    #[test]
    fn test_get_or_insert_keeps_existing() {
        let pool = NodePool::new();
        let transport = Arc::new(MockTransport::new());
        let handler = Arc::new(RecordingHandler::default());

        let (first, created) = pool.get_or_insert_with("main", || {
            Node::new(node_options("main"), transport.clone(), handler.clone())
        });
        assert!(created);

        let (second, created) = pool.get_or_insert_with("main", || {
            Node::new(node_options("main"), transport.clone(), handler.clone())
        });
        assert!(!created);
        assert!(first.ptr_eq(&second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_least_load_prefers_nodes_without_stats() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let pool = NodePool::new();

        for id in ["a", "b", "c"] {
            let node = connected_node(&transport, id, handler.clone()).await;
            pool.get_or_insert_with(id, || node);
        }

        // a: 10%, b: 90%, c: sin estadísticas
        transport.push("a", stats(4, 0.4));
        transport.push("b", stats(2, 1.8));

        let (a, b) = (pool.get("a").unwrap(), pool.get("b").unwrap());
        wait_until(|| a.load() > 0.0 && b.load() > 0.0).await;

        let order = pool.least_load().unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(ids(&order)[2], "b");

        let mut first_two = ids(&order)[..2].to_vec();
        first_two.sort();
        assert_eq!(first_two, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_least_used_orders_by_calls() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let pool = NodePool::new();

        for id in ["busy", "quiet"] {
            let node = connected_node(&transport, id, handler.clone()).await;
            pool.get_or_insert_with(id, || node);
        }

        let busy = pool.get("busy").unwrap();
        busy.request(RestRequest::get("/version")).await.unwrap();
        busy.request(RestRequest::get("/version")).await.unwrap();

        assert_eq!(ids(&pool.least_used().unwrap()), vec!["quiet", "busy"]);

        pool.get("busy").unwrap().destroy();
        assert_eq!(ids(&pool.least_used().unwrap()), vec!["quiet"]);
    }
}
