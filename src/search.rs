use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::audio::track::{SearchResult, TrackData, TrackInfo, TrackSearcher};
use crate::config::SearchPlatform;
use crate::error::{Error, Result};
use crate::nodes::{Node, NodePool, RestRequest};

/// Runs search and decode requests on the least used node of the pool.
#[derive(Clone)]
pub(crate) struct TrackLoader {
    pool: NodePool,
    platform: SearchPlatform,
}

impl TrackLoader {
    pub fn new(pool: NodePool, platform: SearchPlatform) -> Self {
        Self { pool, platform }
    }

    fn node(&self) -> Result<Node> {
        self.pool
            .least_used()?
            .into_iter()
            .next()
            .ok_or(Error::NoAvailableNodes)
    }

    /// URLs and already-prefixed queries go through untouched.
    pub fn identifier(&self, query: &str) -> String {
        let lower = query.to_ascii_lowercase();
        let prefixed = ["ytsearch:", "ytmsearch:", "scsearch:"]
            .iter()
            .any(|p| lower.starts_with(p));

        if lower.starts_with("http://") || lower.starts_with("https://") || prefixed {
            query.to_string()
        } else {
            format!("{}:{}", self.platform.prefix(), query)
        }
    }

    pub async fn decode_tracks(&self, tracks: &[String]) -> Result<Vec<TrackData>> {
        if tracks.is_empty() {
            return Err(Error::Validation("No tracks to decode".into()));
        }

        let node = self.node()?;
        let body = node
            .request(RestRequest::post("/decodetracks").body(json!(tracks)))
            .await?;

        Ok(serde_json::from_value(body)?)
    }

    pub async fn decode_track(&self, track: &str) -> Result<TrackInfo> {
        let node = self.node()?;
        let body = node
            .request(RestRequest::get("/decodetrack").query("track", track))
            .await?;

        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl TrackSearcher for TrackLoader {
    async fn search(&self, query: &str, requester: Option<Value>) -> Result<SearchResult> {
        let node = self.node()?;
        let identifier = self.identifier(query);
        debug!("🔍 Buscando '{}' en el nodo '{}'", identifier, node.identifier());

        let body = node
            .request(RestRequest::get("/loadtracks").query("identifier", identifier))
            .await?;

        SearchResult::from_response(body, requester)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::LoadType;
    use crate::nodes::testing::{connected_node, MockTransport, RecordingHandler};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn test_identifier_prefixing() {
        let loader = TrackLoader::new(NodePool::new(), SearchPlatform::Soundcloud);
        assert_eq!(loader.identifier("lofi beats"), "scsearch:lofi beats");
        assert_eq!(loader.identifier("ytsearch:lofi"), "ytsearch:lofi");
        assert_eq!(
            loader.identifier("https://youtu.be/dQw4w9WgXcQ"),
            "https://youtu.be/dQw4w9WgXcQ"
        );
    }

    #[tokio::test]
    async fn test_search_uses_loadtracks() {
        let transport = MockTransport::new();
        let pool = NodePool::new();
        let node = connected_node(&transport, "main", Arc::new(RecordingHandler::default())).await;
        pool.get_or_insert_with("main", || node);

        transport.respond_with(json!({
            "loadType": "SEARCH_RESULT",
            "playlistInfo": {},
            "tracks": [{ "track": "QA", "info": {
                "identifier": "x", "isSeekable": true, "author": "A", "length": 1000,
                "isStream": false, "position": 0, "title": "T", "uri": "https://example.com/x" } }]
        }));

        let loader = TrackLoader::new(pool.clone(), SearchPlatform::Youtube);
        let result = loader.search("song", Some(json!("u1"))).await.unwrap();
        assert_eq!(result.load_type, LoadType::SearchResult);
        assert_eq!(result.tracks[0].track, "QA");

        let (node_id, request) = transport.requests().pop().unwrap();
        assert_eq!(node_id, "main");
        assert_eq!(request.path, "/loadtracks");
        assert_eq!(
            request.query,
            vec![("identifier".to_string(), "ytsearch:song".to_string())]
        );
        assert_eq!(pool.get("main").unwrap().calls(), 1);
    }

    #[tokio::test]
    async fn test_search_without_nodes_fails() {
        let loader = TrackLoader::new(NodePool::new(), SearchPlatform::Youtube);
        let err = loader.search("song", None).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableNodes));
    }
}
