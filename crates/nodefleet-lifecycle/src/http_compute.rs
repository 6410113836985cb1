//! HttpComputeApi: the compute provider behind a small JSON gateway.
//!
//! ```text
//! GET    {base}/clusters/{cluster_id}/nodes   → [Node]
//! POST   {base}/nodes      CreateNodeRequest  → {"node_id": "..."}
//! GET    {base}/nodes/{node_id}               → Node     (404: gone)
//! DELETE {base}/nodes/{node_id}               → any      (404: already gone)
//! ```

use std::time::Duration;

use http::Method;
use nodefleet_core::HttpError;
use nodefleet_core::http::{get_json, send_empty, send_json};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::api::{BoxFuture, ComputeApi, CreateNodeRequest};
use crate::error::{LifecycleError, LifecycleResult};
use crate::node::Node;

#[derive(Deserialize)]
struct Created {
    node_id: String,
}

#[derive(Debug, Clone)]
pub struct HttpComputeApi {
    base_url: String,
    timeout: Duration,
}

impl HttpComputeApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// `{base}/{segments...}`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> LifecycleResult<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| LifecycleError::api("endpoint", &self.base_url, e))?;
        url.path_segments_mut()
            .map_err(|()| LifecycleError::api("endpoint", &self.base_url, "base url cannot hold a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn is_not_found(err: &HttpError) -> bool {
    matches!(err, HttpError::Status { status: 404, .. })
}

impl ComputeApi for HttpComputeApi {
    fn list_nodes<'a>(&'a self, cluster_id: &'a str) -> BoxFuture<'a, Vec<Node>> {
        Box::pin(async move {
            let url = self.endpoint(&["clusters", cluster_id, "nodes"])?;
            Ok(get_json(url.as_str(), self.timeout).await?)
        })
    }

    fn create_node<'a>(&'a self, request: &'a CreateNodeRequest) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let url = self.endpoint(&["nodes"])?;
            let created: Created = send_json(Method::POST, url.as_str(), request, self.timeout)
                .await
                .map_err(|e| LifecycleError::api("create_node", &request.availability_zone, e))?;
            debug!(node_id = %created.node_id, "compute api accepted create");
            Ok(created.node_id)
        })
    }

    fn describe_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Option<Node>> {
        Box::pin(async move {
            let url = self.endpoint(&["nodes", node_id])?;
            match get_json(url.as_str(), self.timeout).await {
                Ok(node) => Ok(Some(node)),
                Err(e) if is_not_found(&e) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn terminate_node<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let url = self.endpoint(&["nodes", node_id])?;
            match send_empty(Method::DELETE, url.as_str(), self.timeout).await {
                Ok(()) => Ok(()),
                Err(e) if is_not_found(&e) => {
                    debug!(%node_id, "terminate: node already gone");
                    Ok(())
                }
                Err(e) => Err(LifecycleError::api("terminate_node", node_id, e)),
            }
        })
    }
}
