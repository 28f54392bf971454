//! Node access through the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use vpc_route_core::{Result, RouteError};

/// Edit applied to a fetched node before it is written back
pub type NodeMutator = dyn for<'a> Fn(&'a mut Node) + Send + Sync;

/// Which part of the node a patch writes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchScope {
    Spec,
    Status,
    All,
}

#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<Node>>;

    async fn list(&self) -> Result<Vec<Node>>;

    /// Fetch `name`, apply `mutate` to a copy and write the result back.
    ///
    /// The write carries the fetched resourceVersion, so a concurrent update
    /// fails with a conflict ([`RouteError::is_conflict`]) instead of being
    /// overwritten.
    async fn patch(
        &self,
        name: &str,
        mutate: &NodeMutator,
        scope: PatchScope,
    ) -> Result<()>;
}

pub struct KubeNodeSource {
    api: Api<Node>,
}

impl KubeNodeSource {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeSource for KubeNodeSource {
    async fn get(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<Node>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn patch(
        &self,
        name: &str,
        mutate: &NodeMutator,
        scope: PatchScope,
    ) -> Result<()> {
        let current = self
            .api
            .get_opt(name)
            .await?
            .ok_or_else(|| RouteError::NodeNotFound(name.to_string()))?;

        let mut updated = current.clone();
        mutate(&mut updated);
        if updated == current {
            debug!(node = %name, "Patch is a no-op, skipping");
            return Ok(());
        }

        let params = PatchParams::default();
        let mut resource_version = current.resource_version();

        if matches!(scope, PatchScope::Spec | PatchScope::All) {
            let body = json!({
                "metadata": {
                    "resourceVersion": resource_version,
                    "labels": updated.metadata.labels,
                    "annotations": updated.metadata.annotations,
                },
                "spec": updated.spec,
            });
            let patched = self.api.patch(name, &params, &Patch::Merge(&body)).await?;
            resource_version = patched.resource_version();
        }

        if matches!(scope, PatchScope::Status | PatchScope::All) {
            let body = json!({
                "metadata": { "resourceVersion": resource_version },
                "status": updated.status,
            });
            self.api
                .patch_status(name, &params, &Patch::Merge(&body))
                .await?;
        }

        debug!(node = %name, scope = ?scope, "Patched node");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NODE_PATH: &str = "/api/v1/nodes/n1";
    const STATUS_PATH: &str = "/api/v1/nodes/n1/status";

    fn node(resource_version: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                pod_cidr: Some("10.244.1.0/24".to_string()),
                ..Default::default()
            }),
            status: Some(NodeStatus::default()),
        }
    }

    fn source(server: &MockServer) -> KubeNodeSource {
        let config = kube::Config::new(server.uri().parse().unwrap());
        KubeNodeSource::new(Client::try_from(config).unwrap())
    }

    async fn mount_get(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(NODE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("5")))
            .mount(server)
            .await;
    }

    fn label(n: &mut Node) {
        n.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("route".to_string(), "ok".to_string());
    }

    #[tokio::test]
    async fn test_get_missing_node() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/nodes/ghost"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "nodes \"ghost\" not found",
                "reason": "NotFound",
                "code": 404
            })))
            .mount(&server)
            .await;

        assert!(source(&server).get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noop_patch_skipped() {
        let server = MockServer::start().await;
        mount_get(&server).await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("6")))
            .expect(0)
            .mount(&server)
            .await;

        source(&server)
            .patch("n1", &|_: &mut Node| {}, PatchScope::All)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_patch_carries_resource_version() {
        let server = MockServer::start().await;
        mount_get(&server).await;
        Mock::given(method("PATCH"))
            .and(path(STATUS_PATH))
            .and(body_partial_json(serde_json::json!({
                "metadata": {"resourceVersion": "5"},
                "status": {"phase": "Running"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("6")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(NODE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("6")))
            .expect(0)
            .mount(&server)
            .await;

        let mutate = |n: &mut Node| {
            if let Some(status) = n.status.as_mut() {
                status.phase = Some("Running".to_string());
            }
        };
        source(&server)
            .patch("n1", &mutate, PatchScope::Status)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_spec_patch_writes_metadata_and_spec() {
        let server = MockServer::start().await;
        mount_get(&server).await;
        Mock::given(method("PATCH"))
            .and(path(NODE_PATH))
            .and(body_partial_json(serde_json::json!({
                "metadata": {"resourceVersion": "5", "labels": {"route": "ok"}},
                "spec": {"podCIDR": "10.244.1.0/24"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("6")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(STATUS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("7")))
            .expect(0)
            .mount(&server)
            .await;

        source(&server)
            .patch("n1", &label, PatchScope::Spec)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_all_scope_chains_resource_version() {
        let server = MockServer::start().await;
        mount_get(&server).await;
        Mock::given(method("PATCH"))
            .and(path(NODE_PATH))
            .and(body_partial_json(serde_json::json!({
                "metadata": {"resourceVersion": "5"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("6")))
            .expect(1)
            .mount(&server)
            .await;
        // the status write follows the version returned by the spec write
        Mock::given(method("PATCH"))
            .and(path(STATUS_PATH))
            .and(body_partial_json(serde_json::json!({
                "metadata": {"resourceVersion": "6"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(node("7")))
            .expect(1)
            .mount(&server)
            .await;

        source(&server)
            .patch("n1", &label, PatchScope::All)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_conflict_surfaces_as_conflict() {
        let server = MockServer::start().await;
        mount_get(&server).await;
        Mock::given(method("PATCH"))
            .and(path(STATUS_PATH))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "the object has been modified",
                "reason": "Conflict",
                "code": 409
            })))
            .mount(&server)
            .await;

        let mutate = |n: &mut Node| {
            if let Some(status) = n.status.as_mut() {
                status.phase = Some("Running".to_string());
            }
        };
        let err = source(&server)
            .patch("n1", &mutate, PatchScope::Status)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
