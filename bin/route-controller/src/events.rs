//! Kubernetes events recorded against nodes

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client, ResourceExt};
use tracing::warn;

pub const REASON_CREATED_ROUTE: &str = "CreatedRoute";
pub const REASON_CREATE_ROUTE_FAILED: &str = "CreateRouteFailed";
pub const REASON_SYNC_ROUTE_FAILED: &str = "SyncRouteFailed";
pub const REASON_DESCRIBE_ROUTE_FAILED: &str = "DescribeRouteFailed";

const EVENT_NAMESPACE: &str = "default";
const COMPONENT: &str = "route-controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

/// Destination for node events. Failures to record are never surfaced.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, node: &Node, type_: EventType, reason: &str, message: &str);
}

pub struct KubeEventSink {
    client: Client,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn emit(&self, node: &Node, type_: EventType, reason: &str, message: &str) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), EVENT_NAMESPACE);
        let name = node.name_any();
        let time = Time(Utc::now());

        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", name)),
                namespace: Some(EVENT_NAMESPACE.to_string()),
                ..Default::default()
            },
            type_: Some(type_.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: ObjectReference {
                kind: Some("Node".to_string()),
                api_version: Some("v1".to_string()),
                name: Some(name.clone()),
                uid: node.uid(),
                ..Default::default()
            },
            source: Some(EventSource {
                component: Some(COMPONENT.to_string()),
                ..Default::default()
            }),
            first_timestamp: Some(time.clone()),
            last_timestamp: Some(time),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!(node = %name, reason = %reason, error = %e, "Failed to record event");
        }
    }
}
