//! Accessors for the Node fields the route controller depends on

use k8s_openapi::api::core::v1::{Node, NodeCondition};
use kube::ResourceExt;
use ipnetwork::{IpNetwork, Ipv4Network};
use std::str::FromStr;
use tracing::info;

use crate::cidr::parse_network;
use crate::{Result, RouteError};

/// Instance id annotation written by the legacy node agent
pub const ANNOTATION_INSTANCE_UUID: &str = "appengine.sdns.ksyun.com/instance-uuid";
/// Instance id annotation written by the current node agent
pub const ANNOTATION_INSTANCE_ID: &str = "kce.sdns.ksyun.com/instanceId";

pub const LABEL_EXCLUDE_NODE: &str = "service.ksyun.com/exclude-node";
pub const LABEL_EXCLUDE_NODE_DEPRECATED: &str = "service.beta.kubernetes.io/exclude-node";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_NETWORK_UNAVAILABLE: &str = "NetworkUnavailable";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";
pub const CONDITION_STATUS_UNKNOWN: &str = "Unknown";

/// Where a node's instance id was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceIdSource {
    LegacyAnnotation,
    Annotation,
    ProviderId,
}

/// Resolve the cloud instance id of a node.
///
/// Precedence: legacy annotation, current annotation, then `spec.providerID`.
pub fn instance_id(node: &Node) -> Option<(String, InstanceIdSource)> {
    let annotations = node.annotations();
    if let Some(id) = annotations.get(ANNOTATION_INSTANCE_UUID) {
        return Some((id.clone(), InstanceIdSource::LegacyAnnotation));
    }
    if let Some(id) = annotations.get(ANNOTATION_INSTANCE_ID) {
        return Some((id.clone(), InstanceIdSource::Annotation));
    }
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .filter(|id| !id.is_empty())
        .map(|id| (id.to_string(), InstanceIdSource::ProviderId))
}

pub fn has_instance_annotation(node: &Node) -> bool {
    let annotations = node.annotations();
    annotations.contains_key(ANNOTATION_INSTANCE_UUID)
        || annotations.contains_key(ANNOTATION_INSTANCE_ID)
}

pub fn has_exclude_label(node: &Node) -> bool {
    let labels = node.labels();
    labels.contains_key(LABEL_EXCLUDE_NODE_DEPRECATED) || labels.contains_key(LABEL_EXCLUDE_NODE)
}

/// Pod CIDRs in evaluation order: `spec.podCIDRs` then the legacy `spec.podCIDR`
pub fn pod_cidrs(node: &Node) -> Vec<&str> {
    let Some(spec) = node.spec.as_ref() else {
        return Vec::new();
    };
    spec.pod_cidrs
        .iter()
        .flatten()
        .map(String::as_str)
        .chain(spec.pod_cidr.as_deref())
        .filter(|c| !c.is_empty())
        .collect()
}

/// First IPv4 pod CIDR of the node, normalized to its network address.
///
/// Any unparsable entry is an error; a node with only IPv6 CIDRs yields `None`.
pub fn ipv4_pod_cidr(node: &Node) -> Result<Option<Ipv4Network>> {
    for cidr in pod_cidrs(node) {
        let parsed = IpNetwork::from_str(cidr).map_err(|_| {
            RouteError::InvalidCidr(format!("invalid pod cidr on node spec: {}", cidr))
        })?;
        if let IpNetwork::V4(_) = parsed {
            return parse_network(cidr).map(Some);
        }
    }
    Ok(None)
}

/// Most recent condition of `type_`, by heartbeat time
pub fn find_condition<'a>(conditions: &'a [NodeCondition], type_: &str) -> Option<&'a NodeCondition> {
    conditions
        .iter()
        .filter(|c| c.type_ == type_)
        .max_by_key(|c| c.last_heartbeat_time.as_ref().map(|t| t.0))
}

pub fn node_condition<'a>(node: &'a Node, type_: &str) -> Option<&'a NodeCondition> {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .and_then(|c| find_condition(c, type_))
}

pub fn is_being_deleted(node: &Node) -> bool {
    node.metadata.deletion_timestamp.is_some()
}

/// Why a node gets no route
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Excluded,
    ReadyUnknown,
    Deleting,
}

/// Decide whether the node should carry a route.
///
/// Only an explicit `Ready=Unknown` skips the node; `Ready=False` does not.
pub fn skip_reason(node: &Node) -> Option<SkipReason> {
    let name = node.name_any();
    if has_exclude_label(node) {
        info!("node {} has exclude label, skip creating route", name);
        return Some(SkipReason::Excluded);
    }
    if node_condition(node, CONDITION_READY).is_some_and(|c| c.status == CONDITION_STATUS_UNKNOWN) {
        info!("node {} is in unknown status, skip creating route", name);
        return Some(SkipReason::ReadyUnknown);
    }
    if is_being_deleted(node) {
        info!("node {} has deletionTimestamp, skip creating route", name);
        return Some(SkipReason::Deleting);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn node_with(spec: NodeSpec, annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(spec),
            status: None,
        }
    }

    fn condition(type_: &str, status: &str, heartbeat_secs: i64) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_heartbeat_time: Some(Time(Utc.timestamp_opt(heartbeat_secs, 0).unwrap())),
            ..Default::default()
        }
    }

    #[test]
    fn test_instance_id_precedence() {
        let spec = NodeSpec {
            provider_id: Some("i-provider".to_string()),
            ..Default::default()
        };
        let node = node_with(
            spec.clone(),
            &[(ANNOTATION_INSTANCE_ID, "i-current"), (ANNOTATION_INSTANCE_UUID, "i-legacy")],
        );
        assert_eq!(
            instance_id(&node),
            Some(("i-legacy".to_string(), InstanceIdSource::LegacyAnnotation))
        );

        let node = node_with(spec.clone(), &[(ANNOTATION_INSTANCE_ID, "i-current")]);
        assert_eq!(
            instance_id(&node),
            Some(("i-current".to_string(), InstanceIdSource::Annotation))
        );

        let node = node_with(spec, &[]);
        assert_eq!(
            instance_id(&node),
            Some(("i-provider".to_string(), InstanceIdSource::ProviderId))
        );

        let node = node_with(NodeSpec::default(), &[]);
        assert_eq!(instance_id(&node), None);
    }

    #[test]
    fn test_ipv4_pod_cidr_prefers_list() {
        let node = node_with(
            NodeSpec {
                pod_cidr: Some("10.244.9.0/24".to_string()),
                pod_cidrs: Some(vec!["fd00::/64".to_string(), "10.244.1.0/24".to_string()]),
                ..Default::default()
            },
            &[],
        );
        assert_eq!(ipv4_pod_cidr(&node).unwrap().unwrap().to_string(), "10.244.1.0/24");
    }

    #[test]
    fn test_ipv4_pod_cidr_legacy_field() {
        let node = node_with(
            NodeSpec {
                pod_cidr: Some("10.244.3.0/24".to_string()),
                ..Default::default()
            },
            &[],
        );
        assert_eq!(ipv4_pod_cidr(&node).unwrap().unwrap().to_string(), "10.244.3.0/24");
    }

    #[test]
    fn test_ipv4_pod_cidr_missing_or_invalid() {
        let node = node_with(NodeSpec::default(), &[]);
        assert!(ipv4_pod_cidr(&node).unwrap().is_none());

        let node = node_with(
            NodeSpec {
                pod_cidrs: Some(vec!["fd00::/64".to_string()]),
                ..Default::default()
            },
            &[],
        );
        assert!(ipv4_pod_cidr(&node).unwrap().is_none());

        let node = node_with(
            NodeSpec {
                pod_cidr: Some("10.244.300.0/24".to_string()),
                ..Default::default()
            },
            &[],
        );
        assert!(ipv4_pod_cidr(&node).is_err());
    }

    #[test]
    fn test_find_condition_latest_heartbeat() {
        let conditions = vec![
            condition(CONDITION_READY, CONDITION_STATUS_TRUE, 100),
            condition(CONDITION_READY, CONDITION_STATUS_UNKNOWN, 200),
        ];
        assert_eq!(
            find_condition(&conditions, CONDITION_READY).unwrap().status,
            CONDITION_STATUS_UNKNOWN
        );
        assert!(find_condition(&conditions, CONDITION_NETWORK_UNAVAILABLE).is_none());
    }

    #[test]
    fn test_skip_reason() {
        let mut node = node_with(NodeSpec::default(), &[]);
        assert_eq!(skip_reason(&node), None);

        node.status = Some(NodeStatus {
            conditions: Some(vec![condition(CONDITION_READY, CONDITION_STATUS_FALSE, 1)]),
            ..Default::default()
        });
        assert_eq!(skip_reason(&node), None);

        node.status = Some(NodeStatus {
            conditions: Some(vec![condition(CONDITION_READY, CONDITION_STATUS_UNKNOWN, 1)]),
            ..Default::default()
        });
        assert_eq!(skip_reason(&node), Some(SkipReason::ReadyUnknown));

        node.status = None;
        node.metadata.labels = Some(BTreeMap::from([(
            LABEL_EXCLUDE_NODE.to_string(),
            "true".to_string(),
        )]));
        assert_eq!(skip_reason(&node), Some(SkipReason::Excluded));

        node.metadata.labels = None;
        node.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert_eq!(skip_reason(&node), Some(SkipReason::Deleting));
    }
}
