//! NetworkUnavailable condition management

use chrono::Utc;
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::node::{
    node_condition, CONDITION_NETWORK_UNAVAILABLE, CONDITION_STATUS_FALSE, CONDITION_STATUS_TRUE,
};

pub const REASON_ROUTE_CREATED: &str = "RouteCreated";
pub const REASON_NO_ROUTE_CREATED: &str = "NoRouteCreated";

/// Status string the NetworkUnavailable condition should carry
pub fn desired_status(route_created: bool) -> &'static str {
    if route_created {
        CONDITION_STATUS_FALSE
    } else {
        CONDITION_STATUS_TRUE
    }
}

/// True when the node already reports the desired network availability
pub fn network_condition_is_current(node: &Node, route_created: bool) -> bool {
    node_condition(node, CONDITION_NETWORK_UNAVAILABLE)
        .is_some_and(|c| c.status == desired_status(route_created))
}

/// Set NetworkUnavailable on `node`, refreshing both timestamps.
pub fn set_network_condition(node: &mut Node, route_created: bool) {
    let now = Time(Utc::now());
    let (reason, message) = if route_created {
        (REASON_ROUTE_CREATED, "RouteController created a route")
    } else {
        (REASON_NO_ROUTE_CREATED, "RouteController failed to create a route")
    };

    let status = node.status.get_or_insert_with(NodeStatus::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);

    let updated = NodeCondition {
        type_: CONDITION_NETWORK_UNAVAILABLE.to_string(),
        status: desired_status(route_created).to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
    };

    let current = conditions
        .iter()
        .enumerate()
        .filter(|(_, c)| c.type_ == CONDITION_NETWORK_UNAVAILABLE)
        .max_by_key(|(_, c)| c.last_heartbeat_time.as_ref().map(|t| t.0))
        .map(|(pos, _)| pos);
    match current {
        Some(pos) => conditions[pos] = updated,
        None => conditions.push(updated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::find_condition;

    #[test]
    fn test_set_condition_adds_new() {
        let mut node = Node::default();
        set_network_condition(&mut node, true);

        let c = node_condition(&node, CONDITION_NETWORK_UNAVAILABLE).unwrap();
        assert_eq!(c.status, CONDITION_STATUS_FALSE);
        assert_eq!(c.reason.as_deref(), Some(REASON_ROUTE_CREATED));
        assert!(c.last_heartbeat_time.is_some());
        assert!(c.last_transition_time.is_some());
        assert!(network_condition_is_current(&node, true));
        assert!(!network_condition_is_current(&node, false));
    }

    #[test]
    fn test_set_condition_updates_existing() {
        let mut node = Node {
            status: Some(NodeStatus {
                conditions: Some(vec![
                    NodeCondition {
                        type_: "Ready".to_string(),
                        status: CONDITION_STATUS_TRUE.to_string(),
                        ..Default::default()
                    },
                    NodeCondition {
                        type_: CONDITION_NETWORK_UNAVAILABLE.to_string(),
                        status: CONDITION_STATUS_FALSE.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        set_network_condition(&mut node, false);

        let conditions = node.status.as_ref().unwrap().conditions.as_ref().unwrap();
        assert_eq!(conditions.len(), 2);
        let c = find_condition(conditions, CONDITION_NETWORK_UNAVAILABLE).unwrap();
        assert_eq!(c.status, CONDITION_STATUS_TRUE);
        assert_eq!(c.reason.as_deref(), Some(REASON_NO_ROUTE_CREATED));
    }

    #[test]
    fn test_missing_condition_is_not_current() {
        let node = Node::default();
        assert!(!network_condition_is_current(&node, true));
        assert!(!network_condition_is_current(&node, false));
    }
}
