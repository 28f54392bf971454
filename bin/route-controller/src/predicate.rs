//! Filters node update events down to the ones that can change a route

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::info;

use vpc_route_core::node::{has_instance_annotation, ANNOTATION_INSTANCE_ID, ANNOTATION_INSTANCE_UUID};

#[derive(Clone, Copy, Debug)]
pub struct NodeEventFilter {
    /// Suppress updates until the node carries an instance id annotation
    pub require_annotation: bool,
}

impl NodeEventFilter {
    pub fn new(require_annotation: bool) -> Self {
        Self { require_annotation }
    }

    /// Decide whether an update from `old` to `new` warrants a reconcile.
    /// Creates and deletes are not filtered.
    pub fn admit_update(&self, old: &Node, new: &Node) -> bool {
        let name = new.name_any();

        if self.require_annotation {
            if !has_instance_annotation(new) {
                return false;
            }
            let old_annotations = old.annotations();
            for key in [ANNOTATION_INSTANCE_UUID, ANNOTATION_INSTANCE_ID] {
                if let Some(id) = new.annotations().get(key) {
                    if !old_annotations.contains_key(key) {
                        info!(node = %name, annotation = %key, instance_id = %id, "Instance id annotation appeared");
                        return true;
                    }
                }
            }
        }

        if old.metadata.uid != new.metadata.uid {
            info!(node = %name, old = ?old.metadata.uid, new = ?new.metadata.uid, "Node UID changed");
            return true;
        }

        let old_spec = old.spec.clone().unwrap_or_default();
        let new_spec = new.spec.clone().unwrap_or_default();
        if old_spec.pod_cidr != new_spec.pod_cidr {
            info!(node = %name, old = ?old_spec.pod_cidr, new = ?new_spec.pod_cidr, "Pod CIDR changed");
            return true;
        }
        if old_spec.provider_id != new_spec.provider_id {
            info!(node = %name, old = ?old_spec.provider_id, new = ?new_spec.provider_id, "Provider id changed");
            return true;
        }
        if old_spec.pod_cidrs != new_spec.pod_cidrs {
            info!(node = %name, old = ?old_spec.pod_cidrs, new = ?new_spec.pod_cidrs, "Pod CIDRs changed");
            return true;
        }

        false
    }
}
