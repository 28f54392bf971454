//! Node route cache
//!
//! Remembers the last route believed to belong to each node so that a delete
//! event, which arrives after the node object is gone, can still resolve the
//! destination to remove.

use crate::Route;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone)]
pub struct NodeRouteCache {
    // node name -> last known route
    routes: Arc<RwLock<HashMap<String, Route>>>,
}

impl NodeRouteCache {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn get(&self, node_name: &str) -> Option<Route> {
        let routes = self.routes.read().await;
        routes.get(node_name).cloned()
    }

    /// Store `route` for `node_name` unless an entry already exists.
    /// Returns true when the route was inserted.
    pub async fn set_if_absent(&self, node_name: &str, route: Route) -> bool {
        let mut routes = self.routes.write().await;
        if routes.contains_key(node_name) {
            return false;
        }
        debug!("Cached route {} for node {}", route.name, node_name);
        routes.insert(node_name.to_string(), route);
        true
    }

    pub async fn remove(&self, node_name: &str) -> Option<Route> {
        let mut routes = self.routes.write().await;
        let removed = routes.remove(node_name);
        if removed.is_some() {
            debug!("Removed cached route for node {}", node_name);
        }
        removed
    }

    /// Drop every entry pointing at `destination_cidr`.
    pub async fn evict_destination(&self, destination_cidr: &str) -> usize {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|_, r| r.destination_cidr != destination_cidr);
        before - routes.len()
    }

    pub async fn len(&self) -> usize {
        let routes = self.routes.read().await;
        routes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for NodeRouteCache {
    fn default() -> Self {
        Self::new()
    }
}
