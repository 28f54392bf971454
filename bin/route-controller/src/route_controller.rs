//! Node route reconciliation
//!
//! Two producers drive the reconciler: a node watcher that feeds admitted
//! node names to a single worker, and a timer that runs a full cluster sync.
//! Both reach the cloud only through the shared [`RouteProtocol`], whose lock
//! orders every create and delete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt};
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use vpc_route_core::cidr::verdict;
use vpc_route_core::conditions::{network_condition_is_current, set_network_condition};
use vpc_route_core::node::{has_exclude_label, instance_id, ipv4_pod_cidr, skip_reason};
use vpc_route_core::{EnsuredRoute, NodeRouteCache, Result, Route, RouteError, RouteProtocol};

use crate::cluster::{NodeSource, PatchScope};
use crate::events::{
    EventSink, EventType, REASON_CREATED_ROUTE, REASON_CREATE_ROUTE_FAILED,
    REASON_DESCRIBE_ROUTE_FAILED, REASON_SYNC_ROUTE_FAILED,
};
use crate::metrics::{RouteMetrics, VERB_CREATE, VERB_DELETE, VERB_RECONCILE};
use crate::predicate::NodeEventFilter;

pub const MIN_RECONCILE_PERIOD: Duration = Duration::from_secs(60);
const NETWORK_CONDITION_MAX_RETRIES: usize = 3;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// When false every reconcile is a no-op
    pub configure_routes: bool,
    pub reconcile_period: Duration,
    /// Deadline for one node reconcile or one full sync pass
    pub reconcile_timeout: Duration,
    pub requeue_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            configure_routes: true,
            reconcile_period: Duration::from_secs(300),
            reconcile_timeout: Duration::from_secs(120),
            requeue_delay: Duration::from_secs(15),
        }
    }
}

pub struct RouteReconciler {
    protocol: Arc<RouteProtocol>,
    cache: NodeRouteCache,
    nodes: Arc<dyn NodeSource>,
    events: Arc<dyn EventSink>,
    metrics: Arc<RouteMetrics>,
    config: ControllerConfig,
}

impl RouteReconciler {
    pub fn new(
        protocol: Arc<RouteProtocol>,
        cache: NodeRouteCache,
        nodes: Arc<dyn NodeSource>,
        events: Arc<dyn EventSink>,
        metrics: Arc<RouteMetrics>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            protocol,
            cache,
            nodes,
            events,
            metrics,
            config,
        }
    }

    pub fn cache(&self) -> &NodeRouteCache {
        &self.cache
    }

    /// Reconcile one node by name.
    ///
    /// Only a failed delete for a vanished node or a failed node lookup is
    /// returned as an error; sync failures are recorded on the node instead
    /// and left to the periodic sync.
    #[instrument(skip(self), fields(node = %name))]
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        if !self.config.configure_routes {
            return Ok(());
        }

        let Some(node) = self.nodes.get(name).await? else {
            return self.delete_route_for_removed_node(name).await;
        };

        if let Err(e) = self.sync_cloud_route(&node, None).await {
            error!(node = %name, error = %e, "Add route for node failed");
            self.events
                .emit(
                    &node,
                    EventType::Warning,
                    REASON_SYNC_ROUTE_FAILED,
                    "sync cloud route failed",
                )
                .await;
        }
        Ok(())
    }

    async fn delete_route_for_removed_node(&self, name: &str) -> Result<()> {
        let Some(route) = self.cache.get(name).await else {
            debug!(node = %name, "Node is gone and has no cached route");
            return Ok(());
        };

        let start = Instant::now();
        let result = self.protocol.delete_route(&route.destination_cidr).await;
        self.metrics.observe(VERB_DELETE, start);

        match result {
            Ok(()) => {
                info!(
                    node = %name,
                    route = %route.name,
                    cidr = %route.destination_cidr,
                    "Deleted route for removed node"
                );
                self.cache.remove(name).await;
                Ok(())
            }
            Err(e) => {
                error!(
                    node = %name,
                    cidr = %route.destination_cidr,
                    error = %e,
                    "Failed to delete route for removed node"
                );
                Err(e)
            }
        }
    }

    /// Make sure the node's route exists and reflect the outcome in its
    /// NetworkUnavailable condition.
    ///
    /// `cached` is a route list already fetched by the caller; it saves a
    /// lookup per node during the periodic sync.
    pub async fn sync_cloud_route(&self, node: &Node, cached: Option<&[Route]>) -> Result<()> {
        if skip_reason(node).is_some() {
            return Ok(());
        }

        let name = node.name_any();
        let cidr = match ipv4_pod_cidr(node) {
            Ok(Some(cidr)) => cidr.to_string(),
            Ok(None) => {
                warn!(node = %name, "Node has no IPv4 pod CIDR, skip creating route");
                self.mark_network_unavailable(node).await;
                return Ok(());
            }
            Err(e) => {
                warn!(node = %name, error = %e, "Cannot parse pod CIDR, skip creating route");
                self.mark_network_unavailable(node).await;
                return Err(e);
            }
        };

        match self.add_route_for_node(node, &cidr, cached).await {
            Ok(()) => self.update_network_condition(node, true).await,
            Err(e) => {
                self.mark_network_unavailable(node).await;
                Err(e)
            }
        }
    }

    async fn mark_network_unavailable(&self, node: &Node) {
        if let Err(e) = self.update_network_condition(node, false).await {
            error!(node = %node.name_any(), error = %e, "Update network condition failed");
        }
    }

    async fn add_route_for_node(
        &self,
        node: &Node,
        cidr: &str,
        cached: Option<&[Route]>,
    ) -> Result<()> {
        let name = node.name_any();
        let Some((instance, source)) = instance_id(node) else {
            return Err(RouteError::InstanceIdUnresolved(name));
        };
        debug!(node = %name, instance_id = %instance, source = ?source, "Resolved instance id");

        let start = Instant::now();
        match self.protocol.ensure_route(&instance, cidr, cached).await {
            Ok(EnsuredRoute::Existing(route)) => {
                debug!(node = %name, route = %route.name, "Route already in place");
                self.cache.set_if_absent(&name, route).await;
                Ok(())
            }
            Ok(EnsuredRoute::Created(route)) => {
                self.metrics.observe(VERB_CREATE, start);
                info!(node = %name, cidr = %cidr, route_id = %route.route_id, "Created route");
                self.events
                    .emit(
                        node,
                        EventType::Normal,
                        REASON_CREATED_ROUTE,
                        &format!("Created route for {} -> {} successfully", name, cidr),
                    )
                    .await;
                self.cache.set_if_absent(&name, route).await;
                Ok(())
            }
            Err(e @ RouteError::Lookup { .. }) => {
                error!(node = %name, instance_id = %instance, error = %e, "Describe route failed");
                self.events
                    .emit(
                        node,
                        EventType::Warning,
                        REASON_DESCRIBE_ROUTE_FAILED,
                        &format!("Describe Route Failed for {} reason: {}", cidr, e),
                    )
                    .await;
                Err(e)
            }
            Err(e) => {
                self.metrics.observe(VERB_CREATE, start);
                error!(node = %name, instance_id = %instance, error = %e, "Create route failed");
                self.events
                    .emit(
                        node,
                        EventType::Warning,
                        REASON_CREATE_ROUTE_FAILED,
                        &format!("Error creating route entry : {}", e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Set NetworkUnavailable, retrying on optimistic-concurrency conflicts.
    pub async fn update_network_condition(&self, node: &Node, route_created: bool) -> Result<()> {
        let name = node.name_any();
        if network_condition_is_current(node, route_created) {
            debug!(node = %name, route_created, "Network condition already set");
            return Ok(());
        }

        info!(node = %name, route_created, "Patching node network condition");
        let mutate = move |n: &mut Node| set_network_condition(n, route_created);

        let mut last_err = None;
        for attempt in 1..=NETWORK_CONDITION_MAX_RETRIES {
            match self.nodes.patch(&name, &mutate, PatchScope::Status).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    info!(node = %name, attempt, error = %e, "Conflict updating node, retrying");
                    last_err = Some(e);
                }
                Err(e) => {
                    error!(node = %name, error = %e, "Error updating node");
                    return Err(e);
                }
            }
        }

        error!(node = %name, "Giving up updating node after repeated conflicts");
        Err(last_err
            .unwrap_or_else(|| RouteError::Internal(format!("no patch attempt for {}", name))))
    }

    /// One full pass: drop conflicting routes, then sync every node.
    #[instrument(skip(self))]
    pub async fn reconcile_for_cluster(&self) -> Result<()> {
        if !self.config.configure_routes {
            return Ok(());
        }

        let start = Instant::now();
        let result = self.sync_routes().await;
        self.metrics.observe(VERB_RECONCILE, start);

        match &result {
            Ok(()) => info!("Route sync finished"),
            Err(e) => error!(error = %e, "Route sync aborted"),
        }
        result
    }

    /// Each node gets its own deadline, so nodes stuck in create backoff
    /// cannot use up the time of the nodes after them. Listing and conflict
    /// deletion share one deadline and abort the pass when it expires.
    async fn sync_routes(&self) -> Result<()> {
        let deadline = self.config.reconcile_timeout;
        let (nodes, routes) = tokio::time::timeout(deadline, self.delete_conflicting_routes())
            .await
            .map_err(|_| RouteError::Internal("listing nodes and routes timed out".to_string()))??;

        for node in &nodes {
            let result =
                tokio::time::timeout(deadline, self.sync_cloud_route(node, Some(&routes))).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(node = %node.name_any(), error = %e, "Route sync for node failed");
                }
                Err(_) => {
                    warn!(node = %node.name_any(), "Route sync for node timed out");
                }
            }
        }
        Ok(())
    }

    /// List nodes and routes, then delete every route that conflicts with a
    /// node. Returns the nodes and the routes that survived.
    async fn delete_conflicting_routes(&self) -> Result<(Vec<Node>, Vec<Route>)> {
        let nodes: Vec<Node> = self
            .nodes
            .list()
            .await?
            .into_iter()
            .filter(|n| !has_exclude_label(n))
            .collect();

        let mut routes = self.protocol.list_routes().await?;

        let conflicting: Vec<Route> = routes
            .iter()
            .filter(|r| conflicts_with_nodes(r, &nodes))
            .cloned()
            .collect();

        for route in conflicting {
            if let Err(e) = self.protocol.delete_route(&route.destination_cidr).await {
                error!(
                    route = %route.name,
                    cidr = %route.destination_cidr,
                    error = %e,
                    "Could not delete conflicting route"
                );
                continue;
            }
            info!(route = %route.name, cidr = %route.destination_cidr, "Deleted conflicting route");
            routes.retain(|r| r.destination_cidr != route.destination_cidr);
            self.cache.evict_destination(&route.destination_cidr).await;
        }

        Ok((nodes, routes))
    }

    /// Run the full sync now and then every period, until the task is dropped.
    pub async fn run_periodic(self: Arc<Self>) {
        let period = self.config.reconcile_period.max(MIN_RECONCILE_PERIOD);
        info!(period_secs = period.as_secs(), "Starting periodic route sync");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            // failures are logged by reconcile_for_cluster; the next tick retries
            let _ = self.reconcile_for_cluster().await;
        }
    }

    /// Drain node names one at a time; failed reconciles come back after the
    /// requeue delay.
    pub async fn run_worker(
        self: Arc<Self>,
        mut queue: UnboundedReceiver<String>,
        requeue: UnboundedSender<String>,
    ) {
        while let Some(name) = queue.recv().await {
            let failed =
                match tokio::time::timeout(self.config.reconcile_timeout, self.reconcile(&name))
                    .await
                {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        warn!(node = %name, error = %e, "Reconcile failed, requeueing");
                        true
                    }
                    Err(_) => {
                        warn!(node = %name, "Reconcile timed out, requeueing");
                        true
                    }
                };

            if failed {
                let requeue = requeue.clone();
                let delay = self.config.requeue_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = requeue.send(name);
                });
            }
        }
    }
}

/// A route conflicts when any node's CIDR contains it, or equals it while
/// the route forwards to a different instance.
fn conflicts_with_nodes(route: &Route, nodes: &[Node]) -> bool {
    for node in nodes {
        let name = node.name_any();
        let cidr = match ipv4_pod_cidr(node) {
            Ok(Some(cidr)) => cidr,
            Ok(None) => continue,
            Err(e) => {
                error!(node = %name, error = %e, "Cannot get IPv4 CIDR from node");
                continue;
            }
        };

        let instance = instance_id(node).map(|(id, _)| id);
        match verdict(Some(&cidr), route, instance.as_deref()) {
            Ok(v) if v.is_conflict() => {
                warn!(
                    node = %name,
                    node_cidr = %cidr,
                    route = %route.name,
                    verdict = ?v,
                    "Route conflicts with node"
                );
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                error!(node = %name, route = %route.name, error = %e, "Cannot evaluate route conflict");
            }
        }
    }
    false
}

/// Last seen node objects, used to pair watch updates with their previous
/// state. A node missing from a relist is treated as deleted.
#[derive(Default)]
struct NodeWatchState {
    seen: HashMap<String, Node>,
    relisted: HashSet<String>,
}

impl NodeWatchState {
    /// Fold one watch event into the state and return the node names to queue.
    fn handle(&mut self, filter: &NodeEventFilter, event: Event<Node>) -> Vec<String> {
        match event {
            Event::Apply(node) | Event::InitApply(node) => {
                let name = node.name_any();
                self.relisted.insert(name.clone());
                let admit = match self.seen.get(&name) {
                    Some(old) => filter.admit_update(old, &node),
                    None => true,
                };
                self.seen.insert(name.clone(), node);
                if admit {
                    debug!(node = %name, "Queueing node");
                    vec![name]
                } else {
                    Vec::new()
                }
            }
            Event::Delete(node) => {
                let name = node.name_any();
                self.seen.remove(&name);
                info!(node = %name, "Node deleted");
                vec![name]
            }
            Event::Init => {
                self.relisted.clear();
                Vec::new()
            }
            Event::InitDone => {
                let gone: Vec<String> = self
                    .seen
                    .keys()
                    .filter(|name| !self.relisted.contains(*name))
                    .cloned()
                    .collect();
                for name in &gone {
                    self.seen.remove(name);
                    info!(node = %name, "Node vanished during relist");
                }
                debug!(nodes = self.seen.len(), "Node watch synced");
                gone
            }
        }
    }
}

/// Watch nodes and queue the names of those that need a reconcile.
pub async fn watch_nodes(
    api: Api<Node>,
    filter: NodeEventFilter,
    queue: UnboundedSender<String>,
) -> anyhow::Result<()> {
    let mut state = NodeWatchState::default();
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => {
                for name in state.handle(&filter, event) {
                    queue.send(name)?;
                }
            }
            Err(e) => warn!(error = %e, "Node watch error"),
        }
    }
    Ok(())
}
