//! In-memory route gateway for tests

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Result, Route, RouteError, RouteGateway};

#[derive(Default)]
pub struct InMemoryGateway {
    routes: Mutex<BTreeMap<String, Route>>,
    create_failures: Mutex<VecDeque<RouteError>>,
    find_failures: Mutex<VecDeque<RouteError>>,
    delete_failures: Mutex<VecDeque<RouteError>>,
    list_failures: Mutex<VecDeque<RouteError>>,
    failing_destinations: Mutex<BTreeSet<String>>,
    duplicate_as_message: bool,
    create_returns_none: bool,
    next_id: AtomicUsize,
    pub create_calls: AtomicUsize,
    pub find_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(routes: Vec<Route>) -> Self {
        let gw = Self::new();
        {
            let mut table = gw.routes.lock().unwrap();
            for r in routes {
                table.insert(r.destination_cidr.clone(), r);
            }
        }
        gw
    }

    /// Report duplicates as opaque messages instead of the structured kind
    pub fn with_duplicate_as_message(mut self) -> Self {
        self.duplicate_as_message = true;
        self
    }

    /// Succeed on create but hand back no route object
    pub fn with_create_returns_none(mut self) -> Self {
        self.create_returns_none = true;
        self
    }

    pub fn insert(&self, route: Route) {
        self.routes
            .lock()
            .unwrap()
            .insert(route.destination_cidr.clone(), route);
    }

    pub fn fail_next_create(&self, err: RouteError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    /// Reject every create for `cidr` until the test ends
    pub fn fail_creates_for(&self, cidr: &str) {
        self.failing_destinations
            .lock()
            .unwrap()
            .insert(cidr.to_string());
    }

    pub fn fail_next_find(&self, err: RouteError) {
        self.find_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_delete(&self, err: RouteError) {
        self.delete_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_list(&self, err: RouteError) {
        self.list_failures.lock().unwrap().push_back(err);
    }

    pub fn route(&self, cidr: &str) -> Option<Route> {
        self.routes.lock().unwrap().get(cidr).cloned()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().unwrap().values().cloned().collect()
    }

    /// CIDRs passed to successful deletes, in call order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn finds(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RouteGateway for InMemoryGateway {
    async fn create_route(&self, instance_id: &str, cidr: &str) -> Result<Option<Route>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.failing_destinations.lock().unwrap().contains(cidr) {
            return Err(RouteError::Gateway(format!(
                "CreateRoute failed with 503 Service Unavailable for {}",
                cidr
            )));
        }

        let mut table = self.routes.lock().unwrap();
        if table.contains_key(cidr) {
            let message = format!("CIDR already exists for {}", cidr);
            return Err(if self.duplicate_as_message {
                RouteError::Gateway(message)
            } else {
                RouteError::DuplicateDestination {
                    cidr: cidr.to_string(),
                    message,
                }
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let route = Route::new(format!("route-{}", id), cidr, instance_id);
        table.insert(cidr.to_string(), route.clone());
        Ok(if self.create_returns_none {
            None
        } else {
            Some(route)
        })
    }

    async fn find_route(&self, cidr: &str) -> Result<Option<Route>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.find_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.route(cidr))
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.routes())
    }

    async fn delete_route(&self, cidr: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.delete_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.routes.lock().unwrap().remove(cidr);
        self.deleted.lock().unwrap().push(cidr.to_string());
        Ok(())
    }
}
