//! Boundary to the cloud network API that owns the VPC route table

use async_trait::async_trait;

use crate::{Result, Route};

/// Operations on the VPC route table.
///
/// Implementations must only return from `create_route` once the new route is
/// visible to `find_route`/`list_routes`. A create rejected because the
/// destination already exists should surface as
/// [`RouteError::DuplicateDestination`](crate::RouteError::DuplicateDestination).
#[async_trait]
pub trait RouteGateway: Send + Sync {
    /// Create a route from the VPC gateway to `instance_id` for `cidr`.
    /// `Ok(None)` means the call succeeded but the provider returned no route.
    async fn create_route(&self, instance_id: &str, cidr: &str) -> Result<Option<Route>>;

    async fn find_route(&self, cidr: &str) -> Result<Option<Route>>;

    async fn list_routes(&self) -> Result<Vec<Route>>;

    /// Delete the route for `cidr`; deleting a missing route is not an error.
    async fn delete_route(&self, cidr: &str) -> Result<()>;
}
