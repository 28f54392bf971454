//! Route table entries
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Synthetic name, `{route_id}-{destination_cidr}`
    pub name: String,
    pub destination_cidr: String,
    pub route_id: String,
    /// Instance the route forwards to
    pub instance_id: String,
}

impl Route {
    pub fn new(
        route_id: impl Into<String>,
        destination_cidr: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        let route_id = route_id.into();
        let destination_cidr = destination_cidr.into();
        Self {
            name: format!("{}-{}", route_id, destination_cidr),
            destination_cidr,
            route_id,
            instance_id: instance_id.into(),
        }
    }

    pub fn is_owned_by(&self, instance_id: &str) -> bool {
        self.instance_id == instance_id
    }
}

/// Find the route for `cidr` in an already fetched route list
pub fn find_by_cidr<'a>(routes: &'a [Route], cidr: &str) -> Option<&'a Route> {
    routes.iter().find(|r| r.destination_cidr == cidr)
}
