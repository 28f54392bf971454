//! Wire types of the VPC query API

use serde::Deserialize;
use vpc_route_core::Route;

/// Destination of the default route, never managed by the controller
pub const DEFAULT_ROUTE_CIDR: &str = "0.0.0.0/0";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NextHop {
    #[serde(rename = "GatewayId", default)]
    pub gateway_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RouteSetItem {
    #[serde(rename = "RouteId", default)]
    pub route_id: String,
    #[serde(rename = "VpcId", default)]
    pub vpc_id: String,
    #[serde(rename = "RouteType", default)]
    pub route_type: String,
    #[serde(rename = "DestinationCidrBlock", default)]
    pub destination_cidr: String,
    #[serde(rename = "NextHopset", default)]
    pub next_hops: Vec<NextHop>,
}

impl RouteSetItem {
    /// The owning instance is the first next hop's gateway
    pub fn to_route(&self) -> Route {
        let instance_id = self
            .next_hops
            .first()
            .map(|h| h.gateway_id.as_str())
            .unwrap_or_default();
        Route::new(&self.route_id, &self.destination_cidr, instance_id)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DescribeRoutesResponse {
    #[serde(rename = "RequestId", default)]
    pub request_id: String,
    #[serde(rename = "RouteSet", default)]
    pub route_set: Vec<RouteSetItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRouteResponse {
    #[serde(rename = "RequestId", default)]
    pub request_id: String,
    #[serde(rename = "RouteId", default)]
    pub route_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(rename = "Code", default)]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorResponse {
    #[serde(rename = "RequestId", default)]
    pub request_id: String,
    #[serde(rename = "Error", default)]
    pub error: ApiErrorDetail,
}
