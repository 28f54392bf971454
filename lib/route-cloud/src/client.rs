//! Route gateway over the VPC query-action HTTP API

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use vpc_route_core::{Result, Route, RouteError, RouteGateway};

use crate::config::CloudConfig;
use crate::types::{
    ApiErrorResponse, CreateRouteResponse, DescribeRoutesResponse, RouteSetItem,
    DEFAULT_ROUTE_CIDR,
};

const API_VERSION: &str = "2016-03-04";
const ROUTE_TYPE_HOST: &str = "Host";
const USER_AGENT: &str = "vpc-route-controller";

pub struct VpcRouteClient {
    config: CloudConfig,
    http: reqwest::Client,
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RouteError::InvalidConfiguration(format!("invalid header value: {}", e)))
}

fn default_headers(config: &CloudConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert("x-producttag-source", HeaderValue::from_static("all"));
    if let Some(token) = config.security_token.as_deref().filter(|t| !t.is_empty()) {
        headers.insert("x-ksc-security-token", header_value(token)?);
    }
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            RouteError::InvalidConfiguration(format!("invalid header name {}: {}", name, e))
        })?;
        headers.insert(name, header_value(value)?);
    }
    Ok(headers)
}

/// Turn a non-2xx response into a gateway error, keeping the provider's
/// message so duplicate destinations can be recognised.
fn api_error(action: &str, status: StatusCode, body: &str) -> RouteError {
    let detail = match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(resp) if !resp.error.code.is_empty() || !resp.error.message.is_empty() => {
            format!("{}: {}", resp.error.code, resp.error.message)
        }
        _ => body.to_string(),
    };
    RouteError::Gateway(format!("{} failed with {}: {}", action, status, detail))
}

impl VpcRouteClient {
    pub fn new(config: CloudConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(USER_AGENT)
            .default_headers(default_headers(&config)?)
            .build()?;

        Ok(Self { config, http })
    }

    async fn send(&self, method: Method, action: &str, params: &[(&str, &str)]) -> Result<String> {
        let mut query = vec![("Action", action), ("Version", API_VERSION)];
        query.extend_from_slice(params);

        debug!(action = %action, endpoint = %self.config.network_endpoint, "Calling VPC API");

        let response = self
            .http
            .request(method, &self.config.network_endpoint)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(action, status, &body));
        }
        Ok(body)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let body = self.send(method, action, params).await?;
        serde_json::from_str(&body).map_err(|e| {
            RouteError::Gateway(format!("{} returned an unreadable body: {}", action, e))
        })
    }

    /// DescribeRoutes for host routes of the VPC, optionally narrowed to one destination
    async fn describe(&self, cidr: Option<&str>) -> Result<Vec<RouteSetItem>> {
        let mut params = vec![
            ("Filter.1.Name", "vpc-id"),
            ("Filter.1.Value.1", self.config.vpc_id.as_str()),
            ("Filter.2.Name", "route-type"),
            ("Filter.2.Value.1", ROUTE_TYPE_HOST),
        ];
        if let Some(cidr) = cidr {
            params.push(("Filter.3.Name", "destination-cidr-block"));
            params.push(("Filter.3.Value.1", cidr));
        }
        let resp: DescribeRoutesResponse =
            self.call(Method::GET, "DescribeRoutes", &params).await?;
        Ok(resp.route_set)
    }

    async fn describe_by_id(&self, route_id: &str) -> Result<Option<RouteSetItem>> {
        let resp: DescribeRoutesResponse = self
            .call(Method::GET, "DescribeRoutes", &[("RouteId.1", route_id)])
            .await?;
        Ok(resp
            .route_set
            .into_iter()
            .find(|item| item.route_id == route_id))
    }

    /// Poll until `route_id` shows up in DescribeRoutes or the wait times out.
    async fn wait_for_route(&self, route_id: &str, cidr: &str) -> Result<Route> {
        let interval = self.config.wait_interval();
        let deadline = Instant::now() + self.config.wait_timeout();

        loop {
            match self.describe_by_id(route_id).await {
                Ok(Some(item)) => return Ok(item.to_route()),
                Ok(None) => debug!(route_id = %route_id, "Route not visible yet"),
                Err(e) => debug!(route_id = %route_id, error = %e, "Describe failed while waiting"),
            }

            if Instant::now() + interval > deadline {
                return Err(RouteError::NotVisible(cidr.to_string()));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl RouteGateway for VpcRouteClient {
    async fn create_route(&self, instance_id: &str, cidr: &str) -> Result<Option<Route>> {
        info!(
            vpc_id = %self.config.vpc_id,
            instance_id = %instance_id,
            cidr = %cidr,
            "Creating route"
        );

        let params = [
            ("VpcId", self.config.vpc_id.as_str()),
            ("RouteType", ROUTE_TYPE_HOST),
            ("InstanceId", instance_id),
            ("DestinationCidrBlock", cidr),
        ];
        let created: CreateRouteResponse = match self
            .call(Method::POST, "CreateRoute", &params)
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_duplicate_destination() => {
                return Err(RouteError::DuplicateDestination {
                    cidr: cidr.to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        if created.route_id.is_empty() {
            warn!(cidr = %cidr, request_id = %created.request_id, "CreateRoute returned no route id");
            return Ok(None);
        }

        self.wait_for_route(&created.route_id, cidr).await.map(Some)
    }

    async fn find_route(&self, cidr: &str) -> Result<Option<Route>> {
        let items = self.describe(Some(cidr)).await?;
        Ok(items
            .iter()
            .find(|item| item.destination_cidr == cidr)
            .map(RouteSetItem::to_route))
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        let items = self.describe(None).await?;
        Ok(items
            .iter()
            .filter(|item| item.destination_cidr != DEFAULT_ROUTE_CIDR)
            .map(RouteSetItem::to_route)
            .collect())
    }

    async fn delete_route(&self, cidr: &str) -> Result<()> {
        let Some(route) = self.find_route(cidr).await? else {
            debug!(cidr = %cidr, "No route to delete");
            return Ok(());
        };

        info!(
            vpc_id = %self.config.vpc_id,
            route_id = %route.route_id,
            cidr = %cidr,
            "Deleting route"
        );
        self.send(Method::DELETE, "DeleteRoute", &[("RouteId", route.route_id.as_str())])
            .await?;
        Ok(())
    }
}
