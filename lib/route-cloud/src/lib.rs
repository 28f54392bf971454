//! VPC route table client
//!
//! Implements [`vpc_route_core::RouteGateway`] over the cloud's query-action
//! HTTP API. Configuration comes from the `NET_CONF` JSON document.

pub mod client;
pub mod config;
pub mod types;

pub use client::VpcRouteClient;
pub use config::CloudConfig;
