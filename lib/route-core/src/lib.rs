//! Core route reconciliation building blocks
//!
//! This library provides:
//! - CIDR conflict resolution between node pod CIDRs and VPC routes
//! - The gateway boundary to the cloud route table
//! - A serialized create/delete protocol with backoff
//! - A node route cache for delete-after-node-removal
//! - Node field and condition helpers

pub mod cache;
pub mod cidr;
pub mod conditions;
pub mod error;
pub mod gateway;
pub mod node;
pub mod protocol;
pub mod route;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::NodeRouteCache;
pub use cidr::CidrVerdict;
pub use error::{Result, RouteError};
pub use gateway::RouteGateway;
pub use protocol::{BackoffConfig, EnsuredRoute, RouteProtocol};
pub use route::Route;
