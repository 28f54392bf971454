//! CIDR conflict resolution between node pod CIDRs and route destinations
//!
//! A route conflicts with a node when the node's pod CIDR strictly contains
//! the route's destination, or when both are equal but the route forwards to
//! an instance other than the node's.

use std::str::FromStr;

use ipnetwork::Ipv4Network;

use crate::{Result, Route, RouteError};

/// Outcome of comparing a node pod CIDR with a route destination
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CidrVerdict {
    Disjoint,
    EqualSameOwner,
    EqualDifferentOwner,
    Contains,
}

impl CidrVerdict {
    pub fn is_conflict(&self) -> bool {
        matches!(self, CidrVerdict::EqualDifferentOwner | CidrVerdict::Contains)
    }
}

/// Compare a node CIDR against a route destination, returning `(equal, contains)`.
///
/// A node without a CIDR overlaps every route and reports `(true, true)`.
/// Identical string forms report `(true, false)`; ownership is left to the
/// caller. Otherwise the result is `(false, true)` when both the route's
/// network and broadcast addresses fall inside the node CIDR, and
/// `(false, false)` when either falls outside.
pub fn evaluate(node_cidr: Option<&Ipv4Network>, route_cidr: &str) -> Result<(bool, bool)> {
    let Some(outside) = node_cidr else {
        return Ok((true, true));
    };

    let inside = Ipv4Network::from_str(route_cidr).map_err(|e| {
        RouteError::InvalidCidr(format!("ignoring route {}, unparsable CIDR: {}", route_cidr, e))
    })?;

    if outside.to_string() == route_cidr {
        return Ok((true, false));
    }

    let first = inside.network();
    let last = std::net::Ipv4Addr::from(u32::from(first) | !u32::from(inside.mask()));
    if !outside.contains(first) || !outside.contains(last) {
        return Ok((false, false));
    }
    Ok((false, true))
}

/// Classify a route against a node's CIDR and resolved instance id
pub fn verdict(
    node_cidr: Option<&Ipv4Network>,
    route: &Route,
    node_instance_id: Option<&str>,
) -> Result<CidrVerdict> {
    let (equal, contains) = evaluate(node_cidr, &route.destination_cidr)?;
    Ok(if contains {
        CidrVerdict::Contains
    } else if equal && Some(route.instance_id.as_str()) == node_instance_id {
        CidrVerdict::EqualSameOwner
    } else if equal {
        CidrVerdict::EqualDifferentOwner
    } else {
        CidrVerdict::Disjoint
    })
}

/// Parse a CIDR string into its canonical network form (host bits cleared)
pub fn parse_network(cidr: &str) -> Result<Ipv4Network> {
    let net = Ipv4Network::from_str(cidr)
        .map_err(|e| RouteError::InvalidCidr(format!("{}: {}", cidr, e)))?;
    Ipv4Network::new(net.network(), net.prefix())
        .map_err(|e| RouteError::InvalidCidr(format!("{}: {}", cidr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Network {
        parse_network(s).unwrap()
    }

    #[test]
    fn test_missing_node_cidr_overlaps_everything() {
        assert_eq!(evaluate(None, "10.0.0.0/8").unwrap(), (true, true));
        assert_eq!(evaluate(None, "not-a-cidr").unwrap(), (true, true));
    }

    #[test]
    fn test_equal_cidr() {
        let node = net("10.244.1.0/24");
        assert_eq!(evaluate(Some(&node), "10.244.1.0/24").unwrap(), (true, false));
    }

    #[test]
    fn test_route_inside_node_cidr() {
        let node = net("10.244.0.0/16");
        assert_eq!(evaluate(Some(&node), "10.244.1.0/24").unwrap(), (false, true));
        assert_eq!(evaluate(Some(&node), "10.244.255.128/25").unwrap(), (false, true));

        let route = Route::new("r-1", "10.244.1.0/24", "i-a");
        assert_eq!(
            verdict(Some(&node), &route, Some("i-a")).unwrap(),
            CidrVerdict::Contains
        );
    }

    #[test]
    fn test_disjoint_and_wider_routes() {
        let node = net("10.244.1.0/24");
        assert_eq!(evaluate(Some(&node), "10.244.2.0/24").unwrap(), (false, false));
        // a wider route is not contained by the node
        assert_eq!(evaluate(Some(&node), "10.244.0.0/16").unwrap(), (false, false));
        assert_eq!(evaluate(Some(&node), "0.0.0.0/0").unwrap(), (false, false));
    }

    #[test]
    fn test_unparsable_route() {
        let node = net("10.244.1.0/24");
        assert!(matches!(
            evaluate(Some(&node), "10.244.1.0/33"),
            Err(RouteError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_verdict_owner() {
        let node = net("10.244.1.0/24");
        let route = Route::new("r-1", "10.244.1.0/24", "i-a");
        assert_eq!(
            verdict(Some(&node), &route, Some("i-a")).unwrap(),
            CidrVerdict::EqualSameOwner
        );
        let v = verdict(Some(&node), &route, Some("i-b")).unwrap();
        assert_eq!(v, CidrVerdict::EqualDifferentOwner);
        assert!(v.is_conflict());
        assert!(verdict(Some(&node), &route, None).unwrap().is_conflict());
    }

    #[test]
    fn test_verdict_contains_regardless_of_owner() {
        let node = net("10.244.0.0/16");
        let route = Route::new("r-1", "10.244.7.0/24", "i-a");
        let v = verdict(Some(&node), &route, Some("i-a")).unwrap();
        assert_eq!(v, CidrVerdict::Contains);
        assert!(v.is_conflict());
    }

    #[test]
    fn test_parse_network_clears_host_bits() {
        assert_eq!(net("10.244.1.7/24").to_string(), "10.244.1.0/24");
        assert!(parse_network("garbage").is_err());
    }
}
