use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouteError>;

/// Gateway messages that mean "a route with this destination already exists".
/// Kept for gateways that only hand back opaque error strings.
const DUPLICATE_DESTINATION_MARKERS: &[&str] = &["same with a route", "already exists"];

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("CIDR already exists: {cidr}: {message}")]
    DuplicateDestination { cidr: String, message: String },

    #[error("Route for {cidr} belongs to instance {owner}, not {instance_id}")]
    DestinationOwnedByOther {
        cidr: String,
        owner: String,
        instance_id: String,
    },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Describe route failed for {cidr}: {source}")]
    Lookup {
        cidr: String,
        #[source]
        source: Box<RouteError>,
    },

    #[error("Route for {0} not visible after create")]
    NotVisible(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Cannot resolve instance id for node {0}")]
    InstanceIdUnresolved(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouteError {
    /// True when the gateway refused a create because the destination is taken.
    ///
    /// The structured variant is authoritative; plain gateway messages are
    /// matched by substring as a fallback.
    pub fn is_duplicate_destination(&self) -> bool {
        match self {
            RouteError::DuplicateDestination { .. } => true,
            RouteError::Gateway(message) => DUPLICATE_DESTINATION_MARKERS
                .iter()
                .any(|marker| message.contains(marker)),
            _ => false,
        }
    }

    /// True for an optimistic-concurrency conflict (HTTP 409) from the API server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RouteError::KubernetesError(kube::Error::Api(resp)) if resp.code == 409)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> RouteError {
        RouteError::KubernetesError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_duplicate_destination_kind() {
        let err = RouteError::DuplicateDestination {
            cidr: "10.244.2.0/24".to_string(),
            message: "exists".to_string(),
        };
        assert!(err.is_duplicate_destination());
    }

    #[test]
    fn test_duplicate_destination_message_fallback() {
        let err = RouteError::Gateway("CIDR already exists for 10.244.2.0/24".to_string());
        assert!(err.is_duplicate_destination());

        let err = RouteError::Gateway("DestinationCidrBlock is same with a route".to_string());
        assert!(err.is_duplicate_destination());

        let err = RouteError::Gateway("InternalError".to_string());
        assert!(!err.is_duplicate_destination());
    }

    #[test]
    fn test_conflict() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
        assert!(!api_error(404).is_conflict());
        assert!(!RouteError::Internal("x".to_string()).is_conflict());
    }
}
