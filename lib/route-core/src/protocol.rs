//! Serialized, retrying create/delete against the route gateway
//!
//! Every create and delete issued by the event worker and the periodic sync
//! goes through one [`RouteProtocol`], whose mutex orders them so two
//! reconciles can never create the same destination twice or delete a route
//! the other just created.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::route::find_by_cidr;
use crate::{Result, Route, RouteError, RouteGateway};

/// Exponential backoff schedule for route creation
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Total number of attempts
    pub steps: u32,
    /// Delay after the first failed attempt
    pub duration: Duration,
    /// Multiplier applied to the delay after each attempt
    pub factor: f64,
    /// Up to `jitter * delay` is added to each sleep
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            steps: 3,
            duration: Duration::from_secs(5),
            factor: 2.0,
            jitter: 1.0,
        }
    }
}

impl BackoffConfig {
    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..1.0) * self.jitter;
        Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + extra))
    }
}

/// Result of [`RouteProtocol::ensure_route`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnsuredRoute {
    Existing(Route),
    Created(Route),
}

impl EnsuredRoute {
    pub fn route(&self) -> &Route {
        match self {
            EnsuredRoute::Existing(r) | EnsuredRoute::Created(r) => r,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, EnsuredRoute::Created(_))
    }
}

pub struct RouteProtocol {
    gateway: Arc<dyn RouteGateway>,
    lock: Arc<Mutex<()>>,
    backoff: BackoffConfig,
}

impl RouteProtocol {
    pub fn new(gateway: Arc<dyn RouteGateway>) -> Self {
        Self::with_lock(gateway, Arc::new(Mutex::new(())), BackoffConfig::default())
    }

    /// Build a protocol around an externally owned lock, e.g. one shared by
    /// several protocols that target the same VPC.
    pub fn with_lock(
        gateway: Arc<dyn RouteGateway>,
        lock: Arc<Mutex<()>>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            gateway,
            lock,
            backoff,
        }
    }

    pub async fn list_routes(&self) -> Result<Vec<Route>> {
        self.gateway.list_routes().await
    }

    /// Look a destination up, preferring a route list already in hand.
    ///
    /// An empty or absent list falls through to the gateway.
    pub async fn find_route(&self, cidr: &str, cached: Option<&[Route]>) -> Result<Option<Route>> {
        if cidr.is_empty() {
            return Err(RouteError::InvalidCidr("empty query condition".to_string()));
        }
        match cached {
            Some(routes) if !routes.is_empty() => Ok(find_by_cidr(routes, cidr).cloned()),
            _ => self.gateway.find_route(cidr).await,
        }
    }

    /// Return the route for `cidr`, creating it for `instance_id` if absent.
    ///
    /// Lookup and create run under the protocol lock, so repeated calls for
    /// the same destination create at most once.
    pub async fn ensure_route(
        &self,
        instance_id: &str,
        cidr: &str,
        cached: Option<&[Route]>,
    ) -> Result<EnsuredRoute> {
        let _guard = self.lock.lock().await;

        let existing = self
            .find_route(cidr, cached)
            .await
            .map_err(|e| RouteError::Lookup {
                cidr: cidr.to_string(),
                source: Box::new(e),
            })?;

        match existing {
            Some(route) if route.destination_cidr == cidr => {
                if route.is_owned_by(instance_id) {
                    Ok(EnsuredRoute::Existing(route))
                } else {
                    Err(RouteError::DestinationOwnedByOther {
                        cidr: cidr.to_string(),
                        owner: route.instance_id,
                        instance_id: instance_id.to_string(),
                    })
                }
            }
            _ => self
                .create_locked(instance_id, cidr)
                .await
                .map(EnsuredRoute::Created),
        }
    }

    /// Create a route with exponential backoff.
    pub async fn create_route(&self, instance_id: &str, cidr: &str) -> Result<Route> {
        let _guard = self.lock.lock().await;
        self.create_locked(instance_id, cidr).await
    }

    /// Delete the route for `cidr`. Single attempt; the periodic sync retries.
    pub async fn delete_route(&self, cidr: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.gateway.delete_route(cidr).await
    }

    async fn create_locked(&self, instance_id: &str, cidr: &str) -> Result<Route> {
        let mut delay = self.backoff.duration;
        let mut last_err = None;

        for attempt in 1..=self.backoff.steps {
            match self.gateway.create_route(instance_id, cidr).await {
                Ok(Some(route)) => return Ok(route),
                Ok(None) => return self.find_created(cidr).await,
                Err(e) if e.is_duplicate_destination() => {
                    return self.adopt_existing(instance_id, cidr, e).await;
                }
                Err(e) => {
                    error!(
                        instance_id = %instance_id,
                        cidr = %cidr,
                        attempt = attempt,
                        error = %e,
                        "Backoff creating route"
                    );
                    last_err = Some(e);
                }
            }

            if attempt < self.backoff.steps {
                tokio::time::sleep(self.backoff.jittered(delay)).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * self.backoff.factor);
            }
        }

        Err(last_err.unwrap_or_else(|| {
            RouteError::Internal(format!("no create attempt made for {}", cidr))
        }))
    }

    /// The destination is already taken; adopt it if it is ours.
    async fn adopt_existing(
        &self,
        instance_id: &str,
        cidr: &str,
        duplicate: RouteError,
    ) -> Result<Route> {
        match self.gateway.find_route(cidr).await {
            Ok(Some(route)) if route.is_owned_by(instance_id) => {
                info!(
                    cidr = %cidr,
                    route_id = %route.route_id,
                    "Route already exists for instance, adopting it"
                );
                Ok(route)
            }
            Ok(Some(route)) => Err(RouteError::DestinationOwnedByOther {
                cidr: cidr.to_string(),
                owner: route.instance_id,
                instance_id: instance_id.to_string(),
            }),
            Ok(None) => {
                error!(cidr = %cidr, error = %duplicate, "Same CIDR exists but cannot be found");
                Err(duplicate)
            }
            Err(e) => {
                error!(cidr = %cidr, error = %e, "Same CIDR exists, lookup failed");
                Err(duplicate)
            }
        }
    }

    async fn find_created(&self, cidr: &str) -> Result<Route> {
        warn!(cidr = %cidr, "Create returned no route, looking it up");
        self.gateway
            .find_route(cidr)
            .await?
            .ok_or_else(|| RouteError::NotVisible(cidr.to_string()))
    }
}
