//! Prometheus metrics and the HTTP endpoint serving them

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, info};

pub const VERB_CREATE: &str = "create";
pub const VERB_DELETE: &str = "delete";
pub const VERB_RECONCILE: &str = "reconcile";

/// Route controller metrics
pub struct RouteMetrics {
    /// Latency of cloud route operations in milliseconds, by verb
    pub route_latency: HistogramVec,
    registry: Registry,
}

impl RouteMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let route_latency = HistogramVec::new(
            HistogramOpts::new(
                "ccm_route_latencies_duration_milliseconds",
                "Latency of cloud route operations in milliseconds",
            )
            .buckets(vec![
                100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
            ]),
            &["verb"],
        )?;

        registry.register(Box::new(route_latency.clone()))?;

        Ok(Self {
            route_latency,
            registry,
        })
    }

    /// Record the milliseconds elapsed since `start`
    pub fn observe(&self, verb: &str, start: Instant) {
        self.route_latency
            .with_label_values(&[verb])
            .observe(start.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn sample_count(&self, verb: &str) -> u64 {
        self.route_latency.with_label_values(&[verb]).get_sample_count()
    }

    /// Gather all metrics in text exposition format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<RouteMetrics>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let (status, body) = match req.uri().path() {
        "/metrics" => match metrics.gather() {
            Ok(text) => (StatusCode::OK, text),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to gather metrics: {}\n", e),
            ),
        },
        "/healthz" => (StatusCode::OK, "OK\n".to_string()),
        _ => (StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    if status == StatusCode::OK {
        response.headers_mut().insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
        );
    }
    Ok(response)
}

/// Serve `/metrics` and `/healthz` until the task is dropped
pub async fn serve(addr: SocketAddr, metrics: Arc<RouteMetrics>) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, metrics.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving metrics connection from {}: {}", peer_addr, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_gather() {
        let metrics = RouteMetrics::new().unwrap();
        metrics.observe(VERB_CREATE, Instant::now());
        metrics.observe(VERB_CREATE, Instant::now());
        metrics.observe(VERB_DELETE, Instant::now());

        assert_eq!(metrics.sample_count(VERB_CREATE), 2);
        assert_eq!(metrics.sample_count(VERB_DELETE), 1);
        assert_eq!(metrics.sample_count(VERB_RECONCILE), 0);

        let text = metrics.gather().unwrap();
        assert!(text.contains("ccm_route_latencies_duration_milliseconds_bucket"));
        assert!(text.contains(r#"verb="create""#));
        assert!(text.contains(r#"le="10000""#));
    }
}
