use anyhow::{Context, Result};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use registry_core::{GatewayConfig, ServiceRegistry};
use registry_health::{HealthCheckConfig, HealthChecker, HttpHealthProbe, RegistryMetrics};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod router;

use router::Route;

const DEFAULT_CONFIG_PATH: &str = "registry.yaml";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const MAX_REPORT_BODY: usize = 16 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting registry-gateway...");

    let config_path =
        std::env::var("REGISTRY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("loading bootstrap configuration from {}", config_path))?;
    info!("Loaded {} services from {}", config.services.len(), config_path);

    let registry = Arc::new(ServiceRegistry::from_config(&config).await?);
    info!(
        "Service registry initialized (failure threshold {}, cool-down {:?})",
        registry.breaker_config().failure_threshold,
        registry.breaker_config().cool_down
    );

    let metrics = RegistryMetrics::new().context("creating registry metrics")?;

    let probe = Arc::new(HttpHealthProbe::new().context("building health probe client")?);
    let health_checker = HealthChecker::new(
        registry.clone(),
        probe,
        HealthCheckConfig::from(&config.health_check),
    )
    .with_metrics(metrics.clone());
    let health_handle = health_checker.spawn();

    let listen_addr: SocketAddr = std::env::var("REGISTRY_LISTEN_ADDR")
        .unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .context("parsing REGISTRY_LISTEN_ADDR")?;
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("HTTP server listening on {}", listen_addr);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let registry = registry.clone();
                let metrics = metrics.clone();

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        handle_request(req, registry.clone(), metrics.clone())
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                    }
                });
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    health_handle.stop().await;
    info!("registry-gateway stopped");
    Ok(())
}

/// Install the tracing subscriber; `REGISTRY_LOG_FORMAT=json` selects JSON output
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("REGISTRY_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Body of `POST /report`
#[derive(Debug, Deserialize)]
struct OutcomeReport {
    service: String,
    address: String,
    success: bool,
}

/// Body of a successful `GET /select/{service}`
#[derive(Debug, Serialize)]
struct SelectedInstance {
    service: String,
    name: String,
    address: String,
    weight: u32,
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    registry: Arc<ServiceRegistry>,
    metrics: RegistryMetrics,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let route = Route::resolve(req.method(), req.uri().path());
    debug!("{} {} -> {:?}", req.method(), req.uri().path(), route);

    let response = match route {
        Route::Healthz => text_response(StatusCode::OK, "OK\n".to_string()),

        Route::Metrics => match metrics.gather() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to gather metrics\n".to_string(),
                )
            }
        },

        Route::Status => json_response(StatusCode::OK, &registry.get_service_status().await),

        Route::Select(service) => match registry.get_healthy_instance(&service).await {
            Some(instance) => json_response(
                StatusCode::OK,
                &SelectedInstance {
                    service,
                    name: instance.name,
                    address: instance.address,
                    weight: instance.weight,
                },
            ),
            None if registry.get_instances(&service).await.is_err() => text_response(
                StatusCode::NOT_FOUND,
                format!("Not Found: unknown service {}\n", service),
            ),
            None => text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Service Unavailable: no healthy instance of {}\n", service),
            ),
        },

        Route::Report => match read_report(req.into_body()).await {
            Ok(report) => {
                let known = if report.success {
                    registry.mark_success(&report.service, &report.address).await
                } else {
                    registry.mark_failure(&report.service, &report.address).await
                };
                if known {
                    text_response(StatusCode::NO_CONTENT, String::new())
                } else {
                    text_response(
                        StatusCode::NOT_FOUND,
                        format!(
                            "Not Found: no instance {} in service {}\n",
                            report.address, report.service
                        ),
                    )
                }
            }
            Err(rejection) => rejection,
        },

        Route::NotFound => text_response(StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    };

    Ok(response)
}

/// Read and decode a `POST /report` body of at most `MAX_REPORT_BODY` bytes
async fn read_report<B>(body: B) -> Result<OutcomeReport, Response<Full<Bytes>>>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = match Limited::new(body, MAX_REPORT_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Err(text_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Payload Too Large: report exceeds {} bytes\n", MAX_REPORT_BODY),
            ))
        }
        Err(e) => {
            return Err(text_response(
                StatusCode::BAD_REQUEST,
                format!("Bad Request: {}\n", e),
            ))
        }
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| text_response(StatusCode::BAD_REQUEST, format!("Bad Request: {}\n", e)))
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error\n".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_report() {
        let body = Full::new(Bytes::from(
            r#"{"service":"users","address":"http://10.0.1.1:8080","success":false}"#,
        ));
        let report = read_report(body).await.unwrap();
        assert_eq!(report.service, "users");
        assert_eq!(report.address, "http://10.0.1.1:8080");
        assert!(!report.success);
    }

    #[tokio::test]
    async fn test_read_report_rejects_malformed_body() {
        let body = Full::new(Bytes::from_static(b"{\"service\":\"users\"}"));
        let response = read_report(body).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_read_report_rejects_oversized_body() {
        let body = Full::new(Bytes::from(vec![b' '; MAX_REPORT_BODY + 1]));
        let response = read_report(body).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
