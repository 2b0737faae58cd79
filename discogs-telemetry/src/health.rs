//! Http endpoints exposing service health and Prometheus metrics.
//!
//! `GET /health` renders the report of a [`HealthReporter`] and answers `503` when the
//! reporter considers the service unhealthy. `GET /metrics` renders the process wide
//! Prometheus recorder.

use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::http::StatusCode;
use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use discogs_config::shared::HealthServerConfig;
use metrics_exporter_prometheus::{BuildError, PrometheusHandle};
use thiserror::Error;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::metrics::init_metrics_handle;

/// Source of the `/health` response body.
pub trait HealthReporter: Send + Sync + 'static {
    /// Returns `false` when a dependency is unavailable and the service cannot make progress.
    fn is_healthy(&self) -> bool;

    /// Returns the health report rendered as the response body.
    fn report(&self) -> serde_json::Value;
}

#[derive(Debug, Error)]
pub enum HealthServerError {
    #[error("failed to bind the health server: {0}")]
    Bind(#[from] std::io::Error),

    #[error("failed to install the metrics recorder: {0}")]
    Metrics(#[from] BuildError),
}

#[get("/health")]
async fn health_check(reporter: web::Data<dyn HealthReporter>) -> impl Responder {
    let status = if reporter.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status).json(reporter.report())
}

#[get("/metrics")]
async fn metrics(handle: web::ThinData<PrometheusHandle>) -> impl Responder {
    handle.render()
}

/// Binds the health server. The returned [`Server`] must be spawned or awaited to serve requests.
pub fn start_health_server(
    config: &HealthServerConfig,
    reporter: Arc<dyn HealthReporter>,
) -> Result<Server, HealthServerError> {
    let listener = TcpListener::bind(config.address())?;
    info!(address = ?listener.local_addr()?, "starting health server");

    run(listener, reporter)
}

fn run(listener: TcpListener, reporter: Arc<dyn HealthReporter>) -> Result<Server, HealthServerError> {
    let prometheus_handle = web::ThinData(init_metrics_handle()?);
    let reporter: web::Data<dyn HealthReporter> = web::Data::from(reporter);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .service(health_check)
            .service(metrics)
            .app_data(reporter.clone())
            .app_data(prometheus_handle.clone())
    })
    .workers(1)
    .disable_signals()
    .listen(listener)?
    .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use actix_web::test;

    use super::*;

    struct StaticReporter {
        healthy: bool,
    }

    impl HealthReporter for StaticReporter {
        fn is_healthy(&self) -> bool {
            self.healthy
        }

        fn report(&self) -> serde_json::Value {
            serde_json::json!({ "healthy": self.healthy })
        }
    }

    async fn call_health(healthy: bool) -> (StatusCode, serde_json::Value) {
        let reporter: Arc<dyn HealthReporter> = Arc::new(StaticReporter { healthy });
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(reporter))
                .service(health_check),
        )
        .await;

        let response =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        let status = response.status();
        let body: serde_json::Value = test::read_body_json(response).await;

        (status, body)
    }

    #[actix_web::test]
    async fn test_healthy_reporter_answers_ok() {
        let (status, body) = call_health(true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
    }

    #[actix_web::test]
    async fn test_unhealthy_reporter_answers_service_unavailable() {
        let (status, body) = call_health(false).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["healthy"], false);
    }
}
