use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use blobpool::{Bootstrap, PoolConfig, StoragePool};

#[derive(Clone)]
struct AppState {
    pool: Arc<StoragePool>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config();

    let pool = match Bootstrap::run(config.clone()).await {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!(error = %e, "bootstrap failed");
            std::process::exit(e.exit_code());
        }
    };

    if config.enable_background_maintenance {
        let maintenance_pool = pool.clone();
        let token = tokio_util::sync::CancellationToken::new();
        let maintenance = blobpool::maintenance::Maintenance::new(
            maintenance_pool,
            blobpool::maintenance::MaintenanceConfig {
                interval: config.maintenance_interval,
                processing_timeout: chrono::Duration::from_std(config.processing_timeout)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)),
                failed_retention: chrono::Duration::from_std(config.failed_retention)
                    .unwrap_or_else(|_| chrono::Duration::days(7)),
                tenants: config.pre_create_tenants.clone(),
            },
        );
        let shutdown_token = token.clone();
        tokio::spawn(async move { maintenance.run(shutdown_token).await });
    }

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { pool });

    let addr = SocketAddr::from_str("0.0.0.0:3000").unwrap();
    info!(%addr, "serving");
    axum::Server::bind(&addr).serve(app.into_make_service()).await.unwrap();
}

fn load_config() -> PoolConfig {
    match std::env::args().nth(1) {
        Some(path) => {
            let bytes = std::fs::read(&path).unwrap_or_else(|e| {
                error!(path, error = %e, "failed to read config file");
                std::process::exit(1);
            });
            serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                error!(path, error = %e, "failed to parse config file");
                std::process::exit(1);
            })
        }
        None => PoolConfig::default(),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    total_capacity: u64,
    available_space: u64,
    volumes: Vec<VolumeHealth>,
}

#[derive(Serialize)]
struct VolumeHealth {
    volume_id: String,
    healthy: bool,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut volumes = Vec::new();
    let mut any_healthy = false;
    for volume in state.pool.volumes() {
        let healthy = volume.is_healthy().await;
        any_healthy |= healthy;
        volumes.push(VolumeHealth {
            volume_id: volume.volume_id().to_string(),
            healthy,
        });
    }

    let response = HealthResponse {
        healthy: any_healthy,
        total_capacity: state.pool.total_capacity().await,
        available_space: state.pool.available_space().await,
        volumes,
    };
    let status = if any_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// A metrics sink is an assumed external collaborator; this endpoint is the
/// thinnest faithful stand-in until one is wired in.
async fn metrics() -> &'static str {
    "# metrics sink not yet wired\n"
}
