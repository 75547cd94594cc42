//! KeyDelegate Agent
//!
//! Enables every configured principal at startup, keeps their tickets renewed
//! and serves identity status over HTTP. All identities are disabled on
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use kd_config::{AppConfig, CapabilityConfig, ConfigError, ConfigLoader};
use kd_delegation::{
    AuthContext, CapabilityProvider, EntrySnapshot, IdentityBinding, KerberosDelegationService,
    KeytabCapabilityProvider, KeytabSettings, RenewalConfig, ServiceOptions,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
struct AppState {
    service: Arc<KerberosDelegationService>,
    configured: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    configured: usize,
    active: usize,
    renewal_failures: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kd_common::logging::init_logging("kd-agent");

    info!("Starting KeyDelegate agent");

    let config = ConfigLoader::new().load()?;
    config.validate()?;
    config.validate_keytabs()?;
    info!(
        principals = config.principals.len(),
        provider = %config.capability.provider,
        renewal_enabled = config.renewal.enabled,
        renewal_interval_secs = config.renewal.interval_secs,
        "Configuration loaded"
    );

    let provider = build_provider(&config.capability)?;
    let service = Arc::new(KerberosDelegationService::new(provider, service_options(&config)));

    let bindings = bindings(&config)?;
    let configured = bindings.len();
    let summary = service.on_enable(bindings).await?;
    for failure in &summary.failed {
        error!(identity = %failure.identity, error = %failure.error, "Identity not enabled");
    }

    let state = AppState {
        service: service.clone(),
        configured,
    };
    let app = Router::new()
        .route("/q/health", get(health))
        .route("/q/health/live", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route("/q/health/ready", get(ready))
        .route("/identities", get(identities))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let disabled = service.on_disable().await;
    for failure in &disabled.failed {
        warn!(identity = %failure.identity, error = %failure.error, "Identity did not disable cleanly");
    }

    info!(disabled = disabled.disabled.len(), "KeyDelegate agent stopped");
    Ok(())
}

fn build_provider(config: &CapabilityConfig) -> anyhow::Result<Arc<dyn CapabilityProvider>> {
    match config.provider.as_str() {
        "keytab" => Ok(Arc::new(KeytabCapabilityProvider::new(KeytabSettings {
            ticket_lifetime: Duration::from_secs(config.ticket_lifetime_secs),
            renew_window: config.renew_window,
            ..KeytabSettings::default()
        }))),
        other => anyhow::bail!("Unknown capability provider: {}", other),
    }
}

fn service_options(config: &AppConfig) -> ServiceOptions {
    let mut defaults = AuthContext::new();
    if !config.capability.default_realm.is_empty() {
        defaults = defaults.with(AuthContext::DEFAULT_REALM, config.capability.default_realm.clone());
    }

    ServiceOptions {
        defaults,
        renewal: RenewalConfig {
            enabled: config.renewal.enabled,
            interval: Duration::from_secs(config.renewal.interval_secs),
        },
    }
}

fn bindings(config: &AppConfig) -> Result<Vec<IdentityBinding>, ConfigError> {
    config
        .principals
        .iter()
        .map(|principal| {
            Ok(IdentityBinding::new(principal.identity.clone(), principal.resolved_keytab()?)
                .with_context(AuthContext::from(principal.context.clone())))
        })
        .collect()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let identities = state.service.identities();
    let renewal_failures: u32 = identities.iter().map(|entry| entry.renewal_failures).sum();
    let status = if identities.len() == state.configured && renewal_failures == 0 {
        "UP"
    } else {
        "DEGRADED"
    };

    Json(HealthResponse {
        status,
        configured: state.configured,
        active: identities.len(),
        renewal_failures,
    })
}

async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let active = state.service.identities().len();
    if active == state.configured {
        (StatusCode::OK, Json(serde_json::json!({"status": "UP"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "DOWN", "configured": state.configured, "active": active})),
        )
    }
}

async fn identities(State(state): State<AppState>) -> Json<Vec<EntrySnapshot>> {
    Json(state.service.identities())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
}
