//! talon-api — HTTP surface for the talon agent mediation core.
//!
//! Every `/v1/*` endpoint sits behind bearer-token auth; `/healthz` is open.
//! Each posted message spawns one executor task; clients observe run
//! progress by polling, never by streaming.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use talon_audit::{AuditLog, FileAuditLog};
use talon_broker::{CapabilityBroker, DockerLimits};
use talon_executor::RunExecutor;
use talon_policy::{CapabilityPolicyEngine, Issuer, Verifier};
use talon_store::MemoryStore;

mod auth;
mod error;
mod handlers;

use crate::error::ApiError;

#[derive(Debug, Parser)]
#[command(name = "talon-api")]
#[command(about = "Policy-gated tool mediation API for autonomous agents")]
struct Cli {
    /// Bearer token required on every /v1/* request.
    #[arg(long, env = "ADMIN_TOKEN")]
    admin_token: String,
    /// Root for persistent data; the audit log lives under {data_dir}/audit.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
    /// Listen address. A bare ":8080" binds every interface.
    #[arg(long, env = "ADDR", default_value = ":8080")]
    addr: String,
    /// Secret for capability token signatures; defaults to the admin token.
    #[arg(long, env = "TOKEN_SECRET", default_value = "")]
    token_secret: String,
    /// Memory limit for docker.run containers.
    #[arg(long, env = "DOCKER_MEMORY_LIMIT", default_value = "512m")]
    docker_memory_limit: String,
    /// CPU limit for docker.run containers.
    #[arg(long, env = "DOCKER_CPU_LIMIT", default_value = "1.0")]
    docker_cpu_limit: String,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub policy: Arc<CapabilityPolicyEngine>,
    pub audit: Arc<dyn AuditLog>,
    pub executor: Arc<RunExecutor>,
    pub admin_token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    if cli.admin_token.is_empty() {
        bail!("ADMIN_TOKEN is required");
    }

    let audit = Arc::new(
        FileAuditLog::open(cli.data_dir.join("audit"))
            .await
            .context("failed to open audit log")?,
    );

    let token_secret = if cli.token_secret.is_empty() {
        cli.admin_token.clone()
    } else {
        cli.token_secret.clone()
    };
    let policy = Arc::new(CapabilityPolicyEngine::new(Issuer::new(&token_secret)));
    let broker = Arc::new(CapabilityBroker::with_limits(
        Verifier::new(&token_secret),
        DockerLimits {
            memory: cli.docker_memory_limit.clone(),
            cpus: cli.docker_cpu_limit.clone(),
        },
    ));
    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        policy.clone(),
        broker,
        audit.clone(),
    ));

    let state = AppState {
        store,
        policy,
        audit,
        executor,
        admin_token: cli.admin_token.clone(),
    };
    let app = router(state);

    let addr = listen_addr(&cli.addr)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, data_dir = %cli.data_dir.display(), "talon-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route(
            "/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route("/sessions/{id}", get(handlers::get_session))
        .route(
            "/sessions/{id}/messages",
            post(handlers::post_message).get(handlers::list_messages),
        )
        .route("/sessions/{id}/policy", put(handlers::put_session_policy))
        .route("/policy/effective", get(handlers::get_effective_policy))
        .route("/runs/{run_id}", get(handlers::get_run))
        .route("/runs/{run_id}/replay", post(handlers::post_run_replay))
        .route("/replay", get(handlers::get_replay))
        .route("/audit", get(handlers::query_audit))
        .route("/audit/validate", get(handlers::validate_audit))
        .route(
            "/skills",
            get(handlers::list_skills).post(handlers::register_skill),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", v1)
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn not_found() -> ApiError {
    ApiError::not_found("Not found")
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

/// `":8080"` means every interface, matching common container configs.
fn listen_addr(addr: &str) -> Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
