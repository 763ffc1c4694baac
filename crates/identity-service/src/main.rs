use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_api::IdentityApi;
use identity_core::{IdentifyRequest, IdentifyResponse, IdentityError};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const ROOT_MESSAGE: &str = "Server is running! Use /identify to interact with API.";
const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityApi,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    body: ErrorBody,
}

#[derive(Debug, Parser)]
#[command(name = "identity-service")]
#[command(about = "HTTP service for contact identity reconciliation")]
struct Args {
    #[arg(long, env = "IDENTITY_DB", default_value = "./identity.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
    /// Fallback filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self { status: rejection.status(), body: ErrorBody { error: rejection.body_text() } }
    }
}

impl ServiceError {
    // Only validation messages reach the caller; everything else is logged and masked.
    fn from_api(err: &anyhow::Error) -> Self {
        if let Some(IdentityError::Validation(message)) = err.downcast_ref::<IdentityError>() {
            return Self {
                status: StatusCode::BAD_REQUEST,
                body: ErrorBody { error: message.clone() },
            };
        }

        tracing::error!(error = %format!("{err:#}"), "identify request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody { error: INTERNAL_ERROR_MESSAGE.to_string() },
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/identify", post(identify))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let api = IdentityApi::new(args.db.clone());
    let schema = api
        .migrate()
        .with_context(|| format!("failed to migrate database at {}", args.db.display()))?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = schema.current_version,
        "contact store ready"
    );

    let report = api.integrity_check()?;
    if !report.is_clean() {
        tracing::warn!(
            quick_check = %report.quick_check_message,
            foreign_key_violations = report.foreign_key_violations.len(),
            link_violations = report.link_violations.len(),
            "contact store failed integrity checks; affected groups are repaired on next identify"
        );
    }

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "identity service listening");
    axum::serve(listener, app(ServiceState { api })).await?;
    Ok(())
}

async fn root() -> &'static str {
    ROOT_MESSAGE
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let Json(request) = payload?;
    let response = state.api.identify(&request).map_err(|err| ServiceError::from_api(&err))?;
    Ok(Json(response))
}
