//! HTTP service
//!
//! | Route | Auth |
//! |---|---|
//! | `GET /certboot/ca` | none |
//! | `GET /certboot/health` | none |
//! | `POST /certboot/csr` | Basic with signed body, or a one-time token |
//! | `POST /certboot/client/creds` | Basic with signed body |
//! | `POST /certboot/client/distribute` | Basic |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::authenticator::{require_auth, Authenticator, Caller, Gate, SignatureMode};
use crate::authority::CertificateAuthority;
use crate::certificate_request::CertificateRequest;
use crate::configs::{AppConfig, SecurityConfig};
use crate::distribution::{acquire_client_credentials, distribute_client_credentials, run_blocking};
use crate::error::{BootError, Result};
use crate::protocol::{
    Credentials, Responses, StatusResponse, ACQUIRE_CREDENTIALS_PATH, CA_PATH, CSR_PATH,
    DISTRIBUTE_CREDENTIALS_PATH, HEALTH_PATH,
};
use crate::token::TokenStore;
use crate::transport::{HttpTransport, Transport};

const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

#[derive(Clone)]
pub struct AppState {
    ca: Arc<CertificateAuthority>,
    tokens: TokenStore,
    transport: Arc<dyn Transport>,
    crt_dir: PathBuf,
}

impl AppState {
    pub fn new(
        ca: CertificateAuthority,
        tokens: TokenStore,
        transport: Arc<dyn Transport>,
        crt_dir: PathBuf,
    ) -> Self {
        Self {
            ca: Arc::new(ca),
            tokens,
            transport,
            crt_dir,
        }
    }
}

pub fn router(state: AppState, authenticator: Arc<Authenticator>) -> Router {
    let csr = Router::new()
        .route(CSR_PATH, post(sign_csr))
        .route_layer(middleware::from_fn_with_state(
            Gate::new(authenticator.clone(), SignatureMode::Signed).accepting_tokens(),
            require_auth,
        ));
    let acquire = Router::new()
        .route(ACQUIRE_CREDENTIALS_PATH, post(acquire_credentials))
        .route_layer(middleware::from_fn_with_state(
            Gate::new(authenticator.clone(), SignatureMode::Signed),
            require_auth,
        ));
    let distribute = Router::new()
        .route(DISTRIBUTE_CREDENTIALS_PATH, post(distribute_credentials))
        .route_layer(middleware::from_fn_with_state(
            Gate::new(authenticator, SignatureMode::Open),
            require_auth,
        ));

    Router::new()
        .route(CA_PATH, get(ca_certificate))
        .route(HEALTH_PATH, get(health))
        .merge(csr)
        .merge(acquire)
        .merge(distribute)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the service from `config` and serve until interrupted.
pub async fn start_webserver(config: &AppConfig) -> Result<()> {
    let security = SecurityConfig::from_file(&config.security.config_path)?;
    let ca = CertificateAuthority::initialize(&config.storage.ca_dir, &config.root_ca_defaults)?;
    let tokens = TokenStore::new(
        config.storage.tokens_dir(),
        config.distribution.token_id_len,
        config.distribution.token_secret_len,
        config.distribution.token_ttl(),
    );
    let transport = Arc::new(HttpTransport::from_config(config)?);
    let authenticator = Arc::new(Authenticator::new(&security).with_token_store(tokens.clone()));
    let state = AppState::new(ca, tokens, transport, config.storage.crt_dir.clone());
    let app = router(state, authenticator);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| BootError::Config(format!("Invalid listen address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BootError::io(format!("Failed to bind {}", addr), e))?;
    info!("certboot listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| BootError::io("HTTP server failed", e))?;
    info!("certboot stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

async fn ca_certificate(State(state): State<AppState>) -> Result<HttpResponse> {
    let pem = state.ca.certificate().to_pem()?;
    Ok(([(CONTENT_TYPE, PEM_CONTENT_TYPE)], pem).into_response())
}

async fn sign_csr(State(state): State<AppState>, body: Bytes) -> Result<HttpResponse> {
    let csr = CertificateRequest::from_pem(&body)
        .map_err(|e| BootError::InvalidRequest(e.to_string()))?;
    let ca = Arc::clone(&state.ca);
    let certificate = run_blocking(move || ca.sign_csr(&csr)).await?;
    info!(
        "Signed certificate serial {} for {:?}",
        certificate.serial_number()?,
        certificate.dns_names()
    );
    Ok(([(CONTENT_TYPE, PEM_CONTENT_TYPE)], certificate.to_pem()?).into_response())
}

async fn acquire_credentials(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<StatusResponse>> {
    let request = parse_credentials(&body)?;
    acquire_client_credentials(&request, &state.crt_dir, state.transport.as_ref()).await?;
    Ok(Json(StatusResponse::ok()))
}

async fn distribute_credentials(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<Json<Responses>> {
    let auth = caller.basic().ok_or_else(|| {
        BootError::Authentication("distribution requires Basic credentials".to_string())
    })?;
    let request = parse_credentials(&body)?;
    let responses =
        distribute_client_credentials(&request, auth, &state.tokens, state.transport.as_ref())
            .await?;
    info!(
        "Distribution finished: {}/{} target(s) succeeded",
        responses.iter().filter(|r| r.is_success()).count(),
        responses.len()
    );
    Ok(Json(Responses { responses }))
}

fn parse_credentials(body: &[u8]) -> Result<Credentials> {
    serde_json::from_slice(body)
        .map_err(|e| BootError::InvalidRequest(format!("couldn't decode json: {}", e)))
}
