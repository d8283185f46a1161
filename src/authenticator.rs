//! Request authenticator
//!
//! Every privileged route is wrapped in a [`Gate`], a two-stage check run
//! before the handler:
//!
//! 1. **Identity**: `Authorization: Basic <base64(user:pass)>` must match the
//!    configured credentials. Routes that accept tokens also take
//!    `Authorization: Token <hash>`, which redeems a one-time token from the
//!    [`TokenStore`].
//! 2. **Signature** ([`SignatureMode::Signed`] routes, Basic callers only):
//!    the body (or the `file` part of a multipart body) must carry an RSA-PSS
//!    signature in the `signature` header, verifiable with the configured
//!    public key (SHA-256, MGF1-SHA-256, 20 byte salt).
//!
//! Identity failures answer `401 Unauthorized`, signature failures
//! `406 Not Acceptable`; in both cases the handler never runs. On success
//! the handler sees the unchanged body plus [`Caller`] and [`SignedContent`]
//! request extensions.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response as HttpResponse};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{HasPrivate, PKey, PKeyRef};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Signer, Verifier};
use secrecy::{ExposeSecret, SecretString};
use tower::{service_fn, Layer, ServiceExt};
use tracing::{debug, warn};

use crate::configs::SecurityConfig;
use crate::error::{BootError, Result};
use crate::token::TokenStore;

/// Header carrying the base64 body signature.
pub const SIGNATURE_HEADER: &str = "signature";
pub const PSS_SALT_LENGTH: i32 = 20;
const MULTIPART_FILE_FIELD: &str = "file";
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Whether a route requires a signed body on top of Basic credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    Signed,
    Open,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for an `Authorization` header.
    pub fn header_value(&self) -> String {
        format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", self.username, self.password))
        )
    }
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Identity of an authenticated request, attached as a request extension.
#[derive(Debug, Clone)]
pub enum Caller {
    Basic(BasicCredentials),
    Token,
}

impl Caller {
    pub fn basic(&self) -> Option<&BasicCredentials> {
        match self {
            Caller::Basic(credentials) => Some(credentials),
            Caller::Token => None,
        }
    }
}

/// The exact bytes a request signature was checked against.
#[derive(Debug, Clone)]
pub struct SignedContent(pub Bytes);

enum Authorization {
    Basic(BasicCredentials),
    Token(String),
}

pub struct Authenticator {
    username: String,
    password: SecretString,
    sign_verify_key: Vec<u8>,
    tokens: Option<TokenStore>,
}

impl Authenticator {
    pub fn new(security: &SecurityConfig) -> Self {
        Self {
            username: security.username.clone(),
            password: security.password.clone(),
            sign_verify_key: security.sign_verify_key.as_bytes().to_vec(),
            tokens: None,
        }
    }

    /// Let token-accepting gates redeem tokens from `tokens`.
    pub fn with_token_store(mut self, tokens: TokenStore) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Check the Basic credentials of `headers`.
    pub fn check_auth(&self, headers: &HeaderMap) -> Result<BasicCredentials> {
        let credentials = get_auth_user_pass(headers).ok_or_else(|| {
            BootError::Authentication("missing Basic authorization header".to_string())
        })?;
        if self.matches(&credentials) {
            Ok(credentials)
        } else {
            warn!(
                "[Authenticator] invalid credentials for user {:?} from {}",
                credentials.username,
                host_of(headers)
            );
            Err(BootError::Authentication("invalid credentials".to_string()))
        }
    }

    fn matches(&self, credentials: &BasicCredentials) -> bool {
        constant_time_eq(credentials.username.as_bytes(), self.username.as_bytes())
            & constant_time_eq(
                credentials.password.as_bytes(),
                self.password.expose_secret().as_bytes(),
            )
    }

    fn identify(&self, headers: &HeaderMap, accept_token: bool) -> Result<Caller> {
        match parse_authorization(headers) {
            Some(Authorization::Token(token)) if accept_token => {
                let tokens = self.tokens.as_ref().ok_or_else(|| {
                    BootError::Authentication("token authentication is not enabled".to_string())
                })?;
                if tokens.consume(&token)? {
                    Ok(Caller::Token)
                } else {
                    warn!("[Authenticator] unknown or used token from {}", host_of(headers));
                    Err(BootError::Authentication("invalid token".to_string()))
                }
            }
            Some(Authorization::Token(_)) => Err(BootError::Authentication(
                "token authentication is not accepted here".to_string(),
            )),
            _ => self.check_auth(headers).map(Caller::Basic),
        }
    }

    /// Run both stages on `req`, returning the request to hand downstream.
    pub async fn authorize(&self, req: Request, mode: SignatureMode, accept_token: bool) -> Result<Request> {
        let caller = self.identify(req.headers(), accept_token)?;

        let needs_signature = mode == SignatureMode::Signed && matches!(caller, Caller::Basic(_));
        let mut req = if needs_signature {
            let (parts, body) = req.into_parts();
            let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
                .await
                .map_err(|e| BootError::InvalidRequest(format!("couldn't read body: {}", e)))?;
            let signed = signed_bytes(&parts.headers, &body).await;
            let signature = parts
                .headers
                .get(SIGNATURE_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .trim()
                .to_string();
            if !check_signature(&signature, &self.sign_verify_key, &signed) {
                return Err(BootError::Signature("body signature rejected".to_string()));
            }
            let mut req = Request::from_parts(parts, Body::from(body));
            req.extensions_mut().insert(SignedContent(signed));
            req
        } else {
            req
        };
        req.extensions_mut().insert(caller);
        Ok(req)
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("username", &self.username)
            .field("tokens", &self.tokens)
            .finish()
    }
}

/// Route-level gate configuration, used as middleware state.
#[derive(Debug, Clone)]
pub struct Gate {
    authenticator: Arc<Authenticator>,
    mode: SignatureMode,
    accept_token: bool,
}

impl Gate {
    pub fn new(authenticator: Arc<Authenticator>, mode: SignatureMode) -> Self {
        Self {
            authenticator,
            mode,
            accept_token: false,
        }
    }

    pub fn accepting_tokens(mut self) -> Self {
        self.accept_token = true;
        self
    }
}

/// Middleware wrapping a handler with the authenticator.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use axum::{routing::post, middleware, Router};
/// # use certboot::authenticator::{require_auth, Authenticator, Gate, SignatureMode};
/// # fn example(authenticator: Arc<Authenticator>) -> Router {
/// Router::new().route("/sign", post(|| async { "ok" })).route_layer(
///     middleware::from_fn_with_state(Gate::new(authenticator, SignatureMode::Signed), require_auth),
/// )
/// # }
/// ```
pub async fn require_auth(State(gate): State<Gate>, req: Request, next: Next) -> HttpResponse {
    let req = match gate
        .authenticator
        .authorize(req, gate.mode, gate.accept_token)
        .await
    {
        Ok(req) => req,
        Err(BootError::Authentication(reason)) => {
            debug!("[Authenticator] rejected: {}", reason);
            return (StatusCode::UNAUTHORIZED, "401 Unauthorized").into_response();
        }
        Err(BootError::Signature(reason)) => {
            debug!("[Authenticator] rejected: {}", reason);
            return (StatusCode::NOT_ACCEPTABLE, "406 Not Acceptable").into_response();
        }
        Err(other) => return other.into_response(),
    };

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .entry(CONTENT_TYPE)
        .or_insert(HeaderValue::from_static("application/json"));
    response
}

/// Extract the Basic `username:password` pair from `headers`.
///
/// Returns `None` for a missing header, another scheme, invalid base64, or a
/// payload without exactly one `:`.
pub fn get_auth_user_pass(headers: &HeaderMap) -> Option<BasicCredentials> {
    match parse_authorization(headers) {
        Some(Authorization::Basic(credentials)) => Some(credentials),
        _ => None,
    }
}

fn parse_authorization(headers: &HeaderMap) -> Option<Authorization> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, payload) = value.split_once(' ')?;
    match scheme {
        "Basic" => {
            let decoded = match BASE64.decode(payload.trim()) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("[Authenticator] Authorization header is not base64 encoded: {}", e);
                    return None;
                }
            };
            let decoded = String::from_utf8(decoded).ok()?;
            let mut pair = decoded.split(':');
            match (pair.next(), pair.next(), pair.next()) {
                (Some(user), Some(pass), None) => {
                    Some(Authorization::Basic(BasicCredentials::new(user, pass)))
                }
                _ => {
                    warn!("[Authenticator] Missing username/password");
                    None
                }
            }
        }
        "Token" => Some(Authorization::Token(payload.trim().to_string())),
        _ => {
            debug!("[Authenticator] Unsupported authorization scheme {:?}", scheme);
            None
        }
    }
}

/// Bytes covered by the signature: the first `file` part of a multipart
/// body, otherwise the whole body.
async fn signed_bytes(headers: &HeaderMap, body: &Bytes) -> Bytes {
    let is_multipart = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("multipart"))
        .unwrap_or(false);
    if !is_multipart {
        return body.clone();
    }

    let mut req = Request::new(Body::from(body.clone()));
    *req.headers_mut() = headers.clone();
    // Without a limit extension `Multipart` stops at axum's 2 MB default.
    let req = match DefaultBodyLimit::max(MAX_BODY_BYTES)
        .layer(service_fn(|req: Request| async move { Ok::<_, Infallible>(req) }))
        .oneshot(req)
        .await
    {
        Ok(req) => req,
        Err(never) => match never {},
    };
    let mut multipart = match Multipart::from_request(req, &()).await {
        Ok(multipart) => multipart,
        Err(e) => {
            warn!("[Authenticator] couldn't parse multipart body: {}", e);
            return Bytes::new();
        }
    };
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some(MULTIPART_FILE_FIELD) => {
                return field.bytes().await.unwrap_or_else(|e| {
                    warn!("[Authenticator] couldn't read file part: {}", e);
                    Bytes::new()
                });
            }
            Ok(Some(_)) => continue,
            Ok(None) => return Bytes::new(),
            Err(e) => {
                warn!("[Authenticator] couldn't read multipart body: {}", e);
                return Bytes::new();
            }
        }
    }
}

/// Verify a base64 RSA-PSS signature over `data` with a PEM public key.
///
/// Malformed input of any kind yields `false`.
pub fn check_signature(raw_sign: &str, pub_pem: &[u8], data: &[u8]) -> bool {
    match verify_pss(raw_sign, pub_pem, data) {
        Ok(true) => true,
        Ok(false) => {
            warn!("[Authenticator] signature does not match the request body");
            false
        }
        Err(reason) => {
            warn!("[Authenticator] unable to check signature: {}", reason);
            false
        }
    }
}

fn verify_pss(raw_sign: &str, pub_pem: &[u8], data: &[u8]) -> std::result::Result<bool, String> {
    let signature = BASE64
        .decode(raw_sign.trim())
        .map_err(|e| format!("invalid base64 signature: {}", e))?;
    let public_key =
        PKey::public_key_from_pem(pub_pem).map_err(|e| format!("unable to decode PEM: {}", e))?;
    if public_key.rsa().is_err() {
        return Err("verification key is not an RSA key".to_string());
    }
    let verify = || -> std::result::Result<bool, ErrorStack> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key)?;
        verifier.set_rsa_padding(Padding::PKCS1_PSS)?;
        verifier.set_rsa_pss_saltlen(RsaPssSaltlen::custom(PSS_SALT_LENGTH))?;
        verifier.set_rsa_mgf1_md(MessageDigest::sha256())?;
        verifier.update(data)?;
        verifier.verify(&signature)
    };
    // OpenSSL reports some malformed signatures as errors rather than `false`.
    Ok(verify().unwrap_or(false))
}

/// Produce the base64 signature [`check_signature`] accepts.
pub fn sign_payload<T: HasPrivate>(key: &PKeyRef<T>, data: &[u8]) -> Result<String> {
    let sign = || -> std::result::Result<Vec<u8>, ErrorStack> {
        let mut signer = Signer::new(MessageDigest::sha256(), key)?;
        signer.set_rsa_padding(Padding::PKCS1_PSS)?;
        signer.set_rsa_pss_saltlen(RsaPssSaltlen::custom(PSS_SALT_LENGTH))?;
        signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
        signer.update(data)?;
        signer.sign_to_vec()
    };
    let signature = sign().map_err(|e| BootError::Signing(format!("Failed to sign payload: {}", e)))?;
    Ok(BASE64.encode(signature))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && openssl::memcmp::eq(a, b)
}

fn host_of(headers: &HeaderMap) -> &str {
    headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown host")
}
