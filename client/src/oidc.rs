//! Authorization-code + PKCE over a loopback redirect.
//!
//! The flow binds the session to the CIC before the browser ever opens: the
//! commitment is the `nonce` of the authorization request, so the ID token
//! the OP returns is useless to anyone without the ephemeral key. The
//! loopback listener accepts exactly one redirect and shuts down.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    response::Html,
    routing::get,
    Router,
};
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use opkssh_common::{
    b64,
    config::{ProviderConfig, CALLBACK_PORTS},
    error::AuthError,
    jwk::{Jwk, JwkSet, RsaJwk},
};
use opkssh_token::IdClaims;

/// Overall deadline for the interactive flow, browser time included.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for each non-interactive HTTP request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepted clock skew when validating the returned ID token, seconds.
const ID_TOKEN_LEEWAY: u64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: String,
}

/// PKCE verifier/challenge pair (S256).
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let verifier = b64::encode(raw);
        let challenge = b64::encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn http_client() -> Result<reqwest::Client, AuthError> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .user_agent(concat!("opkssh/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AuthError::Configuration(format!("HTTP client: {e}")))
}

fn request_err(err: reqwest::Error) -> AuthError {
    if err.is_timeout() {
        AuthError::IoTimeout(err.to_string())
    } else {
        AuthError::Io(err.to_string())
    }
}

pub async fn discover(issuer: &str) -> Result<DiscoveryDocument, AuthError> {
    let url = format!(
        "{}/.well-known/openid-configuration",
        issuer.trim_end_matches('/')
    );
    let response = http_client()?.get(&url).send().await.map_err(request_err)?;
    if !response.status().is_success() {
        return Err(AuthError::Io(format!(
            "GET {url} returned {}",
            response.status()
        )));
    }
    response.json().await.map_err(request_err)
}

/// One-shot key lookup for the GQ transform on the login side; the verify
/// side has its own cached resolver.
pub async fn fetch_op_key(issuer: &str, kid: &str) -> Result<RsaJwk, AuthError> {
    let discovery = discover(issuer).await?;
    let response = http_client()?
        .get(&discovery.jwks_uri)
        .send()
        .await
        .map_err(request_err)?;
    let keys: JwkSet = response.json().await.map_err(request_err)?;
    match keys.find(kid) {
        Some(Jwk::Rsa(jwk)) => Ok(jwk.clone()),
        _ => Err(AuthError::UnknownKid(kid.to_string())),
    }
}

/// What the loopback listener hands back from the redirect.
#[derive(Debug)]
struct CallbackOutcome {
    code: String,
    state: String,
}

type CallbackSender = oneshot::Sender<Result<CallbackOutcome, AuthError>>;

#[derive(Clone)]
struct CallbackState {
    tx: Arc<Mutex<Option<CallbackSender>>>,
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    let outcome = match (params.get("code"), params.get("state")) {
        (Some(code), Some(state)) => Ok(CallbackOutcome {
            code: code.clone(),
            state: state.clone(),
        }),
        _ => Err(AuthError::Malformed(format!(
            "authorization redirect without code: {}",
            params
                .get("error")
                .map(String::as_str)
                .unwrap_or("missing parameters")
        ))),
    };
    if let Some(tx) = state.tx.lock().await.take() {
        let _ = tx.send(outcome);
    }
    Html("<html><body>opkssh: you may close this window and return to the terminal.</body></html>")
}

/// Bind the first available loopback port from the configured list.
async fn bind_loopback() -> Result<(tokio::net::TcpListener, u16), AuthError> {
    for &port in CALLBACK_PORTS {
        match tokio::net::TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => debug!(port, %err, "loopback port unavailable"),
        }
    }
    Err(AuthError::Io(format!(
        "no loopback redirect port available (tried {CALLBACK_PORTS:?})"
    )))
}

/// Run the interactive flow and return the OP's ID token, validated against
/// the OP's JWKS and bound to `cic_commitment`.
pub async fn authorization_code_flow(
    provider: &ProviderConfig,
    cic_commitment: &str,
    open_browser: bool,
) -> Result<String, AuthError> {
    let discovery = discover(&provider.issuer).await?;
    let (listener, port) = bind_loopback().await?;
    let redirect_uri = format!("http://localhost:{port}/callback");

    let pkce = Pkce::generate();
    let mut state_raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut state_raw);
    let state = b64::encode(state_raw);

    let auth_url = reqwest::Url::parse_with_params(
        &discovery.authorization_endpoint,
        &[
            ("response_type", "code"),
            ("client_id", provider.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", provider.scopes.join(" ").as_str()),
            ("state", state.as_str()),
            ("nonce", cic_commitment),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
        ],
    )
    .map_err(|e| AuthError::Configuration(format!("authorization endpoint: {e}")))?;

    info!("authorize at: {auth_url}");
    if open_browser {
        if let Err(err) = open::that(auth_url.as_str()) {
            warn!(%err, "could not open a browser, use the printed URL");
        }
    }

    // Serve exactly one redirect, then shut the listener down.
    let (tx, rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = Router::new()
        .route("/callback", get(handle_callback))
        .with_state(CallbackState {
            tx: Arc::new(Mutex::new(Some(tx))),
        });
    let server = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        if let Err(err) = serve.await {
            warn!(%err, "loopback listener error");
        }
    });

    let outcome = tokio::time::timeout(AUTH_TIMEOUT, rx)
        .await
        .map_err(|_| AuthError::IoTimeout("timed out waiting for the OP redirect".into()))
        .and_then(|received| {
            received.map_err(|_| AuthError::Io("loopback listener dropped".into()))
        });
    let _ = shutdown_tx.send(());
    let _ = server.await;
    let outcome = outcome??;

    if outcome.state != state {
        return Err(AuthError::SigInvalid("authorization state mismatch".into()));
    }

    let id_token = exchange_code(
        provider,
        &discovery,
        &outcome.code,
        &redirect_uri,
        &pkce.verifier,
    )
    .await?;
    validate_id_token(provider, &discovery, &id_token, cic_commitment).await?;
    Ok(id_token)
}

async fn exchange_code(
    provider: &ProviderConfig,
    discovery: &DiscoveryDocument,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<String, AuthError> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", provider.client_id.as_str()),
        ("code_verifier", code_verifier),
    ];
    if let Some(secret) = provider.client_secret.as_deref() {
        form.push(("client_secret", secret));
    }

    let response = http_client()?
        .post(&discovery.token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(request_err)?;
    if !response.status().is_success() {
        return Err(AuthError::Io(format!(
            "token exchange returned {}",
            response.status()
        )));
    }
    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::Malformed(format!("token response: {e}")))?;
    Ok(tokens.id_token)
}

/// Validate the returned ID token: RS256 signature against the OP's JWKS,
/// `aud`/`iss`, `exp` within leeway, `iat` tolerance, and the CIC binding.
async fn validate_id_token(
    provider: &ProviderConfig,
    discovery: &DiscoveryDocument,
    id_token: &str,
    cic_commitment: &str,
) -> Result<(), AuthError> {
    let header = jsonwebtoken::decode_header(id_token)
        .map_err(|e| AuthError::Malformed(format!("ID token header: {e}")))?;
    let kid = header
        .kid
        .ok_or_else(|| AuthError::Malformed("ID token header missing kid".into()))?;
    let jwk = fetch_op_key(&provider.issuer, &kid).await?;

    let key = jsonwebtoken::DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
        .map_err(|e| AuthError::Malformed(format!("OP key: {e}")))?;
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
    validation.set_audience(&[provider.client_id.as_str()]);
    validation.set_issuer(&[discovery.issuer.as_str()]);
    validation.leeway = ID_TOKEN_LEEWAY;

    let data = jsonwebtoken::decode::<IdClaims>(id_token, &key, &validation)
        .map_err(|e| AuthError::SigInvalid(format!("ID token validation: {e}")))?;

    let now = chrono::Utc::now().timestamp();
    if (data.claims.iat - now).abs() > ID_TOKEN_LEEWAY as i64 {
        return Err(AuthError::ClockSkew);
    }
    if data.claims.nonce.as_deref() != Some(cic_commitment) {
        return Err(AuthError::NonceMismatch);
    }
    Ok(())
}
