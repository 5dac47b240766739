//! HTTPService: the mTLS HTTPS surface exposing `/health`, `/register`,
//! `/heartbeat`, `/deregister`, `/route`, `/capabilities`, `/workers`.

use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{BoxError, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Instrument};

/// Per-request deadline from the transport, per the concurrency model: a
/// handler that hasn't responded within this window is cut off rather than
/// left to run indefinitely against a stuck client or a wedged lock holder.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

use crate::capability::CapabilityDefinition;
use crate::error::ControllerError;
use crate::identity;
use crate::registry::{CapabilityRegistry, RegistryError};
use crate::routing::RouteContext;
use crate::trace_context::continue_or_start_trace;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CapabilityRegistry>,
}

/// The peer's SPIFFE identity, extracted once per TLS connection and carried on
/// every request over that connection as an axum extension.
#[derive(Clone, Debug, Default)]
pub struct PeerIdentity(pub Option<String>);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/deregister", post(deregister))
        .route("/route", post(route))
        .route("/capabilities", get(capabilities))
        .route("/workers", get(workers))
        .layer(axum::middleware::from_fn(echo_traceparent))
        .layer(TraceLayer::new_for_http())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_request_timeout))
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

/// `TimeoutLayer` signals an overrun by returning an error rather than a
/// response; `HandleErrorLayer` is what lets that error surface as an actual
/// HTTP response instead of failing the whole service.
async fn handle_request_timeout(_err: BoxError) -> impl IntoResponse {
    (
        StatusCode::REQUEST_TIMEOUT,
        Json(json!({"error": "request_timeout"})),
    )
}

/// Echoes the inbound `traceparent` back onto every response, success or error,
/// so logs, traces, and the client's own failure handling correlate on the same
/// trace id per §7.
async fn echo_traceparent(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let traceparent = req.headers().get("traceparent").cloned();
    let mut response = next.run(req).await;
    if let Some(value) = traceparent {
        response.headers_mut().insert("traceparent", value);
    }
    response
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    worker_id: String,
    worker_url: String,
    capabilities: Vec<CapabilityDefinition>,
}

async fn register(
    State(state): State<AppState>,
    peer: axum::extract::Extension<PeerIdentity>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ControllerError> {
    let span = info_span!("controller./register", worker_id = %body.worker_id);
    continue_or_start_trace(&span, traceparent_header(&headers));

    async move {
        state.registry.register(
            &body.worker_id,
            &body.worker_url,
            body.capabilities,
            peer.0 .0.clone(),
            Utc::now(),
        )?;

        info!(worker_id = %body.worker_id, outcome = "registered", "request handled");
        Ok(Json(json!({"status": "registered", "worker_id": body.worker_id})))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    worker_id: String,
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ControllerError> {
    let span = info_span!("controller./heartbeat", worker_id = %body.worker_id);
    continue_or_start_trace(&span, traceparent_header(&headers));

    async move {
        let now = Utc::now();
        match state.registry.heartbeat(&body.worker_id, now) {
            Ok(()) => {
                info!(worker_id = %body.worker_id, outcome = "acknowledged", "request handled");
                Ok(Json(
                    json!({"status": "acknowledged", "timestamp": now.to_rfc3339()}),
                ))
            }
            Err(RegistryError::WorkerNotRegistered(id)) => {
                warn!(worker_id = %id, outcome = "worker_not_registered", "request handled");
                Err(ControllerError::WorkerNotRegistered { worker_id: id })
            }
            Err(other) => Err(ControllerError::Internal(other.to_string())),
        }
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
struct DeregisterRequest {
    worker_id: String,
}

async fn deregister(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DeregisterRequest>,
) -> impl IntoResponse {
    let span = info_span!("controller./deregister", worker_id = %body.worker_id);
    continue_or_start_trace(&span, traceparent_header(&headers));

    async move {
        state.registry.deregister(&body.worker_id, Utc::now());
        info!(worker_id = %body.worker_id, outcome = "deregistered", "request handled");
        Json(json!({"status": "deregistered"}))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
struct RouteRequest {
    verb: String,
    capability: String,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    slo_constraints: Option<serde_json::Value>,
    #[serde(default)]
    budget_tokens: Option<f64>,
}

async fn route(
    State(state): State<AppState>,
    peer: axum::extract::Extension<PeerIdentity>,
    headers: HeaderMap,
    Json(body): Json<RouteRequest>,
) -> Result<impl IntoResponse, ControllerError> {
    let capability_key = format!("{}:{}", body.verb, body.capability);
    let span = info_span!("controller./route", capability = %capability_key);
    continue_or_start_trace(&span, traceparent_header(&headers));

    async move {
        let ctx = RouteContext {
            slo_constraints: body.slo_constraints,
            requester_identity: peer.0 .0.clone(),
            budget_tokens: body.budget_tokens,
            idempotency_key: body.idempotency_key,
        };

        match state
            .registry
            .route(&body.verb, &body.capability, &ctx, Utc::now())
        {
            Ok(outcome) => {
                info!(worker_id = %outcome.worker_id, outcome = "routed", "request handled");
                Ok(Json(
                    json!({"worker_id": outcome.worker_id, "worker_url": outcome.worker_url}),
                ))
            }
            Err(RegistryError::NoWorkerAvailable(capability)) => {
                warn!(capability = %capability, outcome = "no_route", "request handled");
                Err(ControllerError::NoWorkerAvailable { capability })
            }
            Err(other) => Err(ControllerError::Internal(other.to_string())),
        }
    }
    .instrument(span)
    .await
}

#[derive(Debug, Serialize)]
struct CapabilityView {
    verb: String,
    name: String,
    version: String,
    workers: Vec<String>,
    healthy_workers: usize,
}

async fn capabilities(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let listings: Vec<CapabilityView> = state
        .registry
        .get_all_capabilities(now)
        .into_iter()
        .map(|l| CapabilityView {
            verb: l.verb,
            name: l.name,
            version: l.version,
            workers: l.workers,
            healthy_workers: l.healthy_workers,
        })
        .collect();

    Json(listings)
}

#[derive(Debug, Serialize)]
struct WorkerView {
    worker_id: String,
    worker_url: String,
    last_heartbeat: chrono::DateTime<Utc>,
    is_healthy: bool,
    capabilities: Vec<CapabilityDefinition>,
}

async fn workers(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let views: Vec<WorkerView> = state
        .registry
        .get_all_workers_with_health(now)
        .into_iter()
        .map(|(w, is_healthy)| WorkerView {
            is_healthy,
            worker_id: w.worker_id,
            worker_url: w.worker_url,
            last_heartbeat: w.last_heartbeat_at,
            capabilities: w.capabilities,
        })
        .collect();

    Json(views)
}

fn traceparent_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("traceparent").and_then(|v| v.to_str().ok())
}

/// Accept loop: terminate TLS with required client auth, extract the peer's
/// SPIFFE identity from the handshake certificate, and hand the connection to
/// the axum router. A failed handshake (missing or invalid client cert) simply
/// drops the connection — no handler runs and nothing is logged to the recovery
/// log, matching the "401 at the TLS layer" failure semantics.
pub async fn serve(
    router: Router,
    listener: TcpListener,
    tls_config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTPS listener bound");
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("failed to accept TCP connection: {}", e);
                        continue;
                    }
                };

                let acceptor = acceptor.clone();
                let router = router.clone();

                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(%peer_addr, "mTLS handshake failed: {}", e);
                            return;
                        }
                    };

                    let peer_identity = peer_certificate_der(&tls_stream)
                        .and_then(|der| identity::extract_spiffe_id(&der));

                    let router = router.layer(axum::Extension(PeerIdentity(peer_identity)));
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let service = hyper_util::service::TowerToHyperService::new(router);

                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .serve_connection(io, service)
                    .await
                    {
                        error!(%peer_addr, "connection error: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("HTTPS listener stopping: no longer accepting new connections");
                    break;
                }
            }
        }
    }

    Ok(())
}

fn peer_certificate_der(
    stream: &tokio_rustls::server::TlsStream<tokio::net::TcpStream>,
) -> Option<CertificateDer<'static>> {
    let (_, conn) = stream.get_ref();
    conn.peer_certificates()?.first().cloned().map(|c| c.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityDefinition;
    use crate::registry::CapabilityRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            registry: Arc::new(CapabilityRegistry::new(120, None)),
        }
    }

    fn cap(verb: &str, name: &str) -> CapabilityDefinition {
        CapabilityDefinition {
            name: name.to_string(),
            verb: verb.to_string(),
            version: "1.0.0".to_string(),
            input_schema: json!({}),
            output_schema: json!({}),
            requires_gpu: false,
            max_concurrency: 1,
            runtime: None,
            env_profile: None,
            constraints: None,
            slo: None,
            spiffe_id: None,
            required_capabilities: None,
            cost_tokens_per_invocation: None,
            slo_bid: None,
            controller_affinity: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn health_returns_200() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_then_route_end_to_end() {
        let state = test_state();
        let app = build_router(state).layer(axum::Extension(PeerIdentity(None)));

        let register_body = json!({
            "worker_id": "w1",
            "worker_url": "https://w1:8500",
            "capabilities": [cap("greet", "hello")],
        });
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("content-type", "application/json")
                    .body(Body::from(register_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let route_body = json!({"verb": "greet", "capability": "hello"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/route")
                    .header("content-type", "application/json")
                    .body(Body::from(route_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// `/workers` must judge health against the registry's own configured
    /// `stale_timeout`, not a hardcoded window, so it agrees with
    /// `cleanup_stale`/`/capabilities` regardless of `STALE_TIMEOUT_SECONDS`.
    #[tokio::test]
    async fn workers_reports_health_against_the_configured_stale_timeout() {
        let state = AppState {
            registry: Arc::new(CapabilityRegistry::new(0, None)),
        };
        let app = build_router(state).layer(axum::Extension(PeerIdentity(None)));

        let register_body = json!({
            "worker_id": "w1",
            "worker_url": "https://w1:8500",
            "capabilities": [cap("greet", "hello")],
        });
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("content-type", "application/json")
                    .body(Body::from(register_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/workers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let views: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(
            views[0]["is_healthy"], false,
            "a zero-second stale_timeout must mark every worker unhealthy immediately, \
             not fall back to a hardcoded 120s window"
        );
    }

    #[tokio::test]
    async fn heartbeat_unknown_worker_returns_404() {
        let state = test_state();
        let app = build_router(state);

        let body = json!({"worker_id": "ghost"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/heartbeat")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn error_response_echoes_inbound_traceparent() {
        let state = test_state();
        let app = build_router(state);

        let traceparent = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        let body = json!({"worker_id": "ghost"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/heartbeat")
                    .header("content-type", "application/json")
                    .header("traceparent", traceparent)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("traceparent").unwrap(),
            traceparent
        );
    }

    /// Scenario 6: `"max_concurrency": 0` → `400 {"error":"invalid_capability","field":"max_concurrency"}`.
    #[tokio::test]
    async fn register_with_invalid_capability_returns_400() {
        let state = test_state();
        let app = build_router(state.clone()).layer(axum::Extension(PeerIdentity(None)));

        let mut bad = cap("greet", "hello");
        bad.max_concurrency = 0;
        let body = json!({
            "worker_id": "w1",
            "worker_url": "https://w1:8500",
            "capabilities": [bad],
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/register")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response_body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json_body: serde_json::Value = serde_json::from_slice(&response_body).unwrap();
        assert_eq!(
            json_body,
            json!({"error": "invalid_capability", "field": "max_concurrency"})
        );

        assert!(state.registry.get_all_workers().is_empty());
    }

    /// Self-signed CA/server/client cert fixture for the real-socket mTLS tests
    /// below. Generated fresh per test so no fixture files live in the repo.
    mod tls_fixture {
        use std::path::PathBuf;
        use tempfile::TempDir;

        pub struct TlsFixture {
            pub _dir: TempDir,
            pub ca_cert_path: PathBuf,
            pub server_cert_path: PathBuf,
            pub server_key_path: PathBuf,
            pub ca_cert_der: Vec<u8>,
            pub client_cert_der: Vec<u8>,
            pub client_key_der: Vec<u8>,
        }

        pub fn build(spiffe_id: &str) -> TlsFixture {
            use rcgen::{BasicConstraints, CertificateParams, DnType, Ia5String, IsCa, KeyPair, SanType};

            let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
            ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            ca_params.distinguished_name.push(DnType::CommonName, "crank-test-ca");
            let ca_key = KeyPair::generate().unwrap();
            let ca_cert = ca_params.self_signed(&ca_key).unwrap();

            let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            server_params
                .distinguished_name
                .push(DnType::CommonName, "crank-controller-test");
            let server_key = KeyPair::generate().unwrap();
            let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

            let mut client_params = CertificateParams::new(Vec::new()).unwrap();
            client_params
                .distinguished_name
                .push(DnType::CommonName, "crank-worker-test");
            client_params.subject_alt_names =
                vec![SanType::URI(Ia5String::try_from(spiffe_id.to_string()).unwrap())];
            let client_key = KeyPair::generate().unwrap();
            let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key).unwrap();

            let dir = TempDir::new().unwrap();
            let ca_cert_path = dir.path().join("ca.pem");
            let server_cert_path = dir.path().join("server.pem");
            let server_key_path = dir.path().join("server.key");

            std::fs::write(&ca_cert_path, ca_cert.pem()).unwrap();
            std::fs::write(&server_cert_path, server_cert.pem()).unwrap();
            std::fs::write(&server_key_path, server_key.serialize_pem()).unwrap();

            TlsFixture {
                ca_cert_der: ca_cert.der().to_vec(),
                client_cert_der: client_cert.der().to_vec(),
                client_key_der: client_key.serialize_der(),
                _dir: dir,
                ca_cert_path,
                server_cert_path,
                server_key_path,
            }
        }

        pub fn client_config(
            fixture: &TlsFixture,
            present_client_cert: bool,
        ) -> std::sync::Arc<tokio_rustls::rustls::ClientConfig> {
            use tokio_rustls::rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
            use tokio_rustls::rustls::{ClientConfig, RootCertStore};

            let mut roots = RootCertStore::empty();
            roots
                .add(CertificateDer::from(fixture.ca_cert_der.clone()))
                .unwrap();

            let builder = ClientConfig::builder().with_root_certificates(roots);

            let config = if present_client_cert {
                let cert = CertificateDer::from(fixture.client_cert_der.clone());
                let key = PrivatePkcs8KeyDer::from(fixture.client_key_der.clone());
                builder.with_client_auth_cert(vec![cert], key.into()).unwrap()
            } else {
                builder.with_no_client_auth()
            };

            std::sync::Arc::new(config)
        }
    }

    /// A real TCP/TLS round trip: client presents a certificate with a
    /// `spiffe://` SAN, the server extracts it during the handshake, and the
    /// identity shows up on the `WorkerRecord` created by the `/register` call
    /// that rides the same connection.
    #[tokio::test]
    async fn mtls_round_trip_extracts_spiffe_identity_from_client_cert() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let fixture = tls_fixture::build("spiffe://mesh/worker/w1");
        let tls_config = crate::tls::build_server_config(
            &fixture.ca_cert_path,
            &fixture.server_cert_path,
            &fixture.server_key_path,
        )
        .unwrap();

        let state = test_state();
        let router = build_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve_handle = tokio::spawn(serve(router, listener, tls_config, shutdown_rx));

        let connector = tokio_rustls::TlsConnector::from(tls_fixture::client_config(&fixture, true));
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from("localhost")
            .unwrap()
            .to_owned();

        let tcp = connect_with_retry(addr).await;
        let mut tls_stream = connector.connect(server_name, tcp).await.unwrap();

        let register_body = json!({
            "worker_id": "w1",
            "worker_url": "https://w1:8500",
            "capabilities": [cap("greet", "hello")],
        })
        .to_string();
        let request = format!(
            "POST /register HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            register_body.len(),
            register_body
        );
        tls_stream.write_all(request.as_bytes()).await.unwrap();
        tls_stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        tls_stream.read_to_end(&mut response).await.unwrap();
        let response_text = String::from_utf8_lossy(&response);
        assert!(response_text.contains("200 OK"), "unexpected response: {response_text}");

        let worker = state
            .registry
            .get_all_workers()
            .into_iter()
            .next()
            .expect("registration should have committed");
        assert_eq!(
            worker.peer_identity.as_deref(),
            Some("spiffe://mesh/worker/w1")
        );

        serve_handle.abort();
    }

    /// A client that presents no certificate at all never completes the TLS
    /// handshake against a controller that requires one.
    #[tokio::test]
    async fn connection_without_client_certificate_is_rejected_at_handshake() {
        let fixture = tls_fixture::build("spiffe://mesh/worker/w2");
        let tls_config = crate::tls::build_server_config(
            &fixture.ca_cert_path,
            &fixture.server_cert_path,
            &fixture.server_key_path,
        )
        .unwrap();

        let router = build_router(test_state());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve_handle = tokio::spawn(serve(router, listener, tls_config, shutdown_rx));

        let connector = tokio_rustls::TlsConnector::from(tls_fixture::client_config(&fixture, false));
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from("localhost")
            .unwrap()
            .to_owned();

        let tcp = connect_with_retry(addr).await;
        let result = connector.connect(server_name, tcp).await;
        assert!(result.is_err(), "handshake should fail without a client certificate");

        serve_handle.abort();
    }

    /// The accept loop starts asynchronously; retry the connect briefly instead
    /// of sleeping a fixed guess.
    async fn connect_with_retry(addr: std::net::SocketAddr) -> tokio::net::TcpStream {
        for _ in 0..50 {
            if let Ok(stream) = tokio::net::TcpStream::connect(addr).await {
                return stream;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        tokio::net::TcpStream::connect(addr)
            .await
            .expect("controller listener never became reachable")
    }
}
