//! HTTP admission API for the coordinator
//!
//! A single `POST /join` endpoint implements the admission protocol:
//! authenticate the shared token, validate the caller's public key, and
//! either return the address already assigned to that key or allocate a
//! fresh one, push the peer to the live device, and persist the grown
//! membership before replying.
//!
//! Allocation, device application, and persistence run as one critical
//! section under a per-interface mutex, so concurrent joins can never be
//! handed the same address and the config file on disk never runs ahead of
//! the device.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::device::InterfaceController;
use crate::error::{Error, Result};
use crate::keys;
use crate::net::AddressPool;
use crate::store::{MembershipSnapshot, PeerRecord};

/// Shared coordinator state
pub struct AppState {
    /// The out-of-band join token
    pub token: String,
    /// Path of the persisted membership config
    pub config_path: PathBuf,
    /// Live device access
    pub controller: InterfaceController,
    /// Current membership; the join critical section locks this
    pub snapshot: Mutex<MembershipSnapshot>,
}

// ============ Request/Response Types ============

/// Join request body
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub public_key: String,
}

/// Successful admission response
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub assigned_ip: Ipv4Addr,
    pub server_public_key: String,
    pub peers: Vec<PeerInfo>,
}

/// One entry of the peer list returned to joiners for mesh discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub public_key: String,
    pub allowed_ip: Ipv4Net,
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub interface: String,
    pub peers: usize,
}

// ============ Router ============

/// Build the admission router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/join", post(handle_join))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve the admission API
pub async fn serve(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("join API listening on {}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Handlers ============

async fn handle_join(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: std::result::Result<Json<JoinRequest>, JsonRejection>,
) -> Response {
    let token = headers.get("x-token").and_then(|v| v.to_str().ok());
    let result = match body {
        Ok(Json(req)) => admit(&state, token, &req.public_key).await,
        // Unparseable and missing-field bodies both answer 400, so fold
        // the axum rejection into Validation.
        Err(rejection) => {
            // A bad token takes precedence over a bad body: no request
            // detail is inspected before authentication.
            if !token_matches(&state.token, token) {
                Err(Error::Auth)
            } else {
                Err(Error::Validation(format!("malformed body: {rejection}")))
            }
        }
    };

    match result {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.snapshot.lock().await;
    Json(HealthResponse {
        healthy: true,
        interface: snapshot.identity.name.clone(),
        peers: snapshot.peers.len(),
    })
}

// ============ Admission protocol ============

/// Run the admission protocol for one join request.
///
/// Token check, key validation, then — under the membership lock — the
/// idempotency check and, for new keys, allocate / apply-to-device /
/// persist, in that order. Persistence only happens after the device
/// accepted the peer.
pub async fn admit(
    state: &AppState,
    token: Option<&str>,
    public_key_b64: &str,
) -> Result<JoinResponse> {
    if !token_matches(&state.token, token) {
        warn!("join rejected: bad or missing token");
        return Err(Error::Auth);
    }

    let public_key = keys::parse_public_key(public_key_b64)
        .map_err(|e| Error::Validation(format!("public_key: {e}")))?;
    let prefix = keys::key_prefix(&public_key);

    let mut snapshot = state.snapshot.lock().await;

    if let Some(existing) = snapshot.find_peer(&public_key) {
        info!(peer = %prefix, ip = %existing.address, "known peer rejoined");
        return Ok(build_response(&snapshot, existing.address));
    }

    let pool = AddressPool::new(snapshot.identity.subnet);
    let taken = snapshot.taken_addresses();
    let address = pool.allocate(&taken).map_err(|e| {
        warn!(peer = %prefix, subnet = %pool.subnet(), "allocation failed: {e}");
        e
    })?;

    let record = PeerRecord {
        public_key,
        address,
    };
    state.controller.apply_peer(&snapshot.identity.name, &record)?;

    snapshot.peers.push(record);
    if let Err(e) = snapshot.save(&state.config_path) {
        // The live device already accepted the peer; keep the in-memory
        // record aligned with it and surface the persistence failure.
        warn!(peer = %prefix, "device updated but membership save failed: {e}");
        return Err(e);
    }

    info!(
        peer = %prefix,
        ip = %address,
        subnet = %pool.subnet(),
        peers = snapshot.peers.len(),
        "admitted new peer"
    );
    Ok(build_response(&snapshot, address))
}

fn token_matches(expected: &str, provided: Option<&str>) -> bool {
    match provided {
        Some(p) => expected.as_bytes().ct_eq(p.as_bytes()).into(),
        None => false,
    }
}

fn build_response(snapshot: &MembershipSnapshot, assigned_ip: Ipv4Addr) -> JoinResponse {
    JoinResponse {
        assigned_ip,
        server_public_key: snapshot.identity.keypair.public_base64(),
        peers: snapshot
            .peers
            .iter()
            .map(|p| PeerInfo {
                public_key: keys::public_key_base64(&p.public_key),
                allowed_ip: Ipv4Net::from(p.address),
            })
            .collect(),
    }
}

fn error_response(err: Error) -> Response {
    let (status, code) = match &err {
        Error::Auth => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
        Error::Validation(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        Error::Exhausted { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "POOL_EXHAUSTED"),
        Error::Device { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "DEVICE_ERROR"),
        Error::Io(_) | Error::ConfigCorrupt(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR")
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    use super::*;
    use crate::device::mock::MockDevice;
    use crate::keys::KeyPair;

    const TOKEN: &str = "sekrit";

    fn test_state(subnet: &str) -> (Arc<AppState>, Arc<MockDevice>, TempDir) {
        let dir = tempdir().unwrap();
        let device = Arc::new(MockDevice::new());
        let controller = InterfaceController::new(device.clone());
        let identity = controller
            .discover_or_create("wg0", subnet.parse().unwrap(), 51820)
            .unwrap();
        let snapshot = MembershipSnapshot::new(identity);
        let config_path = dir.path().join("wg0.conf");
        snapshot.save(&config_path).unwrap();

        let state = Arc::new(AppState {
            token: TOKEN.to_string(),
            config_path,
            controller,
            snapshot: Mutex::new(snapshot),
        });
        (state, device, dir)
    }

    #[tokio::test]
    async fn test_join_scenario_slash_29() {
        let (state, _device, _dir) = test_state("10.0.0.0/29");
        let first = KeyPair::generate();
        let second = KeyPair::generate();

        let resp = admit(&state, Some(TOKEN), &first.public_base64()).await.unwrap();
        assert_eq!(resp.assigned_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(resp.peers.len(), 1);

        let resp = admit(&state, Some(TOKEN), &second.public_base64()).await.unwrap();
        assert_eq!(resp.assigned_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(resp.peers.len(), 2);

        // Rejoining with the first key changes nothing.
        let resp = admit(&state, Some(TOKEN), &first.public_base64()).await.unwrap();
        assert_eq!(resp.assigned_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(state.snapshot.lock().await.peers.len(), 2);
    }

    #[tokio::test]
    async fn test_rejoin_touches_neither_device_nor_disk() {
        let (state, device, _dir) = test_state("10.0.0.0/29");
        let kp = KeyPair::generate();

        admit(&state, Some(TOKEN), &kp.public_base64()).await.unwrap();
        let calls_after_first = device.apply_calls.load(std::sync::atomic::Ordering::SeqCst);

        admit(&state, Some(TOKEN), &kp.public_base64()).await.unwrap();
        assert_eq!(
            device.apply_calls.load(std::sync::atomic::Ordering::SeqCst),
            calls_after_first
        );
        assert_eq!(device.peer_count("wg0"), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_on_slash_30() {
        let (state, _device, _dir) = test_state("10.0.0.0/30");

        let a = admit(&state, Some(TOKEN), &KeyPair::generate().public_base64())
            .await
            .unwrap();
        let b = admit(&state, Some(TOKEN), &KeyPair::generate().public_base64())
            .await
            .unwrap();
        assert_ne!(a.assigned_ip, b.assigned_ip);

        let err = admit(&state, Some(TOKEN), &KeyPair::generate().public_base64())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_bad_token_has_no_side_effects() {
        let (state, device, _dir) = test_state("10.0.0.0/29");
        let kp = KeyPair::generate();

        let err = admit(&state, Some("wrong"), &kp.public_base64()).await.unwrap_err();
        assert!(matches!(err, Error::Auth));
        let err = admit(&state, None, &kp.public_base64()).await.unwrap_err();
        assert!(matches!(err, Error::Auth));

        assert_eq!(device.apply_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(state.snapshot.lock().await.peers.is_empty());
        let on_disk = MembershipSnapshot::load(&state.config_path, "wg0").unwrap();
        assert!(on_disk.peers.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_public_key_is_validation_error() {
        let (state, _device, _dir) = test_state("10.0.0.0/29");
        let err = admit(&state, Some(TOKEN), "not a key").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_concurrent_joins_get_distinct_addresses() {
        let (state, _device, _dir) = test_state("10.0.0.0/28");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                let kp = KeyPair::generate();
                admit(&state, Some(TOKEN), &kp.public_base64()).await
            }));
        }

        let mut assigned = HashSet::new();
        for handle in handles {
            let resp = handle.await.unwrap().unwrap();
            assert!(assigned.insert(resp.assigned_ip), "duplicate address");
        }
        assert_eq!(assigned.len(), 8);
        assert_eq!(state.snapshot.lock().await.peers.len(), 8);

        // Disk agrees with memory.
        let on_disk = MembershipSnapshot::load(&state.config_path, "wg0").unwrap();
        assert_eq!(on_disk.peers.len(), 8);
    }

    #[tokio::test]
    async fn test_device_failure_leaves_membership_unchanged() {
        let (state, device, _dir) = test_state("10.0.0.0/29");
        device.fail_apply.store(true, std::sync::atomic::Ordering::SeqCst);

        let err = admit(&state, Some(TOKEN), &KeyPair::generate().public_base64())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Device { .. }));

        assert!(state.snapshot.lock().await.peers.is_empty());
        let on_disk = MembershipSnapshot::load(&state.config_path, "wg0").unwrap();
        assert!(on_disk.peers.is_empty());

        // The failed slot is reallocated once the device recovers.
        device.fail_apply.store(false, std::sync::atomic::Ordering::SeqCst);
        let resp = admit(&state, Some(TOKEN), &KeyPair::generate().public_base64())
            .await
            .unwrap();
        assert_eq!(resp.assigned_ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    fn join_request(token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/join")
            .header("content-type", "application/json");
        if let Some(t) = token {
            builder = builder.header("X-Token", t);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_http_join_happy_path() {
        let (state, _device, _dir) = test_state("10.0.0.0/29");
        let app = router(state);

        let kp = KeyPair::generate();
        let body = serde_json::to_string(&JoinRequest {
            public_key: kp.public_base64(),
        })
        .unwrap();
        let response = app.oneshot(join_request(Some(TOKEN), &body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let resp: JoinResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp.assigned_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].allowed_ip, "10.0.0.1/32".parse().unwrap());
    }

    #[tokio::test]
    async fn test_http_statuses() {
        let (state, _device, _dir) = test_state("10.0.0.0/29");
        let app = router(state);

        let body = serde_json::to_string(&JoinRequest {
            public_key: KeyPair::generate().public_base64(),
        })
        .unwrap();

        // Missing token -> 401, even with a valid body.
        let response = app
            .clone()
            .oneshot(join_request(None, &body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Malformed body -> 400.
        let response = app
            .clone()
            .oneshot(join_request(Some(TOKEN), "{\"nope\":1}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Malformed key -> 400.
        let response = app
            .clone()
            .oneshot(join_request(Some(TOKEN), "{\"public_key\":\"zzz\"}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Wrong method -> 405.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/join")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        // Health endpoint.
        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
