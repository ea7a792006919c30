//! axum adapter for the protectors.
//!
//! The middleware chain is security headers, then DDoS, then API protection,
//! outermost first, so hardening headers also land on rejections.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::USER_AGENT;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{RatewallError, Result};
use crate::protection::{ClientInfo, Decision, ErrorBody, Protection};

/// Authenticated identity, inserted into request extensions by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

/// Address used when none can be determined.
const UNKNOWN_IP: &str = "unknown";

/// Client address.
///
/// When the socket peer is one of `trusted_proxies` this is the first
/// `X-Forwarded-For` entry, then `X-Real-IP`, then the peer itself. Any other
/// peer is taken as the client, whatever headers it sends.
pub fn client_ip(req: &Request, trusted_proxies: &HashSet<IpAddr>) -> String {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());
    match peer {
        Some(peer) if trusted_proxies.contains(&peer) => {
            forwarded_ip(req.headers()).unwrap_or_else(|| peer.to_string())
        }
        Some(peer) => peer.to_string(),
        None => UNKNOWN_IP.to_string(),
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let from = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    from("x-forwarded-for").or_else(|| from("x-real-ip"))
}

fn client_info(req: &Request, trusted_proxies: &HashSet<IpAddr>) -> ClientInfo {
    let principal = req.extensions().get::<Principal>().map(|p| p.0.as_str());
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    ClientInfo::new(
        client_ip(req, trusted_proxies),
        principal,
        user_agent,
        req.uri().path(),
    )
}

fn append_headers<'a, 'b>(
    target: &mut HeaderMap,
    headers: impl IntoIterator<Item = (&'a str, &'b str)>,
) {
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid response header"),
        }
    }
}

/// Run `next` or short-circuit, as `decision` says.
async fn apply(decision: Decision, req: Request, next: Next) -> Response {
    match decision {
        Decision::Continue { headers } => {
            let mut response = next.run(req).await;
            append_headers(
                response.headers_mut(),
                headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
            );
            response
        }
        Decision::Reject {
            status,
            headers,
            body,
        } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
            let mut response = (status, Json(body)).into_response();
            append_headers(
                response.headers_mut(),
                headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
            );
            response
        }
    }
}

pub async fn security_headers_middleware(
    State(protection): State<Arc<Protection>>,
    req: Request,
    next: Next,
) -> Response {
    let mut response = next.run(req).await;
    append_headers(response.headers_mut(), protection.headers.headers());
    response
}

pub async fn ddos_middleware(
    State(protection): State<Arc<Protection>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req, &protection.trusted_proxies);
    let decision = protection.ddos.check(&ip).await;
    apply(decision, req, next).await
}

pub async fn api_protection_middleware(
    State(protection): State<Arc<Protection>>,
    req: Request,
    next: Next,
) -> Response {
    let client = client_info(&req, &protection.trusted_proxies);
    match protection.api.check_request(&client).await {
        Ok(decision) => apply(decision, req, next).await,
        Err(e) => {
            warn!(client = %client, error = %e, "API protection failed");
            let body = ErrorBody {
                error: "Internal server error".to_string(),
                retry_after: None,
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(protection): State<Arc<Protection>>) -> String {
    format!(
        "ratewall_blocked_addresses {}\nratewall_strategies {}\n",
        protection.ddos.blocklist().blocked_count(),
        protection.manager.strategy_ids().len()
    )
}

async fn echo(uri: Uri, req: Request<Body>) -> Json<serde_json::Value> {
    let principal = req.extensions().get::<Principal>().map(|p| p.0.clone());
    Json(json!({ "path": uri.path(), "principal": principal }))
}

/// The service router with the full protection chain applied.
pub fn router(protection: Arc<Protection>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/echo", get(echo).post(echo))
        .layer(middleware::from_fn_with_state(
            protection.clone(),
            api_protection_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            protection.clone(),
            ddos_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            protection.clone(),
            security_headers_middleware,
        ))
        .with_state(protection)
}

/// Serve `app` until `shutdown` resolves, exposing peer addresses to the
/// middleware.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP server listening");
    }
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| RatewallError::Http(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::RatewallConfig;
    use tower::ServiceExt;

    const PROXY: [u8; 4] = [10, 0, 0, 254];

    fn app(configure: impl FnOnce(&mut RatewallConfig)) -> Router {
        let mut config = RatewallConfig::default();
        config.api_protection.default_strategy = "sliding_window".to_string();
        config.api_protection.default_limit = 2;
        config.server.trusted_proxies = vec![IpAddr::from(PROXY)];
        configure(&mut config);
        let protection = Protection::from_config(Arc::new(MemoryCache::new()), &config).unwrap();
        router(Arc::new(protection))
    }

    fn from_peer(peer: [u8; 4], path: &str, forwarded: Option<&str>) -> Request<Body> {
        let mut builder = axum::http::Request::builder()
            .uri(path)
            .extension(ConnectInfo(SocketAddr::from((peer, 4000))));
        if let Some(ip) = forwarded {
            builder = builder.header("x-forwarded-for", format!("{}, 10.0.0.1", ip));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn get_from(path: &str, ip: &str) -> Request<Body> {
        from_peer(PROXY, path, Some(ip))
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_quota_headers_then_429() {
        let app = app(|_| {});

        let ok = app.clone().oneshot(get_from("/api/echo", "1.1.1.1")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["x-ratelimit-limit"], "2");
        assert_eq!(ok.headers()["x-ratelimit-remaining"], "1");
        assert_eq!(ok.headers()["x-frame-options"], "DENY");

        app.clone().oneshot(get_from("/api/echo", "1.1.1.1")).await.unwrap();
        let limited = app.clone().oneshot(get_from("/api/echo", "1.1.1.1")).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key("retry-after"));
        assert_eq!(limited.headers()["x-content-type-options"], "nosniff");
        let body = json_body(limited).await;
        assert!(body["error"].is_string());
        assert!(body["retry_after"].as_u64().unwrap() > 0);

        // A different forwarded address has its own quota.
        let other = app.oneshot(get_from("/api/echo", "2.2.2.2")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_skip_paths_are_unlimited() {
        let app = app(|_| {});
        for _ in 0..5 {
            let response = app.clone().oneshot(get_from("/health", "1.1.1.1")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(!response.headers().contains_key("x-ratelimit-limit"));
        }
    }

    #[tokio::test]
    async fn test_principal_extension_scopes_quota() {
        let app = app(|c| {
            c.api_protection.principal_denylist = vec!["mallory".to_string()];
        });

        let request = |who: &str| {
            axum::http::Request::builder()
                .uri("/api/echo")
                .extension(Principal(who.to_string()))
                .body(Body::empty())
                .unwrap()
        };

        let ok = app.clone().oneshot(request("alice")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["principal"], "alice");

        let denied = app.oneshot(request("mallory")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ddos_deny_list_rejects_before_quota() {
        let app = app(|c| {
            c.ddos_protection.denylist = vec!["6.6.6.6".to_string()];
        });
        let response = app.oneshot(get_from("/api/echo", "6.6.6.6")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_untrusted_peer_cannot_spoof_address() {
        let app = app(|_| {});
        let attacker = [203, 0, 113, 7];

        // Rotating the forwarded address does not buy a fresh quota.
        for spoofed in ["1.1.1.1", "2.2.2.2"] {
            let response = app
                .clone()
                .oneshot(from_peer(attacker, "/api/echo", Some(spoofed)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let limited = app
            .clone()
            .oneshot(from_peer(attacker, "/api/echo", Some("3.3.3.3")))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

        // The spoofed addresses were never charged.
        let proxied = app.oneshot(get_from("/api/echo", "1.1.1.1")).await.unwrap();
        assert_eq!(proxied.status(), StatusCode::OK);
        assert_eq!(proxied.headers()["x-ratelimit-remaining"], "1");
    }

    #[test]
    fn test_client_ip_fallbacks() {
        let trusted: HashSet<IpAddr> = [IpAddr::from(PROXY)].into_iter().collect();

        let req = axum::http::Request::builder()
            .uri("/")
            .header("x-real-ip", "9.9.9.9")
            .extension(ConnectInfo(SocketAddr::from((PROXY, 4000))))
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req, &trusted), "9.9.9.9");
        assert_eq!(client_ip(&req, &HashSet::new()), "10.0.0.254");

        let req = from_peer(PROXY, "/", None);
        assert_eq!(client_ip(&req, &trusted), "10.0.0.254");

        let req = from_peer([127, 0, 0, 1], "/", Some("8.8.8.8"));
        assert_eq!(client_ip(&req, &trusted), "127.0.0.1");

        let req = axum::http::Request::builder()
            .uri("/")
            .header("x-forwarded-for", "8.8.8.8")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&req, &trusted), UNKNOWN_IP);
    }
}
