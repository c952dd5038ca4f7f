//! Request filter applied ahead of routing: host allow-list, per-IP rate
//! limiting and response hardening headers, always in that order.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::HOST, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::{
    config::AppConfig,
    error::AppError,
    rate_limit::{RateDecision, RateLimiter},
};

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone)]
pub struct HostPolicy {
    pub allowed_hosts: Vec<String>,
    pub trust_forwarded_host: bool,
    pub trusted_proxy_ips: Vec<IpAddr>,
}

impl HostPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            allowed_hosts: config.allowed_hosts.clone(),
            trust_forwarded_host: config.trust_forwarded_host,
            trusted_proxy_ips: config.trusted_proxy_ips.clone(),
        }
    }

    /// Host the request claims to be addressed to, without port.
    pub fn requested_host(&self, headers: &HeaderMap) -> Option<String> {
        let forwarded = if self.trust_forwarded_host {
            headers
                .get(X_FORWARDED_HOST)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
        } else {
            None
        };

        let raw = match forwarded {
            Some(value) => value,
            None => headers.get(HOST)?.to_str().ok()?,
        };
        let host = strip_port(raw.trim());
        (!host.is_empty()).then(|| host.to_ascii_lowercase())
    }

    pub fn is_allowed_host(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|pattern| {
            if pattern == "*" {
                return true;
            }
            match pattern.strip_prefix("*.") {
                Some(suffix) => host
                    .strip_suffix(suffix)
                    .is_some_and(|prefix| prefix.ends_with('.')),
                None => pattern == host,
            }
        })
    }

    /// The socket peer, or, when the peer is a trusted proxy, the rightmost
    /// forwarded address that is not itself a trusted proxy.
    pub fn client_ip(&self, peer: Option<IpAddr>, headers: &HeaderMap) -> IpAddr {
        let Some(peer) = peer else {
            return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        };
        if !self.trusted_proxy_ips.contains(&peer) {
            return peer;
        }
        let Some(forwarded) = headers
            .get(X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        else {
            return peer;
        };

        // Proxies append; everything left of the first untrusted hop is
        // client-controlled.
        let mut client = peer;
        for hop in forwarded.rsplit(',') {
            match hop.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    client = ip;
                    if !self.trusted_proxy_ips.contains(&ip) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        client
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, with or without a port.
        return rest.split(']').next().unwrap_or_default();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[derive(Debug, Clone)]
pub struct SecurityState {
    pub limiter: Arc<RateLimiter>,
    pub policy: Arc<HostPolicy>,
}

impl SecurityState {
    pub fn new(limiter: Arc<RateLimiter>, policy: HostPolicy) -> Self {
        Self {
            limiter,
            policy: Arc::new(policy),
        }
    }
}

/// Multipart attachment uploads skip the rate limiter.
pub fn is_rate_limit_exempt(method: &Method, path: &str) -> bool {
    if method != Method::POST {
        return false;
    }
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    matches!(
        segments.as_slice(),
        ["applications", id, "attachments"] if !id.is_empty()
    )
}

pub async fn security_filter(
    State(security): State<SecurityState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let host = security.policy.requested_host(request.headers());
    let host_ok = host
        .as_deref()
        .is_some_and(|host| security.policy.is_allowed_host(host));
    if !host_ok {
        warn!(host = host.as_deref().unwrap_or("<missing>"), %path, "rejected request with invalid host header");
        return with_security_headers(AppError::bad_request("invalid host header").into_response());
    }

    if !is_rate_limit_exempt(request.method(), &path) {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let client_ip = security.policy.client_ip(peer, request.headers());

        if let RateDecision::Limited { retry_after } = security.limiter.check(client_ip) {
            warn!(
                %client_ip,
                %path,
                retry_after_secs = retry_after.as_secs(),
                "rate limit exceeded"
            );
            return with_security_headers(AppError::too_many_requests(retry_after).into_response());
        }
    }

    with_security_headers(next.run(request).await)
}

fn with_security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();

    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "x-xss-protection",
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );

    response
}
