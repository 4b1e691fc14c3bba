//! Per-request context created on entry and dropped with the response.

use axum::http::HeaderMap;
use nanorand::{Rng, WyRand};
use std::net::SocketAddr;

pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";
pub const AUTH_SIGNATURE_HEADER: &str = "X-Optimism-Signature";

#[derive(Clone, Debug)]
pub struct RequestContext {
    /// 10 random bytes, hex encoded. ties log lines to one client request
    pub request_id: String,
    pub auth_alias: Option<String>,
    /// the key rate limits count against
    pub client_ip: String,
    /// the X-Forwarded-For chain exactly as the client sent it
    pub xff: String,
    /// auth header carried through to backends untouched
    pub auth_signature: Option<String>,
}

fn new_request_id() -> String {
    let mut rng = WyRand::new();

    format!("{:016x}{:04x}", rng.generate::<u64>(), rng.generate::<u16>())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

impl RequestContext {
    pub fn new(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        ip_header: &str,
        auth_alias: Option<String>,
    ) -> Self {
        let xff = header_str(headers, FORWARDED_FOR_HEADER)
            .unwrap_or_default()
            .to_string();

        // the first hop of the configured header, falling back to the socket
        let client_ip = header_str(headers, ip_header)
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_default();

        Self {
            request_id: new_request_id(),
            auth_alias,
            client_ip,
            xff,
            auth_signature: header_str(headers, AUTH_SIGNATURE_HEADER).map(|s| s.to_string()),
        }
    }

    /// a context for requests the proxy makes on its own behalf
    pub fn internal() -> Self {
        Self {
            request_id: new_request_id(),
            auth_alias: None,
            client_ip: String::new(),
            xff: String::new(),
            auth_signature: None,
        }
    }

    /// headers that reach backends and can change what they answer.
    /// these feed the cache key
    pub fn forwarded_headers(&self) -> Vec<(String, String)> {
        match &self.auth_signature {
            Some(signature) => vec![(
                AUTH_SIGNATURE_HEADER.to_ascii_lowercase(),
                signature.clone(),
            )],
            None => vec![],
        }
    }
}
