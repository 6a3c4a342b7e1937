//! Mapping of an inbound request onto the configured upstream.
//!
//! Path, query and body pass through byte-for-byte. Only hop-by-hop
//! headers are touched: `Host` is replaced with the upstream authority,
//! connection-management headers are dropped, and `Content-Length` is
//! recomputed from the (already de-chunked) body.

use std::net::SocketAddr;

use bytes::Bytes;
use serde::Deserialize;
use url::{Host, Url};

use crate::config::ProxyConfig;
use crate::error::{RelayError, Result};
use crate::http::headers::HeaderMap;
use crate::http::request::{Method, Request};
use crate::proxy::request_id::RequestId;

/// Headers that only describe the client-to-proxy hop.
///
/// `Transfer-Encoding` is listed because bodies are decoded before they are
/// forwarded; `Content-Length` is recomputed separately.
pub const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &[
    "Host",
    "Connection",
    "Keep-Alive",
    "Proxy-Authorization",
    "Proxy-Connection",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "Content-Length",
];

/// A request as received from a client, with its relay context.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub id: RequestId,
    pub client_addr: SocketAddr,
    pub request: Request,
}

impl InboundRequest {
    pub fn new(request: Request, client_addr: SocketAddr) -> Self {
        Self {
            id: RequestId::generate(),
            client_addr,
            request,
        }
    }
}

/// A request ready to be written to the upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Absolute target URL, for connection routing and logging.
    pub url: Url,
    /// Request target as written on the request line.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// Upstream host without IPv6 brackets.
    pub fn host(&self) -> Result<String> {
        match self.url.host() {
            Some(Host::Domain(domain)) => Ok(domain.to_string()),
            Some(Host::Ipv4(addr)) => Ok(addr.to_string()),
            Some(Host::Ipv6(addr)) => Ok(addr.to_string()),
            None => Err(RelayError::Translation("upstream URL has no host".into())),
        }
    }

    /// Upstream port, defaulting to 443 for https and 80 for http.
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_tls() { 443 } else { 80 })
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }
}

/// Builds the outbound request for `inbound` against the configured
/// upstream base URL.
///
/// The outbound path is the base URL's path followed by the inbound path,
/// unchanged; the proxied prefix is not stripped.
pub fn translate(inbound: &InboundRequest, config: &ProxyConfig) -> Result<OutboundRequest> {
    let request = &inbound.request;

    if !request.path.starts_with('/') {
        return Err(RelayError::Translation(format!(
            "request target {:?} is not an absolute path",
            request.path
        )));
    }

    let base = &config.upstream_base_url;
    let base_path = base.path().trim_end_matches('/');

    let mut path_and_query = String::with_capacity(base_path.len() + request.path.len() + 16);
    path_and_query.push_str(base_path);
    path_and_query.push_str(&request.path);
    if let Some(query) = &request.query {
        path_and_query.push('?');
        path_and_query.push_str(query);
    }

    let origin = base.origin().ascii_serialization();
    let url = Url::parse(&format!("{origin}{path_and_query}"))
        .map_err(|e| RelayError::Translation(format!("invalid upstream URL: {e}")))?;

    let headers = forward_headers(request, base)?;

    Ok(OutboundRequest {
        method: request.method.clone(),
        url,
        path_and_query,
        headers,
        body: request.body.clone(),
    })
}

fn forward_headers(request: &Request, base: &Url) -> Result<HeaderMap> {
    let host = base
        .host_str()
        .ok_or_else(|| RelayError::Translation("upstream URL has no host".into()))?;
    let host_value = match base.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    // Headers the client named in Connection are hop-by-hop too, except
    // Authorization, which always reaches the upstream
    let nominated: Vec<&str> = request
        .headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty() && !t.eq_ignore_ascii_case("Authorization"))
        .collect();

    let mut headers = HeaderMap::new();
    headers.append("Host", host_value);

    for (name, value) in request.headers.iter() {
        let hop = HOP_BY_HOP_REQUEST_HEADERS
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
            || nominated.iter().any(|h| h.eq_ignore_ascii_case(name));
        if !hop {
            headers.append(name, value);
        }
    }

    let declared_body = request.headers.contains("Content-Length")
        || request.headers.contains("Transfer-Encoding");
    if !request.body.is_empty() || declared_body {
        headers.append("Content-Length", request.body.len().to_string());
    }

    Ok(headers)
}

#[derive(Deserialize)]
struct StreamHint {
    #[serde(default)]
    stream: Option<bool>,
}

/// Whether the client asked for a streamed (SSE) response.
///
/// True only for a JSON object body with `"stream": true`. Anything else,
/// including bodies that fail to parse, means a buffered response.
pub fn wants_streaming(request: &Request) -> bool {
    if request.body.is_empty() {
        return false;
    }

    if let Some(content_type) = request.header("Content-Type") {
        if !content_type.to_ascii_lowercase().contains("json") {
            return false;
        }
    }

    serde_json::from_slice::<StreamHint>(&request.body)
        .ok()
        .and_then(|hint| hint.stream)
        .unwrap_or(false)
}
