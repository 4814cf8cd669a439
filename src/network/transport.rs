//! Transport backends - the raw `send` collaborator behind the dispatch engine
//!
//! Two backends exist. [`NativeTransport`] has unrestricted outbound access
//! and is what a trusted host process uses. [`RestrictedTransport`] behaves
//! like an in-page browser fetch bound to an origin: it drops forbidden
//! request headers, runs a preflight for non-simple requests and rejects
//! responses that do not allow the origin.
//!
//! A connection failure looks the same whether the peer is down or a browser
//! would have refused it, so the restricted backend only reports
//! `CorsBlocked` when it actually received a response (or preflight) without
//! a matching `Access-Control-Allow-Origin`. Everything that fails before a
//! response is a `NetworkError`, or `Offline` when the OS reports the network
//! unreachable.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DispatchError, ErrorKind};
use crate::models::HttpMethod;

/// A fully built request, ready for the wire
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawRequest {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What came back, before any normalisation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends a raw request. Dropping the returned future aborts the exchange.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_raw(&self, request: RawRequest) -> Result<RawResponse, DispatchError>;
}

/// Pick the backend for the host this process runs in.
///
/// An embedding host that runs us under a browser origin passes that origin;
/// a plain native process passes `None` and gets the privileged backend.
pub fn for_host(embed_origin: Option<String>) -> Arc<dyn Transport> {
    match embed_origin.filter(|o| !o.trim().is_empty()) {
        Some(origin) => {
            tracing::info!(origin = %origin, "Using restricted transport");
            Arc::new(RestrictedTransport::new(origin))
        }
        None => {
            tracing::info!("Using native transport");
            Arc::new(NativeTransport::new())
        }
    }
}

/// Create an HTTP client. Timeouts are enforced by the dispatch engine, not here.
pub fn create_client() -> reqwest::Client {
    reqwest::Client::builder()
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::GET => reqwest::Method::GET,
        HttpMethod::POST => reqwest::Method::POST,
        HttpMethod::PUT => reqwest::Method::PUT,
        HttpMethod::PATCH => reqwest::Method::PATCH,
        HttpMethod::DELETE => reqwest::Method::DELETE,
        HttpMethod::HEAD => reqwest::Method::HEAD,
        HttpMethod::OPTIONS => reqwest::Method::OPTIONS,
        HttpMethod::TRACE => reqwest::Method::TRACE,
    }
}

fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<std::io::ErrorKind> {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = e.source();
    }
    None
}

/// Map a reqwest failure onto the dispatch taxonomy.
pub(crate) fn classify(err: &reqwest::Error) -> DispatchError {
    if err.is_builder() {
        return DispatchError::invalid_request(err.to_string());
    }

    if err.is_connect() {
        let offline = matches!(
            io_error_kind(err),
            Some(std::io::ErrorKind::NetworkUnreachable | std::io::ErrorKind::NetworkDown)
        );
        let kind = if offline {
            ErrorKind::Offline
        } else {
            ErrorKind::NetworkError
        };
        return DispatchError::new(kind, format!("Connection failed: {}", err));
    }

    if err.is_timeout() || err.is_body() || err.is_redirect() || err.is_request() {
        return DispatchError::new(ErrorKind::NetworkError, format!("Request failed: {}", err));
    }

    DispatchError::new(ErrorKind::Unknown, err.to_string())
}

async fn send(client: &reqwest::Client, request: RawRequest) -> Result<RawResponse, DispatchError> {
    let mut builder = client.request(to_reqwest_method(request.method), &request.url);
    for (key, value) in &request.headers {
        builder = builder.header(key.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let resp = builder.send().await.map_err(|e| classify(&e))?;

    let status = resp.status();
    let headers = resp
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = resp.bytes().await.map_err(|e| classify(&e))?;

    Ok(RawResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
        body: body.to_vec(),
    })
}

/// Privileged backend with unrestricted outbound access
pub struct NativeTransport {
    client: reqwest::Client,
}

impl NativeTransport {
    pub fn new() -> Self {
        NativeTransport {
            client: create_client(),
        }
    }
}

impl Default for NativeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NativeTransport {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn send_raw(&self, request: RawRequest) -> Result<RawResponse, DispatchError> {
        send(&self.client, request).await
    }
}

/// Request headers a page is not allowed to set.
const FORBIDDEN_HEADERS: &[&str] = &[
    "accept-charset", "accept-encoding", "access-control-request-headers",
    "access-control-request-method", "connection", "content-length", "cookie", "cookie2",
    "date", "dnt", "expect", "host", "keep-alive", "origin", "referer", "te", "trailer",
    "transfer-encoding", "upgrade", "via",
];

/// Response headers visible without `Access-Control-Expose-Headers`.
const SAFELISTED_RESPONSE_HEADERS: &[&str] = &[
    "cache-control", "content-language", "content-length", "content-type", "expires",
    "last-modified", "pragma",
];

fn is_forbidden(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    FORBIDDEN_HEADERS.contains(&name.as_str())
        || name.starts_with("proxy-")
        || name.starts_with("sec-")
}

fn is_safelisted_request_header(name: &str, value: &str) -> bool {
    match name.to_ascii_lowercase().as_str() {
        "accept" | "accept-language" | "content-language" => true,
        "content-type" => {
            let essence = value.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
            matches!(
                essence.as_str(),
                "application/x-www-form-urlencoded" | "multipart/form-data" | "text/plain"
            )
        }
        _ => false,
    }
}

fn list_contains(list: Option<&str>, item: &str) -> bool {
    list.unwrap_or("")
        .split(',')
        .map(str::trim)
        .any(|entry| entry == "*" || entry.eq_ignore_ascii_case(item))
}

/// Backend with browser cross-origin semantics, bound to one origin
pub struct RestrictedTransport {
    client: reqwest::Client,
    origin: String,
}

impl RestrictedTransport {
    pub fn new(origin: impl Into<String>) -> Self {
        RestrictedTransport {
            client: create_client(),
            origin: origin.into(),
        }
    }

    fn same_origin(&self, url: &str) -> bool {
        match url::Url::parse(url) {
            Ok(u) => u.origin().ascii_serialization() == self.origin.trim_end_matches('/'),
            Err(_) => false,
        }
    }

    fn allows_origin(&self, resp: &RawResponse) -> bool {
        match resp.header("access-control-allow-origin") {
            Some(value) => {
                let value = value.trim();
                value == "*" || value.trim_end_matches('/') == self.origin.trim_end_matches('/')
            }
            None => false,
        }
    }

    fn blocked(&self, url: &str, reason: &str) -> DispatchError {
        tracing::warn!(url = %url, origin = %self.origin, reason, "Cross-origin request blocked");
        DispatchError::new(
            ErrorKind::CorsBlocked,
            format!("Cross-origin request to {} blocked: {}", url, reason),
        )
    }

    async fn preflight(&self, request: &RawRequest) -> Result<(), DispatchError> {
        let mut custom: Vec<String> = request
            .headers
            .iter()
            .filter(|(k, v)| !is_safelisted_request_header(k, v))
            .map(|(k, _)| k.to_ascii_lowercase())
            .collect();
        custom.sort();
        custom.dedup();

        let simple_method = matches!(
            request.method,
            HttpMethod::GET | HttpMethod::HEAD | HttpMethod::POST
        );
        if simple_method && custom.is_empty() {
            return Ok(());
        }

        let mut headers = vec![
            ("Origin".to_string(), self.origin.clone()),
            (
                "Access-Control-Request-Method".to_string(),
                request.method.as_str().to_string(),
            ),
        ];
        if !custom.is_empty() {
            headers.push(("Access-Control-Request-Headers".to_string(), custom.join(",")));
        }

        tracing::debug!(url = %request.url, "Sending CORS preflight");
        let resp = send(
            &self.client,
            RawRequest {
                url: request.url.clone(),
                method: HttpMethod::OPTIONS,
                headers,
                body: None,
            },
        )
        .await?;

        if !(200..300).contains(&resp.status) {
            return Err(self.blocked(&request.url, "preflight did not succeed"));
        }
        if !self.allows_origin(&resp) {
            return Err(self.blocked(&request.url, "preflight missing Access-Control-Allow-Origin"));
        }
        if !simple_method
            && !list_contains(resp.header("access-control-allow-methods"), request.method.as_str())
        {
            return Err(self.blocked(&request.url, "method not allowed by preflight"));
        }
        if let Some(header) = custom
            .iter()
            .find(|h| !list_contains(resp.header("access-control-allow-headers"), h))
        {
            return Err(self.blocked(&request.url, &format!("header `{}` not allowed by preflight", header)));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for RestrictedTransport {
    fn name(&self) -> &'static str {
        "restricted"
    }

    async fn send_raw(&self, mut request: RawRequest) -> Result<RawResponse, DispatchError> {
        request.headers.retain(|(k, _)| {
            let keep = !is_forbidden(k);
            if !keep {
                tracing::debug!(header = %k, "Dropping forbidden header");
            }
            keep
        });

        if self.same_origin(&request.url) {
            return send(&self.client, request).await;
        }

        self.preflight(&request).await?;

        let url = request.url.clone();
        request.headers.push(("Origin".to_string(), self.origin.clone()));
        let mut resp = send(&self.client, request).await?;

        if !self.allows_origin(&resp) {
            return Err(self.blocked(&url, "response missing Access-Control-Allow-Origin"));
        }

        let exposed = resp.header("access-control-expose-headers").map(str::to_string);
        resp.headers.retain(|(k, _)| {
            SAFELISTED_RESPONSE_HEADERS.contains(&k.to_ascii_lowercase().as_str())
                || list_contains(exposed.as_deref(), k)
        });
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ORIGIN: &str = "https://app.example.com";

    fn get(url: String) -> RawRequest {
        RawRequest {
            url,
            method: HttpMethod::GET,
            headers: Vec::new(),
            body: None,
        }
    }

    #[test]
    fn test_for_host_selects_backend() {
        assert_eq!(for_host(None).name(), "native");
        assert_eq!(for_host(Some(" ".into())).name(), "native");
        assert_eq!(for_host(Some(ORIGIN.into())).name(), "restricted");
    }

    #[test]
    fn test_safelisted_headers() {
        assert!(is_safelisted_request_header("Content-Type", "text/plain; charset=utf-8"));
        assert!(!is_safelisted_request_header("Content-Type", "application/json"));
        assert!(!is_safelisted_request_header("X-Trace", "1"));
        assert!(is_forbidden("Cookie") && is_forbidden("Sec-Fetch-Mode"));
    }

    #[tokio::test]
    async fn test_native_sends_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("x-trace", "abc"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let resp = NativeTransport::new()
            .send_raw(RawRequest {
                url: format!("{}/echo", server.uri()),
                method: HttpMethod::POST,
                headers: vec![("X-Trace".into(), "abc".into())],
                body: Some(b"payload".to_vec()),
            })
            .await
            .unwrap();

        assert_eq!(resp.status, 201);
        assert_eq!(resp.status_text, "Created");
        assert_eq!(resp.body, b"created");
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Bind then drop to get a port nothing listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = NativeTransport::new()
            .send_raw(get(format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkError);
    }

    #[tokio::test]
    async fn test_restricted_blocks_response_without_allow_origin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
            .mount(&server)
            .await;

        let err = RestrictedTransport::new(ORIGIN)
            .send_raw(get(server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorsBlocked);
    }

    #[tokio::test]
    async fn test_restricted_filters_unexposed_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("origin", ORIGIN))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("access-control-allow-origin", ORIGIN)
                    .insert_header("access-control-expose-headers", "x-visible")
                    .insert_header("x-visible", "1")
                    .insert_header("x-hidden", "2")
                    .insert_header("content-type", "text/plain"),
            )
            .mount(&server)
            .await;

        let resp = RestrictedTransport::new(ORIGIN)
            .send_raw(get(server.uri()))
            .await
            .unwrap();
        assert_eq!(resp.header("x-visible"), Some("1"));
        assert_eq!(resp.header("x-hidden"), None);
        assert_eq!(resp.header("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_restricted_preflight_rejects_custom_header() {
        let server = MockServer::start().await;
        Mock::given(method("OPTIONS"))
            .respond_with(
                ResponseTemplate::new(204)
                    .insert_header("access-control-allow-origin", "*")
                    .insert_header("access-control-allow-methods", "GET, PUT")
                    .insert_header("access-control-allow-headers", "content-type"),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).insert_header("access-control-allow-origin", "*"))
            .mount(&server)
            .await;

        let transport = RestrictedTransport::new(ORIGIN);
        let mut request = RawRequest {
            method: HttpMethod::PUT,
            ..get(server.uri())
        };
        request.headers.push(("Content-Type".into(), "application/json".into()));
        assert_eq!(transport.send_raw(request.clone()).await.unwrap().status, 200);

        request.headers.push(("X-Api-Key".into(), "k".into()));
        let err = transport.send_raw(request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorsBlocked);
        assert!(err.message.contains("x-api-key"));
    }
}
