//! Dispatch engine - builds wire requests and normalizes responses

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;
use crate::models::{
    enabled, ApiKeyLocation, Auth, BodyKind, HttpResponse, KeyValue, Request, RequestBody, VarMap,
};
use crate::network::transport::{RawRequest, RawResponse, Transport};
use crate::variables;

/// Per-call dispatch options
#[derive(Clone, Debug)]
pub struct DispatchOptions {
    /// `None` waits indefinitely
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl DispatchOptions {
    pub fn new(timeout_ms: u64) -> Self {
        DispatchOptions {
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_TIMEOUT_MS)
    }
}

/// Turns requests into network calls through an injected transport.
///
/// Holds no per-call state, so one engine serves any number of concurrent
/// dispatches.
#[derive(Clone)]
pub struct DispatchEngine {
    transport: Arc<dyn Transport>,
}

impl DispatchEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        DispatchEngine { transport }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Expand, validate and build a request in one call.
    pub async fn execute(
        &self,
        request: &Request,
        vars: &VarMap,
        options: &DispatchOptions,
    ) -> Result<HttpResponse, DispatchError> {
        let raw = build_raw_request(request, vars)?;
        self.dispatch(raw, options).await
    }

    /// Send an already built request, honouring timeout and cancellation.
    ///
    /// Exactly one outcome is produced: once the token fires the transport
    /// future is dropped, which aborts the exchange.
    pub async fn dispatch(
        &self,
        raw: RawRequest,
        options: &DispatchOptions,
    ) -> Result<HttpResponse, DispatchError> {
        let start = Instant::now();
        let url = raw.url.clone();
        let method = raw.method;
        let cancel = options.cancel.clone();

        tracing::info!(url = %url, method = %method, transport = self.transport.name(), "Dispatching request");

        let timer = async {
            match options.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(DispatchError::cancelled("Request cancelled")),
            _ = timer => {
                // A timeout takes the same path as a user cancel
                cancel.cancel();
                let ms = options.timeout.map(|t| t.as_millis()).unwrap_or_default();
                Err(DispatchError::cancelled(format!("Request timed out after {} ms", ms)))
            }
            result = self.transport.send_raw(raw) => result,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(resp) => {
                let response = normalize(resp, elapsed_ms);
                tracing::info!(url = %url, status = response.status, elapsed_ms, "Request completed");
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(url = %url, code = err.kind.code(), elapsed_ms, error = %err.message, "Request failed");
                Err(err)
            }
        }
    }
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

fn validate_header(key: &str, value: &str) -> Result<(), DispatchError> {
    reqwest::header::HeaderName::from_bytes(key.as_bytes())
        .map_err(|_| DispatchError::invalid_request(format!("Invalid header name `{}`", key)))?;
    reqwest::header::HeaderValue::from_str(value)
        .map_err(|_| DispatchError::invalid_request(format!("Invalid value for header `{}`", key)))?;
    Ok(())
}

fn parse_url(raw: &str) -> Result<url::Url, DispatchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DispatchError::invalid_url("URL is empty"));
    }

    let url = url::Url::parse(raw).map_err(|e| {
        if raw.contains("{{") {
            DispatchError::invalid_url(format!("URL has unresolved variables: {}", raw))
        } else {
            DispatchError::invalid_url(format!("{}: {}", e, raw))
        }
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(DispatchError::invalid_url(format!(
            "Unsupported scheme `{}`, expected http or https",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(DispatchError::invalid_url(format!("URL has no host: {}", raw)));
    }
    Ok(url)
}

/// Percent-encode the characters that would end a quoted multipart name
/// or the header line around it.
fn escape_field_name(name: &str) -> String {
    name.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

fn multipart_body(fields: &[KeyValue], boundary: &str) -> Vec<u8> {
    let mut body = String::new();
    for field in enabled(fields).filter(|f| !f.key.is_empty()) {
        body.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
            boundary,
            escape_field_name(&field.key),
            field.value
        ));
    }
    body.push_str(&format!("--{}--\r\n", boundary));
    body.into_bytes()
}

/// Build the wire request: expand variables, validate the URL, then apply
/// params, headers, auth and body.
///
/// `Auth::Custom` is not handled here; its signature is evaluated by the
/// caller and arrives as an ordinary `Authorization` header.
pub fn build_raw_request(request: &Request, vars: &VarMap) -> Result<RawRequest, DispatchError> {
    let expanded = variables::expand_request(request, vars);

    // URL + params
    let mut target = parse_url(&expanded.url)?;
    {
        let mut query: Vec<(&str, &str)> = enabled(&expanded.params)
            .filter(|p| !p.key.is_empty())
            .map(|p| (p.key.as_str(), p.value.as_str()))
            .collect();
        if let Auth::ApiKey {
            key,
            value,
            location: ApiKeyLocation::Query,
        } = &expanded.auth
        {
            query.push((key.as_str(), value.as_str()));
        }
        if !query.is_empty() {
            target.query_pairs_mut().extend_pairs(query);
        }
    }

    // Headers
    let mut headers: Vec<(String, String)> = Vec::new();
    for header in enabled(&expanded.headers).filter(|h| !h.key.trim().is_empty()) {
        let key = header.key.trim();
        validate_header(key, &header.value)?;
        headers.push((key.to_string(), header.value.clone()));
    }

    // Auth never clobbers a header the user set explicitly
    let auth_header = match &expanded.auth {
        Auth::Bearer { token } => Some(("Authorization".to_string(), format!("Bearer {}", token))),
        Auth::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            Some(("Authorization".to_string(), format!("Basic {}", encoded)))
        }
        Auth::ApiKey {
            key,
            value,
            location: ApiKeyLocation::Header,
        } => Some((key.clone(), value.clone())),
        _ => None,
    };
    if let Some((key, value)) = auth_header {
        if !has_header(&headers, &key) {
            validate_header(&key, &value)?;
            headers.push((key, value));
        }
    }

    // Body
    let mut body = None;
    if expanded.method.allows_body() {
        let (bytes, content_type) = match &expanded.body {
            RequestBody::None => (None, None),
            RequestBody::Raw { format, content } => {
                (Some(content.clone().into_bytes()), Some(format.content_type().to_string()))
            }
            RequestBody::UrlEncoded { fields } => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(
                        enabled(fields)
                            .filter(|f| !f.key.is_empty())
                            .map(|f| (f.key.as_str(), f.value.as_str())),
                    )
                    .finish();
                (
                    Some(encoded.into_bytes()),
                    Some("application/x-www-form-urlencoded".to_string()),
                )
            }
            RequestBody::FormData { fields } => {
                let boundary = format!("----apiscope{}", uuid::Uuid::new_v4().simple());
                // A user-set multipart type without our boundary would be unparseable
                headers.retain(|(k, v)| {
                    !(k.eq_ignore_ascii_case("content-type")
                        && v.to_ascii_lowercase().starts_with("multipart/form-data")
                        && !v.contains("boundary="))
                });
                (
                    Some(multipart_body(fields, &boundary)),
                    Some(format!("multipart/form-data; boundary={}", boundary)),
                )
            }
            RequestBody::Binary { data } => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|_| DispatchError::invalid_request("Binary body is not valid base64"))?;
                (Some(bytes), Some("application/octet-stream".to_string()))
            }
        };

        if let Some(content_type) = content_type {
            if !has_header(&headers, "Content-Type") {
                headers.push(("Content-Type".to_string(), content_type));
            }
        }
        body = bytes;
    } else if !expanded.body.is_none() {
        tracing::debug!(method = %expanded.method, "Dropping body for bodiless method");
    }

    Ok(RawRequest {
        url: target.to_string(),
        method: expanded.method,
        headers,
        body,
    })
}

/// Capture a raw response as an [`HttpResponse`].
fn normalize(resp: RawResponse, elapsed_ms: u64) -> HttpResponse {
    let body = String::from_utf8_lossy(&resp.body).into_owned();
    let body_kind = classify_body(resp.header("content-type"), &body);
    HttpResponse {
        status: resp.status,
        status_text: resp.status_text,
        headers: resp.headers,
        size_bytes: resp.body.len() as u64,
        body,
        body_kind,
        response_time_ms: elapsed_ms,
        received_at: Utc::now(),
    }
}

/// Classify a body from its content type, falling back to sniffing.
pub fn classify_body(content_type: Option<&str>, body: &str) -> BodyKind {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    if content_type.contains("json") {
        return BodyKind::Json;
    }
    if content_type.contains("html") {
        return BodyKind::Html;
    }
    if content_type.contains("xml") {
        return BodyKind::Xml;
    }
    sniff_body(body)
}

fn sniff_body(body: &str) -> BodyKind {
    let trimmed = body.trim();

    if trimmed.starts_with(['{', '[']) && serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return BodyKind::Json;
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("<!doctype html")
        || ["<html", "<head", "<body"].iter().any(|tag| lower.contains(tag))
    {
        return BodyKind::Html;
    }

    if lower.starts_with("<?xml") || is_balanced_element(trimmed) {
        return BodyKind::Xml;
    }

    BodyKind::Text
}

/// `<name ...>...</name>` spanning the whole text
fn is_balanced_element(text: &str) -> bool {
    let Some(rest) = text.strip_prefix('<') else {
        return false;
    };
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.'))
        .collect();
    !name.is_empty() && text.ends_with(&format!("</{}>", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{HttpMethod, RawFormat};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn vars(pairs: &[(&str, &str)]) -> VarMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    /// Records what it was asked to send and replies after `delay`.
    struct StubTransport {
        delay: Duration,
        sent: Mutex<Vec<RawRequest>>,
    }

    impl StubTransport {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(StubTransport {
                delay,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn send_raw(&self, request: RawRequest) -> Result<RawResponse, DispatchError> {
            self.sent.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            Ok(RawResponse {
                status: 200,
                status_text: "OK".into(),
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: br#"{"ok":true}"#.to_vec(),
            })
        }
    }

    #[test]
    fn test_get_never_carries_body() {
        let mut req = Request::new(HttpMethod::GET, "https://api.test/items");
        req.body = RequestBody::json(r#"{"a":1}"#);
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert!(raw.body.is_none());
        assert!(raw.header("content-type").is_none());
    }

    #[test]
    fn test_disabled_entries_stay_off_the_wire() {
        let mut req = Request::new(HttpMethod::GET, "https://api.test/items?page=1");
        req.params.push(KeyValue::new("limit", "{{limit}}"));
        req.params.push(KeyValue::disabled("debug", "1"));
        req.headers.push(KeyValue::new("X-One", "1"));
        req.headers.push(KeyValue::disabled("X-Two", "2"));

        let raw = build_raw_request(&req, &vars(&[("limit", "5")])).unwrap();
        assert_eq!(raw.url, "https://api.test/items?page=1&limit=5");
        assert_eq!(raw.headers, vec![("X-One".to_string(), "1".to_string())]);
        // the entity itself keeps them
        assert_eq!(req.params.len(), 2);
        assert_eq!(req.headers.len(), 2);
    }

    #[test]
    fn test_auth_headers() {
        let mut req = Request::new(HttpMethod::GET, "https://api.test");
        req.auth = Auth::Basic {
            username: "user".into(),
            password: "pass".into(),
        };
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert_eq!(raw.header("authorization"), Some("Basic dXNlcjpwYXNz"));

        req.auth = Auth::Bearer { token: "{{tok}}".into() };
        req.headers.push(KeyValue::new("authorization", "Token mine"));
        let raw = build_raw_request(&req, &vars(&[("tok", "t")])).unwrap();
        assert_eq!(raw.headers.len(), 1);
        assert_eq!(raw.header("Authorization"), Some("Token mine"));

        req.headers.clear();
        req.auth = Auth::ApiKey {
            key: "api_key".into(),
            value: "k1".into(),
            location: ApiKeyLocation::Query,
        };
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert_eq!(raw.url, "https://api.test/?api_key=k1");
        assert!(raw.headers.is_empty());
    }

    #[test]
    fn test_url_validation() {
        let kind = |url: &str| {
            build_raw_request(&Request::new(HttpMethod::GET, url), &VarMap::new())
                .unwrap_err()
                .kind
        };
        assert_eq!(kind(""), ErrorKind::InvalidUrl);
        assert_eq!(kind("ftp://files.test/a"), ErrorKind::InvalidUrl);
        assert_eq!(kind("not a url"), ErrorKind::InvalidUrl);

        let err = build_raw_request(&Request::new(HttpMethod::GET, "{{base}}/x"), &VarMap::new())
            .unwrap_err();
        assert!(err.message.contains("unresolved"));
    }

    #[test]
    fn test_invalid_header_is_invalid_request() {
        let mut req = Request::new(HttpMethod::GET, "https://api.test");
        req.headers.push(KeyValue::new("Bad Header", "x"));
        let err = build_raw_request(&req, &VarMap::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.is_validation());
    }

    #[test]
    fn test_default_content_types() {
        let mut req = Request::new(HttpMethod::POST, "https://api.test");
        req.body = RequestBody::raw(RawFormat::Xml, "<a/>");
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert_eq!(raw.header("content-type"), Some("application/xml"));
        assert_eq!(raw.body.as_deref(), Some(&b"<a/>"[..]));

        req.headers.push(KeyValue::new("Content-Type", "text/custom"));
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert_eq!(raw.header("content-type"), Some("text/custom"));

        req.headers.clear();
        req.body = RequestBody::UrlEncoded {
            fields: vec![KeyValue::new("q", "a b"), KeyValue::disabled("x", "1")],
        };
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert_eq!(raw.body.as_deref(), Some(&b"q=a+b"[..]));

        req.body = RequestBody::Binary { data: "aGk=".into() };
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        assert_eq!(raw.body.as_deref(), Some(&b"hi"[..]));
        assert_eq!(raw.header("content-type"), Some("application/octet-stream"));

        req.body = RequestBody::Binary { data: "***".into() };
        assert_eq!(
            build_raw_request(&req, &VarMap::new()).unwrap_err().kind,
            ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn test_multipart_body() {
        let mut req = Request::new(HttpMethod::POST, "https://api.test/upload");
        req.body = RequestBody::FormData {
            fields: vec![KeyValue::new("name", "ana"), KeyValue::disabled("skip", "1")],
        };
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        let content_type = raw.header("content-type").unwrap().to_string();
        let boundary = content_type.split("boundary=").nth(1).unwrap();
        let body = String::from_utf8(raw.body.unwrap()).unwrap();
        assert_eq!(
            body,
            format!(
                "--{b}\r\nContent-Disposition: form-data; name=\"name\"\r\n\r\nana\r\n--{b}--\r\n",
                b = boundary
            )
        );
    }

    #[test]
    fn test_multipart_name_cannot_inject_headers() {
        let mut req = Request::new(HttpMethod::POST, "https://api.test/upload");
        req.body = RequestBody::FormData {
            fields: vec![KeyValue::new("a\"\r\nX-Injected: 1\r\n", "v")],
        };
        let raw = build_raw_request(&req, &VarMap::new()).unwrap();
        let body = String::from_utf8(raw.body.unwrap()).unwrap();
        assert!(body.contains("name=\"a%22%0D%0AX-Injected: 1%0D%0A\"\r\n\r\nv\r\n"));
        assert!(!body.contains("\r\nX-Injected"));
    }

    #[test]
    fn test_classify_body() {
        assert_eq!(classify_body(Some("application/json; charset=utf-8"), "x"), BodyKind::Json);
        assert_eq!(classify_body(None, r#"[1, 2]"#), BodyKind::Json);
        assert_eq!(classify_body(None, "{not json"), BodyKind::Text);
        assert_eq!(classify_body(None, "<!DOCTYPE html><p>x"), BodyKind::Html);
        assert_eq!(classify_body(Some("text/plain"), "<note><to>a</to></note>"), BodyKind::Xml);
        assert_eq!(classify_body(None, "<?xml version=\"1.0\"?><a/>"), BodyKind::Xml);
        assert_eq!(classify_body(None, "<a>unclosed"), BodyKind::Text);
        assert_eq!(classify_body(None, "plain"), BodyKind::Text);
    }

    #[tokio::test]
    async fn test_execute_normalizes_response() {
        let transport = StubTransport::new(Duration::ZERO);
        let engine = DispatchEngine::new(transport.clone());
        let mut req = Request::new(HttpMethod::POST, "https://api.test/x");
        req.body = RequestBody::json("{}");

        let resp = engine
            .execute(&req, &VarMap::new(), &DispatchOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_kind, BodyKind::Json);
        assert_eq!(resp.size_bytes, 11);
        assert_eq!(transport.sent.lock().unwrap()[0].body.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_cancel_resolves_with_cancelled() {
        let engine = DispatchEngine::new(StubTransport::new(Duration::from_secs(30)));
        let options = DispatchOptions::new(0);
        let token = options.cancel.clone();

        let req = Request::new(HttpMethod::GET, "https://api.test/slow");
        let vars = VarMap::new();
        let (result, _) = tokio::join!(engine.execute(&req, &vars, &options), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_timeout_fires_the_cancel_token() {
        let engine = DispatchEngine::new(StubTransport::new(Duration::from_secs(30)));
        let options = DispatchOptions::new(20);
        let req = Request::new(HttpMethod::GET, "https://api.test/slow");

        let err = engine.execute(&req, &VarMap::new(), &options).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(err.message.contains("timed out"));
        assert!(options.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_validation_happens_before_transport() {
        let transport = StubTransport::new(Duration::ZERO);
        let engine = DispatchEngine::new(transport.clone());
        let req = Request::new(HttpMethod::GET, "mailto:a@b.c");
        let err = engine
            .execute(&req, &VarMap::new(), &DispatchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidUrl);
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
