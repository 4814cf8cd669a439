//! Data model - requests, collections, history, settings and variable scopes
//!
//! These are also the at-rest shapes written by [`crate::storage`], so field
//! names and tags are part of the persisted schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::constants::{
    default_user_agent, DEFAULT_HISTORY_EXPIRE_DAYS, DEFAULT_MAX_HISTORY, DEFAULT_TIMEOUT_MS,
    SETTINGS_ID,
};

/// Flat variable mapping produced by merging scopes.
pub type VarMap = HashMap<String, String>;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_true() -> bool {
    true
}

/// HTTP Method enum
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    PATCH,
    DELETE,
    HEAD,
    OPTIONS,
    TRACE,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 8] = [
        HttpMethod::GET,
        HttpMethod::POST,
        HttpMethod::PUT,
        HttpMethod::PATCH,
        HttpMethod::DELETE,
        HttpMethod::HEAD,
        HttpMethod::OPTIONS,
        HttpMethod::TRACE,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::TRACE => "TRACE",
        }
    }

    /// GET and HEAD never carry a body on the wire.
    pub fn allows_body(&self) -> bool {
        !matches!(self, HttpMethod::GET | HttpMethod::HEAD)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        HttpMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == upper)
            .ok_or_else(|| format!("Unknown HTTP method: {}", s))
    }
}

/// A key/value row used for params, headers, form fields and variables.
///
/// Keys are not unique: duplicates keep their order and every enabled one is
/// sent. Disabled rows stay in the entity but never reach the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    #[serde(default = "new_id")]
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        KeyValue {
            id: new_id(),
            key: key.into(),
            value: value.into(),
            enabled: true,
            description: None,
        }
    }

    pub fn disabled(key: impl Into<String>, value: impl Into<String>) -> Self {
        KeyValue {
            enabled: false,
            ..KeyValue::new(key, value)
        }
    }
}

/// Iterate the enabled rows of a key/value list.
pub fn enabled(entries: &[KeyValue]) -> impl Iterator<Item = &KeyValue> {
    entries.iter().filter(|e| e.enabled)
}

/// Format of a raw body
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawFormat {
    #[default]
    Json,
    Text,
    Xml,
}

impl RawFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            RawFormat::Json => "application/json",
            RawFormat::Text => "text/plain",
            RawFormat::Xml => "application/xml",
        }
    }
}

/// Request body. Exactly one variant is active at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RequestBody {
    #[default]
    None,
    FormData {
        fields: Vec<KeyValue>,
    },
    UrlEncoded {
        fields: Vec<KeyValue>,
    },
    Raw {
        format: RawFormat,
        content: String,
    },
    /// Base64-encoded payload
    Binary {
        data: String,
    },
}

impl RequestBody {
    pub fn raw(format: RawFormat, content: impl Into<String>) -> Self {
        RequestBody::Raw {
            format,
            content: content.into(),
        }
    }

    pub fn json(content: impl Into<String>) -> Self {
        RequestBody::raw(RawFormat::Json, content)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RequestBody::None)
    }
}

/// Where an API key is placed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// Authentication descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Auth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    ApiKey {
        key: String,
        value: String,
        #[serde(default, rename = "in")]
        location: ApiKeyLocation,
    },
    /// Sandbox expression whose result becomes the `Authorization` header
    Custom {
        script: String,
    },
}

/// Optional pre-request and post-response scripts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scripts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_response: Option<String>,
}

/// A single HTTP request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub body: RequestBody,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub scripts: Scripts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Request {
    fn default() -> Self {
        let now = Utc::now();
        Request {
            id: new_id(),
            name: String::from("New Request"),
            method: HttpMethod::GET,
            url: String::new(),
            description: None,
            params: Vec::new(),
            headers: Vec::new(),
            body: RequestBody::None,
            auth: Auth::None,
            scripts: Scripts::default(),
            collection_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Request {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Request {
            method,
            url: url.into(),
            ..Request::default()
        }
    }

    /// First enabled header with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        enabled(&self.headers)
            .find(|h| h.key.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// The URL with every enabled param appended to its query string.
    pub fn url_with_params(&self) -> String {
        append_query(&self.url, enabled(&self.params).map(|p| (p.key.as_str(), p.value.as_str())))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Append query pairs to a URL, merging with any query it already has.
///
/// Falls back to plain string concatenation when the URL does not parse yet
/// (for instance while it still holds unresolved `{{...}}` tokens).
pub fn append_query<'a>(base: &str, pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let pairs: Vec<(&str, &str)> = pairs.filter(|(k, _)| !k.is_empty()).collect();
    if pairs.is_empty() {
        return base.to_string();
    }

    if let Ok(mut url) = url::Url::parse(base) {
        url.query_pairs_mut().extend_pairs(pairs);
        return url.to_string();
    }

    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, separator, encoded)
}

/// A folder inside a collection tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<CollectionItem>,
}

impl Folder {
    pub fn new(name: impl Into<String>) -> Self {
        Folder {
            id: new_id(),
            name: name.into(),
            description: None,
            items: Vec::new(),
        }
    }
}

/// Reference from a collection tree to a stored request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRef {
    pub id: String,
    pub name: String,
    pub method: HttpMethod,
}

impl From<&Request> for RequestRef {
    fn from(request: &Request) -> Self {
        RequestRef {
            id: request.id.clone(),
            name: request.name.clone(),
            method: request.method,
        }
    }
}

/// A node of a collection tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CollectionItem {
    Folder(Folder),
    Request(RequestRef),
}

/// A collection of requests
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub items: Vec<CollectionItem>,
    #[serde(default)]
    pub variables: Vec<KeyValue>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Collection {
            id: new_id(),
            name: name.into(),
            description: None,
            items: Vec::new(),
            variables: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a request at the top level of the tree and claim ownership of it.
    pub fn add_request(&mut self, request: &mut Request) {
        request.collection_id = Some(self.id.clone());
        self.items.push(CollectionItem::Request(RequestRef::from(&*request)));
        self.updated_at = Utc::now();
    }

    /// Ids of every request referenced anywhere in the tree.
    pub fn request_ids(&self) -> Vec<String> {
        fn walk(items: &[CollectionItem], out: &mut Vec<String>) {
            for item in items {
                match item {
                    CollectionItem::Folder(folder) => walk(&folder.items, out),
                    CollectionItem::Request(r) => out.push(r.id.clone()),
                }
            }
        }
        let mut ids = Vec::new();
        walk(&self.items, &mut ids);
        ids
    }
}

/// Error captured on a failed history entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryError {
    pub code: String,
    pub message: String,
}

/// Immutable record of one dispatch attempt
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    pub method: HttpMethod,
    pub url: String,
    pub name: String,
    /// Absent on hard failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default)]
    pub response_time_ms: u64,
    #[serde(default)]
    pub response_size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub executed_at: DateTime<Utc>,
    pub curl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HistoryError>,
}

impl HistoryEntry {
    /// Re-open the entry as an editable request.
    pub fn to_request(&self) -> Result<Request, crate::error::CurlError> {
        let mut request = crate::curl::parse_curl(&self.curl)?;
        request.name = self.name.clone();
        Ok(request)
    }
}

/// Singleton settings record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "settings_id")]
    pub id: String,
    #[serde(default)]
    pub variables: Vec<KeyValue>,
    #[serde(default)]
    pub default_headers: Vec<KeyValue>,
    #[serde(default = "default_timeout")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_history")]
    pub max_history_size: usize,
    #[serde(default = "default_expire_days")]
    pub history_expire_days: u32,
    #[serde(default = "Utc::now", with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

fn settings_id() -> String {
    SETTINGS_ID.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

fn default_expire_days() -> u32 {
    DEFAULT_HISTORY_EXPIRE_DAYS
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            id: settings_id(),
            variables: Vec::new(),
            default_headers: vec![KeyValue::new("User-Agent", default_user_agent())],
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_history_size: DEFAULT_MAX_HISTORY,
            history_expire_days: DEFAULT_HISTORY_EXPIRE_DAYS,
            updated_at: Utc::now(),
        }
    }
}

impl Settings {
    /// A fresh request pre-filled with the default headers.
    pub fn new_request(&self) -> Request {
        Request {
            headers: self
                .default_headers
                .iter()
                .map(|h| KeyValue {
                    id: new_id(),
                    ..h.clone()
                })
                .collect(),
            ..Request::default()
        }
    }
}

/// Scope level of a variable set; ordering is precedence, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Collection,
    Request,
}

/// A named, ordered set of variables
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableScope {
    pub name: String,
    pub kind: ScopeKind,
    pub variables: Vec<KeyValue>,
}

impl VariableScope {
    pub fn new(name: impl Into<String>, kind: ScopeKind, variables: Vec<KeyValue>) -> Self {
        VariableScope {
            name: name.into(),
            kind,
            variables,
        }
    }

    pub fn global(variables: Vec<KeyValue>) -> Self {
        VariableScope::new("global", ScopeKind::Global, variables)
    }

    pub fn collection(collection: &Collection) -> Self {
        VariableScope::new(collection.name.clone(), ScopeKind::Collection, collection.variables.clone())
    }

    pub fn request(variables: Vec<KeyValue>) -> Self {
        VariableScope::new("request", ScopeKind::Request, variables)
    }

    /// Build a request-level scope from a flat map, sorted by key.
    pub fn from_map(name: impl Into<String>, kind: ScopeKind, map: &VarMap) -> Self {
        let mut variables: Vec<KeyValue> = map.iter().map(|(k, v)| KeyValue::new(k, v)).collect();
        variables.sort_by(|a, b| a.key.cmp(&b.key));
        VariableScope::new(name, kind, variables)
    }
}

/// Classification of a response body
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    Json,
    Html,
    Xml,
    #[default]
    Text,
}

/// Normalized response from a dispatch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub body_kind: BodyKind,
    pub response_time_ms: u64,
    pub size_bytes: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub received_at: DateTime<Utc>,
}

impl HttpResponse {
    /// First header with this name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Kind of a search hit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Collection,
    Folder,
    Request,
}

/// A search hit with its `/`-joined location
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub kind: SearchKind,
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}
