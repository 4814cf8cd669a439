//! JSON import/export for requests and collections
//!
//! Export writes our own at-rest shapes, with a collection's tree expanded
//! to carry full requests. Import is lenient: it reads our exports, plain
//! hand-written documents and Postman-style collections, filling any
//! missing optional field with its default.

use serde_json::{json, Map, Value};

use crate::error::ImportError;
use crate::models::{
    ApiKeyLocation, Auth, Collection, CollectionItem, Folder, HttpMethod, KeyValue,
    RawFormat, Request, RequestBody, RequestRef, Scripts,
};

/// Result of importing a document
#[derive(Clone, Debug, PartialEq)]
pub enum Imported {
    Request(Box<Request>),
    /// The collection plus every request its tree references
    Collection(Collection, Vec<Request>),
}

pub fn export_request_json(request: &Request) -> Result<String, ImportError> {
    Ok(serde_json::to_string_pretty(request)?)
}

/// Export a collection with each request reference replaced by the full
/// request, looked up through `resolve`.
pub fn export_collection_json<F>(collection: &Collection, resolve: F) -> Result<String, ImportError>
where
    F: Fn(&str) -> Option<Request>,
{
    fn expand_items<F: Fn(&str) -> Option<Request>>(
        items: &[CollectionItem],
        resolve: &F,
    ) -> Result<Vec<Value>, ImportError> {
        let mut out = Vec::new();
        for item in items {
            match item {
                CollectionItem::Folder(folder) => out.push(json!({
                    "name": folder.name,
                    "description": folder.description,
                    "items": expand_items(&folder.items, resolve)?,
                })),
                CollectionItem::Request(reference) => {
                    if let Some(request) = resolve(&reference.id) {
                        out.push(serde_json::to_value(request)?);
                    }
                }
            }
        }
        Ok(out)
    }

    let doc = json!({
        "name": collection.name,
        "description": collection.description,
        "variables": collection.variables,
        "items": expand_items(&collection.items, &resolve)?,
    });
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Import any supported document. Everything imported gets fresh ids.
pub fn import_json(text: &str) -> Result<Imported, ImportError> {
    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(ImportError::NotAnObject)?;

    if items_of(obj).is_some() {
        let (collection, requests) = collection_from(obj);
        return Ok(Imported::Collection(collection, requests));
    }
    if obj.contains_key("url") || obj.contains_key("endpoint") || obj.contains_key("method") {
        return Ok(Imported::Request(Box::new(request_from(obj)?)));
    }
    Err(ImportError::UnknownShape)
}

pub fn import_request_json(text: &str) -> Result<Request, ImportError> {
    match import_json(text)? {
        Imported::Request(request) => Ok(*request),
        Imported::Collection(..) => Err(ImportError::UnknownShape),
    }
}

pub fn import_collection_json(text: &str) -> Result<(Collection, Vec<Request>), ImportError> {
    match import_json(text)? {
        Imported::Collection(collection, requests) => Ok((collection, requests)),
        Imported::Request(_) => Err(ImportError::UnknownShape),
    }
}

fn items_of(obj: &Map<String, Value>) -> Option<&Vec<Value>> {
    obj.get("items").or_else(|| obj.get("item")).and_then(Value::as_array)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// First present, non-empty string among `keys`
fn field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .map(text)
        .find(|s| !s.is_empty())
}

/// Key/value rows from an array of `{key, value, enabled}` or a plain object
fn key_values(value: Option<&Value>) -> Vec<KeyValue> {
    match value {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|row| {
                let key = field(row, &["key", "name"])?;
                let mut kv = KeyValue::new(key, row.get("value").map(text).unwrap_or_default());
                kv.enabled = row.get("enabled").and_then(Value::as_bool).unwrap_or(true)
                    && !row.get("disabled").and_then(Value::as_bool).unwrap_or(false);
                kv.description = field(row, &["description"]);
                Some(kv)
            })
            .collect(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| KeyValue::new(k, text(v))).collect(),
        _ => Vec::new(),
    }
}

fn raw_format(name: Option<&str>, content: &str) -> RawFormat {
    match name.map(str::to_ascii_lowercase).as_deref() {
        Some("json") => RawFormat::Json,
        Some("xml") => RawFormat::Xml,
        Some("text") => RawFormat::Text,
        _ if serde_json::from_str::<Value>(content).is_ok() => RawFormat::Json,
        _ if content.trim_start().starts_with('<') => RawFormat::Xml,
        _ => RawFormat::Text,
    }
}

fn body_from(value: Option<&Value>) -> RequestBody {
    let Some(value) = value else {
        return RequestBody::None;
    };
    if let Ok(body) = serde_json::from_value::<RequestBody>(value.clone()) {
        return body;
    }

    match value {
        Value::String(s) if s.is_empty() => RequestBody::None,
        Value::String(s) => RequestBody::raw(raw_format(None, s), s.clone()),
        Value::Object(obj) if obj.is_empty() => RequestBody::None,
        Value::Object(obj) => {
            let format = obj
                .get("format")
                .or_else(|| obj.get("options").and_then(|o| o.pointer("/raw/language")))
                .and_then(Value::as_str);
            if let Some(raw) = obj.get("raw").or_else(|| obj.get("content")) {
                let content = match raw {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other).unwrap_or_default(),
                };
                return RequestBody::raw(raw_format(format, &content), content);
            }
            let form = ["formData", "formdata", "form"].iter().find_map(|k| obj.get(*k));
            if let Some(fields) = form {
                return RequestBody::FormData {
                    fields: key_values(Some(fields)),
                };
            }
            if let Some(fields) = obj.get("urlencoded") {
                return RequestBody::UrlEncoded {
                    fields: key_values(Some(fields)),
                };
            }
            // Any other object is the payload itself
            RequestBody::json(serde_json::to_string_pretty(value).unwrap_or_default())
        }
        Value::Null => RequestBody::None,
        other => RequestBody::json(other.to_string()),
    }
}

fn auth_from(value: Option<&Value>) -> Auth {
    let Some(Value::Object(obj)) = value else {
        return Auth::None;
    };
    if let Ok(auth) = serde_json::from_value::<Auth>(Value::Object(obj.clone())) {
        return auth;
    }

    let kind = obj.get("type").and_then(Value::as_str).unwrap_or("").to_ascii_lowercase();
    // `{type: "bearer", bearer: {token}}`, the details may also sit inline
    let section = |name: &str| obj.get(name).and_then(Value::as_object).unwrap_or(obj);
    match kind.as_str() {
        "bearer" => field(section("bearer"), &["token"])
            .map(|token| Auth::Bearer { token })
            .unwrap_or_default(),
        "basic" => {
            let basic = section("basic");
            field(basic, &["username"])
                .map(|username| Auth::Basic {
                    username,
                    password: field(basic, &["password"]).unwrap_or_default(),
                })
                .unwrap_or_default()
        }
        "apikey" | "api-key" | "api_key" => {
            let api_key = section("apiKey");
            let location = match field(api_key, &["in", "addTo"]).as_deref() {
                Some("query") | Some("queryParams") => ApiKeyLocation::Query,
                _ => ApiKeyLocation::Header,
            };
            field(api_key, &["key"])
                .map(|key| Auth::ApiKey {
                    key,
                    value: field(api_key, &["value"]).unwrap_or_default(),
                    location,
                })
                .unwrap_or_default()
        }
        _ => Auth::None,
    }
}

fn request_from(obj: &Map<String, Value>) -> Result<Request, ImportError> {
    // Postman nests the request under `request`, with the name outside
    let inner = obj.get("request").and_then(Value::as_object).unwrap_or(obj);

    let url = match inner.get("url") {
        Some(Value::Object(u)) => field(u, &["raw"]),
        _ => field(inner, &["url", "endpoint"]),
    }
    .ok_or(ImportError::MissingField("url"))?;

    let method = field(inner, &["method"])
        .and_then(|m| m.parse::<HttpMethod>().ok())
        .unwrap_or_default();

    let scripts = inner.get("scripts").and_then(Value::as_object);
    let script = |nested: &[&str], flat: &[&str]| {
        scripts
            .and_then(|s| field(s, nested))
            .or_else(|| field(inner, flat))
    };

    let mut request = Request::new(method, url);
    request.name = field(obj, &["name", "title"])
        .or_else(|| field(inner, &["name", "title"]))
        .unwrap_or_else(|| format!("{} {}", request.method, request.url));
    request.description = field(inner, &["description"]);
    request.params = key_values(inner.get("params").or_else(|| inner.get("query")));
    request.headers = key_values(inner.get("headers").or_else(|| inner.get("header")));
    request.body = body_from(inner.get("body"));
    request.auth = auth_from(inner.get("auth"));
    request.scripts = Scripts {
        pre_request: script(&["preRequest", "pre_request"], &["preScript", "preRequestScript"]),
        post_response: script(&["postResponse", "post_response"], &["postScript", "tests"]),
    };
    Ok(request)
}

fn tree_from(
    values: &[Value],
    collection_id: &str,
    requests: &mut Vec<Request>,
) -> Vec<CollectionItem> {
    let mut items = Vec::new();
    for obj in values.iter().filter_map(Value::as_object) {
        if let Some(children) = items_of(obj) {
            let name = field(obj, &["name", "title"]).unwrap_or_else(|| "Folder".to_string());
            let mut folder = Folder::new(name);
            folder.description = field(obj, &["description"]);
            folder.items = tree_from(children, collection_id, requests);
            items.push(CollectionItem::Folder(folder));
            continue;
        }
        match request_from(obj) {
            Ok(mut request) => {
                request.collection_id = Some(collection_id.to_string());
                items.push(CollectionItem::Request(RequestRef::from(&request)));
                requests.push(request);
            }
            Err(e) => tracing::warn!("Skipping collection item: {}", e),
        }
    }
    items
}

fn collection_from(obj: &Map<String, Value>) -> (Collection, Vec<Request>) {
    let info = obj.get("info").and_then(Value::as_object);
    let name = field(obj, &["name", "title"])
        .or_else(|| info.and_then(|i| field(i, &["name"])))
        .unwrap_or_else(|| "Imported Collection".to_string());

    let mut collection = Collection::new(name);
    collection.description =
        field(obj, &["description"]).or_else(|| info.and_then(|i| field(i, &["description"])));
    collection.variables = key_values(obj.get("variables").or_else(|| obj.get("variable")));

    let mut requests = Vec::new();
    let empty = Vec::new();
    collection.items = tree_from(items_of(obj).unwrap_or(&empty), &collection.id, &mut requests);
    (collection, requests)
}
