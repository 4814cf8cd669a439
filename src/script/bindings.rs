//! Types and functions visible to user scripts
//!
//! This is the whole capability surface: a request view, a response view,
//! the variable map, a console and a handful of utilities. Nothing here
//! touches the filesystem, the network or the store.

use std::cell::RefCell;
use std::rc::Rc;

use base64::Engine as _;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map};

use crate::models::{HttpResponse, Request, RequestBody, VarMap};
use crate::variables::functions;

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Captured console output, shared between the engine callbacks
#[derive(Clone, Default)]
pub struct Console {
    lines: Rc<RefCell<Vec<String>>>,
}

impl Console {
    pub fn push(&self, prefix: &str, text: &str) {
        self.lines.borrow_mut().push(format!("{}{}", prefix, text));
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.lines.borrow_mut())
    }
}

/// What a script sees as `request`. Mutations are recorded, not applied.
#[derive(Clone, Debug, Default)]
pub struct ScriptRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub added_headers: Vec<(String, String)>,
    pub new_body: Option<String>,
}

impl From<&Request> for ScriptRequest {
    fn from(request: &Request) -> Self {
        let body = match &request.body {
            RequestBody::Raw { content, .. } => content.clone(),
            _ => String::new(),
        };
        ScriptRequest {
            url: request.url_with_params(),
            method: request.method.as_str().to_string(),
            headers: crate::models::enabled(&request.headers)
                .map(|h| (h.key.clone(), h.value.clone()))
                .collect(),
            body,
            added_headers: Vec::new(),
            new_body: None,
        }
    }
}

impl ScriptRequest {
    fn add_header(&mut self, key: &str, value: &str) {
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(existing) => existing.1 = value.to_string(),
            None => self.headers.push((key.to_string(), value.to_string())),
        }
        self.added_headers.push((key.to_string(), value.to_string()));
    }

    fn set_body(&mut self, body: String) {
        self.body = body.clone();
        self.new_body = Some(body);
    }
}

/// What a post-response script sees as `response`
#[derive(Clone, Debug, Default)]
pub struct ScriptResponse {
    pub status: i64,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
    pub response_time: i64,
}

impl From<&HttpResponse> for ScriptResponse {
    fn from(resp: &HttpResponse) -> Self {
        ScriptResponse {
            status: resp.status as i64,
            status_text: resp.status_text.clone(),
            headers: resp.headers.clone(),
            body: resp.body.clone(),
            response_time: resp.response_time_ms as i64,
        }
    }
}

/// The `variables` map. Every value is stored as a string.
#[derive(Clone, Debug, Default)]
pub struct ScriptVariables {
    pub values: VarMap,
}

fn headers_map(headers: &[(String, String)]) -> Map {
    headers
        .iter()
        .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
        .collect()
}

fn find_header(headers: &[(String, String)], name: &str) -> Dynamic {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| Dynamic::from(v.clone()))
        .unwrap_or(Dynamic::UNIT)
}

/// Strings stay as they are, maps and arrays become JSON.
pub fn dynamic_to_string(value: Dynamic) -> String {
    if value.is_string() {
        return value.into_string().unwrap_or_default();
    }
    if value.is_map() || value.is_array() {
        if let Ok(json) = serde_json::to_string(&value) {
            return json;
        }
    }
    value.to_string()
}

fn json_parse(text: &str) -> FnResult<Dynamic> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| format!("json_parse: {}", e))?;
    rhai::serde::to_dynamic(value)
}

fn json_stringify(value: Dynamic) -> FnResult<String> {
    serde_json::to_string(&value).map_err(|e| format!("json_stringify: {}", e).into())
}

fn btoa(text: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(text)
}

fn atob(encoded: &str) -> FnResult<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("atob: {}", e))?;
    String::from_utf8(bytes).map_err(|_| "atob: decoded data is not UTF-8".into())
}

fn console_line(args: &[Dynamic]) -> String {
    args.iter()
        .map(|a| dynamic_to_string(a.clone()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn register_console(engine: &mut Engine) {
    engine.register_type_with_name::<Console>("Console");
    for (name, prefix) in [("log", ""), ("info", ""), ("warn", "[WARN] "), ("error", "[ERROR] ")] {
        engine.register_fn(name, move |c: &mut Console, a: Dynamic| {
            c.push(prefix, &console_line(&[a]))
        });
        engine.register_fn(name, move |c: &mut Console, a: Dynamic, b: Dynamic| {
            c.push(prefix, &console_line(&[a, b]))
        });
        engine.register_fn(name, move |c: &mut Console, a: Dynamic, b: Dynamic, d: Dynamic| {
            c.push(prefix, &console_line(&[a, b, d]))
        });
    }
}

fn register_request(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptRequest>("Request")
        .register_get("url", |r: &mut ScriptRequest| r.url.clone())
        .register_get("method", |r: &mut ScriptRequest| r.method.clone())
        .register_get("body", |r: &mut ScriptRequest| r.body.clone())
        .register_get("headers", |r: &mut ScriptRequest| headers_map(&r.headers))
        .register_fn("header", |r: &mut ScriptRequest, name: &str| find_header(&r.headers, name))
        .register_fn("add_header", |r: &mut ScriptRequest, key: &str, value: Dynamic| {
            r.add_header(key, &dynamic_to_string(value))
        })
        .register_fn("set_body", |r: &mut ScriptRequest, body: Dynamic| {
            r.set_body(dynamic_to_string(body))
        });
}

fn register_response(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptResponse>("Response")
        .register_get("status", |r: &mut ScriptResponse| r.status)
        .register_get("status_text", |r: &mut ScriptResponse| r.status_text.clone())
        .register_get("body", |r: &mut ScriptResponse| r.body.clone())
        .register_get("headers", |r: &mut ScriptResponse| headers_map(&r.headers))
        .register_get("response_time", |r: &mut ScriptResponse| r.response_time)
        .register_fn("header", |r: &mut ScriptResponse, name: &str| find_header(&r.headers, name))
        .register_fn("json", |r: &mut ScriptResponse| json_parse(&r.body));
}

fn register_variables(engine: &mut Engine) {
    fn get(v: &mut ScriptVariables, key: &str) -> Dynamic {
        v.values
            .get(key)
            .map(|s| Dynamic::from(s.clone()))
            .unwrap_or(Dynamic::UNIT)
    }
    fn set(v: &mut ScriptVariables, key: &str, value: Dynamic) {
        v.values.insert(key.to_string(), dynamic_to_string(value));
    }

    engine
        .register_type_with_name::<ScriptVariables>("Variables")
        .register_fn("get", get)
        .register_fn("set", set)
        .register_indexer_get(get)
        .register_indexer_set(set)
        .register_fn("has", |v: &mut ScriptVariables, key: &str| v.values.contains_key(key))
        .register_fn("remove", |v: &mut ScriptVariables, key: &str| {
            v.values.remove(key).map(Dynamic::from).unwrap_or(Dynamic::UNIT)
        })
        .register_fn("keys", |v: &mut ScriptVariables| {
            let mut keys: Vec<&String> = v.values.keys().collect();
            keys.sort();
            keys.into_iter()
                .map(|k| Dynamic::from(k.clone()))
                .collect::<Array>()
        });
}

fn register_utilities(engine: &mut Engine) {
    engine
        .register_fn("btoa", btoa)
        .register_fn("atob", atob)
        .register_fn("json_parse", json_parse)
        .register_fn("json_stringify", json_stringify)
        .register_fn("now_millis", || chrono::Utc::now().timestamp_millis())
        .register_fn("now_iso", || {
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        })
        .register_fn("uuid", || uuid::Uuid::new_v4().to_string())
        .register_fn("random_int", |min: i64, max: i64| -> FnResult<i64> {
            functions::random_in_range(min, max)
                .ok_or_else(|| format!("random_int: {} is greater than {}", min, max).into())
        })
        .register_fn("random_string", |len: i64| -> FnResult<ImmutableString> {
            let len = usize::try_from(len).map_err(|_| "random_string: negative length")?;
            Ok(functions::random_string(len.min(functions::MAX_RANDOM_STRING_LEN)).into())
        });
}

/// Register the full script surface on an engine.
pub fn register(engine: &mut Engine) {
    register_console(engine);
    register_request(engine);
    register_response(engine);
    register_variables(engine);
    register_utilities(engine);
}
