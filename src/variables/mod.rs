//! Variable resolver - scope merging and `{{...}}` template expansion

pub mod functions;

use regex::{Captures, Regex};
use std::fmt;
use std::sync::OnceLock;

use crate::models::{Auth, KeyValue, Request, RequestBody, VarMap, VariableScope};

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\{\{([^}]+)\}\}").expect("token pattern is valid"))
}

fn call_regex() -> &'static Regex {
    static CALL: OnceLock<Regex> = OnceLock::new();
    CALL.get_or_init(|| Regex::new(r"^(\w+)\((.*)\)$").expect("call pattern is valid"))
}

/// Merge scopes into a flat mapping.
///
/// Precedence is global < collection < request regardless of the order the
/// scopes are passed in; within one level, later scopes win. Only enabled
/// entries with a non-empty key participate.
pub fn merge(scopes: &[VariableScope]) -> VarMap {
    let mut ordered: Vec<&VariableScope> = scopes.iter().collect();
    ordered.sort_by_key(|s| s.kind);

    let mut merged = VarMap::new();
    for scope in ordered {
        for var in scope.variables.iter().filter(|v| v.enabled && !v.key.is_empty()) {
            merged.insert(var.key.clone(), var.value.clone());
        }
    }
    merged
}

/// Expand every `{{expr}}` token in `text`.
///
/// `name(args)` tokens naming a dynamic function are replaced with its
/// result; other tokens are looked up in `vars`. Anything unresolved is left
/// exactly as written.
pub fn expand(text: &str, vars: &VarMap) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }

    token_regex()
        .replace_all(text, |caps: &Captures| {
            let whole = &caps[0];
            let expr = caps[1].trim();

            if let Some(call) = call_regex().captures(expr) {
                let args: Vec<&str> = match call[2].trim() {
                    "" => Vec::new(),
                    raw => raw.split(',').map(str::trim).collect(),
                };
                if let Some(value) = functions::call(&call[1], &args) {
                    return value;
                }
            }

            vars.get(expr).cloned().unwrap_or_else(|| whole.to_string())
        })
        .into_owned()
}

fn expand_in_place(text: &mut String, vars: &VarMap) {
    if text.contains("{{") {
        *text = expand(text, vars);
    }
}

fn expand_entries(entries: &mut [KeyValue], vars: &VarMap) {
    for entry in entries {
        expand_in_place(&mut entry.key, vars);
        expand_in_place(&mut entry.value, vars);
    }
}

/// Expand templates in every string field of a request.
///
/// Identity fields (`id`, `collection_id`) are left alone.
pub fn expand_request(request: &Request, vars: &VarMap) -> Request {
    let mut out = request.clone();

    expand_in_place(&mut out.name, vars);
    expand_in_place(&mut out.url, vars);
    if let Some(description) = out.description.as_mut() {
        expand_in_place(description, vars);
    }
    expand_entries(&mut out.params, vars);
    expand_entries(&mut out.headers, vars);

    match &mut out.body {
        RequestBody::None => {}
        RequestBody::FormData { fields } | RequestBody::UrlEncoded { fields } => {
            expand_entries(fields, vars)
        }
        RequestBody::Raw { content, .. } => expand_in_place(content, vars),
        RequestBody::Binary { data } => expand_in_place(data, vars),
    }

    match &mut out.auth {
        Auth::None => {}
        Auth::Bearer { token } => expand_in_place(token, vars),
        Auth::Basic { username, password } => {
            expand_in_place(username, vars);
            expand_in_place(password, vars);
        }
        Auth::ApiKey { key, value, .. } => {
            expand_in_place(key, vars);
            expand_in_place(value, vars);
        }
        Auth::Custom { script } => expand_in_place(script, vars),
    }

    for script in [&mut out.scripts.pre_request, &mut out.scripts.post_response]
        .into_iter()
        .flatten()
    {
        expand_in_place(script, vars);
    }

    out
}

/// Names referenced by `{{...}}` tokens, in order of appearance.
pub fn extract_variables(text: &str) -> Vec<String> {
    token_regex()
        .captures_iter(text)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Merged variables plus a `{{name()}}` placeholder per dynamic function,
/// for editor autocomplete.
pub fn available_variables(scopes: &[VariableScope]) -> VarMap {
    let mut vars = merge(scopes);
    for name in functions::NAMES {
        vars.insert(name.to_string(), format!("{{{{{}()}}}}", name));
    }
    vars
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BraceErrorKind {
    Unclosed,
    UnmatchedClose,
}

/// An unmatched `{{` or `}}`, positioned by character offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BraceError {
    pub kind: BraceErrorKind,
    pub offset: usize,
}

impl fmt::Display for BraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BraceErrorKind::Unclosed => write!(f, "Unclosed {{{{ at position {}", self.offset),
            BraceErrorKind::UnmatchedClose => {
                write!(f, "Unmatched closing }}}} at position {}", self.offset)
            }
        }
    }
}

/// Check that every `{{` has a matching `}}`. Nothing is corrected.
pub fn validate_braces(text: &str) -> Result<(), Vec<BraceError>> {
    let chars: Vec<char> = text.chars().collect();
    let mut open = Vec::new();
    let mut errors = Vec::new();

    let mut i = 0;
    while i < chars.len() {
        let pair = chars.get(i + 1) == Some(&chars[i]);
        match chars[i] {
            '{' if pair => {
                open.push(i);
                i += 2;
            }
            '}' if pair => {
                if open.pop().is_none() {
                    errors.push(BraceError {
                        kind: BraceErrorKind::UnmatchedClose,
                        offset: i,
                    });
                }
                i += 2;
            }
            _ => i += 1,
        }
    }

    errors.extend(open.into_iter().map(|offset| BraceError {
        kind: BraceErrorKind::Unclosed,
        offset,
    }));

    if errors.is_empty() {
        Ok(())
    } else {
        errors.sort_by_key(|e| e.offset);
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HttpMethod, ScopeKind};

    fn vars(pairs: &[(&str, &str)]) -> VarMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn is_uuid_v4(s: &str) -> bool {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
            .unwrap()
            .is_match(s)
    }

    #[test]
    fn test_unresolved_tokens_pass_through() {
        assert_eq!(expand("{{a}}-{{b}}", &vars(&[("a", "1")])), "1-{{b}}");
    }

    #[test]
    fn test_whitespace_inside_token_is_trimmed() {
        assert_eq!(expand("{{ host }}/api", &vars(&[("host", "h")])), "h/api");
    }

    #[test]
    fn test_empty_value_still_resolves() {
        assert_eq!(expand("x{{a}}y", &vars(&[("a", "")])), "xy");
    }

    #[test]
    fn test_uuid_function() {
        let a = expand("{{uuid()}}", &VarMap::new());
        let b = expand("{{uuid()}}", &VarMap::new());
        assert_eq!(a.len(), 36);
        assert!(is_uuid_v4(&a), "{a}");
        assert_ne!(a, b);
    }

    #[test]
    fn test_function_arguments() {
        let n: i64 = expand("{{random(3, 3)}}", &VarMap::new()).parse().unwrap();
        assert_eq!(n, 3);
        assert_eq!(expand("{{randomString(4)}}", &VarMap::new()).len(), 4);
        let ts: i64 = expand("{{timestamp()}}", &VarMap::new()).parse().unwrap();
        assert!(ts > 1_600_000_000_000);
    }

    #[test]
    fn test_bad_function_arguments_leave_token() {
        assert_eq!(expand("{{random(a,b)}}", &VarMap::new()), "{{random(a,b)}}");
        assert_eq!(expand("{{unknown()}}", &VarMap::new()), "{{unknown()}}");
    }

    #[test]
    fn test_merge_precedence_and_enabled() {
        let scopes = vec![
            VariableScope::request(vec![KeyValue::new("host", "request")]),
            VariableScope::global(vec![
                KeyValue::new("host", "global"),
                KeyValue::new("token", "g-token"),
                KeyValue::disabled("secret", "x"),
            ]),
            VariableScope::new(
                "shop",
                ScopeKind::Collection,
                vec![KeyValue::new("host", "collection"), KeyValue::new("token", "c-token")],
            ),
        ];
        let merged = merge(&scopes);
        assert_eq!(merged["host"], "request");
        assert_eq!(merged["token"], "c-token");
        assert!(!merged.contains_key("secret"));
    }

    #[test]
    fn test_expand_request_touches_nested_fields() {
        let mut req = Request::new(HttpMethod::POST, "{{base}}/users");
        req.headers.push(KeyValue::new("X-Trace", "{{trace}}"));
        req.params.push(KeyValue::disabled("q", "{{trace}}"));
        req.body = RequestBody::UrlEncoded {
            fields: vec![KeyValue::new("name", "{{user}}")],
        };
        req.auth = Auth::Bearer {
            token: "{{token}}".into(),
        };

        let v = vars(&[
            ("base", "https://api.test"),
            ("trace", "t1"),
            ("user", "ana"),
            ("token", "abc"),
        ]);
        let out = expand_request(&req, &v);

        assert_eq!(out.url, "https://api.test/users");
        assert_eq!(out.headers[0].value, "t1");
        assert_eq!(out.params[0].value, "t1");
        assert!(!out.params[0].enabled);
        assert_eq!(
            out.body,
            RequestBody::UrlEncoded {
                fields: vec![KeyValue {
                    value: "ana".into(),
                    ..req_field(&req)
                }]
            }
        );
        assert_eq!(out.auth, Auth::Bearer { token: "abc".into() });
        assert_eq!(out.id, req.id);
        // the source entity is not mutated
        assert_eq!(req.url, "{{base}}/users");
    }

    fn req_field(req: &Request) -> KeyValue {
        match &req.body {
            RequestBody::UrlEncoded { fields } => fields[0].clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_validate_braces_reports_offsets() {
        assert!(validate_braces("{{a}} and {{b}}").is_ok());

        let errors = validate_braces("}} x {{open").unwrap_err();
        assert_eq!(
            errors,
            vec![
                BraceError {
                    kind: BraceErrorKind::UnmatchedClose,
                    offset: 0
                },
                BraceError {
                    kind: BraceErrorKind::Unclosed,
                    offset: 5
                },
            ]
        );
        assert_eq!(errors[1].to_string(), "Unclosed {{ at position 5");
    }

    #[test]
    fn test_validate_braces_counts_characters_not_bytes() {
        let errors = validate_braces("é{{").unwrap_err();
        assert_eq!(errors[0].offset, 1);
    }

    #[test]
    fn test_extract_and_available_variables() {
        assert_eq!(
            extract_variables("{{host}}/{{ id }}?t={{timestamp()}}"),
            vec!["host", "id", "timestamp()"]
        );
        let available = available_variables(&[VariableScope::global(vec![KeyValue::new("a", "1")])]);
        assert_eq!(available["a"], "1");
        assert_eq!(available["uuid"], "{{uuid()}}");
    }
}
