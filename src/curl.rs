//! cURL import/export
//!
//! `to_curl` renders a request as a shell command; `parse_curl` reads one
//! back. Parsing is lenient: unknown flags are skipped and only a missing URL
//! is an error.

use base64::Engine;

use crate::error::CurlError;
use crate::models::{
    enabled, append_query, ApiKeyLocation, Auth, HttpMethod, KeyValue, RawFormat, Request,
    RequestBody,
};

/// Flags that take a value we do not interpret. Their value must be consumed
/// so it is not mistaken for the URL.
const IGNORED_VALUE_FLAGS: &[&str] = &[
    "-o", "--output", "-m", "--max-time", "--connect-timeout", "-x", "--proxy", "-U",
    "--proxy-user", "--retry", "--retry-delay", "--retry-max-time", "-w", "--write-out", "-T",
    "--upload-file", "-E", "--cert", "--key", "--cacert", "--capath", "-r", "--range", "-c",
    "--cookie-jar", "--resolve", "--connect-to", "-K", "--config", "--max-redirs",
    "--limit-rate", "-Y", "--speed-limit", "-y", "--speed-time", "--interface", "--dns-servers",
];

/// Parse a cURL command into a Request
pub fn parse_curl(input: &str) -> Result<Request, CurlError> {
    let mut request = Request {
        name: String::from("Imported from curl"),
        ..Request::default()
    };

    // Remove line continuations and normalize
    let normalized = input.replace("\\\r\n", " ").replace("\\\n", " ");

    let mut tokens = tokenize(&normalized);

    // Skip 'curl' command if present
    if tokens.first().map(|s| s.as_str()) == Some("curl") {
        tokens.remove(0);
    }

    let mut url: Option<String> = None;
    let mut explicit_method = false;
    let mut get_mode = false;
    let mut data_parts: Vec<String> = Vec::new();
    let mut form_fields: Vec<KeyValue> = Vec::new();

    let mut iter = tokens.into_iter();
    while let Some(token) = iter.next() {
        // --flag=value
        let (flag, inline_value) = match token.split_once('=') {
            Some((flag, value)) if token.starts_with("--") => {
                (flag.to_string(), Some(value.to_string()))
            }
            _ => (token.clone(), None),
        };
        let value =
            |iter: &mut std::vec::IntoIter<String>| inline_value.clone().or_else(|| iter.next());

        match flag.as_str() {
            "-X" | "--request" => {
                if let Some(method) = value(&mut iter).and_then(|m| m.parse::<HttpMethod>().ok()) {
                    request.method = method;
                    explicit_method = true;
                }
            }
            "-H" | "--header" => {
                if let Some(header) = value(&mut iter).and_then(|h| parse_header(&h)) {
                    request.headers.push(header);
                }
            }
            "-d" | "--data" | "--data-raw" | "--data-binary" | "--data-ascii" => {
                if let Some(data) = value(&mut iter) {
                    data_parts.push(data);
                }
            }
            "--data-urlencode" => {
                if let Some(data) = value(&mut iter) {
                    data_parts.push(urlencode_data(&data));
                }
            }
            "-F" | "--form" | "--form-string" => {
                if let Some(field) = value(&mut iter) {
                    let (key, val) = field.split_once('=').unwrap_or((field.as_str(), ""));
                    form_fields.push(KeyValue::new(key.trim(), val));
                }
            }
            "-u" | "--user" => {
                if let Some(credentials) = value(&mut iter) {
                    let (username, password) = parse_basic_auth(&credentials);
                    request.auth = Auth::Basic { username, password };
                }
            }
            "-b" | "--cookie" => {
                if let Some(cookie) = value(&mut iter).filter(|c| !c.is_empty()) {
                    request.headers.push(KeyValue::new("Cookie", cookie));
                }
            }
            "-A" | "--user-agent" => {
                if let Some(agent) = value(&mut iter).filter(|a| !a.is_empty()) {
                    request.headers.push(KeyValue::new("User-Agent", agent));
                }
            }
            "-e" | "--referer" => {
                if let Some(referer) = value(&mut iter).filter(|r| !r.is_empty()) {
                    request.headers.push(KeyValue::new("Referer", referer));
                }
            }
            "--url" => {
                if let Some(u) = value(&mut iter) {
                    url.get_or_insert(u);
                }
            }
            "-G" | "--get" => get_mode = true,
            "-I" | "--head" => {
                request.method = HttpMethod::HEAD;
                explicit_method = true;
            }
            f if IGNORED_VALUE_FLAGS.contains(&f) => {
                let _ = value(&mut iter);
            }
            f if f.starts_with('-') && f.len() > 1 => {
                // Ignored flags
            }
            _ => {
                if url.is_none() {
                    url = Some(token);
                }
            }
        }
    }

    request.url = url.filter(|u| !u.is_empty()).ok_or(CurlError::MissingUrl)?;

    if !data_parts.is_empty() {
        let data = data_parts.join("&");
        if get_mode {
            request.url = append_raw_query(&request.url, &data);
            request.method = HttpMethod::GET;
        } else {
            request.body = detect_body(&data, request.header("Content-Type"));
            if !explicit_method {
                request.method = HttpMethod::POST;
            }
        }
    } else if !form_fields.is_empty() {
        request.body = RequestBody::FormData {
            fields: form_fields,
        };
        if !explicit_method {
            request.method = HttpMethod::POST;
        }
    }

    Ok(request)
}

/// Split on the first colon; a header without one is dropped.
fn parse_header(s: &str) -> Option<KeyValue> {
    let (key, value) = s.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some(KeyValue::new(key, value.trim()))
}

fn parse_basic_auth(s: &str) -> (String, String) {
    match s.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (s.to_string(), String::new()),
    }
}

/// `name=content` → `name=<encoded content>`, as curl's `--data-urlencode` does.
fn urlencode_data(data: &str) -> String {
    match data.split_once('=') {
        Some((name, content)) => {
            let encoded: String = url::form_urlencoded::byte_serialize(content.as_bytes()).collect();
            format!("{}={}", name, encoded)
        }
        None => url::form_urlencoded::byte_serialize(data.as_bytes()).collect(),
    }
}

fn append_raw_query(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query)
}

fn looks_urlencoded(data: &str) -> bool {
    !data.is_empty()
        && !data.chars().any(char::is_whitespace)
        && data.split('&').all(|pair| matches!(pair.split_once('='), Some((k, _)) if !k.is_empty()))
}

/// Pick a body variant from the declared content type, falling back to the
/// shape of the data itself.
fn detect_body(data: &str, content_type: Option<&str>) -> RequestBody {
    let content_type = content_type.unwrap_or("").to_ascii_lowercase();
    let trimmed = data.trim_start();

    if content_type.contains("x-www-form-urlencoded")
        || (content_type.is_empty() && !trimmed.starts_with(['{', '[']) && looks_urlencoded(data))
    {
        let fields = url::form_urlencoded::parse(data.as_bytes())
            .map(|(k, v)| KeyValue::new(k, v))
            .collect();
        return RequestBody::UrlEncoded { fields };
    }

    let format = if content_type.contains("json") {
        RawFormat::Json
    } else if content_type.contains("xml") {
        RawFormat::Xml
    } else if content_type.starts_with("text/") {
        RawFormat::Text
    } else if trimmed.starts_with(['{', '[']) {
        RawFormat::Json
    } else if trimmed.starts_with('<') {
        RawFormat::Xml
    } else {
        RawFormat::Text
    };
    RequestBody::raw(format, data)
}

/// Tokenize a curl command, respecting quotes
///
/// Single quotes are literal. Inside double quotes a backslash only escapes
/// `"`, `\`, `$` and `` ` ``. Outside quotes a backslash escapes any character.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_token = false;
    let mut in_single_quote = false;
    let mut in_double_quote = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_double_quote => match chars.peek() {
                Some('"' | '\\' | '$' | '`') => {
                    current.extend(chars.next());
                }
                _ => current.push('\\'),
            },
            '\\' if !in_single_quote => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_token = true;
                }
            }
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                has_token = true;
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                has_token = true;
            }
            ' ' | '\t' | '\n' | '\r' if !in_single_quote && !in_double_quote => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            _ => {
                current.push(c);
                has_token = true;
            }
        }
    }

    if has_token {
        tokens.push(current);
    }

    tokens
}

/// Wrap in single quotes, escaping embedded single quotes by closing and
/// reopening the quote.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Format request as cURL command
pub fn to_curl(request: &Request) -> String {
    let mut parts = vec![format!("curl -X {}", request.method.as_str())];

    // URL
    let mut url = request.url_with_params();
    if let Auth::ApiKey {
        key,
        value,
        location: ApiKeyLocation::Query,
    } = &request.auth
    {
        url = append_query(&url, std::iter::once((key.as_str(), value.as_str())));
    }
    parts.push(shell_quote(&url));

    // Headers
    for header in enabled(&request.headers).filter(|h| !h.key.is_empty()) {
        parts.push(format!("-H {}", shell_quote(&format!("{}: {}", header.key, header.value))));
    }

    // Auth
    match &request.auth {
        Auth::Bearer { token } if request.header("Authorization").is_none() => {
            parts.push(format!("-H {}", shell_quote(&format!("Authorization: Bearer {}", token))));
        }
        Auth::Basic { username, password } if request.header("Authorization").is_none() => {
            parts.push(format!("-u {}", shell_quote(&format!("{}:{}", username, password))));
        }
        Auth::ApiKey {
            key,
            value,
            location: ApiKeyLocation::Header,
        } if request.header(key).is_none() => {
            parts.push(format!("-H {}", shell_quote(&format!("{}: {}", key, value))));
        }
        _ => {}
    }

    // Body
    if request.method.allows_body() {
        match &request.body {
            RequestBody::None => {}
            RequestBody::Raw { format, content } => {
                if request.header("Content-Type").is_none() {
                    parts.push(format!(
                        "-H {}",
                        shell_quote(&format!("Content-Type: {}", format.content_type()))
                    ));
                }
                // -d would read a file for a leading '@'
                let flag = if content.starts_with('@') { "--data-raw" } else { "-d" };
                parts.push(format!("{} {}", flag, shell_quote(content)));
            }
            RequestBody::FormData { fields } => {
                for field in enabled(fields) {
                    parts.push(format!("-F {}", shell_quote(&format!("{}={}", field.key, field.value))));
                }
            }
            RequestBody::UrlEncoded { fields } => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(enabled(fields).map(|f| (f.key.as_str(), f.value.as_str())))
                    .finish();
                parts.push(format!("-d {}", shell_quote(&encoded)));
            }
            RequestBody::Binary { data } => {
                if let Some(text) = base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
                {
                    parts.push(format!("--data-binary {}", shell_quote(&text)));
                }
            }
        }
    }

    parts.join(" \\\n  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_headers(req: &Request) -> Vec<(String, String)> {
        enabled(&req.headers)
            .map(|h| (h.key.clone(), h.value.clone()))
            .collect()
    }

    #[test]
    fn test_parse_simple_get() {
        let curl = "curl https://api.example.com/users";
        let req = parse_curl(curl).unwrap();
        assert_eq!(req.url, "https://api.example.com/users");
        assert_eq!(req.method, HttpMethod::GET);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_parse_post_with_data() {
        let curl = r#"curl -X POST -H "Content-Type: application/json" -d '{"name":"test"}' https://api.example.com/users"#;
        let req = parse_curl(curl).unwrap();
        assert_eq!(req.method, HttpMethod::POST);
        assert_eq!(req.body, RequestBody::json(r#"{"name":"test"}"#));
    }

    #[test]
    fn test_data_without_method_implies_post() {
        let req = parse_curl("curl https://x.test -d 'a=1&b=two'").unwrap();
        assert_eq!(req.method, HttpMethod::POST);
        match req.body {
            RequestBody::UrlEncoded { fields } => {
                assert_eq!(fields.len(), 2);
                assert_eq!((fields[1].key.as_str(), fields[1].value.as_str()), ("b", "two"));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_header_splits_on_first_colon_and_keeps_duplicates() {
        let req = parse_curl(
            "curl -H 'Host: example.com:8080' -H 'X-A: 1' -H 'X-A: 2' -H 'broken' http://h",
        )
        .unwrap();
        assert_eq!(
            enabled_headers(&req),
            vec![
                ("Host".to_string(), "example.com:8080".to_string()),
                ("X-A".to_string(), "1".to_string()),
                ("X-A".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_user_cookie_agent_and_form() {
        let req = parse_curl(
            "curl -u 'bob:p:w' -b 'sid=1; theme=dark' -A 'tool/1.0' -F 'name=ana' -F file=x https://h/upload",
        )
        .unwrap();
        assert_eq!(
            req.auth,
            Auth::Basic {
                username: "bob".into(),
                password: "p:w".into()
            }
        );
        assert_eq!(req.header("cookie"), Some("sid=1; theme=dark"));
        assert_eq!(req.header("user-agent"), Some("tool/1.0"));
        assert_eq!(req.method, HttpMethod::POST);
        match &req.body {
            RequestBody::FormData { fields } => {
                assert_eq!(fields[0].key, "name");
                assert_eq!(fields[1].value, "x");
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_value_flags_are_skipped() {
        let req = parse_curl("curl --compressed -sSL --max-time 10 -o out.json --weird 'https://h/a'")
            .unwrap();
        assert_eq!(req.url, "https://h/a");
    }

    #[test]
    fn test_long_flag_with_equals() {
        let req = parse_curl("curl --request=PUT --url=https://h/x --data-raw='v'").unwrap();
        assert_eq!(req.method, HttpMethod::PUT);
        assert_eq!(req.url, "https://h/x");
        assert_eq!(req.body, RequestBody::raw(RawFormat::Text, "v"));
    }

    #[test]
    fn test_get_mode_moves_data_to_query() {
        let req = parse_curl("curl -G https://h/search -d q=rust --data-urlencode 'tag=a b'").unwrap();
        assert_eq!(req.method, HttpMethod::GET);
        assert_eq!(req.url, "https://h/search?q=rust&tag=a+b");
        assert!(req.body.is_none());
    }

    #[test]
    fn test_missing_url_is_the_only_failure() {
        assert_eq!(parse_curl("curl -X POST -H 'A: b'").unwrap_err(), CurlError::MissingUrl);
        assert!(parse_curl("curl -X BREW http://h").is_ok());
    }

    #[test]
    fn test_line_continuations_and_escaped_double_quotes() {
        let curl = "curl -X POST \\\n  \"https://h/x\" \\\n  -d \"{\\\"a\\\": \\\"b\\\\nc\\\"}\"";
        let req = parse_curl(curl).unwrap();
        assert_eq!(req.url, "https://h/x");
        assert_eq!(req.body, RequestBody::json(r#"{"a": "b\nc"}"#));
    }

    #[test]
    fn test_to_curl_quotes_and_skips_disabled() {
        let mut req = Request::new(HttpMethod::POST, "https://h/x");
        req.headers.push(KeyValue::new("Accept", "application/json"));
        req.headers.push(KeyValue::disabled("X-Debug", "1"));
        req.params.push(KeyValue::new("page", "2"));
        req.body = RequestBody::json(r#"{"msg":"it's"}"#);

        let curl = to_curl(&req);
        assert!(curl.starts_with("curl -X POST \\\n  'https://h/x?page=2'"));
        assert!(curl.contains("-H 'Accept: application/json'"));
        assert!(!curl.contains("X-Debug"));
        assert!(curl.contains(r#"-d '{"msg":"it'\''s"}'"#));
    }

    #[test]
    fn test_to_curl_get_drops_body_and_renders_auth() {
        let mut req = Request::new(HttpMethod::GET, "https://h/x");
        req.body = RequestBody::json("{}");
        req.auth = Auth::Bearer { token: "t0k".into() };
        let curl = to_curl(&req);
        assert!(!curl.contains("-d"));
        assert!(curl.contains("-H 'Authorization: Bearer t0k'"));
    }

    #[test]
    fn test_form_bodies() {
        let mut req = Request::new(HttpMethod::POST, "https://h/form");
        req.body = RequestBody::UrlEncoded {
            fields: vec![KeyValue::new("a b", "c&d"), KeyValue::disabled("x", "y")],
        };
        assert!(to_curl(&req).contains("-d 'a+b=c%26d'"));

        req.body = RequestBody::FormData {
            fields: vec![KeyValue::new("f", "1"), KeyValue::new("g", "2")],
        };
        let curl = to_curl(&req);
        assert!(curl.contains("-F 'f=1'") && curl.contains("-F 'g=2'"));
    }

    #[test]
    fn test_round_trip_raw_json() {
        let mut req = Request::new(HttpMethod::PATCH, "https://api.example.com/items/7");
        req.headers.push(KeyValue::new("Content-Type", "application/json"));
        req.headers.push(KeyValue::new("X-Quote", "it's \"fine\""));
        req.headers.push(KeyValue::disabled("X-Off", "1"));
        req.body = RequestBody::json("{\n  \"name\": \"O'Brien\",\n  \"path\": \"C:\\\\tmp\"\n}");

        let back = parse_curl(&to_curl(&req)).unwrap();
        assert_eq!(back.method, req.method);
        assert_eq!(back.url, req.url);
        assert_eq!(enabled_headers(&back), enabled_headers(&req));
        assert_eq!(back.body, req.body);
    }

    #[test]
    fn test_round_trip_raw_keeps_format_without_content_type() {
        let mut req = Request::new(HttpMethod::POST, "https://h/notes");
        req.body = RequestBody::raw(RawFormat::Text, "a=1&b=2");
        let curl = to_curl(&req);
        assert!(curl.contains("-H 'Content-Type: text/plain'"));
        let back = parse_curl(&curl).unwrap();
        assert_eq!(back.body, req.body);
        assert_eq!(back.header("Content-Type"), Some("text/plain"));

        req.body = RequestBody::raw(RawFormat::Xml, "<note id=\"1\"/>");
        let back = parse_curl(&to_curl(&req)).unwrap();
        assert_eq!(back.body, req.body);
        assert_eq!(back.header("Content-Type"), Some("application/xml"));
    }
}
