// Upstream client - executes forwarded calls on behalf of a session
//
// One pooled reqwest client is shared across all sessions; session isolation
// is enforced at the header/cookie merge step, never by connection-level
// state (the pool carries no cookie store and no per-session defaults).

use std::collections::HashMap;
use std::time::Instant;

use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, COOKIE, USER_AGENT};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;

use crate::proxy::error::ProxyError;
use crate::proxy::session::{ForwardContext, SessionRegistry};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// Probe target for the connectivity check
const CONNECTIVITY_PROBE_URL: &str = "https://www.google.com";
const CONNECTIVITY_PROBE_TIMEOUT_SECS: u64 = 5;

const MIN_CALL_TIMEOUT_SECS: u64 = 1;
const MAX_CALL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Request body: either a form-encoded map or a raw string passed through
/// untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RequestBody {
    Form(HashMap<String, String>),
    Raw(String),
}

/// One forwarded call, as decoded from the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardPayload {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Query string parameters
    #[serde(default)]
    pub params: Option<HashMap<String, String>>,

    /// Form data or raw body
    #[serde(default)]
    pub data: Option<RequestBody>,

    /// JSON body (mutually exclusive with `data`)
    #[serde(default)]
    pub json_data: Option<Value>,

    /// Per-call headers; override session headers for this call only
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,

    /// Per-call cookies; persisted into the session jar before the call
    #[serde(default)]
    pub cookies: Option<HashMap<String, String>>,

    /// Timeout in seconds (1-300)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_allow_redirects")]
    pub allow_redirects: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_allow_redirects() -> bool {
    true
}

impl ForwardPayload {
    /// Validate url/method/timeout before any network call.
    pub fn validate(&self) -> Result<(Method, url::Url), ProxyError> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(ProxyError::InvalidRequest(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        let url = url::Url::parse(&self.url)
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid URL: {}", e)))?;

        let method_upper = self.method.to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method_upper.as_str()) {
            return Err(ProxyError::InvalidRequest(format!(
                "Invalid HTTP method. Must be one of: {}",
                ALLOWED_METHODS.join(", ")
            )));
        }
        let method = Method::from_bytes(method_upper.as_bytes())
            .map_err(|_| ProxyError::InvalidRequest("Invalid HTTP method".to_string()))?;

        if self.timeout < MIN_CALL_TIMEOUT_SECS || self.timeout > MAX_CALL_TIMEOUT_SECS {
            return Err(ProxyError::InvalidRequest(format!(
                "Timeout must be between {} and {} seconds",
                MIN_CALL_TIMEOUT_SECS, MAX_CALL_TIMEOUT_SECS
            )));
        }

        if self.data.is_some() && self.json_data.is_some() {
            return Err(ProxyError::InvalidRequest(
                "Provide either data or json_data, not both".to_string(),
            ));
        }

        Ok((method, url))
    }
}

/// Buffered reply for `/forward`.
#[derive(Debug, Serialize)]
pub struct ForwardReply {
    pub status: String,
    pub status_code: u16,
    pub ok: bool,
    pub headers: HashMap<String, String>,
    /// Cookies set by this response
    pub cookies: HashMap<String, String>,
    /// Session jar after applying this response
    pub session_cookies: HashMap<String, String>,
    pub url: String,
    pub elapsed: f64,
    pub content_type: String,
    pub body: Value,
    /// "json", "text" or "base64"
    pub body_encoding: &'static str,
    pub request_info: RequestInfo,
}

#[derive(Debug, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub original_url: String,
    pub final_url: String,
    pub response_size_bytes: usize,
}

/// Streamed reply for `/download`. The body is handed back as the raw
/// reqwest response so the caller can relay it without buffering.
pub struct DownloadReply {
    pub status_code: u16,
    pub content_type: String,
    pub filename: String,
    pub response: reqwest::Response,
}

#[derive(Debug, Serialize)]
pub struct ConnectivityReport {
    pub reachable: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
}

pub struct UpstreamClient {
    /// (verify_ssl, follow_redirects) -> prebuilt client. Redirect policy and
    /// certificate verification are client-level in reqwest, so all four
    /// combinations are built up front and picked per call.
    verified: Client,
    verified_no_redirect: Client,
    insecure: Client,
    insecure_no_redirect: Client,
    user_agent: String,
}

impl UpstreamClient {
    pub fn new(user_agent: String, request_timeout: u64) -> Result<Self, String> {
        let build = |verify: bool, redirects: bool| -> Result<Client, String> {
            let mut builder = Client::builder()
                // Connection settings (optimize connection reuse, reduce overhead)
                .connect_timeout(Duration::from_secs(20))
                .pool_max_idle_per_host(16)
                .pool_idle_timeout(Duration::from_secs(90))
                .tcp_keepalive(Duration::from_secs(60))
                .timeout(Duration::from_secs(request_timeout));

            if !verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if !redirects {
                builder = builder.redirect(reqwest::redirect::Policy::none());
            }

            builder
                .build()
                .map_err(|e| format!("Failed to create HTTP client: {}", e))
        };

        Ok(Self {
            verified: build(true, true)?,
            verified_no_redirect: build(true, false)?,
            insecure: build(false, true)?,
            insecure_no_redirect: build(false, false)?,
            user_agent,
        })
    }

    fn select_client(&self, verify_ssl: bool, allow_redirects: bool) -> &Client {
        match (verify_ssl, allow_redirects) {
            (true, true) => &self.verified,
            (true, false) => &self.verified_no_redirect,
            (false, true) => &self.insecure,
            (false, false) => &self.insecure_no_redirect,
        }
    }

    /// Execute one buffered upstream call for a session.
    ///
    /// Fails with SessionNotFound / InvalidRequest before any network I/O;
    /// connectivity-level faults become UpstreamUnreachable with no cookie
    /// mutation. Non-2xx upstream statuses are returned as-is.
    pub async fn forward(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        payload: &ForwardPayload,
    ) -> Result<ForwardReply, ProxyError> {
        let (method, url) = payload.validate()?;
        let ctx = registry
            .forward_context(session_id, payload.cookies.as_ref())
            .await?;

        let started = Instant::now();
        let response = self.execute(&ctx, method.clone(), &url, payload, started).await?;

        let status = response.status();
        let final_url = response.url().to_string();
        let response_headers = header_map_to_pairs(response.headers());
        let set_cookies = extract_set_cookies(response.headers());

        let session_cookies = match registry.apply_response_cookies(session_id, &set_cookies).await
        {
            Ok(jar) => jar,
            // Session swept while the call was in flight; the upstream call
            // itself still succeeded, so reply with what this response set.
            Err(ProxyError::SessionNotFound) => {
                tracing::debug!(
                    "Session {} vanished mid-forward; cookie update skipped",
                    session_id
                );
                set_cookies.iter().cloned().collect()
            }
            Err(e) => return Err(e),
        };

        let content_type = response_headers
            .get("content-type")
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable {
                detail: format!("Error reading response body from {}: {}", payload.url, e),
                timed_out: e.is_timeout(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?;
        let elapsed = started.elapsed();

        let (body, body_encoding) = decode_body(&content_type, &bytes);

        Ok(ForwardReply {
            status: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            status_code: status.as_u16(),
            ok: status.is_success(),
            headers: response_headers,
            cookies: set_cookies.into_iter().collect(),
            session_cookies,
            url: final_url.clone(),
            elapsed: (elapsed.as_millis() as f64) / 1000.0,
            content_type,
            body,
            body_encoding,
            request_info: RequestInfo {
                method: method.to_string(),
                original_url: payload.url.clone(),
                final_url,
                response_size_bytes: bytes.len(),
            },
        })
    }

    /// Execute one streamed upstream call for a session. Session cookies are
    /// updated from the response headers before the body is relayed.
    pub async fn download(
        &self,
        registry: &SessionRegistry,
        session_id: &str,
        payload: &ForwardPayload,
    ) -> Result<DownloadReply, ProxyError> {
        let (method, url) = payload.validate()?;
        let ctx = registry
            .forward_context(session_id, payload.cookies.as_ref())
            .await?;

        let started = Instant::now();
        let response = self.execute(&ctx, method, &url, payload, started).await?;

        let set_cookies = extract_set_cookies(response.headers());
        if let Err(ProxyError::SessionNotFound) = registry
            .apply_response_cookies(session_id, &set_cookies)
            .await
        {
            tracing::debug!(
                "Session {} vanished mid-download; cookie update skipped",
                session_id
            );
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_filename)
            .unwrap_or_else(|| "downloaded_file".to_string());

        Ok(DownloadReply {
            status_code: response.status().as_u16(),
            content_type,
            filename,
            response,
        })
    }

    async fn execute(
        &self,
        ctx: &ForwardContext,
        method: Method,
        url: &url::Url,
        payload: &ForwardPayload,
        started: Instant,
    ) -> Result<reqwest::Response, ProxyError> {
        let headers =
            merge_request_headers(&self.user_agent, &ctx.headers, payload.headers.as_ref())?;

        let client = self.select_client(ctx.verify_ssl, payload.allow_redirects);
        let mut request = client
            .request(method, url.clone())
            .headers(headers)
            .timeout(Duration::from_secs(payload.timeout));

        if !ctx.cookies.is_empty() {
            // Session isolation lives here: the cookie jar is attached
            // explicitly per call, never via client state.
            request = request.header(
                COOKIE,
                HeaderValue::from_str(&cookie_header(&ctx.cookies)).map_err(|_| {
                    ProxyError::InvalidRequest("Session cookies contain invalid characters".into())
                })?,
            );
        }

        if let Some(params) = &payload.params {
            request = request.query(params);
        }

        match (&payload.data, &payload.json_data) {
            (Some(RequestBody::Form(form)), _) => request = request.form(form),
            (Some(RequestBody::Raw(raw)), _) => request = request.body(raw.clone()),
            (None, Some(json)) => request = request.json(json),
            (None, None) => {}
        }

        request.send().await.map_err(|e| {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            if e.is_timeout() {
                ProxyError::UpstreamUnreachable {
                    detail: format!(
                        "Timeout while making request to {} after {}s",
                        payload.url, payload.timeout
                    ),
                    timed_out: true,
                    elapsed_ms,
                }
            } else {
                ProxyError::UpstreamUnreachable {
                    detail: format!("Connection error while forwarding request: {}", e),
                    timed_out: false,
                    elapsed_ms,
                }
            }
        })
    }

    /// Probe a well-known host to report whether outbound networking works.
    pub async fn check_connectivity(&self) -> ConnectivityReport {
        let started = Instant::now();
        let result = self
            .verified
            .get(CONNECTIVITY_PROBE_URL)
            .timeout(Duration::from_secs(CONNECTIVITY_PROBE_TIMEOUT_SECS))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => ConnectivityReport {
                reachable: true,
                detail: "Internet connection available".to_string(),
                response_time_ms: Some((started.elapsed().as_micros() as f64) / 1000.0),
            },
            Ok(resp) => ConnectivityReport {
                reachable: false,
                detail: format!("Unexpected response from probe: HTTP {}", resp.status()),
                response_time_ms: None,
            },
            Err(e) if e.is_timeout() => ConnectivityReport {
                reachable: false,
                detail: "Timeout connecting to probe host".to_string(),
                response_time_ms: None,
            },
            Err(_) => ConnectivityReport {
                reachable: false,
                detail: "Connection error - Check network configuration".to_string(),
                response_time_ms: None,
            },
        }
    }
}

/// Merge precedence (later wins): baseline user-agent if the session defines
/// none, then session headers, then per-call headers. Session cookies are
/// attached separately and are not overridable through headers.
pub fn merge_request_headers(
    default_user_agent: &str,
    session_headers: &HashMap<String, String>,
    call_headers: Option<&HashMap<String, String>>,
) -> Result<HeaderMap, ProxyError> {
    let mut merged = HeaderMap::new();
    merged.insert(
        USER_AGENT,
        HeaderValue::from_str(default_user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("session-proxy")),
    );

    let mut insert = |name: &str, value: &str| -> Result<(), ProxyError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::InvalidRequest(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ProxyError::InvalidRequest(format!("Invalid header value for {}", name)))?;
        merged.insert(name, value);
        Ok(())
    };

    for (name, value) in session_headers {
        insert(name, value)?;
    }
    if let Some(call) = call_headers {
        for (name, value) in call {
            insert(name, value)?;
        }
    }

    Ok(merged)
}

/// Assemble the Cookie request header from the session jar. Keys are sorted
/// so the output is deterministic.
pub fn cookie_header(cookies: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = cookies.keys().collect();
    names.sort();
    names
        .iter()
        .map(|name| format!("{}={}", name, cookies[*name]))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse one Set-Cookie header value into (name, value), ignoring attributes.
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let pair = raw.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn extract_set_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

fn header_map_to_pairs(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Decode a response body according to its declared content type:
/// JSON when declared JSON, UTF-8 text for text-like types, base64 otherwise.
pub fn decode_body(content_type: &str, bytes: &[u8]) -> (Value, &'static str) {
    let ct = content_type.to_ascii_lowercase();

    if ct.contains("json") {
        if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
            return (value, "json");
        }
    }

    let text_like = ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("xml")
        || ct.contains("html")
        || ct.contains("javascript")
        || ct.contains("x-www-form-urlencoded");

    if text_like {
        return (
            Value::String(String::from_utf8_lossy(bytes).into_owned()),
            "text",
        );
    }

    (
        Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
        "base64",
    )
}

/// Extract the filename from a Content-Disposition header value.
pub fn parse_filename(content_disposition: &str) -> Option<String> {
    let lower = content_disposition.to_ascii_lowercase();
    let idx = lower.find("filename=")?;
    let rest = &content_disposition[idx + "filename=".len()..];
    let rest = rest.split(';').next().unwrap_or(rest).trim();
    let name = rest.trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn payload(url: &str, method: &str) -> ForwardPayload {
        ForwardPayload {
            url: url.to_string(),
            method: method.to_string(),
            params: None,
            data: None,
            json_data: None,
            headers: None,
            cookies: None,
            timeout: 30,
            allow_redirects: true,
        }
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let p = payload("ftp://example.com/file", "GET");
        assert!(matches!(p.validate(), Err(ProxyError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_method() {
        let p = payload("https://example.com", "BREW");
        assert!(matches!(p.validate(), Err(ProxyError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_normalizes_method_case() {
        let p = payload("https://example.com", "post");
        let (method, _) = p.validate().unwrap();
        assert_eq!(method, Method::POST);
    }

    #[test]
    fn test_validate_rejects_out_of_range_timeout() {
        let mut p = payload("https://example.com", "GET");
        p.timeout = 0;
        assert!(matches!(p.validate(), Err(ProxyError::InvalidRequest(_))));
        p.timeout = 301;
        assert!(matches!(p.validate(), Err(ProxyError::InvalidRequest(_))));
    }

    #[test]
    fn test_validate_rejects_conflicting_bodies() {
        let mut p = payload("https://example.com", "POST");
        p.data = Some(RequestBody::Raw("a=b".into()));
        p.json_data = Some(serde_json::json!({"a": "b"}));
        assert!(matches!(p.validate(), Err(ProxyError::InvalidRequest(_))));
    }

    #[test]
    fn test_merge_default_user_agent_applies_when_session_has_none() {
        let merged = merge_request_headers("session-proxy/0.3", &map(&[]), None).unwrap();
        assert_eq!(merged.get(USER_AGENT).unwrap(), "session-proxy/0.3");
    }

    #[test]
    fn test_merge_session_user_agent_wins_over_default() {
        let session = map(&[("user-agent", "custom-agent/1.0")]);
        let merged = merge_request_headers("session-proxy/0.3", &session, None).unwrap();
        assert_eq!(merged.get(USER_AGENT).unwrap(), "custom-agent/1.0");
    }

    #[test]
    fn test_merge_call_headers_win_over_session() {
        let session = map(&[("authorization", "Bearer session"), ("accept", "text/html")]);
        let call = map(&[("Authorization", "Bearer call")]);
        let merged = merge_request_headers("ua", &session, Some(&call)).unwrap();
        assert_eq!(merged.get("authorization").unwrap(), "Bearer call");
        assert_eq!(merged.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_merge_rejects_invalid_header_name() {
        let session = map(&[("bad header", "v")]);
        assert!(matches!(
            merge_request_headers("ua", &session, None),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_cookie_header_is_sorted_and_joined() {
        let jar = map(&[("b", "2"), ("a", "1")]);
        assert_eq!(cookie_header(&jar), "a=1; b=2");
    }

    #[test]
    fn test_parse_set_cookie_strips_attributes() {
        assert_eq!(
            parse_set_cookie("foo=bar; Path=/; HttpOnly; Secure"),
            Some(("foo".to_string(), "bar".to_string()))
        );
        assert_eq!(
            parse_set_cookie("token=abc123"),
            Some(("token".to_string(), "abc123".to_string()))
        );
        assert_eq!(parse_set_cookie("=orphan; Path=/"), None);
        assert_eq!(parse_set_cookie("no-equals-sign"), None);
    }

    #[test]
    fn test_decode_body_json() {
        let (value, encoding) = decode_body("application/json; charset=utf-8", b"{\"k\":1}");
        assert_eq!(encoding, "json");
        assert_eq!(value["k"], 1);
    }

    #[test]
    fn test_decode_body_invalid_json_falls_back_to_text() {
        let (value, encoding) = decode_body("application/json", b"not json");
        assert_eq!(encoding, "text");
        assert_eq!(value, Value::String("not json".to_string()));
    }

    #[test]
    fn test_decode_body_text() {
        let (value, encoding) = decode_body("text/html", b"<html></html>");
        assert_eq!(encoding, "text");
        assert_eq!(value, Value::String("<html></html>".to_string()));
    }

    #[test]
    fn test_decode_body_binary_is_base64() {
        let (value, encoding) = decode_body("application/octet-stream", &[0x00, 0xff, 0x10]);
        assert_eq!(encoding, "base64");
        assert_eq!(value, Value::String("AP8Q".to_string()));
    }

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("attachment; filename=\"report.pdf\""),
            Some("report.pdf".to_string())
        );
        assert_eq!(
            parse_filename("attachment; filename=data.csv; size=12"),
            Some("data.csv".to_string())
        );
        assert_eq!(parse_filename("inline"), None);
    }

    #[test]
    fn test_payload_defaults_from_wire() {
        let p: ForwardPayload =
            serde_json::from_str(r#"{"url": "https://example.com"}"#).unwrap();
        assert_eq!(p.method, "GET");
        assert_eq!(p.timeout, 30);
        assert!(p.allow_redirects);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_request_body_deserializes_form_and_raw() {
        let p: ForwardPayload = serde_json::from_str(
            r#"{"url": "https://example.com", "data": {"user": "u", "pass": "p"}}"#,
        )
        .unwrap();
        assert!(matches!(p.data, Some(RequestBody::Form(_))));

        let p: ForwardPayload = serde_json::from_str(
            r#"{"url": "https://example.com", "data": "raw-body"}"#,
        )
        .unwrap();
        assert!(matches!(p.data, Some(RequestBody::Raw(_))));
    }
}
