//! Single chokepoint for every outbound call to a wrapped API.
//!
//! [`Dispatcher::execute`] gates the call on the quota tracker, attaches the
//! credential headers of the requested scheme, sends the request through a
//! [`Transport`], classifies the outcome and feeds quota headers back into
//! the tracker. Nothing is retried here.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reqwest::Method;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use thiserror::Error;

use crate::auth::{CredentialStore, Headers, Scheme};
use crate::clock::SharedClock;
use crate::error::{ErrorCode, ErrorInfo};
use crate::quota::{format_wait, Category, QuotaTracker};

/// Default outbound timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Outcome of one operation: a value or a reportable failure.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult<T> {
    /// Success.
    Ok(T),
    /// Failure, carried as data.
    Err(ErrorInfo),
}

impl<T> OperationResult<T> {
    /// Whether this is a success.
    pub fn is_ok(&self) -> bool {
        matches!(self, OperationResult::Ok(_))
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            OperationResult::Ok(_) => None,
            OperationResult::Err(e) => Some(e),
        }
    }

    /// Convert into a std result for `?`.
    pub fn into_result(self) -> Result<T, ErrorInfo> {
        match self {
            OperationResult::Ok(v) => Ok(v),
            OperationResult::Err(e) => Err(e),
        }
    }

    /// Map the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        match self {
            OperationResult::Ok(v) => OperationResult::Ok(f(v)),
            OperationResult::Err(e) => OperationResult::Err(e),
        }
    }
}

impl<T> From<Result<T, ErrorInfo>> for OperationResult<T> {
    fn from(result: Result<T, ErrorInfo>) -> Self {
        match result {
            Ok(v) => OperationResult::Ok(v),
            Err(e) => OperationResult::Err(e),
        }
    }
}

impl<T: Serialize> Serialize for OperationResult<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("OperationResult", 2)?;
        match self {
            OperationResult::Ok(value) => {
                state.serialize_field("ok", &true)?;
                state.serialize_field("value", value)?;
            }
            OperationResult::Err(error) => {
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", error)?;
            }
        }
        state.end()
    }
}

/// Logical endpoint of a wrapped API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTarget {
    /// Short name used in logs.
    pub name: &'static str,
    /// Base URL, without trailing slash.
    pub base_url: String,
}

impl ApiTarget {
    /// Create a target.
    pub fn new(name: &'static str, base_url: impl Into<String>) -> Self {
        Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// JSON document.
    Json(Value),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
}

/// One logical operation handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct Call {
    /// HTTP verb.
    pub method: Method,
    /// Path relative to the target base URL.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<Body>,
    /// Credential scheme to authenticate with.
    pub scheme: Scheme,
    /// Quota category to charge.
    pub category: Category,
}

impl Call {
    /// Start building a call.
    pub fn new(method: Method, path: impl Into<String>, scheme: Scheme, category: Category) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            scheme,
            category,
        }
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set a JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    /// Set a form body.
    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(pairs));
        self
    }
}

/// Fully resolved request as handed to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// HTTP verb.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Headers, credentials included.
    pub headers: Headers,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Optional body.
    pub body: Option<Body>,
}

/// Raw response from a transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Headers with lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Body text.
    pub body: String,
}

impl HttpResponse {
    /// Response with a status and body.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Transport-level failure (connect, timeout, body read).
#[derive(Error, Debug)]
#[error("{message}")]
pub struct TransportError {
    /// Description.
    pub message: String,
    /// Whether the call hit the timeout.
    pub timed_out: bool,
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self {
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

/// Sends resolved requests over the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport whose every call carries `timeout`.
    pub fn new(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match request.body {
            Some(Body::Json(value)) => builder.json(&value),
            Some(Body::Form(pairs)) => builder.form(&pairs),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Transport double that replays scripted responses and records requests.
///
/// Test seam: hand it to [`Dispatcher::new`] or
/// [`Config::build_client_with`](crate::config::Config::build_client_with)
/// to drive the whole stack without a network. Responses are served in push
/// order; once the script runs out every call fails as a transport error.
/// Not meant for production use.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    /// Empty script; every call fails as a transport error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response.
    pub fn push(&self, response: HttpResponse) -> &Self {
        self.responses.lock().push_back(Ok(response));
        self
    }

    /// Queue a transport failure.
    pub fn push_error(&self, message: &str, timed_out: bool) -> &Self {
        self.responses.lock().push_back(Err(TransportError {
            message: message.into(),
            timed_out,
        }));
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request);
        self.responses.lock().pop_front().unwrap_or_else(|| {
            Err(TransportError {
                message: "no scripted response".into(),
                timed_out: false,
            })
        })
    }
}

/// Quota values reported by upstream headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportedQuota {
    /// Remaining calls.
    pub remaining: Option<u32>,
    /// When the window resets.
    pub reset_at: Option<DateTime<Utc>>,
    /// Calls per window.
    pub capacity: Option<u32>,
}

impl ReportedQuota {
    fn is_empty(&self) -> bool {
        *self == ReportedQuota::default()
    }
}

/// Extract quota values from response headers.
///
/// Understands the `x-ratelimit-{remaining,limit,reset}` trio, where a reset
/// below 1e9 is a delta in seconds and anything larger an epoch timestamp,
/// and Graph's `x-app-usage` JSON whose `call_count` is a percentage of
/// `capacity`.
pub fn parse_quota_headers(
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
    capacity: Option<u32>,
) -> ReportedQuota {
    let number = |name: &str| headers.get(name).and_then(|v| v.trim().parse::<u64>().ok());

    let mut reported = ReportedQuota {
        remaining: number("x-ratelimit-remaining").map(clamp_u32),
        capacity: number("x-ratelimit-limit").map(clamp_u32),
        reset_at: number("x-ratelimit-reset").and_then(|reset| {
            if reset >= 1_000_000_000 {
                Utc.timestamp_opt(i64::try_from(reset).ok()?, 0).single()
            } else {
                Some(now + chrono::Duration::seconds(reset as i64))
            }
        }),
    };

    if reported.remaining.is_none() {
        let usage = headers
            .get("x-app-usage")
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|usage| usage.get("call_count").and_then(Value::as_f64));
        let capacity = reported.capacity.or(capacity);
        if let (Some(percent), Some(capacity)) = (usage, capacity) {
            let left = (100.0 - percent.clamp(0.0, 100.0)) / 100.0;
            reported.remaining = Some((f64::from(capacity) * left).floor() as u32);
        }
    }

    reported
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Pull a structured upstream error out of a payload.
///
/// Graph reports `{"error":{"message","type","code"}}`; the Private API
/// reports `{"status":"fail","message"}`.
pub fn upstream_error(payload: &Value) -> Option<(String, Option<String>)> {
    if let Some(error) = payload.get("error").filter(|e| e.is_object()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string();
        let code = error.get("code").map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        return Some((message, code));
    }
    if payload.get("status").and_then(Value::as_str) == Some("fail") {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        let code = payload
            .get("error_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Some((message, code));
    }
    None
}

/// Map a raw response onto an operation result.
pub fn classify(response: &HttpResponse, scheme: Scheme) -> OperationResult<Value> {
    let status = response.status;
    let payload: Option<Value> = serde_json::from_str(&response.body).ok();
    let upstream = payload.as_ref().and_then(upstream_error);

    if status == 429 {
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let wait = retry_after
            .map(|s| format!(", retry after {}", format_wait(Duration::from_secs(s))))
            .unwrap_or_default();
        return OperationResult::Err(
            ErrorInfo::new(
                ErrorCode::RateLimitExceeded,
                format!("upstream rate limit exceeded{}", wait),
            )
            .with_status(status)
            .with_scheme(scheme)
            .with_retry_after(retry_after),
        );
    }

    if status == 401 || status == 403 {
        let message = upstream
            .map(|(m, _)| m)
            .unwrap_or_else(|| "authentication rejected".into());
        return OperationResult::Err(
            ErrorInfo::new(ErrorCode::AuthError, message)
                .with_status(status)
                .with_scheme(scheme),
        );
    }

    if let Some((message, code)) = upstream {
        let mut info = ErrorInfo::new(ErrorCode::ApiError, message)
            .with_status(status)
            .with_scheme(scheme);
        if let Some(code) = code {
            info = info.with_upstream_code(code);
        }
        return OperationResult::Err(info);
    }

    if !(200..300).contains(&status) {
        return OperationResult::Err(
            ErrorInfo::new(
                ErrorCode::RequestFailed,
                format!("request failed with HTTP {}", status),
            )
            .with_status(status)
            .with_scheme(scheme),
        );
    }

    if status == 204 || response.body.trim().is_empty() {
        return OperationResult::Ok(json!({ "success": true }));
    }

    OperationResult::Ok(payload.unwrap_or_else(|| Value::String(response.body.clone())))
}

/// Composes the credential store, quota tracker and transport.
pub struct Dispatcher {
    credentials: Arc<CredentialStore>,
    quota: Arc<QuotaTracker>,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        credentials: Arc<CredentialStore>,
        quota: Arc<QuotaTracker>,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Self {
        Self {
            credentials,
            quota,
            transport,
            clock,
        }
    }

    /// Credential store used for header lookup.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Quota tracker gating every call.
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Run one call against `target`.
    pub async fn execute(&self, target: &ApiTarget, call: Call) -> OperationResult<Value> {
        let Call {
            method,
            path,
            query,
            body,
            scheme,
            category,
        } = call;

        if let Err(e) = self.quota.check(&category) {
            return OperationResult::Err(e);
        }

        let headers = match self.credentials.headers_for(scheme) {
            Ok(headers) => headers,
            Err(e) => return OperationResult::Err(e),
        };

        tracing::debug!(
            %method,
            api = target.name,
            %path,
            %scheme,
            %category,
            "Dispatching request"
        );

        let request = HttpRequest {
            method,
            url: target.url(&path),
            headers,
            query,
            body,
        };

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.timed_out {
                    format!("request to {} timed out", target.name)
                } else {
                    format!("request to {} failed: {}", target.name, e)
                };
                tracing::warn!(api = target.name, %path, "{}", message);
                return OperationResult::Err(
                    ErrorInfo::new(ErrorCode::RequestFailed, message).with_scheme(scheme),
                );
            }
        };

        let result = classify(&response, scheme);
        if let OperationResult::Err(e) = &result {
            tracing::debug!(status = response.status, code = %e.code, "Request failed");
            return result;
        }

        self.quota.consume(&category);
        let capacity = self.quota.bucket(&category).map(|b| b.capacity);
        let reported = parse_quota_headers(&response.headers, self.clock.now(), capacity);
        if !reported.is_empty() {
            self.quota.resync_from_server(
                &category,
                reported.remaining,
                reported.reset_at,
                reported.capacity,
            );
        }

        result
    }
}
