//! Injection Proxy (D): the TLS-intercepting `hudsucker` handler that binds
//! an inbound connection to a [`RunContext`] by its token, rewrites matching
//! requests with the run's credentials, and records every proxied request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::hyper::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use hudsucker::hyper::{Request, Response, StatusCode};
use hudsucker::hyper_util::client::legacy::Error as ClientError;
use hudsucker::{Body, HttpContext, HttpHandler, Proxy, RequestOrResponse};
use rustls::crypto::aws_lc_rs::default_provider;
use serde_json::json;

use super::registry::Registry;
use super::rewrite::PlaceholderRewriter;
use super::sigv4::{self, AwsCredentials, SignableRequest};
use crate::audit::AuditLog;
use crate::vault::{CredentialView, InjectScheme};

/// Header a client must present the run's injection token in.
pub const TOKEN_HEADER: &str = "proxy-authorization";

/// The per-run sink a proxied request is recorded to: one line per request
/// in `network/requests.jsonl`, and one audit entry per request.
pub struct RequestSink {
    jsonl: tokio::sync::Mutex<tokio::fs::File>,
    audit: Arc<AuditLog>,
}

impl RequestSink {
    /// Open (appending) the request-record sink at `jsonl_path`, writing
    /// mirrored entries to `audit`.
    pub async fn open(jsonl_path: &std::path::Path, audit: Arc<AuditLog>) -> crate::error::Result<Self> {
        if let Some(parent) = jsonl_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(jsonl_path)
            .await?;
        Ok(Self {
            jsonl: tokio::sync::Mutex::new(file),
            audit,
        })
    }

    /// Append `record` to both the request log and the audit chain.
    pub async fn record(&self, record: serde_json::Value) {
        use tokio::io::AsyncWriteExt as _;
        let mut line = record.to_string();
        line.push('\n');
        {
            let mut file = self.jsonl.lock().await;
            let _ = file.write_all(line.as_bytes()).await;
        }
        let _ = self.audit.append("request", record).await;
    }
}

/// Runs the Injection Proxy's listener, dispatching every intercepted
/// connection to [`InjectionHandler`].
pub struct InjectionProxy {
    addr: SocketAddr,
    ca: RcgenAuthority,
    registry: Arc<Registry>,
}

impl InjectionProxy {
    /// Build a proxy bound to `addr` using `ca` for MITM leaf issuance and
    /// `registry` to resolve inbound tokens to run contexts.
    #[must_use]
    pub const fn new(addr: SocketAddr, ca: RcgenAuthority, registry: Arc<Registry>) -> Self {
        Self { addr, ca, registry }
    }

    /// Listen address.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the proxy until its task is aborted.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(addr = %self.addr, "injection proxy listening");

        let handler = InjectionHandler {
            registry: self.registry,
            connection_token: None,
            pending: None,
        };

        let proxy = Proxy::builder()
            .with_addr(self.addr)
            .with_ca(self.ca)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .build()?;
        proxy.start().await?;
        Ok(())
    }
}

/// State carried from `handle_request` to whichever of `handle_response` /
/// `handle_error` follows it on the same connection.
#[derive(Clone)]
struct PendingRequest {
    start_time: Instant,
    ts: DateTime<Utc>,
    run_id: String,
    method: String,
    host: String,
    path: String,
    bytes_in: u64,
    inject_provider: Option<String>,
    inject_scheme: Option<&'static str>,
    sink: Arc<RequestSink>,
}

/// The wire name for an [`InjectScheme`] variant, as recorded in request
/// records. Never includes the secret or format string.
#[must_use]
const fn scheme_name(scheme: &InjectScheme) -> &'static str {
    match scheme {
        InjectScheme::Header { .. } => "header",
        InjectScheme::BasicAuthWithToken => "basic_auth_with_token",
        InjectScheme::AwsSigV4 { .. } => "aws_sigv4",
        InjectScheme::BodyPlaceholder { .. } => "body_placeholder",
    }
}

/// One connection's handler. `hudsucker` clones this per accepted
/// connection and reuses the clone across every request/response pair on
/// that connection's keep-alive lifetime, which is what lets
/// `connection_token` persist once a request authenticates (the "connection
/// local map" the token lookup is specified against), and what lets
/// `pending` correlate one request with its eventual response or error.
#[derive(Clone)]
struct InjectionHandler {
    registry: Arc<Registry>,
    connection_token: Option<String>,
    pending: Option<PendingRequest>,
}

fn host_of(req: &Request<Body>) -> String {
    req.uri()
        .host()
        .map(String::from)
        .or_else(|| req.headers().get(HOST).and_then(|h| h.to_str().ok()).map(String::from))
        .unwrap_or_default()
}

fn build_response(status: StatusCode, reason: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("x-moat-proxy-error", reason)
        .body(Body::from(reason))
        .expect("static response is well-formed")
}

/// Extract the injection token from the `Proxy-Authorization: Bearer <tok>`
/// header, if present on this request.
fn extract_token(req: &Request<Body>) -> Option<String> {
    let value = req.headers().get(TOKEN_HEADER)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

fn apply_header(req: &mut Request<Body>, header: &'static str, format: &'static str, secret: &str) {
    let value = format.replacen("{}", secret, 1);
    if let (Ok(name), Ok(val)) = (
        hudsucker::hyper::header::HeaderName::try_from(header),
        value.parse(),
    ) {
        req.headers_mut().insert(name, val);
    }
}

fn apply_basic_auth_with_token(req: &mut Request<Body>, secret: &str) {
    use base64::Engine as _;
    let raw = format!("x-access-token:{secret}");
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
    if let Ok(value) = format!("Basic {encoded}").parse() {
        req.headers_mut().insert(AUTHORIZATION, value);
    }
}

async fn apply_body_placeholder(req: &mut Request<Body>, placeholder: &'static str, secret: &str) {
    let body = std::mem::replace(req.body_mut(), Body::empty());
    let Ok(collected) = body.collect().await else {
        *req.body_mut() = Body::empty();
        return;
    };
    let bytes = collected.to_bytes();

    let mut rewriter = PlaceholderRewriter::new(placeholder, secret);
    let mut out = rewriter.feed(&bytes);
    out.extend(rewriter.finish());

    if rewriter.substitutions > 0 {
        req.headers_mut().insert(CONTENT_LENGTH, out.len().into());
    }
    *req.body_mut() = Body::from(out);
}

async fn apply_aws_sigv4(req: &mut Request<Body>, service: &'static str, secret: &str, host: &str) {
    // `secret` carries `access_key_id:secret_access_key[:session_token]`, the
    // shape an AWS grant's token field is stored in.
    let mut parts = secret.splitn(3, ':');
    let (Some(access_key_id), Some(secret_access_key)) = (parts.next(), parts.next()) else {
        return;
    };
    let session_token = parts.next().map(str::to_string);
    let region = host.split('.').rev().nth(2).unwrap_or("us-east-1").to_string();

    let body = std::mem::replace(req.body_mut(), Body::empty());
    let Ok(collected) = body.collect().await else {
        *req.body_mut() = Body::empty();
        return;
    };
    let bytes = collected.to_bytes();

    let signed = sigv4::sign(
        &SignableRequest {
            method: req.method().as_str(),
            path: req.uri().path(),
            query: req.uri().query().unwrap_or(""),
            host,
            region: &region,
            service,
            body: &bytes,
        },
        &AwsCredentials {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token,
        },
    );

    if let Ok(value) = signed.authorization.parse() {
        req.headers_mut().insert(AUTHORIZATION, value);
    }
    if let Ok(value) = signed.amz_date.parse() {
        req.headers_mut().insert("x-amz-date", value);
    }
    if let Ok(value) = signed.content_sha256.parse() {
        req.headers_mut().insert("x-amz-content-sha256", value);
    }
    if let Some(token) = signed.security_token {
        if let Ok(value) = token.parse() {
            req.headers_mut().insert("x-amz-security-token", value);
        }
    }
    *req.body_mut() = Body::from(bytes);
}

async fn inject(req: &mut Request<Body>, view: &CredentialView, host: &str) {
    for (name, value) in &view.aux_headers {
        if let (Ok(name), Ok(value)) = (hudsucker::hyper::header::HeaderName::try_from(name.as_str()), value.parse()) {
            req.headers_mut().insert(name, value);
        }
    }

    match view.inject {
        InjectScheme::Header { header, format } => apply_header(req, header, format, &view.secret),
        InjectScheme::BasicAuthWithToken => apply_basic_auth_with_token(req, &view.secret),
        InjectScheme::BodyPlaceholder { placeholder } => {
            apply_body_placeholder(req, placeholder, &view.secret).await;
        }
        InjectScheme::AwsSigV4 { service } => apply_aws_sigv4(req, service, &view.secret, host).await,
    }
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

impl HttpHandler for InjectionHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, mut req: Request<Body>) -> RequestOrResponse {
        if let Some(token) = extract_token(&req) {
            self.connection_token = Some(token);
        }
        let token = self.connection_token.clone();

        let start_time = Instant::now();
        let ts = Utc::now();
        let host = host_of(&req);
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let bytes_in = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        self.pending = None;
        req.headers_mut().remove(TOKEN_HEADER);

        let Some(token) = token else {
            return RequestOrResponse::Response(build_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "no injection token presented on this connection",
            ));
        };

        let Some(context) = self.registry.lookup(&token).await else {
            return RequestOrResponse::Response(build_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "injection token is unknown or has been revoked",
            ));
        };

        if !context.allows(&host) {
            if let Some(sink) = context.sink.clone() {
                record_denial(
                    &sink,
                    &context.run_id,
                    ts,
                    start_time,
                    &method,
                    &host,
                    &path,
                    bytes_in,
                    StatusCode::FORBIDDEN.as_u16(),
                )
                .await;
            }
            return RequestOrResponse::Response(build_response(
                StatusCode::FORBIDDEN,
                "host is not in this run's allow list",
            ));
        }

        // Recognized provider grant, but the vault had no credential view to
        // hand back at bind time (expired with no usable refresh, or never
        // granted). The host is reachable but cannot be injected for, so the
        // proxy answers 407 per request instead of forwarding un-injected or
        // refusing the host outright (S3).
        if context.match_host(&host).is_none() && context.is_unresolved(&host) {
            if let Some(sink) = context.sink.clone() {
                record_denial(
                    &sink,
                    &context.run_id,
                    ts,
                    start_time,
                    &method,
                    &host,
                    &path,
                    bytes_in,
                    StatusCode::PROXY_AUTHENTICATION_REQUIRED.as_u16(),
                )
                .await;
            }
            return RequestOrResponse::Response(build_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "no credential currently available for this host",
            ));
        }

        let (inject_provider, inject_scheme) = if let Some(view) = context.match_host(&host) {
            let scheme = scheme_name(&view.inject);
            inject(&mut req, view, &host).await;
            (Some(view.provider.clone()), Some(scheme))
        } else {
            (None, None)
        };

        if let Some(sink) = context.sink.clone() {
            let pending = PendingRequest {
                start_time,
                ts,
                run_id: context.run_id.clone(),
                method,
                host,
                path,
                bytes_in,
                inject_provider,
                inject_scheme,
                sink,
            };
            req.extensions_mut().insert(pending.clone());
            self.pending = Some(pending);
        }

        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, mut res: Response<Body>) -> Response<Body> {
        let pending = res.extensions_mut().remove::<PendingRequest>().or_else(|| self.pending.take());
        if let Some(pending) = pending {
            let status = res.status().as_u16();
            let bytes_out = res
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let duration_ms = u64::try_from(pending.start_time.elapsed().as_millis()).unwrap_or(u64::MAX);

            pending
                .sink
                .record(request_record(
                    &pending.run_id,
                    pending.ts,
                    &pending.method,
                    &pending.host,
                    &pending.path,
                    status,
                    duration_ms,
                    pending.bytes_in,
                    bytes_out,
                    pending.inject_provider.as_deref(),
                    pending.inject_scheme,
                ))
                .await;
        }
        res
    }

    async fn handle_error(&mut self, _ctx: &HttpContext, err: ClientError) -> Response<Body> {
        let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.take();
        tracing::warn!(seq, error = %err, "upstream connection failed");
        if let Some(pending) = pending {
            let duration_ms = u64::try_from(pending.start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
            pending
                .sink
                .record(request_record(
                    &pending.run_id,
                    pending.ts,
                    &pending.method,
                    &pending.host,
                    &pending.path,
                    0,
                    duration_ms,
                    pending.bytes_in,
                    0,
                    pending.inject_provider.as_deref(),
                    pending.inject_scheme,
                ))
                .await;
        }
        build_response(StatusCode::BAD_GATEWAY, "upstream unreachable")
    }
}

/// Record a request that was refused before any upstream byte was sent
/// (`403` host-denied, `407` recognized-but-unresolved-credential): zero
/// `bytes_out`, no injection fields, since nothing was forwarded.
async fn record_denial(
    sink: &RequestSink,
    run_id: &str,
    ts: DateTime<Utc>,
    start_time: Instant,
    method: &str,
    host: &str,
    path: &str,
    bytes_in: u64,
    status: u16,
) {
    let duration_ms = u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
    sink.record(request_record(run_id, ts, method, host, path, status, duration_ms, bytes_in, 0, None, None))
        .await;
}

/// Build the request-record JSON line for `network/requests.jsonl`.
#[must_use]
pub fn request_record(
    run_id: &str,
    ts: DateTime<Utc>,
    method: &str,
    host: &str,
    path: &str,
    status: u16,
    duration_ms: u64,
    bytes_in: u64,
    bytes_out: u64,
    inject_provider: Option<&str>,
    inject_scheme: Option<&str>,
) -> serde_json::Value {
    json!({
        "ts": ts.to_rfc3339(),
        "run_id": run_id,
        "method": method,
        "host": host,
        "path": path,
        "status": status,
        "duration_ms": duration_ms,
        "bytes_in": bytes_in,
        "bytes_out": bytes_out,
        "inject_scheme": inject_scheme,
        "inject_provider": inject_provider,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_header_strips_bearer_prefix() {
        let req = Request::builder()
            .uri("https://api.github.com/user")
            .header(TOKEN_HEADER, "Bearer abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req), Some("abc123".to_string()));
    }

    #[test]
    fn request_with_no_proxy_authorization_header_yields_no_token() {
        let req = Request::builder()
            .uri("https://api.github.com/user")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req), None);
    }

    #[test]
    fn request_record_carries_every_field_the_format_requires() {
        let record = request_record(
            "run-1",
            Utc::now(),
            "GET",
            "api.github.com",
            "/user",
            200,
            12,
            0,
            128,
            Some("github"),
            Some("header"),
        );
        assert_eq!(record["run_id"], "run-1");
        assert_eq!(record["status"], 200);
        assert_eq!(record["inject_provider"], "github");
        assert_eq!(record["inject_scheme"], "header");
    }
}
