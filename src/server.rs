//! Envoy ext-authz gRPC server
//!
//! Implements the Envoy external authorization service. Each `Check` call
//! runs the full decision pipeline: credential extraction, verification,
//! revocation lookup, and response construction. Every outcome, including
//! internal faults, is encoded inside a protocol-success `CheckResponse`,
//! because a transport-level error could make a fail-open data plane let
//! the request through.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use envoy_types::ext_authz::v3::pb::{
    Authorization, AuthorizationServer, CheckRequest, CheckResponse,
};
use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::auth::v3::attribute_context::HttpRequest;
use envoy_types::pb::envoy::service::auth::v3::check_response::HttpResponse;
use envoy_types::pb::envoy::service::auth::v3::{DeniedHttpResponse, OkHttpResponse};
use envoy_types::pb::google::rpc;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::field::Empty;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{AuthzError, Result};
use crate::jwt::TokenVerifier;
use crate::mask;
use crate::metrics;
use crate::store::RevocationStore;

/// Header carrying the bearer credential (lowercased by the data plane)
pub const HEADER_AUTHORIZATION: &str = "authorization";
/// Header carrying the request origin for CORS handling
pub const HEADER_ORIGIN: &str = "origin";
/// Injected header carrying the authenticated subject
pub const HEADER_USER_ID: &str = "x-user-id";
/// Injected header carrying the identity-provider label
pub const HEADER_AUTH_PROVIDER: &str = "x-auth-provider";

/// Stable decision reason labels, used in metrics and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Request allowed with a valid credential
    Success,
    /// CORS preflight allowed without credential checks
    CorsPreflight,
    /// Request lacked the attributes/headers structure
    MalformedRequest,
    /// No authorization header present
    MissingHeader,
    /// Credential failed verification
    InvalidToken,
    /// Credential identifier found in the revocation set
    Revoked,
    /// Revocation lookup failed; denied fail-closed
    RevocationError,
}

impl DecisionReason {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::CorsPreflight => "cors_preflight",
            Self::MalformedRequest => "malformed_request",
            Self::MissingHeader => "missing_header",
            Self::InvalidToken => "invalid_token",
            Self::Revoked => "revoked",
            Self::RevocationError => "revocation_error",
        }
    }
}

/// Outcome of the decision pipeline for a single request
#[derive(Debug)]
enum Decision {
    /// Permit the request. Enriched headers are injected only when a
    /// credential was actually verified (not for CORS preflights).
    Allow {
        user_id: Option<String>,
        provider: Option<String>,
        reason: DecisionReason,
    },
    /// Reject the request with the given inner HTTP status
    Deny {
        status: StatusCode,
        body: &'static str,
        reason: DecisionReason,
    },
}

impl Decision {
    fn deny(status: StatusCode, body: &'static str, reason: DecisionReason) -> Self {
        Self::Deny {
            status,
            body,
            reason,
        }
    }

    fn result_label(&self) -> &'static str {
        match self {
            Self::Allow { .. } => metrics::RESULT_ALLOW,
            Self::Deny { .. } => metrics::RESULT_DENY,
        }
    }

    fn reason(&self) -> DecisionReason {
        match self {
            Self::Allow { reason, .. } | Self::Deny { reason, .. } => *reason,
        }
    }
}

/// Distributed trace identifiers attached to a request
#[derive(Debug, Clone, Default)]
pub struct TraceContext {
    /// Trace id from W3C `traceparent` or B3 headers
    pub trace_id: Option<String>,
    /// Parent span id, when present
    pub span_id: Option<String>,
}

impl TraceContext {
    /// Extract trace identifiers from gRPC call metadata
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let mut ctx = Self::default();
        if let Some(tp) = metadata.get("traceparent").and_then(|v| v.to_str().ok()) {
            if let Some((trace_id, span_id)) = parse_traceparent(tp) {
                ctx.trace_id = Some(trace_id);
                ctx.span_id = Some(span_id);
                return ctx;
            }
        }
        ctx.trace_id = metadata
            .get("x-b3-traceid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        ctx.span_id = metadata
            .get("x-b3-spanid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        ctx
    }

    /// Fill missing identifiers from the request's own header map; the
    /// data plane may carry them in either location.
    pub fn merge_http_headers(mut self, headers: Option<&HashMap<String, String>>) -> Self {
        let Some(headers) = headers else {
            return self;
        };
        if self.trace_id.is_none() {
            if let Some((trace_id, span_id)) =
                headers.get("traceparent").and_then(|v| parse_traceparent(v))
            {
                self.trace_id = Some(trace_id);
                self.span_id = Some(span_id);
                return self;
            }
        }
        if self.trace_id.is_none() {
            self.trace_id = headers.get("x-b3-traceid").cloned();
            self.span_id = headers.get("x-b3-spanid").cloned();
        }
        self
    }
}

/// Parse a W3C traceparent header into (trace_id, span_id)
fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let mut parts = value.split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    parts.next()?; // trace flags

    let is_hex = |s: &str| s.bytes().all(|b| b.is_ascii_hexdigit());
    if version.len() != 2 || trace_id.len() != 32 || span_id.len() != 16 {
        return None;
    }
    if !is_hex(trace_id) || !is_hex(span_id) {
        return None;
    }
    Some((trace_id.to_string(), span_id.to_string()))
}

/// ext-authz gRPC service
pub struct AuthzService {
    verifier: Arc<TokenVerifier>,
    store: Arc<dyn RevocationStore>,
    allowed_origins: HashSet<String>,
}

impl AuthzService {
    /// Create the service from its immutable dependencies
    pub fn new(
        verifier: Arc<TokenVerifier>,
        store: Arc<dyn RevocationStore>,
        allowed_origins: HashSet<String>,
    ) -> Self {
        Self {
            verifier,
            store,
            allowed_origins,
        }
    }

    /// Run the decision pipeline, short-circuiting on the first failure
    ///
    /// Client-side outcomes (preflight, malformed request, missing or
    /// revoked credentials) are decisions; verification and lookup
    /// failures bubble as errors and are classified by the caller.
    async fn do_check(&self, check: &CheckRequest) -> Result<Decision> {
        let http = http_request(check);

        // CORS preflight never carries credentials; the upstream service
        // owns the actual CORS response.
        if http
            .map(|h| h.method.eq_ignore_ascii_case("OPTIONS"))
            .unwrap_or(false)
        {
            return Ok(Decision::Allow {
                user_id: None,
                provider: None,
                reason: DecisionReason::CorsPreflight,
            });
        }

        let Some(http) = http else {
            return Ok(Decision::deny(
                StatusCode::BadRequest,
                "Malformed request",
                DecisionReason::MalformedRequest,
            ));
        };

        let Some(raw_credential) = http
            .headers
            .get(HEADER_AUTHORIZATION)
            .filter(|v| !v.is_empty())
        else {
            return Ok(Decision::deny(
                StatusCode::Unauthorized,
                "Missing Authorization header",
                DecisionReason::MissingHeader,
            ));
        };

        let verify_started = Instant::now();
        let verified = self.verifier.verify(raw_credential);
        metrics::record_jwt_verify(verify_started.elapsed());
        let token = verified?;

        let user_id = token.subject().to_string();
        let jti = token.token_id();

        if !jti.is_empty() {
            let lookup_started = Instant::now();
            let revoked = self.store.is_revoked(jti).await;
            metrics::record_revocation_lookup(lookup_started.elapsed());

            if revoked? {
                metrics::record_revocation_hit();
                warn!(
                    user_id = %mask::mask_field("user_id", &user_id),
                    jti = %mask::mask_field("jti", jti),
                    "credential is revoked"
                );
                return Ok(Decision::deny(
                    StatusCode::Forbidden,
                    "Credential is revoked",
                    DecisionReason::Revoked,
                ));
            }
        }

        Ok(Decision::Allow {
            user_id: Some(user_id),
            provider: Some(token.provider().to_string()),
            reason: DecisionReason::Success,
        })
    }

    /// Convert a decision into the wire response, attaching CORS headers
    /// to denies whose `Origin` is in the allowed set
    fn build_response(&self, decision: &Decision, origin: Option<&str>) -> CheckResponse {
        match decision {
            Decision::Allow {
                user_id, provider, ..
            } => {
                let headers = match user_id {
                    Some(user_id) => vec![
                        header(HEADER_USER_ID, user_id),
                        header(HEADER_AUTH_PROVIDER, provider.as_deref().unwrap_or_default()),
                    ],
                    None => Vec::new(),
                };
                allow_response(headers)
            }
            Decision::Deny { status, body, .. } => {
                let cors_origin = origin.filter(|o| self.allowed_origins.contains(*o));
                deny_response(*status, body, cors_origin)
            }
        }
    }
}

#[tonic::async_trait]
impl Authorization for AuthzService {
    async fn check(
        &self,
        request: Request<CheckRequest>,
    ) -> std::result::Result<Response<CheckResponse>, Status> {
        let started = Instant::now();
        metrics::inflight_inc();

        let trace = TraceContext::from_metadata(request.metadata());
        let check = request.into_inner();
        let trace = trace.merge_http_headers(http_request(&check).map(|h| &h.headers));

        let (method, path, host) = request_info(&check);
        let span = info_span!(
            "Authorization.Check",
            http.method = %method,
            http.path = %path,
            http.host = %host,
            trace_id = %trace.trace_id.as_deref().unwrap_or_default(),
            authz.result = Empty,
            authz.reason = Empty,
            user.id = Empty,
            otel.status_code = Empty,
        );

        let decision = match self.do_check(&check).instrument(span.clone()).await {
            Ok(decision) => decision,
            // Auth failures are the client's problem; anything else is an
            // infrastructure fault and denies fail-closed.
            Err(e) if e.is_auth_failure() => {
                span.in_scope(|| warn!(error = %e, "credential verification failed"));
                metrics::record_error(metrics::ERROR_JWT_VERIFY);
                Decision::deny(
                    StatusCode::Unauthorized,
                    "Invalid token",
                    DecisionReason::InvalidToken,
                )
            }
            Err(e) => {
                span.in_scope(|| error!(error = %e, "revocation lookup failed, denying fail-closed"));
                metrics::record_error(metrics::ERROR_REVOCATION);
                Decision::deny(
                    StatusCode::InternalServerError,
                    "Internal Authorization Error",
                    DecisionReason::RevocationError,
                )
            }
        };

        let result = decision.result_label();
        let reason = decision.reason();
        span.record("authz.result", result);
        span.record("authz.reason", reason.as_str());
        if let Decision::Allow {
            user_id: Some(user_id),
            ..
        } = &decision
        {
            span.record("user.id", mask::mask_field("user_id", user_id).as_str());
        }
        if reason == DecisionReason::RevocationError {
            span.record("otel.status_code", "ERROR");
        }

        let duration = started.elapsed();
        metrics::record_request(result, reason.as_str(), duration);
        metrics::inflight_dec();

        match &decision {
            Decision::Allow { user_id, .. } => {
                info!(
                    method = %method,
                    path = %path,
                    host = %host,
                    user_id = %user_id.as_deref().map(|u| mask::mask_field("user_id", u)).unwrap_or_default(),
                    reason = reason.as_str(),
                    duration_ms = duration.as_secs_f64() * 1000.0,
                    trace_id = %trace.trace_id.as_deref().unwrap_or_default(),
                    "authorization allowed"
                );
            }
            Decision::Deny { .. } => {
                warn!(
                    method = %method,
                    path = %path,
                    host = %host,
                    reason = reason.as_str(),
                    duration_ms = duration.as_secs_f64() * 1000.0,
                    trace_id = %trace.trace_id.as_deref().unwrap_or_default(),
                    "authorization denied"
                );
            }
        }

        let origin = http_request(&check).and_then(|h| h.headers.get(HEADER_ORIGIN));
        let response = self.build_response(&decision, origin.map(String::as_str));
        Ok(Response::new(response))
    }
}

/// ext-authz server handle
pub struct AuthzServer {
    service: AuthzService,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl AuthzServer {
    /// Create a server for the given service and address
    pub fn new(service: AuthzService, addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            service,
            addr,
            shutdown,
        }
    }

    /// Serve until the shutdown token fires, then drain gracefully
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.addr, "starting ext-authz gRPC server");

        tonic::transport::Server::builder()
            .add_service(AuthorizationServer::new(self.service))
            .serve_with_shutdown(self.addr, self.shutdown.cancelled_owned())
            .await
            .map_err(|e| AuthzError::transport(format!("gRPC server error: {e}")))
    }
}

/// The nested HTTP request attributes, if the data plane sent them
fn http_request(check: &CheckRequest) -> Option<&HttpRequest> {
    check.attributes.as_ref()?.request.as_ref()?.http.as_ref()
}

/// Extract method, path, and host for logging and span attributes
fn request_info(check: &CheckRequest) -> (String, String, String) {
    match http_request(check) {
        Some(http) => (http.method.clone(), http.path.clone(), http.host.clone()),
        None => (String::new(), String::new(), String::new()),
    }
}

fn header(key: &str, value: &str) -> HeaderValueOption {
    HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            value: value.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn allow_response(headers: Vec<HeaderValueOption>) -> CheckResponse {
    CheckResponse {
        status: Some(rpc::Status {
            code: tonic::Code::Ok as i32,
            ..Default::default()
        }),
        http_response: Some(HttpResponse::OkResponse(OkHttpResponse {
            headers,
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn deny_response(status: StatusCode, body: &str, cors_origin: Option<&str>) -> CheckResponse {
    let mut headers = Vec::new();
    if let Some(origin) = cors_origin {
        headers.push(header("access-control-allow-origin", origin));
        headers.push(header("access-control-allow-credentials", "true"));
    }

    CheckResponse {
        status: Some(rpc::Status {
            code: tonic::Code::PermissionDenied as i32,
            message: body.to_string(),
            ..Default::default()
        }),
        http_response: Some(HttpResponse::DeniedResponse(DeniedHttpResponse {
            status: Some(HttpStatus {
                code: status as i32,
            }),
            headers,
            body: body.to_string(),
        })),
        ..Default::default()
    }
}
