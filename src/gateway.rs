//! HTTP/JSON gateway plumbing.
//!
//! Header matchers decide which HTTP headers become gRPC metadata and back.
//! Both idempotency headers cross the boundary under their own names so that
//! clients of the HTTP surface and gRPC clients share one key contract.

use crate::idempotency::key::{KEY_METADATA, X_KEY_METADATA};
use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use http::request::Parts;
use http::{HeaderMap, HeaderName, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};
use tower_http::propagate_header::PropagateHeaderLayer;

/// Prefix for HTTP headers carrying arbitrary gRPC metadata.
pub const METADATA_HEADER_PREFIX: &str = "grpc-metadata-";
/// Prefix given to standard HTTP headers when forwarded as metadata.
pub const PERMANENT_HEADER_PREFIX: &str = "grpcgateway-";

const PERMANENT_HEADERS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-language",
    "accept-ranges",
    "authorization",
    "cache-control",
    "content-type",
    "cookie",
    "date",
    "expect",
    "from",
    "host",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-schedule-tag-match",
    "if-unmodified-since",
    "max-forwards",
    "origin",
    "pragma",
    "referer",
    "user-agent",
    "via",
    "warning",
];

fn is_idempotency_header(name: &str) -> bool {
    name.eq_ignore_ascii_case(KEY_METADATA) || name.eq_ignore_ascii_case(X_KEY_METADATA)
}

/// Maps an inbound HTTP header name to a metadata key, or `None` to drop it.
pub fn incoming_header_matcher(name: &str) -> Option<String> {
    let lower = name.to_ascii_lowercase();
    if is_idempotency_header(&lower) {
        return Some(lower);
    }
    if PERMANENT_HEADERS.contains(&lower.as_str()) {
        return Some(format!("{}{}", PERMANENT_HEADER_PREFIX, lower));
    }
    lower
        .strip_prefix(METADATA_HEADER_PREFIX)
        .filter(|rest| !rest.is_empty())
        .map(str::to_string)
}

/// Maps an outbound metadata key to an HTTP header name.
pub fn outgoing_header_matcher(key: &str) -> Option<String> {
    let lower = key.to_ascii_lowercase();
    if is_idempotency_header(&lower) {
        return Some(lower);
    }
    Some(format!("{}{}", METADATA_HEADER_PREFIX, lower))
}

fn remap(headers: &HeaderMap, matcher: fn(&str) -> Option<String>) -> HeaderMap {
    let mut mapped = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let Some(target) = matcher(name.as_str()) else {
            continue;
        };
        match HeaderName::from_bytes(target.as_bytes()) {
            Ok(target) => {
                mapped.append(target, value.clone());
            }
            Err(_) => tracing::trace!(header = %name, "Dropping header with unmappable name"),
        }
    }
    mapped
}

/// Builds call metadata from inbound HTTP headers.
pub fn headers_to_metadata(headers: &HeaderMap) -> MetadataMap {
    MetadataMap::from_headers(remap(headers, incoming_header_matcher))
}

/// Builds HTTP headers from outbound call metadata.
pub fn metadata_to_headers(metadata: &MetadataMap) -> HeaderMap {
    remap(&metadata.clone().into_headers(), outgoing_header_matcher)
}

/// Axum extractor yielding the gRPC metadata for an HTTP request.
#[derive(Debug, Clone)]
pub struct GatewayMetadata(pub MetadataMap);

impl GatewayMetadata {
    pub fn into_inner(self) -> MetadataMap {
        self.0
    }

    /// Wraps `message` in a `tonic::Request` carrying this metadata.
    pub fn into_request<T>(self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        *request.metadata_mut() = self.0;
        request
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for GatewayMetadata
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(GatewayMetadata(headers_to_metadata(&parts.headers)))
    }
}

/// HTTP status for a gRPC code, matching the usual gateway mapping.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: i32,
    message: String,
}

/// A unary call's result rendered as an HTTP response: JSON body on success,
/// `{code, message}` with the mapped HTTP status on failure. Response metadata
/// becomes headers either way.
pub struct GatewayResponse<T>(pub Result<tonic::Response<T>, Status>);

impl<T: Serialize> IntoResponse for GatewayResponse<T> {
    fn into_response(self) -> Response {
        match self.0 {
            Ok(response) => {
                let headers = metadata_to_headers(response.metadata());
                let mut http = Json(response.into_inner()).into_response();
                http.headers_mut().extend(headers);
                http
            }
            Err(status) => {
                let headers = metadata_to_headers(status.metadata());
                let body = ErrorBody {
                    code: status.code() as i32,
                    message: status.message().to_string(),
                };
                let mut http = (http_status(status.code()), Json(body)).into_response();
                http.headers_mut().extend(headers);
                http
            }
        }
    }
}

/// Echoes both idempotency headers from each request onto its response.
pub fn propagate_idempotency_headers<S>(router: Router<S>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(PropagateHeaderLayer::new(HeaderName::from_static(KEY_METADATA)))
        .layer(PropagateHeaderLayer::new(HeaderName::from_static(X_KEY_METADATA)))
}
