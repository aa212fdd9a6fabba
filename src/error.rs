//! Unified error type.
//!
//! Every failure the framework can surface maps onto one [`Error`] variant, and
//! every variant maps onto exactly one HTTP status. Handlers return errors,
//! middleware renders them; nothing in between needs to know which is which.

use http::StatusCode;
use serde::Serialize;

/// Boxed error used at the body and service seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by keel's fallible operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid startup configuration.
    #[error("config: {0}")]
    Config(String),

    /// A route could not be registered (unconvertible handler, bad pattern).
    #[error("route registration: {0}")]
    RouteRegistration(String),

    /// Malformed request body or query.
    #[error("bind: {0}")]
    Bind(String),

    /// A bound value failed validation.
    #[error("validation: {0}")]
    Validation(String),

    /// The request carried no content type keel can decode.
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Missing or invalid credentials.
    #[error("unauthorized: {0}")]
    Auth(String),

    /// A policy decision denied the request.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    /// The request body exceeded the configured limit.
    #[error("request body too large: limit {0} bytes")]
    BodyTooLarge(usize),

    /// Too many requests for a rate-limit key.
    #[error("rate limit exceeded")]
    RateLimited,

    /// An error returned from a user handler.
    #[error("{0}")]
    Handler(String),

    /// A panic recovered at the middleware boundary.
    #[error("panic: {0}")]
    Panic(String),

    /// A deadline elapsed before the handler finished.
    #[error("deadline exceeded")]
    Timeout,

    /// Invalid or unparseable policy document.
    #[error("policy: {0}")]
    Policy(String),

    /// Response encoding failed.
    #[error("encode: {0}")]
    Encode(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("hyper: {0}")]
    Hyper(#[from] hyper::Error),
}

impl Error {
    /// The HTTP status a response carrying this error should use.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Bind(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_)
            | Self::RouteRegistration(_)
            | Self::Handler(_)
            | Self::Panic(_)
            | Self::Policy(_)
            | Self::Encode(_)
            | Self::Io(_)
            | Self::Hyper(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code rendered into [`ErrorBody::code`].
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::RouteRegistration(_) => "route_registration",
            Self::Bind(_) => "bind",
            Self::Validation(_) => "validation",
            Self::UnsupportedMediaType(_) => "unsupported_media_type",
            Self::Auth(_) => "auth",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::BodyTooLarge(_) => "body_too_large",
            Self::RateLimited => "rate_limited",
            Self::Handler(_) => "handler",
            Self::Panic(_) => "panic",
            Self::Timeout => "timeout",
            Self::Policy(_) => "policy",
            Self::Encode(_) => "encode",
            Self::Io(_) => "io",
            Self::Hyper(_) => "hyper",
        }
    }

    /// Wraps any displayable value as a handler error.
    pub fn handler(msg: impl std::fmt::Display) -> Self {
        Self::Handler(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Self::Encode(e.to_string())
        } else {
            Self::Bind(e.to_string())
        }
    }
}

impl From<serde_urlencoded::de::Error> for Error {
    fn from(e: serde_urlencoded::de::Error) -> Self {
        Self::Bind(e.to_string())
    }
}

impl From<multer::Error> for Error {
    fn from(e: multer::Error) -> Self {
        Self::Bind(e.to_string())
    }
}

impl From<BoxError> for Error {
    fn from(e: BoxError) -> Self {
        match e.downcast::<Error>() {
            Ok(inner) => *inner,
            Err(e) => match e.downcast::<http_body_util::LengthLimitError>() {
                Ok(_) => Self::BodyTooLarge(0),
                Err(e) => Self::Io(std::io::Error::other(e)),
            },
        }
    }
}

/// The user-visible error structure rendered for failed requests.
///
/// ```json
/// {"status":403,"code":"forbidden","message":"...","request_id":"..."}
/// ```
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq)]
pub struct ErrorBody {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorBody {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status: status.as_u16(), code: None, message: message.into(), request_id: None }
    }

    pub fn from_error(err: &Error, request_id: Option<String>) -> Self {
        Self {
            status: err.status().as_u16(),
            code: Some(err.code().to_owned()),
            message: err.to_string(),
            request_id,
        }
    }
}
