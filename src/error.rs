//! Crate-wide error taxonomy for the signing core.
//!
//! Every fallible operation in the crate returns [`CaError`]. Call sites that
//! need to react to a specific failure mode match on [`CaError::kind`] rather
//! than the enum directly, since the kind is what's contractually stable
//! (§7 of the design doc) even as the underlying variants grow.

use std::fmt;

/// Stable, RPC/HTTP-mappable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadCsr,
    Malformed,
    NotFound,
    Duplicate,
    Unauthorized,
    PolicyViolation,
    InternalServerError,
    HsmError,
    ResponseExpired,
    LoadShed,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadCsr => "bad_csr",
            Self::Malformed => "malformed",
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::Unauthorized => "unauthorized",
            Self::PolicyViolation => "policy_violation",
            Self::InternalServerError => "internal_server_error",
            Self::HsmError => "hsm_error",
            Self::ResponseExpired => "response_expired",
            Self::LoadShed => "load_shed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("bad CSR: {0}")]
    BadCsr(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("HSM signing error: {0}")]
    Hsm(String),

    #[error("OCSP response expired")]
    ResponseExpired,

    #[error("load shed: too many in-flight requests")]
    LoadShed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("X.509 parse error: {0}")]
    X509Parse(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl CaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadCsr(_) => ErrorKind::BadCsr,
            Self::Malformed(_) | Self::X509Parse(_) | Self::Encoding(_) => ErrorKind::Malformed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Duplicate(_) => ErrorKind::Duplicate,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::Internal(_) | Self::Io(_) => ErrorKind::InternalServerError,
            Self::Hsm(_) => ErrorKind::HsmError,
            Self::ResponseExpired => ErrorKind::ResponseExpired,
            Self::LoadShed => ErrorKind::LoadShed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Redis(_) => ErrorKind::InternalServerError,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }
}

pub type CaResult<T> = Result<T, CaError>;

impl From<x509_parser::error::X509Error> for CaError {
    fn from(e: x509_parser::error::X509Error) -> Self {
        Self::X509Parse(e.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for CaError {
    fn from(e: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        Self::X509Parse(e.to_string())
    }
}

impl From<&CaError> for tonic::Status {
    fn from(err: &CaError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::BadCsr | ErrorKind::Malformed => tonic::Status::invalid_argument(message),
            ErrorKind::NotFound => tonic::Status::not_found(message),
            ErrorKind::Duplicate => tonic::Status::already_exists(message),
            ErrorKind::Unauthorized => tonic::Status::unauthenticated(message),
            ErrorKind::PolicyViolation => tonic::Status::failed_precondition(message),
            ErrorKind::ResponseExpired => tonic::Status::failed_precondition(message),
            ErrorKind::LoadShed => tonic::Status::resource_exhausted(message),
            ErrorKind::Cancelled => tonic::Status::cancelled(message),
            ErrorKind::InternalServerError | ErrorKind::HsmError => {
                tonic::Status::internal(message)
            }
        }
    }
}

impl From<CaError> for tonic::Status {
    fn from(err: CaError) -> Self {
        (&err).into()
    }
}

impl From<&CaError> for axum::http::StatusCode {
    fn from(err: &CaError) -> Self {
        use axum::http::StatusCode;
        match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::BadCsr | ErrorKind::Malformed => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::ResponseExpired => StatusCode::from_u16(533).unwrap(),
            ErrorKind::LoadShed => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
            ErrorKind::Duplicate => StatusCode::CONFLICT,
            ErrorKind::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InternalServerError | ErrorKind::HsmError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
