//! Error types for the forwarder

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use trellis_cell::TunnelError;
use trellis_infra::{MtlsError, PkiError};

/// Result type for forwarder operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for forwarder operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Requested object does not exist (e.g. no user info for the session)
    #[error("not found: {0}")]
    NotFound(String),

    /// No connected tunnel for the cluster
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// Identity lookup failed
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Request carries no resolvable session
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Session has too little lifetime left to cache a pipeline
    #[error("session expired for cluster {cluster}")]
    SessionExpired {
        /// Cluster the pipeline was requested for
        cluster: String,
    },

    /// Dial, handshake or signing failure
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed input such as a CA bundle or forward descriptor
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error maps to at the boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) | Error::ClusterNotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::AccessDenied(_) | Error::SessionExpired { .. } => StatusCode::FORBIDDEN,
            Error::BadParameter(_) => StatusCode::BAD_REQUEST,
            Error::UpstreamUnavailable(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Kubernetes `Status.reason` for this error
    fn reason(&self) -> &'static str {
        match self {
            Error::NotFound(_) | Error::ClusterNotFound(_) => "NotFound",
            Error::Unauthorized(_) => "Unauthorized",
            Error::AccessDenied(_) | Error::SessionExpired { .. } => "Forbidden",
            Error::BadParameter(_) => "BadRequest",
            Error::UpstreamUnavailable(_) => "ServiceUnavailable",
            Error::Internal(_) => "InternalError",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // K8s-style Status so kubectl renders the message
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": self.reason(),
            "code": status.as_u16()
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<TunnelError> for Error {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::ClusterNotFound(cluster) => Error::ClusterNotFound(cluster),
            dial @ TunnelError::DialFailed { .. } => Error::UpstreamUnavailable(dial.to_string()),
        }
    }
}

impl From<MtlsError> for Error {
    fn from(e: MtlsError) -> Self {
        match e {
            MtlsError::CertificateParseError(_) | MtlsError::MissingCertificate => {
                Error::BadParameter(e.to_string())
            }
            MtlsError::KeyParseError(_) | MtlsError::TlsConfigError(_) => {
                Error::Internal(e.to_string())
            }
        }
    }
}

impl From<PkiError> for Error {
    fn from(e: PkiError) -> Self {
        Error::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use rstest::rstest;

    #[rstest]
    #[case(Error::NotFound("user".into()), StatusCode::NOT_FOUND)]
    #[case(Error::ClusterNotFound("c1".into()), StatusCode::NOT_FOUND)]
    #[case(Error::Unauthorized("lookup".into()), StatusCode::UNAUTHORIZED)]
    #[case(Error::AccessDenied("no session".into()), StatusCode::FORBIDDEN)]
    #[case(Error::SessionExpired { cluster: "c1".into() }, StatusCode::FORBIDDEN)]
    #[case(Error::UpstreamUnavailable("dial".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(Error::BadParameter("ca".into()), StatusCode::BAD_REQUEST)]
    #[case(Error::Internal("oops".into()), StatusCode::INTERNAL_SERVER_ERROR)]
    fn status_mapping(#[case] error: Error, #[case] expected: StatusCode) {
        assert_eq!(error.status_code(), expected);
    }

    #[tokio::test]
    async fn response_is_kubernetes_status() {
        let response = Error::ClusterNotFound("prod".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["kind"], "Status");
        assert_eq!(status["reason"], "NotFound");
        assert_eq!(status["code"], 404);
        assert_eq!(status["message"], "cluster not found: prod");
    }

    #[test]
    fn tunnel_errors_convert() {
        let not_found: Error = TunnelError::ClusterNotFound("c1".into()).into();
        assert!(matches!(not_found, Error::ClusterNotFound(c) if c == "c1"));

        let dial: Error = TunnelError::DialFailed {
            destination: "web.default:80".into(),
            message: "refused".into(),
        }
        .into();
        assert!(matches!(dial, Error::UpstreamUnavailable(m) if m.contains("web.default:80")));
    }

    #[test]
    fn malformed_ca_is_bad_parameter() {
        let err: Error = MtlsError::MissingCertificate.into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
