use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Client-facing error, rendered as an OpenAI `{"error": {...}}` envelope.
#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message).with_type("server_error")
    }

    /// Envelope body, also used for in-stream error frames.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.message,
                "type": self.error_type,
                "param": self.param,
                "code": self.code,
            }
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    param: Option<String>,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                param: self.param,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures of account selection and of the two-stage upstream protocol.
///
/// Malformed upstream frames are not represented here: they are skipped where
/// they are parsed and never abort a stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("no enabled accounts available")]
    NoAccountsAvailable,
    #[error("token exchange failed: {0}")]
    AuthFailed(String),
    #[error("upstream request failed with status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("account store error: {0}")]
    Store(String),
    #[error("upstream reply did not contain a media url")]
    NoMediaUrl,
}

impl GatewayError {
    /// Label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoAccountsAvailable => "no_accounts_available",
            Self::AuthFailed(_) => "auth_failed",
            Self::Upstream { .. } => "upstream_error",
            Self::Transport(_) => "upstream_transport",
            Self::Cancelled => "cancelled",
            Self::Store(_) => "store_error",
            Self::NoMediaUrl => "no_media_url",
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::NoAccountsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AuthFailed(_) | GatewayError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::Upstream { .. }
            | GatewayError::Transport(_)
            | GatewayError::NoMediaUrl => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        };
        AppError::new(status, err.kind(), err.to_string()).with_type("server_error")
    }
}
