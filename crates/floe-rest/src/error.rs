//! The `ApiError` type returned from API handlers: an HTTP status code
//! wrapping an `anyhow::Error`, mapped to a JSON `{"detail": …}` body only
//! at the edge.

use axum::http::StatusCode;

pub trait ApiErrorExt {
    /// Sets the http response status to use when responding with this error.
    fn with_status(self, status: StatusCode) -> ApiError;
}

impl<E: Into<ApiError> + Sized> ApiErrorExt for E {
    fn with_status(self, status: StatusCode) -> ApiError {
        let mut err: ApiError = self.into();
        err.status = status;
        err
    }
}

#[derive(Debug, thiserror::Error)]
#[error("status: {status}, error: {error}")]
pub struct ApiError {
    pub status: StatusCode,
    #[source]
    pub error: anyhow::Error,
}

impl ApiError {
    pub fn new(status: StatusCode, error: anyhow::Error) -> ApiError {
        ApiError { status, error }
    }

    pub fn detail(status: StatusCode, detail: impl Into<String>) -> ApiError {
        ApiError {
            status,
            error: anyhow::anyhow!(detail.into()),
        }
    }

    pub fn unauthenticated() -> ApiError {
        Self::detail(StatusCode::UNAUTHORIZED, "Not authenticated")
    }

    fn status_for(err: &anyhow::Error) -> StatusCode {
        if let Some(api_error) = err.downcast_ref::<ApiError>() {
            return api_error.status;
        }
        if let Some(search) = err.downcast_ref::<databrowser::SearchError>() {
            return StatusCode::from_u16(search.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        let status = Self::status_for(&error);
        ApiError { status, error }
    }
}

impl From<databrowser::SearchError> for ApiError {
    fn from(error: databrowser::SearchError) -> Self {
        ApiError {
            status: StatusCode::from_u16(error.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            error: anyhow::Error::new(error),
        }
    }
}

impl From<portal_cache::CacheError> for ApiError {
    fn from(error: portal_cache::CacheError) -> Self {
        let status = match &error {
            portal_cache::CacheError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            error: anyhow::Error::new(error),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        tracing::error!(?error, "API responding with database error");
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            error: anyhow::anyhow!("document store error, please retry the request"),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let detail = format!("{:#}", self.error);
        if self.status.is_server_error() {
            tracing::warn!(status = %self.status, detail, "request failed");
        }
        (self.status, axum::Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}
