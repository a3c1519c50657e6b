use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cbc_core::error::CbcError;

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    /// Construct a 400 Bad Request error with the given message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(CbcError::InvalidEvent(msg.into()).into())
    }
}

fn status_for(e: &CbcError) -> StatusCode {
    match e {
        CbcError::RunNotFound(_) => StatusCode::NOT_FOUND,
        CbcError::NotInitialized
        | CbcError::InvalidEvent(_)
        | CbcError::InvalidLocator(_) => StatusCode::BAD_REQUEST,
        CbcError::ComplianceMismatch { .. } => StatusCode::CONFLICT,
        CbcError::SubmissionRejected { .. }
        | CbcError::PublishFailed(_)
        | CbcError::ResultTokenUsed(_)
        | CbcError::Upstream(_)
        | CbcError::Signing(_)
        | CbcError::Http(_)
        | CbcError::ObjectDoesNotExist(_)
        | CbcError::InvalidReport(_) => StatusCode::BAD_GATEWAY,
        CbcError::InvalidConfig(_)
        | CbcError::InvalidDefinition(_)
        | CbcError::RunDb(_)
        | CbcError::Io(_)
        | CbcError::Yaml(_)
        | CbcError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<CbcError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.0), "request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(e: CbcError) -> StatusCode {
        AppError(e.into()).into_response().status()
    }

    #[test]
    fn run_not_found_maps_to_404() {
        assert_eq!(status(CbcError::RunNotFound("abc".into())), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_event_maps_to_400() {
        assert_eq!(status(CbcError::InvalidEvent("no token".into())), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::bad_request("x").into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn mismatch_maps_to_409() {
        let e = CbcError::ComplianceMismatch {
            expected: "compliant".into(),
            actual: "non_compliant".into(),
        };
        assert_eq!(status(e), StatusCode::CONFLICT);
    }

    #[test]
    fn upstream_failures_map_to_502() {
        assert_eq!(status(CbcError::Upstream("boom".into())), StatusCode::BAD_GATEWAY);
        let rejected = CbcError::SubmissionRejected {
            status: 403,
            body: "denied".into(),
        };
        assert_eq!(status(rejected), StatusCode::BAD_GATEWAY);
        assert_eq!(status(CbcError::ResultTokenUsed("tok-1".into())), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn bad_configuration_maps_to_500() {
        let e = CbcError::InvalidConfig("endpoint.invoke_url is not configured".into());
        assert_eq!(status(e), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unknown_errors_map_to_500() {
        let err = AppError(anyhow::anyhow!("something else"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
