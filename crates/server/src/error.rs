use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use meisai_core::MeisaiError;
use serde_json::json;

/// A core error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub MeisaiError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<MeisaiError> for ApiError {
    fn from(e: MeisaiError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            MeisaiError::Validation(_) | MeisaiError::RowParse(_) => StatusCode::BAD_REQUEST,
            MeisaiError::MappingConflict { .. } | MeisaiError::InvalidTransition { .. } => StatusCode::CONFLICT,
            MeisaiError::Stream(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, status = status.as_u16(), "request rejected");
        }
        let body = json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meisai_core::{MappingId, RecordId, SessionId, StreamError};

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (MeisaiError::SessionNotFound(SessionId::new()), StatusCode::NOT_FOUND),
            (MeisaiError::RecordNotFound(RecordId(1)), StatusCode::NOT_FOUND),
            (MeisaiError::validation("bad"), StatusCode::BAD_REQUEST),
            (
                MeisaiError::MappingConflict {
                    statement_record_id: RecordId(1),
                    entity_type: "freee_deal".into(),
                    active_mapping_id: MappingId(2),
                },
                StatusCode::CONFLICT,
            ),
            (MeisaiError::Stream(StreamError::Aborted), StatusCode::UNPROCESSABLE_ENTITY),
            (MeisaiError::storage("disk full"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }
}
