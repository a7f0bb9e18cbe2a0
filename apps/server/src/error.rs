use axum::{
	http::StatusCode,
	response::{IntoResponse, Response},
	Json,
};
use serde_json::json;
use tb_core::{infra::sync::Error, service::sync::FeedError};
use tracing::error;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
	#[error(transparent)]
	Store(#[from] Error),
	#[error(transparent)]
	Feed(#[from] FeedError),
}

impl ApiError {
	const fn status(&self) -> StatusCode {
		match self {
			Self::Store(Error::NotFound { .. }) => StatusCode::NOT_FOUND,
			Self::Store(
				Error::InvalidPayload { .. }
				| Error::InvalidArguments { .. }
				| Error::UnrecognizedOperation { .. },
			) => StatusCode::BAD_REQUEST,
			Self::Store(Error::CursorExpired { .. }) | Self::Feed(FeedError::Permanent(_)) => {
				StatusCode::GONE
			}
			Self::Feed(FeedError::Transient(_) | FeedError::Aborted) => {
				StatusCode::SERVICE_UNAVAILABLE
			}
			Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status();
		if status.is_server_error() {
			error!(?self, "Request failed");
		}

		(status, Json(json!({ "error": self.to_string() }))).into_response()
	}
}
